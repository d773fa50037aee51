//! Unistore - versioned, watchable resource storage
//!
//! Stores keyed resources in a relational database, assigns every committed
//! write a per-bucket monotonically increasing resource version, keeps the full
//! write history for point-in-time lists, and streams committed writes to
//! watchers.

pub mod config;
pub mod notifier;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod test_utils;
