//! Change notification.
//!
//! Turns committed writes into per-watcher event streams. Two strategies share
//! one contract and the backend picks one at construction:
//!
//! - [`ChannelNotifier`]: in-process fan-out of events pushed by the write path.
//!   Best-effort: a watcher that falls behind loses its stream.
//! - [`PollingNotifier`]: observes the history table on an interval, so writes
//!   from every process sharing the database are seen.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::storage::{Result, WrittenEvent};

mod channel;
mod poller;

pub use channel::ChannelNotifier;
pub use poller::{ChangeSource, PollingNotifier, SqlChangeSource};

/// Source of committed-write events for watchers.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a committed write. No-op for notifiers that observe the database.
    fn send(&self, event: WrittenEvent);

    /// Open a stream of events for one watcher.
    ///
    /// The stream ends when `cancel` fires, when the backend shuts down, or,
    /// for lossy notifiers, after an event had to be dropped. A consumer whose
    /// stream ends without cancelling must re-list before watching again.
    async fn notify(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<WrittenEvent>>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
