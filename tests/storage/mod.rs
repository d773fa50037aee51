//! Shared backend integration tests.
//!
//! Tests the Backend contract against every supported database. Each database
//! binary builds a backend and runs these test functions through the macro.

pub mod backend_tests;
