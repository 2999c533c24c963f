// lib.rs - Library root, shared by the binary, benchmarks and integration tests.

pub mod backend;
pub mod builder;
pub mod config;
pub mod error;
pub mod file_record;
pub mod host;
pub mod lang;
pub mod paths;
pub mod project;
pub mod service;
pub mod session;
pub mod snapshot;
// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
pub mod tree_cache;
