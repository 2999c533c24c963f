//
// test_utils/mod.rs
//
// Shared fixtures for unit tests, integration tests and benchmarks
//

pub mod fixture_workspace;

use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::host::{MemoryFileSystem, RecordingWatcher};
use crate::service::{Collaborators, ManualClock, ProjectService, RuntimeClock};

/// A service over in-memory storage, a recording watcher and a manual clock
pub fn memory_service(config: ServiceConfig) -> (ProjectService, Arc<MemoryFileSystem>, ManualClock) {
    let fs = Arc::new(MemoryFileSystem::new());
    let clock = ManualClock::new();
    let parts = Collaborators::line_language(
        fs.clone(),
        Arc::new(RecordingWatcher::new()),
        Arc::new(clock.clone()),
    );
    (ProjectService::new(config, parts), fs, clock)
}

/// A service on the tokio clock, for tests running with paused time
pub fn runtime_service(config: ServiceConfig) -> (ProjectService, Arc<MemoryFileSystem>) {
    let fs = Arc::new(MemoryFileSystem::new());
    let parts = Collaborators::line_language(
        fs.clone(),
        Arc::new(RecordingWatcher::new()),
        Arc::new(RuntimeClock),
    );
    (ProjectService::new(config, parts), fs)
}
