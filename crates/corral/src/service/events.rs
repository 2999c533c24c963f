//
// service/events.rs
//
// Asynchronous notifications produced by the service and the session
//

use std::path::PathBuf;

use tower_lsp::lsp_types::Diagnostic;

use crate::project::ProjectId;

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    ProjectLoadingStarted {
        project: ProjectId,
        reason: String,
    },
    ProjectLoadingFinished {
        project: ProjectId,
    },
    /// Problems found in a project's configuration; empty once resolved
    ConfigDiagnostics {
        project: ProjectId,
        config_path: PathBuf,
        diagnostics: Vec<String>,
    },
    /// Syntactic and semantic diagnostics of one file
    DiagnosticsReady {
        path: PathBuf,
        editor_version: Option<i32>,
        diagnostics: Vec<Diagnostic>,
    },
    /// Background graph updates changed projects serving these open files
    BackgroundProjectsUpdated {
        open_files: Vec<PathBuf>,
    },
    ProjectClosed {
        project: ProjectId,
        name: String,
    },
}
