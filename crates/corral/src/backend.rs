//
// backend.rs
//
// Language server front end over a session
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tower_lsp::jsonrpc::{Error, ErrorCode, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::Client;
use tower_lsp::LanguageServer;
use tower_lsp::LspService;
use tower_lsp::Server;

use crate::config::{CompilerOptions, ServiceConfig};
use crate::error::ServiceError;
use crate::host::{NotifyWatcher, OsFileSystem};
use crate::service::{Collaborators, ProjectService, RuntimeClock, ServiceEvent};
use crate::session::{Session, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Published {
    Version(i32),
    Closed,
}

/// Never publish diagnostics computed for an older document version than
/// the last ones published, or for a document closed since. Same-version
/// republishes are allowed since a dependency edit changes results without
/// touching the document.
#[derive(Debug, Default)]
pub struct DiagnosticsGate {
    last_published: RwLock<HashMap<PathBuf, Published>>,
}

impl DiagnosticsGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_publish(&self, path: &Path, version: i32) -> bool {
        match self.last_published.read() {
            Ok(last) => match last.get(path) {
                Some(Published::Closed) => false,
                Some(Published::Version(last)) => version >= *last,
                None => true,
            },
            Err(_) => true,
        }
    }

    pub fn is_closed(&self, path: &Path) -> bool {
        self.last_published
            .read()
            .map(|last| last.get(path) == Some(&Published::Closed))
            .unwrap_or(false)
    }

    pub fn record_publish(&self, path: &Path, version: i32) {
        if let Ok(mut last) = self.last_published.write() {
            last.insert(path.to_path_buf(), Published::Version(version));
        }
    }

    /// Start tracking a document afresh
    pub fn open(&self, path: &Path) {
        if let Ok(mut last) = self.last_published.write() {
            last.remove(path);
        }
    }

    /// Results still in flight for a closed document are dropped
    pub fn close(&self, path: &Path) {
        if let Ok(mut last) = self.last_published.write() {
            last.insert(path.to_path_buf(), Published::Closed);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenExternalProjectParams {
    name: String,
    root_files: Vec<Url>,
    #[serde(default)]
    options: CompilerOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenExternalProjectResult {
    project: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseExternalProjectParams {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeepAliveParams {
    config_uri: Url,
    keep_alive: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileDiagnostics {
    uri: Url,
    diagnostics: Vec<Diagnostic>,
}

fn to_path(uri: &Url) -> Option<PathBuf> {
    match uri.to_file_path() {
        Ok(path) => Some(path),
        Err(()) => {
            log::trace!("Ignoring non-file URI {}", uri);
            None
        }
    }
}

fn rpc_error(error: ServiceError) -> Error {
    let code = match error {
        ServiceError::Cancelled(_) => ErrorCode::RequestCancelled,
        ServiceError::NotOpen(_)
        | ServiceError::StaleVersion { .. }
        | ServiceError::InvalidRange(_)
        | ServiceError::NoProject(_)
        | ServiceError::UnknownExternalProject(_) => ErrorCode::InvalidParams,
    };
    Error {
        code,
        message: error.to_string().into(),
        data: None,
    }
}

fn invalid_uri(uri: &Url) -> Error {
    Error::invalid_params(format!("not a file URI: {}", uri))
}

pub struct Backend {
    client: Client,
    session: SessionHandle,
    gate: Arc<DiagnosticsGate>,
    config: RwLock<ServiceConfig>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        let config = ServiceConfig::default();
        let (watcher, mut changes) = NotifyWatcher::new();
        let parts = Collaborators::line_language(
            Arc::new(OsFileSystem),
            Arc::new(watcher),
            Arc::new(RuntimeClock),
        );
        let (session, events) = Session::spawn(ProjectService::new(config.clone(), parts));

        let forward = session.clone();
        tokio::spawn(async move {
            while let Some(path) = changes.recv().await {
                forward.file_changed(path);
            }
        });

        let gate = Arc::new(DiagnosticsGate::new());
        tokio::spawn(publish_events(
            client.clone(),
            session.clone(),
            gate.clone(),
            events,
        ));

        Self {
            client,
            session,
            gate,
            config: RwLock::new(config),
        }
    }

    fn apply_settings(&self, settings: &serde_json::Value) {
        match ServiceConfig::from_json(settings) {
            Some(config) => {
                if let Ok(mut current) = self.config.write() {
                    *current = config.clone();
                }
                self.session.update_config(config);
            }
            None => log::trace!("No corral settings in configuration"),
        }
    }

    fn watch_patterns(&self) -> Vec<String> {
        let Ok(config) = self.config.read() else {
            return Vec::new();
        };
        config
            .config_file_names
            .iter()
            .map(|name| format!("**/{}", name))
            .chain(
                config
                    .source_extensions
                    .iter()
                    .map(|ext| format!("**/*.{}", ext)),
            )
            .collect()
    }

    async fn handle_open_external_project(
        &self,
        params: OpenExternalProjectParams,
    ) -> Result<OpenExternalProjectResult> {
        let roots = params.root_files.iter().filter_map(to_path).collect();
        let id = self
            .session
            .open_external_project(params.name, roots, params.options)
            .await
            .map_err(rpc_error)?;
        self.session.check_open_files(None);
        Ok(OpenExternalProjectResult { project: id.0 })
    }

    async fn handle_close_external_project(&self, params: CloseExternalProjectParams) -> Result<()> {
        self.session
            .close_external_project(params.name)
            .await
            .map_err(rpc_error)?;
        self.session.check_open_files(None);
        Ok(())
    }

    async fn handle_keep_alive(&self, params: KeepAliveParams) -> Result<()> {
        let path = to_path(&params.config_uri).ok_or_else(|| invalid_uri(&params.config_uri))?;
        self.session
            .set_keep_alive(path, params.keep_alive)
            .await
            .map_err(rpc_error)
    }

    async fn handle_project_diagnostics(
        &self,
        params: TextDocumentIdentifier,
    ) -> Result<Vec<FileDiagnostics>> {
        let path = to_path(&params.uri).ok_or_else(|| invalid_uri(&params.uri))?;
        let by_file = self
            .session
            .project_diagnostics(path)
            .await
            .map_err(rpc_error)?;
        Ok(by_file
            .into_iter()
            .filter_map(|(path, diagnostics)| {
                Url::from_file_path(&path)
                    .ok()
                    .map(|uri| FileDiagnostics { uri, diagnostics })
            })
            .collect())
    }
}

/// Forward session events to the client
async fn publish_events(
    client: Client,
    session: SessionHandle,
    gate: Arc<DiagnosticsGate>,
    mut events: UnboundedReceiver<ServiceEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServiceEvent::DiagnosticsReady {
                path,
                editor_version,
                diagnostics,
            } => {
                let Ok(uri) = Url::from_file_path(&path) else {
                    continue;
                };
                if gate.is_closed(&path) {
                    log::trace!("Skipping diagnostics for closed {}", uri);
                    continue;
                }
                if let Some(version) = editor_version {
                    if !gate.can_publish(&path, version) {
                        log::trace!("Skipping stale diagnostics for {} (v{})", uri, version);
                        continue;
                    }
                    gate.record_publish(&path, version);
                }
                client
                    .publish_diagnostics(uri, diagnostics, editor_version)
                    .await;
            }
            ServiceEvent::BackgroundProjectsUpdated { open_files } => {
                log::trace!("Rechecking {} open files after background update", open_files.len());
                session.get_errors(open_files, None);
            }
            ServiceEvent::ConfigDiagnostics {
                config_path,
                diagnostics,
                ..
            } => {
                for message in &diagnostics {
                    client
                        .show_message(
                            MessageType::WARNING,
                            format!("{}: {}", config_path.display(), message),
                        )
                        .await;
                }
            }
            ServiceEvent::ProjectLoadingStarted { project, reason } => {
                log::info!("Loading project {}: {}", project, reason);
            }
            ServiceEvent::ProjectLoadingFinished { project } => {
                log::info!("Project {} loaded", project);
            }
            ServiceEvent::ProjectClosed { project, name } => {
                log::info!("Project {} ({}) closed", project, name);
            }
        }
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing corral");

        if let Some(options) = params.initialization_options.as_ref() {
            self.apply_settings(options);
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::INCREMENTAL,
                )),
                completion_provider: Some(CompletionOptions::default()),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from("corral"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        log::info!("corral initialized");

        // New configuration files are only noticed through client watchers
        let watchers = self
            .watch_patterns()
            .into_iter()
            .map(|pattern| FileSystemWatcher {
                glob_pattern: GlobPattern::String(pattern),
                kind: None,
            })
            .collect();
        let options = DidChangeWatchedFilesRegistrationOptions { watchers };
        let register_options = match serde_json::to_value(options) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Cannot encode watcher registration: {}", e);
                return;
            }
        };
        let registration = Registration {
            id: String::from("corral-watched-files"),
            method: String::from("workspace/didChangeWatchedFiles"),
            register_options: Some(register_options),
        };
        if let Err(e) = self.client.register_capability(vec![registration]).await {
            log::warn!("Client refused file watcher registration: {}", e);
        }
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("corral shutting down");
        self.session.shutdown();
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Some(path) = to_path(&params.text_document.uri) else {
            return;
        };
        self.gate.open(&path);
        self.session.open(
            path.clone(),
            params.text_document.text,
            params.text_document.version,
            None,
        );
        self.session.check_open_files(Some(path));
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(path) = to_path(&params.text_document.uri) else {
            return;
        };
        self.session.change(
            path.clone(),
            params.text_document.version,
            params.content_changes,
        );
        self.session.check_open_files(Some(path));
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = to_path(&uri) else {
            return;
        };
        self.gate.close(&path);
        self.session.close(path.clone());
        self.client.publish_diagnostics(uri, Vec::new(), None).await;
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        log::trace!(
            "Received watched files change: {} changes",
            params.changes.len()
        );
        for change in params.changes {
            if let Some(path) = to_path(&change.uri) {
                self.session.file_changed(path);
            }
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        log::trace!("Configuration changed");
        self.apply_settings(&params.settings);
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let position = params.text_document_position;
        let Some(path) = to_path(&position.text_document.uri) else {
            return Ok(None);
        };
        let names = self
            .session
            .completions_at(path, position.position)
            .await
            .map_err(rpc_error)?;
        let items = names
            .into_iter()
            .map(|name| CompletionItem {
                label: name,
                kind: Some(CompletionItemKind::VARIABLE),
                ..Default::default()
            })
            .collect();
        Ok(Some(CompletionResponse::Array(items)))
    }
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(Backend::new)
        .custom_method(
            "corral/openExternalProject",
            Backend::handle_open_external_project,
        )
        .custom_method(
            "corral/closeExternalProject",
            Backend::handle_close_external_project,
        )
        .custom_method("corral/keepAlive", Backend::handle_keep_alive)
        .custom_method(
            "corral/projectDiagnostics",
            Backend::handle_project_diagnostics,
        )
        .finish();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}
