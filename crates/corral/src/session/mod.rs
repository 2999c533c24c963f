//
// session/mod.rs
//
// Single worker task owning the project service
//

pub mod errors_check;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Diagnostic, Position, TextDocumentContentChangeEvent};

use crate::config::{CompilerOptions, ServiceConfig};
use crate::error::{Cancelled, ServiceError};
use crate::project::ProjectId;
use crate::service::{ProjectService, ServiceEvent};

pub use errors_check::ErrorsCheck;

type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Work sent to the session. Requests are handled strictly in order.
#[derive(Debug)]
pub enum Request {
    Open {
        path: PathBuf,
        text: String,
        version: i32,
        project_root: Option<PathBuf>,
    },
    Change {
        path: PathBuf,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    },
    Close {
        path: PathBuf,
    },
    /// Raw storage notification; debounced by the service
    FileChanged {
        path: PathBuf,
    },
    UpdateConfig(ServiceConfig),
    OpenExternalProject {
        name: String,
        roots: Vec<PathBuf>,
        options: CompilerOptions,
        reply: Reply<ProjectId>,
    },
    CloseExternalProject {
        name: String,
        reply: Reply<()>,
    },
    SetKeepAlive {
        config_path: PathBuf,
        keep_alive: bool,
        reply: Reply<()>,
    },
    /// Start an errors check over `files`, replacing any running one
    GetErrors {
        files: Vec<PathBuf>,
        delay: Option<Duration>,
    },
    /// Errors check over every open file, `first` leading
    CheckOpenFiles {
        first: Option<PathBuf>,
    },
    Diagnostics {
        path: PathBuf,
        reply: Reply<Vec<Diagnostic>>,
    },
    ProjectDiagnostics {
        path: PathBuf,
        reply: Reply<BTreeMap<PathBuf, Vec<Diagnostic>>>,
    },
    Completions {
        path: PathBuf,
        prefix: String,
        reply: Reply<Vec<String>>,
    },
    /// Completions for the identifier being typed at `position`
    CompletionsAt {
        path: PathBuf,
        position: Position,
        reply: Reply<Vec<String>>,
    },
    Shutdown,
}

/// Cloneable sender side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: UnboundedSender<Request>,
    /// Token of the running errors check, cancelled on edits
    batch_token: Arc<Mutex<CancellationToken>>,
}

impl SessionHandle {
    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            log::warn!("Session has shut down; request dropped");
        }
    }

    fn cancel_batch(&self) {
        if let Ok(token) = self.batch_token.lock() {
            token.cancel();
        }
    }

    async fn ask<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx));
        rx.await.unwrap_or(Err(ServiceError::Cancelled(Cancelled)))
    }

    pub fn open(&self, path: PathBuf, text: String, version: i32, project_root: Option<PathBuf>) {
        self.send(Request::Open {
            path,
            text,
            version,
            project_root,
        });
    }

    /// Edits abandon the errors-check step in flight before they are queued
    pub fn change(&self, path: PathBuf, version: i32, changes: Vec<TextDocumentContentChangeEvent>) {
        self.cancel_batch();
        self.send(Request::Change {
            path,
            version,
            changes,
        });
    }

    pub fn close(&self, path: PathBuf) {
        self.send(Request::Close { path });
    }

    pub fn file_changed(&self, path: PathBuf) {
        self.send(Request::FileChanged { path });
    }

    pub fn update_config(&self, config: ServiceConfig) {
        self.send(Request::UpdateConfig(config));
    }

    pub fn get_errors(&self, files: Vec<PathBuf>, delay: Option<Duration>) {
        self.cancel_batch();
        self.send(Request::GetErrors { files, delay });
    }

    pub fn check_open_files(&self, first: Option<PathBuf>) {
        self.cancel_batch();
        self.send(Request::CheckOpenFiles { first });
    }

    pub async fn open_external_project(
        &self,
        name: String,
        roots: Vec<PathBuf>,
        options: CompilerOptions,
    ) -> Result<ProjectId, ServiceError> {
        self.ask(|reply| Request::OpenExternalProject {
            name,
            roots,
            options,
            reply,
        })
        .await
    }

    pub async fn close_external_project(&self, name: String) -> Result<(), ServiceError> {
        self.ask(|reply| Request::CloseExternalProject { name, reply })
            .await
    }

    pub async fn set_keep_alive(&self, config_path: PathBuf, keep_alive: bool) -> Result<(), ServiceError> {
        self.ask(|reply| Request::SetKeepAlive {
            config_path,
            keep_alive,
            reply,
        })
        .await
    }

    pub async fn diagnostics(&self, path: PathBuf) -> Result<Vec<Diagnostic>, ServiceError> {
        self.ask(|reply| Request::Diagnostics { path, reply }).await
    }

    pub async fn project_diagnostics(
        &self,
        path: PathBuf,
    ) -> Result<BTreeMap<PathBuf, Vec<Diagnostic>>, ServiceError> {
        self.ask(|reply| Request::ProjectDiagnostics { path, reply })
            .await
    }

    pub async fn completions(&self, path: PathBuf, prefix: String) -> Result<Vec<String>, ServiceError> {
        self.ask(|reply| Request::Completions {
            path,
            prefix,
            reply,
        })
        .await
    }

    pub async fn completions_at(&self, path: PathBuf, position: Position) -> Result<Vec<String>, ServiceError> {
        self.ask(|reply| Request::CompletionsAt {
            path,
            position,
            reply,
        })
        .await
    }

    pub fn shutdown(&self) {
        self.cancel_batch();
        self.send(Request::Shutdown);
    }
}

/// The worker: one logical thread of control over the service. Debounced
/// service work and errors-check steps run between requests.
pub struct Session {
    service: ProjectService,
    requests: UnboundedReceiver<Request>,
    events: UnboundedSender<ServiceEvent>,
    errors_check: Option<ErrorsCheck>,
    batch_token: Arc<Mutex<CancellationToken>>,
}

impl Session {
    pub fn new(service: ProjectService) -> (Self, SessionHandle, UnboundedReceiver<ServiceEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let batch_token = Arc::new(Mutex::new(CancellationToken::new()));
        let session = Self {
            service,
            requests: request_rx,
            events: event_tx,
            errors_check: None,
            batch_token: batch_token.clone(),
        };
        let handle = SessionHandle {
            requests: request_tx,
            batch_token,
        };
        (session, handle, event_rx)
    }

    /// Spawn the worker on the current runtime
    pub fn spawn(service: ProjectService) -> (SessionHandle, UnboundedReceiver<ServiceEvent>) {
        let (session, handle, events) = Session::new(service);
        tokio::spawn(session.run());
        (handle, events)
    }

    pub async fn run(mut self) {
        log::info!("Session started");
        loop {
            let request = match self.next_deadline() {
                Some(at) => tokio::select! {
                    biased;
                    request = self.requests.recv() => Some(request),
                    _ = tokio::time::sleep_until(at) => None,
                },
                None => Some(self.requests.recv().await),
            };
            match request {
                Some(None) | Some(Some(Request::Shutdown)) => break,
                Some(Some(request)) => self.handle(request),
                None => self.tick(),
            }
            self.flush_events();
        }
        if let Some(check) = &self.errors_check {
            check.token().cancel();
        }
        log::info!("Session stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let check = self.errors_check.as_ref().and_then(ErrorsCheck::deadline);
        match (self.service.next_deadline(), check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn flush_events(&mut self) {
        for event in self.service.take_events() {
            self.emit(event);
        }
    }

    fn emit(&self, event: ServiceEvent) {
        if self.events.send(event).is_err() {
            log::trace!("No listener for session events");
        }
    }

    fn start_check(&mut self, check: ErrorsCheck) {
        if let Ok(mut token) = self.batch_token.lock() {
            *token = check.token().clone();
        }
        self.errors_check = Some(check);
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if self.service.next_deadline().is_some_and(|d| d <= now) {
            self.service.run_pending();
        }
        let Some(check) = self.errors_check.as_mut() else {
            return;
        };
        let result = check.step(&mut self.service, now);
        if check.is_done() {
            self.errors_check = None;
        }
        match result {
            Ok(Some(event)) => self.emit(event),
            Ok(None) => {}
            Err(Cancelled) => log::trace!("Errors check step abandoned"),
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Open {
                path,
                text,
                version,
                project_root,
            } => {
                self.service.open_file(&path, &text, version, project_root);
            }
            Request::Change {
                path,
                version,
                changes,
            } => {
                if let Err(e) = self.service.edit_file(&path, version, changes) {
                    log::warn!("Rejected edit: {}", e);
                }
                if let Some(check) = self.errors_check.take() {
                    if !check.is_done() {
                        log::trace!("Errors check restarted by edit of {}", path.display());
                        self.start_check(check.restarted(&path, Instant::now()));
                    }
                }
            }
            Request::Close { path } => {
                if let Err(e) = self.service.close_file(&path) {
                    log::warn!("Close failed: {}", e);
                }
            }
            Request::FileChanged { path } => self.service.on_file_event(&path),
            Request::UpdateConfig(config) => self.service.update_config(config),
            Request::OpenExternalProject {
                name,
                roots,
                options,
                reply,
            } => {
                let id = self.service.open_external_project(&name, roots, options);
                let _ = reply.send(Ok(id));
            }
            Request::CloseExternalProject { name, reply } => {
                let _ = reply.send(self.service.close_external_project(&name));
            }
            Request::SetKeepAlive {
                config_path,
                keep_alive,
                reply,
            } => {
                let _ = reply.send(self.service.set_keep_alive(&config_path, keep_alive));
            }
            Request::GetErrors { files, delay } => {
                let delay = delay.unwrap_or(self.service.config().diagnostics_delay);
                self.replace_check(files, delay);
            }
            Request::CheckOpenFiles { first } => {
                let mut files: Vec<PathBuf> = first.iter().cloned().collect();
                files.extend(
                    self.service
                        .open_files()
                        .into_iter()
                        .filter(|f| Some(f) != first.as_ref()),
                );
                let delay = self.service.config().diagnostics_delay;
                self.replace_check(files, delay);
            }
            Request::Diagnostics { path, reply } => {
                let result = self.service.get_diagnostics(&path, &CancellationToken::new());
                let _ = reply.send(result);
            }
            Request::ProjectDiagnostics { path, reply } => {
                let result = self
                    .service
                    .project_diagnostics(&path, &CancellationToken::new());
                let _ = reply.send(result);
            }
            Request::Completions {
                path,
                prefix,
                reply,
            } => {
                let result = self
                    .service
                    .completions(&path, &prefix, &CancellationToken::new());
                let _ = reply.send(result);
            }
            Request::CompletionsAt {
                path,
                position,
                reply,
            } => {
                let prefix = self
                    .service
                    .records()
                    .get(&path)
                    .and_then(|r| r.latest())
                    .map(|s| identifier_before(s.text(), position))
                    .unwrap_or_default();
                let result = self
                    .service
                    .completions(&path, &prefix, &CancellationToken::new());
                let _ = reply.send(result);
            }
            // Handled by the loop
            Request::Shutdown => {}
        }
    }

    fn replace_check(&mut self, files: Vec<PathBuf>, delay: Duration) {
        if let Some(old) = self.errors_check.take() {
            old.token().cancel();
        }
        if files.is_empty() {
            return;
        }
        self.start_check(ErrorsCheck::new(files, delay, Instant::now()));
    }
}

/// The identifier characters immediately left of `position` (UTF-16 columns)
fn identifier_before(text: &str, position: Position) -> String {
    let Some(line) = text.lines().nth(position.line as usize) else {
        return String::new();
    };
    let mut units = 0u32;
    let mut end = line.len();
    for (offset, ch) in line.char_indices() {
        if units >= position.character {
            end = offset;
            break;
        }
        units += ch.len_utf16() as u32;
    }
    let head = &line[..end];
    let start = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map_or(end, |(i, _)| i);
    head[start..].to_string()
}
