//
// session/errors_check.rs
//
// Staggered per-file diagnostics batches
//

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Diagnostic;

use crate::error::Cancelled;
use crate::service::{ProjectService, ServiceEvent};

/// One errors-check request: a list of files checked one at a time.
///
/// Each file waits `delay`, gets its syntactic diagnostics, then its
/// semantic diagnostics right after, and produces one
/// [`ServiceEvent::DiagnosticsReady`]. The batch token is shared with the
/// session handle so an incoming edit can abandon the step in flight.
#[derive(Debug)]
pub struct ErrorsCheck {
    members: HashSet<PathBuf>,
    pending: VecDeque<PathBuf>,
    /// Syntactic results of the front file while its semantic step waits
    syntactic: Option<Vec<Diagnostic>>,
    delay: Duration,
    next_at: Instant,
    token: CancellationToken,
}

impl ErrorsCheck {
    pub fn new(files: Vec<PathBuf>, delay: Duration, now: Instant) -> Self {
        let mut seen = HashSet::new();
        let pending: VecDeque<PathBuf> = files
            .into_iter()
            .filter(|f| seen.insert(f.clone()))
            .collect();
        Self {
            members: seen,
            pending,
            syntactic: None,
            delay,
            next_at: now + delay,
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.members.contains(path)
    }

    pub fn remaining(&self) -> impl Iterator<Item = &PathBuf> {
        self.pending.iter()
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the next step may run; `None` once finished or abandoned
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_done() || self.token.is_cancelled() {
            None
        } else {
            Some(self.next_at)
        }
    }

    /// Abandon this batch and start over after an edit to `edited`.
    ///
    /// Files already reported stay reported. The edited file goes first if
    /// it belongs to the batch, followed by the files not yet reported.
    pub fn restarted(&self, edited: &Path, now: Instant) -> ErrorsCheck {
        self.token.cancel();
        let mut files = Vec::with_capacity(self.pending.len() + 1);
        if self.contains(edited) {
            files.push(edited.to_path_buf());
        }
        files.extend(self.pending.iter().filter(|f| *f != edited).cloned());
        let mut next = ErrorsCheck::new(files, self.delay, now);
        // Reported files may still be edited again within this batch
        next.members.extend(self.members.iter().cloned());
        next
    }

    /// Run the next step if it is due.
    ///
    /// Returns the diagnostics event when a file completes. Files that were
    /// closed or have no project are skipped. On cancellation the batch
    /// keeps its position so a restart resumes from the same file.
    pub fn step(
        &mut self,
        service: &mut ProjectService,
        now: Instant,
    ) -> Result<Option<ServiceEvent>, Cancelled> {
        if self.token.is_cancelled() {
            return Err(Cancelled);
        }
        if now < self.next_at {
            return Ok(None);
        }
        let Some(path) = self.pending.front().cloned() else {
            return Ok(None);
        };
        if !service.records().is_open(&path) {
            log::trace!("Errors check skips closed file {}", path.display());
            self.advance(now);
            return Ok(None);
        }

        match self.syntactic.take() {
            None => match service.syntactic_diagnostics(&path, &self.token) {
                Ok(diagnostics) => {
                    self.syntactic = Some(diagnostics);
                    self.next_at = now;
                    Ok(None)
                }
                Err(e) if e.is_cancelled() => Err(Cancelled),
                Err(e) => {
                    log::trace!("Errors check skips {}: {}", path.display(), e);
                    self.advance(now);
                    Ok(None)
                }
            },
            Some(mut diagnostics) => match service.semantic_diagnostics(&path, &self.token) {
                Ok(semantic) => {
                    diagnostics.extend(semantic);
                    self.advance(now);
                    Ok(Some(ServiceEvent::DiagnosticsReady {
                        editor_version: service.editor_version(&path),
                        path,
                        diagnostics,
                    }))
                }
                Err(e) if e.is_cancelled() => {
                    self.syntactic = Some(diagnostics);
                    Err(Cancelled)
                }
                Err(e) => {
                    log::trace!("Errors check skips {}: {}", path.display(), e);
                    self.advance(now);
                    Ok(None)
                }
            },
        }
    }

    fn advance(&mut self, now: Instant) {
        self.pending.pop_front();
        self.syntactic = None;
        self.next_at = now + self.delay;
    }
}
