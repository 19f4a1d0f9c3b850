//! Output status classifier
//!
//! One per session. Consumes raw PTY chunks, debounces bursts, and decides
//! whether the agent is waiting for input. Two mutation paths exist:
//!
//! - `set_waiting`: the heuristic path, gated by hook-managed mode and by the
//!   suppression windows; duplicate values are dropped.
//! - `force_set_waiting`: the hook path; always applies and always signals.
//!
//! Changes are reported as [`ClassifierSignal`]s on an mpsc channel rather
//! than through callbacks, so the registry decides when to apply them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError};
use crate::detection::ReadyMatcher;
use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("No async runtime available to schedule evaluations")]
    NoRuntime,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Which path produced a waiting-state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Heuristic,
    Hook,
    Reset,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierSignal {
    pub session_id: SessionId,
    pub waiting: bool,
    pub source: SignalSource,
}

/// Shared, immutable tuning for every classifier
#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub debounce: Duration,
    pub buffer_capacity: usize,
    pub matcher: ReadyMatcher,
}

impl ClassifierSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            debounce: config.debounce(),
            buffer_capacity: config.buffer_capacity.max(64),
            matcher: ReadyMatcher::new(&config.ready_markers)?,
        })
    }
}

#[derive(Default)]
struct ClassifierState {
    buffer: VecDeque<u8>,
    waiting: bool,
    hook_managed: bool,
    suppress_waiting_until: Option<Instant>,
    suppress_all_until: Option<Instant>,
    pending: Option<JoinHandle<()>>,
    /// Bumped by every ingest/reset/stop; a debounce task only evaluates if
    /// its generation is still current.
    generation: u64,
    stopped: bool,
}

impl ClassifierState {
    fn cancel_pending(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    fn suppressed(&self, waiting: bool, now: Instant) -> bool {
        if self.suppress_all_until.is_some_and(|until| now < until) {
            return true;
        }
        waiting && self.suppress_waiting_until.is_some_and(|until| now < until)
    }
}

pub struct OutputStatusClassifier {
    session_id: SessionId,
    settings: Arc<ClassifierSettings>,
    runtime: Handle,
    signals: mpsc::UnboundedSender<ClassifierSignal>,
    state: Mutex<ClassifierState>,
}

impl OutputStatusClassifier {
    /// Create a classifier bound to the current tokio runtime.
    ///
    /// Fails when called outside a runtime: debounced evaluation needs
    /// somewhere to schedule its timer.
    pub fn new(
        session_id: SessionId,
        settings: Arc<ClassifierSettings>,
        signals: mpsc::UnboundedSender<ClassifierSignal>,
    ) -> Result<Arc<Self>, ClassifierError> {
        let runtime = Handle::try_current().map_err(|_| ClassifierError::NoRuntime)?;
        Ok(Arc::new(Self {
            session_id,
            settings,
            runtime,
            signals,
            state: Mutex::new(ClassifierState::default()),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ClassifierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, waiting: bool, source: SignalSource) {
        let signal = ClassifierSignal {
            session_id: self.session_id.clone(),
            waiting,
            source,
        };
        if self.signals.send(signal).is_err() {
            tracing::debug!("Classifier {} has no listener", self.session_id);
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_waiting(&self) -> bool {
        self.lock().waiting
    }

    pub fn is_hook_managed(&self) -> bool {
        self.lock().hook_managed
    }

    /// Append output and (re)schedule a debounced evaluation.
    ///
    /// Safe to call from the PTY reader thread.
    pub fn ingest(self: &Arc<Self>, chunk: &[u8]) {
        let mut state = self.lock();
        if state.stopped || chunk.is_empty() {
            return;
        }

        state.buffer.extend(chunk.iter().copied());
        let overflow = state
            .buffer
            .len()
            .saturating_sub(self.settings.buffer_capacity);
        if overflow > 0 {
            state.buffer.drain(..overflow);
        }

        state.cancel_pending();
        let generation = state.generation;
        let debounce = self.settings.debounce;
        let this = Arc::clone(self);
        state.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            this.evaluate_generation(generation);
        }));
    }

    fn evaluate_generation(&self, generation: u64) {
        let snapshot = {
            let mut state = self.lock();
            if state.stopped || state.generation != generation {
                return;
            }
            state.pending = None;
            state.buffer.iter().copied().collect::<Vec<u8>>()
        };
        let ready = self.settings.matcher.is_ready(&snapshot);
        self.set_waiting(ready);
    }

    /// Evaluate the current buffer immediately.
    pub fn evaluate(&self) {
        let snapshot = {
            let state = self.lock();
            if state.stopped {
                return;
            }
            state.buffer.iter().copied().collect::<Vec<u8>>()
        };
        let ready = self.settings.matcher.is_ready(&snapshot);
        self.set_waiting(ready);
    }

    /// Heuristic transition. Returns true if the state changed.
    pub fn set_waiting(&self, waiting: bool) -> bool {
        let mut state = self.lock();
        if state.stopped || state.hook_managed {
            return false;
        }
        if state.suppressed(waiting, Instant::now()) {
            tracing::debug!(
                "Suppressed heuristic waiting={} for {}",
                waiting,
                self.session_id
            );
            return false;
        }
        if state.waiting == waiting {
            return false;
        }
        state.waiting = waiting;
        self.emit(waiting, SignalSource::Heuristic);
        true
    }

    /// Authoritative transition from a hook event. Always signals, even when
    /// the value is unchanged, and switches the session to hook-managed mode.
    pub fn force_set_waiting(&self, waiting: bool) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        state.hook_managed = true;
        state.waiting = waiting;
        self.emit(waiting, SignalSource::Hook);
    }

    /// Block transitions into waiting for `duration`. Used right after input
    /// is injected so its echo is not read as a prompt.
    pub fn suppress_waiting_detection(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.lock();
        state.suppress_waiting_until = Some(match state.suppress_waiting_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// Block every heuristic transition for `duration`.
    pub fn suppress_all_detection(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.lock();
        state.suppress_all_until = Some(match state.suppress_all_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// Permanently disable heuristic detection for this session.
    pub fn mark_hook_managed(&self) {
        let mut state = self.lock();
        if !state.hook_managed {
            tracing::info!("Session {} is now hook-managed", self.session_id);
        }
        state.hook_managed = true;
    }

    /// Clear the buffer and waiting flag (restart/resume). Hook-managed mode
    /// survives a reset.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.cancel_pending();
        state.buffer.clear();
        if state.waiting && !state.stopped {
            state.waiting = false;
            self.emit(false, SignalSource::Reset);
        }
    }

    /// Silence the classifier for good. If it was waiting, one final
    /// not-waiting signal is emitted; teardown must be ready to drop it.
    pub fn stop(&self) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        state.cancel_pending();
        state.buffer.clear();
        state.stopped = true;
        if state.waiting {
            state.waiting = false;
            self.emit(false, SignalSource::Teardown);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }
}

impl Drop for OutputStatusClassifier {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.cancel_pending();
        }
    }
}
