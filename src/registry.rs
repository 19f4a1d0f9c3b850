//! Session registry
//!
//! The single owner of every managed session and session group. Classifier
//! signals, hook events, transcript snapshots and user actions all end up
//! here, and every mutation goes through one `RwLock`.
//!
//! Teardown is guarded by one registry-wide cleanup flag. While it is set,
//! classifier signals are dropped instead of applied: stopping a classifier
//! can emit one last signal, and that signal must not touch a record that is
//! being removed. When the outermost teardown ends, surviving records are
//! re-read from their classifiers so a dropped signal is not lost for good.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use crate::classifier::{
    ClassifierError, ClassifierSettings, ClassifierSignal, OutputStatusClassifier, SignalSource,
};
use crate::config::{Config, ConfigError};
use crate::correlator::{ExternalProcess, ProcessCorrelator};
use crate::hooks::HookEvent;
use crate::platform;
use crate::pty::ByteSink;
use crate::session::{
    aggregate_status, GroupId, GroupSnapshot, Layout, ManagedSet, SessionId, SessionSnapshot,
    SessionStatus, SessionView, StatusCounts,
};
use crate::transcript::{CompletionReason, RecordKind, TranscriptSnapshot, TranscriptStatus};

const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),
    #[error("Broadcast is disabled for group {0}")]
    BroadcastDisabled(GroupId),
    #[error("Session {0} has no terminal attached")]
    NotAttached(SessionId),
    #[error("Session {0} has already terminated")]
    AlreadyTerminated(SessionId),
    #[error("Working directory must be absolute: {0:?}")]
    RelativeDirectory(PathBuf),
    #[error("Cannot create classifier: {0}")]
    ClassifierUnavailable(#[from] ClassifierError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No async runtime available")]
    NoRuntime,
    #[error("Failed to write to session {id}: {source}")]
    Io {
        id: SessionId,
        #[source]
        source: io::Error,
    },
}

/// Published on the registry's event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered {
        id: SessionId,
    },
    StateChanged {
        id: SessionId,
        status: SessionStatus,
    },
    /// The session just went from not waiting to waiting
    WaitingForInput {
        id: SessionId,
        display_name: String,
        group: Option<GroupId>,
    },
    /// The session stopped waiting; any notification for it is stale
    NotificationCancelled {
        id: SessionId,
    },
    SessionRemoved {
        id: SessionId,
    },
    GroupRemoved {
        id: GroupId,
    },
}

/// What the terminal host hands over once the agent is running
pub struct TerminalAttachment {
    pub sink: Arc<dyn ByteSink>,
    pub pid: Option<u32>,
    /// Conversation id passed to the agent; hook events carry it back
    pub conversation_id: Option<String>,
    pub transcript_path: Option<PathBuf>,
}

struct SessionRecord {
    id: SessionId,
    working_directory: PathBuf,
    display_name: String,
    status: SessionStatus,
    running: bool,
    waiting: bool,
    group_id: Option<GroupId>,
    classifier: Arc<OutputStatusClassifier>,
    sink: Option<Arc<dyn ByteSink>>,
    pid: Option<u32>,
    conversation_id: Option<String>,
    transcript_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
    exit_code: Option<u32>,
    last_record_kind: Option<RecordKind>,
    last_completion_reason: Option<CompletionReason>,
    /// Set once a terminate path has claimed the record
    terminating: bool,
}

impl SessionRecord {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            working_directory: self.working_directory.clone(),
            display_name: self.display_name.clone(),
            status: self.status,
            is_running: self.running,
            is_waiting: self.waiting,
            group_id: self.group_id.clone(),
            pid: self.pid,
            hook_managed: self.classifier.is_hook_managed(),
            transcript_path: self.transcript_path.clone(),
            started_at: self.started_at,
            exit_code: self.exit_code,
            last_record_kind: self.last_record_kind,
            last_completion_reason: self.last_completion_reason,
        }
    }

    fn idle_or_running(&self) -> SessionStatus {
        if self.running {
            SessionStatus::Running
        } else {
            SessionStatus::Idle
        }
    }

    fn is_live(&self) -> bool {
        !self.terminating && !self.status.is_terminal()
    }

    /// Apply a waiting transition, queueing the events it implies
    fn set_waiting(&mut self, waiting: bool, events: &mut Vec<SessionEvent>) {
        let was_waiting = self.waiting;
        let previous = self.status;
        self.waiting = waiting;
        self.status = if waiting {
            SessionStatus::Waiting
        } else {
            self.idle_or_running()
        };

        if !was_waiting && waiting {
            events.push(SessionEvent::WaitingForInput {
                id: self.id.clone(),
                display_name: self.display_name.clone(),
                group: self.group_id.clone(),
            });
        } else if was_waiting && !waiting {
            events.push(SessionEvent::NotificationCancelled {
                id: self.id.clone(),
            });
        }
        if previous != self.status {
            events.push(SessionEvent::StateChanged {
                id: self.id.clone(),
                status: self.status,
            });
        }
    }
}

struct GroupRecord {
    id: GroupId,
    working_directories: Vec<PathBuf>,
    layout: Layout,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    broadcast_enabled: bool,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionRecord>,
    groups: HashMap<GroupId, GroupRecord>,
}

impl RegistryState {
    fn touch_group(&mut self, group: Option<&GroupId>) {
        if let Some(g) = group.and_then(|id| self.groups.get_mut(id)) {
            g.last_activity = Utc::now();
        }
    }

    fn managed_set(&self) -> ManagedSet {
        let mut set = ManagedSet::default();
        for record in self.sessions.values() {
            set.directories.insert(record.working_directory.clone());
            if let Some(pid) = record.pid {
                set.pids.insert(pid);
            }
        }
        set
    }

    fn group_snapshot(&self, group: &GroupRecord) -> GroupSnapshot {
        let status = aggregate_status(
            self.sessions
                .values()
                .filter(|s| s.group_id.as_ref() == Some(&group.id))
                .map(|s| s.status),
        );
        GroupSnapshot {
            id: group.id.clone(),
            working_directories: group.working_directories.clone(),
            layout: group.layout,
            created_at: group.created_at,
            last_activity: group.last_activity,
            status,
            broadcast_enabled: group.broadcast_enabled,
        }
    }
}

/// A session claimed by a terminate path, between "signalled" and "removed"
struct Doomed {
    id: SessionId,
    was_waiting: bool,
    pid: Option<u32>,
    working_directory: PathBuf,
}

/// Holds the registry-wide cleanup flag for the duration of a teardown.
/// Only the guard that actually set the flag clears it.
pub struct CleanupGuard<'a> {
    flag: &'a AtomicBool,
    owner: bool,
}

impl CleanupGuard<'_> {
    pub fn is_outermost(&self) -> bool {
        self.owner
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if self.owner {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    settings: Arc<ClassifierSettings>,
    input_suppression: Duration,
    hook_suppression: Duration,
    correlator: Arc<ProcessCorrelator>,
    signals: mpsc::UnboundedSender<ClassifierSignal>,
    events: broadcast::Sender<SessionEvent>,
    managed: watch::Sender<ManagedSet>,
    cleanup: AtomicBool,
}

impl SessionRegistry {
    /// Create the registry and start its classifier signal pump on the
    /// current runtime.
    pub fn new(
        config: &Config,
        correlator: Arc<ProcessCorrelator>,
    ) -> Result<Arc<Self>, RegistryError> {
        let runtime = Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        let settings = Arc::new(ClassifierSettings::from_config(config)?);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (managed, _) = watch::channel(ManagedSet::default());

        let registry = Arc::new(Self {
            state: RwLock::new(RegistryState::default()),
            settings,
            input_suppression: config.input_suppression(),
            hook_suppression: config.hook_suppression(),
            correlator,
            signals,
            events,
            managed,
            cleanup: AtomicBool::new(false),
        });

        runtime.spawn(pump_signals(Arc::downgrade(&registry), signal_rx));
        Ok(registry)
    }

    fn publish(&self, event: SessionEvent) {
        tracing::debug!("Event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn refresh_managed(&self, state: &RegistryState) {
        self.managed.send_replace(state.managed_set());
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Pids and directories currently managed, for the correlator
    pub fn managed(&self) -> watch::Receiver<ManagedSet> {
        self.managed.subscribe()
    }

    pub fn is_cleanup_in_progress(&self) -> bool {
        self.cleanup.load(Ordering::SeqCst)
    }

    /// Enter a teardown. Nested calls get a guard that leaves the flag alone.
    pub fn begin_cleanup(&self) -> CleanupGuard<'_> {
        let owner = self
            .cleanup
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        CleanupGuard {
            flag: &self.cleanup,
            owner,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub async fn create_group(&self, working_directories: Vec<PathBuf>, layout: Layout) -> GroupId {
        let id = GroupId::generate();
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.groups.insert(
            id.clone(),
            GroupRecord {
                id: id.clone(),
                working_directories,
                layout,
                created_at: now,
                last_activity: now,
                broadcast_enabled: true,
            },
        );
        tracing::info!("Created group {} ({:?})", id, layout);
        id
    }

    pub async fn register(
        &self,
        working_directory: PathBuf,
        group_id: Option<GroupId>,
    ) -> Result<SessionId, RegistryError> {
        if !working_directory.is_absolute() {
            return Err(RegistryError::RelativeDirectory(working_directory));
        }

        let id = SessionId::generate();
        let classifier =
            OutputStatusClassifier::new(id.clone(), Arc::clone(&self.settings), self.signals.clone())?;

        let mut state = self.state.write().await;
        if let Some(gid) = &group_id {
            let group = state
                .groups
                .get_mut(gid)
                .ok_or_else(|| RegistryError::GroupNotFound(gid.clone()))?;
            if !group.working_directories.contains(&working_directory) {
                group.working_directories.push(working_directory.clone());
            }
            group.last_activity = Utc::now();
        }

        let display_name = platform::display_name_for(&working_directory);
        tracing::info!("Registered session {} ({}) in {:?}", id, display_name, working_directory);
        state.sessions.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                working_directory,
                display_name,
                status: SessionStatus::Idle,
                running: false,
                waiting: false,
                group_id,
                classifier,
                sink: None,
                pid: None,
                conversation_id: None,
                transcript_path: None,
                started_at: Utc::now(),
                exit_code: None,
                last_record_kind: None,
                last_completion_reason: None,
                terminating: false,
            },
        );
        self.refresh_managed(&state);
        drop(state);

        self.publish(SessionEvent::Registered { id: id.clone() });
        Ok(id)
    }

    /// Connect a running terminal to the session. Re-attaching (restart or
    /// resume) resets the classifier.
    pub async fn attach_terminal(
        &self,
        id: &SessionId,
        attachment: TerminalAttachment,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let record = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;
        if !record.is_live() {
            return Err(RegistryError::AlreadyTerminated(id.clone()));
        }

        if record.sink.is_some() {
            record.classifier.reset();
        }
        record.sink = Some(attachment.sink);
        record.pid = attachment.pid;
        record.conversation_id = attachment.conversation_id;
        record.transcript_path = attachment.transcript_path;
        record.running = true;
        record.waiting = false;
        record.status = SessionStatus::Running;
        let group = record.group_id.clone();
        tracing::info!("Attached terminal to {} (pid {:?})", id, record.pid);

        state.touch_group(group.as_ref());
        self.refresh_managed(&state);
        drop(state);

        self.publish(SessionEvent::StateChanged {
            id: id.clone(),
            status: SessionStatus::Running,
        });
        Ok(())
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Write text to one session. The echo must not read as a prompt, so
    /// waiting detection is suppressed for a short window first.
    pub async fn send_input(&self, id: &SessionId, text: &str) -> Result<(), RegistryError> {
        let (sink, classifier) = {
            let state = self.state.read().await;
            let record = state
                .sessions
                .get(id)
                .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;
            let sink = record
                .sink
                .clone()
                .ok_or_else(|| RegistryError::NotAttached(id.clone()))?;
            (sink, Arc::clone(&record.classifier))
        };

        classifier.suppress_waiting_detection(self.input_suppression);
        sink.send(text.as_bytes()).map_err(|source| RegistryError::Io {
            id: id.clone(),
            source,
        })
    }

    /// Send the same text to every running member of a group. Returns how
    /// many sessions received it.
    pub async fn broadcast(&self, group_id: &GroupId, text: &str) -> Result<usize, RegistryError> {
        let targets: Vec<(SessionId, Arc<dyn ByteSink>, Arc<OutputStatusClassifier>)> = {
            let state = self.state.read().await;
            let group = state
                .groups
                .get(group_id)
                .ok_or_else(|| RegistryError::GroupNotFound(group_id.clone()))?;
            if !group.broadcast_enabled {
                return Err(RegistryError::BroadcastDisabled(group_id.clone()));
            }
            state
                .sessions
                .values()
                .filter(|s| s.group_id.as_ref() == Some(group_id) && s.running && s.is_live())
                .filter_map(|s| {
                    s.sink
                        .clone()
                        .map(|sink| (s.id.clone(), sink, Arc::clone(&s.classifier)))
                })
                .collect()
        };

        let mut delivered = 0;
        for (id, sink, classifier) in targets {
            classifier.suppress_waiting_detection(self.input_suppression);
            match sink.send(text.as_bytes()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Broadcast to {} failed: {}", id, e),
            }
        }
        self.state.write().await.touch_group(Some(group_id));
        tracing::debug!("Broadcast to group {} reached {} sessions", group_id, delivered);
        Ok(delivered)
    }

    pub async fn set_broadcast_enabled(
        &self,
        group_id: &GroupId,
        enabled: bool,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| RegistryError::GroupNotFound(group_id.clone()))?;
        group.broadcast_enabled = enabled;
        Ok(())
    }

    // ========================================================================
    // State sources
    // ========================================================================

    async fn apply_signal(&self, signal: ClassifierSignal) {
        if self.is_cleanup_in_progress() {
            tracing::debug!("Dropping signal for {} during cleanup", signal.session_id);
            return;
        }
        if signal.source == SignalSource::Teardown {
            return;
        }

        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            if self.is_cleanup_in_progress() {
                return;
            }
            let Some(record) = state.sessions.get_mut(&signal.session_id) else {
                return;
            };
            if !record.is_live() {
                return;
            }

            record.set_waiting(signal.waiting, &mut events);
            let group = record.group_id.clone();
            state.touch_group(group.as_ref());
        }

        for event in events {
            self.publish(event);
        }
    }

    /// Route a hook event to the sessions it belongs to: by conversation id
    /// when the event carries one we know, otherwise by working directory.
    /// Returns the sessions it was applied to.
    pub async fn apply_hook(&self, event: &HookEvent) -> Vec<SessionId> {
        let targets: Vec<Arc<OutputStatusClassifier>> = {
            let state = self.state.read().await;
            let live = || state.sessions.values().filter(|s| s.is_live());

            let by_conversation: Vec<_> = match &event.session_id {
                Some(conv) => live()
                    .filter(|s| s.conversation_id.as_deref() == Some(conv.as_str()))
                    .collect(),
                None => Vec::new(),
            };
            let matched = if by_conversation.is_empty() {
                live()
                    .filter(|s| s.working_directory == event.cwd)
                    .collect()
            } else {
                by_conversation
            };
            matched.iter().map(|s| Arc::clone(&s.classifier)).collect()
        };

        if targets.is_empty() {
            tracing::debug!("Hook {:?} for {:?} matches no session", event.event, event.cwd);
        }

        targets
            .into_iter()
            .map(|classifier| {
                classifier.suppress_all_detection(self.hook_suppression);
                match event.event.waiting() {
                    Some(waiting) => classifier.force_set_waiting(waiting),
                    None => classifier.mark_hook_managed(),
                }
                classifier.session_id().clone()
            })
            .collect()
    }

    /// Merge a transcript classification. Hook-managed sessions keep their
    /// state and only record the diagnostic fields, as does a transcript
    /// that has no readable record yet.
    pub async fn apply_transcript(
        &self,
        id: &SessionId,
        snapshot: TranscriptSnapshot,
    ) -> Result<(), RegistryError> {
        let mut state_changed = None;
        {
            let mut state = self.state.write().await;
            let record = state
                .sessions
                .get_mut(id)
                .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;
            record.last_record_kind = snapshot.last_kind;
            record.last_completion_reason = snapshot.last_completion_reason;

            if !record.is_live() || record.classifier.is_hook_managed() {
                return Ok(());
            }
            // Without a record the status only reflects file age
            if snapshot.last_kind.is_none() && snapshot.status != TranscriptStatus::Idle {
                return Ok(());
            }
            match snapshot.status {
                TranscriptStatus::Waiting => {
                    record.classifier.set_waiting(true);
                }
                TranscriptStatus::Running => {
                    record.classifier.set_waiting(false);
                }
                TranscriptStatus::Idle => {
                    if !record.waiting && record.status != SessionStatus::Idle {
                        record.status = SessionStatus::Idle;
                        state_changed = Some(SessionStatus::Idle);
                    }
                }
            }
        }

        if let Some(status) = state_changed {
            self.publish(SessionEvent::StateChanged {
                id: id.clone(),
                status,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// The process exited on its own. Returns false when nothing changed:
    /// unknown session, already terminated, or being torn down. Teardowns of
    /// other sessions do not block it.
    pub async fn mark_terminated(&self, id: &SessionId, exit_code: Option<u32>) -> bool {
        let (was_waiting, status) = {
            let mut state = self.state.write().await;
            let Some(record) = state.sessions.get_mut(id) else {
                return false;
            };
            if !record.is_live() {
                tracing::debug!("Ignoring exit of {}: already terminating", id);
                return false;
            }
            record.classifier.stop();
            let was_waiting = record.waiting;
            record.waiting = false;
            record.running = false;
            record.exit_code = exit_code;
            record.status = match exit_code {
                None | Some(0) => SessionStatus::Completed,
                Some(_) => SessionStatus::Failed,
            };
            let status = record.status;
            let group = record.group_id.clone();
            state.touch_group(group.as_ref());
            (was_waiting, status)
        };

        tracing::info!("Session {} exited ({:?}) -> {}", id, exit_code, status);
        if was_waiting {
            self.publish(SessionEvent::NotificationCancelled { id: id.clone() });
        }
        self.publish(SessionEvent::StateChanged {
            id: id.clone(),
            status,
        });
        true
    }

    /// Drop a record (after a terminated session has lingered)
    pub async fn remove_session(&self, id: &SessionId) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.sessions.remove(id);
            if removed.is_some() {
                self.refresh_managed(&state);
            }
            removed
        };
        match removed {
            Some(record) => {
                record.classifier.stop();
                self.publish(SessionEvent::SessionRemoved { id: id.clone() });
                true
            }
            None => false,
        }
    }

    /// Claim sessions for teardown: mark them, stop their classifiers and
    /// clear their waiting flags, all under the write lock.
    fn claim(state: &mut RegistryState, ids: &[SessionId]) -> Vec<Doomed> {
        ids.iter()
            .filter_map(|id| {
                let record = state.sessions.get_mut(id)?;
                if record.terminating {
                    return None;
                }
                record.terminating = true;
                record.classifier.stop();
                let was_waiting = record.waiting;
                record.waiting = false;
                record.running = false;
                Some(Doomed {
                    id: id.clone(),
                    was_waiting,
                    pid: record.pid,
                    working_directory: record.working_directory.clone(),
                })
            })
            .collect()
    }

    /// Cancel notifications, signal every process, then remove the records.
    async fn finish_teardown(&self, doomed: Vec<Doomed>) {
        for d in doomed.iter().filter(|d| d.was_waiting) {
            self.publish(SessionEvent::NotificationCancelled { id: d.id.clone() });
        }

        let targets: Vec<(Option<u32>, PathBuf)> = doomed
            .iter()
            .map(|d| (d.pid, d.working_directory.clone()))
            .collect();
        let protected: HashSet<u32> = {
            let state = self.state.read().await;
            state
                .sessions
                .values()
                .filter(|s| !s.terminating)
                .filter_map(|s| s.pid)
                .collect()
        };
        let correlator = Arc::clone(&self.correlator);
        let signalled = tokio::task::spawn_blocking(move || {
            signal_processes(&correlator, &targets, &protected)
        })
        .await;
        match signalled {
            Ok(count) => tracing::debug!("Signalled {} processes", count),
            Err(e) => tracing::warn!("Process signalling task failed: {}", e),
        }

        let mut state = self.state.write().await;
        for d in &doomed {
            if state.sessions.remove(&d.id).is_some() {
                self.publish(SessionEvent::SessionRemoved { id: d.id.clone() });
            }
        }
        self.refresh_managed(&state);
    }

    /// Leave a teardown. The outermost one re-reads every surviving
    /// classifier, since signals it emitted meanwhile were dropped.
    async fn end_cleanup(&self, guard: CleanupGuard<'_>) {
        let outermost = guard.is_outermost();
        drop(guard);
        if outermost {
            self.resync_waiting().await;
        }
    }

    async fn resync_waiting(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            for record in state.sessions.values_mut() {
                if !record.is_live() || record.classifier.is_stopped() {
                    continue;
                }
                let waiting = record.classifier.is_waiting();
                if waiting != record.waiting {
                    tracing::debug!("Resyncing {} after cleanup: waiting={}", record.id, waiting);
                    record.set_waiting(waiting, &mut events);
                }
            }
        }
        for event in events {
            self.publish(event);
        }
    }

    /// User-initiated stop of one session
    pub async fn terminate_session(&self, id: &SessionId) -> Result<(), RegistryError> {
        let guard = self.begin_cleanup();
        let doomed = {
            let mut state = self.state.write().await;
            if !state.sessions.contains_key(id) {
                return Err(RegistryError::SessionNotFound(id.clone()));
            }
            Self::claim(&mut state, std::slice::from_ref(id))
        };
        tracing::info!("Terminating session {}", id);
        self.finish_teardown(doomed).await;
        self.end_cleanup(guard).await;
        Ok(())
    }

    /// Stop every member of a group as one batch. The group record goes
    /// first so nothing can re-enter it mid-teardown.
    pub async fn terminate_group(&self, group_id: &GroupId) -> Result<(), RegistryError> {
        let guard = self.begin_cleanup();
        let doomed = {
            let mut state = self.state.write().await;
            if state.groups.remove(group_id).is_none() {
                return Err(RegistryError::GroupNotFound(group_id.clone()));
            }
            let members: Vec<SessionId> = state
                .sessions
                .values()
                .filter(|s| s.group_id.as_ref() == Some(group_id))
                .map(|s| s.id.clone())
                .collect();
            Self::claim(&mut state, &members)
        };
        tracing::info!("Terminating group {} ({} sessions)", group_id, doomed.len());
        self.publish(SessionEvent::GroupRemoved {
            id: group_id.clone(),
        });
        self.finish_teardown(doomed).await;
        self.end_cleanup(guard).await;
        Ok(())
    }

    /// Shutdown: stop everything
    pub async fn terminate_all(&self) {
        let guard = self.begin_cleanup();
        let (doomed, groups) = {
            let mut state = self.state.write().await;
            let groups: Vec<GroupId> = state.groups.drain().map(|(id, _)| id).collect();
            let ids: Vec<SessionId> = state.sessions.keys().cloned().collect();
            (Self::claim(&mut state, &ids), groups)
        };
        tracing::info!("Terminating all sessions ({})", doomed.len());
        for id in groups {
            self.publish(SessionEvent::GroupRemoved { id });
        }
        self.finish_teardown(doomed).await;
        self.end_cleanup(guard).await;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub async fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.state.read().await.sessions.get(id).map(|s| s.snapshot())
    }

    /// All sessions, oldest first
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let state = self.state.read().await;
        let mut list: Vec<SessionSnapshot> = state.sessions.values().map(|s| s.snapshot()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn sessions_for_group(&self, group_id: &GroupId) -> Vec<SessionSnapshot> {
        self.sessions()
            .await
            .into_iter()
            .filter(|s| s.group_id.as_ref() == Some(group_id))
            .collect()
    }

    pub async fn group(&self, group_id: &GroupId) -> Option<GroupSnapshot> {
        let state = self.state.read().await;
        state.groups.get(group_id).map(|g| state.group_snapshot(g))
    }

    pub async fn groups(&self) -> Vec<GroupSnapshot> {
        let state = self.state.read().await;
        let mut list: Vec<GroupSnapshot> = state.groups.values().map(|g| state.group_snapshot(g)).collect();
        list.sort_by_key(|g| g.created_at);
        list
    }

    pub async fn counts(&self) -> StatusCounts {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .fold(StatusCounts::default(), |mut counts, s| {
                if s.status == SessionStatus::Running {
                    counts.running += 1;
                }
                if s.waiting {
                    counts.waiting += 1;
                }
                counts
            })
    }

    /// Managed sessions followed by the external processes of the latest scan
    pub async fn views(&self, external: &[ExternalProcess]) -> Vec<SessionView> {
        self.sessions()
            .await
            .into_iter()
            .map(SessionView::Managed)
            .chain(external.iter().cloned().map(SessionView::External))
            .collect()
    }

    pub async fn classifier(&self, id: &SessionId) -> Option<Arc<OutputStatusClassifier>> {
        self.state
            .read()
            .await
            .sessions
            .get(id)
            .map(|s| Arc::clone(&s.classifier))
    }
}

/// Signal the attached pid of each target. A target with no attached pid
/// falls back to the agent processes a fresh scan finds in its working
/// directory, minus the pids of other live sessions. Blocking.
fn signal_processes(
    correlator: &ProcessCorrelator,
    targets: &[(Option<u32>, PathBuf)],
    protected: &HashSet<u32>,
) -> usize {
    let mut pids: HashSet<u32> = targets.iter().filter_map(|(pid, _)| *pid).collect();

    let unattached: Vec<&PathBuf> = targets
        .iter()
        .filter(|(pid, _)| pid.is_none())
        .map(|(_, dir)| dir)
        .collect();
    if !unattached.is_empty() {
        let scan = correlator.scan_agent_processes();
        pids.extend(
            scan.iter()
                .filter(|p| {
                    p.working_directory
                        .path()
                        .is_some_and(|cwd| unattached.iter().any(|dir| dir.as_path() == cwd))
                })
                .map(|p| p.pid)
                .filter(|pid| !protected.contains(pid)),
        );
    }

    pids.into_iter().filter(|&pid| correlator.terminate(pid)).count()
}

/// Drain classifier signals into the registry, in arrival order
async fn pump_signals(
    registry: Weak<SessionRegistry>,
    mut signals: mpsc::UnboundedReceiver<ClassifierSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.apply_signal(signal).await;
    }
    tracing::debug!("Classifier signal pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{ProcessEntry, ProcessSource};
    use crate::hooks::HookEventKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHost {
        entries: Vec<ProcessEntry>,
        cwds: HashMap<u32, PathBuf>,
        killed: Mutex<Vec<u32>>,
        scan_delay: Duration,
    }

    impl ProcessSource for FakeHost {
        fn list_processes(&self) -> io::Result<Vec<ProcessEntry>> {
            std::thread::sleep(self.scan_delay);
            Ok(self.entries.clone())
        }
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
        fn working_directory(&self, pid: u32) -> Option<PathBuf> {
            self.cwds.get(&pid).cloned()
        }
        fn terminate(&self, pid: u32) -> bool {
            self.killed.lock().unwrap().push(pid);
            true
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<Vec<u8>>,
    }

    impl ByteSink for RecordingSink {
        fn send(&self, bytes: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
    }

    impl RecordingSink {
        fn text(&self) -> String {
            String::from_utf8(self.written.lock().unwrap().clone()).unwrap()
        }
    }

    fn test_config() -> Config {
        Config {
            debounce_ms: 30,
            input_suppression_ms: 100,
            hook_suppression_ms: 100,
            ..Config::default()
        }
    }

    fn registry_with(host: Arc<FakeHost>) -> Arc<SessionRegistry> {
        let correlator = Arc::new(ProcessCorrelator::with_source("claude", host));
        SessionRegistry::new(&test_config(), correlator).unwrap()
    }

    fn registry() -> (Arc<SessionRegistry>, Arc<FakeHost>) {
        let host = Arc::new(FakeHost::default());
        (registry_with(Arc::clone(&host)), host)
    }

    fn attachment(sink: Arc<RecordingSink>, pid: Option<u32>) -> TerminalAttachment {
        TerminalAttachment {
            sink,
            pid,
            conversation_id: None,
            transcript_path: None,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn hook(kind: HookEventKind, cwd: &str) -> HookEvent {
        HookEvent {
            event: kind,
            cwd: PathBuf::from(cwd),
            session_id: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_register_requires_absolute_directory() {
        let (reg, _) = registry();
        let err = reg.register(PathBuf::from("relative/dir"), None).await;
        assert!(matches!(err, Err(RegistryError::RelativeDirectory(_))));

        let missing = GroupId::from("nope");
        let err = reg.register(PathBuf::from("/tmp/a"), Some(missing)).await;
        assert!(matches!(err, Err(RegistryError::GroupNotFound(_))));
    }

    #[tokio::test]
    async fn test_register_and_attach() {
        let (reg, _) = registry();
        let id = reg.register(PathBuf::from("/work/api"), None).await.unwrap();
        let s = reg.session(&id).await.unwrap();
        assert_eq!(s.display_name, "api");
        assert_eq!(s.status, SessionStatus::Idle);
        assert!(!s.is_running);

        let sink = Arc::new(RecordingSink::default());
        reg.attach_terminal(&id, attachment(sink, Some(4242))).await.unwrap();
        let s = reg.session(&id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Running);
        assert_eq!(s.pid, Some(4242));

        let managed = reg.managed().borrow().clone();
        assert!(managed.contains_pid(4242));
        assert!(managed.contains_dir(std::path::Path::new("/work/api")));
    }

    #[tokio::test]
    async fn test_end_to_end_notify_then_terminate() {
        let (reg, host) = registry();
        let mut events = reg.subscribe();
        let id = reg.register(PathBuf::from("/work/api"), None).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        reg.attach_terminal(&id, attachment(sink, Some(777))).await.unwrap();

        let classifier = reg.classifier(&id).await.unwrap();
        classifier.ingest(b"Applied 3 edits\n\x1b[2m>\x1b[0m ");
        tokio::time::sleep(Duration::from_millis(150)).await;

        let s = reg.session(&id).await.unwrap();
        assert!(s.is_waiting);
        assert_eq!(s.status, SessionStatus::Waiting);
        assert_eq!(reg.counts().await.waiting, 1);

        reg.terminate_session(&id).await.unwrap();
        settle().await;

        let events = drain(&mut events);
        let notified = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::WaitingForInput { .. }))
            .count();
        assert_eq!(notified, 1);

        let cancel_at: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, SessionEvent::NotificationCancelled { .. }))
            .map(|(i, _)| i)
            .collect();
        let removed_at = events
            .iter()
            .position(|e| matches!(e, SessionEvent::SessionRemoved { .. }))
            .unwrap();
        assert_eq!(cancel_at.len(), 1);
        assert!(cancel_at[0] < removed_at);

        assert!(reg.session(&id).await.is_none());
        assert_eq!(*host.killed.lock().unwrap(), vec![777]);
        assert!(reg.managed().borrow().pids.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_signals_processes_found_by_directory() {
        let host = Arc::new(FakeHost {
            entries: vec![ProcessEntry {
                pid: 9001,
                ppid: 1,
                started_at: None,
                command: "claude".to_string(),
            }],
            cwds: HashMap::from([(9001, PathBuf::from("/work/web"))]),
            ..FakeHost::default()
        });
        let reg = registry_with(Arc::clone(&host));
        let id = reg.register(PathBuf::from("/work/web"), None).await.unwrap();

        reg.terminate_session(&id).await.unwrap();
        assert_eq!(*host.killed.lock().unwrap(), vec![9001]);
        assert!(matches!(
            reg.terminate_session(&id).await,
            Err(RegistryError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_group_during_classifier_signals() {
        let (reg, _) = registry();
        let mut events = reg.subscribe();
        let gid = reg.create_group(Vec::new(), Layout::Columns).await;
        let mut ids = Vec::new();
        for dir in ["/g/a", "/g/b", "/g/c"] {
            let id = reg.register(PathBuf::from(dir), Some(gid.clone())).await.unwrap();
            let sink = Arc::new(RecordingSink::default());
            reg.attach_terminal(&id, attachment(sink, None)).await.unwrap();
            ids.push(id);
        }
        let classifiers: Vec<_> = {
            let mut v = Vec::new();
            for id in &ids {
                v.push(reg.classifier(id).await.unwrap());
            }
            v
        };
        classifiers[0].force_set_waiting(true);
        settle().await;

        // Keep signals flowing while the group is torn down
        let storm = tokio::spawn({
            let classifiers = classifiers.clone();
            async move {
                for i in 0..50 {
                    for c in &classifiers {
                        c.force_set_waiting(i % 2 == 0);
                        c.ingest(b"\n> ");
                    }
                    tokio::task::yield_now().await;
                }
            }
        });
        reg.terminate_group(&gid).await.unwrap();
        storm.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(reg.group(&gid).await.is_none());
        assert!(reg.sessions_for_group(&gid).await.is_empty());
        assert!(reg.sessions().await.is_empty());
        for id in &ids {
            assert!(reg.session(id).await.is_none());
        }
        assert_eq!(reg.counts().await, StatusCounts::default());

        let removed = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::SessionRemoved { .. }))
            .count();
        assert_eq!(removed, 3);
        assert!(!reg.is_cleanup_in_progress());
    }

    #[tokio::test]
    async fn test_nested_cleanup_keeps_outer_flag() {
        let (reg, _) = registry();
        let outer = reg.begin_cleanup();
        assert!(outer.is_outermost());
        {
            let inner = reg.begin_cleanup();
            assert!(!inner.is_outermost());
        }
        assert!(reg.is_cleanup_in_progress());
        drop(outer);
        assert!(!reg.is_cleanup_in_progress());
    }

    #[tokio::test]
    async fn test_signals_dropped_during_cleanup() {
        let (reg, _) = registry();
        let mut events = reg.subscribe();
        let id = reg.register(PathBuf::from("/work/x"), None).await.unwrap();
        let classifier = reg.classifier(&id).await.unwrap();

        let guard = reg.begin_cleanup();
        classifier.force_set_waiting(true);
        settle().await;
        drop(guard);

        assert!(!reg.session(&id).await.unwrap().is_waiting);
        assert!(drain(&mut events)
            .iter()
            .all(|e| !matches!(e, SessionEvent::WaitingForInput { .. })));
    }

    #[tokio::test]
    async fn test_mark_terminated_sets_terminal_status() {
        let (reg, _) = registry();
        let mut events = reg.subscribe();
        let ok = reg.register(PathBuf::from("/w/ok"), None).await.unwrap();
        let bad = reg.register(PathBuf::from("/w/bad"), None).await.unwrap();

        reg.classifier(&bad).await.unwrap().force_set_waiting(true);
        settle().await;
        drain(&mut events);

        assert!(reg.mark_terminated(&ok, Some(0)).await);
        assert!(reg.mark_terminated(&bad, Some(2)).await);
        assert!(!reg.mark_terminated(&bad, Some(2)).await);

        let s = reg.session(&ok).await.unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(!s.is_running);
        let s = reg.session(&bad).await.unwrap();
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.exit_code, Some(2));
        assert!(!s.is_waiting);
        assert!(reg.classifier(&bad).await.unwrap().is_stopped());

        settle().await;
        let cancels = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::NotificationCancelled { .. }))
            .count();
        assert_eq!(cancels, 1);

        assert!(reg.remove_session(&ok).await);
        assert!(reg.session(&ok).await.is_none());
    }

    fn slow_host() -> Arc<FakeHost> {
        Arc::new(FakeHost {
            scan_delay: Duration::from_millis(300),
            ..FakeHost::default()
        })
    }

    /// Tear down an unattached session in the background; its directory scan
    /// keeps the teardown open for the host's scan delay.
    fn spawn_teardown(
        reg: &Arc<SessionRegistry>,
        id: &SessionId,
    ) -> tokio::task::JoinHandle<Result<(), RegistryError>> {
        let reg = Arc::clone(reg);
        let id = id.clone();
        tokio::spawn(async move { reg.terminate_session(&id).await })
    }

    #[tokio::test]
    async fn test_exit_of_other_session_during_teardown() {
        let reg = registry_with(slow_host());
        let doomed = reg.register(PathBuf::from("/w/doomed"), None).await.unwrap();
        let other = reg.register(PathBuf::from("/w/other"), None).await.unwrap();
        reg.attach_terminal(&other, attachment(Arc::new(RecordingSink::default()), Some(20)))
            .await
            .unwrap();

        let teardown = spawn_teardown(&reg, &doomed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reg.is_cleanup_in_progress());

        // The session being torn down ignores its exit; the other one does not
        assert!(!reg.mark_terminated(&doomed, Some(0)).await);
        assert!(reg.mark_terminated(&other, Some(0)).await);
        let s = reg.session(&other).await.unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(!s.is_running);

        teardown.await.unwrap().unwrap();
        assert!(reg.session(&doomed).await.is_none());
        assert!(reg.remove_session(&other).await);
    }

    #[tokio::test]
    async fn test_terminate_spares_sibling_in_same_directory() {
        let claude = |pid| ProcessEntry {
            pid,
            ppid: 1,
            started_at: None,
            command: "claude".to_string(),
        };
        let host = Arc::new(FakeHost {
            entries: vec![claude(10), claude(11), claude(12)],
            cwds: [10, 11, 12]
                .into_iter()
                .map(|pid| (pid, PathBuf::from("/same")))
                .collect(),
            ..FakeHost::default()
        });
        let reg = registry_with(Arc::clone(&host));
        let a = reg.register(PathBuf::from("/same"), None).await.unwrap();
        let b = reg.register(PathBuf::from("/same"), None).await.unwrap();
        let c = reg.register(PathBuf::from("/same"), None).await.unwrap();
        for (id, pid) in [(&a, 10), (&b, 11)] {
            reg.attach_terminal(id, attachment(Arc::new(RecordingSink::default()), Some(pid)))
                .await
                .unwrap();
        }

        reg.terminate_session(&a).await.unwrap();
        assert_eq!(*host.killed.lock().unwrap(), vec![10]);
        assert!(reg.session(&b).await.is_some());

        // No pid of its own: the directory scan runs, but b's pid is off limits
        host.killed.lock().unwrap().clear();
        reg.terminate_session(&c).await.unwrap();
        let killed = host.killed.lock().unwrap().clone();
        assert!(killed.contains(&12));
        assert!(!killed.contains(&11));
        assert!(reg.session(&b).await.is_some());
    }

    #[tokio::test]
    async fn test_signal_dropped_during_teardown_is_resynced() {
        let reg = registry_with(slow_host());
        let mut events = reg.subscribe();
        let doomed = reg.register(PathBuf::from("/w/doomed"), None).await.unwrap();
        let hooked = reg.register(PathBuf::from("/w/hooked"), None).await.unwrap();
        reg.attach_terminal(&hooked, attachment(Arc::new(RecordingSink::default()), Some(21)))
            .await
            .unwrap();

        let teardown = spawn_teardown(&reg, &doomed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        reg.classifier(&hooked).await.unwrap().force_set_waiting(true);
        settle().await;
        assert!(!reg.session(&hooked).await.unwrap().is_waiting);

        teardown.await.unwrap().unwrap();
        let s = reg.session(&hooked).await.unwrap();
        assert!(s.is_waiting);
        assert_eq!(s.status, SessionStatus::Waiting);

        settle().await;
        let notified: Vec<SessionId> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::WaitingForInput { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(notified, vec![hooked]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_running_members() {
        let (reg, _) = registry();
        let gid = reg.create_group(Vec::new(), Layout::Grid).await;
        let sinks: Vec<Arc<RecordingSink>> = (0..2).map(|_| Arc::new(RecordingSink::default())).collect();
        for (i, sink) in sinks.iter().enumerate() {
            let id = reg
                .register(PathBuf::from(format!("/b/{}", i)), Some(gid.clone()))
                .await
                .unwrap();
            reg.attach_terminal(&id, attachment(Arc::clone(sink), None)).await.unwrap();
        }
        // Registered but never attached: skipped
        reg.register(PathBuf::from("/b/idle"), Some(gid.clone())).await.unwrap();

        assert_eq!(reg.broadcast(&gid, "run tests\n").await.unwrap(), 2);
        for sink in &sinks {
            assert_eq!(sink.text(), "run tests\n");
        }
        assert_eq!(reg.group(&gid).await.unwrap().working_directories.len(), 3);

        reg.set_broadcast_enabled(&gid, false).await.unwrap();
        assert!(matches!(
            reg.broadcast(&gid, "x").await,
            Err(RegistryError::BroadcastDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_send_input_suppresses_waiting() {
        let (reg, _) = registry();
        let id = reg.register(PathBuf::from("/w/in"), None).await.unwrap();
        assert!(matches!(
            reg.send_input(&id, "hi").await,
            Err(RegistryError::NotAttached(_))
        ));

        let sink = Arc::new(RecordingSink::default());
        reg.attach_terminal(&id, attachment(Arc::clone(&sink), None)).await.unwrap();
        reg.send_input(&id, "yes\r").await.unwrap();
        assert_eq!(sink.text(), "yes\r");

        let classifier = reg.classifier(&id).await.unwrap();
        assert!(!classifier.set_waiting(true));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(classifier.set_waiting(true));
    }

    #[tokio::test]
    async fn test_hooks_override_heuristics() {
        let (reg, _) = registry();
        let id = reg.register(PathBuf::from("/w/hooked"), None).await.unwrap();
        let other = reg.register(PathBuf::from("/w/other"), None).await.unwrap();

        let applied = reg.apply_hook(&hook(HookEventKind::Stop, "/w/hooked")).await;
        assert_eq!(applied, vec![id.clone()]);
        settle().await;

        let s = reg.session(&id).await.unwrap();
        assert!(s.is_waiting);
        assert!(s.hook_managed);
        assert!(!reg.session(&other).await.unwrap().hook_managed);

        // Heuristic output can no longer clear it
        let classifier = reg.classifier(&id).await.unwrap();
        for i in 0..8 {
            classifier.ingest(format!("\nworking {}", i).as_bytes());
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(reg.session(&id).await.unwrap().is_waiting);

        reg.apply_hook(&hook(HookEventKind::UserPromptSubmit, "/w/hooked")).await;
        settle().await;
        assert!(!reg.session(&id).await.unwrap().is_waiting);
    }

    #[tokio::test]
    async fn test_hook_routed_by_conversation_id() {
        let (reg, _) = registry();
        let a = reg.register(PathBuf::from("/same"), None).await.unwrap();
        let b = reg.register(PathBuf::from("/same"), None).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        reg.attach_terminal(
            &b,
            TerminalAttachment {
                sink,
                pid: None,
                conversation_id: Some("conv-b".to_string()),
                transcript_path: None,
            },
        )
        .await
        .unwrap();

        let mut event = hook(HookEventKind::Notification, "/same");
        event.session_id = Some("conv-b".to_string());
        assert_eq!(reg.apply_hook(&event).await, vec![b.clone()]);

        event.session_id = None;
        let mut applied = reg.apply_hook(&event).await;
        applied.sort();
        let mut both = vec![a, b];
        both.sort();
        assert_eq!(applied, both);
    }

    #[tokio::test]
    async fn test_subagent_stop_only_marks_hook_managed() {
        let (reg, _) = registry();
        let id = reg.register(PathBuf::from("/w/sub"), None).await.unwrap();
        reg.apply_hook(&hook(HookEventKind::SubagentStop, "/w/sub")).await;
        settle().await;
        let s = reg.session(&id).await.unwrap();
        assert!(s.hook_managed);
        assert!(!s.is_waiting);
    }

    #[tokio::test]
    async fn test_transcript_snapshot_merges() {
        let (reg, _) = registry();
        let id = reg.register(PathBuf::from("/w/t"), None).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        reg.attach_terminal(&id, attachment(sink, None)).await.unwrap();

        let waiting = TranscriptSnapshot {
            status: TranscriptStatus::Waiting,
            last_kind: Some(RecordKind::Assistant),
            last_completion_reason: Some(CompletionReason::TurnComplete),
        };
        reg.apply_transcript(&id, waiting).await.unwrap();
        settle().await;
        let s = reg.session(&id).await.unwrap();
        assert!(s.is_waiting);
        assert_eq!(s.last_record_kind, Some(RecordKind::Assistant));
        assert_eq!(s.last_completion_reason, Some(CompletionReason::TurnComplete));

        // A file with no readable record does not override the heuristics
        let unread = TranscriptSnapshot {
            status: TranscriptStatus::Running,
            last_kind: None,
            last_completion_reason: None,
        };
        reg.apply_transcript(&id, unread).await.unwrap();
        settle().await;
        assert!(reg.session(&id).await.unwrap().is_waiting);

        let running = TranscriptSnapshot {
            status: TranscriptStatus::Running,
            last_kind: Some(RecordKind::Progress),
            last_completion_reason: None,
        };
        reg.apply_transcript(&id, running).await.unwrap();
        settle().await;
        assert_eq!(reg.session(&id).await.unwrap().status, SessionStatus::Running);

        let idle = TranscriptSnapshot {
            status: TranscriptStatus::Idle,
            last_kind: None,
            last_completion_reason: None,
        };
        reg.apply_transcript(&id, idle).await.unwrap();
        assert_eq!(reg.session(&id).await.unwrap().status, SessionStatus::Idle);

        // Hook-managed sessions ignore transcript status
        reg.classifier(&id).await.unwrap().mark_hook_managed();
        reg.apply_transcript(&id, waiting).await.unwrap();
        settle().await;
        assert!(!reg.session(&id).await.unwrap().is_waiting);
    }

    #[tokio::test]
    async fn test_group_status_and_counts() {
        let (reg, _) = registry();
        let gid = reg.create_group(vec![PathBuf::from("/c/a")], Layout::Rows).await;
        let a = reg.register(PathBuf::from("/c/a"), Some(gid.clone())).await.unwrap();
        let b = reg.register(PathBuf::from("/c/b"), Some(gid.clone())).await.unwrap();
        assert_eq!(reg.group(&gid).await.unwrap().status, SessionStatus::Idle);

        reg.attach_terminal(&a, attachment(Arc::new(RecordingSink::default()), None))
            .await
            .unwrap();
        reg.classifier(&b).await.unwrap().force_set_waiting(true);
        settle().await;

        let group = reg.group(&gid).await.unwrap();
        assert_eq!(group.status, SessionStatus::Running);
        assert_eq!(group.working_directories, vec![PathBuf::from("/c/a"), PathBuf::from("/c/b")]);
        assert_eq!(
            reg.counts().await,
            StatusCounts {
                running: 1,
                waiting: 1
            }
        );

        let views = reg.views(&[]).await;
        assert_eq!(views.len(), 2);
        assert_eq!(reg.groups().await.len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_all_clears_everything() {
        let (reg, host) = registry();
        let gid = reg.create_group(Vec::new(), Layout::Tabs).await;
        for (i, dir) in ["/z/a", "/z/b"].iter().enumerate() {
            let id = reg.register(PathBuf::from(dir), Some(gid.clone())).await.unwrap();
            reg.attach_terminal(&id, attachment(Arc::new(RecordingSink::default()), Some(100 + i as u32)))
                .await
                .unwrap();
        }
        reg.register(PathBuf::from("/z/solo"), None).await.unwrap();

        reg.terminate_all().await;
        assert!(reg.sessions().await.is_empty());
        assert!(reg.groups().await.is_empty());
        let mut killed = host.killed.lock().unwrap().clone();
        killed.sort();
        assert_eq!(killed, vec![100, 101]);
        assert!(!reg.is_cleanup_in_progress());
    }
}
