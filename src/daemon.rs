//! Coordinator for agentdeck
//!
//! Owns the one registry instance and connects every producer to it: PTY
//! output and exits, the hook file, transcript polling and the external
//! process scan. `run` is the foreground loop behind `agentdeck run`.

use colored::Colorize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::correlator::{ExternalProcess, ProcessCorrelator};
use crate::hooks::{HookError, HookWatcher};
use crate::notifier::{run_notifier, DesktopNotifier, LogNotifier, NotificationSink};
use crate::pty::{self, PtyError};
use crate::registry::{RegistryError, SessionEvent, SessionRegistry, TerminalAttachment};
use crate::session::{GroupId, Layout, SessionId, SessionStatus, SessionView};
use crate::transcript::{TranscriptSnapshot, TranscriptTailClassifier};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Coordinator {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    correlator: Arc<ProcessCorrelator>,
    transcripts: TranscriptTailClassifier,
    external_tx: watch::Sender<Arc<Vec<ExternalProcess>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    hook_watcher: Mutex<Option<HookWatcher>>,
}

impl Coordinator {
    pub fn new(config: Config) -> Result<Arc<Self>, DaemonError> {
        let agent_binary = Path::new(&config.agent_command)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| config.agent_command.clone());
        Self::with_correlator(config, Arc::new(ProcessCorrelator::new(agent_binary)))
    }

    pub fn with_correlator(
        config: Config,
        correlator: Arc<ProcessCorrelator>,
    ) -> Result<Arc<Self>, DaemonError> {
        let registry = SessionRegistry::new(&config, Arc::clone(&correlator))?;
        let (external_tx, _) = watch::channel(Arc::new(Vec::new()));

        Ok(Arc::new(Self {
            transcripts: TranscriptTailClassifier::from_config(&config),
            config: Arc::new(config),
            registry,
            correlator,
            external_tx,
            tasks: Mutex::new(Vec::new()),
            hook_watcher: Mutex::new(None),
        }))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Latest external process snapshot
    pub fn external(&self) -> Arc<Vec<ExternalProcess>> {
        Arc::clone(&self.external_tx.borrow())
    }

    pub fn subscribe_external(&self) -> watch::Receiver<Arc<Vec<ExternalProcess>>> {
        self.external_tx.subscribe()
    }

    /// Managed sessions followed by the external agents of the latest scan
    pub async fn views(&self) -> Vec<SessionView> {
        self.registry.views(&self.external()).await
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Start the background producers: process scan, hook channel,
    /// transcript polling and notifications.
    pub fn start(self: &Arc<Self>) -> Result<(), DaemonError> {
        let scan = Arc::clone(&self.correlator).run(
            self.registry.managed(),
            self.external_tx.clone(),
            self.config.scan_interval(),
        );
        self.track(tokio::spawn(scan));

        let (hook_tx, hook_rx) = mpsc::unbounded_channel();
        let watcher = HookWatcher::spawn(
            self.config.hook_file_path(),
            self.config.transcript_poll(),
            hook_tx,
        )?;
        *self.hook_watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
        self.track(tokio::spawn(pump_hooks(Arc::clone(&self.registry), hook_rx)));

        self.track(tokio::spawn(Arc::clone(self).poll_transcripts()));

        let sink: Arc<dyn NotificationSink> = if self.config.desktop_notifications {
            Arc::new(DesktopNotifier::new())
        } else {
            Arc::new(LogNotifier)
        };
        self.track(tokio::spawn(run_notifier(self.registry.subscribe(), sink)));

        tracing::info!("Coordinator started");
        Ok(())
    }

    /// Register a session, start the agent in its terminal and watch for
    /// its exit.
    pub async fn launch(
        self: &Arc<Self>,
        working_directory: PathBuf,
        group: Option<GroupId>,
    ) -> Result<SessionId, DaemonError> {
        let id = self.registry.register(working_directory.clone(), group).await?;
        let classifier = self
            .registry
            .classifier(&id)
            .await
            .ok_or_else(|| RegistryError::SessionNotFound(id.clone()))?;

        let agent = match pty::spawn_agent(&self.config, &working_directory, classifier) {
            Ok(agent) => agent,
            Err(e) => {
                self.registry.remove_session(&id).await;
                return Err(e.into());
            }
        };

        let pid = agent.terminal.pid();
        self.registry
            .attach_terminal(
                &id,
                TerminalAttachment {
                    sink: agent.terminal.clone(),
                    pid,
                    conversation_id: Some(agent.conversation_id.clone()),
                    transcript_path: Some(agent.transcript_path.clone()),
                },
            )
            .await?;

        let this = Arc::clone(self);
        let exit_id = id.clone();
        let exit = agent.exit;
        self.track(tokio::spawn(async move {
            let code = exit.await.unwrap_or(None);
            if this.registry.mark_terminated(&exit_id, code).await {
                tokio::time::sleep(this.config.terminated_linger()).await;
                this.registry.remove_session(&exit_id).await;
            }
        }));

        Ok(id)
    }

    /// Launch one session per directory in a new group
    pub async fn launch_group(
        self: &Arc<Self>,
        directories: Vec<PathBuf>,
        layout: Layout,
        broadcast_enabled: bool,
    ) -> Result<(GroupId, Vec<SessionId>), DaemonError> {
        let group = self
            .registry
            .create_group(directories.clone(), layout)
            .await;
        self.registry
            .set_broadcast_enabled(&group, broadcast_enabled)
            .await?;

        let mut ids = Vec::with_capacity(directories.len());
        for dir in directories {
            match self.launch(dir.clone(), Some(group.clone())).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    tracing::error!("Failed to launch agent in {:?}: {}", dir, e);
                    self.registry.terminate_group(&group).await?;
                    return Err(e);
                }
            }
        }
        Ok((group, ids))
    }

    /// Classify every attached transcript on each tick. File reads happen on
    /// a blocking worker, never under the registry lock.
    async fn poll_transcripts(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.transcript_poll());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let targets: Vec<_> = self
                .registry
                .sessions()
                .await
                .into_iter()
                .filter(|s| !s.status.is_terminal())
                .filter_map(|s| s.transcript_path.map(|p| (s.id, p, s.started_at)))
                .collect();
            if targets.is_empty() {
                continue;
            }

            let classifier = self.transcripts;
            let result = tokio::task::spawn_blocking(move || {
                targets
                    .into_iter()
                    .map(|(id, path, started_at)| {
                        (id, classifier.classify(&path, Some(started_at.into())))
                    })
                    .collect::<Vec<(SessionId, TranscriptSnapshot)>>()
            })
            .await;

            match result {
                Ok(snapshots) => {
                    for (id, snapshot) in snapshots {
                        // The session may have gone away since the read
                        if let Err(e) = self.registry.apply_transcript(&id, snapshot).await {
                            tracing::debug!("Transcript update skipped: {}", e);
                        }
                    }
                }
                Err(e) => tracing::warn!("Transcript poll task failed: {}", e),
            }
        }
    }

    /// Tear everything down: sessions first, then the producers.
    pub async fn shutdown(&self) {
        self.registry.terminate_all().await;

        let watcher = self
            .hook_watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut watcher) = watcher {
            // Joining waits out the watcher's poll timeout
            let _ = tokio::task::spawn_blocking(move || watcher.stop()).await;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!("Coordinator stopped");
    }
}

async fn pump_hooks(registry: Arc<SessionRegistry>, mut hooks: mpsc::UnboundedReceiver<crate::hooks::HookEvent>) {
    while let Some(event) = hooks.recv().await {
        let applied = registry.apply_hook(&event).await;
        tracing::debug!("Hook {:?} applied to {} sessions", event.event, applied.len());
    }
}

/// Print session events for the foreground `run` loop
async fn print_events(mut events: broadcast::Receiver<SessionEvent>, names: HashMap<SessionId, String>) {
    let name = |id: &SessionId| names.get(id).cloned().unwrap_or_else(|| id.to_string());
    loop {
        match events.recv().await {
            Ok(SessionEvent::WaitingForInput { id, .. }) => {
                eprintln!("{} {} is waiting for input", "●".yellow(), name(&id).bold());
            }
            Ok(SessionEvent::StateChanged { id, status }) => {
                let label = match status {
                    SessionStatus::Running => status.as_str().green(),
                    SessionStatus::Waiting => status.as_str().yellow(),
                    SessionStatus::Failed => status.as_str().red(),
                    SessionStatus::Idle | SessionStatus::Completed => status.as_str().dimmed(),
                };
                eprintln!("  {} {}", name(&id), label);
            }
            Ok(SessionEvent::SessionRemoved { id }) => {
                eprintln!("  {} {}", name(&id), "removed".dimmed());
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Report agents running in other terminals whenever the set changes
async fn print_external(coordinator: Arc<Coordinator>) {
    let mut snapshots = coordinator.subscribe_external();
    let mut shown: BTreeSet<u32> = BTreeSet::new();
    while snapshots.changed().await.is_ok() {
        let external: Vec<ExternalProcess> = coordinator
            .views()
            .await
            .into_iter()
            .filter_map(|view| match view {
                SessionView::External(p) => Some(p),
                SessionView::Managed(_) => None,
            })
            .collect();
        let pids: BTreeSet<u32> = external.iter().map(|p| p.pid).collect();
        if pids == shown {
            continue;
        }
        shown = pids;
        if external.is_empty() {
            eprintln!("  {}", "No agents running in other terminals".dimmed());
            continue;
        }
        eprintln!("{} {} running in other terminals", "○".cyan(), external.len());
        for p in &external {
            eprintln!(
                "    {} {} ({})",
                p.pid.to_string().dimmed(),
                p.display_name().bold(),
                p.parent_app.display_name()
            );
        }
    }
}

/// Forward stdin lines to the group (broadcast) or the single session
async fn forward_stdin(registry: Arc<SessionRegistry>, target: InputTarget) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        let text = format!("{}\r", line);
        let result = match &target {
            InputTarget::Group(group) => registry.broadcast(group, &text).await.map(|_| ()),
            InputTarget::Session(id) => registry.send_input(id, &text).await,
        };
        if let Err(e) = result {
            eprintln!("{}: {}", "Input not delivered".red(), e);
        }
    }
}

enum InputTarget {
    Group(GroupId),
    Session(SessionId),
}

/// Resolves once every managed session has been removed
async fn all_sessions_ended(registry: Arc<SessionRegistry>) {
    let mut events = registry.subscribe();
    loop {
        if registry.sessions().await.is_empty() {
            return;
        }
        match events.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down (Ctrl+C)"),
                _ = sigterm.recv() => tracing::info!("Shutting down (SIGTERM)"),
            }
        }
        Err(e) => {
            tracing::warn!(
                "Failed to set up SIGTERM handler: {}. Only Ctrl+C will work for shutdown.",
                e
            );
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down (Ctrl+C)");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down (Ctrl+C)");
}

/// Foreground loop: launch agents in `directories`, forward stdin, and run
/// until every session has ended or a shutdown signal arrives.
pub async fn run(
    config: Config,
    directories: Vec<PathBuf>,
    layout: Layout,
    broadcast_enabled: bool,
) -> Result<(), DaemonError> {
    let coordinator = Coordinator::new(config)?;
    coordinator.start()?;
    let registry = Arc::clone(coordinator.registry());
    let printer_events = registry.subscribe();

    let target = if directories.len() > 1 {
        let (group, ids) = coordinator
            .launch_group(directories, layout, broadcast_enabled)
            .await?;
        eprintln!(
            "{} {} sessions in group {}",
            "Started".green().bold(),
            ids.len(),
            group
        );
        InputTarget::Group(group)
    } else {
        let dir = match directories.into_iter().next() {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let id = coordinator.launch(dir.clone(), None).await?;
        eprintln!("{} session {} in {}", "Started".green().bold(), id, dir.display());
        InputTarget::Session(id)
    };

    let names: HashMap<SessionId, String> = registry
        .sessions()
        .await
        .into_iter()
        .map(|s| (s.id, s.display_name))
        .collect();
    let printer = tokio::spawn(print_events(printer_events, names));
    let external = tokio::spawn(print_external(Arc::clone(&coordinator)));
    let input = tokio::spawn(forward_stdin(Arc::clone(&registry), target));

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = all_sessions_ended(Arc::clone(&registry)) => {
            tracing::info!("All sessions ended");
        }
    }

    coordinator.shutdown().await;
    input.abort();
    printer.abort();
    external.abort();
    Ok(())
}
