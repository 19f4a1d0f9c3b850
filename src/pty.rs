// PTY module - Runs agent processes in pseudo-terminals

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::classifier::OutputStatusClassifier;
use crate::config::Config;
use crate::transcript::get_transcript_path;

/// Anything that accepts input bytes for a session's terminal
pub trait ByteSink: Send + Sync {
    fn send(&self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),
    #[error("PTY error: {0}")]
    Pty(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Lock error")]
    Lock,
}

/// Resolve a command to its full path
pub fn resolve_command(cmd: &str) -> Option<PathBuf> {
    let path = Path::new(cmd);
    if path.is_absolute() && path.exists() {
        return Some(path.to_path_buf());
    }
    which::which(cmd).ok()
}

/// The master side of a running agent's terminal
pub struct PtyTerminal {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    pid: Option<u32>,
}

impl PtyTerminal {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let master = self.master.lock().map_err(|_| PtyError::Lock)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Pty(e.to_string()))
    }
}

impl ByteSink for PtyTerminal {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "PTY writer lock poisoned"))?;
        writer.write_all(bytes)?;
        writer.flush()
    }
}

/// A freshly launched agent
pub struct SpawnedAgent {
    pub terminal: Arc<PtyTerminal>,
    pub conversation_id: String,
    pub transcript_path: PathBuf,
    /// Resolves with the exit code once the process is gone (`None` when it
    /// could not be collected)
    pub exit: oneshot::Receiver<Option<u32>>,
}

/// Launch the configured agent in `working_directory` inside a new PTY.
///
/// Output is pumped into `classifier` from a dedicated reader thread until
/// the terminal closes; the exit code is then reported through
/// [`SpawnedAgent::exit`].
pub fn spawn_agent(
    config: &Config,
    working_directory: &Path,
    classifier: Arc<OutputStatusClassifier>,
) -> Result<SpawnedAgent, PtyError> {
    let program = resolve_command(&config.agent_command)
        .ok_or_else(|| PtyError::CommandNotFound(config.agent_command.clone()))?;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 40,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::Pty(e.to_string()))?;

    // The conversation id names the transcript file and comes back on hook
    // events, so it is chosen here rather than by the agent.
    let conversation_id = uuid::Uuid::new_v4().to_string();

    let mut cmd = CommandBuilder::new(&program);
    cmd.args(&config.agent_args);
    cmd.arg("--session-id");
    cmd.arg(&conversation_id);
    cmd.cwd(working_directory);
    cmd.env(
        "TERM",
        std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
    );

    tracing::info!("Starting {:?} in {:?}", program, working_directory);
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PtyError::Pty(e.to_string()))?;
    // Only the child keeps the slave open, so EOF arrives when it exits
    drop(pair.slave);

    let pid = child.process_id();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PtyError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::Pty(e.to_string()))?;

    let (exit_tx, exit_rx) = oneshot::channel();
    let session_id = classifier.session_id().clone();
    std::thread::Builder::new()
        .name(format!("pty-{}", session_id))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => classifier.ingest(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // EIO once the child side is closed on Linux
                    Err(e) => {
                        tracing::debug!("PTY read for {} ended: {}", session_id, e);
                        break;
                    }
                }
            }

            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    tracing::warn!("Failed to collect exit status for {}: {}", session_id, e);
                    None
                }
            };
            tracing::info!("Session {} ended (exit {:?})", session_id, code);
            let _ = exit_tx.send(code);
        })?;

    Ok(SpawnedAgent {
        terminal: Arc::new(PtyTerminal {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            pid,
        }),
        transcript_path: get_transcript_path(working_directory, &conversation_id),
        conversation_id,
        exit: exit_rx,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::classifier::ClassifierSettings;
    use crate::session::SessionId;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn shell_config(script: &str) -> Config {
        Config {
            agent_command: "sh".to_string(),
            // `--session-id <id>` lands in $0 and $1, which the script ignores
            agent_args: vec!["-c".to_string(), script.to_string()],
            debounce_ms: 30,
            ..Config::default()
        }
    }

    fn classifier(config: &Config) -> Arc<OutputStatusClassifier> {
        let settings = Arc::new(ClassifierSettings::from_config(config).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        OutputStatusClassifier::new(SessionId::from("pty-test"), settings, tx).unwrap()
    }

    #[test]
    fn test_resolve_command() {
        assert!(resolve_command("sh").is_some());
        assert!(resolve_command("definitely-not-a-real-binary-xyz").is_none());
    }

    #[tokio::test]
    async fn test_missing_agent_is_reported() {
        let config = Config {
            agent_command: "definitely-not-a-real-binary-xyz".to_string(),
            ..Config::default()
        };
        let dir = std::env::temp_dir();
        let result = spawn_agent(&config, &dir, classifier(&config));
        assert!(matches!(result, Err(PtyError::CommandNotFound(_))));
    }

    #[tokio::test]
    async fn test_output_feeds_classifier_and_exit_is_reported() {
        let config = shell_config("printf 'done\\n> '; sleep 0.3; exit 3");
        let c = classifier(&config);
        let dir = std::env::temp_dir();
        let agent = spawn_agent(&config, &dir, Arc::clone(&c)).unwrap();
        assert!(agent.terminal.pid().is_some());
        assert!(agent
            .transcript_path
            .to_string_lossy()
            .ends_with(&format!("{}.jsonl", agent.conversation_id)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(c.is_waiting());

        let code = tokio::time::timeout(Duration::from_secs(5), agent.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_input_reaches_the_process() {
        let config = shell_config("read line; echo \"got:$line\"; sleep 0.2");
        let c = classifier(&config);
        let dir = std::env::temp_dir();
        let agent = spawn_agent(&config, &dir, c).unwrap();

        agent.terminal.send(b"hello\n").unwrap();
        agent.terminal.resize(30, 100).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), agent.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(0));
    }
}
