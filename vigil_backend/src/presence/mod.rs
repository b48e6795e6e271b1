use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::PresenceConfig;

/// Answers one question: is a human operator attached right now?
///
/// Implementations must never fail; anything that prevents an answer counts
/// as "not attached" so the scheduler falls through to unattended mode.
#[async_trait]
pub trait PresenceDetector: Send + Sync {
    async fn is_operator_attached(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' did not answer within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("'{program}' exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Checks for clients attached to a terminal-multiplexer server.
#[derive(Debug, Clone)]
pub struct TmuxPresence {
    program: String,
    socket: Option<PathBuf>,
    run_as: Option<String>,
    timeout: Duration,
}

impl TmuxPresence {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self {
            program: "tmux".to_string(),
            socket,
            run_as: None,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn from_config(config: &PresenceConfig) -> Self {
        Self {
            program: config.tmux_binary.clone(),
            socket: config.tmux_socket.as_ref().map(PathBuf::from),
            run_as: config
                .run_as
                .as_ref()
                .map(|user| user.trim().to_string())
                .filter(|user| !user.is_empty()),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Program and arguments for the client listing, wrapped in `sudo` when
    /// the multiplexer runs as another user.
    fn command_line(&self) -> (String, Vec<String>) {
        let mut args = Vec::new();
        if let Some(socket) = &self.socket {
            args.push("-S".to_string());
            args.push(socket.display().to_string());
        }
        args.push("list-clients".to_string());

        match &self.run_as {
            Some(user) => {
                let mut wrapped = vec![
                    "-n".to_string(),
                    "-u".to_string(),
                    user.clone(),
                    self.program.clone(),
                ];
                wrapped.extend(args);
                ("sudo".to_string(), wrapped)
            }
            None => (self.program.clone(), args),
        }
    }

    pub async fn probe(&self) -> Result<bool, PresenceError> {
        let (program, args) = self.command_line();
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PresenceError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| PresenceError::Timeout {
                program: program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| PresenceError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(PresenceError::CommandFailed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(has_attached_clients(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl PresenceDetector for TmuxPresence {
    async fn is_operator_attached(&self) -> bool {
        match self.probe().await {
            Ok(attached) => attached,
            Err(error) => {
                tracing::debug!("Presence probe failed, treating as unattended: {}", error);
                false
            }
        }
    }
}

/// Fixed answer, for hosts without a multiplexer session to watch.
#[derive(Debug, Clone, Copy)]
pub struct StaticPresence(pub bool);

#[async_trait]
impl PresenceDetector for StaticPresence {
    async fn is_operator_attached(&self) -> bool {
        self.0
    }
}

fn has_attached_clients(listing: &str) -> bool {
    listing.lines().any(|line| !line.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_listing_means_nobody_attached() {
        assert!(!has_attached_clients(""));
        assert!(!has_attached_clients("\n  \n"));
        assert!(has_attached_clients(
            "/dev/pts/3: main [211x52 xterm-256color] (utf8)\n"
        ));
    }

    #[test]
    fn command_line_includes_socket_and_sudo_wrapper() {
        let plain = TmuxPresence::new(Some(PathBuf::from("/run/brain.sock")));
        assert_eq!(
            plain.command_line(),
            (
                "tmux".to_string(),
                vec!["-S".into(), "/run/brain.sock".into(), "list-clients".into()]
            )
        );

        let config = PresenceConfig {
            tmux_socket: Some("/run/brain.sock".to_string()),
            run_as: Some(" agent ".to_string()),
            ..PresenceConfig::default()
        };
        let (program, args) = TmuxPresence::from_config(&config).command_line();
        assert_eq!(program, "sudo");
        assert_eq!(
            args,
            vec!["-n", "-u", "agent", "tmux", "-S", "/run/brain.sock", "list-clients"]
        );
    }

    #[tokio::test]
    async fn missing_binary_fails_open_to_unattended() {
        let detector = TmuxPresence::new(None).with_program("vigil-no-such-multiplexer");
        assert!(matches!(
            detector.probe().await,
            Err(PresenceError::Spawn { .. })
        ));
        assert!(!detector.is_operator_attached().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_empty_output_counts_as_attached() {
        // `echo` prints its arguments, standing in for a populated client list.
        let detector = TmuxPresence::new(None).with_program("echo");
        assert!(detector.probe().await.unwrap());
        assert!(detector.is_operator_attached().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_reported_then_swallowed() {
        let detector = TmuxPresence::new(None).with_program("false");
        assert!(matches!(
            detector.probe().await,
            Err(PresenceError::CommandFailed { .. })
        ));
        assert!(!detector.is_operator_attached().await);
    }

    #[tokio::test]
    async fn static_presence_reports_fixed_answer() {
        assert!(StaticPresence(true).is_operator_attached().await);
        assert!(!StaticPresence(false).is_operator_attached().await);
    }
}
