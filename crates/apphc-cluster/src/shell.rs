//! Remote command execution on the cluster node that hosts the upgrade
//! script.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{ErrorCode, Session};
use tracing::{debug, warn};

use apphc_core::config::ClusterConfig;

use crate::error::{ClusterError, ClusterResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Combined output, trimmed.
    pub fn message(&self) -> String {
        format!("{}{}", self.stdout.trim(), self.stderr.trim())
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` to completion. A non-zero exit is reported through
    /// [`CommandOutput::status`], not as an error.
    async fn run(&self, command: &str) -> ClusterResult<CommandOutput>;
}

#[derive(Clone)]
enum SshAuth {
    KeyFile(PathBuf),
    Password(String),
    Agent,
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            SshAuth::Password(_) => f.write_str("Password(..)"),
            SshAuth::Agent => f.write_str("Agent"),
        }
    }
}

/// Runs commands over an ssh2 session, one session per command.
///
/// libssh2 is blocking, so every command runs on the blocking pool. The
/// connect timeout bounds the TCP connect, handshake, and authentication;
/// the command timeout bounds every later read.
#[derive(Debug, Clone)]
pub struct SshShell {
    host: String,
    port: u16,
    user: String,
    auth: SshAuth,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshShell {
    pub fn new(host: &str, port: u16, user: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            auth: SshAuth::Agent,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(1800),
        }
    }

    /// Key file when configured, then password, then the ssh agent.
    pub fn from_config(config: &ClusterConfig) -> Self {
        let shell = Self::new(&config.ssh_host, config.ssh_port, &config.ssh_user)
            .with_timeouts(config.ssh_connect_timeout(), config.ssh_command_timeout());
        if !config.ssh_key_path.as_os_str().is_empty() {
            shell.with_key_file(&config.ssh_key_path)
        } else if !config.ssh_password.is_empty() {
            shell.with_password(&config.ssh_password)
        } else {
            shell
        }
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth = SshAuth::KeyFile(path.into());
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.auth = SshAuth::Password(password.to_string());
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.connect_timeout = connect;
        self.command_timeout = command;
        self
    }

    fn io_error(&self, source: io::Error) -> ClusterError {
        if source.kind() == io::ErrorKind::TimedOut {
            return self.timed_out(self.command_timeout);
        }
        ClusterError::Io {
            host: self.host.clone(),
            source,
        }
    }

    fn ssh_error(&self, source: ssh2::Error, limit: Duration) -> ClusterError {
        if is_timeout(&source) {
            return self.timed_out(limit);
        }
        ClusterError::Session {
            host: self.host.clone(),
            source,
        }
    }

    fn timed_out(&self, limit: Duration) -> ClusterError {
        ClusterError::Timeout {
            host: self.host.clone(),
            secs: limit.as_secs(),
        }
    }

    fn open_tcp(&self) -> ClusterResult<TcpStream> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.io_error(e))?;
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "host resolved to no address");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = e,
            }
        }
        Err(self.io_error(last_error))
    }

    fn connect(&self) -> ClusterResult<Session> {
        let tcp = self.open_tcp()?;
        let mut session = Session::new().map_err(|e| self.ssh_error(e, self.connect_timeout))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.connect_timeout));
        session
            .handshake()
            .map_err(|e| self.ssh_error(e, self.connect_timeout))?;

        let authenticated = match &self.auth {
            SshAuth::KeyFile(path) => session.userauth_pubkey_file(&self.user, None, path, None),
            SshAuth::Password(password) => session.userauth_password(&self.user, password),
            SshAuth::Agent => session.userauth_agent(&self.user),
        };
        if let Err(e) = authenticated {
            if is_timeout(&e) {
                return Err(self.timed_out(self.connect_timeout));
            }
            return Err(ClusterError::Auth {
                user: self.user.clone(),
                host: self.host.clone(),
                reason: e.message().to_string(),
            });
        }
        if !session.authenticated() {
            return Err(ClusterError::Auth {
                user: self.user.clone(),
                host: self.host.clone(),
                reason: "no credentials accepted".to_string(),
            });
        }

        session.set_timeout(millis(self.command_timeout));
        Ok(session)
    }

    fn exec_blocking(&self, command: &str) -> ClusterResult<CommandOutput> {
        let session = self.connect()?;
        let limit = self.command_timeout;
        let mut channel = session
            .channel_session()
            .map_err(|e| self.ssh_error(e, limit))?;
        channel.exec(command).map_err(|e| self.ssh_error(e, limit))?;

        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|e| self.io_error(e))?;
        let mut stderr = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr)
            .map_err(|e| self.io_error(e))?;
        channel.wait_close().map_err(|e| self.ssh_error(e, limit))?;
        let status = channel.exit_status().map_err(|e| self.ssh_error(e, limit))?;

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// libssh2 reports an elapsed session timeout as `LIBSSH2_ERROR_TIMEOUT` or
/// `LIBSSH2_ERROR_SOCKET_TIMEOUT`.
fn is_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(-9) | ErrorCode::Session(-30))
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str) -> ClusterResult<CommandOutput> {
        debug!(host = %self.host, port = self.port, %command, "running remote command");
        let shell = self.clone();
        let owned = command.to_string();
        let limit = self.connect_timeout + self.command_timeout;
        let task = tokio::task::spawn_blocking(move || shell.exec_blocking(&owned));
        match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!(host = %self.host, %command, "remote command abandoned after timeout");
                Err(self.timed_out(limit))
            }
        }
    }
}

/// In-process shell answering from a table of canned outputs.
///
/// Commands are matched by substring; unmatched commands succeed with empty
/// output. Every command run is recorded.
#[derive(Debug, Default)]
pub struct ScriptedShell {
    replies: Mutex<HashMap<String, CommandOutput>>,
    history: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `status` and `stdout`.
    pub fn reply(self, pattern: &str, status: i32, stdout: &str) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                pattern.to_string(),
                CommandOutput {
                    status,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
        self
    }

    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn run(&self, command: &str) -> ClusterResult<CommandOutput> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
        let replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        // Longest matching pattern wins.
        let reply = replies
            .iter()
            .filter(|(pattern, _)| command.contains(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, out)| out.clone());
        Ok(reply.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_shell_prefers_specific_replies() {
        let shell = ScriptedShell::new()
            .reply("-o upgrade", 0, "done")
            .reply("-o upgrade -d reg -c proxy", 3, "");

        let out = shell.run("apph-upgrade.sh -o upgrade -d reg -c proxy -g git").await.unwrap();
        assert_eq!(out.status, 3);
        let out = shell.run("apph-upgrade.sh -o upgrade -d reg -c dns -g git").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "done");
        let out = shell.run("apph-upgrade.sh -o clean").await.unwrap();
        assert_eq!(out, CommandOutput::default());
        assert_eq!(shell.history().len(), 3);
    }

    #[test]
    fn config_selects_key_file_before_password() {
        let mut config = ClusterConfig::default();
        config.ssh_password = "secret".into();
        let shell = SshShell::from_config(&config);
        assert!(matches!(shell.auth, SshAuth::Password(_)));
        assert!(!format!("{shell:?}").contains("secret"));

        config.ssh_key_path = "/root/.ssh/id_ed25519".into();
        config.ssh_command_timeout_secs = 60;
        let shell = SshShell::from_config(&config);
        assert!(matches!(shell.auth, SshAuth::KeyFile(_)));
        assert_eq!(shell.command_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let shell = SshShell::new("127.0.0.1", port, "root")
            .with_timeouts(Duration::from_millis(500), Duration::from_millis(500));

        let err = shell.run("true").await.unwrap_err();
        assert!(matches!(err, ClusterError::Io { .. }), "{err}");
    }

    #[tokio::test]
    async fn silent_host_times_out() {
        // Accepts the TCP connection but never sends an ssh banner.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let shell = SshShell::new("127.0.0.1", port, "root")
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = shell.run("apph-upgrade.sh -o available").await.unwrap_err();
        assert!(
            matches!(err, ClusterError::Timeout { .. } | ClusterError::Session { .. }),
            "{err}"
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}
