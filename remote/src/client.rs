use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tracing::debug;

use crate::auth::{AuthMethod, ResolvedAuth};
use crate::error::{BatchError, ExecError};

/// Retry ceiling for the readiness probe.
pub const READY_ATTEMPTS: u32 = 10;

/// Spacing between readiness attempts.
pub const READY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Where [`RemoteRunner::run_stream`] delivers remote output lines.
pub enum OutputSinks<'a> {
    /// Drop all output.
    Discard,
    /// Deliver stdout and stderr lines to a single callback. Ordering between
    /// the two streams is not guaranteed; ordering within each stream is.
    Combined(&'a mut (dyn FnMut(&str) + Send)),
    /// Deliver stdout and stderr lines to separate callbacks.
    Split {
        stdout: &'a mut (dyn FnMut(&str) + Send),
        stderr: &'a mut (dyn FnMut(&str) + Send),
    },
}

impl OutputSinks<'_> {
    /// Deliver one stdout line to the configured sink.
    pub fn stdout_line(&mut self, line: &str) {
        match self {
            OutputSinks::Discard => {}
            OutputSinks::Combined(sink) => sink(line),
            OutputSinks::Split { stdout, .. } => stdout(line),
        }
    }

    /// Deliver one stderr line to the configured sink.
    pub fn stderr_line(&mut self, line: &str) {
        match self {
            OutputSinks::Discard => {}
            OutputSinks::Combined(sink) => sink(line),
            OutputSinks::Split { stderr, .. } => stderr(line),
        }
    }
}

/// Command execution against one remote host.
///
/// Implemented by [`SshClient`] and by test doubles in the orchestration
/// crates. Both batch operations execute commands strictly in order and stop
/// at the first failure; command N+1 never starts before command N's exit
/// status has been observed.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Runs commands sequentially, capturing combined stdout+stderr per
    /// command. Exactly one output per completed command, in input order;
    /// outputs gathered before a failure ride the error.
    async fn run(&self, commands: &[String]) -> Result<Vec<String>, BatchError>;

    /// Runs commands sequentially, streaming output line-by-line into
    /// `sinks`. Returns only once every stream has hit end-of-stream and the
    /// remote exit status is in; a non-zero status is an error even when the
    /// streams drained cleanly.
    async fn run_stream(
        &self,
        commands: &[String],
        sinks: OutputSinks<'_>,
    ) -> Result<(), BatchError>;

    /// Probes until the host accepts an authenticated connection, up to a
    /// fixed attempt ceiling. `logger` is invoked with a progress message on
    /// every non-final failed attempt.
    async fn wait_for_ready(
        &self,
        logger: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), ExecError>;

    /// Bare host address, for endpoint templating.
    fn host(&self) -> &str;
}

/// SSH implementation of [`RemoteRunner`]. Immutable once constructed.
pub struct SshClient {
    host: String,
    port: u16,
    user: String,
    auth: ResolvedAuth,
    retry_delay: Duration,
}

impl SshClient {
    /// Creates a client for `user@host:port`. Key material is decoded here,
    /// so invalid credentials fail before any connection is attempted.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        auth: AuthMethod,
    ) -> Result<Self, ExecError> {
        let client = Self {
            host: host.into(),
            port,
            user: user.into(),
            auth: ResolvedAuth::resolve(&auth)?,
            retry_delay: READY_RETRY_DELAY,
        };
        debug!(address = %client.address(), user = %client.user, "ssh client configured");
        Ok(client)
    }

    /// Overrides the readiness-probe spacing. The attempt ceiling is fixed.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// `host:port`, for diagnostics.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<client::Handle<Acceptor>, ExecError> {
        let config = Arc::new(client::Config::default());
        let address = self.address();

        let mut session = client::connect(config, (self.host.as_str(), self.port), Acceptor)
            .await
            .map_err(|source| ExecError::Connect {
                address: address.clone(),
                source,
            })?;

        let authed = match &self.auth {
            ResolvedAuth::Key(key) => session
                .authenticate_publickey(self.user.as_str(), key.clone())
                .await
                .map_err(|source| ExecError::Connect {
                    address: address.clone(),
                    source,
                })?,
            ResolvedAuth::Password(password) => session
                .authenticate_password(self.user.as_str(), password.as_str())
                .await
                .map_err(|source| ExecError::Connect {
                    address: address.clone(),
                    source,
                })?,
        };

        if !authed {
            return Err(ExecError::Auth {
                user: self.user.clone(),
                address,
            });
        }
        Ok(session)
    }

    async fn open_exec(
        &self,
        session: &client::Handle<Acceptor>,
        command: &str,
    ) -> Result<russh::Channel<client::Msg>, ExecError> {
        let mut channel =
            session
                .channel_open_session()
                .await
                .map_err(|source| ExecError::Session {
                    address: self.address(),
                    source,
                })?;
        channel
            .exec(true, command)
            .await
            .map_err(|source| ExecError::Session {
                address: self.address(),
                source,
            })?;
        Ok(channel)
    }

    /// One command, combined stdout+stderr capture.
    async fn exec_collect(&self, command: &str) -> Result<String, ExecError> {
        let session = self.connect().await?;
        let mut channel = self.open_exec(&session, command).await?;

        let mut output = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }
        let _ = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        match status {
            Some(0) => Ok(String::from_utf8_lossy(&output).into_owned()),
            Some(status) => Err(ExecError::Command {
                command: command.to_string(),
                status,
            }),
            None => Err(ExecError::NoExitStatus {
                command: command.to_string(),
            }),
        }
    }

    /// One command, line-delimited streaming. Both streams and the exit
    /// status arrive on a single channel-message pump, which runs until the
    /// channel closes; that is the rendezvous point guaranteeing both drains
    /// have seen end-of-stream before this returns.
    async fn exec_stream(
        &self,
        command: &str,
        sinks: &mut OutputSinks<'_>,
    ) -> Result<(), ExecError> {
        let session = self.connect().await?;
        let mut channel = self.open_exec(&session, command).await?;

        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    stdout.extend(data, &mut |line| sinks.stdout_line(line));
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.extend(data, &mut |line| sinks.stderr_line(line));
                }
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }
        stdout.flush(&mut |line| sinks.stdout_line(line));
        stderr.flush(&mut |line| sinks.stderr_line(line));
        let _ = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        match status {
            Some(0) => Ok(()),
            Some(status) => Err(ExecError::Command {
                command: command.to_string(),
                status,
            }),
            None => Err(ExecError::NoExitStatus {
                command: command.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RemoteRunner for SshClient {
    async fn run(&self, commands: &[String]) -> Result<Vec<String>, BatchError> {
        let mut completed = Vec::with_capacity(commands.len());
        for command in commands {
            debug!(address = %self.address(), %command, "running command");
            match self.exec_collect(command).await {
                Ok(output) => completed.push(output),
                Err(source) => {
                    return Err(BatchError {
                        completed,
                        command: command.clone(),
                        source,
                    })
                }
            }
        }
        Ok(completed)
    }

    async fn run_stream(
        &self,
        commands: &[String],
        mut sinks: OutputSinks<'_>,
    ) -> Result<(), BatchError> {
        for command in commands {
            debug!(address = %self.address(), %command, "streaming command");
            if let Err(source) = self.exec_stream(command, &mut sinks).await {
                return Err(BatchError {
                    completed: Vec::new(),
                    command: command.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    async fn wait_for_ready(
        &self,
        logger: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), ExecError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connect().await {
                Ok(session) => {
                    let _ = session
                        .disconnect(Disconnect::ByApplication, "", "en")
                        .await;
                    return Ok(());
                }
                Err(source) if attempt >= READY_ATTEMPTS => {
                    return Err(ExecError::NotReady {
                        address: self.address(),
                        attempts: READY_ATTEMPTS,
                        source: Box::new(source),
                    });
                }
                Err(_) => {
                    logger(format!(
                        "waiting for ssh on {} ({attempt}/{READY_ATTEMPTS})",
                        self.address()
                    ));
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Accepts any server host key. Freshly provisioned hosts have no pinned
/// identity yet; verification is the caller's concern.
struct Acceptor;

#[async_trait]
impl client::Handler for Acceptor {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Re-frames a byte stream into lines, tolerating chunk boundaries that fall
/// mid-line. Carriage returns before the newline are stripped.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8], emit: &mut dyn FnMut(&str)) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            emit(&String::from_utf8_lossy(&line));
        }
    }

    /// Emits any trailing output that never saw a newline.
    fn flush(&mut self, emit: &mut dyn FnMut(&str)) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            emit(&String::from_utf8_lossy(&line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn collect_lines(chunks: &[&[u8]]) -> Vec<String> {
        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        for chunk in chunks {
            buffer.extend(chunk, &mut |line| lines.push(line.to_string()));
        }
        buffer.flush(&mut |line| lines.push(line.to_string()));
        lines
    }

    #[test]
    fn line_buffer_splits_lines_across_chunks() {
        let lines = collect_lines(&[b"hel", b"lo\nwor", b"ld\n"]);
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn line_buffer_strips_carriage_returns() {
        let lines = collect_lines(&[b"one\r\ntwo\r\n"]);
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn line_buffer_flushes_trailing_partial_line() {
        let lines = collect_lines(&[b"no newline"]);
        assert_eq!(lines, vec!["no newline"]);
    }

    #[test]
    fn split_sinks_route_streams_separately() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut out_sink = |line: &str| out.push(line.to_string());
        let mut err_sink = |line: &str| err.push(line.to_string());
        let mut sinks = OutputSinks::Split {
            stdout: &mut out_sink,
            stderr: &mut err_sink,
        };
        sinks.stdout_line("to stdout");
        sinks.stderr_line("to stderr");
        drop(sinks);
        assert_eq!(out, vec!["to stdout"]);
        assert_eq!(err, vec!["to stderr"]);
    }

    #[test]
    fn combined_sink_receives_both_streams() {
        let mut all = Vec::new();
        let mut sink = |line: &str| all.push(line.to_string());
        let mut sinks = OutputSinks::Combined(&mut sink);
        sinks.stdout_line("out");
        sinks.stderr_line("err");
        drop(sinks);
        assert_eq!(all, vec!["out", "err"]);
    }

    #[tokio::test]
    async fn wait_for_ready_exhausts_attempts_against_dead_host() {
        // Grab a loopback port that nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = SshClient::new(
            "127.0.0.1",
            port,
            "root",
            AuthMethod::Password("unused".to_string()),
        )
        .unwrap()
        .with_retry_delay(Duration::from_millis(5));

        let calls = AtomicU32::new(0);
        let logger = |_msg: String| {
            calls.fetch_add(1, Ordering::SeqCst);
        };
        let err = client.wait_for_ready(&logger).await.unwrap_err();

        // Logger fires on every failed attempt except the last.
        assert_eq!(calls.load(Ordering::SeqCst), READY_ATTEMPTS - 1);
        match err {
            ExecError::NotReady { attempts, .. } => assert_eq!(attempts, READY_ATTEMPTS),
            other => panic!("unexpected error: {other}"),
        }
    }
}
