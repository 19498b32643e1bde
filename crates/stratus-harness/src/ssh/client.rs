//! Prompt-following interactive SSH client
//!
//! Every remote surface of the platform is driven through this client:
//! plain command execution with exit codes, interactive expect sequences,
//! sudo escalation, and root login with prompt-stack tracking. The client
//! is transport-agnostic (see [`super::transport`]); unit tests run it
//! against an in-memory scripted shell.
//!
//! Within one client all commands are totally ordered. A client belongs to
//! one task at a time; the registry wraps clients in async mutexes.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::transport::{BoxedShellStream, ShellConnector};

/// Matches the platform's default user prompt, e.g. `controller-0:~$ `
pub const DEFAULT_PROMPT: &str = r"[\w.\-]+:[^\n]*\$ ?$";

/// Matches the root prompt after `sudo su -`, e.g. `controller-0:~# `
pub const ROOT_PROMPT: &str = r"[\w.\-]+:[^\n]*# ?$";

/// Matches the standard sudo password re-prompt
pub const PASSWORD_PROMPT: &str = r"[Pp]assword:? ?$";

/// Retry bounds for (re)connecting
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Give up after this much total time
    pub retry_timeout: Duration,
    /// Pause between attempts
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Options for one command execution
#[derive(Debug, Clone, Copy)]
pub struct ExecOpts {
    /// Prompt must return within this budget
    pub timeout: Duration,
    /// Probe `echo $?` after the command; when false the code is 0
    pub get_exit_code: bool,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            get_exit_code: true,
        }
    }
}

impl ExecOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Result of an [`SshClient::expect`] call
#[derive(Debug)]
pub struct ExpectMatch {
    /// Index into the pattern slice that matched
    pub pattern_index: usize,
    /// Everything received before the match
    pub before: String,
    /// The matched text itself
    pub matched: String,
}

/// An interactive shell on one host
pub struct SshClient {
    connector: Arc<dyn ShellConnector>,
    /// Password for sudo re-prompts
    password: String,
    /// Innermost shell's prompt is last; `sudo su -` pushes, `exit` pops
    prompt_stack: Vec<Regex>,
    stream: Option<BoxedShellStream>,
    /// Received bytes not yet consumed by a match
    buffer: String,
    last_exit_code: Option<i32>,
    /// Raw output of the last executed command
    cmd_output: String,
}

impl SshClient {
    /// Build a client. `prompt` overrides [`DEFAULT_PROMPT`] for labs with
    /// customized shells.
    pub fn new(
        connector: Arc<dyn ShellConnector>,
        prompt: Option<&str>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let prompt_re = Regex::new(prompt.unwrap_or(DEFAULT_PROMPT))?;
        Ok(Self {
            connector,
            password: password.into(),
            prompt_stack: vec![prompt_re],
            stream: None,
            buffer: String::new(),
            last_exit_code: None,
            cmd_output: String::new(),
        })
    }

    pub fn host(&self) -> &str {
        self.connector.host()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Raw output of the last command, for callers that parse interactively
    pub fn cmd_output(&self) -> &str {
        &self.cmd_output
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    fn prompt(&self) -> Regex {
        // Stack is never empty; the base prompt is pushed at construction.
        self.prompt_stack.last().expect("prompt stack").clone()
    }

    /// Open the shell and wait for the prompt. Idempotent; retries up to
    /// the policy's budget and fails with [`Error::SshRetryTimeout`].
    pub async fn connect(&mut self, policy: RetryPolicy) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let start = Instant::now();
        loop {
            match self.try_connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if start.elapsed() + policy.retry_interval > policy.retry_timeout {
                        warn!(host = %self.host(), error = %e, "ssh connect retries exhausted");
                        return Err(Error::SshRetryTimeout {
                            host: self.host().to_string(),
                            waited: start.elapsed(),
                        });
                    }
                    debug!(host = %self.host(), error = %e, "ssh connect failed, retrying");
                    tokio::time::sleep(policy.retry_interval).await;
                }
            }
        }
    }

    async fn try_connect_once(&mut self) -> Result<()> {
        let stream = self.connector.open().await?;
        self.stream = Some(stream);
        self.buffer.clear();
        let prompt = self.prompt();
        match self.expect(&[&prompt], Duration::from_secs(30)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Drop the channel and dial again. Used after host reboots and swacts.
    pub async fn reconnect(&mut self, policy: RetryPolicy) -> Result<()> {
        self.close().await;
        // A reboot may have dropped us out of any nested shells.
        self.prompt_stack.truncate(1);
        self.connect(policy).await
    }

    /// Close the channel. Safe to call when already closed.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.buffer.clear();
    }

    /// Send raw text (no newline appended)
    pub async fn send(&mut self, text: &str) -> Result<()> {
        let host = self.host().to_string();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ssh(&host, "not connected"))?;
        stream
            .write_all(text.as_bytes())
            .await
            .map_err(|e| Error::ssh(&host, format!("write: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::ssh(&host, format!("flush: {e}")))?;
        Ok(())
    }

    /// Send one line
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send(&format!("{line}\n")).await
    }

    /// Wait until any pattern matches the pending output.
    ///
    /// Returns the index of the first pattern to match (earliest match in
    /// the stream wins), the text before the match, and the match itself.
    /// Matched text and everything before it are consumed from the buffer.
    pub async fn expect(&mut self, patterns: &[&Regex], timeout: Duration) -> Result<ExpectMatch> {
        let deadline = Instant::now() + timeout;
        loop {
            // Earliest match across all patterns wins.
            let mut best: Option<(usize, usize, usize)> = None;
            for (i, re) in patterns.iter().enumerate() {
                if let Some(m) = re.find(&self.buffer) {
                    let better = match best {
                        Some((_, start, _)) => m.start() < start,
                        None => true,
                    };
                    if better {
                        best = Some((i, m.start(), m.end()));
                    }
                }
            }
            if let Some((idx, start, end)) = best {
                let before = self.buffer[..start].to_string();
                let matched = self.buffer[start..end].to_string();
                self.buffer.drain(..end);
                return Ok(ExpectMatch {
                    pattern_index: idx,
                    before,
                    matched,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let pattern = patterns
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(" | ");
                return Err(Error::ExpectTimeout {
                    host: self.host().to_string(),
                    pattern,
                    waited: timeout,
                });
            }
            self.read_more(remaining).await?;
        }
    }

    /// Read at least one chunk into the buffer, normalizing CRLF.
    async fn read_more(&mut self, timeout: Duration) -> Result<()> {
        let host = self.host().to_string();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ssh(&host, "not connected"))?;
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| Error::ExpectTimeout {
                host: host.clone(),
                pattern: "<pending read>".to_string(),
                waited: timeout,
            })?
            .map_err(|e| Error::ssh(&host, format!("read: {e}")))?;
        if n == 0 {
            self.stream = None;
            return Err(Error::ssh(&host, "channel closed by remote"));
        }
        let text = String::from_utf8_lossy(&chunk[..n]);
        self.buffer.extend(text.chars().filter(|c| *c != '\r'));
        Ok(())
    }

    /// Drain anything the remote side has already sent, returning it.
    /// Used before a command so stale output cannot pollute parsing, and
    /// after reboots to swallow console noise.
    pub async fn flush(&mut self) -> Result<String> {
        let mut drained = std::mem::take(&mut self.buffer);
        loop {
            match self.read_more(Duration::from_millis(100)).await {
                Ok(()) => drained.push_str(&std::mem::take(&mut self.buffer)),
                Err(Error::ExpectTimeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(drained)
    }

    /// Run `cmd` and surface `(exit_code, combined_output)` without judging
    /// the code. The command echo is stripped from the output.
    pub async fn try_exec(&mut self, cmd: &str, opts: ExecOpts) -> Result<(i32, String)> {
        self.flush().await?;
        self.send_line(cmd).await?;
        let prompt = self.prompt();
        let m = self.expect(&[&prompt], opts.timeout).await?;
        let output = strip_echo(&m.before);
        self.cmd_output = output.clone();

        let code = if opts.get_exit_code {
            self.probe_exit_code(opts.timeout).await?
        } else {
            0
        };
        self.last_exit_code = Some(code);
        debug!(host = %self.host(), cmd, code, "executed");
        Ok((code, output))
    }

    /// Run `cmd`, failing with [`Error::CommandFailed`] on non-zero exit.
    pub async fn exec(&mut self, cmd: &str, opts: ExecOpts) -> Result<String> {
        let (code, output) = self.try_exec(cmd, opts).await?;
        if code != 0 {
            return Err(Error::CommandFailed {
                command: cmd.to_string(),
                exit_code: code,
                output,
            });
        }
        Ok(output)
    }

    async fn probe_exit_code(&mut self, timeout: Duration) -> Result<i32> {
        self.send_line("echo $?").await?;
        let prompt = self.prompt();
        let m = self.expect(&[&prompt], timeout).await?;
        let text = strip_echo(&m.before);
        text.lines()
            .find_map(|l| l.trim().parse::<i32>().ok())
            .ok_or_else(|| {
                Error::ssh(
                    self.host(),
                    format!("could not parse exit code from {text:?}"),
                )
            })
    }

    /// Send `sudo <cmd>` and answer the password re-prompt if one appears.
    /// Does not wait for the command to finish; callers follow up with
    /// [`Self::expect`]. Used for interactive sequences like `reboot -f`.
    pub async fn send_sudo(&mut self, cmd: &str, timeout: Duration) -> Result<()> {
        self.flush().await?;
        self.send_line(&format!("sudo {cmd}")).await?;
        let password_re = Regex::new(PASSWORD_PROMPT)?;
        // The re-prompt only appears when the sudo ticket has expired.
        match self.expect(&[&password_re], timeout).await {
            Ok(_) => {
                let password = self.password.clone();
                self.send_line(&password).await?;
                Ok(())
            }
            Err(Error::ExpectTimeout { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run a command under sudo, surfacing `(exit_code, output)`
    pub async fn try_exec_sudo(&mut self, cmd: &str, opts: ExecOpts) -> Result<(i32, String)> {
        self.flush().await?;
        self.send_line(&format!("sudo {cmd}")).await?;
        let prompt = self.prompt();
        let password_re = Regex::new(PASSWORD_PROMPT)?;
        let m = self.expect(&[&password_re, &prompt], opts.timeout).await?;
        let before = if m.pattern_index == 0 {
            let password = self.password.clone();
            self.send_line(&password).await?;
            self.expect(&[&prompt], opts.timeout).await?.before
        } else {
            m.before
        };
        let output = strip_echo(&before);
        self.cmd_output = output.clone();
        let code = if opts.get_exit_code {
            self.probe_exit_code(opts.timeout).await?
        } else {
            0
        };
        self.last_exit_code = Some(code);
        Ok((code, output))
    }

    /// Run a command under sudo, failing on non-zero exit
    pub async fn exec_sudo(&mut self, cmd: &str, opts: ExecOpts) -> Result<String> {
        let (code, output) = self.try_exec_sudo(cmd, opts).await?;
        if code != 0 {
            return Err(Error::CommandFailed {
                command: format!("sudo {cmd}"),
                exit_code: code,
                output,
            });
        }
        Ok(output)
    }

    /// Escalate to a root shell with `sudo su -`, pushing the root prompt.
    pub async fn login_as_root(&mut self, timeout: Duration) -> Result<()> {
        self.flush().await?;
        self.send_line("sudo su -").await?;
        let root_re = Regex::new(ROOT_PROMPT)?;
        let password_re = Regex::new(PASSWORD_PROMPT)?;
        let m = self.expect(&[&password_re, &root_re], timeout).await?;
        if m.pattern_index == 0 {
            let password = self.password.clone();
            self.send_line(&password).await?;
            self.expect(&[&root_re], timeout).await?;
        }
        self.prompt_stack.push(root_re);
        Ok(())
    }

    /// Leave the root shell entered by [`Self::login_as_root`]
    pub async fn exit_root(&mut self, timeout: Duration) -> Result<()> {
        if self.prompt_stack.len() < 2 {
            return Err(Error::Misuse("exit_root without login_as_root".to_string()));
        }
        self.prompt_stack.pop();
        self.send_line("exit").await?;
        let prompt = self.prompt();
        self.expect(&[&prompt], timeout).await?;
        Ok(())
    }

    /// Whether `path` exists on the host
    pub async fn file_exists(&mut self, path: &str) -> Result<bool> {
        let (code, _) = self
            .try_exec(&format!("test -e '{path}'"), ExecOpts::default())
            .await?;
        Ok(code == 0)
    }
}

/// Drop the echoed command line (first line) from captured output.
fn strip_echo(before: &str) -> String {
    match before.split_once('\n') {
        Some((_echo, rest)) => rest.trim_end_matches('\n').to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::transport::BoxedShellStream;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const PROMPT: &str = "controller-0:~$ ";
    const ROOT: &str = "controller-0:~# ";

    /// Scripted shell: replies to known command lines, echoes input like a
    /// pty, tracks `echo $?` against the last scripted exit code.
    async fn fake_shell(server: DuplexStream, responses: Vec<(&'static str, &'static str, i32)>) {
        let (read_half, mut write_half) = tokio::io::split(server);
        let mut lines = BufReader::new(read_half).lines();
        write_half.write_all(PROMPT.as_bytes()).await.unwrap();
        let mut last_code = 0i32;
        let mut in_root = false;
        while let Ok(Some(line)) = lines.next_line().await {
            let prompt = if in_root { ROOT } else { PROMPT };
            if line == "echo $?" {
                let reply = format!("echo $?\r\n{last_code}\r\n{prompt}");
                write_half.write_all(reply.as_bytes()).await.unwrap();
                continue;
            }
            if line == "sudo su -" {
                in_root = true;
                let reply = format!("sudo su -\r\n{ROOT}");
                write_half.write_all(reply.as_bytes()).await.unwrap();
                continue;
            }
            if line == "exit" && in_root {
                in_root = false;
                let reply = format!("exit\r\nlogout\r\n{PROMPT}");
                write_half.write_all(reply.as_bytes()).await.unwrap();
                continue;
            }
            let (output, code) = responses
                .iter()
                .find(|(cmd, _, _)| *cmd == line)
                .map(|(_, out, code)| (*out, *code))
                .unwrap_or(("", 0));
            last_code = code;
            let mut reply = format!("{line}\r\n");
            if !output.is_empty() {
                reply.push_str(&output.replace('\n', "\r\n"));
                reply.push_str("\r\n");
            }
            reply.push_str(prompt);
            write_half.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    struct FakeConnector {
        streams: Mutex<Vec<DuplexStream>>,
    }

    impl FakeConnector {
        fn new(streams: Vec<DuplexStream>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams),
            })
        }
    }

    #[async_trait]
    impl ShellConnector for FakeConnector {
        async fn open(&self) -> Result<BoxedShellStream> {
            let stream = self
                .streams
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| Error::ssh("fake", "no more streams"))?;
            Ok(Box::new(stream))
        }

        fn host(&self) -> &str {
            "fake"
        }
    }

    fn client_with_script(
        responses: Vec<(&'static str, &'static str, i32)>,
    ) -> SshClient {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_shell(server_end, responses));
        let connector = FakeConnector::new(vec![client_end]);
        SshClient::new(connector, None, "Li69nux*").unwrap()
    }

    #[tokio::test]
    async fn connect_waits_for_prompt_and_is_idempotent() {
        let mut ssh = client_with_script(vec![]);
        ssh.connect(RetryPolicy::default()).await.unwrap();
        assert!(ssh.is_connected());
        // Second connect is a no-op.
        ssh.connect(RetryPolicy::default()).await.unwrap();
    }

    #[tokio::test]
    async fn exec_returns_output_and_exit_code() {
        let mut ssh = client_with_script(vec![
            ("hostname", "controller-0", 0),
            ("false", "", 1),
        ]);
        ssh.connect(RetryPolicy::default()).await.unwrap();

        let (code, out) = ssh.try_exec("hostname", ExecOpts::default()).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "controller-0");
        assert_eq!(ssh.cmd_output(), "controller-0");

        let (code, _) = ssh.try_exec("false", ExecOpts::default()).await.unwrap();
        assert_eq!(code, 1);
        assert_eq!(ssh.last_exit_code(), Some(1));
    }

    #[tokio::test]
    async fn exec_raises_on_nonzero_exit() {
        let mut ssh = client_with_script(vec![(
            "system host-lock controller-0",
            "Avoiding lock action",
            1,
        )]);
        ssh.connect(RetryPolicy::default()).await.unwrap();
        let err = ssh
            .exec("system host-lock controller-0", ExecOpts::default())
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed {
                command,
                exit_code,
                output,
            } => {
                assert_eq!(command, "system host-lock controller-0");
                assert_eq!(exit_code, 1);
                assert!(output.contains("Avoiding lock action"));
            }
            other => panic!("expected CommandFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn multiline_output_is_preserved() {
        let mut ssh = client_with_script(vec![(
            "cat /etc/build.info",
            "SW_VERSION=\"24.09\"\nBUILD_TARGET=\"Host Installer\"",
            0,
        )]);
        ssh.connect(RetryPolicy::default()).await.unwrap();
        let out = ssh
            .exec("cat /etc/build.info", ExecOpts::default())
            .await
            .unwrap();
        assert_eq!(out, "SW_VERSION=\"24.09\"\nBUILD_TARGET=\"Host Installer\"");
    }

    #[tokio::test]
    async fn root_login_pushes_and_pops_prompt() {
        let mut ssh = client_with_script(vec![("id -u", "0", 0)]);
        ssh.connect(RetryPolicy::default()).await.unwrap();
        ssh.login_as_root(Duration::from_secs(5)).await.unwrap();
        let out = ssh.exec("id -u", ExecOpts::default()).await.unwrap();
        assert_eq!(out, "0");
        ssh.exit_root(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            ssh.exit_root(Duration::from_secs(1)).await,
            Err(Error::Misuse(_))
        ));
    }

    #[tokio::test]
    async fn file_exists_maps_exit_codes() {
        let mut ssh = client_with_script(vec![
            ("test -e '/etc/build.info'", "", 0),
            ("test -e '/no/such/file'", "", 1),
        ]);
        ssh.connect(RetryPolicy::default()).await.unwrap();
        assert!(ssh.file_exists("/etc/build.info").await.unwrap());
        assert!(!ssh.file_exists("/no/such/file").await.unwrap());
    }

    #[tokio::test]
    async fn expect_times_out_with_pattern_context() {
        let mut ssh = client_with_script(vec![]);
        ssh.connect(RetryPolicy::default()).await.unwrap();
        let re = Regex::new("never-appears").unwrap();
        let err = ssh
            .expect(&[&re], Duration::from_millis(200))
            .await
            .unwrap_err();
        match err {
            Error::ExpectTimeout { pattern, .. } => assert!(pattern.contains("never-appears")),
            other => panic!("expected ExpectTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn connect_retries_until_budget_exhausted() {
        // Connector with no streams fails every attempt.
        let connector = FakeConnector::new(vec![]);
        let mut ssh = SshClient::new(connector, None, "pw").unwrap();
        let policy = RetryPolicy {
            retry_timeout: Duration::from_millis(300),
            retry_interval: Duration::from_millis(100),
        };
        let err = ssh.connect(policy).await.unwrap_err();
        assert!(matches!(err, Error::SshRetryTimeout { .. }));
    }

    #[tokio::test]
    async fn reconnect_uses_a_fresh_stream() {
        let (c1, s1) = tokio::io::duplex(64 * 1024);
        let (c2, s2) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_shell(s1, vec![("hostname", "controller-0", 0)]));
        tokio::spawn(fake_shell(s2, vec![("hostname", "controller-0", 0)]));
        // Streams pop LIFO: c2 is used first, then c1 after reconnect.
        let connector = FakeConnector::new(vec![c1, c2]);
        let mut ssh = SshClient::new(connector, None, "pw").unwrap();
        ssh.connect(RetryPolicy::default()).await.unwrap();
        ssh.exec("hostname", ExecOpts::default()).await.unwrap();
        ssh.reconnect(RetryPolicy::default()).await.unwrap();
        let out = ssh.exec("hostname", ExecOpts::default()).await.unwrap();
        assert_eq!(out, "controller-0");
    }
}
