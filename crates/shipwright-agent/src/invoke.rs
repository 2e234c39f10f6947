//! The lifecycle manager proper: spawn, pump, time out, kill, classify.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use shipwright_config::Config;
use shipwright_redaction::SecretRedactor;
use shipwright_utils::types::Provider;

use crate::command;
use crate::env;
use crate::logger::EventLogger;
use crate::stream::{AgentEvent, StreamParser};
use crate::types::{
    AgentBackend, AgentRequest, AgentResult, AgentStatus, TimeoutKind,
};

/// Grace window between the TERM and KILL phases of a tree kill.
const KILL_GRACE: Duration = Duration::from_millis(1200);
/// Outer safety window: the call resolves within this bound even if the OS
/// exit notification is lost.
const EXIT_SAFETY: Duration = Duration::from_secs(3);

static RATE_LIMIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|\b429\b|quota|overloaded")
        .unwrap_or_else(|e| panic!("invalid rate-limit regex: {e}"))
});

/// Production [`AgentBackend`]: drives the configured agent CLI as a
/// subprocess in its own process group.
pub struct CliAgent {
    claude_binary: Option<PathBuf>,
    codex_binary: Option<PathBuf>,
    redactor: Arc<SecretRedactor>,
    grace: Duration,
    safety: Duration,
}

impl CliAgent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            claude_binary: None,
            codex_binary: None,
            redactor: Arc::new(SecretRedactor::new()),
            grace: KILL_GRACE,
            safety: EXIT_SAFETY,
        }
    }

    /// Build from configuration: binary paths come from the config, PATH
    /// lookup covers the rest.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            claude_binary: config.claude_binary.clone(),
            codex_binary: config.codex_binary.clone(),
            redactor: Arc::new(SecretRedactor::new()),
            grace: KILL_GRACE,
            safety: EXIT_SAFETY,
        }
    }

    /// Pin the binary used for one provider.
    #[must_use]
    pub fn with_binary(mut self, provider: Provider, path: impl Into<PathBuf>) -> Self {
        match provider {
            Provider::Claude => self.claude_binary = Some(path.into()),
            Provider::Codex => self.codex_binary = Some(path.into()),
        }
        self
    }

    /// Use a specific redactor for transcript scrubbing.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Arc<SecretRedactor>) -> Self {
        self.redactor = redactor;
        self
    }

    /// Shrink the kill grace window. Test seam; not part of the stable API.
    #[doc(hidden)]
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn configured_binary(&self, provider: Provider) -> Option<&std::path::Path> {
        match provider {
            Provider::Claude => self.claude_binary.as_deref(),
            Provider::Codex => self.codex_binary.as_deref(),
        }
    }

    async fn run(&self, request: &AgentRequest) -> AgentResult {
        let started = Instant::now();

        let invocation =
            match command::build_invocation(request, self.configured_binary(request.provider)) {
                Ok(inv) => inv,
                Err(reason) => return AgentResult::spawn_failure(reason, started.elapsed()),
            };

        let mut cmd = Command::new(&invocation.binary);
        cmd.args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(env::allowlisted_env())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        // Detach into its own process group so a tree kill reaches every
        // descendant the agent spawned.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AgentResult::spawn_failure(
                    format!(
                        "failed to spawn {}: {e}",
                        invocation.binary.display()
                    ),
                    started.elapsed(),
                );
            }
        };

        // The prompt travels on stdin. The write runs detached so a child
        // that never reads cannot stall the timer loop; a broken pipe from
        // a child that exits early surfaces through exit classification,
        // not as a spawn failure.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "agent stdin write failed");
                }
                drop(stdin);
            });
        }

        let Some(mut stdout_pipe) = child.stdout.take() else {
            kill_process_tree(&mut child, self.grace, self.safety).await;
            return AgentResult::spawn_failure("failed to capture stdout", started.elapsed());
        };
        let Some(mut stderr_pipe) = child.stderr.take() else {
            kill_process_tree(&mut child, self.grace, self.safety).await;
            return AgentResult::spawn_failure("failed to capture stderr", started.elapsed());
        };

        let mut logger = EventLogger::open(&request.log_targets, Arc::clone(&self.redactor));
        let mut pump = StdoutPump::default();
        let mut stderr_text = String::new();

        let single_deadline = request.timeouts.single.map(|d| started + d);
        let hard_deadline = request.timeouts.hard.map(|d| started + d);
        let mut idle_deadline = request.timeouts.idle.map(|d| Instant::now() + d);

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut buf_out = vec![0u8; 8192];
        let mut buf_err = vec![0u8; 8192];
        let mut fired: Option<TimeoutKind> = None;

        while stdout_open || stderr_open {
            let deadline = next_deadline(single_deadline, idle_deadline, hard_deadline);
            let (deadline_kind, deadline_at) =
                deadline.unwrap_or((TimeoutKind::Hard, far_future()));

            tokio::select! {
                read = stdout_pipe.read(&mut buf_out), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(n) => {
                        if let Some(idle) = request.timeouts.idle {
                            idle_deadline = Some(Instant::now() + idle);
                        }
                        let events = pump.accept(&buf_out[..n]);
                        logger.log_events(&events);
                    }
                },
                read = stderr_pipe.read(&mut buf_err), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => stderr_text.push_str(&String::from_utf8_lossy(&buf_err[..n])),
                },
                () = tokio::time::sleep_until(deadline_at), if deadline.is_some() => {
                    fired = Some(deadline_kind);
                    break;
                }
            }
        }

        let exit_status = if fired.is_some() {
            kill_process_tree(&mut child, self.grace, self.safety).await;
            // Pick up whatever the tree flushed before dying.
            drain_pipes(
                &mut stdout_pipe,
                &mut stderr_pipe,
                stdout_open,
                stderr_open,
                &mut pump,
                &mut logger,
                &mut stderr_text,
            )
            .await;
            None
        } else {
            match tokio::time::timeout(self.safety, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!(error = %e, "wait on agent process failed");
                    kill_process_tree(&mut child, self.grace, self.safety).await;
                    None
                }
                Err(_) => {
                    warn!("agent exit notification lost; forcing kill");
                    kill_process_tree(&mut child, self.grace, self.safety).await;
                    None
                }
            }
        };

        let trailing = pump.finish();
        logger.log_events(&trailing);

        if pump.parser.dropped_lines() > 0 {
            debug!(
                dropped = pump.parser.dropped_lines(),
                "dropped unrecognized stream lines"
            );
        }

        let duration = started.elapsed();
        let (status, exit_code) = classify(fired, exit_status, &stderr_text);

        AgentResult {
            status,
            stdout: pump.raw,
            stderr: stderr_text,
            exit_code,
            timeout_kind: fired,
            final_text: pump.parser.final_text().to_string(),
            token_usage: pump.parser.usage(),
            duration,
        }
    }
}

impl Default for CliAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AgentBackend for CliAgent {
    async fn invoke(&self, request: &AgentRequest) -> AgentResult {
        self.run(request).await
    }
}

/// Decodes stdout bytes into lines for the parser while keeping the raw
/// transcript. Splitting happens at newline boundaries only, so a
/// multi-byte character can never straddle a decode.
#[derive(Default)]
struct StdoutPump {
    parser: StreamParser,
    pending: Vec<u8>,
    raw: String,
}

impl StdoutPump {
    fn accept(&mut self, bytes: &[u8]) -> Vec<AgentEvent> {
        self.pending.extend_from_slice(bytes);
        let Some(pos) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.pending.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&complete).into_owned();
        self.raw.push_str(&text);
        self.parser.push(&text)
    }

    fn finish(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let text =
                String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
            self.raw.push_str(&text);
            events.extend(self.parser.push(&text));
        }
        events.extend(self.parser.finish());
        events
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

fn next_deadline(
    single: Option<Instant>,
    idle: Option<Instant>,
    hard: Option<Instant>,
) -> Option<(TimeoutKind, Instant)> {
    let mut next: Option<(TimeoutKind, Instant)> = None;
    for (kind, at) in [
        (TimeoutKind::Single, single),
        (TimeoutKind::Idle, idle),
        (TimeoutKind::Hard, hard),
    ] {
        if let Some(at) = at {
            match next {
                Some((_, best)) if best <= at => {}
                _ => next = Some((kind, at)),
            }
        }
    }
    next
}

fn classify(
    fired: Option<TimeoutKind>,
    exit_status: Option<std::process::ExitStatus>,
    stderr: &str,
) -> (AgentStatus, Option<i32>) {
    if fired.is_some() {
        return (AgentStatus::Timeout, None);
    }
    match exit_status {
        Some(status) if status.code() == Some(0) => (AgentStatus::Done, Some(0)),
        Some(status) => {
            let code = status.code();
            if RATE_LIMIT_RE.is_match(stderr) {
                (AgentStatus::RateLimited, code)
            } else {
                (AgentStatus::Failed, code)
            }
        }
        None => (AgentStatus::Failed, None),
    }
}

/// Two-phase tree kill: TERM the group and the direct child, wait the
/// grace window, escalate to KILL, then bound the final wait with the
/// safety window so the call always resolves.
async fn kill_process_tree(child: &mut Child, grace: Duration, safety: Duration) {
    let pid = child.id();
    signal_tree(pid, child, false);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    signal_tree(pid, child, true);
    if tokio::time::timeout(safety, child.wait()).await.is_err() {
        warn!("agent process did not confirm exit within the safety window");
    }
}

#[cfg(unix)]
fn signal_tree(pid: Option<u32>, child: &mut Child, force: bool) {
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Some(pid) = pid {
        let pid = Pid::from_raw(pid as i32);
        // The child is its own group leader after setpgid(0, 0); signal
        // the group first, then the direct child for good measure.
        let _ = killpg(pid, signal);
        let _ = kill(pid, signal);
    } else if force {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn signal_tree(_pid: Option<u32>, child: &mut Child, force: bool) {
    // No process groups here; the direct kill is all we have.
    if force {
        let _ = child.start_kill();
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_pipes(
    stdout_pipe: &mut tokio::process::ChildStdout,
    stderr_pipe: &mut tokio::process::ChildStderr,
    mut stdout_open: bool,
    mut stderr_open: bool,
    pump: &mut StdoutPump,
    logger: &mut EventLogger,
    stderr_text: &mut String,
) {
    let mut buf_out = vec![0u8; 8192];
    let mut buf_err = vec![0u8; 8192];
    let _ = tokio::time::timeout(Duration::from_millis(100), async {
        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout_pipe.read(&mut buf_out), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(n) => {
                        let events = pump.accept(&buf_out[..n]);
                        logger.log_events(&events);
                    }
                },
                read = stderr_pipe.read(&mut buf_err), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => stderr_text.push_str(&String::from_utf8_lossy(&buf_err[..n])),
                },
                else => break,
            }
        }
    })
    .await;
}
