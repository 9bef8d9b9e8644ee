use crate::config::RetryPolicy;
use crate::error::{scrub_message, BridgeError, BridgeResult};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// One call into the external UI-scripting layer. Implementations run the
/// script exactly once; retries belong to [`AutomationExecutor`].
pub trait ScriptRunner: Send + Sync {
    fn run(&self, script: &str, args: &[String]) -> Result<String, String>;
}

/// Runs AppleScript through `osascript`, killing it after `timeout`.
#[derive(Debug, Clone)]
pub struct OsascriptRunner {
    timeout: Duration,
}

impl OsascriptRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ScriptRunner for OsascriptRunner {
    fn run(&self, script: &str, args: &[String]) -> Result<String, String> {
        if !cfg!(target_os = "macos") {
            return Err("unsupported_platform: osascript requires macOS".to_string());
        }

        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(script);
        if !args.is_empty() {
            cmd.arg("--");
            for arg in args {
                cmd.arg(arg);
            }
        }
        cmd.stdin(Stdio::null());

        let output = run_captured("osascript", &mut cmd, self.timeout)?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let code = output.status.code().unwrap_or(1);
        Err(if stderr.is_empty() {
            format!("osascript failed with status {code}")
        } else {
            stderr
        })
    }
}

struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Spawns `cmd` with piped output and waits up to `timeout`, killing the
/// child on expiry. Both pipes are drained on their own threads while the
/// child runs, so output larger than the pipe buffer cannot stall it.
fn run_captured(program: &str, cmd: &mut Command, timeout: Duration) -> Result<Captured, String> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|err| format!("{program} spawn failed: {err}"))?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let waited = child.wait_timeout(timeout);
    let status = match waited {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(format!("{program} timed out after {}s", timeout.as_secs()))
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(format!("{program} wait failed: {err}"))
        }
    };
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    Ok(Captured {
        status: status?,
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Uniform result shape of one executor call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

impl ExecOutcome {
    pub fn into_result(self) -> BridgeResult<String> {
        if self.success {
            return Ok(self.data.unwrap_or_default());
        }
        Err(classify_failure(self.error.as_deref().unwrap_or("unknown failure")))
    }
}

fn transient_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\bbusy\b|timed out|timeout|not running|isn't running|\(-600\)|-609\b|network|connection|temporarily unavailable",
        )
        .expect("transient pattern")
    })
}

fn not_accessible_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)assistive access|not authori[sz]ed|not permitted|-1719\b|-1743\b|-25211\b",
        )
        .expect("accessibility pattern")
    })
}

fn not_running_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)not running|isn't running|\(-600\)|process_not_found|no_windows")
            .expect("not running pattern")
    })
}

/// Whether a failure message looks like it could succeed on a later attempt.
pub fn is_transient(message: &str) -> bool {
    !not_accessible_re().is_match(message) && transient_re().is_match(message)
}

pub fn classify_failure(message: &str) -> BridgeError {
    let clean = scrub_message(message);
    if not_accessible_re().is_match(message) {
        BridgeError::AppNotAccessible(clean)
    } else if not_running_re().is_match(message) {
        BridgeError::AppNotRunning(clean)
    } else {
        BridgeError::Automation(clean)
    }
}

/// `min(base * 2^attempt, max_delay)`, before jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    policy
        .base_delay
        .checked_mul(factor)
        .unwrap_or(policy.max_delay)
        .min(policy.max_delay)
}

fn jitter(policy: &RetryPolicy) -> Duration {
    let max_ms = policy.max_jitter.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Issues UI-automation calls with bounded retries on transient failures.
#[derive(Clone)]
pub struct AutomationExecutor {
    runner: Arc<dyn ScriptRunner>,
    policy: RetryPolicy,
}

impl AutomationExecutor {
    pub fn new(runner: Arc<dyn ScriptRunner>, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn execute(&self, script: &str, args: &[String]) -> ExecOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::from("script was not executed");

        for attempt in 0..max_attempts {
            match self.runner.run(script, args) {
                Ok(data) => {
                    return ExecOutcome {
                        success: true,
                        data: Some(data),
                        error: None,
                        attempts: attempt + 1,
                    }
                }
                Err(message) => {
                    last_error = message;
                }
            }

            let retryable = is_transient(&last_error);
            if !retryable || attempt + 1 >= max_attempts {
                warn!(
                    attempts = attempt + 1,
                    retryable,
                    error = %scrub_message(&last_error),
                    "ui automation failed"
                );
                return ExecOutcome {
                    success: false,
                    data: None,
                    error: Some(last_error),
                    attempts: attempt + 1,
                };
            }

            let delay = backoff_delay(&self.policy, attempt) + jitter(&self.policy);
            debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %scrub_message(&last_error),
                "transient ui automation failure, retrying"
            );
            thread::sleep(delay);
        }

        ExecOutcome {
            success: false,
            data: None,
            error: Some(last_error),
            attempts: max_attempts,
        }
    }

    pub fn run(&self, script: &str, args: &[String]) -> BridgeResult<String> {
        self.execute(script, args).into_result()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ScriptRunner;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays queued results and records every script it was handed.
    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: Mutex<VecDeque<Result<String, String>>>,
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ScriptRunner for ScriptedRunner {
        fn run(&self, script: &str, args: &[String]) -> Result<String, String> {
            self.calls
                .lock()
                .unwrap()
                .push((script.to_string(), args.to_vec()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("no scripted reply".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_larger_than_a_pipe_buffer() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("head -c 300000 /dev/zero | tr '\\0' x; echo done >&2");
        let output = run_captured("sh", &mut cmd, Duration::from_secs(20)).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), 300_000);
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "done");
    }

    #[cfg(unix)]
    #[test]
    fn kills_children_that_overrun() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 5");
        let err = run_captured("sh", &mut cmd, Duration::from_millis(100))
            .err()
            .unwrap();
        assert!(err.contains("sh timed out"));
    }

    #[test]
    fn returns_data_on_first_success() {
        let runner = Arc::new(ScriptedRunner::new(vec![Ok("hello")]));
        let executor = AutomationExecutor::new(runner.clone(), fast_policy());
        let outcome = executor.execute("return \"hello\"", &[]);
        assert!(outcome.success);
        assert_eq!(outcome.data.as_deref(), Some("hello"));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(runner.call_count(), 1);
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Err("application is busy"),
            Err("osascript timed out after 60s"),
            Ok("done"),
        ]));
        let executor = AutomationExecutor::new(runner.clone(), fast_policy());
        let outcome = executor.execute("x", &[]);
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(runner.call_count(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Err("network hiccup"),
            Err("network hiccup"),
            Err("network hiccup"),
            Ok("never reached"),
        ]));
        let executor = AutomationExecutor::new(runner.clone(), fast_policy());
        let outcome = executor.execute("x", &[]);
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(runner.call_count(), 3);
        assert!(matches!(outcome.into_result(), Err(BridgeError::Automation(_))));
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let runner = Arc::new(ScriptedRunner::new(vec![Err(
            "System Events got an error: osascript is not allowed assistive access. (-1719)",
        )]));
        let executor = AutomationExecutor::new(runner.clone(), fast_policy());
        let outcome = executor.execute("x", &[]);
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.into_result(),
            Err(BridgeError::AppNotAccessible(_))
        ));

        let runner = Arc::new(ScriptedRunner::new(vec![Err("Can't find button 7")]));
        let executor = AutomationExecutor::new(runner.clone(), fast_policy());
        assert_eq!(executor.execute("x", &[]).attempts, 1);
    }

    #[test]
    fn not_running_is_retried_and_classified() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Err("ChatGPT got an error: Application isn't running. (-600)"),
            Err("ChatGPT got an error: Application isn't running. (-600)"),
            Err("ChatGPT got an error: Application isn't running. (-600)"),
        ]));
        let executor = AutomationExecutor::new(runner.clone(), fast_policy());
        let err = executor.run("x", &[]).unwrap_err();
        assert_eq!(runner.call_count(), 3);
        assert!(matches!(err, BridgeError::AppNotRunning(_)));
        assert!(err.hint().is_some());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(5));
        assert_eq!(backoff_delay(&policy, 40), Duration::from_secs(5));
    }

    #[test]
    fn osascript_runner_refuses_off_macos() {
        if cfg!(target_os = "macos") {
            return;
        }
        let runner = OsascriptRunner::new(Duration::from_secs(1));
        let err = runner.run("return 1", &[]).unwrap_err();
        assert!(err.contains("unsupported_platform"));
        assert!(!is_transient(&err));
        assert!(matches!(classify_failure(&err), BridgeError::Automation(_)));
    }
}
