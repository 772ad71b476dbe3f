//! Subprocess transport
//!
//! Runs a module in an isolated interpreter process. Arguments travel as
//! argv (`--input "1,2,3"`) or as a JSON document on stdin; the result is a
//! JSON document on stdout. A non-zero exit is a [`BridgeError::Subprocess`]
//! whatever stdout holds, and stdout is decoded only after a clean exit.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::conversion::{parse_json, to_json};
use crate::error::{BridgeError, BridgeResult};
use crate::state::ContractRegistry;
use crate::value::{Mapping, Value};

/// Poll interval while waiting on a child with a deadline
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long pipe threads of a killed child get to finish
const SETTLE_GRACE: Duration = Duration::from_millis(250);

/// One external process invocation.
#[derive(Debug, Clone, Default)]
pub struct ExternalInvocation {
    /// Script passed as the first argument, if any
    pub script: Option<PathBuf>,
    /// Remaining arguments
    pub argv: Vec<OsString>,
    /// Text written to the child's stdin
    pub stdin: Option<String>,
    /// Per-call timeout; overrides the bridge default
    pub timeout: Option<Duration>,
    /// Extra environment variables
    pub env: Vec<(OsString, OsString)>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
}

impl ExternalInvocation {
    /// Invocation with no script and no arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocation of `script`
    pub fn script(script: impl Into<PathBuf>) -> Self {
        Self {
            script: Some(script.into()),
            ..Self::default()
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append `--input "<comma-separated numbers>"`
    pub fn input_numbers(self, numbers: &[f64]) -> Self {
        let joined = numbers
            .iter()
            .map(|n| format_number(*n))
            .collect::<Vec<_>>()
            .join(",");
        self.arg("--input").arg(joined)
    }

    /// Write `text` to stdin
    pub fn stdin_text(mut self, text: impl Into<String>) -> Self {
        self.stdin = Some(text.into());
        self
    }

    /// Write `{"args": [...]}` to stdin
    pub fn json_args(self, args: &[Value]) -> BridgeResult<Self> {
        let args = args.iter().map(to_json).collect::<BridgeResult<Vec<_>>>()?;
        Ok(self.stdin_text(json!({ "args": args }).to_string()))
    }

    /// Write an arbitrary value as JSON to stdin
    pub fn json_payload(self, payload: &Value) -> BridgeResult<Self> {
        Ok(self.stdin_text(to_json(payload)?.to_string()))
    }

    /// Kill the process after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run the child in `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Whole numbers print without a fractional part
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Captured output of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Raw stdout
    pub stdout: Vec<u8>,
    /// Raw stderr
    pub stderr: Vec<u8>,
    /// Exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    /// Check for a zero exit code
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout decoded lossily
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily with trailing whitespace trimmed
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim_end().to_string()
    }

    /// Decode stdout as a JSON value
    pub fn decode(&self) -> BridgeResult<Value> {
        let text = std::str::from_utf8(&self.stdout)
            .map_err(|e| BridgeError::marshalling(format!("stdout is not UTF-8: {}", e)))?;
        parse_json(text)
    }

    /// Decode stdout as a JSON object
    pub fn decode_mapping(&self) -> BridgeResult<Mapping> {
        self.decode()?.into_mapping()
    }

    fn into_checked(self) -> BridgeResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(BridgeError::Subprocess {
                exit_code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr_text(),
            })
        }
    }
}

/// Runs invocations against one interpreter executable.
#[derive(Debug)]
pub struct SubprocessBridge {
    executable: PathBuf,
    timeout: Option<Duration>,
    contracts: ContractRegistry,
}

impl SubprocessBridge {
    /// Bridge to `executable` with no default timeout
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            timeout: None,
            contracts: ContractRegistry::new(),
        }
    }

    /// Bridge to the configured (or bundled) interpreter
    pub fn from_config(config: &BridgeConfig) -> Self {
        let mut bridge = Self::new(config.layout().interpreter);
        bridge.timeout = config.subprocess_timeout();
        bridge
    }

    /// Set the default timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declare module contracts used by [`invoke_all`](Self::invoke_all)
    pub fn with_contracts(
        self,
        contracts: impl IntoIterator<Item = crate::state::ModuleContract>,
    ) -> Self {
        for contract in contracts {
            self.contracts.declare(contract);
        }
        self
    }

    /// Interpreter executable
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Run the process and capture its output, whatever the exit code.
    pub fn run(&self, invocation: &ExternalInvocation) -> BridgeResult<ProcessOutput> {
        let mut command = Command::new(&self.executable);
        if let Some(script) = &invocation.script {
            command.arg(script);
        }
        command
            .args(&invocation.argv)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        debug!(executable = %self.executable.display(), argv = ?invocation.argv, "spawning subprocess");
        let mut child = command.spawn().map_err(|e| BridgeError::Spawn {
            executable: self.executable.clone(),
            reason: e.to_string(),
        })?;

        let writer = invocation.stdin.clone().and_then(|payload| {
            child.stdin.take().map(|mut stdin| {
                thread::spawn(move || {
                    // A child that exits without reading closes the pipe early
                    let _ = stdin.write_all(payload.as_bytes());
                })
            })
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.wait(&mut child, invocation.timeout.or(self.timeout)) {
            Ok(status) => status,
            Err(e) => {
                let detached = settle(writer, stdout, stderr, SETTLE_GRACE);
                if detached > 0 {
                    warn!(detached, "pipes still held open after kill; detaching their threads");
                }
                return Err(e);
            }
        };

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let stdout = join_drain(stdout, "stdout")?;
        let stderr = join_drain(stderr, "stderr")?;

        debug!(exit_code = ?status.code(), "subprocess exited");
        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }

    fn wait(&self, child: &mut Child, timeout: Option<Duration>) -> BridgeResult<ExitStatus> {
        let Some(timeout) = timeout else {
            return child.wait().map_err(|e| BridgeError::io("waiting for subprocess", &e));
        };

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => return Err(BridgeError::io("waiting for subprocess", &e)),
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(executable = %self.executable.display(), ?elapsed, "killing subprocess after timeout");
                let _ = child.kill();
                let _ = child.wait();
                return Err(BridgeError::Timeout { elapsed });
            }
            thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
        }
    }

    /// Run the process; a non-zero exit becomes [`BridgeError::Subprocess`].
    pub fn invoke_external(&self, invocation: &ExternalInvocation) -> BridgeResult<ProcessOutput> {
        self.run(invocation)?.into_checked()
    }

    /// Run the process and decode stdout as JSON.
    pub fn call(&self, invocation: &ExternalInvocation) -> BridgeResult<Value> {
        self.invoke_external(invocation)?.decode()
    }

    /// Run the process and decode stdout as a JSON object.
    pub fn call_mapping(&self, invocation: &ExternalInvocation) -> BridgeResult<Mapping> {
        self.invoke_external(invocation)?.decode_mapping()
    }

    /// Run independent invocations of a stateless module in parallel.
    ///
    /// Results come back in input order.
    pub fn invoke_all(
        &self,
        module: &str,
        invocations: &[ExternalInvocation],
    ) -> BridgeResult<Vec<BridgeResult<Mapping>>> {
        self.contracts.check_parallel_safe(module)?;
        let results = thread::scope(|scope| {
            let handles: Vec<_> = invocations
                .iter()
                .map(|invocation| scope.spawn(move || self.call_mapping(invocation)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(BridgeError::invalid_state("subprocess worker panicked")))
                })
                .collect()
        });
        Ok(results)
    }
}

type Drain = Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>;

/// Join the pipe threads of a killed child, waiting at most `grace`.
///
/// Descendants of the child can keep its pipes open; threads still blocked
/// on them at the deadline are detached. Returns how many were detached.
fn settle(
    writer: Option<thread::JoinHandle<()>>,
    stdout: Drain,
    stderr: Drain,
    grace: Duration,
) -> usize {
    let deadline = Instant::now() + grace;
    let mut detached = 0;
    if let Some(writer) = writer {
        if !join_by(writer, deadline) {
            detached += 1;
        }
    }
    for reader in [stdout, stderr].into_iter().flatten() {
        if !join_by(reader, deadline) {
            detached += 1;
        }
    }
    detached
}

fn join_by<T>(handle: thread::JoinHandle<T>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
    let _ = handle.join();
    true
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drain {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn join_drain(handle: Drain, stream: &str) -> BridgeResult<Vec<u8>> {
    match handle {
        None => Ok(Vec::new()),
        Some(handle) => match handle.join() {
            Ok(Ok(buf)) => Ok(buf),
            Ok(Err(e)) => Err(BridgeError::io(format!("reading {}", stream), &e)),
            Err(_) => Err(BridgeError::invalid_state(format!("{} reader panicked", stream))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_input_numbers() {
        let invocation = ExternalInvocation::script("launch.py").input_numbers(&[1.0, 2.5, -3.0]);
        assert_eq!(
            invocation.argv,
            vec![OsString::from("--input"), OsString::from("1,2.5,-3")]
        );
    }

    #[test]
    fn test_json_args() {
        let invocation = ExternalInvocation::new()
            .json_args(&[Value::floats([1.0, 2.0]), Value::Bool(true)])
            .unwrap();
        assert_eq!(invocation.stdin.as_deref(), Some(r#"{"args":[[1.0,2.0],true]}"#));
    }

    #[test]
    fn test_json_args_tags_non_finite() {
        let invocation = ExternalInvocation::new()
            .json_args(&[Value::Float(f64::NAN), Value::Float(f64::NEG_INFINITY)])
            .unwrap();
        assert_eq!(
            invocation.stdin.as_deref(),
            Some(r#"{"args":[{"$float":"nan"},{"$float":"-inf"}]}"#)
        );
    }

    #[test]
    fn test_settle_joins_finished_and_detaches_blocked() {
        let done = Some(thread::spawn(|| Ok(b"out".to_vec())));
        let writer = Some(thread::spawn(|| {}));
        assert_eq!(settle(writer, done, None, Duration::from_secs(5)), 0);

        let started = Instant::now();
        let blocked = Some(thread::spawn(|| {
            thread::sleep(Duration::from_secs(3));
            Ok(Vec::new())
        }));
        assert_eq!(settle(None, None, blocked, Duration::from_millis(50)), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_output_checks() {
        let failed = ProcessOutput {
            stdout: br#"{"ok": true}"#.to_vec(),
            stderr: b"boom\n".to_vec(),
            exit_code: Some(2),
        };
        match failed.into_checked() {
            Err(BridgeError::Subprocess { exit_code, stderr }) => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected subprocess error, got {:?}", other),
        }

        let signalled = ProcessOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
        };
        assert!(matches!(
            signalled.into_checked(),
            Err(BridgeError::Subprocess { exit_code: -1, .. })
        ));
    }

    #[test]
    fn test_decode_mapping() {
        let output = ProcessOutput {
            stdout: br#"{"result": [3.0, 4.0]}"#.to_vec(),
            stderr: Vec::new(),
            exit_code: Some(0),
        };
        let mapping = output.decode_mapping().unwrap();
        assert_eq!(mapping.get_as::<Vec<f64>>("result").unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_invoke_all_refuses_stateful() {
        use crate::state::ModuleContract;
        let bridge = SubprocessBridge::new("python").with_contracts([ModuleContract::stateful(
            "ml.regression",
            &["train_regression_sample", "predict_dict"],
            &["train_regression_sample", "predict_dict"],
        )]);
        let err = bridge.invoke_all("ml.regression", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState { .. }));
    }
}
