use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of one external command invocation. This is deliberately not a
/// `Result`: a non-zero exit code is data for the caller to interpret, and
/// only launch failures and deadline overruns populate `error`.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl ExecOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// True when the command launched, finished within its deadline, and
    /// exited zero.
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.timed_out && self.exit_code == Some(0)
    }

    /// Matches `needle` against either captured stream.
    pub fn output_contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], deadline: Duration) -> ExecOutcome;
}

/// Runs commands as real child processes. The deadline is enforced by a
/// polling wait; an overrunning child is killed and whatever output it had
/// produced is still returned.
#[derive(Default)]
pub struct SystemRunner;

const WAIT_POLL: Duration = Duration::from_millis(50);

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String], deadline: Duration) -> ExecOutcome {
        let Some((program, args)) = argv.split_first() else {
            return ExecOutcome::failed("empty command");
        };

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return ExecOutcome::failed(format!("failed launching '{}': {}", program, err));
            }
        };

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => {
                    let output = match child.wait_with_output() {
                        Ok(output) => output,
                        Err(err) => {
                            return ExecOutcome::failed(format!(
                                "failed collecting output of '{}': {}",
                                program, err
                            ));
                        }
                    };
                    return ExecOutcome {
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                        exit_code: output.status.code(),
                        timed_out: false,
                        error: None,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    return ExecOutcome::failed(format!(
                        "failed waiting for '{}': {}",
                        program, err
                    ));
                }
            }

            if started.elapsed() >= deadline {
                let _ = child.kill();
                let output = child.wait_with_output().ok();
                let stdout = output
                    .as_ref()
                    .map(|out| String::from_utf8_lossy(&out.stdout).to_string())
                    .unwrap_or_default();
                let stderr = output
                    .as_ref()
                    .map(|out| String::from_utf8_lossy(&out.stderr).to_string())
                    .unwrap_or_default();
                return ExecOutcome {
                    stdout,
                    stderr,
                    exit_code: output.and_then(|out| out.status.code()),
                    timed_out: true,
                    error: Some(format!(
                        "'{}' exceeded its {}s deadline and was killed",
                        program,
                        deadline.as_secs()
                    )),
                };
            }

            thread::sleep(WAIT_POLL);
        }
    }
}
