use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;

use crate::exec::ExecOutcome;

const VERBOSE_CLIP_CHARS: usize = 800;
const SUMMARY_CLIP_CHARS: usize = 200;

/// Append-only, timestamped, line-per-event log file. Opening the sink is the
/// one operation allowed to fail hard: a supervisor that cannot report is not
/// worth running. Writes after that are best-effort.
pub struct EventLog {
    sink: Mutex<File>,
    mirror_stdout: bool,
}

impl EventLog {
    pub fn open(path: &Path, mirror_stdout: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed opening log file {}", path.display()))?;
        Ok(Self {
            sink: Mutex::new(file),
            mirror_stdout,
        })
    }

    pub fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let stamped = format!("{} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        if let Ok(mut file) = self.sink.lock() {
            let _ = writeln!(file, "{}", stamped);
        }
        if self.mirror_stdout {
            println!("{}", stamped);
        }
    }

    /// One line per command invocation; the verbosity flag decides between the
    /// full clipped streams and a single-line summary.
    pub fn command(&self, label: &str, outcome: &ExecOutcome, verbose: bool) {
        let code = outcome.exit_code.unwrap_or(-1);
        let err = outcome.error.as_deref().unwrap_or("none");
        if verbose {
            self.line(format!(
                "{} (code={} err={}) stdout={:?} stderr={:?}",
                label,
                code,
                err,
                clip(&outcome.stdout, VERBOSE_CLIP_CHARS),
                clip(&outcome.stderr, VERBOSE_CLIP_CHARS),
            ));
            return;
        }

        let msg = short_msg(&outcome.stdout, &outcome.stderr);
        if msg.is_empty() {
            self.line(format!("{} (code={} err={})", label, code, err));
        } else {
            self.line(format!("{} (code={} err={}) msg={:?}", label, code, err, msg));
        }
    }
}

fn clip(raw: &str, max_chars: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let prefix = trimmed.chars().take(max_chars).collect::<String>();
    format!("{}...", prefix)
}

/// First non-empty line of stderr (preferred) or stdout, clipped.
fn short_msg(stdout: &str, stderr: &str) -> String {
    let mut source = stderr.trim();
    if source.is_empty() {
        source = stdout.trim();
    }
    if source.is_empty() {
        return String::new();
    }
    let first = source.lines().next().unwrap_or_default();
    clip(first, SUMMARY_CLIP_CHARS)
}
