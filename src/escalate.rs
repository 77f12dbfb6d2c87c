use std::thread;
use std::time::Duration;

use crate::backup::BackupKeeper;
use crate::config::Settings;
use crate::eventlog::EventLog;
use crate::exec::{CommandRunner, ExecOutcome};
use crate::health::{self, HealthReport};

// Per-action deadlines. Health is the only configurable one; the rest are
// fixed for the lifetime of the action templates they bound.
const START_DEADLINE: Duration = Duration::from_secs(90);
const RESTART_DEADLINE: Duration = Duration::from_secs(60);
const INSTALL_DEADLINE: Duration = Duration::from_secs(90);
const BOOTSTRAP_DEADLINE: Duration = Duration::from_secs(30);
const STATUS_DEADLINE: Duration = Duration::from_secs(60);
const DOCTOR_DEADLINE: Duration = Duration::from_secs(90);

/// Emitted by the gateway CLI when the host's service supervisor has no
/// registration for it. Seeing this means install/bootstrap, not restart.
const NOT_LOADED_SIGNATURE: &str = "Gateway service not loaded";

/// Diagnostic texts that mean "the service is simply not running", where a
/// plain start is cheaper than the full cascade.
const STOPPED_SIGNATURES: [&str; 4] = [
    "gateway closed",
    "Connection refused",
    "ECONNREFUSED",
    NOT_LOADED_SIGNATURE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOutcome {
    RecoveredAfterStart,
    RecoveredAfterRestart,
    RecoveredAfterRollback,
    StillUnhealthy,
}

impl CascadeOutcome {
    pub fn recovered(&self) -> bool {
        !matches!(self, CascadeOutcome::StillUnhealthy)
    }
}

pub fn looks_stopped(report: &HealthReport) -> bool {
    STOPPED_SIGNATURES
        .iter()
        .any(|signature| report.outcome.stderr.contains(signature))
}

fn needs_registration(outcome: &ExecOutcome) -> bool {
    outcome.output_contains(NOT_LOADED_SIGNATURE)
}

/// One tick's remediation cascade, ordered cheapest-first: fast start for a
/// merely-stopped service, then restarts, then diagnostics, then config
/// rollback. Every recovery step is followed by a backoff wait and a fresh
/// probe, and the cascade returns the moment a probe comes back healthy.
pub struct Escalator<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
    backups: &'a BackupKeeper,
    log: &'a EventLog,
}

impl<'a> Escalator<'a> {
    pub fn new(
        settings: &'a Settings,
        runner: &'a dyn CommandRunner,
        backups: &'a BackupKeeper,
        log: &'a EventLog,
    ) -> Self {
        Self {
            settings,
            runner,
            backups,
            log,
        }
    }

    pub fn run(&self, report: &HealthReport) -> CascadeOutcome {
        if looks_stopped(report) {
            self.log.line("gateway appears stopped; attempting start");
            if self.start_service() {
                self.repair_registration();
                let _ = self.start_service();
            }
            self.backoff();
            if health::probe(self.runner, self.settings).healthy {
                self.log.line("recovered after start");
                return CascadeOutcome::RecoveredAfterStart;
            }
        }

        // Best-effort service state capture for operators, before anything
        // destructive runs. Its outcome gates nothing.
        self.run_status();

        for _ in 0..self.settings.max_restart_attempts {
            self.restart_service();
            self.backoff();
            if health::probe(self.runner, self.settings).healthy {
                self.log.line("recovered after restart");
                return CascadeOutcome::RecoveredAfterRestart;
            }
        }

        self.run_doctor();

        if self.settings.auto_rollback && self.backups.rollback_to_best(self.log) {
            self.restart_service();
            self.backoff();
            if health::probe(self.runner, self.settings).healthy {
                self.log.line("recovered after rollback");
                return CascadeOutcome::RecoveredAfterRollback;
            }
            self.log.line("rollback attempted but still unhealthy");
        }

        CascadeOutcome::StillUnhealthy
    }

    /// Runs one configured action. An empty template is a deliberate opt-out:
    /// logged and skipped, never an error.
    fn run_action(&self, label: &str, cmd: &[String], deadline: Duration) -> Option<ExecOutcome> {
        if cmd.is_empty() {
            self.log
                .line(format!("{} skipped: no command configured", label));
            return None;
        }
        let outcome = self.runner.run(cmd, deadline);
        self.log
            .command(label, &outcome, self.settings.verbose_logs);
        Some(outcome)
    }

    /// Returns true when the start output shows the registration gap.
    fn start_service(&self) -> bool {
        match self.run_action("start", &self.settings.start_cmd, START_DEADLINE) {
            Some(outcome) => needs_registration(&outcome),
            None => false,
        }
    }

    fn restart_service(&self) {
        if let Some(outcome) =
            self.run_action("restart", &self.settings.restart_cmd, RESTART_DEADLINE)
        {
            if needs_registration(&outcome) {
                self.repair_registration();
            }
        }
    }

    fn install_service(&self) {
        let _ = self.run_action("install", &self.settings.install_cmd, INSTALL_DEADLINE);
    }

    fn bootstrap_service(&self) {
        let cmd = if !self.settings.bootstrap_cmd.is_empty() {
            self.settings.bootstrap_cmd.clone()
        } else if let Some(unit) = &self.settings.service_unit_path {
            let uid = unsafe { libc::getuid() };
            vec![
                "launchctl".to_string(),
                "bootstrap".to_string(),
                format!("gui/{}", uid),
                unit.display().to_string(),
            ]
        } else {
            self.log
                .line("bootstrap skipped: no bootstrap command or service unit path");
            return;
        };
        let _ = self.run_action("bootstrap", &cmd, BOOTSTRAP_DEADLINE);
    }

    /// An existing unit file means registration already happened once, so a
    /// bootstrap alone reattaches it; otherwise run the full install first.
    fn repair_registration(&self) {
        if let Some(unit) = &self.settings.service_unit_path {
            if unit.exists() {
                self.log
                    .line("service not loaded but unit file exists; bootstrapping");
                self.bootstrap_service();
                return;
            }
        }
        self.log.line("service not loaded; installing gateway service");
        self.install_service();
        self.bootstrap_service();
    }

    fn run_status(&self) {
        let _ = self.run_action("status", &self.settings.status_cmd, STATUS_DEADLINE);
    }

    fn run_doctor(&self) {
        let _ = self.run_action("doctor", &self.settings.doctor_cmd, DOCTOR_DEADLINE);
    }

    fn backoff(&self) {
        if self.settings.restart_backoff_secs > 0 {
            thread::sleep(Duration::from_secs(self.settings.restart_backoff_secs));
        }
    }
}
