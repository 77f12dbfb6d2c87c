use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::backup::{self, BackupKeeper, SupervisorState};
use crate::config::Settings;
use crate::escalate::{CascadeOutcome, Escalator};
use crate::eventlog::EventLog;
use crate::exec::{CommandRunner, SystemRunner};
use crate::health;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    Recovered(CascadeOutcome),
    StillUnhealthy,
}

/// The process-wide scheduler. Owns the persisted state for the duration of
/// each tick and hands it to the backup keeper by value; there is exactly one
/// control thread, so no locking beyond that is needed.
pub struct Supervisor {
    settings: Settings,
    runner: Box<dyn CommandRunner>,
    backups: BackupKeeper,
    log: EventLog,
    state: SupervisorState,
    last_healthy: bool,
}

impl Supervisor {
    pub fn new(settings: Settings, log: EventLog) -> Self {
        Self::with_runner(settings, log, Box::new(SystemRunner))
    }

    /// Seam for driving the supervisor with a scripted runner instead of real
    /// child processes.
    pub fn with_runner(settings: Settings, log: EventLog, runner: Box<dyn CommandRunner>) -> Self {
        let backups = BackupKeeper::new(settings.config_path.clone(), settings.backup_dir.clone());
        let state = backup::load_state(&settings.state_path);
        Self {
            settings,
            runner,
            backups,
            log,
            state,
            last_healthy: false,
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// One full cycle: snapshot config changes, probe, and on failure run the
    /// escalation cascade. State is persisted after every mutation.
    pub fn tick(&mut self) -> TickOutcome {
        self.state = self
            .backups
            .snapshot_if_changed(self.state.clone(), &self.log);
        self.persist_state();

        let report = health::probe(self.runner.as_ref(), &self.settings);
        if report.healthy {
            self.state = self.backups.record_if_healthy(self.state.clone(), &self.log);
            self.backups.refresh_latest_good_marker(&self.state);
            self.persist_state();
            if !self.last_healthy && self.settings.log_health_ok {
                self.log.line("health ok");
            }
            self.last_healthy = true;
            return TickOutcome::Healthy;
        }

        // Log the failure once, on the healthy-to-unhealthy edge.
        if self.last_healthy {
            self.log
                .command("health failed", &report.outcome, self.settings.verbose_logs);
        }
        self.last_healthy = false;

        let escalator = Escalator::new(
            &self.settings,
            self.runner.as_ref(),
            &self.backups,
            &self.log,
        );
        let outcome = escalator.run(&report);
        if outcome.recovered() {
            self.last_healthy = true;
            TickOutcome::Recovered(outcome)
        } else {
            TickOutcome::StillUnhealthy
        }
    }

    /// The outer loop always waits a full interval after a tick finishes,
    /// whether or not its cascade recovered anything.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.log.line(format!(
            "sentinel started (interval={}s)",
            self.settings.interval_secs
        ));
        self.log.line(format!(
            "watching config: {}",
            self.settings.config_path.display()
        ));

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let _ = self.tick();
            if self.wait_for_next_tick(&shutdown) {
                break;
            }
        }

        self.log.line("sentinel stopped");
        Ok(())
    }

    fn persist_state(&self) {
        if let Err(err) = backup::save_state(&self.settings.state_path, &self.state) {
            self.log.line(format!("state persist failed: {}", err));
        }
    }

    // Sleeps in short slices so a shutdown request lands between ticks
    // promptly instead of after a full interval.
    fn wait_for_next_tick(&self, shutdown: &AtomicBool) -> bool {
        let interval = Duration::from_secs(self.settings.interval_secs.max(1));
        let slice = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        while waited < interval {
            if shutdown.load(Ordering::Relaxed) {
                return true;
            }
            let step = slice.min(interval - waited);
            thread::sleep(step);
            waited += step;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::{Supervisor, TickOutcome};
    use crate::config::Settings;
    use crate::eventlog::EventLog;
    use crate::exec::{CommandRunner, ExecOutcome};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    struct AlwaysHealthy;

    impl CommandRunner for AlwaysHealthy {
        fn run(&self, _argv: &[String], _deadline: Duration) -> ExecOutcome {
            ExecOutcome {
                exit_code: Some(0),
                ..ExecOutcome::default()
            }
        }
    }

    fn settings(root: &Path) -> Settings {
        Settings {
            interval_secs: 1,
            service_bin: "gateway".to_string(),
            health_cmd: vec!["gateway".to_string(), "health".to_string()],
            restart_cmd: vec!["gateway".to_string(), "restart".to_string()],
            install_cmd: vec!["gateway".to_string(), "install".to_string()],
            start_cmd: vec!["gateway".to_string(), "start".to_string()],
            bootstrap_cmd: Vec::new(),
            doctor_cmd: vec!["gateway".to_string(), "doctor".to_string()],
            status_cmd: vec!["gateway".to_string(), "status".to_string()],
            service_unit_path: None,
            health_timeout_secs: 5,
            restart_backoff_secs: 0,
            max_restart_attempts: 2,
            config_path: root.join("gateway.json"),
            backup_dir: root.join("backups"),
            state_path: root.join("state.json"),
            auto_rollback: true,
            log_path: root.join("sentinel.log"),
            log_to_stdout: false,
            verbose_logs: false,
            log_health_ok: true,
        }
    }

    #[test]
    fn healthy_tick_records_good_backup_and_persists_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        fs::write(&settings.config_path, b"{}").expect("write config");
        let log = EventLog::open(&settings.log_path, false).expect("open log");

        let mut supervisor =
            Supervisor::with_runner(settings.clone(), log, Box::new(AlwaysHealthy));
        assert_eq!(supervisor.tick(), TickOutcome::Healthy);

        assert!(!supervisor.state().last_good_backup.is_empty());
        assert!(settings.state_path.exists());
        let persisted = crate::backup::load_state(&settings.state_path);
        assert_eq!(&persisted, supervisor.state());
    }

    #[test]
    fn health_ok_is_logged_only_on_the_recovery_edge() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path());
        let log = EventLog::open(&settings.log_path, false).expect("open log");

        let mut supervisor =
            Supervisor::with_runner(settings.clone(), log, Box::new(AlwaysHealthy));
        supervisor.tick();
        supervisor.tick();
        supervisor.tick();

        let raw = fs::read_to_string(&settings.log_path).expect("read log");
        let count = raw.lines().filter(|line| line.ends_with("health ok")).count();
        assert_eq!(count, 1);
    }
}
