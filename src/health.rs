use std::time::Duration;

use crate::config::Settings;
use crate::exec::{CommandRunner, ExecOutcome};

/// One probe's verdict plus everything the command produced. The detail never
/// changes what the cascade does, but it is kept for the event log and for the
/// stopped-service fast path.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub outcome: ExecOutcome,
}

/// Healthy means the health command launched, finished inside its deadline,
/// and exited zero. Everything else is unhealthy.
pub fn probe(runner: &dyn CommandRunner, settings: &Settings) -> HealthReport {
    let outcome = runner.run(
        &settings.health_cmd,
        Duration::from_secs(settings.health_timeout_secs),
    );
    HealthReport {
        healthy: outcome.success(),
        outcome,
    }
}
