use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const ENV_FILE_ENV: &str = "GATEWAY_SENTINEL_ENV_FILE";

/// Leading command token that gets rewritten to `service_bin`, so one knob
/// repoints every action at a differently-installed gateway binary.
const SERVICE_TOKEN: &str = "gateway";

#[derive(Debug, Clone)]
pub struct Settings {
    pub interval_secs: u64,
    pub service_bin: String,
    pub health_cmd: Vec<String>,
    pub restart_cmd: Vec<String>,
    pub install_cmd: Vec<String>,
    pub start_cmd: Vec<String>,
    pub bootstrap_cmd: Vec<String>,
    pub doctor_cmd: Vec<String>,
    pub status_cmd: Vec<String>,
    pub service_unit_path: Option<PathBuf>,
    pub health_timeout_secs: u64,
    pub restart_backoff_secs: u64,
    pub max_restart_attempts: u32,
    pub config_path: PathBuf,
    pub backup_dir: PathBuf,
    pub state_path: PathBuf,
    pub auto_rollback: bool,
    pub log_path: PathBuf,
    pub log_to_stdout: bool,
    pub verbose_logs: bool,
    pub log_health_ok: bool,
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub interval_secs: u64,
    pub service_bin: String,
    pub config_path: PathBuf,
    pub backup_dir: PathBuf,
    pub state_path: PathBuf,
    pub log_path: PathBuf,
    pub service_unit_path: Option<PathBuf>,
    pub auto_rollback: bool,
    pub max_restart_attempts: u32,
    pub warnings: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let service_bin = env::var("GATEWAY_SENTINEL_SERVICE_BIN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| SERVICE_TOKEN.to_string());

        let health_cmd = read_cmd_env("GATEWAY_SENTINEL_HEALTH_CMD", &["health", "--json"]);
        let restart_cmd = read_cmd_env("GATEWAY_SENTINEL_RESTART_CMD", &["service", "restart"]);
        let install_cmd = read_cmd_env("GATEWAY_SENTINEL_INSTALL_CMD", &["service", "install"]);
        let start_cmd = read_cmd_env("GATEWAY_SENTINEL_START_CMD", &["service", "start"]);
        let bootstrap_cmd = read_args_env("GATEWAY_SENTINEL_BOOTSTRAP_CMD");
        let doctor_cmd = read_cmd_env(
            "GATEWAY_SENTINEL_DOCTOR_CMD",
            &["doctor", "--non-interactive"],
        );
        let status_cmd = read_cmd_env("GATEWAY_SENTINEL_STATUS_CMD", &["status", "--deep"]);

        let service_unit_path = match env::var("GATEWAY_SENTINEL_SERVICE_UNIT_PATH") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(expand_path(&value)),
            Err(_) => Some(expand_path(
                "~/Library/LaunchAgents/com.gateway.service.plist",
            )),
        };

        let settings = Self {
            interval_secs: read_u64_env("GATEWAY_SENTINEL_INTERVAL_SECS", 180),
            health_cmd: normalize_command(health_cmd, &service_bin),
            restart_cmd: normalize_command(restart_cmd, &service_bin),
            install_cmd: normalize_command(install_cmd, &service_bin),
            start_cmd: normalize_command(start_cmd, &service_bin),
            bootstrap_cmd,
            doctor_cmd: normalize_command(doctor_cmd, &service_bin),
            status_cmd: normalize_command(status_cmd, &service_bin),
            service_bin,
            service_unit_path,
            health_timeout_secs: read_u64_env("GATEWAY_SENTINEL_HEALTH_TIMEOUT_SECS", 20),
            restart_backoff_secs: read_u64_env("GATEWAY_SENTINEL_RESTART_BACKOFF_SECS", 8),
            max_restart_attempts: read_u32_env("GATEWAY_SENTINEL_MAX_RESTART_ATTEMPTS", 2),
            config_path: read_path_env("GATEWAY_SENTINEL_CONFIG_PATH", "~/.gateway/gateway.json"),
            backup_dir: read_path_env("GATEWAY_SENTINEL_BACKUP_DIR", "~/.gateway-sentinel/backups"),
            state_path: read_path_env(
                "GATEWAY_SENTINEL_STATE_PATH",
                "~/.gateway-sentinel/state.json",
            ),
            auto_rollback: read_bool_env("GATEWAY_SENTINEL_AUTO_ROLLBACK", true),
            log_path: read_path_env(
                "GATEWAY_SENTINEL_LOG_PATH",
                "~/.gateway-sentinel/sentinel.log",
            ),
            log_to_stdout: read_bool_env("GATEWAY_SENTINEL_LOG_TO_STDOUT", false),
            verbose_logs: read_bool_env("GATEWAY_SENTINEL_VERBOSE_LOGS", false),
            log_health_ok: read_bool_env("GATEWAY_SENTINEL_LOG_HEALTH_OK", false),
        };

        Ok(settings)
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        if self.interval_secs == 0 {
            warnings.push("GATEWAY_SENTINEL_INTERVAL_SECS should be > 0".to_string());
        }
        if self.health_cmd.is_empty() {
            warnings.push("health command is empty; nothing will ever be probed".to_string());
        }
        if self.health_timeout_secs == 0 {
            warnings.push("GATEWAY_SENTINEL_HEALTH_TIMEOUT_SECS should be > 0".to_string());
        }
        if self.restart_cmd.is_empty() {
            warnings.push("restart command is empty; the restart cascade is disabled".to_string());
        }
        if self.max_restart_attempts == 0 {
            warnings
                .push("GATEWAY_SENTINEL_MAX_RESTART_ATTEMPTS is 0; restarts disabled".to_string());
        }
        if self.bootstrap_cmd.is_empty() && self.service_unit_path.is_none() {
            warnings.push(
                "no bootstrap command and no service unit path; registration repair disabled"
                    .to_string(),
            );
        }
        if self.auto_rollback && self.config_path.as_os_str().is_empty() {
            warnings.push("auto-rollback enabled but config path is empty".to_string());
        }

        DoctorReport {
            interval_secs: self.interval_secs,
            service_bin: self.service_bin.clone(),
            config_path: self.config_path.clone(),
            backup_dir: self.backup_dir.clone(),
            state_path: self.state_path.clone(),
            log_path: self.log_path.clone(),
            service_unit_path: self.service_unit_path.clone(),
            auto_rollback: self.auto_rollback,
            max_restart_attempts: self.max_restart_attempts,
            warnings,
        }
    }
}

/// Command templates read from the environment are whitespace-split argv
/// vectors. A set-but-empty variable disables the action; an unset variable
/// falls back to the default `gateway` subcommand.
fn read_cmd_env(key: &str, default_args: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(_) => read_args_env(key),
        Err(_) => {
            let mut cmd = vec![SERVICE_TOKEN.to_string()];
            cmd.extend(default_args.iter().map(ToString::to_string));
            cmd
        }
    }
}

fn read_args_env(key: &str) -> Vec<String> {
    let Some(value) = env::var(key).ok() else {
        return Vec::new();
    };

    value
        .split_whitespace()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_u32_env(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_path_env(key: &str, default: &str) -> PathBuf {
    let raw = env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    expand_path(&raw)
}

fn expand_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    match shellexpand::full(trimmed) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(trimmed),
    }
}

fn normalize_command(cmd: Vec<String>, bin: &str) -> Vec<String> {
    let mut cmd = cmd;
    if let Some(first) = cmd.first_mut() {
        if first == SERVICE_TOKEN && !bin.is_empty() {
            *first = bin.to_string();
        }
    }
    cmd
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
