use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::eventlog::EventLog;

/// The only data that survives supervisor restarts. Loaded leniently (a
/// missing or corrupt file starts over empty) and rewritten after every
/// mutation, so a crash loses at most one tick of bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorState {
    pub last_config_hash: String,
    pub last_backup: String,
    pub last_good_backup: String,
}

pub fn load_state(path: &Path) -> SupervisorState {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return SupervisorState::default(),
    };
    match serde_json::from_str::<SupervisorState>(&raw) {
        Ok(state) => state,
        Err(err) => {
            warn!("discarding unreadable state file {}: {}", path.display(), err);
            SupervisorState::default()
        }
    }
}

pub fn save_state(path: &Path, state: &SupervisorState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating state directory {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(state).context("failed encoding supervisor state")?;
    fs::write(path, data).with_context(|| format!("failed writing state {}", path.display()))
}

/// Streaming sha256 of a file's bytes, lowercase hex. Change detection only.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Versioned, content-addressed copies of the managed config file. Backups are
/// append-only; retention is out of scope.
pub struct BackupKeeper {
    config_path: PathBuf,
    backup_dir: PathBuf,
}

const BACKUP_TIMESTAMP: &str = "%Y%m%d-%H%M%S";

impl BackupKeeper {
    pub fn new(config_path: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            config_path,
            backup_dir,
        }
    }

    fn config_file_name(&self) -> String {
        self.config_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string())
    }

    /// Fixed-name copy of the latest known-good snapshot, refreshed on every
    /// healthy record so external recovery never needs the state file.
    pub fn latest_good_marker(&self) -> PathBuf {
        self.backup_dir
            .join(format!("{}.good.latest", self.config_file_name()))
    }

    /// Takes a timestamped backup iff the managed file's digest moved since
    /// the last observation. Runs before the health probe, so a config edit is
    /// captured even when it caused the unhealthiness being diagnosed.
    pub fn snapshot_if_changed(&self, state: SupervisorState, log: &EventLog) -> SupervisorState {
        let mut state = state;
        if !self.config_path.exists() {
            return state;
        }
        let hash = match file_sha256(&self.config_path) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("skipping snapshot: {}", err);
                return state;
            }
        };
        if hash == state.last_config_hash {
            return state;
        }
        let backup_path = self.backup_dir.join(format!(
            "{}.{}",
            self.config_file_name(),
            Local::now().format(BACKUP_TIMESTAMP)
        ));
        if let Err(err) = copy_file(&self.config_path, &backup_path) {
            log.line(format!("backup failed: {}", err));
            return state;
        }
        log.line(format!(
            "config changed; backed up to {}",
            backup_path.display()
        ));
        state.last_config_hash = hash;
        state.last_backup = backup_path.display().to_string();
        state
    }

    /// Records a distinctly-named known-good snapshot after a healthy probe,
    /// unless the current digest is already recorded and a good backup exists.
    pub fn record_if_healthy(&self, state: SupervisorState, log: &EventLog) -> SupervisorState {
        let mut state = state;
        if !self.config_path.exists() {
            return state;
        }
        let hash = match file_sha256(&self.config_path) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("skipping known-good record: {}", err);
                return state;
            }
        };
        if hash == state.last_config_hash && !state.last_good_backup.is_empty() {
            return state;
        }
        let backup_path = self.backup_dir.join(format!(
            "{}.good.{}",
            self.config_file_name(),
            Local::now().format(BACKUP_TIMESTAMP)
        ));
        if let Err(err) = copy_file(&self.config_path, &backup_path) {
            log.line(format!("known-good backup failed: {}", err));
            return state;
        }
        log.line(format!(
            "recorded last-known-good config to {}",
            backup_path.display()
        ));
        state.last_good_backup = backup_path.display().to_string();
        state.last_config_hash = hash;
        state
    }

    pub fn refresh_latest_good_marker(&self, state: &SupervisorState) {
        if state.last_good_backup.is_empty() {
            return;
        }
        if let Err(err) = copy_file(Path::new(&state.last_good_backup), &self.latest_good_marker())
        {
            debug!("latest-good marker refresh failed: {}", err);
        }
    }

    /// All rollback candidates, most recently modified first. Merges the
    /// sentinel's own backups, the managed service's native `<name>.bak*`
    /// files next to the config, and the latest-good marker; deduplicated by
    /// path. Empty when nothing exists; that is a normal answer, not an
    /// error.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        if let Ok(list) = fs::read_dir(&self.backup_dir) {
            for entry in list.flatten() {
                add_candidate(&mut entries, &mut seen, entry.path());
            }
        }

        let native_prefix = format!("{}.bak", self.config_file_name());
        if let Some(config_dir) = self.config_path.parent() {
            if let Ok(list) = fs::read_dir(config_dir) {
                for entry in list.flatten() {
                    let name = entry.file_name();
                    if name.to_string_lossy().starts_with(&native_prefix) {
                        add_candidate(&mut entries, &mut seen, entry.path());
                    }
                }
            }
            add_candidate(&mut entries, &mut seen, config_dir.join(&native_prefix));
        }

        add_candidate(&mut entries, &mut seen, self.latest_good_marker());

        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(path, _)| path).collect()
    }

    /// Copies the best candidate over the managed config. Reports the result;
    /// never fails the surrounding tick.
    pub fn rollback_to_best(&self, log: &EventLog) -> bool {
        let candidates = self.candidates();
        let Some(best) = candidates.first() else {
            log.line("rollback: no candidate backups found");
            return false;
        };
        if let Err(err) = copy_file(best, &self.config_path) {
            log.line(format!("rollback: copy failed: {}", err));
            return false;
        }
        log.line(format!(
            "rollback: restored {} to {}",
            best.display(),
            self.config_path.display()
        ));
        true
    }
}

fn add_candidate(
    entries: &mut Vec<(PathBuf, SystemTime)>,
    seen: &mut HashSet<PathBuf>,
    path: PathBuf,
) {
    if !seen.insert(path.clone()) {
        return;
    }
    let Ok(meta) = fs::metadata(&path) else {
        return;
    };
    if !meta.is_file() {
        return;
    }
    let Ok(modified) = meta.modified() else {
        return;
    };
    entries.push((path, modified));
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating directory {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed copying {} to {}", src.display(), dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{file_sha256, load_state, save_state, BackupKeeper, SupervisorState};
    use crate::eventlog::EventLog;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};

    struct Fixture {
        _temp: tempfile::TempDir,
        keeper: BackupKeeper,
        config_path: PathBuf,
        backup_dir: PathBuf,
        log: EventLog,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_dir = temp.path().join("service");
        fs::create_dir_all(&config_dir).expect("config dir");
        let config_path = config_dir.join("gateway.json");
        let backup_dir = temp.path().join("backups");
        let log = EventLog::open(&temp.path().join("sentinel.log"), false).expect("open log");
        Fixture {
            keeper: BackupKeeper::new(config_path.clone(), backup_dir.clone()),
            config_path,
            backup_dir,
            log,
            _temp: temp,
        }
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let file = fs::File::options()
            .write(true)
            .open(path)
            .expect("open for mtime");
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .expect("set mtime");
    }

    fn backup_count(dir: &Path) -> usize {
        match fs::read_dir(dir) {
            Ok(list) => list.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_content_sensitive() {
        let fx = fixture();
        fs::write(&fx.config_path, b"{\"port\": 8080}").expect("write config");
        let first = file_sha256(&fx.config_path).expect("hash once");
        let second = file_sha256(&fx.config_path).expect("hash twice");
        assert_eq!(first, second);

        fs::write(&fx.config_path, b"{\"port\": 8081}").expect("rewrite config");
        let third = file_sha256(&fx.config_path).expect("hash changed");
        assert_ne!(first, third);
    }

    #[test]
    fn snapshot_if_changed_is_idempotent_for_unchanged_file() {
        let fx = fixture();
        fs::write(&fx.config_path, b"v1").expect("write config");

        let state = fx
            .keeper
            .snapshot_if_changed(SupervisorState::default(), &fx.log);
        assert!(!state.last_config_hash.is_empty());
        assert!(!state.last_backup.is_empty());
        assert_eq!(backup_count(&fx.backup_dir), 1);

        let state = fx.keeper.snapshot_if_changed(state, &fx.log);
        assert_eq!(backup_count(&fx.backup_dir), 1);
        assert!(Path::new(&state.last_backup).exists());
    }

    #[test]
    fn snapshot_with_absent_config_is_a_noop() {
        let fx = fixture();
        let state = fx
            .keeper
            .snapshot_if_changed(SupervisorState::default(), &fx.log);
        assert_eq!(state, SupervisorState::default());
        assert_eq!(backup_count(&fx.backup_dir), 0);
    }

    #[test]
    fn record_if_healthy_skips_when_hash_recorded_and_good_backup_exists() {
        let fx = fixture();
        fs::write(&fx.config_path, b"stable").expect("write config");

        let state = fx
            .keeper
            .record_if_healthy(SupervisorState::default(), &fx.log);
        assert!(!state.last_good_backup.is_empty());
        assert_eq!(backup_count(&fx.backup_dir), 1);

        let again = fx.keeper.record_if_healthy(state.clone(), &fx.log);
        assert_eq!(again, state);
        assert_eq!(backup_count(&fx.backup_dir), 1);
    }

    #[test]
    fn latest_good_marker_is_a_copy_of_the_good_backup() {
        let fx = fixture();
        fs::write(&fx.config_path, b"known good bytes").expect("write config");

        let state = fx
            .keeper
            .record_if_healthy(SupervisorState::default(), &fx.log);
        fx.keeper.refresh_latest_good_marker(&state);

        let marker = fx.keeper.latest_good_marker();
        assert!(marker.exists());
        assert_eq!(
            fs::read(&marker).expect("read marker"),
            b"known good bytes"
        );
    }

    #[test]
    fn candidates_are_sorted_most_recent_first() {
        let fx = fixture();
        fs::create_dir_all(&fx.backup_dir).expect("backup dir");

        let oldest = fx.backup_dir.join("gateway.json.20240101-000000");
        let middle = fx.backup_dir.join("gateway.json.20240201-000000");
        let newest = fx.backup_dir.join("gateway.json.20240301-000000");
        for path in [&oldest, &middle, &newest] {
            fs::write(path, b"backup").expect("write backup");
        }
        set_mtime(&oldest, 300);
        set_mtime(&middle, 200);
        set_mtime(&newest, 100);

        let got = fx.keeper.candidates();
        assert_eq!(got, vec![newest, middle, oldest]);
    }

    #[test]
    fn candidates_merge_native_bak_files_and_dedupe() {
        let fx = fixture();
        fs::write(&fx.config_path, b"live").expect("write config");
        let native = fx.config_path.with_file_name("gateway.json.bak");
        let native_dated = fx.config_path.with_file_name("gateway.json.bak-20240301");
        fs::write(&native, b"native").expect("write native bak");
        fs::write(&native_dated, b"native dated").expect("write dated bak");

        let got = fx.keeper.candidates();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&native));
        assert!(got.contains(&native_dated));
        // The live config itself must never appear as a candidate.
        assert!(!got.contains(&fx.config_path));
    }

    #[test]
    fn candidates_empty_when_no_sources_exist() {
        let fx = fixture();
        assert!(fx.keeper.candidates().is_empty());
    }

    #[test]
    fn rollback_copies_best_candidate_over_config() {
        let fx = fixture();
        fs::write(&fx.config_path, b"broken edit").expect("write config");
        fs::create_dir_all(&fx.backup_dir).expect("backup dir");
        let older = fx.backup_dir.join("gateway.json.20240101-000000");
        let newer = fx.backup_dir.join("gateway.json.20240201-000000");
        fs::write(&older, b"old bytes").expect("write older");
        fs::write(&newer, b"good bytes").expect("write newer");
        set_mtime(&older, 200);
        set_mtime(&newer, 100);

        assert!(fx.keeper.rollback_to_best(&fx.log));
        assert_eq!(fs::read(&fx.config_path).expect("read config"), b"good bytes");
    }

    #[test]
    fn rollback_without_candidates_reports_false() {
        let fx = fixture();
        fs::write(&fx.config_path, b"whatever").expect("write config");
        assert!(!fx.keeper.rollback_to_best(&fx.log));
        assert_eq!(fs::read(&fx.config_path).expect("read config"), b"whatever");
    }

    #[test]
    fn state_roundtrips_and_loads_leniently() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/state.json");

        let missing = load_state(&path);
        assert_eq!(missing, SupervisorState::default());

        let state = SupervisorState {
            last_config_hash: "abc".to_string(),
            last_backup: "/tmp/b1".to_string(),
            last_good_backup: "/tmp/g1".to_string(),
        };
        save_state(&path, &state).expect("save state");
        assert_eq!(load_state(&path), state);

        fs::write(&path, b"{not json").expect("corrupt state");
        assert_eq!(load_state(&path), SupervisorState::default());
    }
}
