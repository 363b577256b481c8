//! Polling the script directory for edits

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::loader::is_ignored;
use crate::reload::ReloadController;

/// Default scan interval (1000ms = 1Hz)
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(1000);

/// Differences between two scans
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Scripts whose modification time moved, with the new time
    pub changed: Vec<(PathBuf, SystemTime)>,
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ScanResult {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Detects added, changed and removed script files by modification time
pub struct ScriptScanner {
    script_dir: PathBuf,
    extensions: BTreeSet<String>,
    scan_interval: Duration,
    cached_state: HashMap<PathBuf, SystemTime>,
}

impl ScriptScanner {
    /// Scanner for `.toml` files at the default interval
    pub fn new(script_dir: PathBuf) -> Self {
        Self::with_interval(script_dir, DEFAULT_SCAN_INTERVAL)
    }

    pub fn with_interval(script_dir: PathBuf, scan_interval: Duration) -> Self {
        Self::with_extensions(script_dir, scan_interval, ["toml"])
    }

    /// Scanner that watches files with any of `extensions`. Files present
    /// now are not reported as added by the first scan.
    pub fn with_extensions<I, S>(script_dir: PathBuf, scan_interval: Duration, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let extensions: BTreeSet<String> = extensions.into_iter().map(Into::into).collect();
        let cached_state = scripts_in_dir(&script_dir, &extensions);
        Self {
            script_dir,
            extensions,
            scan_interval,
            cached_state,
        }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    /// Number of script files seen by the last scan
    pub fn known_scripts(&self) -> usize {
        self.cached_state.len()
    }

    /// Compare the directory against the last scan and remember what is there now
    pub fn scan_changes(&mut self) -> ScanResult {
        debug!(
            target: "scripting",
            "Scanning script directory for changes: {}",
            self.script_dir.display()
        );

        let current_state = scripts_in_dir(&self.script_dir, &self.extensions);
        let mut result = ScanResult::default();

        for (path, modified) in &current_state {
            match self.cached_state.get(path) {
                Some(cached) if cached != modified => {
                    debug!(target: "scripting", "Script changed: {}", path.display());
                    result.changed.push((path.clone(), *modified));
                }
                Some(_) => {}
                None => {
                    debug!(target: "scripting", "Script added: {}", path.display());
                    result.added.push(path.clone());
                }
            }
        }

        for path in self.cached_state.keys() {
            if !current_state.contains_key(path) {
                debug!(target: "scripting", "Script removed: {}", path.display());
                result.removed.push(path.clone());
            }
        }

        self.cached_state = current_state;
        result
    }
}

fn scripts_in_dir(
    script_dir: &Path,
    extensions: &BTreeSet<String>,
) -> HashMap<PathBuf, SystemTime> {
    let mut scripts = HashMap::new();

    if !script_dir.exists() {
        return scripts;
    }

    let entries = match std::fs::read_dir(script_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                target: "scripting",
                "Failed to read script directory {}: {}",
                script_dir.display(),
                e
            );
            return scripts;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if is_ignored(&path) {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| extensions.contains(ext));
        if !matches {
            continue;
        }

        match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => {
                scripts.insert(path, modified);
            }
            Err(e) => {
                warn!(
                    target: "scripting",
                    "Failed to get modification time for {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    scripts
}

/// Poll `scanner` until the controller shuts down, requesting a reload
/// whenever the directory changes
pub async fn watch_script_dir(mut scanner: ScriptScanner, controller: ReloadController) {
    info!(
        target: "scripting",
        "Watching {} for script changes every {:?}",
        scanner.script_dir().display(),
        scanner.scan_interval()
    );

    let mut ticker = tokio::time::interval(scanner.scan_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if controller.is_shut_down() {
            break;
        }

        let result = scanner.scan_changes();
        if result.has_changes() {
            info!(
                target: "scripting",
                "Script changes detected ({} added, {} changed, {} removed)",
                result.added.len(),
                result.changed.len(),
                result.removed.len()
            );
            controller.request_reload();
        }
    }
    debug!(target: "scripting", "Script directory watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_scanner_defaults() {
        let dir = PathBuf::from("/tmp/test");
        let scanner = ScriptScanner::new(dir.clone());

        assert_eq!(scanner.script_dir(), dir.as_path());
        assert_eq!(scanner.scan_interval(), DEFAULT_SCAN_INTERVAL);

        let custom = ScriptScanner::with_interval(dir, Duration::from_millis(250));
        assert_eq!(custom.scan_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_existing_files_are_not_added() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("lights.toml")).unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf());
        assert_eq!(scanner.known_scripts(), 1);
        assert!(!scanner.scan_changes().has_changes());
        assert_eq!(scanner.known_scripts(), 1);
    }

    #[test]
    fn test_detects_added_changed_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let kept = temp_dir.path().join("kept.toml");
        let dropped = temp_dir.path().join("dropped.toml");
        File::create(&kept).unwrap();
        File::create(&dropped).unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf());

        let modified = SystemTime::now() + Duration::from_secs(5);
        File::options()
            .write(true)
            .open(&kept)
            .and_then(|f| f.set_modified(modified))
            .unwrap();
        fs::remove_file(&dropped).unwrap();
        let added = temp_dir.path().join("added.toml");
        let mut file = File::create(&added).unwrap();
        file.write_all(b"[[rules]]").unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.added, vec![added]);
        assert_eq!(result.changed, vec![(kept, modified)]);
        assert_eq!(result.removed, vec![dropped]);
    }

    #[test]
    fn test_ignores_other_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf());

        File::create(temp_dir.path().join("notes.txt")).unwrap();
        File::create(temp_dir.path().join(".lights.toml")).unwrap();
        File::create(temp_dir.path().join("lights.toml~")).unwrap();

        assert!(!scanner.scan_changes().has_changes());
        assert_eq!(scanner.known_scripts(), 0);
    }

    #[test]
    fn test_custom_extensions() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner = ScriptScanner::with_extensions(
            temp_dir.path().to_path_buf(),
            DEFAULT_SCAN_INTERVAL,
            ["rules", "toml"],
        );

        File::create(temp_dir.path().join("a.rules")).unwrap();
        File::create(temp_dir.path().join("b.toml")).unwrap();

        assert_eq!(scanner.scan_changes().added.len(), 2);
    }

    #[test]
    fn test_handles_missing_directory() {
        let mut scanner = ScriptScanner::new(PathBuf::from("/tmp/this_does_not_exist_12345"));
        assert!(!scanner.scan_changes().has_changes());
    }
}
