use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_EXECUTABLE: &str = "cdb.exe";
pub const FALLBACK_EXECUTABLE: &str =
    r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x64\cdb.exe";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(7);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct CdbConfig {
    pub default_executable: PathBuf,
    pub fallback_executable: PathBuf,
    pub explicit_executable: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub command_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for CdbConfig {
    fn default() -> Self {
        Self {
            default_executable: PathBuf::from(DEFAULT_EXECUTABLE),
            fallback_executable: PathBuf::from(FALLBACK_EXECUTABLE),
            explicit_executable: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl CdbConfig {
    pub fn new(explicit_executable: Option<PathBuf>) -> Self {
        Self {
            explicit_executable,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let explicit_executable = std::env::var("CDB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            explicit_executable,
            handshake_timeout: duration_from_env("CDB_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            command_timeout: duration_from_env("CDB_COMMAND_TIMEOUT_MS")
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            stop_grace: duration_from_env("CDB_STOP_GRACE_MS").unwrap_or(DEFAULT_STOP_GRACE),
            ..Self::default()
        }
    }

    pub fn with_fallback_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_executable = path.into();
        self
    }

    pub fn with_default_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_executable = path.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Ordered candidate list: default name, explicit path, fixed fallback.
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn candidate_paths(&self, explicit: Option<PathBuf>) -> Vec<PathBuf> {
        let explicit = explicit.or_else(|| self.explicit_executable.clone());
        let ordered = std::iter::once(self.default_executable.clone())
            .chain(explicit)
            .chain(std::iter::once(self.fallback_executable.clone()));
        dedup_paths(ordered)
    }

    /// Caller-supplied candidates always get the fixed fallback appended.
    pub fn with_fallback(&self, candidates: Vec<PathBuf>) -> Vec<PathBuf> {
        dedup_paths(
            candidates
                .into_iter()
                .chain(std::iter::once(self.fallback_executable.clone())),
        )
    }
}

fn dedup_paths(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut unique: Vec<PathBuf> = Vec::new();
    for path in paths {
        if path.as_os_str().is_empty() || unique.contains(&path) {
            continue;
        }
        unique.push(path);
    }
    unique
}

fn duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CdbConfig::default();
        assert_eq!(config.default_executable, PathBuf::from("cdb.exe"));
        assert_eq!(config.handshake_timeout, Duration::from_secs(7));
        assert_eq!(config.command_timeout, Duration::from_secs(30));
        assert_eq!(config.stop_grace, Duration::from_secs(3));
        assert!(config.explicit_executable.is_none());
    }

    #[test]
    fn test_candidate_paths_order() {
        let config = CdbConfig::default();
        let candidates = config.candidate_paths(Some(PathBuf::from(r"D:\tools\cdb.exe")));
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("cdb.exe"),
                PathBuf::from(r"D:\tools\cdb.exe"),
                PathBuf::from(FALLBACK_EXECUTABLE),
            ]
        );
    }

    #[test]
    fn test_candidate_paths_dedup_keeps_first_occurrence() {
        let config = CdbConfig::default();
        let candidates = config.candidate_paths(Some(PathBuf::from(FALLBACK_EXECUTABLE)));
        assert_eq!(
            candidates,
            vec![PathBuf::from("cdb.exe"), PathBuf::from(FALLBACK_EXECUTABLE)]
        );

        let candidates = config.candidate_paths(Some(PathBuf::from("cdb.exe")));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], PathBuf::from("cdb.exe"));
    }

    #[test]
    fn test_candidate_paths_uses_configured_explicit_path() {
        let config = CdbConfig::new(Some(PathBuf::from("/opt/cdb")));
        let candidates = config.candidate_paths(None);
        assert_eq!(candidates[1], PathBuf::from("/opt/cdb"));

        let overridden = config.candidate_paths(Some(PathBuf::from("/other/cdb")));
        assert_eq!(overridden[1], PathBuf::from("/other/cdb"));
        assert!(!overridden.contains(&PathBuf::from("/opt/cdb")));
    }

    #[test]
    fn test_with_fallback_appends_last_resort() {
        let config = CdbConfig::default().with_fallback_executable("/last/resort");
        let candidates = config.with_fallback(vec![
            PathBuf::from("a"),
            PathBuf::from("b"),
            PathBuf::from("a"),
        ]);
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("a"),
                PathBuf::from("b"),
                PathBuf::from("/last/resort"),
            ]
        );
    }

    #[test]
    fn test_from_env_custom() {
        std::env::set_var("CDB_PATH", r"E:\dbg\cdb.exe");
        std::env::set_var("CDB_COMMAND_TIMEOUT_MS", "5000");
        std::env::set_var("CDB_HANDSHAKE_TIMEOUT_MS", "not-a-number");

        let config = CdbConfig::from_env();
        assert_eq!(
            config.explicit_executable,
            Some(PathBuf::from(r"E:\dbg\cdb.exe"))
        );
        assert_eq!(config.command_timeout, Duration::from_millis(5000));
        assert_eq!(config.handshake_timeout, Duration::from_secs(7));

        std::env::remove_var("CDB_PATH");
        std::env::remove_var("CDB_COMMAND_TIMEOUT_MS");
        std::env::remove_var("CDB_HANDSHAKE_TIMEOUT_MS");
    }
}
