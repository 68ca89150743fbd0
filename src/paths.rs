//! Well-known per-user file locations

use std::path::{Path, PathBuf};

const APP_DIR: &str = "lazyconnect";

/// Files the daemon and client agree on
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub dir: PathBuf,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
    pub daemon_log: PathBuf,
    pub vpn_log: PathBuf,
    pub options: PathBuf,
}

impl DaemonPaths {
    /// All files under `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            socket: dir.join("daemon.sock"),
            pid_file: dir.join("daemon.pid"),
            daemon_log: dir.join("daemon.log"),
            vpn_log: dir.join("vpn.log"),
            options: dir.join("daemon.toml"),
            dir,
        }
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }
}

impl Default for DaemonPaths {
    fn default() -> Self {
        Self::in_dir(config_dir())
    }
}

/// Config directory (respects XDG_CONFIG_HOME and HOME)
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return Path::new(&home).join(".config").join(APP_DIR);
    }

    if let Some(config) = dirs::config_dir() {
        return config.join(APP_DIR);
    }

    PathBuf::from(".").join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_dir_layout() {
        let paths = DaemonPaths::in_dir("/tmp/lc-test");
        assert_eq!(paths.socket, PathBuf::from("/tmp/lc-test/daemon.sock"));
        assert_eq!(paths.pid_file, PathBuf::from("/tmp/lc-test/daemon.pid"));
        assert_eq!(paths.vpn_log, PathBuf::from("/tmp/lc-test/vpn.log"));
        assert_eq!(paths.daemon_log, PathBuf::from("/tmp/lc-test/daemon.log"));
    }

    #[test]
    fn test_default_dir_ends_with_app_name() {
        let paths = DaemonPaths::default();
        assert!(paths.dir.ends_with(APP_DIR));
    }
}
