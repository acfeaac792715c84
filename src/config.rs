use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Port the node listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8011;

/// Keep-alive PING period.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Frames buffered between a peer's socket reader and its dispatcher.
pub const DISPATCH_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not find config directory")]
    NoConfigDir,
    #[error("Username must be 1 to 65535 bytes")]
    BadUsername,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub listen: SocketAddr,
    pub connect: Vec<SocketAddr>,
    pub watch: bool,
    pub data_dir: PathBuf,
    pub keepalive: Duration,
}

impl Config {
    pub fn new(username: impl Into<String>, data_dir: PathBuf) -> Result<Self, ConfigError> {
        let username = username.into();
        if username.is_empty() || username.len() > u16::MAX as usize {
            return Err(ConfigError::BadUsername);
        }
        Ok(Self {
            username,
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            connect: Vec::new(),
            watch: false,
            data_dir,
            keepalive: KEEPALIVE_INTERVAL,
        })
    }
}

/// `~/.config/lansync` (or the platform equivalent).
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join("lansync"))
}

/// Resolves an explicit `--data-dir` or falls back to the default.
pub fn data_dir(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(dir) => Ok(dir),
        None => default_data_dir(),
    }
}

/// Seconds since the epoch as carried on the wire. Times before 1970 map
/// to 0 and times past 2106 saturate.
pub fn unix_seconds(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("alice", PathBuf::from("/tmp/lansync")).unwrap();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.keepalive, Duration::from_secs(2));
        assert!(!config.watch);
    }

    #[test]
    fn rejects_empty_username() {
        assert!(matches!(
            Config::new("", PathBuf::from("/tmp")),
            Err(ConfigError::BadUsername)
        ));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let dir = data_dir(Some(PathBuf::from("/srv/lansync"))).unwrap();
        assert_eq!(dir, PathBuf::from("/srv/lansync"));
    }

    #[test]
    fn wire_seconds_clamp() {
        assert_eq!(unix_seconds(UNIX_EPOCH + Duration::from_secs(1_700_000_000)), 1_700_000_000);
        assert_eq!(unix_seconds(UNIX_EPOCH - Duration::from_secs(5)), 0);
        assert_eq!(unix_seconds(UNIX_EPOCH + Duration::from_secs(1 << 40)), u32::MAX);
    }
}
