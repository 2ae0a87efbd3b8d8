use std::path::PathBuf;
use std::time::Duration;

/// Load balancer configuration.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// How often the event loop checks which strategies are due for a window
    pub tick_interval: Duration,
    /// Bounded wait for a service's properties before `ServiceUnavailable`
    pub resolution_timeout: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            resolution_timeout: Duration::from_secs(5),
        }
    }
}

/// Session coordinator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root of the property tree in the coordination service
    pub base_path: String,
    /// Directory holding the local backup copy of every property
    pub backup_dir: PathBuf,
    /// While this file exists the coordinator never enables the primary store
    pub flag_file: Option<PathBuf>,
    /// `start` falls back to the backup store after this long
    pub initial_connect_timeout: Duration,
    /// Grace period before the load balancer replaced on expiry shuts down
    pub expired_shutdown_delay: Duration,
    pub load_balancer: LoadBalancerConfig,
}

impl SessionConfig {
    pub fn new(base_path: impl Into<String>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            backup_dir: backup_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_path: "/d2".to_string(),
            backup_dir: PathBuf::from("wayfinder-backup"),
            flag_file: None,
            initial_connect_timeout: Duration::from_secs(10),
            expired_shutdown_delay: Duration::from_secs(1),
            load_balancer: LoadBalancerConfig::default(),
        }
    }
}
