//! Configuration for the session controller
//!
//! Features that were compile-time switches in older builds of the client
//! library (application trust check, administration interface, file cache)
//! are runtime flags here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ClientError, Result};

/// Default directory holding named shared memory and semaphore objects.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Default cache prefix for per-application data.
pub const DEFAULT_CACHE_PREFIX: &str = "/Data/mnt-c";

/// Name of the backup blacklist file inside the application cache folder.
pub const BACKUP_BLACKLIST_FILE: &str = "BackupFileList.info";

/// Default path template of the resource configuration table.
pub const DEFAULT_RCT_TEMPLATE: &str = "/Data/mnt-wt/{app}/{table}";

/// Default resource configuration table name.
pub const DEFAULT_RCT_TABLE: &str = "resource-table-cfg.itz";

/// Maximum application identity length, terminator slot included.
pub const DEFAULT_MAX_APP_ID_LEN: usize = 64;

/// Default number of shutdown cancels permitted per session.
pub const DEFAULT_MAX_CANCEL: u32 = 3;

/// Default bound on the event-loop join during teardown.
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 30_000;

/// Trust gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Path template with `{app}` and `{table}` placeholders
    pub path_template: String,

    /// Resource configuration table name substituted for `{table}`
    pub table_name: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            path_template: DEFAULT_RCT_TEMPLATE.to_string(),
            table_name: DEFAULT_RCT_TABLE.to_string(),
        }
    }
}

impl TrustConfig {
    /// Render the resource configuration table path for an application.
    pub fn rct_path(&self, app: &str) -> PathBuf {
        PathBuf::from(
            self.path_template
                .replace("{app}", app)
                .replace("{table}", &self.table_name),
        )
    }
}

/// Configuration for the session controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory scanned for stale shared memory and semaphores
    pub shm_dir: PathBuf,

    /// Prefix of the per-application cache folders
    pub cache_prefix: PathBuf,

    /// Backup blacklist file name inside the application cache folder
    pub blacklist_file_name: String,

    /// Trust gate; `None` disables the application check
    pub app_check: Option<TrustConfig>,

    /// Register with the administration service
    pub admin_interface: bool,

    /// Initialize the file cache collaborator
    pub file_cache: bool,

    /// Shutdown cancels permitted per session
    pub max_cancel: u32,

    /// Maximum application identity length, terminator slot included
    pub max_app_id_len: usize,

    /// Bound on the event-loop join; `None` waits indefinitely
    pub join_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            cache_prefix: PathBuf::from(DEFAULT_CACHE_PREFIX),
            blacklist_file_name: BACKUP_BLACKLIST_FILE.to_string(),
            app_check: None,
            admin_interface: false,
            file_cache: false,
            max_cancel: DEFAULT_MAX_CANCEL,
            max_app_id_len: DEFAULT_MAX_APP_ID_LEN,
            join_timeout_ms: Some(DEFAULT_JOIN_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the controller cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_app_id_len < 2 {
            return Err(ClientError::Config(format!(
                "max_app_id_len must be at least 2, got {}",
                self.max_app_id_len
            )));
        }
        if let Some(trust) = &self.app_check
            && !trust.path_template.contains("{app}")
        {
            return Err(ClientError::Config(format!(
                "trust path template has no {{app}} placeholder: {}",
                trust.path_template
            )));
        }
        Ok(())
    }

    /// Set the shared memory directory
    #[must_use]
    pub fn with_shm_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.shm_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the cache prefix
    #[must_use]
    pub fn with_cache_prefix<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_prefix = path.as_ref().to_path_buf();
        self
    }

    /// Enable the trust gate
    #[must_use]
    pub fn with_app_check(mut self, trust: TrustConfig) -> Self {
        self.app_check = Some(trust);
        self
    }

    /// Enable or disable administration service registration
    #[must_use]
    pub const fn with_admin_interface(mut self, enable: bool) -> Self {
        self.admin_interface = enable;
        self
    }

    /// Enable or disable the file cache collaborator
    #[must_use]
    pub const fn with_file_cache(mut self, enable: bool) -> Self {
        self.file_cache = enable;
        self
    }

    /// Set the shutdown cancel budget
    #[must_use]
    pub const fn with_max_cancel(mut self, max_cancel: u32) -> Self {
        self.max_cancel = max_cancel;
        self
    }

    /// Set the event-loop join bound
    #[must_use]
    pub const fn with_join_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.join_timeout_ms = match timeout {
            Some(timeout) => Some(timeout.as_millis() as u64),
            None => None,
        };
        self
    }

    /// Event-loop join bound as a duration.
    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_ms.map(Duration::from_millis)
    }

    /// Path of the backup blacklist for an application.
    ///
    /// `<cache_prefix>/<app>/BackupFileList.info`
    pub fn blacklist_path(&self, app: &str) -> PathBuf {
        self.cache_prefix.join(app).join(&self.blacklist_file_name)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.shm_dir, Path::new("/dev/shm"));
        assert_eq!(config.max_cancel, 3);
        assert!(config.app_check.is_none());
        assert_eq!(config.join_timeout(), Some(Duration::from_secs(30)));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_blacklist_path() {
        let config = ClientConfig::default().with_cache_prefix("/Data/mnt-c");
        assert_eq!(
            config.blacklist_path("navi"),
            Path::new("/Data/mnt-c/navi/BackupFileList.info")
        );
    }

    #[test]
    fn test_rct_path() {
        let trust = TrustConfig::default();
        assert_eq!(
            trust.rct_path("navi"),
            Path::new("/Data/mnt-wt/navi/resource-table-cfg.itz")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.max_app_id_len = 1;
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));

        let config = ClientConfig::default().with_app_check(TrustConfig {
            path_template: "/Data/{table}".to_string(),
            table_name: DEFAULT_RCT_TABLE.to_string(),
        });
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pcl.json");
        std::fs::write(
            &path,
            r#"{ "shm_dir": "/tmp/shm", "max_cancel": 5, "app_check": {} }"#,
        )
        .expect("write");

        let config = ClientConfig::load(&path).expect("load");
        assert_eq!(config.shm_dir, Path::new("/tmp/shm"));
        assert_eq!(config.max_cancel, 5);
        assert_eq!(config.app_check, Some(TrustConfig::default()));
        assert_eq!(config.max_app_id_len, DEFAULT_MAX_APP_ID_LEN);
    }

    #[test]
    fn test_join_timeout_builder() {
        let config = ClientConfig::default().with_join_timeout(None);
        assert_eq!(config.join_timeout(), None);
        let config = config.with_join_timeout(Some(Duration::from_millis(250)));
        assert_eq!(config.join_timeout_ms, Some(250));
    }
}
