//! Configuration structures for the update system.
//!
//! Every option is optional. Defaults: three concurrent downloads, three
//! retries per package, delete policy taken from the manifest ("none" when
//! the manifest is silent), one-second fixed delay between file retries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::manifest::{DeleteMethod, Server};
use crate::session::SessionPaths;
use crate::version::AppVersion;

/// Main update configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Ordered upgrade sources, tried in turn
    #[serde(default)]
    pub servers: Vec<Server>,

    /// Full manifest URL; replaces the server list when set
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Version of the running application (defaults to the crate version)
    #[serde(default)]
    pub current_version: Option<AppVersion>,

    /// Application root (defaults to the executable's directory)
    #[serde(default)]
    pub app_dir: Option<PathBuf>,

    /// Directory under which per-session temp roots are created
    #[serde(default)]
    pub temp_root: Option<PathBuf>,

    /// Existing session root to reuse, so an interrupted run can resume
    #[serde(default)]
    pub session_root: Option<PathBuf>,

    /// Download scheduling
    #[serde(default)]
    pub download: DownloadConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// File installation
    #[serde(default)]
    pub install: InstallConfig,

    /// Session policy overrides
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that can never produce a manifest URL.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.servers.is_empty() && self.manifest_url.is_none() {
            return Err(UpdateError::NoServers);
        }
        for server in &self.servers {
            server.manifest_url()?;
        }
        if let Some(url) = &self.manifest_url {
            url::Url::parse(url)?;
        }
        Ok(())
    }

    /// Application root, from configuration or the running executable.
    pub fn resolve_app_dir(&self) -> Result<PathBuf, UpdateError> {
        if let Some(dir) = &self.app_dir {
            return Ok(dir.clone());
        }
        let exe = std::env::current_exe()?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| UpdateError::ConfigError("executable has no parent directory".into()))
    }

    /// Current application version, from configuration or the crate version.
    pub fn resolve_current_version(&self) -> Result<AppVersion, UpdateError> {
        match self.current_version {
            Some(v) => Ok(v),
            None => env!("CARGO_PKG_VERSION").parse(),
        }
    }

    /// Base directory for session temp roots.
    pub fn resolve_temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("self-updater"))
    }

    /// The configured session root, or a fresh one under the temp root.
    pub fn session_paths(&self) -> SessionPaths {
        match &self.session_root {
            Some(root) => SessionPaths::new(root),
            None => SessionPaths::unique_under(&self.resolve_temp_root()),
        }
    }
}

/// Download scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Number of concurrent download workers (minimum 1)
    #[serde(default = "default_multiple_download_count")]
    pub multiple_download_count: usize,

    /// Retries per package before the batch fails
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            multiple_download_count: default_multiple_download_count(),
            max_retry_count: default_max_retry_count(),
        }
    }
}

impl DownloadConfig {
    pub fn worker_count(&self) -> usize {
        self.multiple_download_count.max(1)
    }
}

/// Network configuration for manifest and package transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Read timeout for streaming transfers in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// Proxy URL (empty = system proxy)
    #[serde(default)]
    pub proxy: Option<String>,

    /// Credentials for the proxy, or for the server when no proxy is set
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            read_timeout_seconds: default_read_timeout(),
            proxy: None,
            credentials: None,
            user_agent: default_user_agent(),
        }
    }
}

/// Basic-auth credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// File installation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Overrides the manifest's delete policy
    #[serde(default)]
    pub delete_method: Option<DeleteMethod>,

    /// Extra delete rules, appended to the manifest's
    #[serde(default)]
    pub delete_rules: Vec<String>,

    /// Relative paths never deleted or overwritten during retirement
    #[serde(default)]
    pub preserved_files: Vec<String>,

    /// Retry policy for locked files
    #[serde(default)]
    pub retry: FileRetryConfig,
}

/// Fixed-interval retry settings for file operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRetryConfig {
    /// Delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,

    /// Attempts to delete a retired file
    #[serde(default = "default_delete_attempts")]
    pub delete_attempts: u32,

    /// Attempts to back up a file about to be overwritten
    #[serde(default = "default_backup_attempts")]
    pub backup_attempts: u32,

    /// Attempts to copy a new file into place
    #[serde(default = "default_copy_attempts")]
    pub copy_attempts: u32,

    /// Attempts to remove an installed file from staging
    #[serde(default = "default_copy_attempts")]
    pub cleanup_attempts: u32,
}

impl Default for FileRetryConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_retry_delay_ms(),
            delete_attempts: default_delete_attempts(),
            backup_attempts: default_backup_attempts(),
            copy_attempts: default_copy_attempts(),
            cleanup_attempts: default_copy_attempts(),
        }
    }
}

impl FileRetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Session policy overrides.
///
/// Values set here are the starting point; a manifest with `mustUpdate`
/// can only raise them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub force_update: bool,

    #[serde(default)]
    pub must_update: bool,

    #[serde(default)]
    pub auto_kill_processes: bool,

    #[serde(default)]
    pub auto_end_processes_in_app_dir: bool,

    /// Process exit code used when termination is requested
    #[serde(default)]
    pub exit_code: i32,
}

// Default value functions for serde
fn default_multiple_download_count() -> usize {
    3
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("self-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_delete_attempts() -> u32 {
    10
}

fn default_backup_attempts() -> u32 {
    20
}

fn default_copy_attempts() -> u32 {
    10
}
