//! Runtime configuration.
//!
//! The report location is resolved once from the environment and cached for
//! the rest of the process. Embedders that know their private data directory
//! pass a [`CrashConfig`] explicitly instead.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Fixed name of the report file inside the data directory.
pub const CRASH_FILE_NAME: &str = "flux_crash_report.json";

/// Environment variable naming the data directory.
pub const ENV_CRASH_DIR: &str = "FLUX_CRASH_DIR";

/// Cached environment configuration.
static CONFIG: OnceLock<CrashConfig> = OnceLock::new();

/// Where crash reports live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashConfig {
    data_dir: PathBuf,
}

impl CrashConfig {
    /// Use `data_dir` as the application's private storage directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Read the configuration from `FLUX_CRASH_DIR`, falling back to a
    /// directory under the system temp dir.
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os(ENV_CRASH_DIR)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("flux_crash_handler"));
        Self { data_dir }
    }

    /// The directory holding the report file.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Full path of the report file.
    pub fn report_path(&self) -> PathBuf {
        self.data_dir.join(CRASH_FILE_NAME)
    }
}

/// Returns the cached environment configuration.
/// The environment is read exactly once per process.
#[inline]
pub fn config() -> &'static CrashConfig {
    CONFIG.get_or_init(CrashConfig::from_env)
}
