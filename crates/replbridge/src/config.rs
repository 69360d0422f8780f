use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default bound on waiting for the worker's `init` reply.
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;
/// Default length of one bounded blocking read of the shared buffer.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 25;

/// Settings for one execution session.
///
/// Every field has a default, so a config file only needs to name what it
/// changes. Setters follow the builder pattern:
///
/// ```
/// use replbridge::SessionConfig;
/// let config = SessionConfig::new().input_timeout_ms(5_000).package("json");
/// assert_eq!(config.input_timeout(), Some(std::time::Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interpreter asset base, forwarded to the worker in `init`.
    pub base_url: String,
    /// Packages to preload while booting the interpreter.
    pub packages: Vec<String>,
    /// Bound on awaiting the `init` reply. `None` waits forever.
    pub init_timeout_ms: Option<u64>,
    /// Bound on one input rendezvous. `None` waits for the user forever.
    pub input_timeout_ms: Option<u64>,
    /// Length of one bounded read of the shared buffer.
    pub poll_interval_ms: u64,
    /// File extensions (without the dot) the host may run as a whole buffer.
    pub runnable_extensions: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            packages: Vec::new(),
            init_timeout_ms: Some(DEFAULT_INIT_TIMEOUT_MS),
            input_timeout_ms: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            runnable_extensions: vec!["py".to_owned()],
        }
    }
}

impl SessionConfig {
    /// Creates a config with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a config from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Sets the interpreter asset base.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Adds a package to preload during boot.
    #[must_use]
    pub fn package(mut self, name: impl Into<String>) -> Self {
        self.packages.push(name.into());
        self
    }

    /// Sets the `init` reply bound in milliseconds.
    #[must_use]
    pub fn init_timeout_ms(mut self, limit: u64) -> Self {
        self.init_timeout_ms = Some(limit);
        self
    }

    /// Sets the input rendezvous bound in milliseconds.
    #[must_use]
    pub fn input_timeout_ms(mut self, limit: u64) -> Self {
        self.input_timeout_ms = Some(limit);
        self
    }

    /// Sets the shared buffer read slice in milliseconds.
    #[must_use]
    pub fn poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval.max(1);
        self
    }

    /// Replaces the runnable extension list.
    #[must_use]
    pub fn runnable_extensions(mut self, extensions: Vec<String>) -> Self {
        self.runnable_extensions = extensions;
        self
    }

    #[must_use]
    pub fn init_timeout(&self) -> Option<Duration> {
        self.init_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn input_timeout(&self) -> Option<Duration> {
        self.input_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Returns true when a source with this name can be run as a whole buffer.
    ///
    /// Matching is on the final extension, case-sensitive, as editors report it.
    #[must_use]
    pub fn is_runnable(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.runnable_extensions.iter().any(|allowed| allowed == ext))
    }
}
