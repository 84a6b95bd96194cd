//! Server, app and retry settings.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tablesync_protocol::DEFAULT_PROTOCOL_VERSION;

/// Settings for syncing one app against one server.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server URL (e.g., "https://aggregate.example.com").
    pub server_url: String,
    /// App name; selects the `/odktables/{app}/` namespace.
    pub app_name: String,
    /// Client version used in manifest and file paths.
    pub client_version: String,
    /// Bearer token, if the server requires one.
    pub access_token: Option<String>,
    /// Protocol version sent on every request.
    pub protocol_version: String,
    /// Local folder holding the app files.
    pub app_folder: PathBuf,
    /// Whether app-level and table-level files found locally are uploaded.
    pub push_local_files: bool,
    /// Whether row attachments found locally are uploaded.
    pub push_local_instance_files: bool,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Connect and read timeout for every request.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Settings with defaults: client version "2", 30 s timeout, uploads on.
    pub fn new(server_url: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            app_name: app_name.into(),
            client_version: "2".into(),
            access_token: None,
            protocol_version: DEFAULT_PROTOCOL_VERSION.into(),
            app_folder: PathBuf::from("."),
            push_local_files: true,
            push_local_instance_files: true,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the bearer token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Sets the client version.
    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Sets the local app folder.
    pub fn with_app_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.app_folder = folder.into();
        self
    }

    /// Enables or disables uploading of local app and table files.
    pub fn with_push_local_files(mut self, push: bool) -> Self {
        self.push_local_files = push;
        self
    }

    /// Enables or disables uploading of local row attachments.
    pub fn with_push_local_instance_files(mut self, push: bool) -> Self {
        self.push_local_instance_files = push;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Root of the app's table service, ending in `/`.
    pub fn odktables_root(&self) -> String {
        tablesync_protocol::normalize_uri(
            &self.server_url,
            &format!("/odktables/{}/", self.app_name),
        )
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "default")
    }
}

/// How a failed table pass is retried.
///
/// The delay doubles (or grows by `factor`) from `initial_delay` up to
/// `max_delay`. With jitter, up to a quarter of the delay is added so that
/// devices failing together do not retry together.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts per table pass, counting the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth per retry.
    pub factor: u32,
    /// Add up to 25% random delay.
    pub jitter: bool,
}

impl RetryConfig {
    /// Retries up to `max_attempts - 1` times with a 500 ms starting delay.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2,
            jitter: true,
        }
    }

    /// One attempt, no retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1,
            jitter: false,
        }
    }

    /// Sets the first delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps every delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth per retry.
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Makes delays exact.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt follows attempt number `attempt` (0 is the first).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts.max(1)
    }

    /// Delay before attempt number `attempt`; zero for the first attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retry) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let delay = self
            .factor
            .checked_pow(retry)
            .and_then(|growth| self.initial_delay.checked_mul(growth))
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        if self.jitter {
            delay + delay.mul_f64(0.25 * jitter_fraction())
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A value in `[0, 1)` taken from the clock.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1024) / 1024.0
}
