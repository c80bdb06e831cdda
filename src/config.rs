//! Configuration for the broker, the frame client, and the correlated
//! call façade.
//!
//! The crate is a library: callers normally fill these structs directly
//! and supply their own routing prefix, logger, and callbacks. The
//! `from_env` loaders exist for deployments that configure through the
//! environment.

use std::time::Duration;

use crate::error::FpcpError;

/// Smallest poll window and HTTP timeout the transport will accept.
const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the scene-processor-side broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a GET is held open when no request is pending. Also the
    /// sweep cadence; mailboxes idle for three windows are evicted.
    pub poll_window: Duration,
    /// Maximum multipart POST body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_window: Duration::from_secs(10),
            max_body_bytes: 50 * 1024 * 1024,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FPCP_POLL_WINDOW_SECS` (default: 10): GET hold duration
    /// - `FPCP_MAX_BODY_BYTES` (default: 52428800): multipart body cap
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_window = std::env::var("FPCP_POLL_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_window);

        let max_body_bytes = std::env::var("FPCP_MAX_BODY_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_body_bytes);

        Self {
            poll_window,
            max_body_bytes,
        }
    }

    /// The poll window with the 1-second floor applied.
    pub(crate) fn effective_poll_window(&self) -> Duration {
        self.poll_window.max(MIN_TIMEOUT)
    }
}

/// Configuration for the frame-processor-side client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity of this frame processor; becomes the path parameter on
    /// every GET and POST.
    pub fp_id: String,
    /// Base URL of the broker, up to and excluding the fp id segment.
    pub base_url: String,
    /// Per-request HTTP timeout. Must cover the poll window or every
    /// long poll dies as a client timeout.
    pub http_timeout: Duration,
    /// Value of the `timeout` query parameter on polls, in seconds.
    /// Zero omits the parameter and leaves the hold time to the broker.
    pub poll_timeout_secs: u64,
}

impl ClientConfig {
    /// Create a config with the given identity and broker URL, using
    /// default timeouts.
    pub fn new(fp_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            fp_id: fp_id.into(),
            base_url: base_url.into(),
            http_timeout: Duration::from_secs(30),
            poll_timeout_secs: 10,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FPCP_FP_ID` (required): frame processor identity
    /// - `FPCP_BASE_URL` (required): broker base URL
    /// - `FPCP_HTTP_TIMEOUT_SECS` (default: 30): per-request timeout
    /// - `FPCP_POLL_TIMEOUT_SECS` (default: 10): `timeout` query value
    ///
    /// # Errors
    ///
    /// Returns `FpcpError::Transport` when a required variable is unset.
    pub fn from_env() -> Result<Self, FpcpError> {
        let fp_id = std::env::var("FPCP_FP_ID").map_err(|_| FpcpError::Transport {
            reason: "FPCP_FP_ID environment variable is required".to_string(),
        })?;
        let base_url = std::env::var("FPCP_BASE_URL").map_err(|_| FpcpError::Transport {
            reason: "FPCP_BASE_URL environment variable is required".to_string(),
        })?;

        let mut config = Self::new(fp_id, base_url);

        if let Some(secs) = std::env::var("FPCP_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = std::env::var("FPCP_POLL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.poll_timeout_secs = secs;
        }

        Ok(config)
    }

    /// The HTTP timeout with the 1-second floor applied.
    pub(crate) fn effective_http_timeout(&self) -> Duration {
        self.http_timeout.max(MIN_TIMEOUT)
    }
}

/// Configuration for the correlated call façade.
#[derive(Debug, Clone)]
pub struct SceneProcessorConfig {
    /// Ceiling for each synchronous `get_image`/`get_person` call.
    pub call_timeout: Duration,
}

impl Default for SceneProcessorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl SceneProcessorConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FPCP_CALL_TIMEOUT_SECS` (default: 30): synchronous call ceiling
    #[must_use]
    pub fn from_env() -> Self {
        let call_timeout = std::env::var("FPCP_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Self::default().call_timeout);

        Self { call_timeout }
    }
}
