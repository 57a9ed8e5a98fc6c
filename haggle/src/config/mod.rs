//! Configuration system for the `haggle` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/haggle/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error. The auth token is never
//! read from the config file.

use std::path::PathBuf;
use std::time::Duration;

use haggle_proto::message::UserId;

use crate::transport::Credentials;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
    transport: TransportFileConfig,
    send: SendFileConfig,
    timeline: TimelineFileConfig,
    offers: OffersFileConfig,
    typing: TypingFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_url: Option<String>,
    socket_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user_id: Option<String>,
}

/// `[transport]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
    reconnect_initial_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
}

/// `[send]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SendFileConfig {
    ack_timeout_secs: Option<u64>,
}

/// `[timeline]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TimelineFileConfig {
    match_window_secs: Option<u64>,
    page_limit: Option<u16>,
}

/// `[offers]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OffersFileConfig {
    buffer_window_secs: Option<u64>,
    buffer_capacity: Option<usize>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    debounce_ms: Option<u64>,
    remote_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for re-establishing the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts before giving up and settling in `Disconnected`.
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (zero-based): doubles each time,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        self.initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            max_attempts: 8,
        }
    }
}

/// Socket connection settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Timeout for the server's `authenticated` frame.
    pub handshake_timeout: Duration,
    /// Capacity of the transport event broadcast channel.
    pub event_buffer: usize,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            event_buffer: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Optimistic send settings.
#[derive(Debug, Clone, Copy)]
pub struct SendConfig {
    /// How long to wait for the server's acknowledgement before rolling back.
    pub ack_timeout: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Timeline merge settings.
#[derive(Debug, Clone, Copy)]
pub struct TimelineConfig {
    /// Maximum `created_at` distance for a confirmed message to supersede a
    /// provisional one it does not reference explicitly.
    pub match_window: Duration,
    /// Default page size for history loads.
    pub page_limit: u16,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            match_window: Duration::from_secs(60),
            page_limit: 20,
        }
    }
}

/// Buffer for offer events that arrive before their message.
#[derive(Debug, Clone, Copy)]
pub struct OfferBufferConfig {
    /// How long an unmatched event is kept before being discarded.
    pub window: Duration,
    /// Maximum number of distinct order ids held; oldest are evicted first.
    pub capacity: usize,
}

impl Default for OfferBufferConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            capacity: 256,
        }
    }
}

/// Typing indicator settings.
#[derive(Debug, Clone, Copy)]
pub struct TypingConfig {
    /// Idle time after the last keystroke before `stop` is sent.
    pub debounce: Duration,
    /// Idle time after which a remote "typing" state expires on its own.
    pub remote_timeout: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            remote_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything needed to open a session against the backend.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// REST base URL.
    pub api_url: String,
    /// Socket URL (ws:// or wss://).
    pub socket_url: String,
    /// Login credentials.
    pub credentials: Credentials,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    // -- Server --
    /// REST base URL.
    pub api_url: Option<String>,
    /// Socket URL.
    pub socket_url: Option<String>,
    /// REST request timeout.
    pub request_timeout: Duration,

    // -- Session --
    /// Local user id.
    pub user_id: Option<String>,
    /// Bearer token (CLI/env only).
    pub token: Option<String>,
    /// Counterpart to open on start.
    pub counterpart: Option<String>,

    // -- Engine --
    /// Socket settings.
    pub transport: TransportConfig,
    /// Send settings.
    pub send: SendConfig,
    /// Timeline settings.
    pub timeline: TimelineConfig,
    /// Offer buffer settings.
    pub offers: OfferBufferConfig,
    /// Typing settings.
    pub typing: TypingConfig,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

impl ClientConfig {
    /// Configuration with every compiled default and no session.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ..Self::default()
        }
    }

    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or the default file exists but is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::defaults();
        let reconnect = ReconnectConfig {
            initial_delay: file
                .transport
                .reconnect_initial_delay_ms
                .map_or(defaults.transport.reconnect.initial_delay, Duration::from_millis),
            max_delay: file
                .transport
                .reconnect_max_delay_ms
                .map_or(defaults.transport.reconnect.max_delay, Duration::from_millis),
            max_attempts: file
                .transport
                .reconnect_max_attempts
                .unwrap_or(defaults.transport.reconnect.max_attempts),
        };

        Self {
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            socket_url: cli
                .socket_url
                .clone()
                .or_else(|| file.server.socket_url.clone()),
            request_timeout: file
                .server
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            user_id: cli.user_id.clone().or_else(|| file.session.user_id.clone()),
            token: cli.token.clone(),
            counterpart: cli.counterpart.clone(),
            transport: TransportConfig {
                connect_timeout: file
                    .transport
                    .connect_timeout_secs
                    .map_or(defaults.transport.connect_timeout, Duration::from_secs),
                handshake_timeout: file
                    .transport
                    .handshake_timeout_secs
                    .map_or(defaults.transport.handshake_timeout, Duration::from_secs),
                event_buffer: file
                    .transport
                    .event_buffer
                    .unwrap_or(defaults.transport.event_buffer),
                reconnect,
            },
            send: SendConfig {
                ack_timeout: file
                    .send
                    .ack_timeout_secs
                    .map_or(defaults.send.ack_timeout, Duration::from_secs),
            },
            timeline: TimelineConfig {
                match_window: file
                    .timeline
                    .match_window_secs
                    .map_or(defaults.timeline.match_window, Duration::from_secs),
                page_limit: file
                    .timeline
                    .page_limit
                    .unwrap_or(defaults.timeline.page_limit),
            },
            offers: OfferBufferConfig {
                window: file
                    .offers
                    .buffer_window_secs
                    .map_or(defaults.offers.window, Duration::from_secs),
                capacity: file
                    .offers
                    .buffer_capacity
                    .unwrap_or(defaults.offers.capacity),
            },
            typing: TypingConfig {
                debounce: file
                    .typing
                    .debounce_ms
                    .map_or(defaults.typing.debounce, Duration::from_millis),
                remote_timeout: file
                    .typing
                    .remote_timeout_ms
                    .map_or(defaults.typing.remote_timeout, Duration::from_millis),
            },
        }
    }

    /// Build a [`SessionConfig`] if URLs, user id and token are all present.
    #[must_use]
    pub fn to_session(&self) -> Option<SessionConfig> {
        let api_url = self.api_url.clone()?;
        let socket_url = self.socket_url.clone()?;
        let user_id = self.user_id.clone().filter(|u| !u.is_empty())?;
        let token = self.token.clone().filter(|t| !t.is_empty())?;

        Some(SessionConfig {
            api_url,
            socket_url,
            credentials: Credentials::new(UserId::new(user_id), token),
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless marketplace chat client")]
pub struct CliArgs {
    /// REST base URL of the marketplace backend.
    #[arg(long, env = "HAGGLE_API_URL")]
    pub api_url: Option<String>,

    /// Socket URL of the marketplace backend.
    #[arg(long, env = "HAGGLE_SOCKET_URL")]
    pub socket_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "HAGGLE_USER_ID")]
    pub user_id: Option<String>,

    /// Bearer token used for the socket handshake and REST calls.
    #[arg(long, env = "HAGGLE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// User to open a conversation with.
    #[arg(long)]
    pub counterpart: Option<String>,

    /// Path to config file (default: `~/.config/haggle/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HAGGLE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/haggle.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("haggle").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
