use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use sse::controller::ControllerConfig;
use sse::upstream::{Credentials, HttpUpstreamConfig, UpstreamTarget, DEFAULT_API_KEY_HEADER};
use std::time::Duration;

/// Live vehicle positions for every rapid transit line.
pub const DEFAULT_UPSTREAM_URL: &str = "https://api-v3.mbta.com/vehicles?filter[route]=Red,Orange,Blue,Green-B,Green-C,Green-D,Green-E,Mattapan";

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:5173"
    )]
    pub allowed_origins: Vec<String>,

    /// The provider's SSE endpoint to relay.
    #[arg(long, env, default_value = DEFAULT_UPSTREAM_URL)]
    upstream_url: String,

    /// The API key to use when calling the provider.
    #[arg(long, env, hide_env_values = true)]
    upstream_api_key: Option<String>,

    /// Request header the provider reads the API key from.
    #[arg(long, env, default_value = DEFAULT_API_KEY_HEADER)]
    upstream_api_key_header: String,

    /// Timeout in seconds for establishing the upstream connection
    #[arg(long, env, default_value_t = 10)]
    pub upstream_connect_timeout_secs: u64,

    /// Seconds to wait before reconnecting after any upstream failure or disconnect
    #[arg(long, env, default_value_t = 5)]
    pub stream_retry_delay_secs: u64,

    /// Number of pending events buffered per client before new events are dropped for it
    #[arg(long, env, default_value_t = 100)]
    pub stream_subscriber_capacity: usize,

    /// Longest upstream line, in bytes, accepted before the session is restarted
    #[arg(long, env, default_value_t = 1024 * 1024)]
    pub stream_max_line_bytes: usize,

    /// Seconds of silence after which a keep-alive comment is sent to clients
    #[arg(long, env, default_value_t = 15)]
    pub stream_keep_alive_secs: u64,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 8080)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }

    /// Returns the provider API key, if configured and not blank.
    pub fn upstream_api_key(&self) -> Option<&str> {
        self.upstream_api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
    }

    /// The upstream endpoint with its credentials, or `None` when no API key
    /// has been configured.
    pub fn upstream_target(&self) -> Option<UpstreamTarget> {
        let key = self.upstream_api_key()?;
        Some(UpstreamTarget::new(
            self.upstream_url.clone(),
            Credentials::ApiKey {
                header: self.upstream_api_key_header.clone(),
                key: key.to_owned(),
            },
        ))
    }

    pub fn http_upstream_config(&self) -> HttpUpstreamConfig {
        HttpUpstreamConfig {
            connect_timeout: Duration::from_secs(self.upstream_connect_timeout_secs),
            ..HttpUpstreamConfig::default()
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            retry_delay: Duration::from_secs(self.stream_retry_delay_secs),
            subscriber_capacity: self.stream_subscriber_capacity,
            max_line_bytes: self.stream_max_line_bytes,
        }
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.stream_keep_alive_secs.max(1))
    }
}
