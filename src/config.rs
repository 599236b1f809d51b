use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub history: HistoryConfig,
    pub screen_name: ScreenNameConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_private_key_path: Option<String>,
    pub jwt_public_key_path: String,
    pub token_expiry: u64,
    pub registration_enabled: bool,
}

/// Retention bounds for the rolling per-channel message history (§4.5).
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub max_count_per_channel: i64,
    pub max_age_secs: i64,
}

/// Screen-name validation bounds (§Glossary / §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenNameConfig {
    pub min_length: usize,
    pub max_length: usize,
    pub pattern: String,
}

/// Relay-wide toggles and trust policy (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub anonymous_mode_enabled: bool,
    pub welcome_enabled: bool,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl AppConfig {
    /// Load configuration from `walkie-relay.toml`, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("WALKIE_CONFIG").unwrap_or_else(|_| "walkie-relay.toml".to_string());

        let builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8787)?
            .set_default("database.max_connections", 10)?
            .set_default("auth.jwt_public_key_path", "keys/public.pem")?
            .set_default("auth.token_expiry", 86400)?
            .set_default("auth.registration_enabled", true)?
            .set_default("history.max_count_per_channel", 10)?
            .set_default("history.max_age_secs", 300)?
            .set_default("screen_name.min_length", 2)?
            .set_default("screen_name.max_length", 20)?
            .set_default("screen_name.pattern", "^[A-Za-z0-9_-]+$")?
            .set_default("relay.anonymous_mode_enabled", true)?
            .set_default("relay.welcome_enabled", true)?
            .set_default("relay.trusted_proxies", Vec::<String>::new())?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?;

        let builder = if Path::new(&config_path).exists() {
            builder.add_source(config::File::with_name(&config_path))
        } else {
            tracing::warn!("Config file '{}' not found, using defaults", config_path);
            builder
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("WALKIE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        Ok(config)
    }
}
