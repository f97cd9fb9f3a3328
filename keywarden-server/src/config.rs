//! Server configuration: CLI flags with environment-variable overrides.
//!
//! Flags are parsed first; any `KW_*` environment variable that is set
//! replaces the flag value afterwards.

use clap::Parser;
use std::path::PathBuf;

/// Default maximum size of a sealed secret, in bytes.
pub const DEFAULT_MAX_SECRET_SIZE: u32 = 50 * 1024 * 1024;
/// Default token validity period, in seconds.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 30 * 60;

/// Keywarden vault server.
#[derive(Debug, Clone, Parser)]
#[command(name = "keywarden-server", about = "Keywarden vault server")]
pub struct ServerConfig {
    /// Listen address in host:port form [env: KW_ADDRESS]
    #[arg(short, long, default_value = "127.0.0.1:3200")]
    pub address: String,

    /// Database type (only sqlite is supported) [env: KW_DB_TYPE]
    #[arg(short = 'D', long, default_value = "sqlite")]
    pub db_type: String,

    /// Database DSN; for sqlite this is the database file path [env: KW_DB_DSN]
    #[arg(short = 'd', long, default_value = "keywarden.db")]
    pub db_dsn: PathBuf,

    /// Path to the TLS certificate file (.pem) [env: KW_TLS_CERT]
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to the TLS certificate key file (.key) [env: KW_TLS_KEY]
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Disable TLS. Connections are served in cleartext [env: KW_DISABLE_TLS]
    #[arg(long)]
    pub disable_tls: bool,

    /// Log level (trace/debug/info/warn/error) [env: KW_LOG_LEVEL]
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Maximum secret size in bytes [env: KW_MAX_SECRET]
    #[arg(short, long, default_value_t = DEFAULT_MAX_SECRET_SIZE)]
    pub max_secret_size: u32,

    /// Server key used to seal auth tokens. Must be exactly 32 bytes
    /// [env: KW_SERVER_KEY]
    #[arg(short = 'k', long, default_value = "")]
    pub server_key: String,

    /// Token validity period in seconds [env: KW_TOKEN_EXP]
    #[arg(short = 't', long, default_value_t = DEFAULT_TOKEN_TTL_SECS)]
    pub token_ttl_secs: u64,
}

impl ServerConfig {
    /// Parse flags, then let environment variables override them.
    pub fn from_flags_and_env() -> anyhow::Result<Self> {
        let mut cfg = Self::parse();
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Replace flag values with whatever the environment provides.
    fn apply_env_overrides<F>(&mut self, get: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("KW_ADDRESS") {
            self.address = v;
        }
        if let Some(v) = get("KW_DB_TYPE") {
            self.db_type = v;
        }
        if let Some(v) = get("KW_DB_DSN") {
            self.db_dsn = PathBuf::from(v);
        }
        if let Some(v) = get("KW_TLS_CERT") {
            self.tls_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = get("KW_TLS_KEY") {
            self.tls_key = Some(PathBuf::from(v));
        }
        if let Some(v) = get("KW_DISABLE_TLS") {
            self.disable_tls = parse_bool("KW_DISABLE_TLS", &v)?;
        }
        if let Some(v) = get("KW_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("KW_MAX_SECRET") {
            self.max_secret_size = v
                .parse()
                .map_err(|_| anyhow::anyhow!("KW_MAX_SECRET must be a byte count, got '{v}'"))?;
        }
        if let Some(v) = get("KW_SERVER_KEY") {
            self.server_key = v;
        }
        if let Some(v) = get("KW_TOKEN_EXP") {
            self.token_ttl_secs = v
                .parse()
                .map_err(|_| anyhow::anyhow!("KW_TOKEN_EXP must be seconds, got '{v}'"))?;
        }
        Ok(())
    }

    /// Validate cross-field constraints that clap cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.db_type != "sqlite" {
            anyhow::bail!("unsupported database type '{}'", self.db_type);
        }
        if self.server_key.len() != 32 {
            anyhow::bail!(
                "server key must be exactly 32 bytes, got {}",
                self.server_key.len()
            );
        }
        if !self.disable_tls && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            anyhow::bail!("TLS certificate and key are required unless --disable-tls is set");
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => anyhow::bail!("{key} must be a boolean, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn base_args() -> Vec<&'static str> {
        vec!["keywarden-server", "--server-key", KEY]
    }

    #[test]
    fn defaults_parse() {
        let mut args = base_args();
        args.push("--disable-tls");
        let cfg = ServerConfig::try_parse_from(args).unwrap();
        assert_eq!(cfg.address, "127.0.0.1:3200");
        assert_eq!(cfg.max_secret_size, DEFAULT_MAX_SECRET_SIZE);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_flags() {
        let mut cfg = ServerConfig::try_parse_from([
            "keywarden-server",
            "--address",
            "10.0.0.1:9999",
            "--server-key",
            KEY,
            "--disable-tls",
        ])
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("KW_ADDRESS", "127.0.0.1:3200"),
            ("KW_MAX_SECRET", "4096"),
            ("KW_DISABLE_TLS", "false"),
        ]);
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.address, "127.0.0.1:3200");
        assert_eq!(cfg.max_secret_size, 4096);
        assert!(!cfg.disable_tls);
    }

    #[test]
    fn malformed_env_values_rejected() {
        let mut cfg = ServerConfig::try_parse_from(base_args()).unwrap();
        assert!(cfg
            .apply_env_overrides(|key| (key == "KW_MAX_SECRET").then(|| "lots".to_string()))
            .is_err());
        assert!(cfg
            .apply_env_overrides(|key| (key == "KW_DISABLE_TLS").then(|| "maybe".to_string()))
            .is_err());
    }

    #[test]
    fn short_server_key_rejected() {
        let cfg = ServerConfig::try_parse_from([
            "keywarden-server",
            "--server-key",
            "short",
            "--disable-tls",
        ])
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let cfg = ServerConfig::try_parse_from(base_args()).unwrap();
        assert!(cfg.validate().is_err());
    }
}
