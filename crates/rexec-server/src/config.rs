use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use librexec::ManagerConfig;

pub const DEFAULT_RPC_LISTEN: &str = "127.0.0.1:50151";
pub const DEFAULT_STREAM_LISTEN: &str = "127.0.0.1:50152";
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;
pub const DEFAULT_LOG_FILTER: &str = "rexec_server=info,librexec=info,rexec_git=info,audit=info";

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "rexec remote execution server")]
pub struct Cli {
    /// TOML config file. Defaults to ~/.config/rexec/config.toml when present.
    #[arg(long, env = "REXEC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Request/response (gRPC) listen address.
    #[arg(long, env = "REXEC_RPC_LISTEN")]
    pub rpc_listen: Option<SocketAddr>,

    /// Push-channel (websocket) listen address.
    #[arg(long, env = "REXEC_STREAM_LISTEN")]
    pub stream_listen: Option<SocketAddr>,

    /// Shared HS256 secret used to verify bearer credentials.
    #[arg(long, env = "REXEC_AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Wait after SIGTERM before escalating to SIGKILL.
    #[arg(long)]
    pub grace_period_ms: Option<u64>,

    #[arg(long)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a bearer credential signed with the configured secret.
    Token {
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "86400")]
        ttl_secs: u64,
    },
}

/// On-disk configuration. Every key is optional; CLI flags win.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub rpc_listen: Option<SocketAddr>,
    pub stream_listen: Option<SocketAddr>,
    pub auth_secret: Option<String>,
    pub grace_period_ms: Option<u64>,
    pub output_queue_capacity: Option<usize>,
    pub broadcast_capacity: Option<usize>,
    pub closed_session_retention: Option<usize>,
    pub log_filter: Option<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub rpc_listen: SocketAddr,
    pub stream_listen: SocketAddr,
    pub auth_secret: String,
    pub grace_period: Duration,
    pub output_queue_capacity: usize,
    pub broadcast_capacity: usize,
    pub closed_session_retention: usize,
    pub log_filter: String,
}

impl ServerConfig {
    /// CLI > config file > defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::read(path)?,
            None => {
                let path = rexec_protocol::paths::config_path();
                if path.exists() {
                    FileConfig::read(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Self::resolve(cli, file)
    }

    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let defaults = ManagerConfig::default();
        let config = Self {
            rpc_listen: match cli.rpc_listen.or(file.rpc_listen) {
                Some(addr) => addr,
                None => DEFAULT_RPC_LISTEN.parse()?,
            },
            stream_listen: match cli.stream_listen.or(file.stream_listen) {
                Some(addr) => addr,
                None => DEFAULT_STREAM_LISTEN.parse()?,
            },
            auth_secret: cli
                .auth_secret
                .clone()
                .or(file.auth_secret)
                .unwrap_or_default(),
            grace_period: Duration::from_millis(
                cli.grace_period_ms
                    .or(file.grace_period_ms)
                    .unwrap_or(DEFAULT_GRACE_PERIOD_MS),
            ),
            output_queue_capacity: file
                .output_queue_capacity
                .unwrap_or(defaults.output_queue_capacity),
            broadcast_capacity: file.broadcast_capacity.unwrap_or(1024),
            closed_session_retention: file
                .closed_session_retention
                .unwrap_or(defaults.closed_session_retention),
            log_filter: cli
                .log_filter
                .clone()
                .or(file.log_filter)
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_secret.trim().is_empty() {
            bail!("auth secret is required (--auth-secret or REXEC_AUTH_SECRET)");
        }
        if self.grace_period.is_zero() {
            bail!("grace period must be > 0");
        }
        if self.output_queue_capacity == 0
            || self.broadcast_capacity == 0
            || self.closed_session_retention == 0
        {
            bail!("queue, broadcast and retention capacities must be > 0");
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            grace_period: self.grace_period,
            output_queue_capacity: self.output_queue_capacity,
            closed_session_retention: self.closed_session_retention,
            ..ManagerConfig::default()
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("rpc_listen", &self.rpc_listen)
            .field("stream_listen", &self.stream_listen)
            .field("auth_secret", &"<redacted>")
            .field("grace_period", &self.grace_period)
            .field("output_queue_capacity", &self.output_queue_capacity)
            .field("broadcast_capacity", &self.broadcast_capacity)
            .field("closed_session_retention", &self.closed_session_retention)
            .field("log_filter", &self.log_filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with_secret() -> Cli {
        Cli {
            auth_secret: Some("s3cret".to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn defaults_apply() {
        let config = ServerConfig::resolve(&cli_with_secret(), FileConfig::default())
            .expect("config");
        assert_eq!(config.rpc_listen.to_string(), DEFAULT_RPC_LISTEN);
        assert_eq!(config.stream_listen.to_string(), DEFAULT_STREAM_LISTEN);
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.output_queue_capacity, 256);
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            rpc_listen = "0.0.0.0:7000"
            stream_listen = "0.0.0.0:7001"
            auth_secret = "from-file"
            grace_period_ms = 100
            broadcast_capacity = 16
            "#,
        )
        .expect("toml");
        let cli = Cli {
            rpc_listen: Some("127.0.0.1:9000".parse().expect("addr")),
            grace_period_ms: Some(250),
            ..Cli::default()
        };
        let config = ServerConfig::resolve(&cli, file).expect("config");
        assert_eq!(config.rpc_listen.port(), 9000);
        assert_eq!(config.stream_listen.port(), 7001);
        assert_eq!(config.auth_secret, "from-file");
        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.broadcast_capacity, 16);
    }

    #[test]
    fn rejects_missing_secret_and_zero_values() {
        assert!(ServerConfig::resolve(&Cli::default(), FileConfig::default()).is_err());

        let zero_grace = Cli {
            grace_period_ms: Some(0),
            ..cli_with_secret()
        };
        assert!(ServerConfig::resolve(&zero_grace, FileConfig::default()).is_err());

        let file = FileConfig {
            output_queue_capacity: Some(0),
            ..FileConfig::default()
        };
        assert!(ServerConfig::resolve(&cli_with_secret(), file).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("listen = \"x\"").is_err());
    }

    #[test]
    fn debug_hides_secret() {
        let config = ServerConfig::resolve(&cli_with_secret(), FileConfig::default())
            .expect("config");
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
