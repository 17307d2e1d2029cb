use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "hermes")]
#[command(about = "Token-authenticated message relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "HERMES_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "HERMES_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Path to the JSON relay descriptor (watched for changes).
    #[arg(long, default_value = "config.json", env = "HERMES_CONFIG")]
    pub config: PathBuf,
    /// Path to the persisted token record.
    #[arg(long, default_value = "tokens.txt", env = "HERMES_TOKENS")]
    pub tokens: PathBuf,
    /// Seconds a communicator has to present its token after connecting.
    #[arg(long, default_value = "10", env = "HERMES_AUTH_TIMEOUT")]
    pub auth_timeout: u64,
    /// Envelopes queued per communicator before dispatch waits.
    #[arg(long, default_value = "256", env = "HERMES_SEND_QUEUE")]
    pub send_queue: usize,
    /// Write logs to a file instead of stderr.
    #[arg(long, env = "HERMES_LOG_FILE")]
    pub log_file: Option<PathBuf>,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Path to the JSON relay descriptor.
    pub config_path: PathBuf,
    /// Path to the persisted token record.
    pub tokens_path: PathBuf,
    /// Token handshake timeout in seconds.
    pub auth_timeout: u64,
    /// Per-communicator writer queue capacity.
    pub send_queue: usize,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_timeout == 0 {
            return Err("auth_timeout must be greater than 0".to_string());
        }
        if self.auth_timeout > 300 {
            return Err("auth_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.send_queue == 0 {
            return Err("send_queue must be greater than 0".to_string());
        }
        if self.send_queue > 65_536 {
            return Err("send_queue exceeds reasonable limit (65536 envelopes)".to_string());
        }

        if self.config_path == self.tokens_path {
            return Err("config and tokens must be different files".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            config_path: args.config,
            tokens_path: args.tokens,
            auth_timeout: args.auth_timeout,
            send_queue: args.send_queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:8080".parse().unwrap(),
            metrics_addr: "127.0.0.1:9090".parse().unwrap(),
            config_path: PathBuf::from("config.json"),
            tokens_path: PathBuf::from("tokens.txt"),
            auth_timeout: 10,
            send_queue: 256,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn auth_timeout_zero() {
        let mut c = valid_config();
        c.auth_timeout = 0;
        assert!(c.validate().unwrap_err().contains("auth_timeout"));
    }

    #[test]
    fn auth_timeout_too_large() {
        let mut c = valid_config();
        c.auth_timeout = 301;
        assert!(c.validate().unwrap_err().contains("auth_timeout"));
    }

    #[test]
    fn send_queue_zero() {
        let mut c = valid_config();
        c.send_queue = 0;
        assert!(c.validate().unwrap_err().contains("send_queue"));
    }

    #[test]
    fn send_queue_too_large() {
        let mut c = valid_config();
        c.send_queue = 65_537;
        assert!(c.validate().unwrap_err().contains("send_queue"));
    }

    #[test]
    fn same_file_for_config_and_tokens() {
        let mut c = valid_config();
        c.tokens_path = c.config_path.clone();
        assert!(c.validate().unwrap_err().contains("different files"));
    }

    #[test]
    fn defaults_from_cli() {
        let args = Args::parse_from(["hermes"]);
        let c: ServerConfig = args.into();
        assert_eq!(c.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(c.config_path, PathBuf::from("config.json"));
        assert_eq!(c.tokens_path, PathBuf::from("tokens.txt"));
        assert_eq!(c.auth_timeout, 10);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn verbose_flag_counts() {
        let args = Args::parse_from(["hermes", "-vv", "--config", "relay.json"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, PathBuf::from("relay.json"));
    }
}
