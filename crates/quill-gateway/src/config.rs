use crate::session::SessionConfig;
use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use quill_core::config::{BrokerArgs, BrokerConfig, LogFormat};

/// Runtime configuration for the `quill-gateway` binary.
///
/// All values are parsed from CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "quill-gateway",
    version,
    about = "WebSocket front end streaming chat completions from broker workers"
)]
pub struct CliArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Seconds without a client ping before the connection is closed.
    ///
    /// Environment variable: `KEEPALIVE_SECS`
    #[arg(long, env = "KEEPALIVE_SECS", default_value_t = 120)]
    pub keepalive_secs: u64,

    /// Chat turns retained per session and sent along with each request.
    ///
    /// Environment variable: `MAX_HISTORY_MESSAGES`
    #[arg(long, env = "MAX_HISTORY_MESSAGES", default_value_t = 50)]
    pub max_history_messages: usize,

    /// Responses buffered between a request's reply queue and its session.
    ///
    /// Environment variable: `REPLY_BUFFER_SIZE`
    #[arg(long, env = "REPLY_BUFFER_SIZE", default_value_t = 32)]
    pub reply_buffer_size: usize,

    /// Server frames queued per connection before the relay waits on the
    /// client. At least 2.
    ///
    /// Environment variable: `OUTBOUND_BUFFER_SIZE`
    #[arg(long, env = "OUTBOUND_BUFFER_SIZE", default_value_t = 32)]
    pub outbound_buffer_size: usize,

    /// Console log layout.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub broker: BrokerConfig,
    pub server_addr: String,
    pub session: SessionConfig,
    pub reply_buffer_size: usize,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.keepalive_secs == 0 {
            bail!("KEEPALIVE_SECS must be greater than 0");
        }
        if args.reply_buffer_size == 0 {
            bail!("REPLY_BUFFER_SIZE must be greater than 0");
        }
        if args.outbound_buffer_size < 2 {
            bail!("OUTBOUND_BUFFER_SIZE must be at least 2");
        }

        Ok(Self {
            broker: BrokerConfig::try_from(args.broker)?,
            server_addr: args.server_addr,
            session: SessionConfig {
                keepalive: Duration::from_secs(args.keepalive_secs),
                max_history: args.max_history_messages,
                outbound_buffer: args.outbound_buffer_size,
            },
            reply_buffer_size: args.reply_buffer_size,
            log_format: args.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::try_from(CliArgs::parse_from(["quill-gateway"])).unwrap();
        assert_eq!(config.server_addr, "0.0.0.0:8080");
        assert_eq!(config.session.keepalive, Duration::from_secs(120));
        assert_eq!(config.session.max_history, 50);
        assert_eq!(config.session.outbound_buffer, 32);
    }

    #[test]
    fn zero_keepalive_is_rejected() {
        let args = CliArgs::parse_from(["quill-gateway", "--keepalive-secs", "0"]);
        assert!(GatewayConfig::try_from(args).is_err());
    }

    #[test]
    fn outbound_buffer_must_hold_two_frames() {
        let args = CliArgs::parse_from(["quill-gateway", "--outbound-buffer-size", "1"]);
        assert!(GatewayConfig::try_from(args).is_err());

        let args = CliArgs::parse_from(["quill-gateway", "--outbound-buffer-size", "2"]);
        let config = GatewayConfig::try_from(args).unwrap();
        assert_eq!(config.session.outbound_buffer, 2);
    }
}
