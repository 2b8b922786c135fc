use crate::prompt::ContextWindow;
use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use quill_core::config::{BrokerArgs, BrokerConfig, LogFormat};

/// Generation backends the worker can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Streams the last user turn back word by word.
    Echo,
}

/// Runtime configuration for the `quill-worker` binary.
///
/// All values are parsed from CLI arguments or environment variables. A
/// worker holds at most one request in flight, so throughput scales by
/// running more worker processes against the same queue.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "quill-worker",
    version,
    about = "Consumes completion requests from the broker and streams generated tokens back"
)]
pub struct CliArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Model context size in tokens.
    ///
    /// Environment variable: `CONTEXT_SIZE`
    #[arg(long, env = "CONTEXT_SIZE", default_value_t = 2048)]
    pub context_size: usize,

    /// Tokens kept free for the generated answer. The prompt may use at most
    /// `CONTEXT_SIZE - RESERVED_TOKENS`.
    ///
    /// Environment variable: `RESERVED_TOKENS`
    #[arg(long, env = "RESERVED_TOKENS", default_value_t = 512)]
    pub reserved_tokens: usize,

    /// How long a cancellation token may stay registered, in seconds.
    ///
    /// Environment variable: `TOKEN_LIFETIME_SECS`
    #[arg(long, env = "TOKEN_LIFETIME_SECS", default_value_t = 1800)]
    pub token_lifetime_secs: u64,

    /// Interval between registry sweeps, in seconds.
    ///
    /// Environment variable: `TOKEN_SWEEP_SECS`
    #[arg(long, env = "TOKEN_SWEEP_SECS", default_value_t = 300)]
    pub token_sweep_secs: u64,

    /// Generation backend.
    ///
    /// Environment variable: `ENGINE`
    #[arg(long, env = "ENGINE", value_enum, default_value_t = EngineKind::Echo)]
    pub engine: EngineKind,

    /// Delay between echoed tokens, in milliseconds.
    ///
    /// Environment variable: `ECHO_TOKEN_DELAY_MS`
    #[arg(long, env = "ECHO_TOKEN_DELAY_MS", default_value_t = 25)]
    pub echo_token_delay_ms: u64,

    /// Maximum number of echoed tokens. Defaults to `RESERVED_TOKENS`.
    ///
    /// Environment variable: `ECHO_MAX_TOKENS`
    #[arg(long, env = "ECHO_MAX_TOKENS")]
    pub echo_max_tokens: Option<usize>,

    /// Capacity of the channel between the engine and the publisher. A full
    /// buffer pauses generation.
    ///
    /// Environment variable: `CHUNK_BUFFER_SIZE`
    #[arg(long, env = "CHUNK_BUFFER_SIZE", default_value_t = 16)]
    pub chunk_buffer_size: usize,

    /// Console log layout.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub window: ContextWindow,
    pub token_lifetime: Duration,
    pub token_sweep: Duration,
    pub engine: EngineKind,
    pub echo_token_delay: Duration,
    pub echo_max_tokens: usize,
    pub chunk_buffer_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            window: ContextWindow {
                context_size: 2048,
                reserved: 512,
            },
            token_lifetime: Duration::from_secs(1800),
            token_sweep: Duration::from_secs(300),
            engine: EngineKind::Echo,
            echo_token_delay: Duration::from_millis(25),
            echo_max_tokens: 512,
            chunk_buffer_size: 16,
        }
    }
}

/// Everything the binary needs, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for Settings {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.context_size == 0 {
            bail!("CONTEXT_SIZE must be greater than 0");
        }
        if args.reserved_tokens >= args.context_size {
            bail!(
                "RESERVED_TOKENS ({}) must be smaller than CONTEXT_SIZE ({})",
                args.reserved_tokens,
                args.context_size
            );
        }
        if args.token_lifetime_secs == 0 {
            bail!("TOKEN_LIFETIME_SECS must be greater than 0");
        }
        if args.token_sweep_secs == 0 {
            bail!("TOKEN_SWEEP_SECS must be greater than 0");
        }
        if args.chunk_buffer_size == 0 {
            bail!("CHUNK_BUFFER_SIZE must be greater than 0");
        }

        Ok(Self {
            broker: BrokerConfig::try_from(args.broker)?,
            worker: WorkerConfig {
                window: ContextWindow {
                    context_size: args.context_size,
                    reserved: args.reserved_tokens,
                },
                token_lifetime: Duration::from_secs(args.token_lifetime_secs),
                token_sweep: Duration::from_secs(args.token_sweep_secs),
                engine: args.engine,
                echo_token_delay: Duration::from_millis(args.echo_token_delay_ms),
                echo_max_tokens: args.echo_max_tokens.unwrap_or(args.reserved_tokens),
                chunk_buffer_size: args.chunk_buffer_size,
            },
            log_format: args.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::try_from(CliArgs::parse_from(["quill-worker"])).unwrap();
        assert_eq!(settings.worker.window.budget(), 1536);
        assert_eq!(settings.worker.echo_max_tokens, 512);
        assert_eq!(settings.worker.token_lifetime, Duration::from_secs(1800));
        assert_eq!(settings.broker.topology.work_queue, "llm_q");
    }

    #[test]
    fn reserved_must_leave_room_for_the_prompt() {
        let args = CliArgs::parse_from([
            "quill-worker",
            "--context-size",
            "512",
            "--reserved-tokens",
            "512",
        ]);
        assert!(Settings::try_from(args).is_err());
    }
}
