//! Broker configuration shared by the worker and gateway binaries.
//!
//! Each binary flattens [`BrokerArgs`] into its own CLI and converts it into a
//! validated [`BrokerConfig`]. Values come from CLI flags or environment
//! variables (a `.env` file is loaded first by the binaries).

use anyhow::bail;
use clap::{Args, ValueEnum};
use core::fmt;
use core::time::Duration;

/// Broker connection and topology arguments.
#[derive(Args, Clone)]
pub struct BrokerArgs {
    /// Broker user name.
    ///
    /// Environment variable: `MQ_USER`
    #[arg(long, env = "MQ_USER", default_value = "guest")]
    pub mq_user: String,

    /// Broker password. Never logged.
    ///
    /// Environment variable: `MQ_PASSWORD`
    #[arg(long, env = "MQ_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub mq_password: String,

    /// Broker host name.
    ///
    /// Environment variable: `MQ_HOST`
    #[arg(long, env = "MQ_HOST", default_value = "localhost")]
    pub mq_host: String,

    /// Broker AMQP port.
    ///
    /// Environment variable: `MQ_PORT`
    #[arg(long, env = "MQ_PORT", default_value_t = 5672)]
    pub mq_port: u16,

    /// How many times a failed dial is retried at startup before giving up.
    ///
    /// Environment variable: `MQ_CONNECT_RETRIES`
    #[arg(long, env = "MQ_CONNECT_RETRIES", default_value_t = 20)]
    pub mq_connect_retries: usize,

    /// Fixed delay between dial attempts, in milliseconds.
    ///
    /// Environment variable: `MQ_CONNECT_DELAY_MS`
    #[arg(long, env = "MQ_CONNECT_DELAY_MS", default_value_t = 500)]
    pub mq_connect_delay_ms: u64,

    /// Name of the shared work queue consumed by workers.
    ///
    /// Environment variable: `MQ_LLM_Q`
    #[arg(long, env = "MQ_LLM_Q", default_value = "llm_q")]
    pub mq_llm_q: String,

    /// Name of the fanout exchange carrying cancellation broadcasts.
    ///
    /// Environment variable: `MQ_CANCEL_EX`
    #[arg(long, env = "MQ_CANCEL_EX", default_value = "llm_cancel_ex")]
    pub mq_cancel_ex: String,
}

impl fmt::Debug for BrokerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerArgs")
            .field("mq_user", &self.mq_user)
            .field("mq_host", &self.mq_host)
            .field("mq_port", &self.mq_port)
            .field("mq_llm_q", &self.mq_llm_q)
            .field("mq_cancel_ex", &self.mq_cancel_ex)
            .finish_non_exhaustive()
    }
}

/// Queue and exchange names both roles must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub work_queue: String,
    pub cancel_exchange: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            work_queue: "llm_q".to_owned(),
            cancel_exchange: "llm_cancel_ex".to_owned(),
        }
    }
}

#[derive(Clone)]
pub struct BrokerConfig {
    uri: String,
    redacted_uri: String,
    pub connect_retries: usize,
    pub connect_delay: Duration,
    pub topology: Topology,
}

impl BrokerConfig {
    /// AMQP URI including credentials.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("uri", &self.redacted_uri)
            .field("connect_retries", &self.connect_retries)
            .field("connect_delay", &self.connect_delay)
            .field("topology", &self.topology)
            .finish()
    }
}

impl TryFrom<BrokerArgs> for BrokerConfig {
    type Error = anyhow::Error;

    fn try_from(args: BrokerArgs) -> Result<Self, Self::Error> {
        if args.mq_host.is_empty() {
            bail!("MQ_HOST must not be empty");
        }
        if args.mq_llm_q.is_empty() {
            bail!("MQ_LLM_Q must not be empty");
        }
        if args.mq_cancel_ex.is_empty() {
            bail!("MQ_CANCEL_EX must not be empty");
        }

        Ok(Self {
            uri: format!(
                "amqp://{}:{}@{}:{}",
                args.mq_user, args.mq_password, args.mq_host, args.mq_port
            ),
            redacted_uri: format!("amqp://{}:***@{}:{}", args.mq_user, args.mq_host, args.mq_port),
            connect_retries: args.mq_connect_retries,
            connect_delay: Duration::from_millis(args.mq_connect_delay_ms),
            topology: Topology {
                work_queue: args.mq_llm_q,
                cancel_exchange: args.mq_cancel_ex,
            },
        })
    }
}

/// Console log layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
