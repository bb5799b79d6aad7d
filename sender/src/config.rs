//! Sender configuration: broker connection, listen address, and the
//! per-model admission and timeout settings read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use gateway_core::{GatewayError, Result};

/// Every environment variable a Sender process reads at startup.
#[derive(Debug, Parser)]
#[command(name = "sender", version, about = "HTTP front door for the inference gateway")]
pub struct SenderConfig {
    /// AMQP broker URL.
    #[arg(long, env = "AMQP_URL")]
    pub amqp_url: String,

    /// Address the HTTP server binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// How long a Call waits for a dispatch reply before giving up (spec
    /// §6 `MESSAGE_TIMEOUT`, default matches the original's 570s headroom
    /// under a 600s reverse-proxy timeout).
    #[arg(long, env = "MESSAGE_TIMEOUT", value_parser = parse_seconds, default_value = "570")]
    pub message_timeout: Duration,

    /// JSON object describing registered callers: `token -> {name,
    /// priority?, threshold?, organization?, default_routing_mode?}`.
    #[arg(long, env = "USERS")]
    pub users: String,
}

fn parse_seconds(raw: &str) -> std::result::Result<Duration, String> {
    raw.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
}

impl SenderConfig {
    /// Parse from `std::env::args()` plus environment variables.
    pub fn load() -> Result<Self> {
        Self::try_parse().map_err(|e| GatewayError::config(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let cfg = SenderConfig::try_parse_from([
            "sender",
            "--amqp-url",
            "amqp://localhost",
            "--users",
            "{}",
        ])
        .unwrap();
        assert_eq!(cfg.message_timeout, Duration::from_secs(570));
    }
}
