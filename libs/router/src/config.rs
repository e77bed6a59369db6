use std::net::SocketAddr;

use serde::Deserialize;
use switchboard_core::Timeout;
use switchboard_fabric::message::DEFAULT_MAX_PAYLOAD;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8181";
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Router service settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen: SocketAddr,
    /// Messages queued per connection before sends are refused.
    pub outbox_capacity: usize,
    pub max_payload: usize,
    pub send_timeout: Timeout,
    pub receive_timeout: Timeout,
    /// How long a fresh connection may take to send its `RouterConnect`.
    pub connect_timeout: Timeout,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8181)),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            send_timeout: Timeout::Millis(5_000),
            receive_timeout: Timeout::Infinite,
            connect_timeout: Timeout::Millis(5_000),
        }
    }
}

impl RouterConfig {
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    pub fn outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn send_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.send_timeout = timeout.into();
        self
    }

    pub fn receive_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.receive_timeout = timeout.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.connect_timeout = timeout.into();
        self
    }
}

/// Router client settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub outbox_capacity: usize,
    pub connect_timeout: Timeout,
    pub send_timeout: Timeout,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            connect_timeout: Timeout::Millis(5_000),
            send_timeout: Timeout::Millis(5_000),
        }
    }
}

impl ClientConfig {
    pub fn outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    pub fn connect_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.connect_timeout = timeout.into();
        self
    }

    pub fn send_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.send_timeout = timeout.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_listen_matches_constant() {
        assert_eq!(
            RouterConfig::default().listen,
            DEFAULT_LISTEN.parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RouterConfig = serde_json::from_str(
            r#"{ "listen": "0.0.0.0:9000", "receive_timeout": { "millis": 250 } }"#,
        )
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.receive_timeout, Timeout::Millis(250));
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
        assert_eq!(config.send_timeout, Timeout::Millis(5_000));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(ClientConfig::default().outbox_capacity(0).outbox_capacity, 1);
    }
}
