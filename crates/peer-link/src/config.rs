use std::env;
use std::time::Duration;

use crate::channel::{ChannelOptions, DEFAULT_CHANNEL_LABEL, DEFAULT_MAX_RETRANSMITS};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/relay";
/// 16KB keeps the data channel's send buffer small on every browser stack.
pub const DEFAULT_BUFFER_THRESHOLD: usize = 16 * 1024;
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// Settings shared by the negotiation session and the chunk transport.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    pub ice_servers: Vec<IceServer>,
    pub channel: ChannelOptions,
    /// Single threshold: sends pause above it and resume on the buffer-low signal.
    pub buffer_threshold: usize,
    pub registration_timeout: Duration,
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            channel: ChannelOptions::default(),
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let relay_url = env::var("PEER_LINK_RELAY_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
        let ice_servers = if env_truthy("PEER_LINK_DISABLE_STUN") {
            vec![]
        } else {
            vec![IceServer::stun(DEFAULT_STUN_URL)]
        };
        let label = env::var("PEER_LINK_CHANNEL_LABEL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CHANNEL_LABEL.to_string());
        let max_retransmits = env::var("PEER_LINK_MAX_RETRANSMITS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRANSMITS);

        Self {
            relay_url,
            ice_servers,
            channel: ChannelOptions {
                label,
                ordered: true,
                max_retransmits: Some(max_retransmits),
            },
            buffer_threshold: parse_usize_env(
                "PEER_LINK_BUFFER_THRESHOLD",
                DEFAULT_BUFFER_THRESHOLD,
                1,
            ),
            registration_timeout: parse_duration_ms_env(
                "PEER_LINK_REGISTRATION_TIMEOUT_MS",
                DEFAULT_REGISTRATION_TIMEOUT,
            ),
            negotiation_timeout: parse_duration_ms_env(
                "PEER_LINK_NEGOTIATION_TIMEOUT_MS",
                DEFAULT_NEGOTIATION_TIMEOUT,
            ),
        }
    }

    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    relay_url: Option<String>,
    ice_servers: Option<Vec<IceServer>>,
    channel: Option<ChannelOptions>,
    buffer_threshold: Option<usize>,
    registration_timeout: Option<Duration>,
    negotiation_timeout: Option<Duration>,
}

impl SessionConfigBuilder {
    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.get_or_insert_with(Vec::new).push(IceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.get_or_insert_with(Vec::new).push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }

    /// Host candidates only.
    pub fn without_ice_servers(mut self) -> Self {
        self.ice_servers = Some(vec![]);
        self
    }

    pub fn channel(mut self, channel: ChannelOptions) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn buffer_threshold(mut self, threshold: usize) -> Self {
        self.buffer_threshold = Some(threshold);
        self
    }

    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = Some(timeout);
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> SessionConfig {
        let mut config = SessionConfig::default();
        if let Some(url) = self.relay_url {
            config.relay_url = url;
        }
        if let Some(servers) = self.ice_servers {
            config.ice_servers = servers;
        }
        if let Some(channel) = self.channel {
            config.channel = channel;
        }
        if let Some(threshold) = self.buffer_threshold {
            config.buffer_threshold = threshold;
        }
        if let Some(timeout) = self.registration_timeout {
            config.registration_timeout = timeout;
        }
        if let Some(timeout) = self.negotiation_timeout {
            config.negotiation_timeout = timeout;
        }
        config
    }
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    env::var(var)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .map(|value| value.max(min))
        .unwrap_or(default)
}

fn parse_duration_ms_env(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
