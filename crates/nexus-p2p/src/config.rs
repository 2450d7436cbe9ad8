use nexus_common::{Error, Result};

use crate::transport::DataChannelOptions;

const ICE_SERVERS_ENV: &str = "NEXUS_ICE_SERVERS";
const PROXIMITY_ENV: &str = "NEXUS_PROXIMITY_KM";
const REQUIRE_SIGNATURES_ENV: &str = "NEXUS_REQUIRE_SIGNATURES";

/// Tunables for a [`crate::PeerSessionManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// STUN/TURN URLs handed to the transport.
    pub ice_servers: Vec<String>,
    /// Label of the data channel opened by `initialize_peer`.
    pub channel_label: String,
    pub ordered: bool,
    /// Retransmission bound for the data channel.
    pub max_retransmits: u16,
    /// Distance within which an inbound emergency is corroborated.
    pub proximity_radius_km: f64,
    /// Drop unsigned inbound messages instead of delivering them.
    pub require_signatures: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            channel_label: "messageChannel".to_string(),
            ordered: true,
            max_retransmits: 3,
            proximity_radius_km: 1.0,
            require_signatures: false,
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `NEXUS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = env_value(ICE_SERVERS_ENV)? {
            let servers: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if servers.is_empty() {
                return Err(Error::config(format!(
                    "{ICE_SERVERS_ENV} is set but lists no servers"
                )));
            }
            config.ice_servers = servers;
        }

        if let Some(value) = env_value(PROXIMITY_ENV)? {
            let radius: f64 = value
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("{PROXIMITY_ENV}: {e}")))?;
            if !radius.is_finite() || radius < 0.0 {
                return Err(Error::config(format!(
                    "{PROXIMITY_ENV} must be a non-negative number"
                )));
            }
            config.proximity_radius_km = radius;
        }

        if let Some(value) = env_value(REQUIRE_SIGNATURES_ENV)? {
            config.require_signatures = parse_bool(&value).ok_or_else(|| {
                Error::config(format!(
                    "{REQUIRE_SIGNATURES_ENV}: expected a boolean, got {value:?}"
                ))
            })?;
        }

        Ok(config)
    }

    /// Options for the data channel created per peer.
    pub fn channel_options(&self) -> DataChannelOptions {
        DataChannelOptions {
            label: self.channel_label.clone(),
            ordered: self.ordered,
            max_retransmits: Some(self.max_retransmits),
        }
    }
}

fn env_value(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::config(format!("failed to read {name}: {e}"))),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
