//! Core configuration.
//!
//! [`Config`] carries the tunables shared by the API layer and the default
//! services. The server binary fills it from its YAML file and CLI flags.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    DEFAULT_SPEAKER_PORT, EVENT_CHANNEL_CAPACITY, STATUS_INTERVAL_PACKETS,
    WS_HEARTBEAT_CHECK_INTERVAL_SECS, WS_HEARTBEAT_TIMEOUT_SECS,
};

/// Configuration for the OnAir core.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    // Server
    /// Port for the HTTP/WS server (0 = first free port in the default range).
    pub bind_port: u16,

    // WebSocket
    /// Idle time after which a control connection is closed (seconds).
    pub ws_heartbeat_timeout_secs: u64,

    /// Interval between idle checks (seconds).
    pub ws_heartbeat_check_interval_secs: u64,

    /// A `status` reply is sent after every N-th audio packet.
    pub status_interval_packets: u64,

    // Events
    /// Capacity of the lifecycle event broadcast channel.
    pub event_channel_capacity: usize,

    // Fan-out
    /// UDP port used for speakers whose address carries no port.
    pub speaker_port: u16,
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.ws_heartbeat_check_interval_secs == 0 {
            return Err("ws_heartbeat_check_interval_secs must be >= 1".to_string());
        }
        if self.ws_heartbeat_timeout_secs <= self.ws_heartbeat_check_interval_secs {
            return Err(
                "ws_heartbeat_timeout_secs must exceed ws_heartbeat_check_interval_secs"
                    .to_string(),
            );
        }
        if self.status_interval_packets == 0 {
            return Err("status_interval_packets must be >= 1".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err(
                "event_channel_capacity must be >= 1 (broadcast::channel panics on 0)".to_string(),
            );
        }
        if self.speaker_port == 0 {
            return Err("speaker_port must be non-zero".to_string());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_port: 0,
            ws_heartbeat_timeout_secs: WS_HEARTBEAT_TIMEOUT_SECS,
            ws_heartbeat_check_interval_secs: WS_HEARTBEAT_CHECK_INTERVAL_SECS,
            status_interval_packets: STATUS_INTERVAL_PACKETS,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
            speaker_port: DEFAULT_SPEAKER_PORT,
        }
    }
}
