//! Fixed protocol constants that should NOT be changed.
//!
//! These values are shared with the browser capture client and the speaker
//! firmware, so changing them breaks interoperability.

// ─────────────────────────────────────────────────────────────────────────────
// Audio Frame Format
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate of every PCM frame handled by the core (Hz).
pub const SAMPLE_RATE: u32 = 48_000;

/// Duration of one audio frame (ms).
///
/// 60 ms is the largest frame Opus accepts in a single packet and keeps the
/// per-packet overhead on the speaker LAN low.
pub const FRAME_DURATION_MS: u32 = 60;

/// Samples per frame at [`SAMPLE_RATE`] and [`FRAME_DURATION_MS`] (2880).
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// Bytes per 16-bit mono PCM frame (5760).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

// ─────────────────────────────────────────────────────────────────────────────
// Opus Encoder Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed Opus target bitrate (bits per second).
pub const OPUS_BITRATE_BPS: i32 = 32_000;

/// Expected packet loss hint for in-band FEC (percent).
pub const OPUS_PACKET_LOSS_PERC: i32 = 10;

/// Upper bound for a single encoded Opus packet (bytes), per libopus docs.
pub const MAX_OPUS_PACKET_BYTES: usize = 4000;

/// Maximum number of concealment frames synthesized for one sequence gap.
///
/// Larger gaps are treated as a stream restart rather than loss.
pub const MAX_CONCEALED_FRAMES: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in logs and the health endpoint.
pub const APP_NAME: &str = "OnAir";

/// Service identifier returned by `/health`.
pub const SERVICE_ID: &str = "onair";

// ─────────────────────────────────────────────────────────────────────────────
// Control Channel
// ─────────────────────────────────────────────────────────────────────────────

/// A `status` message is sent after every N-th audio packet.
pub const STATUS_INTERVAL_PACKETS: u64 = 10;

/// Capacity of the lifecycle event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Capacity of each player's completion event channel.
pub const COMPLETION_CHANNEL_CAPACITY: usize = 64;

/// WebSocket idle timeout (seconds).
pub const WS_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Interval between WebSocket idle checks (seconds).
pub const WS_HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Mixer / Fan-out
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum buffered audio per source in the mixer (ms). Oldest samples are
/// dropped beyond this.
pub const MIXER_MAX_QUEUE_MS: u32 = 1000;

/// Default UDP port speakers listen on when the address carries no port.
pub const DEFAULT_SPEAKER_PORT: u16 = 5004;

/// Default volume level applied when a channel has no persisted levels.
pub const DEFAULT_VOLUME_LEVEL: u8 = 80;

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// First port tried when no explicit bind port is configured.
pub const SERVER_PORT_RANGE_START: u16 = 8765;

/// Last port tried when no explicit bind port is configured.
pub const SERVER_PORT_RANGE_END: u16 = 8775;
