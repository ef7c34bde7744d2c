//! OnAir Core - live broadcast session orchestration.
//!
//! A broadcast client opens a WebSocket control channel, starts one or more
//! broadcasts to groups of network speakers, streams microphone audio, and
//! triggers media and TTS playback into the same mix. This crate tracks those
//! sessions and tears them down exactly once, whichever of disconnect,
//! connection loss or playback completion comes first.
//!
//! # Architecture
//!
//! - [`session`]: Broadcast sessions and the concurrent session registry
//! - [`api`]: HTTP/WebSocket surface and the control-channel protocol
//! - [`services`]: Cleanup coordination, completion routing and the default
//!   mixer, fan-out, player, preparation and store implementations
//! - [`codec`]: Opus frame codec with packet-loss concealment
//! - [`events`]: Lifecycle events for clients and observers
//! - [`state`]: Core configuration
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! Collaborators sit behind traits in [`services::traits`] so the core can be
//! tested with mocks and deployed with other backends:
//!
//! - [`BroadcastPreparation`](services::BroadcastPreparation)
//! - [`AudioMixer`](services::AudioMixer) and
//!   [`SpeakerFanout`](services::SpeakerFanout)
//! - [`PlaybackService`](services::PlaybackService)
//! - [`BroadcastStore`](services::BroadcastStore)
//! - [`EventEmitter`](events::EventEmitter)

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod codec;
pub mod error;
pub mod events;
pub mod protocol_constants;
pub mod services;
pub mod session;
pub mod state;
pub mod utils;
pub mod wav;

// Re-export commonly used types at the crate root
pub use codec::{CodecError, FrameCodec};
pub use error::{ErrorCode, OnAirError, OnAirResult};
pub use events::{
    BroadcastEvent, BroadcastEventBridge, EventEmitter, LoggingEventEmitter, PlaybackEvent,
    SessionEvent,
};
pub use session::{
    AudioSource, BroadcastId, BroadcastSession, MicEncoding, SessionRegistry, SessionSnapshot,
    SpeakerInfo,
};
pub use state::Config;
pub use utils::now_millis;

// Re-export service types
pub use services::{
    CleanupCoordinator, CleanupOptions, CleanupOutcome, CompletionListener, Directory,
};

// Re-export bootstrap types
pub use bootstrap::{bootstrap_services, BootstrapOptions, BootstrappedServices};

// Re-export API types
pub use api::{
    bind_listener, start_server, AppState, AppStateBuilder, ServerError, WsConnectionManager,
};
