//! Application services layer.
//!
//! Teardown coordination and completion routing, plus the collaborator traits
//! and their default implementations.

pub mod cleanup;
pub mod completion;
pub mod fanout;
pub mod mixer;
pub mod player;
pub mod preparation;
pub mod store;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use cleanup::{CleanupCoordinator, CleanupOptions, CleanupOutcome};
pub use completion::CompletionListener;
pub use fanout::UdpFanout;
pub use mixer::FrameMixer;
pub use player::FilePlayer;
pub use preparation::{Directory, DirectoryPreparation};
pub use store::{BroadcastRecord, JsonBroadcastStore, StoreError};
pub use traits::{
    AudioMixer, BroadcastPreparation, BroadcastStore, PlaybackService, PreparedBroadcast,
    SpeakerFanout,
};
