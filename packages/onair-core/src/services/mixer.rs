//! Frame-clocked audio mixer.
//!
//! Each broadcast gets a mix channel with one PCM queue per [`AudioSource`].
//! A per-channel task ticks every 60 ms, pulls one frame from each queue,
//! applies the source gains, Opus-encodes the sum and hands the packet to the
//! [`SpeakerFanout`]. Ticks where every queue is empty send nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::codec::{pcm_to_samples, samples_to_pcm, FrameCodec};
use crate::protocol_constants::{
    DEFAULT_VOLUME_LEVEL, FRAME_DURATION_MS, FRAME_SAMPLES, MIXER_MAX_QUEUE_MS, SAMPLE_RATE,
};
use crate::services::traits::{AudioMixer, MixerError, SpeakerFanout};
use crate::session::{AudioSource, BroadcastId, ChannelId, SpeakerInfo};

/// Per-source queue bound in samples.
const MAX_QUEUE_SAMPLES: usize = (SAMPLE_RATE as usize * MIXER_MAX_QUEUE_MS as usize) / 1000;

struct MixChannel {
    channel_id: ChannelId,
    speakers: RwLock<Vec<SpeakerInfo>>,
    queues: Mutex<[VecDeque<i16>; 3]>,
    gains: [AtomicU8; 3],
    frames_sent: AtomicU64,
    token: CancellationToken,
}

impl MixChannel {
    fn new(channel_id: ChannelId, speakers: Vec<SpeakerInfo>, token: CancellationToken) -> Self {
        Self {
            channel_id,
            speakers: RwLock::new(speakers),
            queues: Mutex::new(Default::default()),
            gains: std::array::from_fn(|_| AtomicU8::new(DEFAULT_VOLUME_LEVEL)),
            frames_sent: AtomicU64::new(0),
            token,
        }
    }

    fn push(&self, source: AudioSource, pcm: &[u8]) {
        let mut queues = self.queues.lock();
        let queue = &mut queues[source.index()];
        queue.extend(pcm_to_samples(pcm));
        let excess = queue.len().saturating_sub(MAX_QUEUE_SAMPLES);
        if excess > 0 {
            queue.drain(..excess);
            log::debug!(
                "[Mixer] Channel {} {} queue full, dropped {} samples",
                self.channel_id,
                source,
                excess
            );
        }
    }

    /// Pulls and mixes one frame, or `None` when nothing is queued.
    fn next_frame(&self) -> Option<Vec<i16>> {
        let mut queues = self.queues.lock();
        if queues.iter().all(VecDeque::is_empty) {
            return None;
        }

        let mut acc = vec![0i32; FRAME_SAMPLES];
        for source in AudioSource::ALL {
            let queue = &mut queues[source.index()];
            let take = queue.len().min(FRAME_SAMPLES);
            let gain = self.gains[source.index()].load(Ordering::Relaxed);
            mix_into(&mut acc, queue.drain(..take), gain);
        }
        Some(clamp_frame(&acc))
    }
}

/// Adds `samples` scaled by `gain` percent into `acc`.
fn mix_into(acc: &mut [i32], samples: impl Iterator<Item = i16>, gain: u8) {
    let gain = i32::from(gain.min(100));
    for (slot, sample) in acc.iter_mut().zip(samples) {
        *slot += i32::from(sample) * gain / 100;
    }
}

fn clamp_frame(acc: &[i32]) -> Vec<i16> {
    acc.iter()
        .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
        .collect()
}

/// Default [`AudioMixer`]: mixes in-process and fans out over [`SpeakerFanout`].
pub struct FrameMixer {
    fanout: Arc<dyn SpeakerFanout>,
    channels: DashMap<BroadcastId, Arc<MixChannel>>,
    frame_interval: Duration,
    root: CancellationToken,
}

impl FrameMixer {
    pub fn new(fanout: Arc<dyn SpeakerFanout>) -> Self {
        Self {
            fanout,
            channels: DashMap::new(),
            frame_interval: Duration::from_millis(FRAME_DURATION_MS as u64),
            root: CancellationToken::new(),
        }
    }

    /// Overrides the tick interval.
    #[must_use]
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Number of frames sent for a broadcast so far.
    #[must_use]
    pub fn frames_sent(&self, broadcast_id: &BroadcastId) -> u64 {
        self.channels
            .get(broadcast_id)
            .map(|c| c.frames_sent.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stops every mix channel.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.channels.clear();
    }

    fn channel(&self, broadcast_id: &BroadcastId) -> Result<Arc<MixChannel>, MixerError> {
        self.channels
            .get(broadcast_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| MixerError::NotInitialized(broadcast_id.clone()))
    }
}

impl Drop for FrameMixer {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[async_trait]
impl AudioMixer for FrameMixer {
    async fn initialize(
        &self,
        broadcast_id: &BroadcastId,
        channel_id: ChannelId,
        speakers: Vec<SpeakerInfo>,
    ) -> Result<(), MixerError> {
        let codec = FrameCodec::new()?;
        let channel = Arc::new(MixChannel::new(
            channel_id,
            speakers,
            self.root.child_token(),
        ));

        if let Some(previous) = self
            .channels
            .insert(broadcast_id.clone(), Arc::clone(&channel))
        {
            log::info!("[Mixer] Re-initializing broadcast {}", broadcast_id);
            previous.token.cancel();
        }

        log::info!(
            "[Mixer] Broadcast {} on channel {} initialized with {} speaker(s)",
            broadcast_id,
            channel_id,
            channel.speakers.read().len()
        );

        tokio::spawn(run_channel(
            broadcast_id.clone(),
            channel,
            codec,
            Arc::clone(&self.fanout),
            self.frame_interval,
        ));
        Ok(())
    }

    async fn add_microphone_data(
        &self,
        broadcast_id: &BroadcastId,
        pcm: Bytes,
    ) -> Result<(), MixerError> {
        self.channel(broadcast_id)?
            .push(AudioSource::Microphone, &pcm);
        Ok(())
    }

    async fn add_source_data(
        &self,
        broadcast_id: &BroadcastId,
        source: AudioSource,
        pcm: Bytes,
    ) -> Result<(), MixerError> {
        self.channel(broadcast_id)?.push(source, &pcm);
        Ok(())
    }

    async fn set_volume(
        &self,
        broadcast_id: &BroadcastId,
        source: AudioSource,
        level: u8,
    ) -> Result<(), MixerError> {
        self.channel(broadcast_id)?.gains[source.index()].store(level.min(100), Ordering::Relaxed);
        Ok(())
    }

    async fn update_speakers(
        &self,
        broadcast_id: &BroadcastId,
        speakers: Vec<SpeakerInfo>,
    ) -> Result<(), MixerError> {
        *self.channel(broadcast_id)?.speakers.write() = speakers;
        Ok(())
    }

    async fn stop(&self, broadcast_id: &BroadcastId) -> Result<(), MixerError> {
        if let Some((_, channel)) = self.channels.remove(broadcast_id) {
            channel.token.cancel();
            log::info!(
                "[Mixer] Broadcast {} stopped after {} frame(s)",
                broadcast_id,
                channel.frames_sent.load(Ordering::Relaxed)
            );
        }
        Ok(())
    }

    fn is_active(&self, broadcast_id: &BroadcastId) -> bool {
        self.channels.contains_key(broadcast_id)
    }
}

async fn run_channel(
    broadcast_id: BroadcastId,
    channel: Arc<MixChannel>,
    mut codec: FrameCodec,
    fanout: Arc<dyn SpeakerFanout>,
    frame_interval: Duration,
) {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = channel.token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(frame) = channel.next_frame() else {
            continue;
        };
        let packet = match codec.encode(&samples_to_pcm(&frame)) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("[Mixer] Encode failed for {}: {}", broadcast_id, e);
                continue;
            }
        };

        let speakers = channel.speakers.read().clone();
        if speakers.is_empty() {
            continue;
        }
        let delivered = fanout.send_audio_to_speakers(&speakers, &packet).await;
        let sent = channel.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if delivered < speakers.len() {
            log::debug!(
                "[Mixer] Frame {} for {} reached {}/{} speakers",
                sent,
                broadcast_id,
                delivered,
                speakers.len()
            );
        }
    }
    log::debug!("[Mixer] Mix task for {} exited", broadcast_id);
}
