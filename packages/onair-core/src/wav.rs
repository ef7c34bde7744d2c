//! Media and TTS file decoding.
//!
//! WAV files (any rate, integer or float samples, any channel count) are read
//! with hound, downmixed and resampled to the broadcast format: 48 kHz mono
//! 16-bit. Files without a RIFF header are taken to be raw broadcast-format PCM.

use std::io::Cursor;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use thiserror::Error;

use crate::codec::pcm_to_samples;
use crate::protocol_constants::SAMPLE_RATE;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("invalid WAV file: {0}")]
    Read(#[from] hound::Error),

    #[error("resampler setup failed: {0}")]
    ResamplerSetup(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

/// Decodes a media file into broadcast-format samples.
pub fn decode_audio_file(data: &[u8]) -> Result<Vec<i16>, WavError> {
    if !data.starts_with(b"RIFF") {
        return Ok(pcm_to_samples(data));
    }

    let (mono, sample_rate) = read_wav_mono(data)?;
    let resampled = resample_to_broadcast_rate(mono, sample_rate)?;
    Ok(resampled.into_iter().map(to_i16).collect())
}

/// Reads a WAV file as mono f32 in [-1, 1], averaging channels.
fn read_wav_mono(data: &[u8]) -> Result<(Vec<f32>, u32), WavError> {
    let reader = hound::WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

const SINC_LEN: usize = 256;

fn resample_to_broadcast_rate(samples: Vec<f32>, from_rate: u32) -> Result<Vec<f32>, WavError> {
    if from_rate == SAMPLE_RATE || from_rate == 0 || samples.is_empty() {
        return Ok(samples);
    }
    let expected =
        (samples.len() as u64 * u64::from(SAMPLE_RATE) / u64::from(from_rate)) as usize;

    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    // Zero tail so the filter reaches the last real sample in one pass.
    let mut padded = samples;
    padded.resize(padded.len() + 2 * SINC_LEN, 0.0);

    let mut resampler = SincFixedIn::<f32>::new(
        f64::from(SAMPLE_RATE) / f64::from(from_rate),
        1.0,
        params,
        padded.len(),
        1,
    )?;
    let delay = resampler.output_delay();

    let waves_in = vec![padded];
    let mut out = resampler.process(&waves_in, None)?.pop().unwrap_or_default();
    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    Ok(out)
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32768.0)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Encodes 16-bit PCM as an in-memory WAV file.
#[cfg(test)]
pub(crate) fn encode_wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}
