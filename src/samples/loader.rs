// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Sample decoding and caching.
//!
//! Samples are decoded entirely into memory when prepared so that a trigger never
//! touches the disk.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, info};

use crate::audio::EngineError;

/// Input block size for the sinc resampler.
const INPUT_BLOCK_SIZE: usize = 1024;

/// A decoded sample. The data is shared between every pipeline playing it.
#[derive(Clone)]
pub struct LoadedSample {
    /// Interleaved f32 samples.
    data: Arc<Vec<f32>>,
    channel_count: u16,
    sample_rate: u32,
}

impl LoadedSample {
    pub fn new(data: Vec<f32>, channel_count: u16, sample_rate: u32) -> LoadedSample {
        LoadedSample {
            data: Arc::new(data),
            channel_count,
            sample_rate,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of frames in the sample.
    pub fn frames(&self) -> usize {
        self.data.len() / self.channel_count.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

impl std::fmt::Debug for LoadedSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedSample")
            .field("channel_count", &self.channel_count)
            .field("sample_rate", &self.sample_rate)
            .field("frames", &self.frames())
            .finish()
    }
}

/// Decodes samples at the output rate and caches them by path.
pub struct SampleLoader {
    cache: Mutex<HashMap<PathBuf, LoadedSample>>,
    target_sample_rate: u32,
}

impl SampleLoader {
    pub fn new(target_sample_rate: u32) -> SampleLoader {
        SampleLoader {
            cache: Mutex::new(HashMap::new()),
            target_sample_rate,
        }
    }

    /// Loads a sample, returning the cached copy if it has been loaded before.
    pub fn load(&self, path: &Path) -> Result<LoadedSample, EngineError> {
        if let Some(sample) = self.cache.lock().get(path) {
            debug!(path = ?path, "Using cached sample");
            return Ok(sample.clone());
        }

        info!(path = ?path, "Loading sample into memory");
        let (samples, channel_count, source_rate) = decode(path)?;

        let (samples, sample_rate) = if source_rate != self.target_sample_rate {
            info!(
                source_rate,
                target_rate = self.target_sample_rate,
                "Transcoding sample"
            );
            let samples =
                transcode_samples(&samples, channel_count, source_rate, self.target_sample_rate)
                    .map_err(|e| {
                        EngineError::init(
                            path,
                            format!(
                                "unable to resample {} Hz to {} Hz: {}",
                                source_rate, self.target_sample_rate, e
                            ),
                        )
                    })?;
            (samples, self.target_sample_rate)
        } else {
            (samples, source_rate)
        };

        let loaded = LoadedSample::new(samples, channel_count, sample_rate);
        info!(
            path = ?path,
            channels = channel_count,
            sample_rate,
            duration_ms = loaded.duration().as_millis(),
            memory_kb = loaded.memory_size() / 1024,
            "Sample loaded"
        );

        self.cache.lock().insert(path.to_path_buf(), loaded.clone());
        Ok(loaded)
    }

    /// Returns the total memory used by cached samples.
    pub fn total_memory_usage(&self) -> usize {
        self.cache.lock().values().map(|s| s.memory_size()).sum()
    }
}

impl std::fmt::Debug for SampleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleLoader")
            .field("cached_samples", &self.cache.lock().len())
            .field("target_sample_rate", &self.target_sample_rate)
            .field("total_memory_kb", &(self.total_memory_usage() / 1024))
            .finish()
    }
}

/// Decodes a whole file to interleaved f32. Returns the samples, channel count and sample rate.
fn decode(path: &Path) -> Result<(Vec<f32>, u16, u32), EngineError> {
    let file = File::open(path).map_err(|e| EngineError::unavailable(path, e))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| EngineError::init(path, e))?;
    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| EngineError::init(path, "no audio track found"))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let sample_rate = params
        .sample_rate
        .ok_or_else(|| EngineError::init(path, "sample rate not specified"))?;
    let mut decoder = get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| EngineError::init(path, e))?;

    let mut channel_count = params.channels.map(|c| c.count() as u16).unwrap_or(0);
    let mut samples = Vec::new();
    let mut buffer: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(EngineError::init(path, e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Skip corrupt packets.
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(path = ?path, err = e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(EngineError::init(path, e)),
        };

        let spec = *decoded.spec();
        if channel_count == 0 {
            channel_count = spec.channels.count() as u16;
        }
        let needed = decoded.capacity() * spec.channels.count();
        if buffer.as_ref().map_or(true, |b| b.capacity() < needed) {
            buffer = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buffer) = buffer.as_mut() {
            buffer.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buffer.samples());
        }
    }

    if channel_count == 0 {
        return Err(EngineError::init(path, "unable to determine channel count"));
    }

    Ok((samples, channel_count, sample_rate))
}

/// Resamples interleaved audio with a band-limited sinc resampler. The output is trimmed of
/// the resampler's delay so it lines up with the input.
fn transcode_samples(
    samples: &[f32],
    channel_count: u16,
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let channels = channel_count.max(1) as usize;
    let source_frames = samples.len() / channels;
    let ratio = target_rate as f64 / source_rate as f64;
    let target_frames =
        (source_frames as u64 * target_rate as u64).div_ceil(source_rate as u64) as usize;

    let planar: Vec<Vec<f32>> = (0..channels)
        .map(|channel| {
            samples
                .iter()
                .skip(channel)
                .step_by(channels)
                .copied()
                .collect()
        })
        .collect();

    let sinc_params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        oversampling_factor: 128,
        interpolation: SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 1.0, sinc_params, INPUT_BLOCK_SIZE, channels)?;
    let delay = resampler.output_delay();
    let wanted = delay + target_frames;

    let mut scratch = resampler.output_buffer_allocate(true);
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(wanted); channels];

    let mut position = 0;
    while source_frames - position >= resampler.input_frames_next() {
        let next = resampler.input_frames_next();
        let block: Vec<&[f32]> = planar
            .iter()
            .map(|channel| &channel[position..position + next])
            .collect();
        let (consumed, produced) =
            resampler.process_into_buffer(block.as_slice(), scratch.as_mut_slice(), None)?;
        append(&mut output, &scratch, produced);
        position += consumed;
    }

    if position < source_frames {
        let tail: Vec<&[f32]> = planar.iter().map(|channel| &channel[position..]).collect();
        let (_, produced) = resampler.process_partial_into_buffer(
            Some(tail.as_slice()),
            scratch.as_mut_slice(),
            None,
        )?;
        append(&mut output, &scratch, produced);
    }

    // Flush the delay line.
    while output.first().map_or(0, |channel| channel.len()) < wanted {
        let (_, produced) = resampler.process_partial_into_buffer(
            None::<&[Vec<f32>]>,
            scratch.as_mut_slice(),
            None,
        )?;
        if produced == 0 {
            break;
        }
        append(&mut output, &scratch, produced);
    }

    let mut interleaved = Vec::with_capacity(target_frames * channels);
    for frame in delay..wanted {
        for channel in output.iter() {
            interleaved.push(channel.get(frame).copied().unwrap_or(0.0));
        }
    }
    Ok(interleaved)
}

/// Appends the first `frames` frames of a planar block.
fn append(output: &mut [Vec<f32>], block: &[Vec<f32>], frames: usize) {
    for (out, channel) in output.iter_mut().zip(block.iter()) {
        out.extend_from_slice(&channel[..frames]);
    }
}
