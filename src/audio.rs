// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
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

//! The playback engine seam.
//!
//! A [`Backend`] prepares one [`Pipeline`] per sample file. Pipelines are
//! pre-rolled to a paused state at position zero, so starting one is a seek
//! plus a state flip. Engines deliver PCM blocks on their processing thread
//! and end-of-stream/error messages on a separate bus thread.

use std::{error::Error, fmt, path::Path, sync::Arc, time::Duration};

use ::cpal::{FromSample, Sample};

use crate::config;

pub mod cpal;
mod error;
pub mod mixer;
pub mod mock;
pub mod thread_priority;

pub use error::EngineError;

/// The transport state requested of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Paused,
    Stopped,
}

/// The outcome of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The transition completed before the call returned.
    Success,
    /// The transition is still in flight on the engine's own thread.
    Async,
}

/// Asynchronous notifications delivered on the engine's bus thread.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// Playback reached the end of the sample. Carries the generation returned by the
    /// seek that started it.
    EndOfStream(u64),
    Error(String),
}

/// Receives one block of decoded PCM (pre-gain) on the processing thread.
pub type BufferHandler = Box<dyn Fn(&[f32]) + Send + Sync>;

/// Receives bus messages on the engine's bus thread.
pub type MessageHandler = Box<dyn Fn(BusMessage) + Send + Sync>;

/// The callbacks a pipeline reports through. Captured at preparation time.
pub struct PipelineEvents {
    pub on_buffer: BufferHandler,
    pub on_message: MessageHandler,
}

impl PipelineEvents {
    /// Events that go nowhere.
    pub fn ignore() -> PipelineEvents {
        PipelineEvents {
            on_buffer: Box::new(|_| {}),
            on_message: Box::new(|_| {}),
        }
    }
}

/// A single prepared sample inside an engine.
///
/// Dropping a pipeline releases its engine resources unconditionally, which is
/// also how a stop that never completes is forced through.
pub trait Pipeline: Send {
    /// Flushing seek to position zero, continuing at the given playback rate. Returns the
    /// new playback generation; an end-of-stream for an older generation is stale.
    fn seek(&mut self, rate: f64) -> Result<u64, EngineError>;

    /// Sets the output gain. Applies to audio already playing.
    fn set_gain(&self, gain: f32);

    /// Requests a transport state.
    fn set_state(&mut self, state: PipelineState) -> Result<StateChange, EngineError>;

    /// Waits for the last requested transition to finish. Returns
    /// [`StateChange::Async`] if it was still in flight when the timeout hit.
    fn wait_for_state(&self, timeout: Duration) -> StateChange;
}

/// Something that can build pipelines.
pub trait Backend: fmt::Display + Send + Sync {
    /// Opens, decodes and pre-rolls the file, returning a paused pipeline.
    fn prepare(
        &self,
        path: &Path,
        volume: f32,
        events: PipelineEvents,
    ) -> Result<Box<dyn Pipeline>, EngineError>;
}

/// Lists the output devices known to cpal.
pub fn list_devices() -> Result<Vec<String>, Box<dyn Error>> {
    cpal::Engine::list()
}

/// Opens the engine described by the audio configuration.
pub fn get_backend(config: &config::Audio) -> Result<Arc<dyn Backend>, Box<dyn Error>> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Engine::new(device)));
    }

    Ok(Arc::new(cpal::Engine::open(config)?))
}

/// Converts a pitch offset in semitones to a playback rate.
pub fn playback_rate(semitones: f64) -> f64 {
    2f64.powf(semitones / 12.0)
}

/// Root-mean-square of one buffer, with each sample normalized to [-1, 1].
pub fn rms<T>(buffer: &[T]) -> f32
where
    T: Sample,
    f32: FromSample<T>,
{
    if buffer.is_empty() {
        return 0.0;
    }

    let sum: f64 = buffer
        .iter()
        .map(|s| {
            let normalized = f64::from(f32::from_sample(*s));
            normalized * normalized
        })
        .sum();
    (sum / buffer.len() as f64).sqrt() as f32
}
