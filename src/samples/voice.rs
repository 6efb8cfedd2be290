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

//! A single pre-buffered sample.
//!
//! A voice owns exactly one engine pipeline. The pipeline is pre-rolled at
//! construction, so every [`Voice::start`] is a seek and a state flip. Every
//! start retriggers from the beginning, even when the voice is already playing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::audio::{
    self, Backend, BusMessage, EngineError, Pipeline, PipelineEvents, PipelineState, StateChange,
};

/// How long a stop may take before the pipeline is released anyway.
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// The engine is pre-rolling the pipeline.
    Preparing,
    /// Paused at position zero, ready for an instant start.
    Ready,
    Playing,
    /// The engine reported an error. The voice must be re-created.
    Failed,
    /// Stopped and released.
    Released,
}

/// How playback of a voice ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Finished,
    Failed(String),
}

/// Receives the RMS of every buffer the engine renders for a voice.
pub type AmplitudeObserver = Arc<dyn Fn(f32) + Send + Sync>;

/// Receives end-of-stream and error notifications.
pub type CompletionObserver = Arc<dyn Fn(&Completion) + Send + Sync>;

struct Inner {
    state: VoiceState,
    pitch: f64,
    volume: f32,
    /// Generation of the pipeline's last seek.
    generation: u64,
    pipeline: Option<Box<dyn Pipeline>>,
}

struct Shared {
    path: PathBuf,
    inner: Mutex<Inner>,
    amplitude_observer: RwLock<Option<AmplitudeObserver>>,
    completion_observer: RwLock<Option<CompletionObserver>>,
    /// f32 bits of the last reported RMS.
    amplitude: AtomicU32,
}

impl Shared {
    /// Runs on the engine's processing thread.
    fn on_buffer(&self, block: &[f32]) {
        let value = audio::rms(block);
        self.amplitude.store(value.to_bits(), Ordering::Relaxed);
        // Observers run without the lock so they may rewire observers themselves.
        let observer = self.amplitude_observer.read().clone();
        if let Some(observer) = observer {
            observer(value);
        }
    }

    /// Runs on the engine's bus thread.
    fn on_message(&self, message: BusMessage) {
        let completion = match message {
            BusMessage::EndOfStream(generation) => {
                if !self.rewind(generation) {
                    return;
                }
                Completion::Finished
            }
            BusMessage::Error(message) => {
                error!(path = ?self.path, err = message, "Playback error");
                self.inner.lock().state = VoiceState::Failed;
                Completion::Failed(message)
            }
        };

        let observer = self.completion_observer.read().clone();
        if let Some(observer) = observer {
            observer(&completion);
        }
    }

    /// Returns to the paused, pre-buffered state after reaching the end of the sample. An
    /// end-of-stream from before the latest start is ignored. Returns true if the playback
    /// that ended is the current one.
    fn rewind(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != VoiceState::Playing || inner.generation != generation {
            debug!(path = ?self.path, generation, "Ignoring stale end of stream");
            return false;
        }
        let inner = &mut *inner;
        let Some(pipeline) = inner.pipeline.as_mut() else {
            return false;
        };

        let result = pipeline.seek(1.0).and_then(|generation| {
            pipeline.set_state(PipelineState::Paused)?;
            Ok(generation)
        });
        match result {
            Ok(generation) => {
                inner.generation = generation;
                inner.state = VoiceState::Ready;
                debug!(path = ?self.path, "Voice rewound");
            }
            Err(e) => warn!(path = ?self.path, err = %e, "Unable to rewind voice"),
        }
        true
    }
}

/// One sample's playback resource and its controls.
pub struct Voice {
    shared: Arc<Shared>,
}

impl Voice {
    /// Prepares the sample and leaves it paused at position zero.
    pub fn create(backend: &dyn Backend, path: &Path, volume: f32) -> Result<Voice, EngineError> {
        let shared = Arc::new(Shared {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                state: VoiceState::Preparing,
                pitch: 0.0,
                volume,
                generation: 0,
                pipeline: None,
            }),
            amplitude_observer: RwLock::new(None),
            completion_observer: RwLock::new(None),
            amplitude: AtomicU32::new(0),
        });

        let events = {
            let on_buffer = Arc::downgrade(&shared);
            let on_message: Weak<Shared> = Arc::downgrade(&shared);
            PipelineEvents {
                on_buffer: Box::new(move |block| {
                    if let Some(shared) = on_buffer.upgrade() {
                        shared.on_buffer(block);
                    }
                }),
                on_message: Box::new(move |message| {
                    if let Some(shared) = on_message.upgrade() {
                        shared.on_message(message);
                    }
                }),
            }
        };

        let pipeline = backend.prepare(path, volume, events)?;
        {
            let mut inner = shared.inner.lock();
            inner.pipeline = Some(pipeline);
            inner.state = VoiceState::Ready;
        }
        info!(path = ?path, volume, "Sample pre-buffered");

        Ok(Voice { shared })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn state(&self) -> VoiceState {
        self.shared.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == VoiceState::Playing
    }

    pub fn pitch(&self) -> f64 {
        self.shared.inner.lock().pitch
    }

    pub fn volume(&self) -> f32 {
        self.shared.inner.lock().volume
    }

    /// The most recent RMS reported by the engine.
    pub fn amplitude(&self) -> f32 {
        f32::from_bits(self.shared.amplitude.load(Ordering::Relaxed))
    }

    /// Stores the pitch used by the next start.
    pub fn set_pitch(&self, semitones: f64) {
        self.shared.inner.lock().pitch = semitones;
    }

    /// Retriggers the sample from the beginning at the given pitch.
    pub fn start(&self, semitones: f64) -> Result<(), EngineError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            VoiceState::Ready | VoiceState::Playing => {}
            state => {
                return Err(EngineError::OperationFailure(format!(
                    "voice for {} is {:?}",
                    self.shared.path.display(),
                    state
                )))
            }
        }
        inner.pitch = semitones;
        let rate = audio::playback_rate(semitones);
        let was_playing = inner.state == VoiceState::Playing;

        let inner = &mut *inner;
        let Some(pipeline) = inner.pipeline.as_mut() else {
            return Err(EngineError::OperationFailure("voice has no pipeline".into()));
        };
        let generation = match pipeline.seek(rate) {
            Ok(generation) => generation,
            Err(e) => {
                warn!(path = ?self.shared.path, rate, err = %e, "Seek failed");
                return Err(e);
            }
        };
        // The engine may already have paused at the end while its end-of-stream is in flight.
        if let Err(e) = pipeline.set_state(PipelineState::Playing) {
            warn!(path = ?self.shared.path, err = %e, "Unable to start playback");
            return Err(e);
        }
        inner.generation = generation;
        inner.state = VoiceState::Playing;

        debug!(path = ?self.shared.path, rate, retrigger = was_playing, "Voice started");
        Ok(())
    }

    /// Sets the gain. Applies to audio already playing.
    pub fn set_volume(&self, gain: f32) {
        let mut inner = self.shared.inner.lock();
        inner.volume = gain;
        if let Some(pipeline) = inner.pipeline.as_ref() {
            pipeline.set_gain(gain);
        }
    }

    pub fn set_amplitude_observer<F>(&self, observer: F)
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        *self.shared.amplitude_observer.write() = Some(Arc::new(observer));
    }

    pub fn clear_amplitude_observer(&self) {
        *self.shared.amplitude_observer.write() = None;
    }

    pub fn set_completion_observer<F>(&self, observer: F)
    where
        F: Fn(&Completion) + Send + Sync + 'static,
    {
        *self.shared.completion_observer.write() = Some(Arc::new(observer));
    }

    /// Stops playback and releases the pipeline. Waits a bounded amount of time for the engine
    /// to acknowledge, then releases regardless. Calling this more than once is a no-op.
    pub fn stop(&self) {
        let pipeline = {
            let mut inner = self.shared.inner.lock();
            inner.state = VoiceState::Released;
            inner.pipeline.take()
        };
        let Some(mut pipeline) = pipeline else {
            return;
        };

        match pipeline.set_state(PipelineState::Stopped) {
            Ok(StateChange::Success) => {}
            Ok(StateChange::Async) => {
                if pipeline.wait_for_state(STOP_TIMEOUT) == StateChange::Async {
                    warn!(path = ?self.shared.path, "Stop did not complete in time, releasing anyway");
                }
            }
            Err(e) => warn!(path = ?self.shared.path, err = %e, "Stop rejected, releasing anyway"),
        }
        drop(pipeline);
        debug!(path = ?self.shared.path, "Voice released");
    }
}

impl Drop for Voice {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Voice")
            .field("path", &self.shared.path)
            .field("state", &inner.state)
            .field("pitch", &inner.pitch)
            .field("volume", &inner.volume)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::audio::mock::{Call, Engine};

    fn kick() -> PathBuf {
        PathBuf::from("/samples/kick.wav")
    }

    fn states(engine: &Engine) -> Vec<PipelineState> {
        engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SetState { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    fn seeks(engine: &Engine) -> Vec<f64> {
        engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Seek { rate, .. } => Some(rate),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_create_leaves_voice_ready() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 0.8).unwrap();

        assert_eq!(voice.state(), VoiceState::Ready);
        assert_eq!(voice.volume(), 0.8);
        assert_eq!(
            engine.calls(),
            vec![Call::Prepare {
                path: kick(),
                volume: 0.8
            }]
        );
    }

    #[test]
    fn test_create_failures() {
        let engine = Engine::new("mock");
        engine.mark_unavailable("/samples/missing.wav");
        engine.mark_broken("/samples/broken.wav");

        assert!(matches!(
            Voice::create(&engine, Path::new("/samples/missing.wav"), 1.0),
            Err(EngineError::ResourceUnavailable { .. })
        ));
        assert!(matches!(
            Voice::create(&engine, Path::new("/samples/broken.wav"), 1.0),
            Err(EngineError::InitFailure { .. })
        ));
        assert_eq!(engine.live_pipelines(), 0);
    }

    #[test]
    fn test_start_always_reseeks() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();

        voice.start(0.0).unwrap();
        assert!(voice.is_playing());
        voice.start(12.0).unwrap();
        voice.start(-12.0).unwrap();

        assert_eq!(seeks(&engine), vec![1.0, 2.0, 0.5]);
        assert_eq!(states(&engine), vec![PipelineState::Playing; 3]);
        assert_eq!(voice.pitch(), -12.0);
    }

    #[test]
    fn test_start_failure_keeps_voice_usable() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();

        engine.reject_operations(true);
        assert!(matches!(
            voice.start(0.0),
            Err(EngineError::OperationFailure(_))
        ));
        assert_eq!(voice.state(), VoiceState::Ready);

        engine.reject_operations(false);
        voice.start(0.0).unwrap();
        assert!(voice.is_playing());
    }

    #[test]
    fn test_set_pitch_applies_on_next_start() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();

        voice.set_pitch(7.0);
        assert_eq!(voice.pitch(), 7.0);
        assert!(seeks(&engine).is_empty());
    }

    #[test]
    fn test_set_volume_is_forwarded() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        voice.start(0.0).unwrap();

        voice.set_volume(0.25);
        assert_eq!(voice.volume(), 0.25);
        assert!(engine.calls().contains(&Call::SetGain {
            path: kick(),
            gain: 0.25
        }));
    }

    #[test]
    fn test_amplitude_observer() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            voice.set_amplitude_observer(move |value| seen.lock().push(value));
        }

        engine.emit_buffer(&kick(), &[0.0; 64]);
        engine.emit_buffer(&kick(), &[0.5; 64]);

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], 0.0);
        assert!((seen[1] - 0.5).abs() < 1e-6);
        assert!((voice.amplitude() - 0.5).abs() < 1e-6);

        voice.clear_amplitude_observer();
        engine.emit_buffer(&kick(), &[1.0; 64]);
        assert!((voice.amplitude() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_end_of_stream_rewinds_to_ready() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        let completions = Arc::new(Mutex::new(Vec::new()));
        {
            let completions = completions.clone();
            voice.set_completion_observer(move |c| completions.lock().push(c.clone()));
        }

        voice.start(5.0).unwrap();
        engine.clear_calls();
        engine.emit_end_of_stream(&kick());

        assert_eq!(voice.state(), VoiceState::Ready);
        assert_eq!(seeks(&engine), vec![1.0]);
        assert_eq!(states(&engine), vec![PipelineState::Paused]);
        assert_eq!(*completions.lock(), vec![Completion::Finished]);

        engine.clear_calls();
        voice.start(0.0).unwrap();
        assert!(voice.is_playing());
        assert_eq!(states(&engine), vec![PipelineState::Playing]);
    }

    #[test]
    fn test_stale_end_of_stream_is_ignored() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        let completions = Arc::new(Mutex::new(Vec::new()));
        {
            let completions = completions.clone();
            voice.set_completion_observer(move |c| completions.lock().push(c.clone()));
        }

        // The first start ends while the second is already under way.
        voice.start(0.0).unwrap();
        voice.start(3.0).unwrap();
        engine.clear_calls();
        engine.emit_end_of_stream_for(&kick(), 1);

        assert!(voice.is_playing());
        assert!(engine.calls().is_empty());
        assert!(completions.lock().is_empty());

        engine.emit_end_of_stream(&kick());
        assert_eq!(voice.state(), VoiceState::Ready);
        assert_eq!(*completions.lock(), vec![Completion::Finished]);
    }

    #[test]
    fn test_error_makes_voice_unusable() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        let failures = Arc::new(AtomicUsize::new(0));
        {
            let failures = failures.clone();
            voice.set_completion_observer(move |c| {
                if let Completion::Failed(message) = c {
                    assert_eq!(message, "device lost");
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        voice.start(0.0).unwrap();
        engine.emit_error(&kick(), "device lost");

        assert_eq!(voice.state(), VoiceState::Failed);
        assert_eq!(failures.load(Ordering::Relaxed), 1);
        assert!(voice.start(0.0).is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        voice.start(0.0).unwrap();

        voice.stop();
        assert_eq!(voice.state(), VoiceState::Released);
        assert_eq!(engine.live_pipelines(), 0);

        engine.clear_calls();
        voice.stop();
        drop(voice);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_stop_timeout_still_releases() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        engine.hang_on_stop(true);

        let started = std::time::Instant::now();
        voice.stop();
        assert!(started.elapsed() >= STOP_TIMEOUT);
        assert!(started.elapsed() < STOP_TIMEOUT * 5);
        assert_eq!(engine.live_pipelines(), 0);
        assert_eq!(
            engine.calls().last(),
            Some(&Call::Release { path: kick() })
        );
    }

    #[test]
    fn test_drop_releases_pipeline() {
        let engine = Engine::new("mock");
        let voice = Voice::create(&engine, &kick(), 1.0).unwrap();
        assert_eq!(engine.live_pipelines(), 1);

        drop(voice);
        assert_eq!(engine.live_pipelines(), 0);
    }
}
