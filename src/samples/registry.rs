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

//! Maps trigger keys to voices.
//!
//! Teardown never happens while the map lock is held: voices are detached under
//! the lock and stopped after it is released. A voice stop waits on the engine,
//! and the engine's threads run callbacks that may need the same lock.

use std::collections::HashMap;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, span, warn, Level};

use super::voice::{Completion, Voice};
use crate::audio::{Backend, EngineError};

/// Receives per-buffer amplitudes tagged with the key of the voice that produced them.
pub type AmplitudeCallback = Arc<dyn Fn(char, f32) + Send + Sync>;

/// Errors returned by [`Registry::trigger`].
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("no sample registered for key '{0}'")]
    NotFound(char),

    #[error(transparent)]
    Voice(#[from] EngineError),
}

struct Inner {
    voices: HashMap<char, Voice>,
    observer: Option<AmplitudeCallback>,
}

/// Owns at most one voice per key.
pub struct Registry {
    backend: Arc<dyn Backend>,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(backend: Arc<dyn Backend>) -> Registry {
        Registry {
            backend,
            inner: Mutex::new(Inner {
                voices: HashMap::new(),
                observer: None,
            }),
        }
    }

    /// Builds a voice for the path and installs it under the key, replacing any previous
    /// voice. If the new voice cannot be built the previous mapping is left alone.
    pub fn register(&self, key: char, path: &Path, volume: f32) -> Result<(), EngineError> {
        let span = span!(Level::INFO, "register", key = %key);
        let _enter = span.enter();

        let voice = match Voice::create(self.backend.as_ref(), path, volume) {
            Ok(voice) => voice,
            Err(e) => {
                error!(key = %key, path = ?path, err = %e, "Unable to load sample");
                return Err(e);
            }
        };
        voice.set_completion_observer(move |completion| {
            if let Completion::Failed(message) = completion {
                error!(key = %key, err = message, "Voice failed; re-register to recover");
            }
        });

        let previous = {
            let mut inner = self.inner.lock();
            if let Some(observer) = inner.observer.clone() {
                voice.set_amplitude_observer(move |value| observer(key, value));
            }
            inner.voices.insert(key, voice)
        };
        info!(key = %key, path = ?path, volume, "Registered sample");

        if let Some(previous) = previous {
            info!(key = %key, path = ?previous.path(), "Releasing replaced sample");
            previous.stop();
        }
        Ok(())
    }

    /// Retriggers the voice for the key at the given pitch.
    pub fn trigger(&self, key: char, semitones: f64) -> Result<(), TriggerError> {
        let inner = self.inner.lock();
        let voice = inner.voices.get(&key).ok_or(TriggerError::NotFound(key))?;
        voice.start(semitones)?;
        Ok(())
    }

    /// Installs the callback on every current voice and on every voice registered later.
    pub fn set_global_amplitude_observer<F>(&self, observer: F)
    where
        F: Fn(char, f32) + Send + Sync + 'static,
    {
        let observer: AmplitudeCallback = Arc::new(observer);
        let mut inner = self.inner.lock();
        for (key, voice) in inner.voices.iter() {
            let key = *key;
            let observer = observer.clone();
            voice.set_amplitude_observer(move |value| observer(key, value));
        }
        inner.observer = Some(observer);
    }

    pub fn set_volume(&self, key: char, gain: f32) -> Result<(), TriggerError> {
        let inner = self.inner.lock();
        let voice = inner.voices.get(&key).ok_or(TriggerError::NotFound(key))?;
        voice.set_volume(gain);
        Ok(())
    }

    /// The most recent amplitude reported by the voice for the key.
    pub fn amplitude(&self, key: char) -> Option<f32> {
        self.inner.lock().voices.get(&key).map(Voice::amplitude)
    }

    pub fn contains(&self, key: char) -> bool {
        self.inner.lock().voices.contains_key(&key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<char> {
        let mut keys: Vec<char> = self.inner.lock().voices.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.lock().voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detaches every voice and stops them outside the lock.
    pub fn shutdown(&self) {
        let voices = mem::take(&mut self.inner.lock().voices);
        if voices.is_empty() {
            return;
        }

        info!(voices = voices.len(), "Stopping all samples");
        for (key, voice) in voices {
            if voice.is_playing() {
                warn!(key = %key, "Stopping sample mid-playback");
            }
            voice.stop();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.backend.to_string())
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::audio::mock::{Call, Engine};
    use crate::audio::PipelineState;

    fn registry() -> (Engine, Registry) {
        let engine = Engine::new("mock");
        let registry = Registry::new(Arc::new(engine.clone()));
        (engine, registry)
    }

    #[test]
    fn test_register_and_trigger() {
        let (engine, registry) = registry();
        registry
            .register('a', Path::new("/samples/kick.wav"), 1.0)
            .unwrap();
        assert!(registry.contains('a'));

        registry.trigger('a', 12.0).unwrap();
        assert!(engine.calls().contains(&Call::Seek {
            path: PathBuf::from("/samples/kick.wav"),
            rate: 2.0
        }));
    }

    #[test]
    fn test_missing_sample_then_trigger_is_not_found() {
        let (engine, registry) = registry();
        engine.mark_unavailable("/samples/missing.wav");

        assert!(matches!(
            registry.register('x', Path::new("/samples/missing.wav"), 1.0),
            Err(EngineError::ResourceUnavailable { .. })
        ));
        assert!(matches!(
            registry.trigger('x', 0.0),
            Err(TriggerError::NotFound('x'))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_trigger_unknown_key_makes_no_engine_calls() {
        let (engine, registry) = registry();
        registry
            .register('a', Path::new("/samples/kick.wav"), 1.0)
            .unwrap();
        engine.clear_calls();

        assert!(matches!(
            registry.trigger('q', 0.0),
            Err(TriggerError::NotFound('q'))
        ));
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_reregister_releases_previous_voice() {
        let (engine, registry) = registry();
        let old = Path::new("/samples/old.wav");
        let new = Path::new("/samples/new.wav");

        registry.register('a', old, 1.0).unwrap();
        registry.trigger('a', 0.0).unwrap();
        registry.register('a', new, 0.5).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(engine.live_pipelines_for(old), 0);
        assert_eq!(engine.live_pipelines_for(new), 1);
        assert!(engine.calls().contains(&Call::SetState {
            path: old.to_path_buf(),
            state: PipelineState::Stopped
        }));

        engine.clear_calls();
        registry.trigger('a', 0.0).unwrap();
        assert!(engine
            .calls()
            .iter()
            .all(|call| !matches!(call, Call::Seek { path, .. } if path == old)));
    }

    #[test]
    fn test_failed_reregister_keeps_previous_voice() {
        let (engine, registry) = registry();
        let good = Path::new("/samples/good.wav");
        let broken = Path::new("/samples/broken.wav");
        engine.mark_broken(broken);

        registry.register('a', good, 1.0).unwrap();
        assert!(matches!(
            registry.register('a', broken, 1.0),
            Err(EngineError::InitFailure { .. })
        ));

        assert_eq!(engine.live_pipelines_for(good), 1);
        registry.trigger('a', 0.0).unwrap();
    }

    #[test]
    fn test_trigger_reports_engine_failure() {
        let (engine, registry) = registry();
        registry
            .register('a', Path::new("/samples/kick.wav"), 1.0)
            .unwrap();

        engine.reject_operations(true);
        assert!(matches!(
            registry.trigger('a', 0.0),
            Err(TriggerError::Voice(EngineError::OperationFailure(_)))
        ));

        engine.reject_operations(false);
        registry.trigger('a', 0.0).unwrap();
    }

    #[test]
    fn test_global_observer_tags_keys() {
        let (engine, registry) = registry();
        registry
            .register('a', Path::new("/samples/kick.wav"), 1.0)
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            registry.set_global_amplitude_observer(move |key, value| seen.lock().push((key, value)));
        }
        // Registered after the observer was set.
        registry
            .register('s', Path::new("/samples/snare.wav"), 1.0)
            .unwrap();

        engine.emit_buffer(Path::new("/samples/kick.wav"), &[0.0; 8]);
        engine.emit_buffer(Path::new("/samples/snare.wav"), &[1.0; 8]);

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ('a', 0.0));
        assert_eq!(seen[1].0, 's');
        assert!((seen[1].1 - 1.0).abs() < 1e-6);
        assert!((registry.amplitude('s').unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(registry.amplitude('z'), None);
    }

    #[test]
    fn test_observer_may_use_registry() {
        let (engine, registry) = registry();
        let registry = Arc::new(registry);
        registry
            .register('a', Path::new("/samples/kick.wav"), 1.0)
            .unwrap();

        let reentered = Arc::new(AtomicBool::new(false));
        {
            let weak = Arc::downgrade(&registry);
            let reentered = reentered.clone();
            registry.set_global_amplitude_observer(move |key, _| {
                if let Some(registry) = weak.upgrade() {
                    reentered.store(registry.contains(key), Ordering::Relaxed);
                }
            });
        }

        engine.emit_buffer(Path::new("/samples/kick.wav"), &[0.5; 8]);
        assert!(reentered.load(Ordering::Relaxed));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (engine, registry) = registry();
        for (key, path) in [('a', "/samples/a.wav"), ('s', "/samples/s.wav")] {
            registry.register(key, Path::new(path), 1.0).unwrap();
        }
        registry.trigger('a', 0.0).unwrap();
        assert_eq!(engine.live_pipelines(), 2);

        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(engine.live_pipelines(), 0);

        // Nothing left to do.
        registry.shutdown();
    }

    #[test]
    fn test_drop_releases_everything() {
        let (engine, registry) = registry();
        registry
            .register('a', Path::new("/samples/a.wav"), 1.0)
            .unwrap();

        drop(registry);
        assert_eq!(engine.live_pipelines(), 0);
    }

    #[test]
    fn test_keys_sorted() {
        let (_engine, registry) = registry();
        for key in ['s', 'a', 'd'] {
            registry
                .register(key, Path::new(&format!("/samples/{}.wav", key)), 1.0)
                .unwrap();
        }
        assert_eq!(registry.keys(), vec!['a', 'd', 's']);
    }
}
