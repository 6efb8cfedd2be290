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
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::samples::{Registry, TriggerError};
use crate::sequencer::Sequencer;

pub mod keyboard;

/// Toggles recording of a take.
pub const RECORD_KEY: char = '1';
/// Toggles looped playback of the take.
pub const PLAY_KEY: char = '2';
/// Shifts pitch mode down an octave.
pub const OCTAVE_DOWN_KEY: char = 'z';
/// Shifts pitch mode up an octave.
pub const OCTAVE_UP_KEY: char = 'x';

/// Key presses as delivered by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// A character key, with whether shift was held.
    Char { key: char, shift: bool },
    /// Shift pressed on its own.
    Shift,
    /// The quit key.
    Escape,
}

/// Whether the event loop should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// A source of key events. Runs a blocking loop on the caller's thread.
pub trait Driver {
    /// Delivers events to the handler until it returns [`Flow::Quit`] or the driver is
    /// stopped from elsewhere.
    fn run(&self, handler: &mut dyn FnMut(KeyEvent) -> Flow) -> io::Result<()>;
}

/// Pitch mode plays one sample across the keyboard like a piano.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchMode {
    /// The sample being played chromatically.
    pub key: char,
    /// Octave shift in semitones (multiples of 12).
    pub octave: i32,
}

/// Maps the home row and the row above it to a chromatic octave starting at `a`.
pub fn piano_offset(key: char) -> Option<i32> {
    let offset = match key {
        'a' => 0,
        'w' => 1,
        's' => 2,
        'e' => 3,
        'd' => 4,
        'f' => 5,
        't' => 6,
        'g' => 7,
        'y' => 8,
        'h' => 9,
        'u' => 10,
        'j' => 11,
        'k' => 12,
        _ => return None,
    };
    Some(offset)
}

/// Turns key events into triggers, recordings and sequencer toggles.
pub struct Controller {
    registry: Arc<Registry>,
    sequencer: Arc<Sequencer>,
    pitch_mode: Mutex<Option<PitchMode>>,
}

impl Controller {
    pub fn new(registry: Arc<Registry>, sequencer: Arc<Sequencer>) -> Controller {
        Controller {
            registry,
            sequencer,
            pitch_mode: Mutex::new(None),
        }
    }

    /// The current pitch mode, if active.
    pub fn pitch_mode(&self) -> Option<PitchMode> {
        *self.pitch_mode.lock()
    }

    /// Runs the driver until it quits.
    pub fn run(&self, driver: &dyn Driver) -> io::Result<()> {
        info!("Controller started.");
        driver.run(&mut |event| self.handle(event))
    }

    pub fn handle(&self, event: KeyEvent) -> Flow {
        let (key, shift) = match event {
            KeyEvent::Escape => return Flow::Quit,
            KeyEvent::Shift => {
                if self.pitch_mode.lock().take().is_some() {
                    info!("Left pitch mode");
                }
                return Flow::Continue;
            }
            KeyEvent::Char { key, shift } => (key, shift),
        };

        if shift {
            let mut pitch_mode = self.pitch_mode.lock();
            if pitch_mode.is_none() {
                info!(key = %key, "Entered pitch mode");
                *pitch_mode = Some(PitchMode { key, octave: 0 });
            }
            return Flow::Continue;
        }

        match key {
            RECORD_KEY => {
                self.sequencer.toggle_recording();
                return Flow::Continue;
            }
            PLAY_KEY => {
                self.sequencer.toggle_playing();
                return Flow::Continue;
            }
            _ => {}
        }

        let pitch_mode = self.pitch_mode();
        match pitch_mode {
            Some(mode) => self.handle_pitch_key(mode, key),
            None => {
                self.sequencer.record_key(key, 0.0);
                self.trigger(key, 0.0);
            }
        }
        Flow::Continue
    }

    fn handle_pitch_key(&self, mode: PitchMode, key: char) {
        let octave_shift = match key {
            OCTAVE_DOWN_KEY => -12,
            OCTAVE_UP_KEY => 12,
            _ => 0,
        };
        if octave_shift != 0 {
            let mut pitch_mode = self.pitch_mode.lock();
            if let Some(mode) = pitch_mode.as_mut() {
                mode.octave += octave_shift;
                debug!(octave = mode.octave, "Octave shifted");
            }
            return;
        }

        let Some(offset) = piano_offset(key) else {
            return;
        };
        let semitones = f64::from(offset + mode.octave);
        self.trigger(mode.key, semitones);
        self.sequencer.record_key(mode.key, semitones);
    }

    fn trigger(&self, key: char, semitones: f64) {
        match self.registry.trigger(key, semitones) {
            Ok(()) => {}
            Err(TriggerError::NotFound(_)) => debug!(key = %key, "No sample for key"),
            Err(e) => warn!(key = %key, err = %e, "Unable to trigger sample"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::audio::mock::{Call, Engine};

    fn controller() -> (Engine, Arc<Sequencer>, Controller) {
        let engine = Engine::new("mock");
        let registry = Arc::new(Registry::new(Arc::new(engine.clone())));
        registry
            .register('a', Path::new("/samples/kick.wav"), 1.0)
            .unwrap();
        registry
            .register('s', Path::new("/samples/snare.wav"), 1.0)
            .unwrap();

        let sequencer = {
            let registry = registry.clone();
            Arc::new(Sequencer::new(move |key, pitch| {
                let _ = registry.trigger(key, pitch);
            }))
        };
        engine.clear_calls();
        let controller = Controller::new(registry, sequencer.clone());
        (engine, sequencer, controller)
    }

    fn press(key: char) -> KeyEvent {
        KeyEvent::Char { key, shift: false }
    }

    fn shifted(key: char) -> KeyEvent {
        KeyEvent::Char { key, shift: true }
    }

    fn seeks(engine: &Engine) -> Vec<(PathBuf, f64)> {
        engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Seek { path, rate } => Some((path, rate)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_piano_offsets() {
        let keys = "awsedftgyhujk";
        for (i, key) in keys.chars().enumerate() {
            assert_eq!(piano_offset(key), Some(i as i32));
        }
        assert_eq!(piano_offset('z'), None);
        assert_eq!(piano_offset('1'), None);
    }

    #[test]
    fn test_plain_keys_trigger_at_original_pitch() {
        let (engine, _sequencer, controller) = controller();

        assert_eq!(controller.handle(press('a')), Flow::Continue);
        assert_eq!(controller.handle(press('q')), Flow::Continue);
        assert_eq!(
            seeks(&engine),
            vec![(PathBuf::from("/samples/kick.wav"), 1.0)]
        );
    }

    #[test]
    fn test_escape_quits() {
        let (_engine, _sequencer, controller) = controller();
        assert_eq!(controller.handle(KeyEvent::Escape), Flow::Quit);
    }

    #[test]
    fn test_pitch_mode() {
        let (engine, _sequencer, controller) = controller();

        controller.handle(shifted('s'));
        assert_eq!(
            controller.pitch_mode(),
            Some(PitchMode {
                key: 's',
                octave: 0
            })
        );
        // Shift with another key doesn't switch samples.
        controller.handle(shifted('a'));
        assert_eq!(controller.pitch_mode().map(|m| m.key), Some('s'));
        assert!(seeks(&engine).is_empty());

        controller.handle(press('k'));
        controller.handle(press('z'));
        controller.handle(press('z'));
        controller.handle(press('a'));
        controller.handle(press('x'));
        controller.handle(press('g'));
        // Not a piano key.
        controller.handle(press('q'));

        let snare = PathBuf::from("/samples/snare.wav");
        let expected = [12.0, -24.0, -5.0]
            .iter()
            .map(|semitones: &f64| (snare.clone(), 2f64.powf(semitones / 12.0)))
            .collect::<Vec<_>>();
        assert_eq!(seeks(&engine), expected);

        controller.handle(KeyEvent::Shift);
        assert_eq!(controller.pitch_mode(), None);
        engine.clear_calls();
        controller.handle(press('a'));
        assert_eq!(
            seeks(&engine),
            vec![(PathBuf::from("/samples/kick.wav"), 1.0)]
        );
    }

    #[test]
    fn test_sequencer_keys() {
        let (_engine, sequencer, controller) = controller();

        controller.handle(press(RECORD_KEY));
        assert!(sequencer.is_recording());
        controller.handle(press('a'));
        controller.handle(shifted('s'));
        controller.handle(press('d'));
        controller.handle(press(RECORD_KEY));

        assert!(!sequencer.is_recording());
        assert!(sequencer.is_playing());
        let recorded: Vec<(char, f64)> = sequencer
            .points()
            .iter()
            .map(|p| (p.key, p.pitch))
            .collect();
        assert_eq!(recorded, vec![('a', 0.0), ('s', 4.0)]);

        controller.handle(press(PLAY_KEY));
        assert!(!sequencer.is_playing());
    }

    struct Scripted(Vec<KeyEvent>);

    impl Driver for Scripted {
        fn run(&self, handler: &mut dyn FnMut(KeyEvent) -> Flow) -> io::Result<()> {
            for event in self.0.iter() {
                if handler(*event) == Flow::Quit {
                    break;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_run_stops_at_quit() {
        let (engine, _sequencer, controller) = controller();
        let driver = Scripted(vec![press('a'), KeyEvent::Escape, press('s')]);

        controller.run(&driver).unwrap();
        assert_eq!(seeks(&engine).len(), 1);
    }
}
