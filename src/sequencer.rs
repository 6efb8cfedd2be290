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

//! Records timed key events and loops them back.
//!
//! A take is recorded between two calls to [`Sequencer::toggle_recording`].
//! Stopping a take sorts its points and starts playback. Playback is driven
//! by [`Sequencer::tick`], which fires every point whose offset has passed in
//! the current loop iteration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

/// Playback position after a stop or start. Slightly negative so that a point at exactly
/// zero fires on the first tick.
const RESTART_POSITION: f64 = -0.001;

/// A source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One recorded key press.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePoint {
    pub key: char,
    pub time_from_start: Duration,
    pub pitch: f64,
}

/// Called for every point that comes due during playback.
pub type TriggerCallback = Box<dyn Fn(char, f64) + Send + Sync>;

struct State {
    points: Vec<SequencePoint>,
    recording: bool,
    playing: bool,
    record_start: Instant,
    play_start: Instant,
    sequence_length: Duration,
    /// Index of the next point to fire in the current loop iteration.
    cursor: usize,
    /// Wrapped position at the last tick, in seconds.
    previous_position: f64,
}

impl State {
    fn start_playing(&mut self, now: Instant) {
        self.play_start = now;
        self.cursor = 0;
        self.previous_position = RESTART_POSITION;
        self.playing = true;
    }

    fn stop_playing(&mut self) {
        self.cursor = 0;
        self.previous_position = RESTART_POSITION;
        self.playing = false;
    }
}

/// The loop recorder.
pub struct Sequencer {
    clock: Arc<dyn Clock>,
    trigger: TriggerCallback,
    state: Mutex<State>,
}

impl Sequencer {
    /// Creates a sequencer on the wall clock.
    pub fn new<F>(trigger: F) -> Sequencer
    where
        F: Fn(char, f64) + Send + Sync + 'static,
    {
        Sequencer::with_clock(Arc::new(SystemClock), trigger)
    }

    pub fn with_clock<F>(clock: Arc<dyn Clock>, trigger: F) -> Sequencer
    where
        F: Fn(char, f64) + Send + Sync + 'static,
    {
        let now = clock.now();
        Sequencer {
            clock,
            trigger: Box::new(trigger),
            state: Mutex::new(State {
                points: Vec::new(),
                recording: false,
                playing: false,
                record_start: now,
                play_start: now,
                sequence_length: Duration::ZERO,
                cursor: 0,
                previous_position: RESTART_POSITION,
            }),
        }
    }

    /// Starts a new take, or ends the current one and starts looping it.
    pub fn toggle_recording(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.recording {
            state.sequence_length = now.saturating_duration_since(state.record_start);
            state.recording = false;
            state
                .points
                .sort_by(|a, b| a.time_from_start.cmp(&b.time_from_start));
            info!(
                points = state.points.len(),
                length_ms = state.sequence_length.as_millis(),
                "Recording stopped"
            );
            state.start_playing(now);
        } else {
            state.record_start = now;
            state.sequence_length = Duration::ZERO;
            state.points.clear();
            state.recording = true;
            info!("Recording started");
        }
    }

    /// Appends a point to the current take. Does nothing unless recording.
    pub fn record_key(&self, key: char, pitch: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.recording {
            return;
        }

        let time_from_start = now.saturating_duration_since(state.record_start);
        debug!(key = %key, pitch, offset_ms = time_from_start.as_millis(), "Recorded key");
        state.points.push(SequencePoint {
            key,
            time_from_start,
            pitch,
        });
    }

    pub fn toggle_playing(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.playing {
            state.stop_playing();
            info!("Playback stopped");
        } else {
            state.start_playing(now);
            info!("Playback started");
        }
    }

    /// Fires every point that has come due since the last tick. Returns the number fired.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();
        let due = {
            let mut state = self.state.lock();
            if !state.playing || state.sequence_length.is_zero() || state.points.is_empty() {
                return 0;
            }

            let elapsed = now.saturating_duration_since(state.play_start).as_secs_f64();
            let wrapped = elapsed % state.sequence_length.as_secs_f64();

            let mut due = Vec::new();
            if wrapped < state.previous_position {
                // Points the last iteration had not reached yet still belong to it.
                due.extend_from_slice(&state.points[state.cursor..]);
                state.cursor = 0;
            }
            while let Some(point) = state.points.get(state.cursor) {
                if point.time_from_start.as_secs_f64() > wrapped {
                    break;
                }
                due.push(point.clone());
                state.cursor += 1;
            }
            state.previous_position = wrapped;
            due
        };

        for point in due.iter() {
            (self.trigger)(point.key, point.pitch);
        }
        due.len()
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Length of the last take. Zero while recording or before the first take.
    pub fn sequence_length(&self) -> Duration {
        self.state.lock().sequence_length
    }

    /// The points of the current take. Sorted once recording has stopped.
    pub fn points(&self) -> Vec<SequencePoint> {
        self.state.lock().points.clone()
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Sequencer")
            .field("recording", &state.recording)
            .field("playing", &state.playing)
            .field("points", &state.points.len())
            .field("sequence_length", &state.sequence_length)
            .finish()
    }
}
