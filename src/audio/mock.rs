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
use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::info;

use super::{
    Backend, BusMessage, EngineError, Pipeline, PipelineEvents, PipelineState, StateChange,
};

/// Every call made against the mock engine, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Prepare { path: PathBuf, volume: f32 },
    Seek { path: PathBuf, rate: f64 },
    SetGain { path: PathBuf, gain: f32 },
    SetState { path: PathBuf, state: PipelineState },
    WaitForState { path: PathBuf },
    Release { path: PathBuf },
}

struct Live {
    path: PathBuf,
    events: Arc<PipelineEvents>,
    generation: u64,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    next_id: u64,
    live: HashMap<u64, Live>,
    unavailable: HashSet<PathBuf>,
    broken: HashSet<PathBuf>,
    reject_operations: bool,
    hang_on_stop: bool,
}

/// A mock engine. Doesn't play anything, but records what it was asked to do and lets the
/// caller play the part of the engine's threads.
#[derive(Clone)]
pub struct Engine {
    name: String,
    state: Arc<Mutex<State>>,
}

impl Engine {
    pub fn new(name: &str) -> Engine {
        Engine {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Makes preparing the given path fail as if the file could not be read.
    pub fn mark_unavailable(&self, path: impl Into<PathBuf>) {
        self.state.lock().unavailable.insert(path.into());
    }

    /// Makes preparing the given path fail as if it could not be decoded.
    pub fn mark_broken(&self, path: impl Into<PathBuf>) {
        self.state.lock().broken.insert(path.into());
    }

    /// Makes seek and state changes on every pipeline fail.
    pub fn reject_operations(&self, reject: bool) {
        self.state.lock().reject_operations = reject;
    }

    /// Makes stop requests never complete.
    pub fn hang_on_stop(&self, hang: bool) {
        self.state.lock().hang_on_stop = hang;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of pipelines prepared and not yet released.
    pub fn live_pipelines(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of live pipelines for the given path.
    pub fn live_pipelines_for(&self, path: &Path) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|live| live.path == path)
            .count()
    }

    /// Delivers a block of PCM to every live pipeline for the path.
    pub fn emit_buffer(&self, path: &Path, block: &[f32]) {
        for (events, _) in self.events_for(path) {
            (events.on_buffer)(block);
        }
    }

    /// Delivers end-of-stream for the current generation to every live pipeline for the path.
    pub fn emit_end_of_stream(&self, path: &Path) {
        for (events, generation) in self.events_for(path) {
            (events.on_message)(BusMessage::EndOfStream(generation));
        }
    }

    /// Delivers an end-of-stream for the given generation, current or not.
    pub fn emit_end_of_stream_for(&self, path: &Path, generation: u64) {
        for (events, _) in self.events_for(path) {
            (events.on_message)(BusMessage::EndOfStream(generation));
        }
    }

    /// Delivers an error to every live pipeline for the path.
    pub fn emit_error(&self, path: &Path, message: &str) {
        for (events, _) in self.events_for(path) {
            (events.on_message)(BusMessage::Error(message.to_string()));
        }
    }

    // Handlers run without the mock's lock held so they may call back into the engine.
    fn events_for(&self, path: &Path) -> Vec<(Arc<PipelineEvents>, u64)> {
        self.state
            .lock()
            .live
            .values()
            .filter(|live| live.path == path)
            .map(|live| (live.events.clone(), live.generation))
            .collect()
    }
}

impl Backend for Engine {
    fn prepare(
        &self,
        path: &Path,
        volume: f32,
        events: PipelineEvents,
    ) -> Result<Box<dyn Pipeline>, EngineError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Prepare {
            path: path.to_path_buf(),
            volume,
        });

        if state.unavailable.contains(path) {
            return Err(EngineError::unavailable(path, "no such file"));
        }
        if state.broken.contains(path) {
            return Err(EngineError::init(path, "unable to decode"));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(
            id,
            Live {
                path: path.to_path_buf(),
                events: Arc::new(events),
                generation: 0,
            },
        );
        info!(device = self.name, path = ?path, "Prepared mock pipeline.");

        Ok(Box::new(MockPipeline {
            id,
            path: path.to_path_buf(),
            stop_pending: false,
            state: self.state.clone(),
        }))
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

struct MockPipeline {
    id: u64,
    path: PathBuf,
    stop_pending: bool,
    state: Arc<Mutex<State>>,
}

impl Pipeline for MockPipeline {
    fn seek(&mut self, rate: f64) -> Result<u64, EngineError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Seek {
            path: self.path.clone(),
            rate,
        });
        if state.reject_operations {
            return Err(EngineError::OperationFailure("seek rejected".to_string()));
        }
        let live = state
            .live
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::OperationFailure("pipeline released".to_string()))?;
        live.generation += 1;
        Ok(live.generation)
    }

    fn set_gain(&self, gain: f32) {
        self.state.lock().calls.push(Call::SetGain {
            path: self.path.clone(),
            gain,
        });
    }

    fn set_state(&mut self, requested: PipelineState) -> Result<StateChange, EngineError> {
        let mut state = self.state.lock();
        state.calls.push(Call::SetState {
            path: self.path.clone(),
            state: requested,
        });
        if state.reject_operations {
            return Err(EngineError::OperationFailure(format!(
                "{:?} rejected",
                requested
            )));
        }
        if requested == PipelineState::Stopped && state.hang_on_stop {
            self.stop_pending = true;
            return Ok(StateChange::Async);
        }
        Ok(StateChange::Success)
    }

    fn wait_for_state(&self, timeout: Duration) -> StateChange {
        self.state.lock().calls.push(Call::WaitForState {
            path: self.path.clone(),
        });
        if self.stop_pending {
            std::thread::sleep(timeout);
            return StateChange::Async;
        }
        StateChange::Success
    }
}

impl Drop for MockPipeline {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live.remove(&self.id);
        state.calls.push(Call::Release {
            path: self.path.clone(),
        });
    }
}
