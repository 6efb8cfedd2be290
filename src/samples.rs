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

//! Key-triggered sample playback.
//!
//! This module provides:
//! - Sample decoding and caching (in-memory, so triggers never touch the disk)
//! - Pre-buffered voices that retrigger instantly at any pitch
//! - The key to voice registry

mod loader;
mod registry;
mod voice;

pub use loader::{LoadedSample, SampleLoader};
pub use registry::{AmplitudeCallback, Registry, TriggerError};
pub use voice::{AmplitudeObserver, Completion, CompletionObserver, Voice, VoiceState};
