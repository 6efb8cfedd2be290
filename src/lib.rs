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

//! A keyboard-triggered sample instrument.
//!
//! Keys map to pre-buffered sample voices that retrigger instantly at a chosen
//! pitch. A recorder captures timed key events and loops them back through the
//! same voices.

pub mod audio;
pub mod config;
pub mod controller;
pub mod playsync;
pub mod samples;
pub mod sequencer;
pub mod ui;

#[cfg(test)]
mod testutil;
