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
use serde::Deserialize;

/// Selects the host's default output device.
pub const DEFAULT_DEVICE: &str = "default";

const DEFAULT_BUFFER_SIZE: usize = 256;

/// A YAML representation of the audio configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct Audio {
    /// The audio device: "default", a cpal device name, or anything starting with "mock".
    #[serde(default = "default_device")]
    device: String,

    /// Output sample rate in Hz. Defaults to the device's own rate.
    sample_rate: Option<u32>,

    /// Frames rendered per processing block (default: 256).
    buffer_size: Option<usize>,
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

impl Audio {
    /// New will create a new Audio configuration.
    pub fn new(device: &str) -> Audio {
        Audio {
            device: device.to_string(),
            sample_rate: None,
            buffer_size: None,
        }
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the configured sample rate, if any.
    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    /// Returns the processing block size in frames.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.filter(|size| *size > 0).unwrap_or(DEFAULT_BUFFER_SIZE)
    }
}

impl Default for Audio {
    fn default() -> Self {
        Audio::new(DEFAULT_DEVICE)
    }
}
