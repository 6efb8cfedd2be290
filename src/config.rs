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
use std::path::Path;

use ::config::{File, FileFormat, Map, Value};
use serde::Deserialize;
use tracing::info;

mod audio;
mod error;
mod samples;

pub use self::audio::{Audio, DEFAULT_DEVICE};
pub use self::error::ConfigError;
pub use self::samples::{SampleSpec, DEFAULT_VOLUME};

/// The raw YAML layout.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    audio: Option<Audio>,
    /// In file order.
    samples: Option<Map<String, Value>>,
}

/// The instrument configuration.
#[derive(Debug, Clone)]
pub struct Config {
    audio: Audio,
    samples: Vec<SampleSpec>,
}

impl Config {
    /// Loads the configuration from a YAML file. Relative sample paths resolve against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = ::config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()?
            .try_deserialize::<RawConfig>()?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Config::from_raw(raw, base_dir)?;
        info!(
            path = ?path,
            samples = config.samples.len(),
            device = config.audio.device(),
            "Loaded configuration."
        );
        Ok(config)
    }

    /// Parses the configuration from a YAML string.
    pub fn parse(yaml: &str, base_dir: &Path) -> Result<Config, ConfigError> {
        let raw = ::config::Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<RawConfig>()?;
        Config::from_raw(raw, base_dir)
    }

    fn from_raw(raw: RawConfig, base_dir: &Path) -> Result<Config, ConfigError> {
        let samples = raw.samples.ok_or(ConfigError::NoSamples)?;
        Ok(Config {
            audio: raw.audio.unwrap_or_default(),
            samples: samples::parse_samples(samples, base_dir),
        })
    }

    pub fn audio(&self) -> &Audio {
        &self.audio
    }

    /// The samples, sorted by key.
    pub fn samples(&self) -> &[SampleSpec] {
        &self.samples
    }
}
