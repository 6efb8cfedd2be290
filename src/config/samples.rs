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
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use config::{Map, Value};
use serde::Deserialize;
use tracing::warn;

/// Default volume when a sample doesn't specify one.
pub const DEFAULT_VOLUME: f32 = 1.0;

/// A YAML representation of a sample definition.
#[derive(Deserialize, Clone, Debug)]
struct SampleDefinition {
    path: Option<String>,
    key: Option<String>,
    volume: Option<f32>,
}

/// A sample to register at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleSpec {
    pub key: char,
    pub path: PathBuf,
    pub volume: f32,
    pub name: String,
}

/// Turns the raw `samples` section into specs sorted by key. Invalid entries are skipped with a
/// warning; when two entries share a key the later one in the file wins.
pub(super) fn parse_samples(samples: Map<String, Value>, base_dir: &Path) -> Vec<SampleSpec> {
    let mut by_key: BTreeMap<char, SampleSpec> = BTreeMap::new();

    for (name, value) in samples {
        let definition = match value.try_deserialize::<SampleDefinition>() {
            Ok(definition) => definition,
            Err(e) => {
                warn!(sample = name, err = %e, "Skipping invalid sample definition");
                continue;
            }
        };

        let Some(path) = definition.path else {
            warn!(sample = name, "Skipping sample without a path");
            continue;
        };
        let key = match definition.key.as_deref().map(single_char) {
            Some(Some(key)) => key,
            _ => {
                warn!(sample = name, key = ?definition.key, "Skipping sample without a single-character key");
                continue;
            }
        };

        let mut volume = definition.volume.unwrap_or(DEFAULT_VOLUME);
        if !(0.0..=1.0).contains(&volume) {
            warn!(sample = name, volume, "Clamping volume to [0, 1]");
            volume = volume.clamp(0.0, 1.0);
        }

        let path = PathBuf::from(path);
        let path = if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        };

        let spec = SampleSpec {
            key,
            path,
            volume,
            name: name.clone(),
        };
        if let Some(previous) = by_key.insert(key, spec) {
            warn!(
                key = %key,
                replaced = previous.name,
                sample = name,
                "Duplicate key, later sample wins"
            );
        }
    }

    by_key.into_values().collect()
}

fn single_char(key: &str) -> Option<char> {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}
