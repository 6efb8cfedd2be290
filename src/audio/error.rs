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
use std::path::PathBuf;

/// Error types for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Sample unavailable {path}: {reason}")]
    ResourceUnavailable { path: PathBuf, reason: String },

    #[error("Unable to prepare playback for {path}: {reason}")]
    InitFailure { path: PathBuf, reason: String },

    #[error("Engine rejected operation: {0}")]
    OperationFailure(String),
}

impl EngineError {
    pub(crate) fn unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> EngineError {
        EngineError::ResourceUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn init(path: impl Into<PathBuf>, reason: impl ToString) -> EngineError {
        EngineError::InitFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
