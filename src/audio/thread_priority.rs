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

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{debug, warn};

/// Priority for the processing thread when MPCCLI_THREAD_PRIORITY is unset.
const DEFAULT_PROCESSING_THREAD_PRIORITY: u8 = 70;

/// Reads MPCCLI_THREAD_PRIORITY (0-99), falling back to the default on anything unparsable.
pub fn processing_thread_priority() -> u8 {
    parse_priority(std::env::var("MPCCLI_THREAD_PRIORITY").ok().as_deref())
}

fn parse_priority(value: Option<&str>) -> u8 {
    value
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|n| *n < 100)
        .unwrap_or(DEFAULT_PROCESSING_THREAD_PRIORITY)
}

/// Raises the calling thread's priority. Failure only costs timing headroom, so it is logged
/// and otherwise ignored.
pub fn raise_current_thread_priority(priority: u8) {
    let value = match ThreadPriorityValue::try_from(priority) {
        Ok(value) => value,
        Err(e) => {
            warn!(priority, err = ?e, "Invalid thread priority");
            return;
        }
    };

    match set_current_thread_priority(ThreadPriority::Crossplatform(value)) {
        Ok(()) => debug!(priority, "Raised processing thread priority"),
        Err(e) => debug!(priority, err = %e, "Unable to raise processing thread priority"),
    }
}
