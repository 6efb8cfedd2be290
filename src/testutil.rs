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
    error::Error,
    fs::File,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use hound::{SampleFormat, WavSpec, WavWriter};

/// Wait for the given predicate to return true or fail.
#[inline]
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let mut tick = Duration::from_millis(5);
    let timeout = Duration::from_secs(10);
    let max_tick = Duration::from_millis(100);

    loop {
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }

        // Exponential backoff to reduce CPU contention
        thread::sleep(tick);
        tick = std::cmp::min(tick * 2, max_tick);
    }
}

/// Writes a 32-bit integer wav file. Each inner vec holds one channel; all channels must be
/// the same length.
pub fn write_wav(path: &Path, channels: Vec<Vec<i32>>, sample_rate: u32) -> Result<(), Box<dyn Error>> {
    let num_channels = channels.len();
    assert!(num_channels > 0, "At least one channel is required");
    let frames = channels[0].len();
    assert!(
        channels.iter().all(|c| c.len() == frames),
        "Channels must be the same length"
    );

    let mut writer = WavWriter::new(
        File::create(path)?,
        WavSpec {
            channels: num_channels as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Int,
        },
    )?;

    for frame in 0..frames {
        for channel in &channels {
            writer.write_sample(channel[frame])?;
        }
    }
    writer.finalize()?;

    Ok(())
}
