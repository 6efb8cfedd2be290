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
use std::io;

use parking_lot::Mutex;
use ratatui::{
    layout::{Constraint, Layout},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    DefaultTerminal, Frame,
};
use tracing::warn;

use crate::controller::PitchMode;

/// Fraction of a meter's level lost on every refresh.
const DECAY: f32 = 0.05;

/// Receives what the instrument wants to show. Amplitude updates arrive on the audio
/// processing thread, so implementations must not block for long.
pub trait Display: Send + Sync {
    fn update_amplitude(&self, key: char, amplitude: f32);
    fn update_sequencer_status(&self, recording: bool, playing: bool);
    fn update_pitch_mode(&self, pitch_mode: Option<PitchMode>);
    fn refresh(&self);
}

struct Meter {
    key: char,
    name: String,
    level: f32,
}

/// The state shown by the terminal view.
pub struct Meters {
    meters: Vec<Meter>,
    recording: bool,
    playing: bool,
    pitch_mode: Option<PitchMode>,
}

impl Meters {
    /// Creates a meter per (key, name) pair, in the given order.
    pub fn new(samples: &[(char, String)]) -> Meters {
        Meters {
            meters: samples
                .iter()
                .map(|(key, name)| Meter {
                    key: *key,
                    name: name.clone(),
                    level: 0.0,
                })
                .collect(),
            recording: false,
            playing: false,
            pitch_mode: None,
        }
    }

    /// Sets a meter's level, clamped to [0, 1]. Unknown keys are ignored.
    pub fn set_amplitude(&mut self, key: char, amplitude: f32) {
        if let Some(meter) = self.meters.iter_mut().find(|meter| meter.key == key) {
            meter.level = if amplitude.is_nan() {
                0.0
            } else {
                amplitude.clamp(0.0, 1.0)
            };
        }
    }

    pub fn level(&self, key: char) -> Option<f32> {
        self.meters
            .iter()
            .find(|meter| meter.key == key)
            .map(|meter| meter.level)
    }

    pub fn decay(&mut self) {
        for meter in self.meters.iter_mut() {
            meter.level *= 1.0 - DECAY;
        }
    }

    pub fn set_sequencer_status(&mut self, recording: bool, playing: bool) {
        self.recording = recording;
        self.playing = playing;
    }

    pub fn set_pitch_mode(&mut self, pitch_mode: Option<PitchMode>) {
        self.pitch_mode = pitch_mode;
    }

    fn status_line(&self) -> Line<'static> {
        if self.recording {
            Line::from(vec![
                Span::styled("● REC ", Style::default().fg(Color::Red)),
                Span::styled("press 1 to stop", Style::default().fg(Color::DarkGray)),
            ])
        } else if self.playing {
            Line::from(vec![
                Span::styled("▶ PLAYING ", Style::default().fg(Color::Green)),
                Span::styled("press 2 to stop", Style::default().fg(Color::DarkGray)),
            ])
        } else {
            Line::styled(
                "1 record | 2 play | Esc quit",
                Style::default().fg(Color::DarkGray),
            )
        }
    }

    fn pitch_line(&self) -> Line<'static> {
        match self.pitch_mode {
            Some(mode) => Line::from(vec![
                Span::styled(
                    format!("Pitch mode [{}] octave {:+} ", mode.key, mode.octave / 12),
                    Style::default().fg(Color::Cyan),
                ),
                Span::styled(
                    "z/x octave, shift to leave",
                    Style::default().fg(Color::DarkGray),
                ),
            ]),
            None => Line::styled(
                "Shift+key plays a sample chromatically",
                Style::default().fg(Color::DarkGray),
            ),
        }
    }
}

/// Draws the meters and status lines into a frame.
pub fn render(frame: &mut Frame, meters: &Meters) {
    let block = Block::default().title(" mpccli ").borders(Borders::ALL);
    let inner = block.inner(frame.area());
    frame.render_widget(block, frame.area());

    let mut constraints: Vec<Constraint> = meters
        .meters
        .iter()
        .map(|_| Constraint::Length(1))
        .collect();
    constraints.extend([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(0),
    ]);
    let rows = Layout::vertical(constraints).split(inner);

    for (meter, area) in meters.meters.iter().zip(rows.iter()) {
        let gauge = Gauge::default()
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .label(format!(
                "[{}] {} {:.0}%",
                meter.key,
                meter.name,
                meter.level * 100.0
            ))
            .ratio(f64::from(meter.level));
        frame.render_widget(gauge, *area);
    }

    let count = meters.meters.len();
    frame.render_widget(Paragraph::new(meters.status_line()), rows[count + 1]);
    frame.render_widget(Paragraph::new(meters.pitch_line()), rows[count + 2]);
}

/// A full-screen meter view on the terminal's alternate screen.
pub struct Terminal {
    meters: Mutex<Meters>,
    terminal: Mutex<DefaultTerminal>,
}

impl Terminal {
    pub fn new(samples: &[(char, String)]) -> io::Result<Terminal> {
        let terminal = ratatui::try_init()?;
        Ok(Terminal {
            meters: Mutex::new(Meters::new(samples)),
            terminal: Mutex::new(terminal),
        })
    }
}

impl Display for Terminal {
    fn update_amplitude(&self, key: char, amplitude: f32) {
        self.meters.lock().set_amplitude(key, amplitude);
    }

    fn update_sequencer_status(&self, recording: bool, playing: bool) {
        self.meters.lock().set_sequencer_status(recording, playing);
    }

    fn update_pitch_mode(&self, pitch_mode: Option<PitchMode>) {
        self.meters.lock().set_pitch_mode(pitch_mode);
    }

    fn refresh(&self) {
        let mut terminal = self.terminal.lock();
        let result = terminal.draw(|frame| {
            let mut meters = self.meters.lock();
            render(frame, &meters);
            meters.decay();
        });
        if let Err(e) = result {
            warn!(err = %e, "Unable to draw the display");
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        if let Err(e) = ratatui::try_restore() {
            warn!(err = %e, "Unable to restore the terminal");
        }
    }
}
