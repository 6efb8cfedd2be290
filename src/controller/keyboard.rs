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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{
    self, Event, KeyCode, KeyEventKind, KeyModifiers, KeyboardEnhancementFlags, ModifierKeyCode,
    PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::{execute, terminal};
use tracing::{info, span, warn, Level};

use super::{Flow, KeyEvent};

/// How often the stop flag is checked while waiting for input.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reads keys from the terminal in raw mode.
pub struct Driver {
    running: Arc<AtomicBool>,
}

impl Driver {
    pub fn new() -> Driver {
        Driver {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Ends a running loop within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the terminal however the loop exits.
struct RawMode {
    enhanced: bool,
}

impl RawMode {
    fn enable() -> io::Result<RawMode> {
        terminal::enable_raw_mode()?;
        // Bare shift presses are only reported with the enhancement protocol.
        let enhanced = terminal::supports_keyboard_enhancement().unwrap_or(false);
        if enhanced {
            execute!(
                io::stdout(),
                PushKeyboardEnhancementFlags(
                    KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                        | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
                        | KeyboardEnhancementFlags::REPORT_ALL_KEYS_AS_ESCAPE_CODES
                )
            )?;
        } else {
            warn!("Terminal can't report bare shift presses; use Tab to leave pitch mode");
        }
        Ok(RawMode { enhanced })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.enhanced {
            let _ = execute!(io::stdout(), PopKeyboardEnhancementFlags);
        }
        let _ = terminal::disable_raw_mode();
    }
}

impl super::Driver for Driver {
    fn run(&self, handler: &mut dyn FnMut(KeyEvent) -> Flow) -> io::Result<()> {
        let span = span!(Level::INFO, "keyboard driver");
        let _enter = span.enter();

        let _raw_mode = RawMode::enable()?;
        info!("Keyboard driver started.");

        while self.running.load(Ordering::Relaxed) {
            if !event::poll(POLL_INTERVAL)? {
                continue;
            }
            if let Event::Key(key) = event::read()? {
                if let Some(event) = translate(&key) {
                    if handler(event) == Flow::Quit {
                        break;
                    }
                }
            }
        }

        info!("Keyboard driver stopped.");
        Ok(())
    }
}

/// Maps a terminal key event to an instrument key event. Releases are dropped; uppercase
/// letters fold to lowercase with shift held.
pub fn translate(key: &event::KeyEvent) -> Option<KeyEvent> {
    if key.kind == KeyEventKind::Release {
        return None;
    }

    match key.code {
        KeyCode::Esc => Some(KeyEvent::Escape),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(KeyEvent::Escape)
        }
        KeyCode::Modifier(ModifierKeyCode::LeftShift | ModifierKeyCode::RightShift) => {
            Some(KeyEvent::Shift)
        }
        KeyCode::Tab => Some(KeyEvent::Shift),
        KeyCode::Char(c) => {
            let shift = key.modifiers.contains(KeyModifiers::SHIFT) || c.is_uppercase();
            let key = c.to_lowercase().next().unwrap_or(c);
            Some(KeyEvent::Char { key, shift })
        }
        _ => None,
    }
}
