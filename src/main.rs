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
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use mpccli::audio;
use mpccli::config::Config;
use mpccli::controller::{keyboard, Controller};
use mpccli::playsync::Ticker;
use mpccli::samples::Registry;
use mpccli::sequencer::Sequencer;
use mpccli::ui::{self, Display};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the sequencer checks for due points.
const SEQUENCER_PERIOD: Duration = Duration::from_millis(1);
/// How often the display is redrawn.
const REFRESH_PERIOD: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A keyboard sample instrument with a loop recorder."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Plays the samples in the given configuration from the keyboard.
    Play {
        /// The path to the sample configuration.
        #[arg(default_value = "samples.yaml")]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    // The terminal view owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Play { config } => play(&config)?,
    }

    Ok(())
}

fn play(config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = Config::load(config_path)?;
    let backend = audio::get_backend(config.audio())?;
    info!(engine = %backend, "Opened audio engine.");

    let registry = Arc::new(Registry::new(backend));
    let mut registered = Vec::new();
    let mut missing = Vec::new();
    for spec in config.samples() {
        if !spec.path.exists() {
            missing.push(spec);
            continue;
        }
        match registry.register(spec.key, &spec.path, spec.volume) {
            Ok(()) => registered.push((spec.key, spec.name.clone())),
            Err(e) => error!(key = %spec.key, path = ?spec.path, err = %e, "Unable to register sample"),
        }
    }
    for spec in missing.iter() {
        warn!(key = %spec.key, path = ?spec.path, "Sample file not found, skipping");
    }
    if registered.is_empty() {
        return Err(format!(
            "no samples could be registered from {}",
            config_path.display()
        )
        .into());
    }

    let display = Arc::new(ui::Terminal::new(&registered)?);
    {
        let display = Arc::downgrade(&display);
        registry.set_global_amplitude_observer(move |key, amplitude| {
            if let Some(display) = display.upgrade() {
                display.update_amplitude(key, amplitude);
            }
        });
    }

    let sequencer = {
        let registry = registry.clone();
        Arc::new(Sequencer::new(move |key, pitch| {
            if let Err(e) = registry.trigger(key, pitch) {
                warn!(key = %key, err = %e, "Unable to trigger sequenced sample");
            }
        }))
    };
    let controller = Arc::new(Controller::new(registry.clone(), sequencer.clone()));

    let mut sequencer_ticker = {
        let sequencer = sequencer.clone();
        Ticker::spawn("sequencer", SEQUENCER_PERIOD, move || {
            sequencer.tick();
        })?
    };
    let mut refresh_ticker = {
        let display = display.clone();
        let sequencer = sequencer.clone();
        let controller = controller.clone();
        Ticker::spawn("refresh", REFRESH_PERIOD, move || {
            display.update_sequencer_status(sequencer.is_recording(), sequencer.is_playing());
            display.update_pitch_mode(controller.pitch_mode());
            display.refresh();
        })?
    };

    let driver = keyboard::Driver::new();
    let result = controller.run(&driver);

    sequencer_ticker.stop();
    refresh_ticker.stop();
    drop(display);
    registry.shutdown();
    drop(controller);
    drop(sequencer);
    drop(registry);
    info!("Shut down.");

    result.map_err(|e| e.into())
}
