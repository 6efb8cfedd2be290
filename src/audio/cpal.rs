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
use std::{
    cell::UnsafeCell,
    error::Error,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, span, warn, Level};

use super::{
    mixer::{Mixer, Slot, Transport},
    thread_priority, Backend, BusMessage, EngineError, Pipeline, PipelineEvents, PipelineState,
    StateChange,
};
use crate::{
    config,
    samples::{LoadedSample, SampleLoader},
};

/// Single-producer, single-consumer ring of interleaved samples between the processing thread
/// and the cpal callback.
struct CircularBuffer {
    buffer: Box<[UnsafeCell<f32>]>,
    /// Capacity (power of 2)
    capacity: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

// The producer only writes the region between write_pos and read_pos and the consumer only
// reads the region between read_pos and write_pos. Positions are published with release
// ordering after the copy.
unsafe impl Sync for CircularBuffer {}

impl CircularBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two();
        Self {
            buffer: (0..capacity).map(|_| UnsafeCell::new(0.0)).collect(),
            capacity,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut f32 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// Number of samples available to read.
    #[inline]
    fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    /// Space available to write.
    #[inline]
    fn space(&self) -> usize {
        self.capacity - self.available() - 1
    }

    /// Returns the number of samples actually written.
    fn write(&self, samples: &[f32]) -> usize {
        let to_write = self.space().min(samples.len());
        if to_write == 0 {
            return 0;
        }
        let write = self.write_pos.load(Ordering::Acquire);
        let first_chunk = (self.capacity - write).min(to_write);

        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), self.base().add(write), first_chunk);
            if to_write > first_chunk {
                std::ptr::copy_nonoverlapping(
                    samples.as_ptr().add(first_chunk),
                    self.base(),
                    to_write - first_chunk,
                );
            }
        }

        self.write_pos
            .store((write + to_write) & (self.capacity - 1), Ordering::Release);
        to_write
    }

    /// Returns the number of samples actually read.
    fn read(&self, output: &mut [f32]) -> usize {
        let to_read = self.available().min(output.len());
        if to_read == 0 {
            return 0;
        }
        let read = self.read_pos.load(Ordering::Acquire);
        let first_chunk = (self.capacity - read).min(to_read);

        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(read), output.as_mut_ptr(), first_chunk);
            if to_read > first_chunk {
                std::ptr::copy_nonoverlapping(
                    self.base(),
                    output.as_mut_ptr().add(first_chunk),
                    to_read - first_chunk,
                );
            }
        }

        self.read_pos
            .store((read + to_read) & (self.capacity - 1), Ordering::Release);
        to_read
    }
}

/// f32 callback: read directly into the cpal buffer.
fn create_f32_callback(
    ring: Arc<CircularBuffer>,
) -> impl FnMut(&mut [f32], &cpal::OutputCallbackInfo) + Send + 'static {
    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        let read = ring.read(data);
        data[read..].fill(0.0);
    }
}

/// Integer callback: read from the ring and convert.
fn create_converting_callback<T: cpal::SizedSample + cpal::FromSample<f32>>(
    ring: Arc<CircularBuffer>,
) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo) + Send + 'static {
    let mut temp: Vec<f32> = Vec::new();
    move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
        temp.resize(data.len(), 0.0);
        let read = ring.read(&mut temp);
        temp[read..].fill(0.0);

        for (dst, &src) in data.iter_mut().zip(temp.iter()) {
            *dst = T::from_sample(src);
        }
    }
}

/// Owns the engine threads. Dropping it stops and joins all of them.
struct OutputManager {
    mixer: Arc<Mixer>,
    running: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl OutputManager {
    fn start(
        device: cpal::Device,
        sample_format: cpal::SampleFormat,
        num_channels: u16,
        sample_rate: u32,
        block_frames: usize,
    ) -> Result<OutputManager, Box<dyn Error>> {
        let (bus_tx, bus_rx) = crossbeam_channel::unbounded();
        let mixer = Arc::new(Mixer::new(num_channels, sample_rate, bus_tx));
        let running = Arc::new(AtomicBool::new(true));

        // ~100ms of audio between the processing thread and the callback.
        let capacity_samples = (sample_rate as usize * num_channels as usize) / 10;
        let ring = Arc::new(CircularBuffer::new(capacity_samples.max(1024)));

        let mut manager = OutputManager {
            mixer: mixer.clone(),
            running: running.clone(),
            threads: Vec::new(),
        };

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        {
            let running = running.clone();
            let ring = ring.clone();
            manager.threads.push(
                thread::Builder::new()
                    .name("mpccli-output".into())
                    .spawn(move || {
                        output_thread(
                            device,
                            sample_format,
                            num_channels,
                            sample_rate,
                            ring,
                            running,
                            ready_tx,
                        )
                    })?,
            );
        }

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err("timed out starting the output stream".into()),
        }

        {
            let mixer = mixer.clone();
            let running = running.clone();
            manager.threads.push(
                thread::Builder::new()
                    .name("mpccli-processing".into())
                    .spawn(move || processing_thread(mixer, ring, running, block_frames))?,
            );
        }

        {
            let mixer = mixer.clone();
            let running = running.clone();
            manager.threads.push(
                thread::Builder::new()
                    .name("mpccli-bus".into())
                    .spawn(move || bus_thread(mixer, bus_rx, running))?,
            );
        }

        Ok(manager)
    }
}

impl Drop for OutputManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Engine thread panicked");
            }
        }
    }
}

/// Creates the cpal stream inside its own thread and keeps it alive until shutdown.
fn output_thread(
    device: cpal::Device,
    sample_format: cpal::SampleFormat,
    num_channels: u16,
    sample_rate: u32,
    ring: Arc<CircularBuffer>,
    running: Arc<AtomicBool>,
    ready: crossbeam_channel::Sender<Result<(), String>>,
) {
    let config = cpal::StreamConfig {
        channels: num_channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let on_error = |err: cpal::StreamError| error!(err = %err, "cpal output stream error");

    let stream_result = match sample_format {
        cpal::SampleFormat::F32 => {
            device.build_output_stream(&config, create_f32_callback(ring), on_error, None)
        }
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            create_converting_callback::<i16>(ring),
            on_error,
            None,
        ),
        cpal::SampleFormat::I32 => device.build_output_stream(
            &config,
            create_converting_callback::<i32>(ring),
            on_error,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_output_stream(
            &config,
            create_converting_callback::<u16>(ring),
            on_error,
            None,
        ),
        other => {
            let _ = ready.send(Err(format!("unsupported sample format {:?}", other)));
            return;
        }
    };

    let stream = match stream_result {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(format!("unable to create output stream: {}", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("unable to start output stream: {}", e)));
        return;
    }
    info!(channels = num_channels, sample_rate, "Output stream started");
    let _ = ready.send(Ok(()));

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    debug!("Output stream stopped");
}

/// Renders mixer blocks into the ring buffer.
fn processing_thread(
    mixer: Arc<Mixer>,
    ring: Arc<CircularBuffer>,
    running: Arc<AtomicBool>,
    block_frames: usize,
) {
    let span = span!(Level::INFO, "processing");
    let _enter = span.enter();

    thread_priority::raise_current_thread_priority(thread_priority::processing_thread_priority());

    let block_samples = block_frames * mixer.num_channels() as usize;
    let mut scratch = vec![0.0f32; block_samples];
    let mut active = Vec::new();
    let mut voice = Vec::with_capacity(block_samples);

    while running.load(Ordering::Relaxed) {
        if ring.space() >= block_samples {
            mixer.render(&mut scratch, block_frames, &mut active, &mut voice);
            ring.write(&scratch);
        } else {
            thread::sleep(Duration::from_micros(500));
        }
    }
}

/// Delivers bus messages to slot handlers, off the processing thread.
fn bus_thread(mixer: Arc<Mixer>, bus: Receiver<(u64, BusMessage)>, running: Arc<AtomicBool>) {
    let span = span!(Level::INFO, "bus");
    let _enter = span.enter();

    while running.load(Ordering::Relaxed) {
        match bus.recv_timeout(Duration::from_millis(50)) {
            Ok((id, message)) => deliver(&mixer, id, message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Hands a bus message to its slot. The slot may have been released since the message was
/// posted.
fn deliver(mixer: &Mixer, id: u64, message: BusMessage) {
    if let Some(slot) = mixer.get(id) {
        slot.dispatch(message);
    }
}

/// Installs a paused slot for the sample and returns the pipeline that controls it.
fn install(
    mixer: &Arc<Mixer>,
    sample: LoadedSample,
    volume: f32,
    events: PipelineEvents,
) -> Box<dyn Pipeline> {
    let slot = Arc::new(Slot::new(sample, volume, events));
    mixer.add(slot.clone());
    Box::new(CpalPipeline {
        slot,
        mixer: mixer.clone(),
    })
}

/// The cpal playback engine.
pub struct Engine {
    name: String,
    host_id: cpal::HostId,
    loader: SampleLoader,
    output: OutputManager,
}

impl Engine {
    /// Lists the names of the output devices on every available host.
    pub fn list() -> Result<Vec<String>, Box<dyn Error>> {
        Ok(Engine::list_cpal_devices()?
            .into_iter()
            .map(|(name, host_id, _)| format!("{} ({})", name, host_id.name()))
            .collect())
    }

    fn list_cpal_devices() -> Result<Vec<(String, cpal::HostId, cpal::Device)>, Box<dyn Error>> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout()?;
        let _shh_stderr = shh::stderr()?;

        let mut devices = Vec::new();
        for host_id in cpal::available_hosts() {
            let host_devices = match cpal::host_from_id(host_id)?.output_devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                if device.default_output_config().is_err() {
                    continue;
                }
                if let Ok(name) = device.name() {
                    devices.push((name, host_id, device));
                }
            }
        }

        devices.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(devices)
    }

    /// Opens the configured device and starts the engine threads.
    pub fn open(config: &config::Audio) -> Result<Engine, Box<dyn Error>> {
        let span = span!(Level::INFO, "open engine (cpal)");
        let _enter = span.enter();

        let (name, host_id, device) = if config.device() == config::DEFAULT_DEVICE {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or("no default output device")?;
            (device.name()?, host.id(), device)
        } else {
            let wanted = config.device();
            Engine::list_cpal_devices()?
                .into_iter()
                .find(|(name, _, _)| name.trim() == wanted)
                .ok_or_else(|| format!("no device found with name {}", wanted))?
        };

        let default_config = device.default_output_config()?;
        let sample_rate = config
            .sample_rate()
            .unwrap_or(default_config.sample_rate().0);
        let num_channels = default_config.channels();

        info!(
            device = name,
            host = host_id.name(),
            channels = num_channels,
            sample_rate,
            buffer_size = config.buffer_size(),
            "Opening output device."
        );

        let output = OutputManager::start(
            device,
            default_config.sample_format(),
            num_channels,
            sample_rate,
            config.buffer_size(),
        )?;

        Ok(Engine {
            name,
            host_id,
            loader: SampleLoader::new(sample_rate),
            output,
        })
    }
}

impl Backend for Engine {
    fn prepare(
        &self,
        path: &Path,
        volume: f32,
        events: PipelineEvents,
    ) -> Result<Box<dyn Pipeline>, EngineError> {
        let sample = self.loader.load(path)?;
        let pipeline = install(&self.output.mixer, sample, volume, events);
        debug!(path = ?path, "Pipeline pre-rolled");
        Ok(pipeline)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.host_id.name())
    }
}

/// A slot in the cpal engine's mixer.
struct CpalPipeline {
    slot: Arc<Slot>,
    mixer: Arc<Mixer>,
}

impl Pipeline for CpalPipeline {
    fn seek(&mut self, rate: f64) -> Result<u64, EngineError> {
        self.slot.seek(rate).ok_or_else(|| {
            EngineError::OperationFailure("seek on a stopped pipeline".to_string())
        })
    }

    fn set_gain(&self, gain: f32) {
        self.slot.set_gain(gain);
    }

    fn set_state(&mut self, state: PipelineState) -> Result<StateChange, EngineError> {
        let transport = match state {
            PipelineState::Playing => Transport::Playing,
            PipelineState::Paused => Transport::Paused,
            PipelineState::Stopped => {
                self.slot.request_stop();
                return Ok(StateChange::Async);
            }
        };

        if !self.slot.set_transport(transport) {
            return Err(EngineError::OperationFailure(format!(
                "{:?} requested on a stopped pipeline",
                state
            )));
        }
        Ok(StateChange::Success)
    }

    fn wait_for_state(&self, timeout: Duration) -> StateChange {
        if self.slot.stopped().wait(timeout) {
            StateChange::Success
        } else {
            warn!(slot = self.slot.id(), "Pipeline did not acknowledge stop");
            StateChange::Async
        }
    }
}

impl Drop for CpalPipeline {
    fn drop(&mut self) {
        self.mixer.remove(self.slot.id());
    }
}
