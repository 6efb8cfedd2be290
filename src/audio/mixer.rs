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
// Slot mixing logic shared by the cpal engine's processing thread and tests
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use super::{BusMessage, PipelineEvents};
use crate::playsync::Transition;
use crate::samples::LoadedSample;

/// Global atomic counter for generating unique slot IDs
static SLOT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Transport state of a slot as seen by the processing thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Paused,
    Playing,
    Stopped,
}

struct SlotState {
    transport: Transport,
    /// Read position in source frames.
    position: f64,
    /// Source frames consumed per output frame.
    rate: f64,
    /// Set when a stop has been requested but not yet acknowledged.
    stop_requested: bool,
    /// Bumped by every seek.
    generation: u64,
}

/// A prepared sample installed in the mixer.
pub struct Slot {
    id: u64,
    sample: LoadedSample,
    state: Mutex<SlotState>,
    /// f32 bits.
    gain: AtomicU32,
    stopped: Transition,
    events: PipelineEvents,
}

impl Slot {
    /// Creates a paused slot at position zero.
    pub fn new(sample: LoadedSample, gain: f32, events: PipelineEvents) -> Slot {
        Slot {
            id: SLOT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            sample,
            state: Mutex::new(SlotState {
                transport: Transport::Paused,
                position: 0.0,
                rate: 1.0,
                stop_requested: false,
                generation: 0,
            }),
            gain: AtomicU32::new(gain.to_bits()),
            stopped: Transition::new(),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.state.lock().transport
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Rewinds to the start at the given rate and returns the new generation, or `None` if
    /// the slot is stopped.
    pub fn seek(&self, rate: f64) -> Option<u64> {
        let mut state = self.state.lock();
        if state.transport == Transport::Stopped || state.stop_requested {
            return None;
        }
        state.position = 0.0;
        state.rate = rate;
        state.generation += 1;
        Some(state.generation)
    }

    /// Switches between playing and paused. Returns false if the slot is stopped.
    pub fn set_transport(&self, transport: Transport) -> bool {
        let mut state = self.state.lock();
        if state.transport == Transport::Stopped || state.stop_requested {
            return false;
        }
        state.transport = transport;
        true
    }

    /// Asks the processing thread to stop this slot. Completion is observed through
    /// [`Slot::stopped`].
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        if state.transport == Transport::Stopped {
            return;
        }
        self.stopped.begin();
        state.stop_requested = true;
    }

    pub fn stopped(&self) -> &Transition {
        &self.stopped
    }

    /// Delivers a bus message to this slot's handler.
    pub fn dispatch(&self, message: BusMessage) {
        (self.events.on_message)(message);
    }

    /// Renders one block of this slot into `voice` (interleaved, output channel layout,
    /// pre-gain). Returns the number of frames rendered and, if the end of the sample was
    /// reached, the generation that ended.
    fn render(
        &self,
        voice: &mut Vec<f32>,
        out_channels: usize,
        frames: usize,
    ) -> (usize, Option<u64>) {
        let mut state = self.state.lock();
        if state.stop_requested {
            state.stop_requested = false;
            state.transport = Transport::Stopped;
            self.stopped.complete();
            return (0, None);
        }
        if state.transport != Transport::Playing {
            return (0, None);
        }

        voice.clear();
        voice.resize(frames * out_channels, 0.0);

        let data = self.sample.data();
        let channels = self.sample.channel_count().max(1) as usize;
        let total_frames = data.len() / channels;

        let mut rendered = 0;
        let mut ended = false;
        for frame in 0..frames {
            let index = state.position as usize;
            if index >= total_frames {
                ended = true;
                break;
            }
            let frac = (state.position - index as f64) as f32;
            let next = (index + 1).min(total_frames - 1);

            for out_channel in 0..out_channels {
                let source_channel = out_channel % channels;
                let s0 = data[index * channels + source_channel];
                let s1 = data[next * channels + source_channel];
                voice[frame * out_channels + out_channel] = s0 + (s1 - s0) * frac;
            }

            state.position += state.rate;
            rendered += 1;
        }

        if ended || state.position as usize >= total_frames {
            // Hold at the end until the bus handler rewinds or a seek restarts it.
            state.transport = Transport::Paused;
            ended = true;
        }

        voice.truncate(rendered * out_channels);
        (rendered, ended.then_some(state.generation))
    }
}

/// Mixes every playing slot into an interleaved output block.
pub struct Mixer {
    slots: RwLock<Vec<Arc<Slot>>>,
    num_channels: u16,
    sample_rate: u32,
    bus: Sender<(u64, BusMessage)>,
}

impl Mixer {
    /// Creates a new mixer. End-of-stream notifications are sent to the bus channel.
    pub fn new(num_channels: u16, sample_rate: u32, bus: Sender<(u64, BusMessage)>) -> Mixer {
        Mixer {
            slots: RwLock::new(Vec::new()),
            num_channels,
            sample_rate,
            bus,
        }
    }

    pub fn num_channels(&self) -> u16 {
        self.num_channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn add(&self, slot: Arc<Slot>) {
        self.slots.write().push(slot);
    }

    pub fn remove(&self, id: u64) {
        self.slots.write().retain(|slot| slot.id != id);
    }

    pub fn get(&self, id: u64) -> Option<Arc<Slot>> {
        self.slots.read().iter().find(|slot| slot.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders `frames` frames into `output`. `active` and `voice` are scratch buffers owned
    /// by the caller so the processing loop does not allocate once warmed up.
    pub fn render(
        &self,
        output: &mut [f32],
        frames: usize,
        active: &mut Vec<Arc<Slot>>,
        voice: &mut Vec<f32>,
    ) {
        let out_channels = self.num_channels as usize;
        output.fill(0.0);

        active.clear();
        active.extend(self.slots.read().iter().cloned());

        for slot in active.iter() {
            let (rendered, ended) = slot.render(voice, out_channels, frames);
            if rendered > 0 {
                let gain = slot.gain();
                for (out, sample) in output.iter_mut().zip(voice.iter()) {
                    *out += sample * gain;
                }
                (slot.events.on_buffer)(voice);
            }
            if let Some(generation) = ended {
                let message = BusMessage::EndOfStream(generation);
                if let Err(e) = self.bus.try_send((slot.id, message)) {
                    warn!(slot = slot.id, err = %e, "Unable to post end of stream");
                }
            }
        }
        active.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn sample(data: Vec<f32>, channels: u16) -> LoadedSample {
        LoadedSample::new(data, channels, 44100)
    }

    fn mixer() -> (Mixer, crossbeam_channel::Receiver<(u64, BusMessage)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Mixer::new(2, 44100, tx), rx)
    }

    fn render(mixer: &Mixer, frames: usize) -> Vec<f32> {
        let mut output = vec![0.0; frames * mixer.num_channels() as usize];
        mixer.render(&mut output, frames, &mut Vec::new(), &mut Vec::new());
        output
    }

    #[test]
    fn test_paused_slot_is_silent() {
        let (mixer, _rx) = mixer();
        mixer.add(Arc::new(Slot::new(
            sample(vec![0.5; 8], 1),
            1.0,
            PipelineEvents::ignore(),
        )));

        assert!(render(&mixer, 4).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_mono_fans_out_with_gain() {
        let (mixer, _rx) = mixer();
        let slot = Arc::new(Slot::new(
            sample(vec![0.5, 0.25, 1.0, 1.0], 1),
            0.5,
            PipelineEvents::ignore(),
        ));
        mixer.add(slot.clone());
        assert!(slot.set_transport(Transport::Playing));

        let output = render(&mixer, 2);
        assert_eq!(output, vec![0.25, 0.25, 0.125, 0.125]);

        slot.set_gain(1.0);
        let output = render(&mixer, 2);
        assert_eq!(output, vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_double_rate_skips_frames() {
        let (mixer, _rx) = mixer();
        let slot = Arc::new(Slot::new(
            sample(vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7], 1),
            1.0,
            PipelineEvents::ignore(),
        ));
        mixer.add(slot.clone());
        assert_eq!(slot.seek(2.0), Some(1));
        assert!(slot.set_transport(Transport::Playing));

        let output = render(&mixer, 3);
        let left: Vec<f32> = output.iter().step_by(2).copied().collect();
        assert_eq!(left, vec![0.0, 0.2, 0.4]);
    }

    #[test]
    fn test_end_of_stream_pauses_and_posts() {
        let (mixer, rx) = mixer();
        let slot = Arc::new(Slot::new(
            sample(vec![0.5; 4], 1),
            1.0,
            PipelineEvents::ignore(),
        ));
        mixer.add(slot.clone());
        slot.set_transport(Transport::Playing);

        render(&mixer, 16);
        assert_eq!(slot.transport(), Transport::Paused);
        assert_eq!(
            rx.try_recv().unwrap(),
            (slot.id(), BusMessage::EndOfStream(0))
        );

        // A seek after the end restarts under a new generation.
        assert_eq!(slot.seek(1.0), Some(1));
        assert!(slot.set_transport(Transport::Playing));
        assert_eq!(render(&mixer, 2), vec![0.5; 4]);
        render(&mixer, 16);
        assert_eq!(
            rx.try_recv().unwrap(),
            (slot.id(), BusMessage::EndOfStream(1))
        );
    }

    #[test]
    fn test_buffer_handler_sees_pre_gain_block() {
        let (mixer, _rx) = mixer();
        let calls = Arc::new(AtomicUsize::new(0));
        let events = {
            let calls = calls.clone();
            PipelineEvents {
                on_buffer: Box::new(move |block| {
                    assert!(block.iter().all(|s| *s == 0.8));
                    calls.fetch_add(1, Ordering::Relaxed);
                }),
                on_message: Box::new(|_| {}),
            }
        };
        let slot = Arc::new(Slot::new(sample(vec![0.8; 64], 1), 0.1, events));
        mixer.add(slot.clone());
        slot.set_transport(Transport::Playing);

        render(&mixer, 8);
        render(&mixer, 8);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_stop_is_acknowledged_by_render() {
        let (mixer, _rx) = mixer();
        let slot = Arc::new(Slot::new(
            sample(vec![0.5; 64], 1),
            1.0,
            PipelineEvents::ignore(),
        ));
        mixer.add(slot.clone());
        slot.set_transport(Transport::Playing);

        slot.request_stop();
        assert!(slot.stopped().is_pending());
        assert_eq!(slot.seek(1.0), None);

        let output = render(&mixer, 8);
        assert!(output.iter().all(|s| *s == 0.0));
        assert_eq!(slot.transport(), Transport::Stopped);
        assert!(!slot.stopped().is_pending());
        assert!(!slot.set_transport(Transport::Playing));
    }

    #[test]
    fn test_remove() {
        let (mixer, _rx) = mixer();
        let slot = Arc::new(Slot::new(
            sample(vec![0.5; 4], 1),
            1.0,
            PipelineEvents::ignore(),
        ));
        mixer.add(slot.clone());
        assert!(mixer.get(slot.id()).is_some());

        mixer.remove(slot.id());
        assert!(mixer.get(slot.id()).is_none());
        assert!(mixer.is_empty());
    }
}
