use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

pub const DEFAULT_TEMPO: f32 = 120.0;
pub const DEFAULT_STEPS_PER_BAR: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub beat_amount: u32,
    pub beat_unit: u32,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            beat_amount: 4,
            beat_unit: 4,
        }
    }
}

impl TimeSignature {
    /// Length of a bar expressed in quarter notes.
    pub fn quarters_per_bar(&self) -> f64 {
        self.beat_amount as f64 * 4.0 / self.beat_unit.max(1) as f64
    }
}

/// A step boundary crossed while rendering a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    pub step: u32,
    /// Offset of the boundary within the rendered buffer, in frames.
    pub buffer_offset: usize,
}

/// Time base shared by the controller and the native layer.
#[derive(Debug, Clone)]
pub struct Sequencer {
    sample_rate: u32,
    tempo: f32,
    time_signature: TimeSignature,
    steps_per_bar: u32,
    loop_start: usize,
    loop_end: usize,
    position: usize,
    playing: bool,
    marker: Option<u32>,
    volume: f32,
}

impl Sequencer {
    /// Creates a stopped sequencer at 120 BPM in 4/4 looping a single bar.
    pub fn new(sample_rate: u32) -> Self {
        let mut sequencer = Self {
            sample_rate,
            tempo: DEFAULT_TEMPO,
            time_signature: TimeSignature::default(),
            steps_per_bar: DEFAULT_STEPS_PER_BAR,
            loop_start: 0,
            loop_end: 0,
            position: 0,
            playing: false,
            marker: None,
            volume: 1.0,
        };
        sequencer.reset_loop_range();
        sequencer
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }

    /// Changes tempo and time signature. The loop range is reset to the
    /// first bar at the new tempo.
    pub fn set_tempo(&mut self, tempo: f32, time_signature: TimeSignature) {
        self.tempo = tempo.max(1.0);
        self.time_signature = time_signature;
        self.reset_loop_range();
    }

    pub fn samples_per_beat(&self) -> usize {
        ((self.sample_rate as f64 * 60.0) / self.tempo as f64).round() as usize
    }

    pub fn samples_per_bar(&self) -> usize {
        (self.samples_per_beat() as f64 * self.time_signature.quarters_per_bar()).round() as usize
    }

    pub fn samples_per_step(&self) -> usize {
        (self.samples_per_bar() / self.steps_per_bar.max(1) as usize).max(1)
    }

    pub fn loop_range(&self) -> (usize, usize) {
        (self.loop_start, self.loop_end)
    }

    /// Sets the inclusive loop range in samples, rewinding the playhead into
    /// it when necessary.
    pub fn set_loop_range(&mut self, start: usize, end: usize) {
        self.loop_start = start.min(end);
        self.loop_end = end.max(start);
        if self.position < self.loop_start || self.position > self.loop_end {
            self.position = self.loop_start;
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn step_position(&self) -> u32 {
        (self.position / self.samples_per_step()) as u32
    }

    pub fn marker(&self) -> Option<u32> {
        self.marker
    }

    pub fn set_marker(&mut self, step: Option<u32>) {
        self.marker = step;
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn rewind(&mut self) {
        self.position = self.loop_start;
    }

    /// Moves the playhead forward by `frames` and returns every step boundary
    /// crossed on the way. A stopped sequencer does not move.
    pub fn advance(&mut self, frames: usize) -> Vec<StepEvent> {
        let mut events = Vec::new();
        if !self.playing {
            return events;
        }

        let samples_per_step = self.samples_per_step();
        for offset in 0..frames {
            if self.position % samples_per_step == 0 {
                events.push(StepEvent {
                    step: (self.position / samples_per_step) as u32,
                    buffer_offset: offset,
                });
            }
            self.position += 1;
            if self.position > self.loop_end {
                self.position = self.loop_start;
            }
        }
        events
    }

    fn reset_loop_range(&mut self) {
        let end = self.samples_per_bar().saturating_sub(1);
        self.set_loop_range(0, end);
    }
}

/// Thread-safe view over the [`Sequencer`] shared with the native layer.
#[derive(Clone)]
pub struct SequencerHandle {
    shared: Arc<Mutex<Sequencer>>,
}

impl SequencerHandle {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Sequencer::new(sample_rate))),
        }
    }

    pub fn is_playing(&self) -> Result<bool> {
        Ok(self.lock()?.is_playing())
    }

    pub fn set_playing(&self, playing: bool) -> Result<()> {
        self.lock()?.set_playing(playing);
        Ok(())
    }

    pub fn tempo(&self) -> Result<f32> {
        Ok(self.lock()?.tempo())
    }

    pub fn set_tempo(&self, tempo: f32, time_signature: TimeSignature) -> Result<()> {
        self.lock()?.set_tempo(tempo, time_signature);
        Ok(())
    }

    pub fn step_position(&self) -> Result<u32> {
        Ok(self.lock()?.step_position())
    }

    pub fn set_marker(&self, step: Option<u32>) -> Result<()> {
        self.lock()?.set_marker(step);
        Ok(())
    }

    /// Runs `f` with exclusive access to the sequencer.
    pub fn with<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Sequencer) -> R,
    {
        let mut sequencer = self.lock()?;
        Ok(f(&mut sequencer))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Sequencer>> {
        self.shared
            .lock()
            .map_err(|_| EngineError::Poisoned("sequencer"))
    }
}

impl std::fmt::Debug for SequencerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerHandle").finish()
    }
}
