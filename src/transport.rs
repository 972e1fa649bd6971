//! Play/pause/stop/seek state machine against the audio context's clock.
//!
//! `Idle -> Loading -> Idle -> { Playing <-> Paused } -> Idle`
//!
//! The playhead is never stored while playing. It is derived as
//! `clock_now - clock_start`, where `clock_start = clock_at_play - offset`.
//! Whenever playback stops moving (pause, seek, EQ rebuild) the derived
//! position is frozen into `pause_offset`.
//!
//! The transport also owns the EQ session (custom bands, last suggestion,
//! which of the two feeds the chain), because every EQ change that affects
//! the chain has to go through the same capture -> teardown -> rebuild ->
//! resume sequence as a seek.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::bands::BandCollection;
use crate::classifier::GenreSuggestion;
use crate::decode::AudioBuffer;
use crate::error::{Error, Result};
use crate::graph::PlaybackGraph;
use crate::host::{AudioContext, AudioHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    /// Waiting for a decode to finish
    Loading,
    Playing,
    Paused,
}

/// Which collection feeds the filter chain when EQ is enabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EqSource {
    #[default]
    Custom,
    Suggestion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub state: TransportState,
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub eq_enabled: bool,
    pub eq_source: EqSource,
}

impl PlaybackStatus {
    /// Progress bar position in percent
    pub fn progress(&self) -> f64 {
        if self.duration > 0.0 {
            self.current_time / self.duration * 100.0
        } else {
            0.0
        }
    }
}

/// Identifies one upload; only the newest ticket may complete a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket(u64);

/// `m:ss`
pub fn format_time(secs: f64) -> String {
    let secs = secs.max(0.0);
    let minutes = (secs / 60.0).floor() as u64;
    let seconds = (secs % 60.0).floor() as u64;
    format!("{minutes}:{seconds:02}")
}

pub struct Transport {
    host: Box<dyn AudioHost>,
    context: Option<Box<dyn AudioContext>>,
    graph: PlaybackGraph,
    buffer: Option<Arc<AudioBuffer>>,
    state: TransportState,
    duration: f64,
    pause_offset: f64,
    clock_start: f64,
    eq_enabled: bool,
    eq_source: EqSource,
    custom: BandCollection,
    suggestion: Option<GenreSuggestion>,
    load_generation: u64,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state)
            .field("duration", &self.duration)
            .field("pause_offset", &self.pause_offset)
            .field("clock_start", &self.clock_start)
            .field("eq_enabled", &self.eq_enabled)
            .field("eq_source", &self.eq_source)
            .field("context_open", &self.context.is_some())
            .finish()
    }
}

impl Transport {
    pub fn new(host: Box<dyn AudioHost>, output_gain_db: f32) -> Self {
        Self {
            host,
            context: None,
            graph: PlaybackGraph::new(output_gain_db),
            buffer: None,
            state: TransportState::Idle,
            duration: 0.0,
            pause_offset: 0.0,
            clock_start: 0.0,
            eq_enabled: false,
            eq_source: EqSource::Custom,
            custom: BandCollection::default(),
            suggestion: None,
            load_generation: 0,
        }
    }

    /// The audio context, opened on first use.
    fn context(&mut self) -> Result<&mut Box<dyn AudioContext>> {
        let context = match self.context.take() {
            Some(context) => context,
            None => {
                let context = self.host.open(self.graph.slot())?;
                info!(sample_rate = context.sample_rate(), "Audio context opened");
                context
            }
        };
        Ok(self.context.insert(context))
    }

    fn now(&self) -> f64 {
        self.context.as_ref().map_or(0.0, |c| c.current_time())
    }

    fn elapsed(&self) -> f64 {
        (self.now() - self.clock_start).clamp(0.0, self.duration)
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    #[cfg(test)]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.buffer.is_some()
    }

    /// Derived playhead: live while playing, frozen otherwise.
    pub fn current_time(&self) -> f64 {
        match self.state {
            TransportState::Playing => self.elapsed(),
            _ => self.pause_offset,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            is_playing: self.state == TransportState::Playing,
            current_time: self.current_time(),
            duration: self.duration,
            eq_enabled: self.eq_enabled,
            eq_source: self.eq_source,
        }
    }

    /// Stop playback and wait for a new buffer.
    pub fn begin_load(&mut self) -> LoadTicket {
        self.graph.teardown();
        self.state = TransportState::Loading;
        self.pause_offset = 0.0;
        self.load_generation += 1;
        debug!(generation = self.load_generation, "Loading file");
        LoadTicket(self.load_generation)
    }

    /// Apply a finished decode. Buffer and duration change together or not
    /// at all; a failed decode leaves nothing loaded.
    pub fn finish_load(&mut self, ticket: LoadTicket, decoded: Result<AudioBuffer>) -> Result<()> {
        if ticket.0 != self.load_generation {
            debug!(ticket = ticket.0, current = self.load_generation, "stale load ignored");
            return Err(Error::Processing("Upload superseded by a newer file.".into()));
        }

        match decoded {
            Ok(buffer) => {
                self.duration = buffer.duration_secs();
                self.buffer = Some(Arc::new(buffer));
                self.state = TransportState::Idle;
                info!(duration = self.duration, "Audio ready");
                Ok(())
            }
            Err(e) => {
                error!(%e, "Error decoding audio file");
                self.buffer = None;
                self.duration = 0.0;
                self.state = TransportState::Idle;
                Err(e)
            }
        }
    }

    pub fn play(&mut self) -> Result<()> {
        match self.state {
            TransportState::Loading => {
                return Err(Error::Playback("Audio is still decoding.".into()));
            }
            TransportState::Playing => return Ok(()),
            TransportState::Idle | TransportState::Paused => {}
        }
        let buffer = self
            .buffer
            .clone()
            .ok_or_else(|| Error::Playback("No audio loaded.".into()))?;
        self.start(buffer)
    }

    /// Build and start a fresh graph at `pause_offset`. Any failure leaves
    /// the transport idle with no graph.
    fn start(&mut self, buffer: Arc<AudioBuffer>) -> Result<()> {
        if self.pause_offset >= self.duration {
            self.pause_offset = 0.0;
        }
        debug!(offset = self.pause_offset, "Starting playback");

        let result = self.try_start(buffer);
        if let Err(e) = &result {
            error!(%e, "Error playing audio");
            self.graph.teardown();
            self.state = TransportState::Idle;
        }
        result
    }

    fn try_start(&mut self, buffer: Arc<AudioBuffer>) -> Result<()> {
        let (now, sample_rate) = {
            let context = self.context()?;
            context.resume()?;
            (context.current_time(), context.sample_rate())
        };

        let offset = self.pause_offset;
        let bands = self.eq_enabled.then(|| self.active_bands().clone());
        self.graph.build(buffer, bands.as_ref(), sample_rate)?;
        self.graph.start(offset)?;

        self.clock_start = now - offset;
        self.state = TransportState::Playing;
        info!(
            offset,
            filters = self.graph.filter_count().unwrap_or(0),
            "Playback started"
        );
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state != TransportState::Playing {
            return;
        }
        self.pause_offset = self.elapsed();
        self.graph.teardown();
        self.state = TransportState::Paused;
        info!(at = self.pause_offset, "Paused");
    }

    pub fn stop(&mut self) {
        self.graph.teardown();
        if self.state != TransportState::Loading {
            self.state = TransportState::Idle;
        }
        self.pause_offset = 0.0;
        info!("Stopped");
    }

    /// Move the playhead, clamped to `[0, duration]`. Restarts the graph at
    /// the new offset if it was playing. Returns the new position.
    pub fn seek(&mut self, time: f64) -> Result<f64> {
        if !time.is_finite() {
            return Err(Error::Validation(format!("invalid seek time: {time}")));
        }
        let target = time.clamp(0.0, self.duration);
        debug!(requested = time, target, "Seeking");

        if self.state != TransportState::Playing {
            self.pause_offset = target;
            return Ok(target);
        }

        self.graph.teardown();
        if target >= self.duration {
            self.finish();
            return Ok(self.duration);
        }
        self.pause_offset = target;
        self.restart()?;
        Ok(target)
    }

    /// Seek to a fraction of the duration (progress bar).
    pub fn seek_fraction(&mut self, fraction: f64) -> Result<f64> {
        if !fraction.is_finite() {
            return Err(Error::Validation(format!("invalid position: {fraction}")));
        }
        self.seek(fraction.clamp(0.0, 1.0) * self.duration)
    }

    fn restart(&mut self) -> Result<()> {
        let buffer = self
            .buffer
            .clone()
            .ok_or_else(|| Error::Playback("No audio loaded.".into()))?;
        self.start(buffer)
    }

    fn finish(&mut self) {
        self.graph.teardown();
        self.state = TransportState::Idle;
        self.pause_offset = 0.0;
        info!("Playback finished");
    }

    /// One display-refresh step. Detects the end of the track (clock past
    /// the duration or the source drained); the returned status shows the
    /// final position before the reset to 0.
    pub fn tick(&mut self) -> PlaybackStatus {
        let playing = self.state == TransportState::Playing;
        if playing && (self.elapsed() >= self.duration || self.graph.source_ended()) {
            self.finish();
            return PlaybackStatus {
                current_time: self.duration,
                ..self.status()
            };
        }
        self.status()
    }

    /// Apply `change` to the session. While playing, the position is
    /// captured first and the graph rebuilt afterwards.
    fn rebuild_with(&mut self, change: impl FnOnce(&mut Self)) -> Result<()> {
        if self.state != TransportState::Playing {
            change(self);
            return Ok(());
        }

        self.pause_offset = self.elapsed();
        self.graph.teardown();
        change(self);
        self.restart()
    }

    pub fn eq_enabled(&self) -> bool {
        self.eq_enabled
    }

    pub fn set_eq_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.eq_enabled {
            return Ok(());
        }
        info!(enabled, "Toggling EQ");
        self.rebuild_with(|t| t.eq_enabled = enabled)
    }

    pub fn eq_source(&self) -> EqSource {
        self.eq_source
    }

    pub fn select_source(&mut self, source: EqSource) -> Result<()> {
        if source == self.eq_source {
            return Ok(());
        }
        if self.eq_enabled {
            self.rebuild_with(|t| t.eq_source = source)
        } else {
            self.eq_source = source;
            Ok(())
        }
    }

    fn uses_custom(&self) -> bool {
        self.eq_source == EqSource::Custom || self.suggestion.is_none()
    }

    /// The collection the chain is built from when EQ is enabled.
    pub fn active_bands(&self) -> &BandCollection {
        match (&self.suggestion, self.eq_source) {
            (Some(suggestion), EqSource::Suggestion) => &suggestion.bands,
            _ => &self.custom,
        }
    }

    pub fn custom_bands(&self) -> &BandCollection {
        &self.custom
    }

    pub fn suggestion(&self) -> Option<&GenreSuggestion> {
        self.suggestion.as_ref()
    }

    /// Store a new suggestion. If it is what the chain should be playing
    /// right now, the chain is rebuilt from it.
    pub fn set_suggestion(&mut self, suggestion: GenreSuggestion) -> Result<()> {
        debug!(genre = %suggestion.genre, "Storing suggestion");
        if self.eq_enabled && self.eq_source == EqSource::Suggestion {
            self.rebuild_with(|t| t.suggestion = Some(suggestion))
        } else {
            self.suggestion = Some(suggestion);
            Ok(())
        }
    }

    /// Edit one custom band. The live filter follows immediately when the
    /// custom bands are what is playing.
    pub fn update_band(&mut self, index: usize, gain_db: f64) -> Result<f64> {
        let gain = self.custom.set_gain(index, gain_db)?;
        if self.eq_enabled && self.uses_custom() {
            self.graph.set_band_gain(index, gain)?;
        }
        Ok(gain)
    }

    /// Copy the suggestion into the custom bands and switch EQ on.
    pub fn apply_suggestion(&mut self) -> Result<()> {
        let bands = self
            .suggestion
            .as_ref()
            .map(|s| s.bands.clone())
            .ok_or_else(|| Error::Validation("No EQ suggestion to apply.".into()))?;
        info!("Applying suggestion");
        self.rebuild_with(|t| {
            t.custom = bands;
            t.eq_source = EqSource::Custom;
            t.eq_enabled = true;
        })
    }

    /// Back to the flat ten-band layout with EQ off.
    pub fn reset_eq(&mut self) -> Result<()> {
        info!("EQ Reset to Flat.");
        self.rebuild_with(|t| {
            t.custom = BandCollection::default();
            t.eq_source = EqSource::Custom;
            t.eq_enabled = false;
        })
    }

    /// Tear down the graph and release the audio context. The next `play`
    /// opens a new one.
    pub fn close(&mut self) {
        self.pause();
        self.graph.teardown();
        if let Some(mut context) = self.context.take() {
            context.close();
            info!("Audio context closed");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
