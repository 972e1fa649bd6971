//! Connection to the host audio subsystem.
//!
//! An [`AudioContext`] is the sink end of the playback graph plus the
//! hardware clock the transport measures time against. Production uses a
//! `cpal` output stream; the stream lives on its own thread so the rest of
//! the session can move freely between async tasks.

use cpal::{
    Device, Stream, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
};

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::graph::ChainSlot;

/// An open audio context rendering from a [`ChainSlot`].
pub trait AudioContext: Send {
    /// Hardware clock in seconds. Monotonic while the context is open.
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> f32;

    /// Make sure the output is running before a chain starts.
    fn resume(&mut self) -> Result<()>;

    /// Stop the output and release the device.
    fn close(&mut self);
}

/// Opens audio contexts on demand.
pub trait AudioHost: Send + Sync {
    fn open(&self, slot: ChainSlot) -> Result<Box<dyn AudioContext>>;
}

/// Plays through a `cpal` output device.
#[derive(Debug, Clone, Default)]
pub struct CpalHost {
    /// Substring of the output device name, default device when `None`
    pub device: Option<String>,
}

impl CpalHost {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

impl AudioHost for CpalHost {
    fn open(&self, slot: ChainSlot) -> Result<Box<dyn AudioContext>> {
        Ok(Box::new(CpalContext::open(self.device.clone(), slot)?))
    }
}

/// A live output stream and the clock derived from it.
pub struct CpalContext {
    frames: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    sample_rate: u32,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Debug for CpalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalContext")
            .field("sample_rate", &self.sample_rate)
            .field("frames", &self.frames)
            .field("failed", &self.failed)
            .finish()
    }
}

impl CpalContext {
    fn open(device_name: Option<String>, slot: ChainSlot) -> Result<Self> {
        let frames = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<u32, String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let frames_cb = Arc::clone(&frames);
        let failed_cb = Arc::clone(&failed);
        let thread = std::thread::Builder::new()
            .name("eq-audio".into())
            .spawn(move || {
                let built = build_stream(device_name.as_deref(), slot, frames_cb, failed_cb)
                    .and_then(|(stream, rate)| {
                        stream
                            .play()
                            .map_err(|e| Error::Playback(format!("cannot start output: {e}")))?;
                        Ok((stream, rate))
                    });
                let stream = match built {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                // Keep the stream alive until close (or the sender is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                info!("Stream stopped cleanly");
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| Error::Playback("audio thread exited during startup".into()))?
            .map_err(Error::Playback)?;

        Ok(Self {
            frames,
            failed,
            sample_rate,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

fn find_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| Error::Playback(e.to_string()))?
            .find(|d| d.name().map(|n| n.contains(name)).unwrap_or(false))
            .ok_or_else(|| Error::Playback(format!("{name} not found"))),
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Playback("default device not found".into())),
    }
}

fn build_stream(
    device_name: Option<&str>,
    slot: ChainSlot,
    frames: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
) -> Result<(Stream, u32)> {
    let device = find_output_device(device_name)?;
    let config: StreamConfig = device
        .default_output_config()
        .map_err(|e| Error::Playback(e.to_string()))?
        .into();
    let channels = usize::from(config.channels).max(1);
    let sample_rate = config.sample_rate.0;

    info!(
        device = device.name().unwrap_or_default(),
        sample_rate, channels, "Opening audio output"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Never block the audio thread; a contested slot plays silence
                match slot.try_lock() {
                    Ok(mut chain) => match chain.as_mut() {
                        Some(chain) => chain.render(data, channels),
                        None => data.fill(0.0),
                    },
                    Err(_) => data.fill(0.0),
                }
                frames.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
            },
            move |e| {
                error!("Output Error: {e}");
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| Error::Playback(format!("cannot build output stream: {e}")))?;

    Ok((stream, sample_rate))
}

impl AudioContext for CpalContext {
    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Relaxed) as f64 / f64::from(self.sample_rate)
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate as f32
    }

    fn resume(&mut self) -> Result<()> {
        let alive = self.thread.as_ref().is_some_and(|t| !t.is_finished());
        if !alive || self.failed.load(Ordering::Relaxed) {
            return Err(Error::Playback("audio output is not running".into()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!("audio thread panicked during close");
            }
        }
    }
}

impl Drop for CpalContext {
    fn drop(&mut self) {
        self.close();
    }
}
