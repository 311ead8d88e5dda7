//! Frame loop driving the engine
//!
//! Decoding video is left to the caller, which supplies grayscale frames
//! through a [`FrameSource`]. The [`Runner`] checks for configuration changes
//! between frames, evaluates every frame, and restarts the triggers when a
//! looping source wraps around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::GrayImage;

use crate::engine::{Engine, TriggerEvent};
use crate::error::Result;

/// Supplier of grayscale frames
pub trait FrameSource {
    /// Next frame, or `None` at the end of the stream
    fn next_frame(&mut self) -> Result<Option<GrayImage>>;

    /// Seek back to the first frame
    fn restart(&mut self) -> Result<()>;

    /// Whether the runner should restart the source when it ends
    fn is_looping(&self) -> bool {
        false
    }
}

/// Frames held in memory
#[derive(Debug, Clone, Default)]
pub struct FrameSequence {
    frames: Vec<GrayImage>,
    position: usize,
    looping: bool,
}

impl FrameSequence {
    pub fn new(frames: Vec<GrayImage>) -> Self {
        Self {
            frames,
            position: 0,
            looping: false,
        }
    }

    /// Play the sequence again from the start when it ends
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for FrameSequence {
    fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        let frame = self.frames.get(self.position).cloned();
        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }

    fn restart(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn is_looping(&self) -> bool {
        self.looping
    }
}

/// Counters collected while running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub events: u64,
    pub reloads: u64,
    pub restarts: u64,
}

/// Drives an [`Engine`] from a [`FrameSource`]
pub struct Runner {
    engine: Engine,
    running: Arc<AtomicBool>,
    /// Frames between configuration change checks
    reload_interval: u64,
    /// How often frame statistics are logged
    stats_interval: Duration,
}

impl Runner {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            running: Arc::new(AtomicBool::new(false)),
            reload_interval: 1,
            stats_interval: Duration::from_secs(5),
        }
    }

    /// Check for configuration changes every `frames` frames
    pub fn with_reload_interval(mut self, frames: u64) -> Self {
        self.reload_interval = frames.max(1);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn into_engine(self) -> Engine {
        self.engine
    }

    /// Flag that stops [`Self::run`] after the current frame when cleared
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Seek the source back to its start and reset every trigger
    pub fn restart(&mut self, source: &mut dyn FrameSource) -> Result<Vec<TriggerEvent>> {
        source.restart()?;
        Ok(self.engine.reset())
    }

    /// Process frames until the source ends or the stop handle is cleared.
    ///
    /// Every message the engine sends is also passed to `on_event`. All notes
    /// are released and outputs closed before returning.
    pub fn run<F>(&mut self, source: &mut dyn FrameSource, mut on_event: F) -> Result<RunStats>
    where
        F: FnMut(&TriggerEvent),
    {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_loop(source, &mut on_event);
        self.running.store(false, Ordering::SeqCst);

        for event in self.engine.shutdown() {
            on_event(&event);
        }
        result
    }

    fn run_loop(
        &mut self,
        source: &mut dyn FrameSource,
        on_event: &mut dyn FnMut(&TriggerEvent),
    ) -> Result<RunStats> {
        let mut stats = RunStats::default();
        let mut frames_since_restart: u64 = 0;
        let mut last_log = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            if stats.frames % self.reload_interval == 0 && self.engine.maybe_reload() {
                stats.reloads += 1;
            }

            let Some(frame) = source.next_frame()? else {
                if !source.is_looping() || frames_since_restart == 0 {
                    log::info!("Frame source ended after {} frames", stats.frames);
                    break;
                }
                log::info!("Frame source ended, restarting");
                for event in self.restart(source)? {
                    on_event(&event);
                }
                stats.restarts += 1;
                frames_since_restart = 0;
                continue;
            };

            let events = self.engine.evaluate_frame(&frame, Instant::now())?;
            stats.frames += 1;
            frames_since_restart += 1;
            stats.events += events.len() as u64;
            for event in &events {
                on_event(event);
            }

            if last_log.elapsed() >= self.stats_interval {
                log::info!(
                    "{} frames processed ({}x{}), {} messages sent",
                    stats.frames,
                    frame.width(),
                    frame.height(),
                    stats.events
                );
                last_log = Instant::now();
            }
        }

        Ok(stats)
    }
}
