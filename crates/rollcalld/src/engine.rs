//! The detection loop.
//!
//! Runs on its own OS thread. Each cycle it applies pending gallery
//! removals, reads the newest frame, detects and identifies faces, and folds
//! the observations into the stabilizer. It is the only writer of tracked
//! faces while the pipeline runs.

use crate::pipeline::lock;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::GrayImage;
use rollcall_core::{Detector, DetectorError, Gallery, Observation, Preprocessor, Stabilizer};
use rollcall_hw::FrameSource;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Shutdown was requested or the frame source was taken away.
    Stopped,
    /// Unrecoverable failure, with a description for `last_error`.
    Fault(String),
}

enum Cycle {
    /// A new frame was processed.
    Processed { faces: usize },
    /// No new frame since the last cycle.
    Idle,
    /// The frame source is gone.
    SourceGone,
}

pub(crate) struct DetectionLoop {
    source: Arc<Mutex<Option<FrameSource>>>,
    detector: Arc<Mutex<Detector>>,
    preprocessor: Preprocessor,
    gallery: Arc<Gallery>,
    stabilizer: Arc<Mutex<Stabilizer>>,
    forget_rx: Receiver<String>,
    cycle: Duration,
    max_consecutive_errors: u32,
    last_sequence: Option<u32>,
}

impl DetectionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<Mutex<Option<FrameSource>>>,
        detector: Arc<Mutex<Detector>>,
        preprocessor: Preprocessor,
        gallery: Arc<Gallery>,
        stabilizer: Arc<Mutex<Stabilizer>>,
        forget_rx: Receiver<String>,
        cycle: Duration,
        max_consecutive_errors: u32,
    ) -> Self {
        Self {
            source,
            detector,
            preprocessor,
            gallery,
            stabilizer,
            forget_rx,
            cycle,
            max_consecutive_errors: max_consecutive_errors.max(1),
            last_sequence: None,
        }
    }

    /// Run until `stop_rx` fires or disconnects, or a fault occurs.
    pub fn run(mut self, stop_rx: &Receiver<()>) -> LoopExit {
        tracing::info!(cycle_ms = self.cycle.as_millis() as u64, "detection loop started");
        let mut consecutive_errors = 0u32;

        let exit = loop {
            let started = Instant::now();

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_cycle()));
            match outcome {
                Ok(Ok(Cycle::Processed { faces })) => {
                    consecutive_errors = 0;
                    tracing::trace!(faces, elapsed_ms = started.elapsed().as_millis() as u64, "cycle complete");
                }
                Ok(Ok(Cycle::Idle)) => {}
                Ok(Ok(Cycle::SourceGone)) => break LoopExit::Stopped,
                Ok(Err(CycleError::Source(reason))) => break LoopExit::Fault(reason),
                Ok(Err(CycleError::Detector(e))) => {
                    consecutive_errors += 1;
                    tracing::warn!(error = %e, consecutive_errors, "detection cycle failed");
                    if consecutive_errors >= self.max_consecutive_errors {
                        break LoopExit::Fault(format!(
                            "detection failed {consecutive_errors} consecutive cycles: {e}"
                        ));
                    }
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(panic = %message, "detection cycle panicked");
                    break LoopExit::Fault(format!("detection loop panicked: {message}"));
                }
            }

            let remaining = self.cycle.saturating_sub(started.elapsed());
            match stop_rx.recv_timeout(remaining) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break LoopExit::Stopped,
            }
        };

        match &exit {
            LoopExit::Stopped => tracing::info!("detection loop stopped"),
            LoopExit::Fault(reason) => tracing::error!(reason = %reason, "detection loop faulted"),
        }
        exit
    }

    fn run_cycle(&mut self) -> Result<Cycle, CycleError> {
        let now = Instant::now();

        let forgotten: Vec<String> = self.forget_rx.try_iter().collect();
        if !forgotten.is_empty() {
            let mut stabilizer = lock(&self.stabilizer);
            for id in &forgotten {
                let dropped = stabilizer.forget(id);
                tracing::debug!(id = %id, dropped, "removed identity cleared from live view");
            }
        }

        let frame = {
            let source = lock(&self.source);
            let Some(source) = source.as_ref() else {
                return Ok(Cycle::SourceGone);
            };
            if let Some(fault) = source.fault() {
                return Err(CycleError::Source(fault.to_string()));
            }
            if !source.is_running() {
                return Err(CycleError::Source("frame source stopped unexpectedly".into()));
            }
            source.latest_frame()
        };

        let frame = match frame {
            Some(f) if self.last_sequence != Some(f.sequence) => f,
            _ => {
                lock(&self.stabilizer).evict(now);
                return Ok(Cycle::Idle);
            }
        };
        self.last_sequence = Some(frame.sequence);

        if frame.is_dark {
            tracing::trace!(sequence = frame.sequence, "skipping dark frame");
            lock(&self.stabilizer).evict(now);
            return Ok(Cycle::Processed { faces: 0 });
        }

        let timestamp = frame.timestamp;
        let image = GrayImage::from_raw(frame.width, frame.height, frame.data).ok_or_else(|| {
            CycleError::Detector(DetectorError::InferenceFailed("frame buffer does not match its size".into()))
        })?;

        let regions = lock(&self.detector).detect(&image).map_err(CycleError::Detector)?;

        let observations: Vec<Observation> = regions
            .into_iter()
            .map(|region| {
                let identity = self
                    .preprocessor
                    .normalize(&image, &region)
                    .and_then(|input| self.gallery.identify(&input));
                Observation { region, identity, timestamp }
            })
            .collect();
        let faces = observations.len();

        let mut stabilizer = lock(&self.stabilizer);
        stabilizer.update(observations, now);
        stabilizer.evict(now);

        Ok(Cycle::Processed { faces })
    }
}

enum CycleError {
    Source(String),
    Detector(DetectorError),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
