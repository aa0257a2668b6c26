//! Exposure state machine.
//!
//! A timed exposure is realised by summing one sensor frame per second of
//! requested duration. The controller never blocks: an external timer calls
//! [`ExposureController::tick`] and schedules the next call after the
//! returned delay. Each tick pulls at most what the pipe already holds.
//!
//! ```text
//! Idle --start_exposure--> Exposing --time up + target met--> Finalizing --> Idle
//!   ^                          |
//!   +------ abort / stream end-+
//! ```

use crate::accumulator::{Accumulator, AccumulatorError};
use crate::chip::{CcdChip, ChipError, FrameType};
use crate::roi::{self, Roi};
use chrono::{DateTime, Utc};
use picam_hw::{
    decode_into, CaptureError, CaptureStream, DecodeError, DecodedFrame, RawBlock, ReadStatus,
    SensorGeometry,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Remaining time below which the exposure counts as over.
const TIME_EPSILON: f64 = 0.001;

/// Below this much remaining time the controller polls at the deadline
/// instead of the regular interval.
const FINAL_POLL_WINDOW: f64 = 1.0;

#[derive(Error, Debug)]
pub enum ExposureError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("exposure already in progress")]
    Busy,
    #[error("invalid exposure duration {0}")]
    InvalidDuration(f64),
    #[error(transparent)]
    Chip(#[from] ChipError),
}

/// Why an exposure ended without an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    #[error("aborted by request")]
    Requested,
    #[error("capture stream ended")]
    StreamEnded,
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("no frames arrived before the overrun limit")]
    NoFrames,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureState {
    Idle,
    Exposing,
    Finalizing,
}

/// Tuning for the exposure loop.
#[derive(Debug, Clone, Copy)]
pub struct ExposureConfig {
    /// Shortest exposure; shorter requests are clamped up.
    pub min_duration: f64,
    /// Tick interval while the deadline is more than a second away.
    pub poll_interval: Duration,
    /// How long to wait past the deadline for missing frames before
    /// delivering what has been summed.
    pub overrun_limit: Duration,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            min_duration: 1.0,
            poll_interval: Duration::from_millis(1000),
            overrun_limit: Duration::from_secs(10),
        }
    }
}

/// Time source, injectable for tests.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cooperative abort flag, checked before every unit of work in a tick.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Parameters of the exposure in progress.
#[derive(Debug, Clone, Copy)]
pub struct ExposureRequest {
    /// Duration the client asked for.
    pub requested: f64,
    /// Duration after clamping.
    pub duration: f64,
    pub frame_type: FrameType,
    pub frame_target: u32,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

impl ExposureRequest {
    pub fn elapsed(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.started).as_secs_f64()
    }

    pub fn time_left(&self, now: Instant) -> f64 {
        (self.duration - self.elapsed(now)).max(0.0)
    }

    fn deadline(&self) -> Instant {
        self.started + Duration::from_secs_f64(self.duration)
    }
}

/// Image delivered at the end of an exposure.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedExposure {
    pub width: u32,
    pub height: u32,
    pub roi: Roi,
    pub bin_x: u32,
    pub bin_y: u32,
    pub frame_type: FrameType,
    /// Colour filter pattern, only on full unbinned frames.
    pub bayer: Option<String>,
    pub requested_duration: f64,
    pub duration: f64,
    pub frames_summed: u32,
    pub frame_target: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub pixels: Vec<u16>,
}

/// Receives the outcome of every exposure.
pub trait ExposureSink: Send {
    fn exposure_complete(&mut self, exposure: FinishedExposure);
    fn exposure_aborted(&mut self, reason: AbortReason);
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExposureStatus {
    pub state: ExposureState,
    pub frames_summed: u32,
    pub frame_target: u32,
    pub time_left: f64,
}

/// Drives one camera's exposures from periodic ticks.
pub struct ExposureController<S: CaptureStream, C: Clock = SystemClock> {
    stream: S,
    clock: C,
    geometry: SensorGeometry,
    config: ExposureConfig,
    chip: CcdChip,
    sink: Box<dyn ExposureSink>,
    accumulator: Accumulator,
    block: RawBlock,
    frame: DecodedFrame,
    state: ExposureState,
    request: Option<ExposureRequest>,
    abort: AbortHandle,
    last_frame_at: Option<Instant>,
}

impl<S: CaptureStream> ExposureController<S, SystemClock> {
    pub fn new(
        stream: S,
        geometry: SensorGeometry,
        chip: CcdChip,
        sink: Box<dyn ExposureSink>,
        config: ExposureConfig,
    ) -> Self {
        Self::with_clock(stream, geometry, chip, sink, config, SystemClock)
    }
}

impl<S: CaptureStream, C: Clock> ExposureController<S, C> {
    pub fn with_clock(
        stream: S,
        geometry: SensorGeometry,
        chip: CcdChip,
        sink: Box<dyn ExposureSink>,
        config: ExposureConfig,
        clock: C,
    ) -> Self {
        Self {
            stream,
            clock,
            geometry,
            config,
            chip,
            sink,
            accumulator: Accumulator::new(geometry),
            block: RawBlock::new(geometry),
            frame: DecodedFrame::new(geometry),
            state: ExposureState::Idle,
            request: None,
            abort: AbortHandle::default(),
            last_frame_at: None,
        }
    }

    pub fn state(&self) -> ExposureState {
        self.state
    }

    pub fn frames_summed(&self) -> u32 {
        self.accumulator.frames_summed()
    }

    pub fn frame_target(&self) -> u32 {
        self.request.map_or(0, |r| r.frame_target)
    }

    pub fn time_left(&self) -> f64 {
        self.request
            .map_or(0.0, |r| r.time_left(self.clock.now()))
    }

    pub fn request(&self) -> Option<&ExposureRequest> {
        self.request.as_ref()
    }

    pub fn status(&self) -> ExposureStatus {
        ExposureStatus {
            state: self.state,
            frames_summed: self.frames_summed(),
            frame_target: self.frame_target(),
            time_left: self.time_left(),
        }
    }

    pub fn chip(&self) -> &CcdChip {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut CcdChip {
        &mut self.chip
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.config
    }

    /// Handle for requesting an abort from inside a running tick.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Validate and apply a sub-frame. Invalid rectangles change nothing.
    pub fn set_roi(&mut self, roi: Roi) -> Result<(), ExposureError> {
        self.chip.set_roi(roi)?;
        Ok(())
    }

    pub fn is_stream_running(&self) -> bool {
        self.stream.is_running()
    }

    /// Begin an exposure of `duration` seconds.
    ///
    /// Short requests are clamped to the minimum, and bias frames always
    /// use the minimum.
    pub fn start_exposure(
        &mut self,
        duration: f64,
        frame_type: FrameType,
    ) -> Result<(), ExposureError> {
        if self.state != ExposureState::Idle {
            return Err(ExposureError::Busy);
        }
        if !duration.is_finite() {
            return Err(ExposureError::InvalidDuration(duration));
        }

        let min = self.config.min_duration;
        let mut effective = duration;
        if effective < min {
            tracing::warn!(
                requested = duration,
                minimum = min,
                "exposure shorter than minimum duration; clamping"
            );
            effective = min;
        }
        if frame_type == FrameType::Bias {
            tracing::info!(duration = min, "bias frame uses minimum duration");
            effective = min;
        }
        let frame_target = (effective.floor() as u32).max(1);

        self.accumulator.reset();
        self.block.clear();
        self.abort.reset();
        self.last_frame_at = None;

        // A stream left over from the previous exposure may hold frames
        // captured before this one began.
        self.release_stream();
        if let Err(e) = self.stream.start() {
            tracing::error!(error = %e, "cannot start exposure: capture unavailable");
            return Err(e.into());
        }

        self.chip.set_frame_type(frame_type);
        self.chip.set_exposure_duration(effective);
        self.chip.set_exposure_left(effective);

        self.request = Some(ExposureRequest {
            requested: duration,
            duration: effective,
            frame_type,
            frame_target,
            started: self.clock.now(),
            started_at: Utc::now(),
        });
        self.state = ExposureState::Exposing;

        tracing::info!(
            duration = effective,
            frames = frame_target,
            %frame_type,
            shuttered = frame_type.is_shuttered(),
            "exposure started"
        );
        Ok(())
    }

    /// Advance the state machine. Returns the delay before the next tick.
    pub fn tick(&mut self) -> Duration {
        match self.state {
            ExposureState::Idle => {
                self.release_stream();
                self.config.poll_interval
            }
            ExposureState::Exposing => self.tick_exposing(),
            // finalize() returns to Idle before the tick that entered it ends.
            ExposureState::Finalizing => {
                debug_assert!(false, "tick observed Finalizing");
                self.state = ExposureState::Idle;
                self.config.poll_interval
            }
        }
    }

    /// Stop the stream, discard partial data and return to idle. Idempotent.
    pub fn abort(&mut self) {
        self.abort_with(AbortReason::Requested);
    }

    fn tick_exposing(&mut self) -> Duration {
        let poll = self.config.poll_interval;
        let Some(request) = self.request else {
            self.state = ExposureState::Idle;
            return poll;
        };
        if self.abort_pending() {
            return poll;
        }

        let now = self.clock.now();
        let time_left = request.time_left(now);
        self.chip.set_exposure_left(time_left);

        if self.accumulator.frames_summed() < request.frame_target {
            match self.capture_once() {
                Ok(_) => {}
                Err(reason) => {
                    self.abort_with(reason);
                    return poll;
                }
            }
            if self.abort_pending() {
                return poll;
            }
        }

        if time_left >= FINAL_POLL_WINDOW {
            return poll;
        }
        if time_left > TIME_EPSILON {
            return Duration::from_millis((time_left * 1000.0) as u64);
        }

        // Deadline passed: pick up anything the pipe still holds, no sleeping.
        while self.accumulator.frames_summed() < request.frame_target {
            match self.capture_once() {
                Ok(true) => {
                    if self.abort_pending() {
                        return poll;
                    }
                }
                Ok(false) => break,
                Err(reason) => {
                    self.abort_with(reason);
                    return poll;
                }
            }
        }

        if self.accumulator.frames_summed() >= request.frame_target {
            self.finalize(request);
            return poll;
        }

        let stalled_since = self
            .last_frame_at
            .map_or(request.deadline(), |t| t.max(request.deadline()));
        let stalled = now.saturating_duration_since(stalled_since);
        if stalled > self.config.overrun_limit {
            if self.accumulator.frames_summed() == 0 {
                self.abort_with(AbortReason::NoFrames);
            } else {
                tracing::warn!(
                    frames = self.accumulator.frames_summed(),
                    target = request.frame_target,
                    "frames missing after overrun limit; delivering partial sum"
                );
                self.finalize(request);
            }
            return poll;
        }

        tracing::debug!(
            frames = self.accumulator.frames_summed(),
            target = request.frame_target,
            "waiting for missing frames"
        );
        poll
    }

    /// One read + decode + accumulate cycle. `Ok(false)` means no frame yet.
    fn capture_once(&mut self) -> Result<bool, AbortReason> {
        match self.stream.read_block(&mut self.block) {
            Ok(ReadStatus::Complete) => {}
            Ok(ReadStatus::Partial | ReadStatus::NoData) => return Ok(false),
            Ok(ReadStatus::StreamEnded) => return Err(AbortReason::StreamEnded),
            Err(e) => return Err(AbortReason::Capture(e.to_string())),
        }

        let decoded = decode_into(self.block.as_bytes(), self.geometry, &mut self.frame);
        self.block.clear();
        match decoded {
            Ok(()) => {}
            Err(DecodeError::ShortBlock { expected, actual }) => {
                tracing::debug!(expected, actual, "short raw block; retrying");
                return Ok(false);
            }
            Err(e) => return Err(AbortReason::Capture(e.to_string())),
        }

        self.accumulator
            .add_frame(&self.frame)
            .map_err(|e: AccumulatorError| AbortReason::Capture(e.to_string()))?;
        self.last_frame_at = Some(self.clock.now());

        tracing::info!(
            frame = self.accumulator.frames_summed(),
            of = self.frame_target(),
            "frame accumulated"
        );
        Ok(true)
    }

    fn finalize(&mut self, request: ExposureRequest) {
        self.state = ExposureState::Finalizing;
        let roi = self.chip.roi();

        let image = roi::extract(
            self.accumulator.sum(),
            self.accumulator.width(),
            self.accumulator.height(),
            roi,
        )
        .map_err(ChipError::from)
        .and_then(|cropped| self.chip.bin_frame(&cropped));

        match image {
            Ok(image) => {
                let (bin_x, bin_y) = self.chip.binning();
                let exposure = FinishedExposure {
                    width: image.width,
                    height: image.height,
                    roi,
                    bin_x,
                    bin_y,
                    frame_type: request.frame_type,
                    bayer: self.chip.bayer_pattern().map(str::to_owned),
                    requested_duration: request.requested,
                    duration: request.duration,
                    frames_summed: self.accumulator.frames_summed(),
                    frame_target: request.frame_target,
                    started_at: request.started_at,
                    pixels: image.pixels,
                };
                tracing::info!(
                    width = exposure.width,
                    height = exposure.height,
                    frames = exposure.frames_summed,
                    "image complete"
                );
                self.sink.exposure_complete(exposure);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to extract sub-frame");
                self.sink
                    .exposure_aborted(AbortReason::Capture(e.to_string()));
            }
        }

        self.request = None;
        self.accumulator.reset();
        self.chip.set_exposure_left(0.0);
        self.state = ExposureState::Idle;
    }

    /// Performs the abort if one was requested; returns whether it did.
    fn abort_pending(&mut self) -> bool {
        if self.abort.is_requested() {
            self.abort_with(AbortReason::Requested);
            true
        } else {
            false
        }
    }

    fn abort_with(&mut self, reason: AbortReason) {
        let was_active = self.state != ExposureState::Idle;

        self.stream.stop();
        self.accumulator.reset();
        self.block.clear();
        self.request = None;
        self.last_frame_at = None;
        self.chip.set_exposure_left(0.0);
        self.state = ExposureState::Idle;
        self.abort.reset();

        if was_active {
            match reason {
                AbortReason::Requested => tracing::info!("exposure aborted"),
                ref other => tracing::warn!(reason = %other, "exposure aborted"),
            }
            self.sink.exposure_aborted(reason);
        }
    }

    /// Drain and stop a stream left running with no exposure to feed.
    /// Does nothing while an exposure is in progress.
    pub fn release_stream(&mut self) {
        if self.state != ExposureState::Idle || !self.stream.is_running() {
            return;
        }
        match self.stream.drain() {
            Ok(bytes) => tracing::debug!(bytes, "discarded unused frames"),
            Err(e) => tracing::warn!(error = %e, "failed to drain capture stream"),
        }
        self.stream.stop();
        self.block.clear();
    }
}
