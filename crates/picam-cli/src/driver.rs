//! Tick driver.
//!
//! Owns the exposure controller and the streaming worker on one dedicated
//! thread. Requests arrive over a channel; exposure ticks are scheduled
//! with the delay each tick returns, so ticks never overlap.

use picam_core::chip::ChipError;
use picam_core::{
    AbortReason, ExposureController, ExposureError, ExposureSink, ExposureStatus,
    FinishedExposure, FrameType, Roi, StreamingError, StreamingWorker,
};
use picam_hw::CaptureStream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Exposure(#[from] ExposureError),
    #[error(transparent)]
    Streaming(#[from] StreamingError),
    #[error(transparent)]
    Chip(#[from] ChipError),
    #[error("exposure aborted: {0}")]
    Aborted(AbortReason),
    #[error("camera busy: {0} in progress")]
    Busy(&'static str),
    #[error("failed to spawn driver thread: {0}")]
    Spawn(std::io::Error),
    #[error("driver thread exited")]
    ChannelClosed,
}

/// Parameters of one exposure.
#[derive(Debug, Clone, Copy)]
pub struct ExposeRequest {
    pub duration: f64,
    pub frame_type: FrameType,
    /// Sub-frame; `None` keeps the current one.
    pub roi: Option<Roi>,
    pub binning: (u32, u32),
}

/// Snapshot of both pipelines.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DriverStatus {
    pub exposure: ExposureStatus,
    pub streaming: bool,
    pub frames_published: u64,
}

enum ExposureEvent {
    Complete(FinishedExposure),
    Aborted(AbortReason),
}

/// Forwards controller callbacks to the driver loop.
struct ChannelSink(mpsc::UnboundedSender<ExposureEvent>);

impl ExposureSink for ChannelSink {
    fn exposure_complete(&mut self, exposure: FinishedExposure) {
        let _ = self.0.send(ExposureEvent::Complete(exposure));
    }

    fn exposure_aborted(&mut self, reason: AbortReason) {
        let _ = self.0.send(ExposureEvent::Aborted(reason));
    }
}

/// Builds the exposure controller around the driver's sink.
pub type ControllerFactory<S> =
    Box<dyn FnOnce(Box<dyn ExposureSink>) -> ExposureController<S> + Send>;

type ExposeReply = oneshot::Sender<Result<FinishedExposure, DriverError>>;

/// Messages sent from the CLI to the driver thread.
enum DriverRequest {
    Expose {
        request: ExposeRequest,
        reply: ExposeReply,
    },
    Abort,
    StartStreaming {
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    StopStreaming {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<DriverStatus>,
    },
}

/// Clone-safe handle to the driver thread.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<DriverRequest>,
}

impl DriverHandle {
    /// Run one exposure; resolves when the image is complete or aborted.
    pub async fn expose(&self, request: ExposeRequest) -> Result<FinishedExposure, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverRequest::Expose { request, reply }).await?;
        rx.await.map_err(|_| DriverError::ChannelClosed)?
    }

    /// Abort the exposure in progress, if any.
    pub async fn abort(&self) -> Result<(), DriverError> {
        self.send(DriverRequest::Abort).await
    }

    pub async fn start_streaming(&self) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverRequest::StartStreaming { reply }).await?;
        rx.await.map_err(|_| DriverError::ChannelClosed)?
    }

    pub async fn stop_streaming(&self) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverRequest::StopStreaming { reply }).await?;
        rx.await.map_err(|_| DriverError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<DriverStatus, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.send(DriverRequest::Status { reply }).await?;
        rx.await.map_err(|_| DriverError::ChannelClosed)
    }

    async fn send(&self, request: DriverRequest) -> Result<(), DriverError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| DriverError::ChannelClosed)
    }
}

/// Spawn the driver on a dedicated OS thread.
///
/// Runs the sensor init command first, if any; a failing init command is
/// logged and the driver starts anyway. The thread exits once every
/// handle is dropped.
pub fn spawn_driver<S, W>(
    build_controller: ControllerFactory<S>,
    worker: StreamingWorker<W>,
    init_command: Option<&str>,
) -> Result<DriverHandle, DriverError>
where
    S: CaptureStream + 'static,
    W: CaptureStream + 'static,
{
    if let Some(command) = init_command {
        run_init_command(command);
    }

    let (tx, rx) = mpsc::channel::<DriverRequest>(8);

    std::thread::Builder::new()
        .name("picam-exposure".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build driver runtime");
                    return;
                }
            };
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let controller = build_controller(Box::new(ChannelSink(events_tx)));
            tracing::info!("driver thread started");
            runtime.block_on(Driver::new(controller, worker).run(rx, events_rx));
            tracing::info!("driver thread exiting");
        })
        .map_err(DriverError::Spawn)?;

    Ok(DriverHandle { tx })
}

fn run_init_command(command: &str) {
    match std::process::Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) if status.success() => tracing::info!(command, "sensor initialised"),
        Ok(status) => tracing::warn!(command, %status, "sensor init command failed"),
        Err(e) => tracing::warn!(command, error = %e, "sensor init command did not run"),
    }
}

struct Driver<S: CaptureStream, W: CaptureStream + 'static> {
    controller: ExposureController<S>,
    worker: StreamingWorker<W>,
    pending: Option<ExposeReply>,
    next_tick: Instant,
}

impl<S: CaptureStream, W: CaptureStream + 'static> Driver<S, W> {
    fn new(controller: ExposureController<S>, worker: StreamingWorker<W>) -> Self {
        let next_tick = Instant::now() + controller.config().poll_interval;
        Self {
            controller,
            worker,
            pending: None,
            next_tick,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<DriverRequest>,
        mut events: mpsc::UnboundedReceiver<ExposureEvent>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                Some(event) = events.recv() => self.deliver(event),
                _ = tokio::time::sleep_until(self.next_tick) => {
                    let delay = self.controller.tick();
                    self.next_tick = Instant::now() + delay;
                }
            }
        }

        self.controller.abort();
        self.worker.stop();
    }

    fn handle(&mut self, request: DriverRequest) {
        match request {
            DriverRequest::Expose { request, reply } => match self.start_exposure(request) {
                Ok(()) => {
                    self.pending = Some(reply);
                    // First frame is read right away.
                    self.next_tick = Instant::now();
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            DriverRequest::Abort => self.controller.abort(),
            DriverRequest::StartStreaming { reply } => {
                let _ = reply.send(self.start_streaming());
            }
            DriverRequest::StopStreaming { reply } => {
                self.worker.stop();
                let _ = reply.send(());
            }
            DriverRequest::Status { reply } => {
                let _ = reply.send(DriverStatus {
                    exposure: self.controller.status(),
                    streaming: self.worker.is_enabled(),
                    frames_published: self.worker.frames_published(),
                });
            }
        }
    }

    fn start_exposure(&mut self, request: ExposeRequest) -> Result<(), DriverError> {
        if self.worker.is_enabled() {
            return Err(DriverError::Busy("streaming"));
        }
        if self.pending.is_some() {
            return Err(ExposureError::Busy.into());
        }
        let chip = self.controller.chip_mut();
        if let Some(roi) = request.roi {
            chip.set_roi(roi)?;
        }
        chip.set_binning(request.binning.0, request.binning.1)?;
        self.controller
            .start_exposure(request.duration, request.frame_type)?;
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), DriverError> {
        if self.pending.is_some() {
            return Err(DriverError::Busy("exposure"));
        }
        // Only one producer may hold the camera.
        self.controller.release_stream();
        self.worker.start()?;
        Ok(())
    }

    fn deliver(&mut self, event: ExposureEvent) {
        let result = match event {
            ExposureEvent::Complete(exposure) => Ok(exposure),
            ExposureEvent::Aborted(reason) => Err(DriverError::Aborted(reason)),
        };
        match self.pending.take() {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => tracing::debug!("exposure finished with no waiting client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::LatestFrameSink;
    use picam_core::{CcdChip, ExposureConfig};
    use picam_hw::{PipeCapture, SensorGeometry};
    use std::time::Duration;

    const TINY: SensorGeometry = SensorGeometry::new(8, 4, 2);

    fn spawn(exposure_command: &str, stream_command: &str) -> DriverHandle {
        let config = ExposureConfig {
            min_duration: 0.2,
            poll_interval: Duration::from_millis(50),
            overrun_limit: Duration::from_secs(1),
        };
        let stream = PipeCapture::new(exposure_command);
        let build: ControllerFactory<PipeCapture> = Box::new(move |sink| {
            ExposureController::new(stream, TINY, CcdChip::with_geometry(TINY, 1.12), sink, config)
        });
        let worker = StreamingWorker::spawn(
            PipeCapture::new(stream_command),
            TINY,
            LatestFrameSink::new(20.0, None),
        )
        .unwrap();
        spawn_driver(build, worker, Some("true")).unwrap()
    }

    fn request(duration: f64) -> ExposeRequest {
        ExposeRequest {
            duration,
            frame_type: FrameType::Light,
            roi: None,
            binning: (1, 1),
        }
    }

    #[tokio::test]
    async fn test_exposure_completes() {
        let handle = spawn("cat /dev/zero", "cat /dev/zero");
        let done = handle.expose(request(0.2)).await.unwrap();

        assert_eq!((done.width, done.height), (8, 4));
        assert_eq!(done.frames_summed, 1);
        assert!(done.pixels.iter().all(|&p| p == 0));

        let status = handle.status().await.unwrap();
        assert_eq!(status.exposure.state, picam_core::ExposureState::Idle);
    }

    #[tokio::test]
    async fn test_roi_and_binning_from_request() {
        let handle = spawn("cat /dev/zero", "cat /dev/zero");
        let done = handle
            .expose(ExposeRequest {
                roi: Some(Roi::new(0, 0, 4, 4)),
                binning: (2, 2),
                ..request(0.2)
            })
            .await
            .unwrap();
        assert_eq!((done.width, done.height), (2, 2));
        assert_eq!(done.roi, Roi::new(0, 0, 4, 4));
    }

    #[tokio::test]
    async fn test_invalid_roi_rejected() {
        let handle = spawn("cat /dev/zero", "cat /dev/zero");
        let err = handle
            .expose(ExposeRequest {
                roi: Some(Roi::new(6, 0, 4, 4)),
                ..request(0.2)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Chip(ChipError::InvalidRoi(_))));
    }

    #[tokio::test]
    async fn test_abort_resolves_pending_exposure() {
        let handle = spawn("sleep 30", "cat /dev/zero");
        let exposure = tokio::spawn({
            let handle = handle.clone();
            async move { handle.expose(request(30.0)).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort().await.unwrap();

        let result = exposure.await.unwrap();
        assert!(matches!(
            result,
            Err(DriverError::Aborted(AbortReason::Requested))
        ));
    }

    #[tokio::test]
    async fn test_producer_exit_aborts_exposure() {
        let handle = spawn("true", "cat /dev/zero");
        let result = handle.expose(request(5.0)).await;
        assert!(matches!(
            result,
            Err(DriverError::Aborted(AbortReason::StreamEnded))
        ));
    }

    #[tokio::test]
    async fn test_exposure_and_streaming_exclude_each_other() {
        let handle = spawn("cat /dev/zero", "cat /dev/zero");
        handle.start_streaming().await.unwrap();
        assert!(matches!(
            handle.expose(request(0.2)).await,
            Err(DriverError::Busy("streaming"))
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop_streaming().await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(!status.streaming);
        assert!(status.frames_published > 0);

        let exposure = tokio::spawn({
            let handle = handle.clone();
            async move { handle.expose(request(1.0)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            handle.start_streaming().await,
            Err(DriverError::Busy("exposure"))
        ));
        assert!(exposure.await.unwrap().is_ok());
    }
}
