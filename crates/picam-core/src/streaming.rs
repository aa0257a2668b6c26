//! Live streaming worker.
//!
//! A long-lived thread that decodes frames and republishes them at the
//! sink's target rate. It parks on a condition variable while disabled, so
//! `start`/`stop` only flip a flag; the thread itself lives as long as the
//! worker handle.

use picam_hw::{
    decode_into, CaptureError, CaptureStream, DecodedFrame, RawBlock, ReadStatus, SensorGeometry,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Wait between polls of an empty pipe.
const EMPTY_PIPE_BACKOFF: Duration = Duration::from_millis(5);

const MIN_FRAME_RATE: f64 = 0.01;
const MAX_FRAME_RATE: f64 = 1000.0;

#[derive(Error, Debug)]
pub enum StreamingError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to spawn streaming thread: {0}")]
    Spawn(std::io::Error),
}

/// Consumer of live frames.
pub trait StreamingSink: Send + 'static {
    fn publish_frame(&mut self, frame: &DecodedFrame);

    /// Frames per second the sink wants.
    fn target_frame_rate(&self) -> f64;
}

#[derive(Default)]
struct Control {
    enabled: bool,
    terminate: bool,
}

struct Shared {
    control: Mutex<Control>,
    signal: Condvar,
    published: AtomicU64,
    /// Bumped on every launch, under the stream lock.
    launches: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the streaming thread. Dropping it terminates the thread.
pub struct StreamingWorker<S: CaptureStream + 'static> {
    shared: Arc<Shared>,
    stream: Arc<Mutex<S>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: CaptureStream + 'static> StreamingWorker<S> {
    /// Spawn the worker thread, initially paused.
    pub fn spawn(
        stream: S,
        geometry: SensorGeometry,
        sink: impl StreamingSink,
    ) -> Result<Self, StreamingError> {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control::default()),
            signal: Condvar::new(),
            published: AtomicU64::new(0),
            launches: AtomicU64::new(0),
        });
        let stream = Arc::new(Mutex::new(stream));

        let thread = std::thread::Builder::new()
            .name("picam-stream".into())
            .spawn({
                let shared = Arc::clone(&shared);
                let stream = Arc::clone(&stream);
                move || run(&shared, &stream, geometry, sink)
            })
            .map_err(StreamingError::Spawn)?;

        Ok(Self {
            shared,
            stream,
            thread: Some(thread),
        })
    }

    /// Make sure the capture stream is running and resume publishing.
    pub fn start(&self) -> Result<(), StreamingError> {
        // Stream lock is held until enabled is set, so the worker never sees
        // a relaunched stream paired with a stale disabled flag.
        let mut stream = lock(&self.stream);
        stream.start()?;
        self.shared.launches.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.control).enabled = true;
        drop(stream);
        self.shared.signal.notify_all();
        tracing::info!("streaming started");
        Ok(())
    }

    /// Pause publishing and release the capture stream.
    ///
    /// A frame already being paced is dropped; publishing stops within one
    /// frame period.
    pub fn stop(&self) {
        lock(&self.shared.control).enabled = false;
        self.shared.signal.notify_all();
        release_stream(&self.stream);
        tracing::info!("streaming stopped");
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.shared.control).enabled
    }

    pub fn frames_published(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }
}

impl<S: CaptureStream + 'static> Drop for StreamingWorker<S> {
    fn drop(&mut self) {
        {
            let mut control = lock(&self.shared.control);
            control.enabled = false;
            control.terminate = true;
        }
        self.shared.signal.notify_all();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("streaming thread panicked");
            }
        }
    }
}

fn frame_period(rate: f64) -> Duration {
    let rate = if rate.is_finite() {
        rate.clamp(MIN_FRAME_RATE, MAX_FRAME_RATE)
    } else {
        1.0
    };
    Duration::from_secs_f64(1.0 / rate)
}

/// Sleep up to `timeout` unless streaming is stopped first.
/// Returns whether streaming is still enabled.
fn wait_enabled(shared: &Shared, timeout: Duration) -> bool {
    let control = lock(&shared.control);
    let (control, _) = shared
        .signal
        .wait_timeout_while(control, timeout, |c| c.enabled && !c.terminate)
        .unwrap_or_else(PoisonError::into_inner);
    control.enabled && !control.terminate
}

/// Disable streaming after a capture failure, unless already stopped.
fn pause_on_failure(shared: &Shared, reason: &str) {
    let mut control = lock(&shared.control);
    if control.enabled {
        tracing::warn!(reason, "streaming paused");
        control.enabled = false;
    }
}

fn release_stream<S: CaptureStream>(stream: &Mutex<S>) {
    release(&mut *lock(stream));
}

fn release<S: CaptureStream>(stream: &mut S) {
    if stream.is_running() {
        if let Err(e) = stream.drain() {
            tracing::debug!(error = %e, "failed to drain stream on pause");
        }
        stream.stop();
    }
}

fn run<S: CaptureStream>(
    shared: &Shared,
    stream: &Mutex<S>,
    geometry: SensorGeometry,
    mut sink: impl StreamingSink,
) {
    let mut block = RawBlock::new(geometry);
    let mut frame = DecodedFrame::new(geometry);
    let mut active = false;
    let mut last_publish = Instant::now();
    let mut launch = 0;

    tracing::debug!("streaming thread started");

    loop {
        let enabled = {
            let control = lock(&shared.control);
            let control = if active {
                control
            } else {
                shared
                    .signal
                    .wait_while(control, |c| !c.enabled && !c.terminate)
                    .unwrap_or_else(PoisonError::into_inner)
            };
            if control.terminate {
                break;
            }
            control.enabled
        };

        if !enabled {
            active = false;
            block.clear();
            let mut stream = lock(stream);
            // start() may have relaunched the stream since the flag was read.
            if !lock(&shared.control).enabled {
                release(&mut *stream);
            }
            continue;
        }
        if !active {
            active = true;
            // The first frame also waits a full period.
            last_publish = Instant::now();
        }

        let status = {
            let mut stream = lock(stream);
            // Bytes from a previous producer never complete a block.
            let current = shared.launches.load(Ordering::Relaxed);
            if current != launch {
                block.clear();
                launch = current;
            }
            stream.read_block(&mut block)
        };
        match status {
            Ok(ReadStatus::Complete) => {}
            Ok(ReadStatus::Partial | ReadStatus::NoData) => {
                wait_enabled(shared, EMPTY_PIPE_BACKOFF);
                continue;
            }
            Ok(ReadStatus::StreamEnded) => {
                pause_on_failure(shared, "capture stream ended");
                continue;
            }
            Err(CaptureError::NotRunning) => {
                // Closed by a concurrent stop(); the flag check above settles it.
                wait_enabled(shared, EMPTY_PIPE_BACKOFF);
                continue;
            }
            Err(e) => {
                pause_on_failure(shared, &e.to_string());
                continue;
            }
        }

        let decoded = decode_into(block.as_bytes(), geometry, &mut frame);
        block.clear();
        if let Err(e) = decoded {
            tracing::debug!(error = %e, "dropping undecodable block");
            continue;
        }

        let period = frame_period(sink.target_frame_rate());
        let elapsed = last_publish.elapsed();
        let still_enabled = if elapsed < period {
            wait_enabled(shared, period - elapsed)
        } else {
            wait_enabled(shared, Duration::ZERO)
        };
        if !still_enabled {
            continue;
        }

        sink.publish_frame(&frame);
        shared.published.fetch_add(1, Ordering::Relaxed);
        last_publish = Instant::now();
    }

    release_stream(stream);
    tracing::debug!("streaming thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStream, TINY};
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        count: Arc<AtomicUsize>,
        fps: f64,
    }

    impl StreamingSink for CountingSink {
        fn publish_frame(&mut self, frame: &DecodedFrame) {
            assert_eq!(frame.pixels.len(), TINY.pixel_count());
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn target_frame_rate(&self) -> f64 {
            self.fps
        }
    }

    fn spawn(fps: f64) -> (StreamingWorker<FakeStream>, FakeStream, Arc<AtomicUsize>) {
        let stream = FakeStream::constant(TINY, 0x2000);
        stream.with(|s| s.endless = true);
        let count = Arc::new(AtomicUsize::new(0));
        let worker = StreamingWorker::spawn(
            stream.clone(),
            TINY,
            CountingSink {
                count: Arc::clone(&count),
                fps,
            },
        )
        .unwrap();
        (worker, stream, count)
    }

    #[test]
    fn test_start_then_immediate_stop_never_publishes() {
        let (worker, stream, count) = spawn(5.0);
        worker.start().unwrap();
        worker.stop();
        std::thread::sleep(Duration::from_millis(600));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(worker.frames_published(), 0);
        assert!(!stream.is_running());
    }

    #[test]
    fn test_publishes_near_target_rate() {
        let (worker, _stream, count) = spawn(20.0);
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(330));
        worker.stop();
        std::thread::sleep(Duration::from_millis(60));

        let published = count.load(Ordering::SeqCst);
        assert!((2..=8).contains(&published), "published {published}");
        assert_eq!(worker.frames_published() as usize, published);
    }

    #[test]
    fn test_pause_and_resume_reuses_thread() {
        let (worker, stream, count) = spawn(50.0);
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        worker.stop();
        std::thread::sleep(Duration::from_millis(50));
        let after_first = count.load(Ordering::SeqCst);
        assert!(after_first > 0);
        assert!(!stream.is_running());

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), after_first);

        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        worker.stop();
        assert!(count.load(Ordering::SeqCst) > after_first);
        stream.with(|s| assert_eq!(s.starts, 2));
    }

    #[test]
    fn test_rapid_stop_start_keeps_streaming() {
        let (worker, stream, count) = spawn(50.0);
        for _ in 0..50 {
            worker.start().unwrap();
            worker.stop();
        }
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(150));

        assert!(worker.is_enabled());
        assert!(stream.is_running());
        assert!(count.load(Ordering::SeqCst) > 0);
        worker.stop();
    }

    #[test]
    fn test_stream_end_pauses_worker() {
        let (worker, stream, count) = spawn(50.0);
        stream.with(|s| s.ended = true);
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(!worker.is_enabled());
        assert!(!stream.is_running());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_fails_when_capture_unavailable() {
        let (worker, stream, _count) = spawn(5.0);
        stream.with(|s| s.fail_start = true);
        assert!(matches!(
            worker.start(),
            Err(StreamingError::Capture(CaptureError::Unavailable(_)))
        ));
        assert!(!worker.is_enabled());
    }

    #[test]
    fn test_drop_joins_thread() {
        let (worker, stream, _count) = spawn(5.0);
        worker.start().unwrap();
        drop(worker);
        assert!(!stream.is_running());
    }

    #[test]
    fn test_frame_period_clamps_rate() {
        assert_eq!(frame_period(10.0), Duration::from_millis(100));
        assert_eq!(frame_period(f64::NAN), Duration::from_secs(1));
        assert_eq!(frame_period(0.0), Duration::from_secs(100));
    }
}
