//! In-memory capture stream and clock for state-machine tests.

use crate::exposure::{AbortHandle, Clock};
use picam_hw::{pack, CaptureError, CaptureStream, DecodedFrame, RawBlock, ReadStatus, SensorGeometry};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const TINY: SensorGeometry = SensorGeometry::new(8, 4, 2);

#[derive(Default)]
pub struct FakeState {
    pub running: bool,
    pub starts: u32,
    pub stops: u32,
    /// Complete blocks waiting in the "pipe".
    pub pending: usize,
    /// Serve blocks forever regardless of `pending`.
    pub endless: bool,
    pub ended: bool,
    pub fail_start: bool,
    pub drained_blocks: usize,
    pub abort_on_read: Option<AbortHandle>,
}

/// Capture stream serving copies of one packed frame.
#[derive(Clone)]
pub struct FakeStream {
    pub state: Arc<Mutex<FakeState>>,
    packed: Arc<Vec<u8>>,
}

impl FakeStream {
    /// Every block decodes to a frame of constant `value`.
    pub fn constant(geometry: SensorGeometry, value: u16) -> Self {
        let frame = DecodedFrame::filled(geometry, value);
        let packed = pack(&frame, geometry).expect("test geometry packs");
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            packed: Arc::new(packed),
        }
    }

    pub fn feed(&self, blocks: usize) {
        self.state.lock().unwrap().pending += blocks;
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

impl CaptureStream for FakeStream {
    fn start(&mut self) -> Result<(), CaptureError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(CaptureError::Unavailable("fake producer missing".into()));
        }
        if !state.running {
            state.running = true;
            state.starts += 1;
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.running {
            state.running = false;
            state.stops += 1;
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn read_block(&mut self, block: &mut RawBlock) -> Result<ReadStatus, CaptureError> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(CaptureError::NotRunning);
        }
        if let Some(handle) = state.abort_on_read.take() {
            handle.abort();
        }
        if state.ended {
            return Ok(ReadStatus::StreamEnded);
        }
        if !state.endless {
            if state.pending == 0 {
                return Ok(ReadStatus::NoData);
            }
            state.pending -= 1;
        }
        block.clear();
        let n = self.packed.len().min(block.capacity());
        block.unfilled_mut()[..n].copy_from_slice(&self.packed[..n]);
        block.advance(n);
        Ok(ReadStatus::Complete)
    }

    fn drain(&mut self) -> Result<usize, CaptureError> {
        let mut state = self.state.lock().unwrap();
        let blocks = std::mem::take(&mut state.pending);
        state.drained_blocks += blocks;
        Ok(blocks * self.packed.len())
    }
}

/// Clock advanced by hand.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock().unwrap()
    }
}
