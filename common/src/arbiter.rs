use std::{
    sync::{Condvar, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use thiserror::Error;

pub const CAMERA_LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("camera returned no frame")]
    NoFrame,
    #[error("camera driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera busy (lock not acquired within {0:?})")]
    Busy(Duration),
    #[error(transparent)]
    Sensor(#[from] SensorError),
}

/// Image sensor that hands out one frame per call. Frames must be dropped
/// before the next grab on drivers that reuse buffers.
pub trait FrameSource {
    type Frame: AsRef<[u8]>;

    fn grab(&mut self) -> Result<Self::Frame, SensorError>;
}

/// Frames thrown away so exposure and white balance can settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupProfile {
    pub discard_frames: u32,
    pub frame_delay: Duration,
    pub settle_delay: Duration,
}

impl Default for WarmupProfile {
    fn default() -> Self {
        Self {
            discard_frames: 3,
            frame_delay: Duration::from_millis(200),
            settle_delay: Duration::from_millis(500),
        }
    }
}

impl WarmupProfile {
    pub const NONE: Self = Self {
        discard_frames: 0,
        frame_delay: Duration::ZERO,
        settle_delay: Duration::ZERO,
    };
}

/// Serialises access to a single camera between the control loop and the
/// web handlers. The sensor lives in the slot while nobody holds it.
pub struct CaptureArbiter<S> {
    slot: Mutex<Option<S>>,
    released: Condvar,
    warmup: WarmupProfile,
}

impl<S: FrameSource> CaptureArbiter<S> {
    pub fn new(sensor: S) -> Self {
        Self {
            slot: Mutex::new(Some(sensor)),
            released: Condvar::new(),
            warmup: WarmupProfile::default(),
        }
    }

    pub fn with_warmup(mut self, warmup: WarmupProfile) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn warmup(&self) -> WarmupProfile {
        self.warmup
    }

    pub fn is_busy(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn acquire(&self, timeout: Duration) -> Option<CameraGuard<'_, S>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(sensor) = slot.take() {
                return Some(CameraGuard {
                    arbiter: self,
                    sensor: Some(sensor),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let (next, _) = self
                .released
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            slot = next;
        }
    }

    /// Takes the camera, discards the warm-up frames and returns the next one.
    /// The lock is held until the returned [`Captured`] is dropped.
    pub fn capture_with_warmup(&self, timeout: Duration) -> Result<Captured<'_, S>, CaptureError> {
        let mut guard = self.acquire(timeout).ok_or(CaptureError::Busy(timeout))?;
        guard.warm_up(self.warmup);
        let frame = guard.grab()?;
        Ok(Captured {
            frame,
            _guard: guard,
        })
    }

    pub fn capture_preview(&self, timeout: Duration) -> Result<Captured<'_, S>, CaptureError> {
        let mut guard = self.acquire(timeout).ok_or(CaptureError::Busy(timeout))?;
        let frame = guard.grab()?;
        Ok(Captured {
            frame,
            _guard: guard,
        })
    }

    fn release(&self, sensor: S) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(sensor);
        drop(slot);
        self.released.notify_one();
    }
}

pub struct CameraGuard<'a, S: FrameSource> {
    arbiter: &'a CaptureArbiter<S>,
    sensor: Option<S>,
}

impl<S: FrameSource> CameraGuard<'_, S> {
    pub fn grab(&mut self) -> Result<S::Frame, SensorError> {
        match self.sensor.as_mut() {
            Some(sensor) => sensor.grab(),
            None => Err(SensorError::NoFrame),
        }
    }

    pub fn warm_up(&mut self, profile: WarmupProfile) {
        for index in 0..profile.discard_frames {
            match self.grab() {
                Ok(frame) => debug!(
                    "discarded warm-up frame {}/{} ({} bytes)",
                    index + 1,
                    profile.discard_frames,
                    frame.as_ref().len()
                ),
                Err(err) => warn!("warm-up frame {} failed: {err}", index + 1),
            }
            if !profile.frame_delay.is_zero() {
                thread::sleep(profile.frame_delay);
            }
        }
        if !profile.settle_delay.is_zero() {
            thread::sleep(profile.settle_delay);
        }
    }
}

impl<S: FrameSource> Drop for CameraGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(sensor) = self.sensor.take() {
            self.arbiter.release(sensor);
        }
    }
}

/// A frame together with the camera lock. The frame is dropped first.
pub struct Captured<'a, S: FrameSource> {
    frame: S::Frame,
    _guard: CameraGuard<'a, S>,
}

impl<S: FrameSource> Captured<'_, S> {
    pub fn frame(&self) -> &S::Frame {
        &self.frame
    }

    pub fn bytes(&self) -> &[u8] {
        self.frame.as_ref()
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Barrier,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    struct CountingSensor {
        grabs: Arc<AtomicU32>,
        fail: bool,
    }

    impl CountingSensor {
        fn new() -> (Self, Arc<AtomicU32>) {
            let grabs = Arc::new(AtomicU32::new(0));
            (
                Self {
                    grabs: grabs.clone(),
                    fail: false,
                },
                grabs,
            )
        }
    }

    impl FrameSource for CountingSensor {
        type Frame = Vec<u8>;

        fn grab(&mut self) -> Result<Vec<u8>, SensorError> {
            let count = self.grabs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(SensorError::NoFrame);
            }
            Ok(vec![0xFF, 0xD8, count as u8])
        }
    }

    #[test]
    fn warm_up_discards_frames_before_capture() {
        let (sensor, grabs) = CountingSensor::new();
        let arbiter = CaptureArbiter::new(sensor).with_warmup(WarmupProfile {
            discard_frames: 3,
            ..WarmupProfile::NONE
        });

        let captured = arbiter.capture_with_warmup(CAMERA_LOCK_TIMEOUT).unwrap();

        assert_eq!(grabs.load(Ordering::SeqCst), 4);
        assert_eq!(captured.bytes(), &[0xFF, 0xD8, 4]);
    }

    #[test]
    fn held_camera_reports_busy() {
        let (sensor, _) = CountingSensor::new();
        let arbiter = CaptureArbiter::new(sensor).with_warmup(WarmupProfile::NONE);

        let held = arbiter.capture_preview(CAMERA_LOCK_TIMEOUT).unwrap();
        assert!(arbiter.is_busy());

        let attempt = arbiter.capture_preview(Duration::from_millis(20));
        assert!(matches!(attempt, Err(CaptureError::Busy(_))));

        drop(held);
        assert!(!arbiter.is_busy());
        assert!(arbiter.capture_preview(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn sensor_failure_releases_the_lock() {
        let (mut sensor, _) = CountingSensor::new();
        sensor.fail = true;
        let arbiter = CaptureArbiter::new(sensor).with_warmup(WarmupProfile::NONE);

        let result = arbiter.capture_with_warmup(CAMERA_LOCK_TIMEOUT);
        assert!(matches!(result, Err(CaptureError::Sensor(SensorError::NoFrame))));
        assert!(!arbiter.is_busy());
    }

    #[test]
    fn waiter_gets_camera_when_holder_releases() {
        let (sensor, grabs) = CountingSensor::new();
        let arbiter = Arc::new(CaptureArbiter::new(sensor).with_warmup(WarmupProfile::NONE));

        let guard = arbiter.acquire(CAMERA_LOCK_TIMEOUT).unwrap();
        let waiter = {
            let arbiter = arbiter.clone();
            thread::spawn(move || {
                arbiter
                    .capture_preview(Duration::from_secs(2))
                    .map(|captured| captured.len())
                    .is_ok()
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(guard);

        assert!(waiter.join().unwrap());
        assert_eq!(grabs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_captures_never_overlap() {
        let (sensor, grabs) = CountingSensor::new();
        let arbiter = Arc::new(CaptureArbiter::new(sensor).with_warmup(WarmupProfile {
            discard_frames: 1,
            frame_delay: Duration::from_millis(5),
            settle_delay: Duration::ZERO,
        }));

        let start = Arc::new(Barrier::new(4));
        let holders = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let arbiter = arbiter.clone();
                let start = start.clone();
                let holders = holders.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    start.wait();
                    let captured = arbiter.capture_with_warmup(Duration::from_secs(5)).unwrap();
                    let held = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(held, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    let len = captured.len();
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(captured);
                    len
                })
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.join().unwrap(), 3);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(grabs.load(Ordering::SeqCst), 8);
    }
}
