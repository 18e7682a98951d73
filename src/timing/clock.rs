use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::{PlaybackError, Result};

/// How long `stop` waits for an in-flight tick before detaching the thread.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    Stop,
}

pub type TickCallback = Arc<dyn Fn(Duration) -> TickFlow + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    Running,
    /// Stopped with the elapsed time kept for the next start.
    Paused,
}

pub trait Clock: Send {
    fn start(&mut self, on_tick: TickCallback) -> Result<()>;
    fn stop(&mut self);
    /// Stops and rewinds to zero.
    fn reset(&mut self);
    fn state(&self) -> ClockState;
    fn elapsed(&self) -> Duration;
    fn stop_signal(&self) -> StopSignal;

    fn is_running(&self) -> bool {
        self.state() == ClockState::Running
    }
}

struct Status {
    state: ClockState,
    offset: Duration,
    started_at: Option<Instant>,
    generation: u64,
    threads_alive: usize,
}

impl Status {
    fn elapsed(&self) -> Duration {
        self.offset + self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn halt(&mut self) {
        self.offset = self.elapsed();
        self.started_at = None;
        self.state = ClockState::Paused;
    }
}

struct Shared {
    status: Mutex<Status>,
    changed: Condvar,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Status {
                state: ClockState::Stopped,
                offset: Duration::ZERO,
                started_at: None,
                generation: 0,
                threads_alive: 0,
            }),
            changed: Condvar::new(),
        })
    }
}

/// Blocks callers until a clock leaves the running state.
#[derive(Clone)]
pub struct StopSignal {
    shared: Arc<Shared>,
}

impl StopSignal {
    /// Returns false if `timeout` elapsed while the clock was still running.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = self.shared.status.lock();
        while status.state == ClockState::Running {
            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                        return status.state != ClockState::Running;
                    }
                }
                None => self.shared.changed.wait(&mut status),
            }
        }
        true
    }
}

/// Periodic tick source on a dedicated thread.
///
/// Every tick reports elapsed time measured from the start instant on a
/// monotonic clock, so slow callbacks delay ticks without accumulating
/// drift. Missed slots are skipped, never replayed.
pub struct ClockDriver {
    resolution: Duration,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ClockDriver {
    pub fn new(resolution: Duration) -> Result<Self> {
        if resolution.is_zero() {
            return Err(PlaybackError::invalid_argument(
                "resolution",
                "clock resolution must be positive",
            ));
        }
        Ok(Self {
            resolution,
            shared: Shared::new(),
            thread: None,
        })
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    fn join_bounded(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }

        let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
        let mut status = self.shared.status.lock();
        while status.threads_alive > 0 {
            if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        let exited = status.threads_alive == 0;
        drop(status);

        if exited {
            let _ = handle.join();
        } else {
            warn!("clock thread did not stop within {:?}, detaching", STOP_JOIN_TIMEOUT);
        }
    }
}

impl Clock for ClockDriver {
    fn start(&mut self, on_tick: TickCallback) -> Result<()> {
        let generation = {
            let mut status = self.shared.status.lock();
            if status.state == ClockState::Running {
                return Ok(());
            }
            status.state = ClockState::Running;
            status.started_at = Some(Instant::now());
            status.generation += 1;
            status.threads_alive += 1;
            status.generation
        };

        if let Some(previous) = self.thread.take() {
            if previous.is_finished() {
                let _ = previous.join();
            }
        }

        let shared = self.shared.clone();
        let resolution = self.resolution;
        let spawned = thread::Builder::new()
            .name("notelane-clock".into())
            .spawn(move || run_clock(shared, generation, resolution, on_tick));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut status = self.shared.status.lock();
                status.halt();
                status.threads_alive -= 1;
                Err(PlaybackError::thread("clock")(e))
            }
        }
    }

    fn stop(&mut self) {
        {
            let mut status = self.shared.status.lock();
            if status.state == ClockState::Running {
                status.halt();
            }
        }
        self.shared.changed.notify_all();
        self.join_bounded();
    }

    fn reset(&mut self) {
        self.stop();
        let mut status = self.shared.status.lock();
        status.offset = Duration::ZERO;
        status.state = ClockState::Stopped;
    }

    fn state(&self) -> ClockState {
        self.shared.status.lock().state
    }

    fn elapsed(&self) -> Duration {
        self.shared.status.lock().elapsed()
    }

    fn stop_signal(&self) -> StopSignal {
        StopSignal {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for ClockDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_clock(shared: Arc<Shared>, generation: u64, resolution: Duration, on_tick: TickCallback) {
    let started = Instant::now();
    let step = resolution.as_nanos();

    loop {
        let elapsed = {
            let status = shared.status.lock();
            if status.state != ClockState::Running || status.generation != generation {
                break;
            }
            status.elapsed()
        };

        if on_tick(elapsed) == TickFlow::Stop {
            let mut status = shared.status.lock();
            if status.state == ClockState::Running && status.generation == generation {
                status.halt();
            }
            trace!(?elapsed, "clock stopped by its tick callback");
            break;
        }

        let since = started.elapsed().as_nanos();
        let next_slot = since / step + 1;
        let deadline = started + Duration::from_nanos((next_slot * step) as u64);

        let mut status = shared.status.lock();
        while status.state == ClockState::Running
            && status.generation == generation
            && Instant::now() < deadline
        {
            shared.changed.wait_until(&mut status, deadline);
        }
    }

    shared.status.lock().threads_alive -= 1;
    shared.changed.notify_all();
}

/// Clock advanced by hand, for simulations and tests.
pub struct ManualClock {
    shared: Arc<Shared>,
    callback: Arc<Mutex<Option<TickCallback>>>,
}

/// Drives a [`ManualClock`] after it has been handed to an engine.
#[derive(Clone)]
pub struct ManualClockHandle {
    shared: Arc<Shared>,
    callback: Arc<Mutex<Option<TickCallback>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> ManualClockHandle {
        ManualClockHandle {
            shared: self.shared.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClockHandle {
    /// Moves the clock to `elapsed` and, if running, fires one tick.
    /// Returns whether a tick was delivered.
    pub fn tick(&self, elapsed: Duration) -> bool {
        {
            let mut status = self.shared.status.lock();
            status.offset = status.offset.max(elapsed);
            if status.state != ClockState::Running {
                return false;
            }
        }

        let Some(callback) = self.callback.lock().clone() else {
            return false;
        };
        let elapsed = self.shared.status.lock().offset;
        if callback(elapsed) == TickFlow::Stop {
            self.shared.status.lock().state = ClockState::Paused;
            self.shared.changed.notify_all();
        }
        true
    }
}

impl Clock for ManualClock {
    fn start(&mut self, on_tick: TickCallback) -> Result<()> {
        *self.callback.lock() = Some(on_tick);
        self.shared.status.lock().state = ClockState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        {
            let mut status = self.shared.status.lock();
            if status.state == ClockState::Running {
                status.state = ClockState::Paused;
            }
        }
        self.shared.changed.notify_all();
    }

    fn reset(&mut self) {
        self.stop();
        let mut status = self.shared.status.lock();
        status.offset = Duration::ZERO;
        status.state = ClockState::Stopped;
    }

    fn state(&self) -> ClockState {
        self.shared.status.lock().state
    }

    fn elapsed(&self) -> Duration {
        self.shared.status.lock().offset
    }

    fn stop_signal(&self) -> StopSignal {
        StopSignal {
            shared: self.shared.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn zero_resolution_is_rejected() {
        assert!(matches!(
            ClockDriver::new(Duration::ZERO),
            Err(PlaybackError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn driver_ticks_until_stopped_and_resumes_from_elapsed() {
        let mut clock = ClockDriver::new(Duration::from_millis(1)).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(Duration::ZERO));

        let callback: TickCallback = {
            let ticks = ticks.clone();
            let last = last.clone();
            Arc::new(move |elapsed| {
                let mut last = last.lock();
                assert!(elapsed >= *last);
                *last = elapsed;
                ticks.fetch_add(1, Ordering::SeqCst);
                TickFlow::Continue
            })
        };

        clock.start(callback.clone()).unwrap();
        thread::sleep(Duration::from_millis(30));
        clock.stop();

        assert_eq!(clock.state(), ClockState::Paused);
        assert!(ticks.load(Ordering::SeqCst) > 0);
        let paused_at = clock.elapsed();
        assert!(paused_at >= Duration::from_millis(20));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.elapsed(), paused_at);

        clock.start(callback).unwrap();
        thread::sleep(Duration::from_millis(10));
        clock.stop();
        assert!(clock.elapsed() > paused_at);

        clock.reset();
        assert_eq!(clock.state(), ClockState::Stopped);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn callback_can_stop_the_driver() {
        let mut clock = ClockDriver::new(Duration::from_millis(1)).unwrap();
        let signal = clock.stop_signal();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        clock
            .start(Arc::new(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) >= 4 {
                    TickFlow::Stop
                } else {
                    TickFlow::Continue
                }
            }))
            .unwrap();

        assert!(signal.wait(Some(Duration::from_secs(5))));
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
        assert!(!clock.is_running());
    }

    #[test]
    fn manual_clock_only_ticks_while_running() {
        let mut clock = ManualClock::new();
        let handle = clock.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));

        assert!(!handle.tick(Duration::from_millis(5)));

        let record = seen.clone();
        clock
            .start(Arc::new(move |elapsed| {
                record.lock().push(elapsed);
                TickFlow::Continue
            }))
            .unwrap();
        assert!(handle.tick(Duration::from_millis(10)));
        clock.stop();
        assert!(!handle.tick(Duration::from_millis(20)));

        assert_eq!(*seen.lock(), vec![Duration::from_millis(10)]);
        assert_eq!(clock.elapsed(), Duration::from_millis(20));
    }
}
