use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{PlaybackError, Result};
use crate::timing::PlaybackEventId;

const LANES: usize = 128;

/// Selected-channel notes on their way to the player, one lane per pitch.
#[derive(Debug)]
pub struct NotesOnDisplay {
    lanes: Mutex<Vec<Vec<PlaybackEventId>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneSnapshot {
    pub key: u8,
    pub events: Vec<PlaybackEventId>,
}

impl Default for NotesOnDisplay {
    fn default() -> Self {
        Self {
            lanes: Mutex::new(vec![Vec::new(); LANES]),
        }
    }
}

impl NotesOnDisplay {
    pub fn push(&self, key: u8, id: PlaybackEventId) {
        if let Some(lane) = self.lanes.lock().get_mut(usize::from(key)) {
            lane.push(id);
        }
    }

    pub fn remove(&self, key: u8, id: PlaybackEventId) -> bool {
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(usize::from(key)) else {
            return false;
        };
        match lane.iter().position(|e| *e == id) {
            Some(idx) => {
                lane.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        for lane in self.lanes.lock().iter_mut() {
            lane.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-empty lanes, copied out so readers never hold the lock.
    pub fn snapshot(&self) -> Vec<LaneSnapshot> {
        self.lanes
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, lane)| !lane.is_empty())
            .map(|(key, lane)| LaneSnapshot {
                key: key as u8,
                events: lane.clone(),
            })
            .collect()
    }
}

/// Background reader that hands display snapshots to a renderer.
pub struct DisplayPoller {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DisplayPoller {
    pub fn spawn(
        board: Arc<NotesOnDisplay>,
        interval: Duration,
        mut on_frame: impl FnMut(Vec<LaneSnapshot>) + Send + 'static,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(PlaybackError::invalid_argument(
                "interval",
                "display poll interval must be positive",
            ));
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("notelane-display".into())
            .spawn(move || {
                loop {
                    on_frame(board.snapshot());
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                trace!("display poller exited");
            })
            .map_err(PlaybackError::thread("display poller"))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DisplayPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn remove_only_takes_the_given_event() {
        let board = NotesOnDisplay::default();
        board.push(60, PlaybackEventId(1));
        board.push(60, PlaybackEventId(4));
        board.push(64, PlaybackEventId(2));

        assert!(board.remove(60, PlaybackEventId(1)));
        assert!(!board.remove(60, PlaybackEventId(1)));
        assert_eq!(
            board.snapshot(),
            vec![
                LaneSnapshot {
                    key: 60,
                    events: vec![PlaybackEventId(4)]
                },
                LaneSnapshot {
                    key: 64,
                    events: vec![PlaybackEventId(2)]
                },
            ]
        );

        board.clear();
        assert!(board.is_empty());
    }

    #[test]
    fn poller_delivers_frames_until_stopped() {
        let board = Arc::new(NotesOnDisplay::default());
        board.push(70, PlaybackEventId(9));
        let (tx, rx) = unbounded();

        let mut poller = DisplayPoller::spawn(board, Duration::from_millis(5), move |frame| {
            let _ = tx.send(frame);
        })
        .unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame[0].key, 70);
        poller.stop();

        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
