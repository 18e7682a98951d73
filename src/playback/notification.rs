use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::timing::{Note, PlaybackEventId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackNotification {
    Started,
    Stopped,
    Finished,
    NotesPlaybackStarted(Vec<Note>),
    NotesPlaybackFinished(Vec<Note>),
    NotesDisplayStarted(PlaybackEventId),
    NotesDisplayFinished(PlaybackEventId),
    /// A note on the player's channel came due.
    SelectedTrack { played: bool, label: String },
    Error { message: String },
}

/// Fans notifications out to every live subscriber without blocking.
#[derive(Default)]
pub struct Observers {
    senders: Mutex<Vec<Sender<PlaybackNotification>>>,
}

impl Observers {
    pub fn subscribe(&self) -> Receiver<PlaybackNotification> {
        let (tx, rx) = unbounded();
        self.senders.lock().push(tx);
        rx
    }

    pub fn notify(&self, notification: PlaybackNotification) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Drops every sender so subscribers see a disconnect.
    pub fn close(&self) {
        self.senders.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let observers = Observers::default();
        let kept = observers.subscribe();
        let dropped = observers.subscribe();
        drop(dropped);

        observers.notify(PlaybackNotification::Started);
        assert_eq!(observers.senders.lock().len(), 1);
        assert_eq!(kept.try_recv().unwrap(), PlaybackNotification::Started);

        observers.close();
        assert!(kept.recv().is_err());
    }
}
