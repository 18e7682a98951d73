use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::timing::{PlaybackEventId, PlaybackTimeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    key: u8,
    opens_at: Duration,
}

/// Selected-channel note-ons waiting for the player.
///
/// A note is judgable from `opens_at` for `active_duration`. Accepting a mark
/// sets the event's flag, which the scheduler reads when the note comes due.
#[derive(Debug)]
pub struct JudgementTracker {
    active_duration: Duration,
    pending: Mutex<BTreeMap<PlaybackEventId, Pending>>,
}

impl JudgementTracker {
    pub fn new(active_duration: Duration) -> Self {
        Self {
            active_duration,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn active_duration(&self) -> Duration {
        self.active_duration
    }

    pub fn register(&self, id: PlaybackEventId, key: u8, opens_at: Duration) {
        self.pending.lock().insert(id, Pending { key, opens_at });
    }

    pub fn is_pending(&self, id: PlaybackEventId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Accepts the mark iff `id` is pending and `now` falls inside its
    /// window. Accepted events leave the pending set.
    pub fn mark_at(&self, id: PlaybackEventId, now: Duration, timeline: &PlaybackTimeline) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get(&id).copied() else {
            return false;
        };
        if !self.window_contains(entry, now) {
            return false;
        }
        pending.remove(&id);
        // Marked before the lock is released so `retire` never sees a
        // removed but unmarked event.
        let accepted = timeline.event(id).is_some_and(|e| e.set_marked());
        drop(pending);

        debug!(id = id.0, ?now, accepted, "mark");
        accepted
    }

    /// Marks every pending note on `key` whose window contains `now`.
    pub fn mark_lane(
        &self,
        key: u8,
        now: Duration,
        timeline: &PlaybackTimeline,
    ) -> Vec<PlaybackEventId> {
        let mut pending = self.pending.lock();
        let hits: Vec<PlaybackEventId> = pending
            .iter()
            .filter(|(_, entry)| entry.key == key && self.window_contains(**entry, now))
            .map(|(id, _)| *id)
            .collect();
        for id in &hits {
            pending.remove(id);
        }
        hits.into_iter()
            .filter(|id| timeline.event(*id).is_some_and(|e| e.set_marked()))
            .collect()
    }

    /// Drops `id` from the pending set once it has been dispatched.
    pub fn retire(&self, id: PlaybackEventId) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    fn window_contains(&self, entry: Pending, now: Duration) -> bool {
        entry.opens_at <= now && now <= entry.opens_at + self.active_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{Note, PlaybackEvent, TempoMap, TieBreak, TimedObject};

    const EPSILON: Duration = Duration::from_millis(1);

    fn timeline() -> PlaybackTimeline {
        PlaybackTimeline::build(
            vec![
                TimedObject::Note(Note::new(0, 60, 0, 480)),
                TimedObject::Note(Note::new(0, 60, 960, 480)),
                TimedObject::Note(Note::new(0, 62, 960, 480)),
            ],
            TempoMap::with_tempo(480, 500_000).unwrap(),
            TieBreak::default(),
        )
    }

    fn note_on(timeline: &PlaybackTimeline, key: u8, time: u64) -> PlaybackEventId {
        timeline
            .events()
            .iter()
            .find(|e| {
                e.event().is_note_on()
                    && e.raw_time() == time
                    && e.event().note_id().map(|n| n.key) == Some(key)
            })
            .map(|e| e.id())
            .unwrap()
    }

    #[test]
    fn window_edges() {
        let timeline = timeline();
        let id = note_on(&timeline, 60, 0);
        let duration = Duration::from_secs(3);
        let start = Duration::from_secs(10);

        let tracker = JudgementTracker::new(duration);
        tracker.register(id, 60, start);
        assert!(!tracker.mark_at(id, start + duration + EPSILON, &timeline));
        assert!(!tracker.mark_at(id, start - EPSILON, &timeline));
        assert!(!timeline.event(id).unwrap().is_marked());

        assert!(tracker.mark_at(id, start + duration - EPSILON, &timeline));
        assert!(timeline.event(id).unwrap().is_marked());
    }

    #[test]
    fn second_mark_and_unknown_events_are_rejected() {
        let timeline = timeline();
        let id = note_on(&timeline, 60, 0);
        let tracker = JudgementTracker::new(Duration::from_secs(1));

        assert!(!tracker.mark_at(id, Duration::ZERO, &timeline));

        tracker.register(id, 60, Duration::ZERO);
        assert!(tracker.mark_at(id, Duration::from_millis(500), &timeline));
        assert!(!tracker.mark_at(id, Duration::from_millis(600), &timeline));
        assert!(!tracker.is_pending(id));
    }

    #[test]
    fn retired_events_cannot_be_marked() {
        let timeline = timeline();
        let id = note_on(&timeline, 60, 0);
        let tracker = JudgementTracker::new(Duration::from_secs(1));

        tracker.register(id, 60, Duration::ZERO);
        assert!(tracker.retire(id));
        assert!(!tracker.mark_at(id, Duration::from_millis(10), &timeline));
    }

    #[test]
    fn lane_marks_only_open_notes_on_that_key() {
        let timeline = timeline();
        let early = note_on(&timeline, 60, 0);
        let late = note_on(&timeline, 60, 960);
        let other_key = note_on(&timeline, 62, 960);
        let tracker = JudgementTracker::new(Duration::from_secs(1));

        tracker.register(early, 60, Duration::ZERO);
        tracker.register(late, 60, Duration::from_secs(5));
        tracker.register(other_key, 62, Duration::ZERO);

        assert_eq!(tracker.mark_lane(60, Duration::from_millis(200), &timeline), vec![early]);
        assert!(tracker.is_pending(late));
        assert!(tracker.is_pending(other_key));
        assert!(tracker.mark_lane(60, Duration::from_millis(300), &timeline).is_empty());
    }

    #[test]
    fn accepted_marks_are_visible_to_the_dispatcher() {
        let timeline = timeline();
        let id = note_on(&timeline, 60, 0);
        let tracker = JudgementTracker::new(Duration::from_secs(1));

        for _ in 0..500 {
            timeline.clear_marks();
            tracker.register(id, 60, Duration::ZERO);
            let (accepted, seen_marked) = std::thread::scope(|s| {
                let marker = s.spawn(|| {
                    !tracker
                        .mark_lane(60, Duration::from_millis(10), &timeline)
                        .is_empty()
                });
                let dispatcher = s.spawn(|| {
                    tracker.retire(id);
                    timeline.event(id).is_some_and(PlaybackEvent::is_marked)
                });
                (marker.join().unwrap(), dispatcher.join().unwrap())
            });
            assert_eq!(accepted, seen_marked);
        }
    }
}
