use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::active_notes::ActiveNoteSet;
use super::display::NotesOnDisplay;
use super::judgement::JudgementTracker;
use super::notification::{Observers, PlaybackNotification};
use crate::events::{MidiEvent, NoteId};
use crate::output::OutputSink;
use crate::session::{Session, SessionState};
use crate::settings::PlaybackSettings;
use crate::timing::{Note, NotePlaybackMetadata, PlaybackEvent, PlaybackTimeline, TickFlow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Running,
    Finished,
    Disposed,
}

/// Shared handles the scheduler writes to and the engine reads from.
#[derive(Clone)]
pub(crate) struct SchedulerParts {
    pub timeline: Arc<PlaybackTimeline>,
    pub session: Arc<Session>,
    pub active: Arc<Mutex<ActiveNoteSet>>,
    pub judgement: Arc<JudgementTracker>,
    pub display: Arc<NotesOnDisplay>,
    pub observers: Arc<Observers>,
}

/// Per-tick dispatch state. Lock order is scheduler first, then the active
/// note set.
pub(crate) struct Scheduler {
    parts: SchedulerParts,
    settings: PlaybackSettings,
    sink: Box<dyn OutputSink>,
    state: PlaybackState,
    display_cursor: usize,
    sound_cursor: usize,
    last_tick: Duration,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts, settings: PlaybackSettings, sink: Box<dyn OutputSink>) -> Self {
        Self {
            parts,
            settings,
            sink,
            state: PlaybackState::Idle,
            display_cursor: 0,
            sound_cursor: 0,
            last_tick: Duration::ZERO,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn set_state(&mut self, state: PlaybackState) {
        self.state = state;
    }

    pub fn last_tick(&self) -> Duration {
        self.last_tick
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.settings
    }

    pub fn replace_sink(&mut self, sink: Box<dyn OutputSink>) {
        self.sink = sink;
    }

    pub fn prepare_sink(&mut self) {
        self.sink.prepare();
    }

    pub fn tick(&mut self, now: Duration) -> TickFlow {
        if self.state != PlaybackState::Running {
            return TickFlow::Stop;
        }
        self.last_tick = now;
        let session = self.parts.session.snapshot();

        if self.settings.track_notes {
            self.resync(now, &session);
        }
        self.display_pass(now, &session);
        self.sound_pass(now, &session);

        if self.is_exhausted() {
            self.state = PlaybackState::Finished;
            info!(elapsed = ?now, "playback finished");
            self.parts.observers.notify(PlaybackNotification::Finished);
            return TickFlow::Stop;
        }
        TickFlow::Continue
    }

    fn is_exhausted(&self) -> bool {
        let len = self.parts.timeline.len();
        self.display_cursor >= len && self.sound_cursor >= len
    }

    /// Makes the active set equal to the notes sounding at `now`.
    pub fn resync(&mut self, now: Duration, session: &SessionState) {
        let desired: HashMap<NoteId, Note> = self
            .parts
            .timeline
            .notes_metadata()
            .iter()
            .take_while(|m| m.start <= now)
            .filter(|m| now < m.end && self.audible(m, session))
            .map(|m| (m.note.id(), m.note.clone()))
            .collect();

        let diff = self.parts.active.lock().diff(&desired);
        if diff.is_empty() {
            return;
        }
        trace!(
            starting = diff.to_start.len(),
            stopping = diff.to_stop.len(),
            ?now,
            "resync"
        );

        for note in &diff.to_stop {
            self.send(&note.note_off());
            self.parts.active.lock().remove(&note.id());
        }
        if !diff.to_stop.is_empty() {
            self.parts
                .observers
                .notify(PlaybackNotification::NotesPlaybackFinished(diff.to_stop));
        }

        for note in &diff.to_start {
            self.send(&note.note_on());
            self.parts.active.lock().insert(note.clone());
        }
        if !diff.to_start.is_empty() {
            self.parts
                .observers
                .notify(PlaybackNotification::NotesPlaybackStarted(diff.to_start));
        }
    }

    fn audible(&self, metadata: &NotePlaybackMetadata, session: &SessionState) -> bool {
        let channel = Some(metadata.note.channel);
        if session.is_deactivated(channel) {
            return false;
        }
        if session.is_selected(channel) {
            return self
                .parts
                .timeline
                .event(metadata.on_event)
                .is_some_and(PlaybackEvent::is_marked);
        }
        session.mode.plays_other_channels()
    }

    fn is_stale(&self, event: &PlaybackEvent, now: Duration) -> bool {
        event.time() + self.settings.sound_window() < now
    }

    fn display_pass(&mut self, now: Duration, session: &SessionState) {
        let timeline = self.parts.timeline.clone();
        let horizon = now + self.settings.lookahead_slack();
        let events = timeline.events();

        while let Some(event) = events.get(self.display_cursor) {
            if event.time() > horizon {
                break;
            }
            self.display_cursor += 1;

            let channel = event.event().channel();
            if !session.is_selected(channel) || session.is_deactivated(channel) {
                continue;
            }
            match *event.event() {
                MidiEvent::NoteOn { key, .. } => {
                    if self.is_stale(event, now) {
                        continue;
                    }
                    self.parts.display.push(key, event.id());
                    let opens_at = event
                        .time()
                        .saturating_sub(self.parts.judgement.active_duration());
                    self.parts.judgement.register(event.id(), key, opens_at);
                    self.parts
                        .observers
                        .notify(PlaybackNotification::NotesDisplayStarted(event.id()));
                }
                MidiEvent::NoteOff { key, .. } => {
                    if let Some(on) = event.partner()
                        && self.parts.display.remove(key, on)
                    {
                        self.parts
                            .observers
                            .notify(PlaybackNotification::NotesDisplayFinished(on));
                    }
                }
                _ => {}
            }
        }
    }

    fn sound_pass(&mut self, now: Duration, session: &SessionState) {
        let timeline = self.parts.timeline.clone();
        let events = timeline.events();

        while let Some(event) = events.get(self.sound_cursor) {
            if event.time() > now {
                break;
            }
            self.sound_cursor += 1;
            self.dispatch(event, now, session);
        }
    }

    fn dispatch(&mut self, event: &PlaybackEvent, now: Duration, session: &SessionState) {
        let channel = event.event().channel();

        if let MidiEvent::NoteOff { .. } = event.event() {
            if let Some(metadata) = event.metadata() {
                self.stop_note(&metadata.note);
            }
            return;
        }

        let stale = self.is_stale(event, now);
        let deactivated = session.is_deactivated(channel);
        let selected = session.is_selected(channel);

        match event.event() {
            MidiEvent::NoteOn { .. } => {
                if selected {
                    self.parts.judgement.retire(event.id());
                }
                if stale || deactivated {
                    trace!(id = event.id().0, stale, deactivated, "skipped note");
                    return;
                }
                let Some(metadata) = event.metadata() else {
                    return;
                };
                // Notes that ended before this tick are not replayed.
                let over = metadata.end < now;
                if selected {
                    let played = event.is_marked();
                    debug!(id = event.id().0, played, "selected note due");
                    self.parts
                        .observers
                        .notify(PlaybackNotification::SelectedTrack {
                            played,
                            label: event.event().to_string(),
                        });
                    if played && !over {
                        self.start_note(&metadata.note);
                    }
                } else if !over && session.mode.plays_other_channels() {
                    self.start_note(&metadata.note);
                }
            }
            other => {
                if stale || deactivated {
                    return;
                }
                if channel.is_none() || selected || session.mode.plays_other_channels() {
                    self.send(other);
                }
            }
        }
    }

    fn start_note(&mut self, note: &Note) {
        let previous = {
            let active = self.parts.active.lock();
            if active.contains(note) {
                return;
            }
            active.get(&note.id()).cloned()
        };
        if let Some(previous) = previous {
            self.stop_note(&previous);
        }

        self.send(&note.note_on());
        // Tracked even if the device refused it, so the next resync does not
        // retry every tick.
        self.parts.active.lock().insert(note.clone());
        self.parts
            .observers
            .notify(PlaybackNotification::NotesPlaybackStarted(vec![note.clone()]));
    }

    fn stop_note(&mut self, note: &Note) {
        let removed = {
            let mut active = self.parts.active.lock();
            if !active.contains(note) {
                return;
            }
            active.remove(&note.id())
        };
        if let Some(removed) = removed {
            self.send(&removed.note_off());
            self.parts
                .observers
                .notify(PlaybackNotification::NotesPlaybackFinished(vec![removed]));
        }
    }

    /// Sends a note-off for everything still sounding.
    pub fn flush_active_notes(&mut self) {
        let notes = self.parts.active.lock().drain();
        if notes.is_empty() {
            return;
        }
        debug!(count = notes.len(), "flushing active notes");
        for note in &notes {
            self.send(&note.note_off());
        }
        self.parts
            .observers
            .notify(PlaybackNotification::NotesPlaybackFinished(notes));
    }

    /// Back to the start of the timeline with nothing sounding or pending.
    pub fn rewind(&mut self) {
        self.flush_active_notes();
        self.display_cursor = 0;
        self.sound_cursor = 0;
        self.last_tick = Duration::ZERO;
        self.parts.display.clear();
        self.parts.judgement.clear();
        self.parts.timeline.clear_marks();
        if self.state == PlaybackState::Finished {
            self.state = PlaybackState::Idle;
        }
    }

    fn send(&mut self, event: &MidiEvent) {
        if let Err(e) = self.sink.send_event(event) {
            warn!(%event, error = %e, "output rejected event");
            self.parts.observers.notify(PlaybackNotification::Error {
                message: format!("failed to send {event}: {e}"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::testing::RecordingSink;
    use crate::session::GameMode;
    use crate::timing::{TempoMap, TieBreak, TimedObject};
    use crossbeam::channel::Receiver;

    struct Fixture {
        scheduler: Scheduler,
        sink: RecordingSink,
        parts: SchedulerParts,
        rx: Receiver<PlaybackNotification>,
    }

    fn fixture(notes: Vec<Note>, session: SessionState) -> Fixture {
        let timeline = PlaybackTimeline::build(
            notes.into_iter().map(TimedObject::Note),
            TempoMap::with_tempo(480, 500_000).unwrap(),
            TieBreak::default(),
        );
        let settings = PlaybackSettings::default();
        let parts = SchedulerParts {
            timeline: Arc::new(timeline),
            session: Arc::new(Session::new(session)),
            active: Arc::new(Mutex::new(ActiveNoteSet::new())),
            judgement: Arc::new(JudgementTracker::new(settings.active_duration.duration())),
            display: Arc::new(NotesOnDisplay::default()),
            observers: Arc::new(Observers::default()),
        };
        let rx = parts.observers.subscribe();
        let sink = RecordingSink::default();
        let mut scheduler = Scheduler::new(parts.clone(), settings, Box::new(sink.clone()));
        scheduler.set_state(PlaybackState::Running);
        Fixture {
            scheduler,
            sink,
            parts,
            rx,
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn selected_notes_are_displayed_ahead_and_judged() {
        let session = SessionState {
            selected_channel: Some(0),
            ..SessionState::default()
        };
        let mut f = fixture(vec![Note::new(0, 60, 4800, 480)], session);

        f.scheduler.tick(ms(0));
        let on = f.parts.timeline.events()[0].id();
        assert_eq!(f.parts.display.snapshot()[0].events, vec![on]);
        assert!(f.parts.judgement.is_pending(on));
        assert!(f.sink.events().is_empty());

        // Judgable from 5 s - 3 s.
        assert!(f.parts.judgement.mark_at(on, ms(2500), &f.parts.timeline));

        f.scheduler.tick(ms(5000));
        assert_eq!(f.sink.events(), vec![Note::new(0, 60, 4800, 480).note_on()]);
        assert!(!f.parts.judgement.is_pending(on));

        let notifications: Vec<_> = f.rx.try_iter().collect();
        assert!(notifications.contains(&PlaybackNotification::NotesDisplayStarted(on)));
        assert!(notifications.iter().any(|n| matches!(
            n,
            PlaybackNotification::SelectedTrack { played: true, .. }
        )));
        assert!(notifications.contains(&PlaybackNotification::NotesDisplayFinished(on)));
    }

    #[test]
    fn unmarked_selected_note_is_reported_missed_and_silent() {
        let session = SessionState {
            selected_channel: Some(0),
            ..SessionState::default()
        };
        let mut f = fixture(vec![Note::new(0, 60, 0, 480)], session);

        f.scheduler.tick(ms(0));
        f.scheduler.tick(ms(600));

        assert!(f.sink.events().is_empty());
        assert!(f.rx.try_iter().any(|n| matches!(
            n,
            PlaybackNotification::SelectedTrack { played: false, .. }
        )));
        assert_eq!(f.scheduler.state(), PlaybackState::Finished);
    }

    #[test]
    fn deactivated_and_remote_channels_stay_silent() {
        let session = SessionState {
            selected_channel: Some(0),
            deactivated_channels: [1].into_iter().collect(),
            mode: GameMode::Online { conductor: false },
        };
        let mut f = fixture(
            vec![Note::new(1, 60, 0, 480), Note::new(2, 62, 0, 480)],
            session,
        );

        f.scheduler.tick(ms(100));
        assert!(f.sink.events().is_empty());
        assert!(f.parts.active.lock().is_empty());
    }

    #[test]
    fn stale_note_ons_are_skipped_but_resync_restores_sounding_notes() {
        let mut f = fixture(vec![Note::new(0, 60, 0, 48_000)], SessionState::default());
        f.scheduler.settings.track_notes = false;

        f.scheduler.tick(ms(6000));
        assert!(f.sink.events().is_empty());

        f.scheduler.settings.track_notes = true;
        f.scheduler.tick(ms(6001));
        assert_eq!(f.sink.events(), vec![Note::new(0, 60, 0, 48_000).note_on()]);
    }

    #[test]
    fn retrigger_releases_before_striking() {
        let first = Note::new(0, 60, 0, 960);
        let second = Note::new(0, 60, 480, 960);
        let mut f = fixture(vec![first.clone(), second.clone()], SessionState::default());

        f.scheduler.tick(ms(0));
        f.scheduler.tick(ms(500));

        assert_eq!(
            f.sink.events(),
            vec![first.note_on(), first.note_off(), second.note_on()]
        );
        assert_eq!(f.parts.active.lock().snapshot(), vec![second]);
    }

    #[test]
    fn failing_output_is_reported_and_does_not_halt_playback() {
        let mut f = fixture(vec![Note::new(0, 60, 0, 480)], SessionState::default());
        let failing = RecordingSink {
            fail_note_on: true,
            ..RecordingSink::default()
        };
        f.scheduler.replace_sink(Box::new(failing.clone()));

        assert_eq!(f.scheduler.tick(ms(0)), TickFlow::Continue);
        assert_eq!(f.scheduler.tick(ms(500)), TickFlow::Stop);

        assert!(f
            .rx
            .try_iter()
            .any(|n| matches!(n, PlaybackNotification::Error { .. })));
        assert_eq!(failing.events(), vec![Note::new(0, 60, 0, 480).note_off()]);
    }

    #[test]
    fn rewind_clears_progress() {
        let mut f = fixture(vec![Note::new(0, 60, 0, 960)], SessionState::default());
        f.scheduler.tick(ms(100));
        f.parts.timeline.events()[0].set_marked();

        f.scheduler.rewind();
        assert!(f.parts.active.lock().is_empty());
        assert!(!f.parts.timeline.events()[0].is_marked());
        assert_eq!(f.scheduler.last_tick(), Duration::ZERO);
        assert_eq!(f.sink.events().last(), Some(&Note::new(0, 60, 0, 960).note_off()));
    }
}
