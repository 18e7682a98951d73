use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::sequence::{Note, TimedObject};
use super::tempo::TempoMap;
use crate::events::MidiEvent;

/// Position of an event in its timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackEventId(pub usize);

/// Ordering of events that share a tick.
///
/// The order of simultaneous events is musically ambiguous and no file
/// format defines it. `NonNoteFirst` lets program and controller changes
/// land before the notes they affect; it is a policy, not a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    #[default]
    NonNoteFirst,
    NoteFirst,
}

impl TieBreak {
    fn rank(self, event: &MidiEvent) -> u8 {
        match (self, event.is_note()) {
            (TieBreak::NonNoteFirst, false) | (TieBreak::NoteFirst, true) => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotePlaybackMetadata {
    pub note: Note,
    pub start: Duration,
    pub end: Duration,
    pub on_event: PlaybackEventId,
    pub off_event: PlaybackEventId,
}

#[derive(Debug)]
pub struct PlaybackEvent {
    id: PlaybackEventId,
    event: MidiEvent,
    time: Duration,
    raw_time: u64,
    marked: AtomicBool,
    related: RwLock<Vec<PlaybackEventId>>,
    partner: Option<PlaybackEventId>,
    metadata: Option<Arc<NotePlaybackMetadata>>,
}

impl PlaybackEvent {
    pub fn id(&self) -> PlaybackEventId {
        self.id
    }

    pub fn event(&self) -> &MidiEvent {
        &self.event
    }

    pub fn time(&self) -> Duration {
        self.time
    }

    pub fn raw_time(&self) -> u64 {
        self.raw_time
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    /// Returns true if this call flipped the flag.
    pub(crate) fn set_marked(&self) -> bool {
        !self.marked.swap(true, Ordering::AcqRel)
    }

    pub fn related(&self) -> Vec<PlaybackEventId> {
        self.related.read().clone()
    }

    /// The other half of the note this event was built from.
    pub fn partner(&self) -> Option<PlaybackEventId> {
        self.partner
    }

    pub fn metadata(&self) -> Option<&Arc<NotePlaybackMetadata>> {
        self.metadata.as_ref()
    }
}

struct Draft {
    event: MidiEvent,
    raw_time: u64,
    note: Option<usize>,
}

/// Sorted, immutable schedule of everything a song will send.
#[derive(Debug)]
pub struct PlaybackTimeline {
    events: Vec<PlaybackEvent>,
    notes_metadata: Vec<Arc<NotePlaybackMetadata>>,
    tempo_map: TempoMap,
}

impl PlaybackTimeline {
    pub fn build(
        objects: impl IntoIterator<Item = TimedObject>,
        tempo_map: TempoMap,
        tie_break: TieBreak,
    ) -> Self {
        let mut drafts: Vec<Draft> = Vec::new();
        let mut notes: Vec<Note> = Vec::new();

        let mut push_note = |note: Note, drafts: &mut Vec<Draft>| {
            let serial = notes.len();
            drafts.push(Draft {
                event: note.note_on(),
                raw_time: note.time,
                note: Some(serial),
            });
            drafts.push(Draft {
                event: note.note_off(),
                raw_time: note.end(),
                note: Some(serial),
            });
            notes.push(note);
        };

        for object in objects {
            match object {
                TimedObject::Chord(chord) => {
                    for note in chord.into_notes() {
                        push_note(note, &mut drafts);
                    }
                }
                TimedObject::Note(note) => push_note(note, &mut drafts),
                TimedObject::Event(timed) => drafts.push(Draft {
                    event: timed.event,
                    raw_time: timed.time,
                    note: None,
                }),
            }
        }

        drafts.sort_by_key(|d| (d.raw_time, tie_break.rank(&d.event)));

        let mut positions: Vec<(Option<usize>, Option<usize>)> = vec![(None, None); notes.len()];
        for (idx, draft) in drafts.iter().enumerate() {
            if let Some(serial) = draft.note {
                if draft.event.is_note_on() {
                    positions[serial].0 = Some(idx);
                } else {
                    positions[serial].1 = Some(idx);
                }
            }
        }

        let by_serial: Vec<Option<Arc<NotePlaybackMetadata>>> = notes
            .into_iter()
            .zip(positions.iter())
            .map(|(note, position)| match *position {
                (Some(on), Some(off)) => Some(Arc::new(NotePlaybackMetadata {
                    start: tempo_map.ticks_to_wall_time(note.time),
                    end: tempo_map.ticks_to_wall_time(note.end()),
                    note,
                    on_event: PlaybackEventId(on),
                    off_event: PlaybackEventId(off),
                })),
                _ => None,
            })
            .collect();

        let events: Vec<PlaybackEvent> = drafts
            .into_iter()
            .enumerate()
            .map(|(idx, draft)| {
                let metadata = draft.note.and_then(|serial| by_serial[serial].clone());
                let partner = metadata.as_ref().map(|m| {
                    if m.on_event.0 == idx {
                        m.off_event
                    } else {
                        m.on_event
                    }
                });
                PlaybackEvent {
                    id: PlaybackEventId(idx),
                    time: tempo_map.ticks_to_wall_time(draft.raw_time),
                    raw_time: draft.raw_time,
                    event: draft.event,
                    marked: AtomicBool::new(false),
                    related: RwLock::new(Vec::new()),
                    partner,
                    metadata,
                }
            })
            .collect();

        let mut notes_metadata: Vec<Arc<NotePlaybackMetadata>> =
            by_serial.into_iter().flatten().collect();
        notes_metadata.sort_by_key(|m| m.start);

        Self {
            events,
            notes_metadata,
            tempo_map,
        }
    }

    pub fn events(&self) -> &[PlaybackEvent] {
        &self.events
    }

    pub fn event(&self, id: PlaybackEventId) -> Option<&PlaybackEvent> {
        self.events.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// One entry per note, sorted by start time.
    pub fn notes_metadata(&self) -> &[Arc<NotePlaybackMetadata>] {
        &self.notes_metadata
    }

    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo_map
    }

    pub fn duration(&self) -> Duration {
        self.events.last().map_or(Duration::ZERO, |e| e.time)
    }

    /// Links every note-on of `channel` to the next note-on or note-off of
    /// the same key on that channel. Other events lose their links.
    pub fn link_related_events(&self, channel: Option<u8>) {
        let mut waiting: HashMap<u8, Vec<PlaybackEventId>> = HashMap::new();
        let mut links: HashMap<PlaybackEventId, PlaybackEventId> = HashMap::new();

        if let Some(channel) = channel {
            for event in &self.events {
                let (key, is_on) = match event.event {
                    MidiEvent::NoteOn { channel: c, key, .. } if c == channel => (key, true),
                    MidiEvent::NoteOff { channel: c, key, .. } if c == channel => (key, false),
                    _ => continue,
                };
                for pending in waiting.remove(&key).unwrap_or_default() {
                    links.insert(pending, event.id);
                }
                if is_on {
                    waiting.entry(key).or_default().push(event.id);
                }
            }
        }

        for event in &self.events {
            let mut related = event.related.write();
            related.clear();
            if let Some(next) = links.get(&event.id) {
                related.push(*next);
            }
        }
    }

    /// Ticks from a linked note-on to its earliest related event.
    pub fn related_span(&self, id: PlaybackEventId) -> Option<u64> {
        let event = self.event(id)?;
        let related = event.related.read();
        related
            .iter()
            .filter_map(|r| self.event(*r))
            .map(|r| r.raw_time)
            .min()
            .map(|end| end.saturating_sub(event.raw_time))
    }

    pub(crate) fn clear_marks(&self) {
        for event in &self.events {
            event.marked.store(false, Ordering::Release);
        }
    }
}
