use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::chords::{Chord, build_chords};
use crate::error::Result;
use crate::events::{MidiEvent, NoteId, TimedEvent};

/// One sounding pitch on one channel, in ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub key: u8,
    pub channel: u8,
    pub velocity: u8,
    pub off_velocity: u8,
    pub time: u64,
    pub length: u64,
}

impl Note {
    pub fn new(channel: u8, key: u8, time: u64, length: u64) -> Self {
        Self {
            key,
            channel,
            velocity: 100,
            off_velocity: 0,
            time,
            length,
        }
    }

    pub fn with_velocity(mut self, velocity: u8) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn id(&self) -> NoteId {
        NoteId {
            key: self.key,
            channel: self.channel,
        }
    }

    pub fn end(&self) -> u64 {
        self.time.saturating_add(self.length)
    }

    pub fn note_on(&self) -> MidiEvent {
        MidiEvent::NoteOn {
            channel: self.channel,
            key: self.key,
            velocity: self.velocity,
        }
    }

    pub fn note_off(&self) -> MidiEvent {
        MidiEvent::NoteOff {
            channel: self.channel,
            key: self.key,
            velocity: self.off_velocity,
        }
    }

    pub fn timed_note_on(&self) -> TimedEvent {
        TimedEvent::new(self.time, self.note_on())
    }

    pub fn timed_note_off(&self) -> TimedEvent {
        TimedEvent::new(self.end(), self.note_off())
    }
}

/// Anything the timeline builder accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimedObject {
    Event(TimedEvent),
    Note(Note),
    Chord(Chord),
}

impl TimedObject {
    pub fn time(&self) -> u64 {
        match self {
            TimedObject::Event(e) => e.time,
            TimedObject::Note(n) => n.time,
            TimedObject::Chord(c) => c.time(),
        }
    }
}

/// Events kept in tick order. Retiming an event marks the list unsorted and
/// the next read re-sorts it.
#[derive(Debug, Clone, Default)]
pub struct TimedEventList {
    events: Vec<TimedEvent>,
    dirty: bool,
}

impl TimedEventList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TimedEvent) {
        if self.events.last().is_some_and(|last| last.time > event.time) {
            self.dirty = true;
        }
        self.events.push(event);
    }

    pub fn set_time(&mut self, index: usize, time: u64) -> bool {
        match self.events.get_mut(index) {
            Some(event) if event.time != time => {
                event.time = time;
                self.dirty = true;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&mut self) -> &[TimedEvent] {
        if self.dirty {
            self.events.sort_by_key(|e| e.time);
            self.dirty = false;
        }
        &self.events
    }

    pub fn into_sorted(mut self) -> Vec<TimedEvent> {
        self.events();
        self.events
    }
}

impl FromIterator<TimedEvent> for TimedEventList {
    fn from_iter<I: IntoIterator<Item = TimedEvent>>(iter: I) -> Self {
        let mut list = TimedEventList::new();
        for event in iter {
            list.push(event);
        }
        list
    }
}

#[derive(Debug, Default)]
pub struct ExtractedNotes {
    /// Sorted by start tick.
    pub notes: Vec<Note>,
    /// Everything that did not become part of a note, in tick order.
    pub others: Vec<TimedEvent>,
}

struct OpenNote {
    time: u64,
    velocity: u8,
}

/// Pairs note-on/note-off events into [`Note`]s.
///
/// A note-on arriving while the same key is already held on that channel
/// closes the held note at the new note's start. Notes still open when the
/// events run out are closed at the last event's tick. Note-offs with
/// nothing to close are kept as plain events.
pub fn extract_notes(events: impl IntoIterator<Item = TimedEvent>) -> ExtractedNotes {
    let events = events.into_iter().collect::<TimedEventList>().into_sorted();
    let end_of_sequence = events.last().map_or(0, |e| e.time);

    let mut open: HashMap<NoteId, OpenNote> = HashMap::new();
    let mut result = ExtractedNotes::default();

    for timed in events {
        match timed.event {
            MidiEvent::NoteOn {
                channel,
                key,
                velocity,
            } => {
                let id = NoteId { key, channel };
                if let Some(held) = open.remove(&id) {
                    result.notes.push(close(id, held, timed.time, 0));
                }
                open.insert(
                    id,
                    OpenNote {
                        time: timed.time,
                        velocity,
                    },
                );
            }
            MidiEvent::NoteOff {
                channel,
                key,
                velocity,
            } => {
                let id = NoteId { key, channel };
                match open.remove(&id) {
                    Some(held) => result.notes.push(close(id, held, timed.time, velocity)),
                    None => result.others.push(timed),
                }
            }
            _ => result.others.push(timed),
        }
    }

    for (id, held) in open {
        result.notes.push(close(id, held, end_of_sequence, 0));
    }

    result.notes.sort_by_key(|n| n.time);
    result
}

fn close(id: NoteId, held: OpenNote, end: u64, off_velocity: u8) -> Note {
    Note {
        key: id.key,
        channel: id.channel,
        velocity: held.velocity,
        off_velocity,
        time: held.time,
        length: end.saturating_sub(held.time),
    }
}

/// Turns raw events into timeline input: notes (grouped into chords when a
/// tolerance is given) plus every event that is not part of a note.
pub fn collect_timed_objects(
    events: impl IntoIterator<Item = TimedEvent>,
    chord_tolerance: Option<i64>,
) -> Result<Vec<TimedObject>> {
    let ExtractedNotes { notes, others } = extract_notes(events);

    let mut objects: Vec<TimedObject> = others.into_iter().map(TimedObject::Event).collect();
    match chord_tolerance {
        Some(tolerance) => {
            objects.extend(build_chords(notes, tolerance)?.map(TimedObject::Chord));
        }
        None => objects.extend(notes.into_iter().map(TimedObject::Note)),
    }

    objects.sort_by_key(TimedObject::time);
    Ok(objects)
}
