use super::sequence::Note;
use crate::error::{PlaybackError, Result};

const CHANNELS: usize = 16;

/// Notes on one channel whose starts fall within the chord tolerance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chord {
    notes: Vec<Note>,
}

impl Chord {
    pub fn new(notes: Vec<Note>) -> Self {
        Self { notes }
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn into_notes(self) -> Vec<Note> {
        self.notes
    }

    /// Start of the first note, zero for an empty chord.
    pub fn time(&self) -> u64 {
        self.notes.first().map_or(0, |n| n.time)
    }

    pub fn channel(&self) -> Option<u8> {
        self.notes.first().map(|n| n.channel)
    }

    pub fn end(&self) -> u64 {
        self.notes.iter().map(Note::end).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

/// Lazily groups notes sorted by start tick into chords, in one forward pass.
pub struct Chords<I> {
    notes: I,
    tolerance: u64,
    open: [Option<Chord>; CHANNELS],
    last_end: [Option<u64>; CHANNELS],
    flush_from: usize,
    exhausted: bool,
}

/// A note joins the open chord on its channel unless it starts at or after
/// the previous note's end, or more than `tolerance` ticks after the chord.
pub fn build_chords<I>(notes: I, tolerance: i64) -> Result<Chords<I::IntoIter>>
where
    I: IntoIterator<Item = Note>,
{
    if tolerance < 0 {
        return Err(PlaybackError::invalid_argument(
            "tolerance",
            format!("notes tolerance must be non-negative, got {tolerance}"),
        ));
    }

    Ok(Chords {
        notes: notes.into_iter(),
        tolerance: tolerance as u64,
        open: Default::default(),
        last_end: [None; CHANNELS],
        flush_from: 0,
        exhausted: false,
    })
}

impl<I: Iterator<Item = Note>> Iterator for Chords<I> {
    type Item = Chord;

    fn next(&mut self) -> Option<Chord> {
        while !self.exhausted {
            let Some(note) = self.notes.next() else {
                self.exhausted = true;
                break;
            };

            let channel = (note.channel & 0x0F) as usize;
            let starts_new = match (&self.open[channel], self.last_end[channel]) {
                (Some(chord), Some(last_end)) => {
                    note.time >= last_end || note.time.saturating_sub(chord.time()) > self.tolerance
                }
                _ => true,
            };
            self.last_end[channel] = Some(note.end());

            if starts_new {
                let closed = self.open[channel].replace(Chord::new(vec![note]));
                if let Some(chord) = closed.filter(|c| !c.is_empty()) {
                    return Some(chord);
                }
            } else if let Some(chord) = self.open[channel].as_mut() {
                chord.notes.push(note);
            }
        }

        while self.flush_from < CHANNELS {
            let channel = self.flush_from;
            self.flush_from += 1;
            if let Some(chord) = self.open[channel].take().filter(|c| !c.is_empty()) {
                return Some(chord);
            }
        }

        None
    }
}
