use std::collections::HashMap;

use crate::events::NoteId;
use crate::timing::Note;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct NoteDiff {
    pub to_start: Vec<Note>,
    pub to_stop: Vec<Note>,
}

impl NoteDiff {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

/// Notes currently sounding, one per key and channel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActiveNoteSet {
    notes: HashMap<NoteId, Note>,
}

impl ActiveNoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// What has to change for the set to hold exactly `desired`.
    ///
    /// A key held by a different note than the desired one is stopped and
    /// restarted, so re-triggers always release before they strike.
    pub fn diff(&self, desired: &HashMap<NoteId, Note>) -> NoteDiff {
        let mut to_stop: Vec<Note> = self
            .notes
            .iter()
            .filter(|(id, note)| desired.get(id) != Some(note))
            .map(|(_, note)| note.clone())
            .collect();
        let mut to_start: Vec<Note> = desired
            .iter()
            .filter(|(id, note)| self.notes.get(id) != Some(note))
            .map(|(_, note)| note.clone())
            .collect();

        to_stop.sort_by_key(|n| (n.time, n.channel, n.key));
        to_start.sort_by_key(|n| (n.time, n.channel, n.key));
        NoteDiff { to_start, to_stop }
    }

    pub fn get(&self, id: &NoteId) -> Option<&Note> {
        self.notes.get(id)
    }

    pub fn contains(&self, note: &Note) -> bool {
        self.notes.get(&note.id()) == Some(note)
    }

    pub fn insert(&mut self, note: Note) -> Option<Note> {
        self.notes.insert(note.id(), note)
    }

    pub fn remove(&mut self, id: &NoteId) -> Option<Note> {
        self.notes.remove(id)
    }

    pub fn drain(&mut self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.notes.drain().map(|(_, n)| n).collect();
        notes.sort_by_key(|n| (n.time, n.channel, n.key));
        notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.notes.values().cloned().collect();
        notes.sort_by_key(|n| (n.time, n.channel, n.key));
        notes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(notes: &[Note]) -> HashMap<NoteId, Note> {
        notes.iter().map(|n| (n.id(), n.clone())).collect()
    }

    #[test]
    fn diff_starts_missing_and_stops_stale_notes() {
        let a = Note::new(0, 60, 0, 100);
        let b = Note::new(0, 64, 0, 100);
        let c = Note::new(1, 60, 50, 100);

        let mut set = ActiveNoteSet::new();
        set.insert(a.clone());
        set.insert(b.clone());

        let diff = set.diff(&desired(&[b.clone(), c.clone()]));
        assert_eq!(diff.to_stop, vec![a]);
        assert_eq!(diff.to_start, vec![c]);
    }

    #[test]
    fn retriggered_key_is_stopped_then_started() {
        let first = Note::new(0, 60, 0, 100);
        let second = Note::new(0, 60, 100, 100);

        let mut set = ActiveNoteSet::new();
        set.insert(first.clone());

        let diff = set.diff(&desired(&[second.clone()]));
        assert_eq!(diff.to_stop, vec![first]);
        assert_eq!(diff.to_start, vec![second]);
    }

    #[test]
    fn matching_membership_is_an_empty_diff() {
        let a = Note::new(2, 40, 10, 10);
        let mut set = ActiveNoteSet::new();
        set.insert(a.clone());

        assert!(set.diff(&desired(&[a.clone()])).is_empty());
        assert!(set.contains(&a));
        assert_eq!(set.drain(), vec![a]);
        assert!(set.is_empty());
    }
}
