mod chords;
mod clock;
mod sequence;
mod tempo;
mod timeline;

pub use chords::{Chord, Chords, build_chords};
pub use clock::{
    Clock, ClockDriver, ClockState, ManualClock, ManualClockHandle, StopSignal, TickCallback,
    TickFlow,
};
pub use sequence::{
    ExtractedNotes, Note, TimedEventList, TimedObject, collect_timed_objects, extract_notes,
};
pub use tempo::{
    DEFAULT_MICROS_PER_QUARTER, TempoChange, TempoMap, ticks_to_wall_time, wall_time_to_ticks,
};
pub use timeline::{
    NotePlaybackMetadata, PlaybackEvent, PlaybackEventId, PlaybackTimeline, TieBreak,
};
