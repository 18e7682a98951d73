mod active_notes;
mod display;
mod engine;
mod judgement;
mod notification;
mod scheduler;

pub use active_notes::{ActiveNoteSet, NoteDiff};
pub use display::{DisplayPoller, LaneSnapshot, NotesOnDisplay};
pub use engine::PlaybackEngine;
pub use judgement::JudgementTracker;
pub use notification::{Observers, PlaybackNotification};
pub use scheduler::PlaybackState;
