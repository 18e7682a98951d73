pub mod error;
pub mod events;
pub mod output;
pub mod playback;
pub mod player;
pub mod session;
pub mod settings;
pub mod song;
pub mod timing;

pub use error::{PlaybackError, Result};
pub use events::{ChannelMessage, MetaEvent, MidiEvent, NoteId, TimedEvent};
pub use output::{MidiPortSink, NullSink, OutputSink};
pub use playback::{
    ActiveNoteSet, DisplayPoller, JudgementTracker, LaneSnapshot, NoteDiff, NotesOnDisplay,
    PlaybackEngine, PlaybackNotification, PlaybackState,
};
pub use player::{PlayerCommand, PlayerHandle, PlayerUpdate, SinkFactory, spawn_player};
pub use session::{GameMode, Session, SessionState};
pub use settings::{ActiveDuration, LOOKAHEAD_SLACK, PlaybackSettings, SOUND_WINDOW, Settings};
pub use song::{InstrumentInfo, SmfReader, Song, SongReader};
