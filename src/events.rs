use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a sounding note for activity tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoteId {
    pub key: u8,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    ProgramChange { program: u8 },
    Controller { controller: u8, value: u8 },
    PitchBend { bend: u16 },
    Aftertouch { key: u8, pressure: u8 },
    ChannelPressure { pressure: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaEvent {
    /// Microseconds per quarter note.
    Tempo(u32),
    TrackName(String),
    Text(String),
    EndOfTrack,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiEvent {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8, velocity: u8 },
    Channel { channel: u8, message: ChannelMessage },
    Meta(MetaEvent),
    Unknown(Vec<u8>),
}

impl MidiEvent {
    pub fn channel(&self) -> Option<u8> {
        match self {
            MidiEvent::NoteOn { channel, .. }
            | MidiEvent::NoteOff { channel, .. }
            | MidiEvent::Channel { channel, .. } => Some(*channel),
            MidiEvent::Meta(_) | MidiEvent::Unknown(_) => None,
        }
    }

    pub fn note_id(&self) -> Option<NoteId> {
        match self {
            MidiEvent::NoteOn { channel, key, .. } | MidiEvent::NoteOff { channel, key, .. } => {
                Some(NoteId {
                    key: *key,
                    channel: *channel,
                })
            }
            _ => None,
        }
    }

    pub fn is_note(&self) -> bool {
        matches!(self, MidiEvent::NoteOn { .. } | MidiEvent::NoteOff { .. })
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiEvent::NoteOn { .. })
    }

    /// Wire bytes for a MIDI output port. Meta events never leave the file.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            MidiEvent::NoteOn {
                channel,
                key,
                velocity,
            } => Some(vec![0x90 | (channel & 0x0F), key & 0x7F, velocity & 0x7F]),
            MidiEvent::NoteOff {
                channel,
                key,
                velocity,
            } => Some(vec![0x80 | (channel & 0x0F), key & 0x7F, velocity & 0x7F]),
            MidiEvent::Channel { channel, message } => {
                let ch = channel & 0x0F;
                Some(match message {
                    ChannelMessage::ProgramChange { program } => vec![0xC0 | ch, program & 0x7F],
                    ChannelMessage::Controller { controller, value } => {
                        vec![0xB0 | ch, controller & 0x7F, value & 0x7F]
                    }
                    ChannelMessage::PitchBend { bend } => {
                        vec![0xE0 | ch, (bend & 0x7F) as u8, ((bend >> 7) & 0x7F) as u8]
                    }
                    ChannelMessage::Aftertouch { key, pressure } => {
                        vec![0xA0 | ch, key & 0x7F, pressure & 0x7F]
                    }
                    ChannelMessage::ChannelPressure { pressure } => vec![0xD0 | ch, pressure & 0x7F],
                })
            }
            MidiEvent::Meta(_) => None,
            MidiEvent::Unknown(bytes) => Some(bytes.clone()),
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiEvent::NoteOn {
                channel,
                key,
                velocity,
            } => write!(f, "Note On [{channel}] ({key}, {velocity})"),
            MidiEvent::NoteOff {
                channel,
                key,
                velocity,
            } => write!(f, "Note Off [{channel}] ({key}, {velocity})"),
            MidiEvent::Channel { channel, message } => write!(f, "{message:?} [{channel}]"),
            MidiEvent::Meta(meta) => write!(f, "Meta {meta:?}"),
            MidiEvent::Unknown(bytes) => write!(f, "Unknown {bytes:02X?}"),
        }
    }
}

/// A raw event placed at an absolute tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub time: u64,
    pub event: MidiEvent,
}

impl TimedEvent {
    pub fn new(time: u64, event: MidiEvent) -> Self {
        Self { time, event }
    }
}
