use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use tracing::debug;

use crate::error::{PlaybackError, Result};
use crate::events::{ChannelMessage, MetaEvent, MidiEvent, TimedEvent};
use crate::timing::{TempoChange, TempoMap, TimedObject, collect_timed_objects, extract_notes};

/// Turns a container byte stream into tick-stamped events and a tempo map.
pub trait SongReader {
    fn read(&self, input: &mut dyn Read) -> Result<Song>;
}

/// Standard MIDI File reader. Tracks are merged into one event list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmfReader;

impl SongReader for SmfReader {
    fn read(&self, input: &mut dyn Read) -> Result<Song> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        let smf = Smf::parse(&bytes)?;

        let ticks_per_quarter = match smf.header.timing {
            Timing::Metrical(tpq) => tpq.as_int(),
            Timing::Timecode(fps, subframe) => {
                return Err(PlaybackError::UnsupportedTiming(format!(
                    "SMPTE timing ({} fps, {subframe} subframes) is not supported",
                    fps.as_f32()
                )));
            }
        };

        let mut events: Vec<TimedEvent> = Vec::new();
        let mut tempos: BTreeMap<u64, u32> = BTreeMap::new();
        let mut title: Option<String> = None;

        for track in &smf.tracks {
            let mut tick: u64 = 0;
            for event in track {
                tick += u64::from(event.delta.as_int());
                let converted = match event.kind {
                    TrackEventKind::Midi { channel, message } => {
                        convert_message(channel.as_int(), message)
                    }
                    TrackEventKind::Meta(meta) => {
                        let meta = convert_meta(meta);
                        match &meta {
                            MetaEvent::Tempo(tempo) => {
                                tempos.insert(tick, *tempo);
                            }
                            MetaEvent::TrackName(name) if title.is_none() && !name.is_empty() => {
                                title = Some(name.clone());
                            }
                            _ => {}
                        }
                        MidiEvent::Meta(meta)
                    }
                    TrackEventKind::SysEx(data) => {
                        let mut bytes = vec![0xF0];
                        bytes.extend_from_slice(data);
                        MidiEvent::Unknown(bytes)
                    }
                    TrackEventKind::Escape(data) => MidiEvent::Unknown(data.to_vec()),
                };
                events.push(TimedEvent::new(tick, converted));
            }
        }
        events.sort_by_key(|e| e.time);

        let changes = tempos
            .into_iter()
            .map(|(tick, micros_per_quarter)| TempoChange {
                tick,
                micros_per_quarter,
            })
            .collect();
        let tempo_map = TempoMap::new(ticks_per_quarter, changes)?;

        debug!(
            tracks = smf.tracks.len(),
            events = events.len(),
            ticks_per_quarter,
            "read standard MIDI file"
        );
        Ok(Song {
            title: title.unwrap_or_default(),
            events,
            tempo_map,
        })
    }
}

fn convert_message(channel: u8, message: MidiMessage) -> MidiEvent {
    let channel_message = |message| MidiEvent::Channel { channel, message };
    match message {
        MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => MidiEvent::NoteOff {
            channel,
            key: key.as_int(),
            velocity: 0,
        },
        MidiMessage::NoteOn { key, vel } => MidiEvent::NoteOn {
            channel,
            key: key.as_int(),
            velocity: vel.as_int(),
        },
        MidiMessage::NoteOff { key, vel } => MidiEvent::NoteOff {
            channel,
            key: key.as_int(),
            velocity: vel.as_int(),
        },
        MidiMessage::ProgramChange { program } => channel_message(ChannelMessage::ProgramChange {
            program: program.as_int(),
        }),
        MidiMessage::Controller { controller, value } => {
            channel_message(ChannelMessage::Controller {
                controller: controller.as_int(),
                value: value.as_int(),
            })
        }
        MidiMessage::PitchBend { bend } => channel_message(ChannelMessage::PitchBend {
            bend: bend.0.as_int(),
        }),
        MidiMessage::Aftertouch { key, vel } => channel_message(ChannelMessage::Aftertouch {
            key: key.as_int(),
            pressure: vel.as_int(),
        }),
        MidiMessage::ChannelAftertouch { vel } => {
            channel_message(ChannelMessage::ChannelPressure {
                pressure: vel.as_int(),
            })
        }
    }
}

fn convert_meta(meta: MetaMessage) -> MetaEvent {
    match meta {
        MetaMessage::Tempo(tempo) => MetaEvent::Tempo(tempo.as_int()),
        MetaMessage::TrackName(name) => MetaEvent::TrackName(String::from_utf8_lossy(name).into_owned()),
        MetaMessage::Text(text) => MetaEvent::Text(String::from_utf8_lossy(text).into_owned()),
        MetaMessage::EndOfTrack => MetaEvent::EndOfTrack,
        _ => MetaEvent::Other,
    }
}

/// What a channel is played with and how busy it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentInfo {
    pub channel: u8,
    pub programs: Vec<u8>,
    pub note_count: usize,
}

#[derive(Debug, Clone)]
pub struct Song {
    pub title: String,
    pub events: Vec<TimedEvent>,
    pub tempo_map: TempoMap,
}

impl Song {
    /// Reads a Standard MIDI File. The title falls back to the file stem.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut song = SmfReader.read(&mut file)?;
        if song.title.is_empty() {
            song.title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(song)
    }

    /// One entry per channel that carries notes or program changes.
    pub fn instruments(&self) -> Vec<InstrumentInfo> {
        let mut by_channel: BTreeMap<u8, InstrumentInfo> = BTreeMap::new();
        for timed in &self.events {
            let (channel, program) = match timed.event {
                MidiEvent::NoteOn { channel, .. } => (channel, None),
                MidiEvent::Channel {
                    channel,
                    message: ChannelMessage::ProgramChange { program },
                } => (channel, Some(program)),
                _ => continue,
            };
            let info = by_channel.entry(channel).or_insert_with(|| InstrumentInfo {
                channel,
                programs: Vec::new(),
                note_count: 0,
            });
            match program {
                Some(program) if !info.programs.contains(&program) => info.programs.push(program),
                Some(_) => {}
                None => info.note_count += 1,
            }
        }
        by_channel.into_values().collect()
    }

    /// Note-on counts per channel.
    pub fn note_counts(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for timed in &self.events {
            if let MidiEvent::NoteOn { channel, .. } = timed.event {
                *counts.entry(channel).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Distinct pitches played on `channel`, ascending.
    pub fn pitches_for_channel(&self, channel: u8) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|timed| match timed.event {
                MidiEvent::NoteOn { channel: c, key, .. } if c == channel => Some(key),
                _ => None,
            })
            .collect::<BTreeSet<u8>>()
            .into_iter()
            .collect()
    }

    /// Distinct note start ticks on `channel`, ascending.
    pub fn note_times_for_channel(&self, channel: u8) -> Vec<u64> {
        extract_notes(self.events.iter().cloned())
            .notes
            .into_iter()
            .filter(|n| n.channel == channel)
            .map(|n| n.time)
            .collect::<BTreeSet<u64>>()
            .into_iter()
            .collect()
    }

    pub fn timed_objects(&self, chord_tolerance: Option<i64>) -> Result<Vec<TimedObject>> {
        collect_timed_objects(self.events.iter().cloned(), chord_tolerance)
    }
}
