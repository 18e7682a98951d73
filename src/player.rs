use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, at, never, select, unbounded};
use tracing::{info, warn};

use crate::error::Result;
use crate::output::OutputSink;
use crate::playback::{NotesOnDisplay, PlaybackEngine, PlaybackNotification, PlaybackState};
use crate::session::{Session, SessionState};
use crate::settings::Settings;
use crate::song::{InstrumentInfo, Song};

#[derive(Debug, Clone)]
pub enum PlayerCommand {
    LoadSong(PathBuf),
    LoadSongData(Song),
    Start,
    Pause,
    Resume,
    TogglePause,
    /// Stops and rewinds to the beginning.
    Stop,
    SelectChannel(Option<u8>),
    SetChannelActive { channel: u8, active: bool },
    MarkLane(u8),
}

#[derive(Debug, Clone)]
pub enum PlayerUpdate {
    SongLoaded {
        title: String,
        instruments: Vec<InstrumentInfo>,
        duration: Duration,
        board: Arc<NotesOnDisplay>,
    },
    PlaybackState { playing: bool },
    Notification(PlaybackNotification),
    LaneMarked { key: u8, hits: usize },
    /// The finished song was released after its grace period.
    Disposed,
    Error { message: String },
}

pub struct PlayerHandle {
    pub command_tx: Sender<PlayerCommand>,
    pub update_rx: Receiver<PlayerUpdate>,
}

/// Builds a fresh output for every loaded song.
pub type SinkFactory = Box<dyn Fn() -> Result<Box<dyn OutputSink>> + Send>;

pub fn spawn_player(settings: Settings, sink_factory: SinkFactory) -> PlayerHandle {
    let (command_tx, command_rx) = unbounded();
    let (update_tx, update_rx) = unbounded();

    std::thread::spawn(move || {
        player_thread(settings, sink_factory, command_rx, update_tx);
    });

    PlayerHandle {
        command_tx,
        update_rx,
    }
}

struct PlayerState {
    settings: Settings,
    sink_factory: SinkFactory,
    session: Arc<Session>,
    engine: Option<PlaybackEngine>,
    notifications: Option<Receiver<PlaybackNotification>>,
    dispose_at: Option<Instant>,
    update_tx: Sender<PlayerUpdate>,
}

impl PlayerState {
    fn send(&self, update: PlayerUpdate) {
        let _ = self.update_tx.send(update);
    }

    fn report(&self, context: &str, e: impl std::fmt::Display) {
        warn!("{context}: {e}");
        self.send(PlayerUpdate::Error {
            message: format!("{context}: {e}"),
        });
    }

    fn load(&mut self, song: Song) -> Result<()> {
        self.release();

        let objects = song.timed_objects(self.settings.chord_tolerance_ticks)?;
        let sink = (self.sink_factory)()?;
        let engine = PlaybackEngine::new(
            objects,
            song.tempo_map.clone(),
            sink,
            self.settings.playback.clone(),
            self.session.clone(),
        )?;
        self.notifications = Some(engine.subscribe()?);

        info!(title = %song.title, "song loaded");
        self.send(PlayerUpdate::SongLoaded {
            title: song.title.clone(),
            instruments: song.instruments(),
            duration: engine.timeline().duration(),
            board: engine.notes_on_display(),
        });
        self.engine = Some(engine);
        Ok(())
    }

    fn release(&mut self) {
        self.notifications = None;
        self.dispose_at = None;
        if let Some(engine) = self.engine.take() {
            engine.dispose();
        }
    }

    fn start(&mut self) {
        let Some(engine) = &self.engine else {
            return;
        };
        match engine.start() {
            Ok(()) => self.send(PlayerUpdate::PlaybackState { playing: true }),
            Err(e) => self.report("failed to start playback", e),
        }
    }

    fn pause(&mut self) {
        let Some(engine) = &self.engine else {
            return;
        };
        match engine.stop() {
            Ok(()) => self.send(PlayerUpdate::PlaybackState { playing: false }),
            Err(e) => self.report("failed to pause playback", e),
        }
    }

    fn handle(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::LoadSong(path) => {
                if let Err(e) = Song::load(&path).and_then(|song| self.load(song)) {
                    self.report("failed to load song", e);
                }
            }
            PlayerCommand::LoadSongData(song) => {
                if let Err(e) = self.load(song) {
                    self.report("failed to load song", e);
                }
            }
            PlayerCommand::Start | PlayerCommand::Resume => self.start(),
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::TogglePause => {
                let running = self
                    .engine
                    .as_ref()
                    .is_some_and(|e| e.state() == PlaybackState::Running);
                if running {
                    self.pause();
                } else {
                    self.start();
                }
            }
            PlayerCommand::Stop => {
                let Some(engine) = &self.engine else {
                    return;
                };
                self.dispose_at = None;
                match engine.rewind() {
                    Ok(()) => self.send(PlayerUpdate::PlaybackState { playing: false }),
                    Err(e) => self.report("failed to stop playback", e),
                }
            }
            PlayerCommand::SelectChannel(channel) => {
                let result = match &self.engine {
                    Some(engine) => engine.select_channel(channel),
                    None => self.session.select_channel(channel),
                };
                if let Err(e) = result {
                    self.report("failed to select channel", e);
                }
            }
            PlayerCommand::SetChannelActive { channel, active } => {
                if let Err(e) = self.session.set_channel_active(channel, active) {
                    self.report("failed to change channel", e);
                }
            }
            PlayerCommand::MarkLane(key) => {
                let Some(engine) = &self.engine else {
                    return;
                };
                match engine.mark_lane(key) {
                    Ok(hits) => self.send(PlayerUpdate::LaneMarked {
                        key,
                        hits: hits.len(),
                    }),
                    Err(e) => self.report("failed to mark lane", e),
                }
            }
        }
    }

    fn forward(&mut self, notification: PlaybackNotification) {
        if notification == PlaybackNotification::Finished {
            self.dispose_at = Some(Instant::now() + self.settings.finish_grace());
            self.send(PlayerUpdate::PlaybackState { playing: false });
        }
        self.send(PlayerUpdate::Notification(notification));
    }
}

fn player_thread(
    settings: Settings,
    sink_factory: SinkFactory,
    command_rx: Receiver<PlayerCommand>,
    update_tx: Sender<PlayerUpdate>,
) {
    let session = Arc::new(Session::new(SessionState {
        mode: settings.game_mode,
        ..SessionState::default()
    }));
    let mut state = PlayerState {
        settings,
        sink_factory,
        session,
        engine: None,
        notifications: None,
        dispose_at: None,
        update_tx,
    };

    loop {
        let notifications = state.notifications.clone().unwrap_or_else(never);
        let dispose_timer = state.dispose_at.map(at).unwrap_or_else(never);

        select! {
            recv(command_rx) -> command => match command {
                Ok(command) => state.handle(command),
                Err(_) => break,
            },
            recv(notifications) -> notification => match notification {
                Ok(notification) => state.forward(notification),
                Err(_) => state.notifications = None,
            },
            recv(dispose_timer) -> _ => {
                state.release();
                info!("finished song released");
                state.send(PlayerUpdate::Disposed);
            }
        }
    }

    state.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MidiEvent, TimedEvent};
    use crate::output::NullSink;
    use crate::timing::TempoMap;

    fn null_output() -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(NullSink))
    }

    fn short_song() -> Song {
        Song {
            title: "blip".into(),
            events: vec![
                TimedEvent::new(
                    0,
                    MidiEvent::NoteOn {
                        channel: 0,
                        key: 60,
                        velocity: 100,
                    },
                ),
                TimedEvent::new(
                    48,
                    MidiEvent::NoteOff {
                        channel: 0,
                        key: 60,
                        velocity: 0,
                    },
                ),
            ],
            tempo_map: TempoMap::with_tempo(480, 500_000).unwrap(),
        }
    }

    fn wait_for(
        rx: &Receiver<PlayerUpdate>,
        mut matches: impl FnMut(&PlayerUpdate) -> bool,
    ) -> Vec<PlayerUpdate> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while let Ok(update) = rx.recv_deadline(deadline) {
            let done = matches(&update);
            seen.push(update);
            if done {
                return seen;
            }
        }
        panic!("update never arrived, saw {seen:?}");
    }

    #[test]
    fn plays_a_song_to_the_end_and_releases_it() {
        let settings = Settings {
            finish_grace_ms: 20,
            ..Settings::default()
        };
        let player = spawn_player(settings, Box::new(null_output));

        player
            .command_tx
            .send(PlayerCommand::LoadSongData(short_song()))
            .unwrap();
        player.command_tx.send(PlayerCommand::Start).unwrap();

        let seen = wait_for(&player.update_rx, |u| matches!(u, PlayerUpdate::Disposed));
        assert!(matches!(seen[0], PlayerUpdate::SongLoaded { ref title, .. } if title == "blip"));
        assert!(seen.iter().any(|u| matches!(
            u,
            PlayerUpdate::Notification(PlaybackNotification::Finished)
        )));
    }

    #[test]
    fn load_failures_are_reported() {
        let player = spawn_player(Settings::default(), Box::new(null_output));
        player
            .command_tx
            .send(PlayerCommand::LoadSong(PathBuf::from("/nonexistent/song.mid")))
            .unwrap();

        wait_for(&player.update_rx, |u| matches!(u, PlayerUpdate::Error { .. }));
    }
}
