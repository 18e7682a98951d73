use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use notelane::{
    DisplayPoller, LaneSnapshot, MidiPortSink, NullSink, OutputSink, PlaybackError,
    PlaybackNotification, PlayerCommand, PlayerHandle, PlayerUpdate, Settings, SinkFactory, Song,
    spawn_player,
};

/// Home row, left to right, mapped onto the lowest pitches of the channel.
const LANE_KEYS: [char; 8] = ['a', 's', 'd', 'f', 'j', 'k', 'l', ';'];

#[derive(Parser)]
#[command(name = "notelane", about = "Play MIDI files and play along on one channel")]
struct Cli {
    /// Standard MIDI File to play
    song: Option<PathBuf>,

    /// RON settings file
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Channel the player takes over (0-15)
    #[arg(short, long)]
    channel: Option<u8>,

    /// Mute a channel; may be repeated
    #[arg(long = "mute")]
    muted: Vec<u8>,

    /// MIDI output port (substring match)
    #[arg(long)]
    port: Option<String>,

    /// Discard output instead of opening a MIDI port
    #[arg(long)]
    silent: bool,

    /// List MIDI output ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Mark lanes from the keyboard (asdfjkl;), p pauses, q quits
    #[arg(long)]
    play_along: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> notelane::Result<()> {
    if cli.list_ports {
        for (idx, name) in MidiPortSink::list_ports()?.iter().enumerate() {
            println!("{idx}: {name}");
        }
        return Ok(());
    }

    let Some(path) = cli.song else {
        return Err(PlaybackError::InvalidArgument {
            name: "song",
            reason: "no MIDI file given".into(),
        });
    };
    let mut settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if cli.port.is_some() {
        settings.output_port = cli.port;
    }

    let song = Song::load(&path)?;
    for instrument in song.instruments() {
        info!(
            channel = instrument.channel,
            programs = ?instrument.programs,
            notes = instrument.note_count,
            "instrument"
        );
    }
    let lanes: Vec<u8> = cli
        .channel
        .map(|c| song.pitches_for_channel(c))
        .unwrap_or_default()
        .into_iter()
        .take(LANE_KEYS.len())
        .collect();

    let sink_factory: SinkFactory = if cli.silent {
        Box::new(silent_output)
    } else {
        let port = settings.output_port.clone();
        Box::new(move || -> notelane::Result<Box<dyn OutputSink>> {
            Ok(Box::new(MidiPortSink::connect(port.as_deref())?))
        })
    };

    let display_poll = settings.display_poll();
    let player = spawn_player(settings, sink_factory);
    send(&player, PlayerCommand::SelectChannel(cli.channel));
    for channel in cli.muted {
        send(
            &player,
            PlayerCommand::SetChannelActive {
                channel,
                active: false,
            },
        );
    }
    send(&player, PlayerCommand::LoadSongData(song));
    send(&player, PlayerCommand::Start);

    if cli.play_along {
        enable_raw_mode()?;
        let result = play_along(&player, &lanes, display_poll);
        disable_raw_mode()?;
        result
    } else {
        for update in player.update_rx.iter() {
            let failed = matches!(update, PlayerUpdate::Error { .. });
            if log_update(&update) || failed {
                break;
            }
        }
        Ok(())
    }
}

fn silent_output() -> notelane::Result<Box<dyn OutputSink>> {
    Ok(Box::new(NullSink))
}

fn send(player: &PlayerHandle, command: PlayerCommand) {
    if player.command_tx.send(command).is_err() {
        warn!("player thread is gone");
    }
}

fn play_along(player: &PlayerHandle, lanes: &[u8], display_poll: Duration) -> notelane::Result<()> {
    let mut _poller: Option<DisplayPoller> = None;

    loop {
        while let Ok(update) = player.update_rx.try_recv() {
            if let PlayerUpdate::SongLoaded { board, .. } = &update {
                let lanes = lanes.to_vec();
                _poller = Some(DisplayPoller::spawn(board.clone(), display_poll, move |frame| {
                    render(&lanes, &frame)
                })?);
            }
            if log_update(&update) {
                return Ok(());
            }
        }

        if !event::poll(Duration::from_millis(10))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                send(player, PlayerCommand::Stop);
                return Ok(());
            }
            KeyCode::Char('p') => send(player, PlayerCommand::TogglePause),
            KeyCode::Char(c) => {
                if let Some(idx) = LANE_KEYS.iter().position(|k| *k == c)
                    && let Some(pitch) = lanes.get(idx)
                {
                    send(player, PlayerCommand::MarkLane(*pitch));
                }
            }
            _ => {}
        }
    }
}

fn render(lanes: &[u8], frame: &[LaneSnapshot]) {
    let line: String = lanes
        .iter()
        .zip(LANE_KEYS)
        .map(|(pitch, key)| {
            if frame.iter().any(|lane| lane.key == *pitch) {
                key.to_ascii_uppercase()
            } else {
                '.'
            }
        })
        .collect();
    let mut stdout = io::stdout();
    let _ = write!(stdout, "\r[{line}]");
    let _ = stdout.flush();
}

/// Logs one update. Returns true once the player has released the song.
fn log_update(update: &PlayerUpdate) -> bool {
    match update {
        PlayerUpdate::SongLoaded { title, duration, .. } => {
            info!(%title, ?duration, "ready");
        }
        PlayerUpdate::PlaybackState { playing } => info!(playing, "playback state"),
        PlayerUpdate::Notification(PlaybackNotification::SelectedTrack { played, label }) => {
            if *played {
                info!("hit {label}");
            } else {
                info!("missed {label}");
            }
        }
        PlayerUpdate::Notification(PlaybackNotification::Error { message }) => warn!("{message}"),
        PlayerUpdate::Notification(notification) => debug!(?notification),
        PlayerUpdate::LaneMarked { key, hits } => debug!(key, hits, "lane marked"),
        PlayerUpdate::Error { message } => error!("{message}"),
        PlayerUpdate::Disposed => return true,
    }
    false
}
