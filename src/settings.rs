use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlaybackError, Result};
use crate::session::GameMode;
use crate::timing::TieBreak;

/// How far ahead of the audio selected-channel notes are shown.
pub const LOOKAHEAD_SLACK: Duration = Duration::from_millis(5002);
/// How late a note-on may be and still sound.
pub const SOUND_WINDOW: Duration = Duration::from_millis(5000);

/// How long a displayed note stays judgable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveDuration {
    Short,
    #[default]
    Medium,
    Long,
}

impl ActiveDuration {
    pub fn duration(self) -> Duration {
        match self {
            ActiveDuration::Short => Duration::from_secs(1),
            ActiveDuration::Medium => Duration::from_secs(3),
            ActiveDuration::Long => Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub interrupt_notes_on_stop: bool,
    pub track_notes: bool,
    pub clock_resolution_ms: u64,
    pub lookahead_slack_ms: u64,
    pub sound_window_ms: u64,
    pub active_duration: ActiveDuration,
    pub tie_break: TieBreak,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            interrupt_notes_on_stop: true,
            track_notes: true,
            clock_resolution_ms: 1,
            lookahead_slack_ms: LOOKAHEAD_SLACK.as_millis() as u64,
            sound_window_ms: SOUND_WINDOW.as_millis() as u64,
            active_duration: ActiveDuration::default(),
            tie_break: TieBreak::default(),
        }
    }
}

impl PlaybackSettings {
    pub fn clock_resolution(&self) -> Duration {
        Duration::from_millis(self.clock_resolution_ms)
    }

    pub fn lookahead_slack(&self) -> Duration {
        Duration::from_millis(self.lookahead_slack_ms)
    }

    pub fn sound_window(&self) -> Duration {
        Duration::from_millis(self.sound_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clock_resolution_ms == 0 {
            return Err(PlaybackError::invalid_argument(
                "clock_resolution_ms",
                "must be positive",
            ));
        }
        if self.active_duration.duration() > self.lookahead_slack() {
            return Err(PlaybackError::invalid_argument(
                "active_duration",
                format!(
                    "{:?} is longer than the {} ms display lookahead",
                    self.active_duration, self.lookahead_slack_ms
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub playback: PlaybackSettings,
    pub chord_tolerance_ticks: Option<i64>,
    pub output_port: Option<String>,
    pub game_mode: GameMode,
    pub finish_grace_ms: u64,
    pub display_poll_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            playback: PlaybackSettings::default(),
            chord_tolerance_ticks: None,
            output_port: None,
            game_mode: GameMode::default(),
            finish_grace_ms: 6000,
            display_poll_ms: 200,
        }
    }
}

impl Settings {
    pub fn finish_grace(&self) -> Duration {
        Duration::from_millis(self.finish_grace_ms)
    }

    pub fn display_poll(&self) -> Duration {
        Duration::from_millis(self.display_poll_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.playback.validate()?;
        if let Some(tolerance) = self.chord_tolerance_ticks
            && tolerance < 0
        {
            return Err(PlaybackError::invalid_argument(
                "chord_tolerance_ticks",
                "must not be negative",
            ));
        }
        if self.display_poll_ms == 0 {
            return Err(PlaybackError::invalid_argument(
                "display_poll_ms",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let ron_string = fs::read_to_string(path)?;
        let settings: Settings = ron::from_str(&ron_string)?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("notelane-{}-{name}", std::process::id()))
    }

    #[test]
    fn defaults_match_the_named_windows() {
        let settings = Settings::default();
        assert_eq!(settings.playback.lookahead_slack(), LOOKAHEAD_SLACK);
        assert_eq!(settings.playback.sound_window(), SOUND_WINDOW);
        assert_eq!(settings.playback.active_duration.duration(), Duration::from_secs(3));
        assert!(settings.playback.interrupt_notes_on_stop);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let path = scratch("settings.ron");
        let settings = Settings {
            chord_tolerance_ticks: Some(60),
            output_port: Some("Synth".into()),
            game_mode: GameMode::Online { conductor: false },
            playback: PlaybackSettings {
                active_duration: ActiveDuration::Long,
                tie_break: TieBreak::NoteFirst,
                ..PlaybackSettings::default()
            },
            ..Settings::default()
        };

        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings = ron::from_str("(game_mode: Offline)").unwrap();
        assert_eq!(settings.game_mode, GameMode::Offline);
        assert_eq!(settings.finish_grace_ms, 6000);
        assert!(settings.playback.track_notes);
    }

    #[test]
    fn judgement_longer_than_lookahead_is_rejected() {
        let playback = PlaybackSettings {
            lookahead_slack_ms: 2000,
            active_duration: ActiveDuration::Medium,
            ..PlaybackSettings::default()
        };
        assert!(matches!(
            playback.validate(),
            Err(PlaybackError::InvalidArgument { name: "active_duration", .. })
        ));
    }

    #[test]
    fn malformed_file_reports_a_parse_error() {
        let path = scratch("broken.ron");
        fs::write(&path, "(playback: [").unwrap();
        let result = Settings::load(&path);
        let _ = fs::remove_file(&path);
        assert!(matches!(result, Err(PlaybackError::SettingsParse(_))));
    }
}
