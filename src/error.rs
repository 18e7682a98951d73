use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("invalid tempo map: {0}")]
    InvalidTempoMap(String),

    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("playback has been disposed")]
    ObjectDisposed,

    #[error("failed to start {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("output device error: {0}")]
    Output(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse MIDI file: {0}")]
    Midi(#[from] midly::Error),

    #[error("unsupported timing: {0}")]
    UnsupportedTiming(String),

    #[error("failed to parse settings: {0}")]
    SettingsParse(#[from] ron::error::SpannedError),

    #[error("failed to write settings: {0}")]
    SettingsWrite(#[from] ron::Error),
}

impl PlaybackError {
    pub(crate) fn thread(name: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| PlaybackError::Thread { name, source }
    }

    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        PlaybackError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

/// MIDI channels are 4-bit.
pub(crate) fn check_channel(name: &'static str, channel: u8) -> Result<u8> {
    if channel > 15 {
        return Err(PlaybackError::invalid_argument(
            name,
            format!("channel {channel} is outside 0..=15"),
        ));
    }
    Ok(channel)
}
