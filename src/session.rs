use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use serde::{Deserialize, Serialize};

use crate::error::{Result, check_channel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameMode {
    #[default]
    Solo,
    Offline,
    Online {
        conductor: bool,
    },
}

impl GameMode {
    /// In an online session only the conductor sounds the other players'
    /// parts; everyone else hears their own channel.
    pub fn plays_other_channels(self) -> bool {
        match self {
            GameMode::Solo | GameMode::Offline => true,
            GameMode::Online { conductor } => conductor,
        }
    }
}

/// Per-session routing the scheduler reads on every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// The player's channel. `None` listens to everything.
    pub selected_channel: Option<u8>,
    pub deactivated_channels: BTreeSet<u8>,
    pub mode: GameMode,
}

impl SessionState {
    pub fn is_selected(&self, channel: Option<u8>) -> bool {
        channel.is_some() && channel == self.selected_channel
    }

    pub fn is_deactivated(&self, channel: Option<u8>) -> bool {
        channel.is_some_and(|c| self.deactivated_channels.contains(&c))
    }
}

/// Lock-free cell holding the current [`SessionState`].
#[derive(Debug, Default)]
pub struct Session {
    state: ArcSwap<SessionState>,
}

impl Session {
    pub fn new(state: SessionState) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
        }
    }

    pub fn load(&self) -> Guard<Arc<SessionState>> {
        self.state.load()
    }

    pub fn snapshot(&self) -> Arc<SessionState> {
        self.state.load_full()
    }

    pub fn update(&self, f: impl Fn(&mut SessionState)) {
        self.state.rcu(|current| {
            let mut next = SessionState::clone(current);
            f(&mut next);
            next
        });
    }

    pub fn select_channel(&self, channel: Option<u8>) -> Result<()> {
        if let Some(channel) = channel {
            check_channel("channel", channel)?;
        }
        self.update(|s| s.selected_channel = channel);
        Ok(())
    }

    pub fn set_channel_active(&self, channel: u8, active: bool) -> Result<()> {
        check_channel("channel", channel)?;
        self.update(|s| {
            if active {
                s.deactivated_channels.remove(&channel);
            } else {
                s.deactivated_channels.insert(channel);
            }
        });
        Ok(())
    }

    pub fn set_mode(&self, mode: GameMode) {
        self.update(|s| s.mode = mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_conductor_plays_other_channels_online() {
        assert!(GameMode::Solo.plays_other_channels());
        assert!(GameMode::Offline.plays_other_channels());
        assert!(GameMode::Online { conductor: true }.plays_other_channels());
        assert!(!GameMode::Online { conductor: false }.plays_other_channels());
    }

    #[test]
    fn updates_are_visible_to_later_loads() {
        let session = Session::default();
        let before = session.snapshot();

        session.select_channel(Some(9)).unwrap();
        session.set_channel_active(3, false).unwrap();

        let after = session.load();
        assert_eq!(after.selected_channel, Some(9));
        assert!(after.is_deactivated(Some(3)));
        assert!(!after.is_deactivated(None));
        assert!(after.is_selected(Some(9)));
        assert_eq!(before.selected_channel, None);

        session.set_channel_active(3, true).unwrap();
        assert!(!session.load().is_deactivated(Some(3)));
    }

    #[test]
    fn rejects_channels_outside_four_bits() {
        let session = Session::default();
        assert!(session.select_channel(Some(16)).is_err());
        assert!(session.set_channel_active(200, false).is_err());
    }
}
