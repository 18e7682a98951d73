use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::active_notes::ActiveNoteSet;
use super::display::NotesOnDisplay;
use super::judgement::JudgementTracker;
use super::notification::{Observers, PlaybackNotification};
use super::scheduler::{PlaybackState, Scheduler, SchedulerParts};
use crate::error::{PlaybackError, Result};
use crate::output::{NullSink, OutputSink};
use crate::session::Session;
use crate::settings::PlaybackSettings;
use crate::timing::{
    Clock, ClockDriver, Note, PlaybackEventId, PlaybackTimeline, TempoMap, TickCallback, TickFlow,
    TimedObject,
};

/// Plays a timeline to an output sink on a clock.
///
/// Every public operation fails with [`PlaybackError::ObjectDisposed`] once
/// the engine has been disposed. Dropping the engine disposes it.
pub struct PlaybackEngine {
    core: Arc<Mutex<Scheduler>>,
    clock: Mutex<Option<Box<dyn Clock>>>,
    parts: SchedulerParts,
    interrupt_notes_on_stop: bool,
}

impl PlaybackEngine {
    pub fn new(
        objects: impl IntoIterator<Item = TimedObject>,
        tempo_map: TempoMap,
        sink: Box<dyn OutputSink>,
        settings: PlaybackSettings,
        session: Arc<Session>,
    ) -> Result<Self> {
        let clock = ClockDriver::new(settings.clock_resolution())?;
        Self::with_clock(objects, tempo_map, sink, settings, session, Box::new(clock))
    }

    pub fn with_clock(
        objects: impl IntoIterator<Item = TimedObject>,
        tempo_map: TempoMap,
        sink: Box<dyn OutputSink>,
        settings: PlaybackSettings,
        session: Arc<Session>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        let timeline = PlaybackTimeline::build(objects, tempo_map, settings.tie_break);
        timeline.link_related_events(session.load().selected_channel);

        let parts = SchedulerParts {
            timeline: Arc::new(timeline),
            session,
            active: Arc::new(Mutex::new(ActiveNoteSet::new())),
            judgement: Arc::new(JudgementTracker::new(settings.active_duration.duration())),
            display: Arc::new(NotesOnDisplay::default()),
            observers: Arc::new(Observers::default()),
        };
        info!(
            events = parts.timeline.len(),
            notes = parts.timeline.notes_metadata().len(),
            duration = ?parts.timeline.duration(),
            "playback engine created"
        );

        Ok(Self {
            interrupt_notes_on_stop: settings.interrupt_notes_on_stop,
            core: Arc::new(Mutex::new(Scheduler::new(parts.clone(), settings, sink))),
            clock: Mutex::new(Some(clock)),
            parts,
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.core.lock().state() == PlaybackState::Disposed {
            return Err(PlaybackError::ObjectDisposed);
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            match core.state() {
                PlaybackState::Disposed => return Err(PlaybackError::ObjectDisposed),
                PlaybackState::Running => return Ok(()),
                PlaybackState::Finished => {
                    debug!("start ignored on a finished engine, rewind first");
                    return Ok(());
                }
                PlaybackState::Idle => {}
            }
            core.set_state(PlaybackState::Running);
        }
        self.parts.observers.notify(PlaybackNotification::Started);

        let mut clock = self.clock.lock();
        let Some(clock) = clock.as_mut() else {
            return Err(PlaybackError::ObjectDisposed);
        };
        {
            let mut core = self.core.lock();
            core.prepare_sink();
            if core.settings().track_notes {
                let session = self.parts.session.snapshot();
                core.resync(clock.elapsed(), &session);
            }
        }

        let weak = Arc::downgrade(&self.core);
        let on_tick: TickCallback = Arc::new(move |elapsed| match weak.upgrade() {
            Some(core) => core.lock().tick(elapsed),
            None => TickFlow::Stop,
        });
        if let Err(e) = clock.start(on_tick) {
            self.core.lock().set_state(PlaybackState::Idle);
            return Err(e);
        }
        info!(from = ?clock.elapsed(), "playback started");
        Ok(())
    }

    /// Stops the clock, keeping the position for the next `start`.
    pub fn stop(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            match core.state() {
                PlaybackState::Disposed => return Err(PlaybackError::ObjectDisposed),
                PlaybackState::Running => core.set_state(PlaybackState::Idle),
                PlaybackState::Idle | PlaybackState::Finished => return Ok(()),
            }
        }

        if let Some(clock) = self.clock.lock().as_mut() {
            clock.stop();
        }
        if self.interrupt_notes_on_stop {
            self.core.lock().flush_active_notes();
        }
        info!(at = ?self.current_time(), "playback stopped");
        self.parts.observers.notify(PlaybackNotification::Stopped);
        Ok(())
    }

    /// Starts and blocks until playback stops or finishes.
    pub fn play(&self) -> Result<()> {
        self.start()?;
        let signal = match self.clock.lock().as_ref() {
            Some(clock) => clock.stop_signal(),
            None => return Err(PlaybackError::ObjectDisposed),
        };
        signal.wait(None);
        Ok(())
    }

    /// Returns to time zero with nothing sounding and no marks.
    pub fn rewind(&self) -> Result<()> {
        self.stop()?;
        if let Some(clock) = self.clock.lock().as_mut() {
            clock.reset();
        }
        self.core.lock().rewind();
        debug!("playback rewound");
        Ok(())
    }

    /// Releases the clock and the output. Sounding notes are cut only when
    /// stopping interrupts them. Safe to call repeatedly.
    pub fn dispose(&self) {
        let was_running = {
            let mut core = self.core.lock();
            let state = core.state();
            if state == PlaybackState::Disposed {
                return;
            }
            core.set_state(PlaybackState::Disposed);
            state == PlaybackState::Running
        };

        if let Some(mut clock) = self.clock.lock().take() {
            clock.stop();
        }
        {
            let mut core = self.core.lock();
            if self.interrupt_notes_on_stop {
                core.flush_active_notes();
            }
            core.replace_sink(Box::new(NullSink));
        }
        self.parts.display.clear();
        self.parts.judgement.clear();

        if was_running {
            self.parts.observers.notify(PlaybackNotification::Stopped);
        }
        self.parts.observers.close();
        info!("playback engine disposed");
    }

    pub fn state(&self) -> PlaybackState {
        self.core.lock().state()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == PlaybackState::Disposed
    }

    pub fn current_time(&self) -> Duration {
        match self.clock.lock().as_ref() {
            Some(clock) => clock.elapsed(),
            None => self.core.lock().last_tick(),
        }
    }

    pub fn subscribe(&self) -> Result<Receiver<PlaybackNotification>> {
        self.ensure_alive()?;
        Ok(self.parts.observers.subscribe())
    }

    /// Hands the player a channel. Pending judgements and the display board
    /// are cleared when the channel changes.
    pub fn select_channel(&self, channel: Option<u8>) -> Result<()> {
        self.ensure_alive()?;
        let previous = self.parts.session.load().selected_channel;
        self.parts.session.select_channel(channel)?;
        if previous != channel {
            self.parts.judgement.clear();
            self.parts.display.clear();
        }
        self.parts.timeline.link_related_events(channel);
        info!(?channel, "selected channel");
        Ok(())
    }

    pub fn activate_channel(&self, channel: u8) -> Result<()> {
        self.ensure_alive()?;
        self.parts.session.set_channel_active(channel, true)
    }

    pub fn deactivate_channel(&self, channel: u8) -> Result<()> {
        self.ensure_alive()?;
        self.parts.session.set_channel_active(channel, false)
    }

    /// Records that the player hit the note behind `id`. Returns false when
    /// the note is not judgable right now.
    pub fn mark(&self, id: PlaybackEventId) -> Result<bool> {
        self.ensure_alive()?;
        let now = self.current_time();
        Ok(self.parts.judgement.mark_at(id, now, &self.parts.timeline))
    }

    /// Marks every judgable note on the pitch lane `key`.
    pub fn mark_lane(&self, key: u8) -> Result<Vec<PlaybackEventId>> {
        self.ensure_alive()?;
        if key > 127 {
            return Err(PlaybackError::invalid_argument(
                "key",
                format!("pitch {key} is outside 0..=127"),
            ));
        }
        let now = self.current_time();
        Ok(self.parts.judgement.mark_lane(key, now, &self.parts.timeline))
    }

    pub fn active_notes(&self) -> Vec<Note> {
        self.parts.active.lock().snapshot()
    }

    pub fn notes_on_display(&self) -> Arc<NotesOnDisplay> {
        self.parts.display.clone()
    }

    pub fn timeline(&self) -> &Arc<PlaybackTimeline> {
        &self.parts.timeline
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.parts.session
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
