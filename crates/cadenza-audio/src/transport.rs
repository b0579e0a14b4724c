//! Transport controller: the state machine and public control surface.
//!
//! Control-path calls (`load_file`, `request_*`) and the source's
//! running-state notifications both funnel through one short-lived
//! `parking_lot::Mutex` around the state, so concurrent transitions can
//! never interleave. The render path never takes that lock.

use std::path::Path;
use std::sync::{Arc, Weak};

use cadenza_core::Result;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::formats::FormatRegistry;
use crate::source::{PlaybackSource, SourceListener};

/// Target decode read-ahead per source, in samples.
const READ_AHEAD_SAMPLES: usize = 32_768;

/// What the transport is doing right now.
///
/// `Starting` and `Stopping` gate a pending source start/stop until the
/// source confirms it through a running-state notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Starting,
    Playing,
    Pausing,
    Paused,
    Stopping,
}

/// Everything that can move the transport to another state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    RequestPlay,
    RequestPause,
    RequestStop,
    SourceRunning,
    SourceStopped,
}

/// The transition table. Returns `None` when the trigger does not apply in
/// the given state; callers treat a returned current state as a no-op too.
pub(crate) const fn apply(state: TransportState, trigger: Trigger) -> Option<TransportState> {
    use TransportState::{Paused, Pausing, Playing, Starting, Stopped, Stopping};

    match (trigger, state) {
        (Trigger::RequestPlay, Stopped | Paused) => Some(Starting),
        (Trigger::RequestPause, Playing) => Some(Pausing),
        (Trigger::RequestStop, Playing | Starting) => Some(Stopping),
        (Trigger::SourceRunning, _) => Some(Playing),
        (Trigger::SourceStopped, Stopping | Playing) => Some(Stopped),
        (Trigger::SourceStopped, Pausing) => Some(Paused),
        _ => None,
    }
}

/// The state machine and public control surface of the engine.
///
/// Owns the [`PlaybackSource`] exclusively; only the controller may
/// replace or retire the active reader. Built as an `Arc` so the render
/// callback and the source's notification path can both reach it.
pub struct TransportController {
    state: Mutex<TransportState>,
    source: PlaybackSource,
    registry: Arc<dyn FormatRegistry>,
}

impl TransportController {
    /// Composition root for one engine instance.
    pub fn new(registry: Arc<dyn FormatRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let listener: SourceListener = Box::new(move || {
                if let Some(controller) = weak.upgrade() {
                    controller.on_source_state_changed();
                }
            });

            Self {
                state: Mutex::new(TransportState::Stopped),
                source: PlaybackSource::new(listener),
                registry,
            }
        })
    }

    /// Open `path` through the format registry and make it the active
    /// source. Transport state is left untouched either way: on failure the
    /// previous source keeps playing, on success the caller still has to
    /// [`request_play`](Self::request_play).
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let reader = self.registry.open(path)?;
        let stream_info = reader.info();

        info!(
            "Loaded {}: {}Hz, {} channels, {:.1}s",
            path.display(),
            stream_info.sample_rate,
            stream_info.channels,
            stream_info.duration_secs().unwrap_or(f64::NAN)
        );

        self.source
            .set_source(Some(reader), READ_AHEAD_SAMPLES, stream_info.sample_rate);
        Ok(())
    }

    /// Begin playback from `Stopped` or `Paused`; no-op otherwise.
    pub fn request_play(&self) {
        self.dispatch(Trigger::RequestPlay);
    }

    /// Pause while `Playing`, retaining the position; no-op otherwise.
    pub fn request_pause(&self) {
        self.dispatch(Trigger::RequestPause);
    }

    /// Stop from `Playing` or `Starting`; the position resets to the
    /// origin once the source confirms. No-op otherwise.
    pub fn request_stop(&self) {
        self.dispatch(Trigger::RequestStop);
    }

    /// The current transport state.
    pub fn current_state(&self) -> TransportState {
        *self.state.lock()
    }

    /// Current stream position in seconds.
    pub fn position(&self) -> f64 {
        self.source.position()
    }

    /// Reposition the stream, leaving the transport state untouched.
    /// Safe to issue while the render path is pulling blocks.
    pub fn set_position(&self, seconds: f64) {
        self.source.set_position(seconds);
    }

    /// Prime the engine for a render session. Called by the host before
    /// the first render pull, paired with [`release`](Self::release).
    pub fn prepare(&self, sample_rate: u32, block_size: u32) {
        self.source.prepare(sample_rate, block_size);
    }

    /// Tear down session-scoped resources.
    pub fn release(&self) {
        self.source.release();
    }

    /// Real-time entry point, one call per render cycle.
    ///
    /// Completes in bounded time regardless of control-path activity;
    /// shortfalls come back as silence, never as an error.
    pub fn render_next_block(&self, dest: &mut [f32]) -> usize {
        self.source.next_block(dest)
    }

    /// Reactive handler for source-driven running-state changes, delivered
    /// from the decode worker thread.
    fn on_source_state_changed(&self) {
        let trigger = if self.source.is_playing() {
            Trigger::SourceRunning
        } else {
            Trigger::SourceStopped
        };
        self.dispatch(trigger);
    }

    fn dispatch(&self, trigger: Trigger) {
        let mut state = self.state.lock();

        let Some(new_state) = apply(*state, trigger) else {
            return;
        };
        if new_state == *state {
            return;
        }

        debug!("Transport: {:?} -> {:?} ({:?})", *state, new_state, trigger);
        *state = new_state;

        // Side effects keyed on the state being entered. Skipped entirely
        // for no-ops, so a redundant request never re-issues a source
        // command or a position reset.
        match new_state {
            TransportState::Stopped => self.source.set_position(0.0),
            TransportState::Starting => self.source.start(),
            TransportState::Pausing | TransportState::Stopping => self.source.stop(),
            TransportState::Playing | TransportState::Paused => {}
        }
    }
}
