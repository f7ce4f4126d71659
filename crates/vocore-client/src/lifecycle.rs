//! Explicit voice lifecycle state machine and the reconnect controller that
//! restores voice state across a dropped WebSocket.
//!
//! The source this is adapted from used ad-hoc `connecting`/`in_voice` flags;
//! this replaces them with declared legal transitions (DESIGN NOTES, section
//! 9), illegal ones are logged and ignored rather than panicking.

use std::sync::atomic::{AtomicU8, Ordering};

/// `NotInVoice -> Joining -> Active -> Leaving -> NotInVoice`. No other
/// transition is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceLifecycle {
    NotInVoice = 0,
    Joining = 1,
    Active = 2,
    Leaving = 3,
}

impl VoiceLifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VoiceLifecycle::NotInVoice,
            1 => VoiceLifecycle::Joining,
            2 => VoiceLifecycle::Active,
            3 => VoiceLifecycle::Leaving,
            _ => unreachable!("VoiceLifecycle only ever stores 0..=3"),
        }
    }

    fn legal_next(self, next: VoiceLifecycle) -> bool {
        matches!(
            (self, next),
            (VoiceLifecycle::NotInVoice, VoiceLifecycle::Joining)
                | (VoiceLifecycle::Joining, VoiceLifecycle::Active)
                | (VoiceLifecycle::Joining, VoiceLifecycle::Leaving)
                | (VoiceLifecycle::Active, VoiceLifecycle::Leaving)
                | (VoiceLifecycle::Leaving, VoiceLifecycle::NotInVoice)
        )
    }
}

/// Last-known mute/deafen flags, captured so a reconnect can rejoin voice
/// with the same flags the user had before the drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceFlags {
    pub muted: bool,
    pub deafened: bool,
}

/// Thread-safe wrapper over [`VoiceLifecycle`] plus the reconnect-restore
/// bookkeeping from section 4.7. One instance per client session.
pub struct LifecycleController {
    state: AtomicU8,
    saved: std::sync::Mutex<Option<VoiceFlags>>,
    /// Tracks whether a "join" sound has already fired for the current
    /// `Joining -> Active` transition, so a RTC_READY/VOICE_STATE_UPDATE
    /// race (open question in section 9) can never double-chime: the sound
    /// is solely a function of this transition, never of individual event
    /// receipt.
    join_sound_played: std::sync::atomic::AtomicBool,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(VoiceLifecycle::NotInVoice as u8),
            saved: std::sync::Mutex::new(None),
            join_sound_played: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> VoiceLifecycle {
        VoiceLifecycle::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attempts a transition. Returns `true` if it was legal and applied;
    /// an illegal transition is logged and ignored, leaving state unchanged.
    pub fn transition(&self, next: VoiceLifecycle) -> bool {
        let current = self.state();
        if !current.legal_next(next) {
            tracing::warn!("ignored illegal voice lifecycle transition {:?} -> {:?}", current, next);
            return false;
        }
        self.state.store(next as u8, Ordering::SeqCst);
        if next == VoiceLifecycle::Joining {
            self.join_sound_played.store(false, Ordering::SeqCst);
        }
        true
    }

    /// Call on the `Joining -> Active` transition. Returns `true` exactly
    /// once per join; a caller receiving both the VOICE_STATE_UPDATE and
    /// RTC_READY paths for the same join only gets `true` from whichever
    /// calls first.
    pub fn should_play_join_sound(&self) -> bool {
        self.join_sound_played
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks the join sound as already fired for the current `Joining`
    /// entry, so the upcoming `Active` transition stays silent. Used for
    /// reconnect-triggered rejoins (section 4.7): same voice session from
    /// the user's perspective, no fresh chime.
    pub fn suppress_join_sound(&self) {
        self.join_sound_played.store(true, Ordering::SeqCst);
    }

    /// On WebSocket disconnect: if currently in voice, remember the flags
    /// so a later reconnect can restore them, and move to `NotInVoice`
    /// locally (the server-side peer is gone regardless).
    pub fn on_disconnect(&self, flags: VoiceFlags) {
        let was_in_voice = matches!(self.state(), VoiceLifecycle::Joining | VoiceLifecycle::Active);
        if was_in_voice {
            *self.saved.lock().unwrap() = Some(flags);
        }
        self.state.store(VoiceLifecycle::NotInVoice as u8, Ordering::SeqCst);
    }

    /// Takes the saved flags (if any) for a reconnect-triggered rejoin.
    /// Consumes them: a second reconnect with no intervening voice join
    /// does not replay a stale rejoin.
    pub fn take_rejoin_flags(&self) -> Option<VoiceFlags> {
        self.saved.lock().unwrap().take()
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_apply() {
        let c = LifecycleController::new();
        assert!(c.transition(VoiceLifecycle::Joining));
        assert!(c.transition(VoiceLifecycle::Active));
        assert!(c.transition(VoiceLifecycle::Leaving));
        assert!(c.transition(VoiceLifecycle::NotInVoice));
        assert_eq!(c.state(), VoiceLifecycle::NotInVoice);
    }

    #[test]
    fn illegal_transition_is_ignored() {
        let c = LifecycleController::new();
        assert!(!c.transition(VoiceLifecycle::Active));
        assert_eq!(c.state(), VoiceLifecycle::NotInVoice);
    }

    #[test]
    fn join_sound_fires_once_per_join() {
        let c = LifecycleController::new();
        c.transition(VoiceLifecycle::Joining);
        assert!(c.should_play_join_sound());
        assert!(!c.should_play_join_sound());
        c.transition(VoiceLifecycle::Active);
        c.transition(VoiceLifecycle::Leaving);
        c.transition(VoiceLifecycle::NotInVoice);
        c.transition(VoiceLifecycle::Joining);
        assert!(c.should_play_join_sound());
    }

    #[test]
    fn disconnect_while_active_saves_flags_for_rejoin() {
        let c = LifecycleController::new();
        c.transition(VoiceLifecycle::Joining);
        c.transition(VoiceLifecycle::Active);
        c.on_disconnect(VoiceFlags { muted: true, deafened: false });
        assert_eq!(c.state(), VoiceLifecycle::NotInVoice);
        assert_eq!(c.take_rejoin_flags(), Some(VoiceFlags { muted: true, deafened: false }));
        assert_eq!(c.take_rejoin_flags(), None);
    }

    #[test]
    fn disconnect_outside_voice_saves_nothing() {
        let c = LifecycleController::new();
        c.on_disconnect(VoiceFlags { muted: true, deafened: true });
        assert_eq!(c.take_rejoin_flags(), None);
    }

    #[test]
    fn suppressed_join_sound_stays_silent_through_active() {
        let c = LifecycleController::new();
        c.transition(VoiceLifecycle::Joining);
        c.suppress_join_sound();
        c.transition(VoiceLifecycle::Active);
        assert!(!c.should_play_join_sound());
    }
}
