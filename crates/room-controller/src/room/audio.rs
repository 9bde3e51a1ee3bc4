//! Active speaker tracking.
//!
//! Each router's audio level observer reports its loudest producer (or
//! silence). The room keeps one [`AudioLevelState`] per router and
//! recomputes the room-wide loudest peer as the maximum volume across
//! all router records. A notification is emitted when the winning peer
//! changes, or at most once per second while the same non-null speaker
//! keeps winning, so volume jitter cannot cause notification storms.

use common::types::PeerId;
use tokio::time::Instant;

/// Volume reported when no producer is above the threshold.
pub const SILENT_VOLUME: i16 = -1000;

/// Debounce window for repeated same-speaker updates.
const SPEAKER_REFRESH_INTERVAL_MS: u64 = 1000;

/// Loudest producer on one router, updated only by engine events.
#[derive(Debug, Clone, Default)]
pub struct AudioLevelState {
    pub peer_id: Option<PeerId>,
    pub volume: i16,
}

impl AudioLevelState {
    /// Record a volumes report.
    pub fn on_volumes(&mut self, peer_id: PeerId, volume: i16) {
        self.peer_id = Some(peer_id);
        self.volume = volume;
    }

    /// Record a silence report.
    pub fn on_silence(&mut self) {
        self.peer_id = None;
        self.volume = SILENT_VOLUME;
    }
}

/// Room-wide active speaker broadcast, when one is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerUpdate {
    pub peer_id: Option<PeerId>,
    pub volume: i16,
}

/// Debounced active-speaker change detector.
#[derive(Debug, Default)]
pub struct ActiveSpeakerTracker {
    current: Option<PeerId>,
    last_notified: Option<Instant>,
}

impl ActiveSpeakerTracker {
    /// Feed the current per-router records; returns the update to
    /// broadcast, if any is due now.
    pub fn evaluate<'a>(
        &mut self,
        levels: impl Iterator<Item = &'a AudioLevelState>,
        now: Instant,
    ) -> Option<SpeakerUpdate> {
        let mut winner: Option<PeerId> = None;
        let mut max_volume = SILENT_VOLUME;

        for level in levels {
            if let Some(peer_id) = &level.peer_id {
                if level.volume > max_volume {
                    max_volume = level.volume;
                    winner = Some(peer_id.clone());
                }
            }
        }

        let changed = winner != self.current;
        let refresh_due = winner.is_some()
            && self.last_notified.is_none_or(|at| {
                now.duration_since(at).as_millis() as u64 >= SPEAKER_REFRESH_INTERVAL_MS
            });

        if !changed && !refresh_due {
            return None;
        }

        self.current = winner.clone();
        if winner.is_some() {
            self.last_notified = Some(now);
        }

        Some(SpeakerUpdate {
            peer_id: winner,
            volume: max_volume,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn speaking(peer: &str, volume: i16) -> AudioLevelState {
        AudioLevelState {
            peer_id: Some(PeerId::from(peer)),
            volume,
        }
    }

    fn silent() -> AudioLevelState {
        AudioLevelState::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_speaker_notifies_immediately() {
        let mut tracker = ActiveSpeakerTracker::default();
        let levels = [speaking("a", -50)];

        let update = tracker.evaluate(levels.iter(), Instant::now()).unwrap();
        assert_eq!(update.peer_id, Some(PeerId::from("a")));
        assert_eq!(update.volume, -50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loudest_router_wins() {
        let mut tracker = ActiveSpeakerTracker::default();
        let levels = [speaking("a", -60), speaking("b", -30), silent()];

        let update = tracker.evaluate(levels.iter(), Instant::now()).unwrap();
        assert_eq!(update.peer_id, Some(PeerId::from("b")));
        assert_eq!(update.volume, -30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_speaker_is_debounced_within_a_second() {
        let mut tracker = ActiveSpeakerTracker::default();
        let levels = [speaking("a", -50)];

        assert!(tracker.evaluate(levels.iter(), Instant::now()).is_some());

        tokio::time::advance(Duration::from_millis(300)).await;
        let jitter = [speaking("a", -45)];
        assert!(tracker.evaluate(jitter.iter(), Instant::now()).is_none());

        tokio::time::advance(Duration::from_millis(800)).await;
        let update = tracker.evaluate(jitter.iter(), Instant::now()).unwrap();
        assert_eq!(update.peer_id, Some(PeerId::from("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaker_change_bypasses_debounce() {
        let mut tracker = ActiveSpeakerTracker::default();

        let first = [speaking("a", -50)];
        assert!(tracker.evaluate(first.iter(), Instant::now()).is_some());

        tokio::time::advance(Duration::from_millis(100)).await;
        let second = [speaking("b", -40)];
        let update = tracker.evaluate(second.iter(), Instant::now()).unwrap();
        assert_eq!(update.peer_id, Some(PeerId::from("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_notifies_once_with_null_peer() {
        let mut tracker = ActiveSpeakerTracker::default();

        let levels = [speaking("a", -50)];
        assert!(tracker.evaluate(levels.iter(), Instant::now()).is_some());

        tokio::time::advance(Duration::from_millis(100)).await;
        let quiet = [silent()];
        let update = tracker.evaluate(quiet.iter(), Instant::now()).unwrap();
        assert_eq!(update.peer_id, None);
        assert_eq!(update.volume, SILENT_VOLUME);

        // Prolonged silence with no new speaker is not re-broadcast.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(tracker.evaluate(quiet.iter(), Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_level_state_transitions() {
        let mut state = AudioLevelState::default();
        state.on_volumes(PeerId::from("a"), -42);
        assert_eq!(state.peer_id, Some(PeerId::from("a")));
        assert_eq!(state.volume, -42);

        state.on_silence();
        assert_eq!(state.peer_id, None);
        assert_eq!(state.volume, SILENT_VOLUME);
    }
}
