use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of media tracks a participant can publish over a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackKind {
    Audio,
    ScreenVideo,
    ScreenAudio,
}

/// Set of track kinds currently published on one side of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet(BTreeSet<TrackKind>);

impl TrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Microphone-only set, the state every participant starts in.
    pub fn audio_only() -> Self {
        let mut set = Self::new();
        set.insert(TrackKind::Audio);
        set
    }

    pub fn insert(&mut self, kind: TrackKind) -> bool {
        self.0.insert(kind)
    }

    pub fn remove(&mut self, kind: TrackKind) -> bool {
        self.0.remove(&kind)
    }

    pub fn contains(&self, kind: TrackKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = TrackKind> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Kinds present in `self` but not in `other`.
    pub fn added_since(&self, other: &TrackSet) -> Vec<TrackKind> {
        self.iter().filter(|k| !other.contains(*k)).collect()
    }

    /// Kinds present in `other` but not in `self`.
    pub fn removed_since(&self, other: &TrackSet) -> Vec<TrackKind> {
        other.iter().filter(|k| !self.contains(*k)).collect()
    }
}

impl FromIterator<TrackKind> for TrackSet {
    fn from_iter<I: IntoIterator<Item = TrackKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One connection's membership record within a room.
///
/// The connection id is the identity and never changes; the display name
/// may be updated by an idempotent re-join.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub tracks: TrackSet,
}

impl Participant {
    pub fn new(connection_id: String, display_name: String) -> Self {
        Self {
            connection_id,
            display_name,
            joined_at: Utc::now(),
            tracks: TrackSet::audio_only(),
        }
    }

    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            connection_id: self.connection_id.clone(),
            display_name: self.display_name.clone(),
            joined_at: self.joined_at.timestamp(),
        }
    }
}

/// Member info sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub connection_id: String,
    pub display_name: String,
    /// Unix timestamp (seconds) when the member joined
    pub joined_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_set_diff() {
        let before = TrackSet::audio_only();
        let mut after = before.clone();
        after.insert(TrackKind::ScreenVideo);
        after.insert(TrackKind::ScreenAudio);

        assert_eq!(
            after.added_since(&before),
            vec![TrackKind::ScreenVideo, TrackKind::ScreenAudio]
        );
        assert!(after.removed_since(&before).is_empty());
        assert_eq!(before.removed_since(&after).len(), 2);
    }

    #[test]
    fn participant_starts_audio_only() {
        let p = Participant::new("c-1".into(), "Ana".into());
        assert!(p.tracks.contains(TrackKind::Audio));
        assert_eq!(p.tracks.len(), 1);
    }
}
