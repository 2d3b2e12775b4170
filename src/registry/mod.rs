use std::collections::HashMap;

use crate::models::{MemberInfo, Participant, TrackKind};

/// Outcome of a `join`: what the joining client and the rest of the room
/// need to hear. Computed atomically so the existing-members snapshot and
/// the broadcast recipient list describe the same instant.
#[derive(Debug)]
pub struct JoinOutcome {
    /// The joiner's registered record (authoritative `joined_at`).
    pub joiner: MemberInfo,
    /// Current members in join order, excluding the joiner.
    pub existing: Vec<MemberInfo>,
    /// Connection ids to notify with `participant-joined`.
    pub notify: Vec<String>,
    /// False when this was an idempotent re-join (display-name update only);
    /// no broadcast is owed in that case.
    pub announced: bool,
}

/// Outcome of a `leave`.
#[derive(Debug)]
pub struct LeaveOutcome {
    /// Remaining connection ids to notify with `participant-left`.
    pub notify: Vec<String>,
    /// True when the room's participant set became empty and the room was
    /// destroyed.
    pub room_destroyed: bool,
}

#[derive(Debug, Default)]
struct Room {
    participants: Vec<Participant>,
}

impl Room {
    fn position(&self, connection_id: &str) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.connection_id == connection_id)
    }

    fn member_ids_except(&self, exclude: &str) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.connection_id != exclude)
            .map(|p| p.connection_id.clone())
            .collect()
    }
}

/// Session Registry: owns the room → participants mapping.
///
/// Pure state: no I/O, no channels. Operations return outcome values that
/// tell the transport layer what to send where. Owned construction (empty
/// at startup) so independent instances can coexist in tests.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    rooms: HashMap<String, Room>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a participant to a room, creating the room on first join.
    ///
    /// A re-join by an already-registered connection updates the display
    /// name only and owes no broadcast.
    pub fn join(&mut self, room_id: &str, connection_id: &str, display_name: &str) -> JoinOutcome {
        let room = self.rooms.entry(room_id.to_string()).or_default();

        if let Some(idx) = room.position(connection_id) {
            room.participants[idx].display_name = display_name.to_string();
            return JoinOutcome {
                joiner: room.participants[idx].member_info(),
                existing: room
                    .participants
                    .iter()
                    .filter(|p| p.connection_id != connection_id)
                    .map(Participant::member_info)
                    .collect(),
                notify: Vec::new(),
                announced: false,
            };
        }

        let existing: Vec<MemberInfo> =
            room.participants.iter().map(Participant::member_info).collect();
        let notify = room.member_ids_except(connection_id);
        let joiner = Participant::new(connection_id.to_string(), display_name.to_string());
        let joiner_info = joiner.member_info();
        room.participants.push(joiner);

        tracing::info!(
            room_id = %room_id,
            connection_id = %connection_id,
            display = %display_name,
            members = room.participants.len(),
            "Participant joined room"
        );

        JoinOutcome {
            joiner: joiner_info,
            existing,
            notify,
            announced: true,
        }
    }

    /// Remove a participant from one room. Destroys the room when it
    /// becomes empty. Returns `None` when the connection was not a member
    /// (stale leave, silent no-op).
    pub fn leave(&mut self, connection_id: &str, room_id: &str) -> Option<LeaveOutcome> {
        let room = self.rooms.get_mut(room_id)?;
        let idx = room.position(connection_id)?;
        room.participants.remove(idx);

        let notify = room.member_ids_except(connection_id);
        let room_destroyed = room.participants.is_empty();
        if room_destroyed {
            self.rooms.remove(room_id);
            tracing::info!(room_id = %room_id, "Room destroyed (last participant left)");
        }

        tracing::info!(
            room_id = %room_id,
            connection_id = %connection_id,
            "Participant left room"
        );

        Some(LeaveOutcome {
            notify,
            room_destroyed,
        })
    }

    /// Remove a connection from every room it belongs to. Used on transport
    /// disconnect: each membership produces its own leave outcome/broadcast.
    pub fn leave_all(&mut self, connection_id: &str) -> Vec<(String, LeaveOutcome)> {
        let room_ids: Vec<String> = self.rooms_of(connection_id);
        room_ids
            .into_iter()
            .filter_map(|room_id| {
                self.leave(connection_id, &room_id)
                    .map(|outcome| (room_id, outcome))
            })
            .collect()
    }

    /// Update a participant's published screen-track kinds when a
    /// screen-share marker passes through. Returns the broadcast recipient
    /// list, or `None` when the connection is not a member of the room.
    pub fn set_screen_tracks(
        &mut self,
        room_id: &str,
        connection_id: &str,
        sharing: bool,
    ) -> Option<Vec<String>> {
        let room = self.rooms.get_mut(room_id)?;
        let idx = room.position(connection_id)?;
        let tracks = &mut room.participants[idx].tracks;
        if sharing {
            tracks.insert(TrackKind::ScreenVideo);
            tracks.insert(TrackKind::ScreenAudio);
        } else {
            tracks.remove(TrackKind::ScreenVideo);
            tracks.remove(TrackKind::ScreenAudio);
        }
        Some(room.member_ids_except(connection_id))
    }

    /// Current members of a room in join order; empty when the room does
    /// not exist.
    pub fn members(&self, room_id: &str) -> Vec<MemberInfo> {
        self.rooms
            .get(room_id)
            .map(|r| r.participants.iter().map(Participant::member_info).collect())
            .unwrap_or_default()
    }

    /// Connection ids of a room's members, minus an optional exclusion.
    pub fn member_ids(&self, room_id: &str, exclude: Option<&str>) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|r| {
                r.participants
                    .iter()
                    .filter(|p| Some(p.connection_id.as_str()) != exclude)
                    .map(|p| p.connection_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rooms a connection currently belongs to.
    pub fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.position(connection_id).is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total memberships across all rooms.
    pub fn participant_count(&self) -> usize {
        self.rooms.values().map(|r| r.participants.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn first_join_creates_room_with_empty_snapshot() {
        let mut registry = SessionRegistry::new();
        let outcome = registry.join("room-1", "conn-a", "Ana");

        assert!(outcome.existing.is_empty());
        assert!(outcome.notify.is_empty());
        assert!(outcome.announced);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn second_join_sees_first_and_notifies_it() {
        let mut registry = SessionRegistry::new();
        registry.join("room-1", "conn-a", "Ana");
        let outcome = registry.join("room-1", "conn-b", "Bora");

        assert_eq!(outcome.existing.len(), 1);
        assert_eq!(outcome.existing[0].connection_id, "conn-a");
        assert_eq!(outcome.existing[0].display_name, "Ana");
        assert_eq!(outcome.notify, vec!["conn-a".to_string()]);
        assert!(outcome.announced);
    }

    #[test]
    fn snapshot_preserves_join_order() {
        let mut registry = SessionRegistry::new();
        for (conn, name) in [("c1", "U1"), ("c2", "U2"), ("c3", "U3")] {
            registry.join("room-1", conn, name);
        }
        let outcome = registry.join("room-1", "c4", "U4");
        let ids: Vec<&str> = outcome
            .existing
            .iter()
            .map(|m| m.connection_id.as_str())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn rejoin_updates_display_name_without_broadcast() {
        let mut registry = SessionRegistry::new();
        registry.join("room-1", "conn-a", "Ana");
        registry.join("room-1", "conn-b", "Bora");

        let outcome = registry.join("room-1", "conn-a", "Ana Banana");
        assert!(!outcome.announced);
        assert!(outcome.notify.is_empty());
        // No duplicate membership was created.
        assert_eq!(registry.members("room-1").len(), 2);
        assert_eq!(registry.members("room-1")[0].display_name, "Ana Banana");
    }

    #[test]
    fn leave_notifies_remaining_and_destroys_empty_room() {
        let mut registry = SessionRegistry::new();
        registry.join("room-1", "conn-a", "Ana");
        registry.join("room-1", "conn-b", "Bora");

        let outcome = registry.leave("conn-a", "room-1").expect("was a member");
        assert_eq!(outcome.notify, vec!["conn-b".to_string()]);
        assert!(!outcome.room_destroyed);

        let outcome = registry.leave("conn-b", "room-1").expect("was a member");
        assert!(outcome.notify.is_empty());
        assert!(outcome.room_destroyed);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn leave_is_idempotent() {
        let mut registry = SessionRegistry::new();
        registry.join("room-1", "conn-a", "Ana");
        assert!(registry.leave("conn-a", "room-1").is_some());
        assert!(registry.leave("conn-a", "room-1").is_none());
        assert!(registry.leave("conn-a", "never-existed").is_none());
    }

    #[test]
    fn leave_all_covers_every_membership() {
        let mut registry = SessionRegistry::new();
        registry.join("room-1", "conn-a", "Ana");
        registry.join("room-2", "conn-a", "Ana");
        registry.join("room-2", "conn-b", "Bora");

        let outcomes = registry.leave_all("conn-a");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(registry.rooms_of("conn-a").len(), 0);
        // room-1 emptied, room-2 still holds conn-b.
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.members("room-2").len(), 1);
    }

    #[test]
    fn member_count_matches_join_leave_interleaving() {
        let mut registry = SessionRegistry::new();
        registry.join("r", "c1", "a");
        registry.join("r", "c2", "b");
        registry.join("r", "c3", "c");
        registry.leave("c2", "r");
        registry.join("r", "c4", "d");
        registry.leave("c1", "r");

        assert_eq!(registry.members("r").len(), 2);
        assert_eq!(registry.member_ids("r", None), vec!["c3", "c4"]);
        assert_eq!(registry.participant_count(), 2);
    }

    #[test]
    fn screen_track_bookkeeping() {
        let mut registry = SessionRegistry::new();
        registry.join("r", "c1", "a");
        registry.join("r", "c2", "b");

        let notify = registry.set_screen_tracks("r", "c1", true).unwrap();
        assert_eq!(notify, vec!["c2".to_string()]);

        // Stale room or non-member: silent no-op.
        assert!(registry.set_screen_tracks("gone", "c1", true).is_none());
        assert!(registry.set_screen_tracks("r", "stranger", true).is_none());

        registry.set_screen_tracks("r", "c1", false).unwrap();
    }

    #[test]
    fn room_abcde_scenario() {
        let mut registry = SessionRegistry::new();

        // U1 joins as Ana: empty snapshot.
        let u1 = registry.join("ABCDE", "u1", "Ana");
        assert!(u1.existing.is_empty());

        // U2 joins as Bora: sees Ana; Ana is notified.
        let u2 = registry.join("ABCDE", "u2", "Bora");
        assert_eq!(u2.existing.len(), 1);
        assert_eq!(u2.existing[0].display_name, "Ana");
        assert_eq!(u2.notify, vec!["u1".to_string()]);

        // U1 disconnects: U2 is notified, room persists.
        let outcomes = registry.leave_all("u1");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "ABCDE");
        assert_eq!(outcomes[0].1.notify, vec!["u2".to_string()]);
        assert!(!outcomes[0].1.room_destroyed);

        // U2 leaves: room destroyed.
        let last = registry.leave("u2", "ABCDE").unwrap();
        assert!(last.room_destroyed);
        assert_eq!(registry.room_count(), 0);
    }
}
