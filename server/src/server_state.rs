use std::collections::HashMap;
use std::num::Wrapping;
use std::time::{Duration, Instant};

use system::{CanvasId, ConnectionId, Permission, RoomUser, UserId, UserInfo};

/// How often the idle sweep runs.
pub const REAP_INTERVAL: Duration = Duration::from_secs(10);
/// Empty rooms younger than this are left alone, so a join that created
/// the room but has not added its occupant yet is not swept out from
/// under it.
pub const ROOM_STALE_AFTER: Duration = Duration::from_secs(30);

/// Presence Registry entry: one live websocket connection.
pub struct Connection {
    pub user: UserInfo,
    pub current_room: Option<CanvasId>,
    pub connected_at: Instant,
}

/// One connection's membership record within a room, carrying the
/// permission resolved at join time. Not live-updated if the underlying
/// grant changes mid-session.
pub struct Occupancy {
    pub connection_id: ConnectionId,
    pub user: UserInfo,
    pub permission: Permission,
    pub joined_at: Instant,
}

/// Occupancies are keyed by user id, so a reconnecting identity replaces
/// its stale entry instead of duplicating it.
pub struct Room {
    pub occupants: HashMap<UserId, Occupancy>,
    pub created_at: Instant,
}

/// Process-wide session state: who is online (Presence Registry) and which
/// canvas room each occupies (Room Registry). Lost on restart by design;
/// the Canvas Store is the durable source of truth.
pub struct ServerState {
    connection_id_source: Wrapping<ConnectionId>,
    pub connections: HashMap<ConnectionId, Connection>,
    pub rooms: HashMap<CanvasId, Room>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            connection_id_source: Wrapping(0),
            connections: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    pub fn create_connection(&mut self, user: UserInfo) -> ConnectionId {
        let connection_id = self.new_connection_id();
        self.connections.insert(
            connection_id,
            Connection {
                user,
                current_room: None,
                connected_at: Instant::now(),
            },
        );
        connection_id
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&connection_id)
    }

    /// Adds the connection to the room, lazily creating it. Returns the
    /// connection id of a displaced stale occupancy when the same identity
    /// was already present (reconnect race); the displaced connection's
    /// `current_room` is cleared so its later leave is a no-op.
    pub fn join_room(
        &mut self,
        connection_id: ConnectionId,
        user: UserInfo,
        canvas_id: &CanvasId,
        permission: Permission,
    ) -> Option<ConnectionId> {
        let now = Instant::now();
        let room = self.rooms.entry(canvas_id.clone()).or_insert_with(|| {
            log::info!("Creating room {}", canvas_id);
            Room {
                occupants: HashMap::new(),
                created_at: now,
            }
        });
        let user_id = user.id.clone();
        let displaced = room
            .occupants
            .insert(
                user_id,
                Occupancy {
                    connection_id,
                    user,
                    permission,
                    joined_at: now,
                },
            )
            .filter(|old| old.connection_id != connection_id)
            .map(|old| old.connection_id);
        if let Some(old_id) = displaced {
            if let Some(old_connection) = self.connections.get_mut(&old_id) {
                old_connection.current_room = None;
            }
        }
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.current_room = Some(canvas_id.clone());
        }
        displaced
    }

    /// Removes the connection's occupancy from its current room and eagerly
    /// deletes the room when it empties. Returns the room and the departed
    /// user for the `user-left` broadcast, or `None` when the connection
    /// was not in a room.
    pub fn leave_room(&mut self, connection_id: ConnectionId) -> Option<(CanvasId, UserInfo)> {
        let connection = self.connections.get_mut(&connection_id)?;
        let canvas_id = connection.current_room.take()?;
        let user_id = connection.user.id.clone();
        let mut removed = None;
        if let Some(room) = self.rooms.get_mut(&canvas_id) {
            // only the occupancy's owning connection may remove it; a
            // reconnect may have replaced the entry already
            if room.occupants.get(&user_id).map(|o| o.connection_id) == Some(connection_id) {
                removed = room.occupants.remove(&user_id);
                if let Some(occupancy) = &removed {
                    log::info!(
                        "User {} occupied room {} for {:?}",
                        user_id,
                        canvas_id,
                        occupancy.joined_at.elapsed()
                    );
                }
            }
            if room.occupants.is_empty() {
                self.rooms.remove(&canvas_id);
                log::info!("Room {} is empty, deleting", canvas_id);
            }
        }
        removed.map(|occupancy| (canvas_id, occupancy.user))
    }

    /// The connection's occupancy in the given room, or `None` when it is
    /// not currently joined to exactly that canvas.
    pub fn occupancy_for(
        &self,
        connection_id: ConnectionId,
        canvas_id: &CanvasId,
    ) -> Option<&Occupancy> {
        let connection = self.connections.get(&connection_id)?;
        if connection.current_room.as_ref() != Some(canvas_id) {
            return None;
        }
        self.rooms
            .get(canvas_id)?
            .occupants
            .get(&connection.user.id)
            .filter(|occupancy| occupancy.connection_id == connection_id)
    }

    pub fn room_connection_ids(&self, canvas_id: &CanvasId) -> Vec<ConnectionId> {
        self.rooms
            .get(canvas_id)
            .map(|room| room.occupants.values().map(|o| o.connection_id).collect())
            .unwrap_or_default()
    }

    pub fn room_users(&self, canvas_id: &CanvasId) -> Vec<RoomUser> {
        self.rooms
            .get(canvas_id)
            .map(|room| {
                room.occupants
                    .values()
                    .map(|o| RoomUser {
                        user: o.user.clone(),
                        permission: o.permission,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Defensive fallback for rooms whose join never completed; occupied
    /// rooms are never swept regardless of age. Returns the reaped ids.
    pub fn sweep_idle_rooms(&mut self, now: Instant) -> Vec<CanvasId> {
        let stale: Vec<CanvasId> = self
            .rooms
            .iter()
            .filter(|(_, room)| {
                room.occupants.is_empty()
                    && now.saturating_duration_since(room.created_at) > ROOM_STALE_AFTER
            })
            .map(|(canvas_id, _)| canvas_id.clone())
            .collect();
        for canvas_id in &stale {
            self.rooms.remove(canvas_id);
            log::info!("Reaped idle room {}", canvas_id);
        }
        stale
    }

    fn new_connection_id(&mut self) -> ConnectionId {
        self.connection_id_source += Wrapping(1);
        self.connection_id_source.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserInfo {
        UserInfo {
            id: id.into(),
            username: id.into(),
            avatar: None,
        }
    }

    #[test]
    fn it_removes_room_when_last_occupant_leaves() {
        let mut state = ServerState::new();
        let connection_id = state.create_connection(user("a"));
        state.join_room(connection_id, user("a"), &"c1".to_string(), Permission::Edit);
        assert!(state.rooms.contains_key("c1"));

        let (canvas_id, left) = state.leave_room(connection_id).expect("was joined");
        assert_eq!(canvas_id, "c1");
        assert_eq!(left.id, "a");
        assert!(state.rooms.is_empty());
        assert!(state.connection(connection_id).expect("present").current_room.is_none());
    }

    #[test]
    fn it_replaces_occupancy_on_reconnect() {
        let mut state = ServerState::new();
        let canvas_id = "c1".to_string();
        let old = state.create_connection(user("a"));
        state.join_room(old, user("a"), &canvas_id, Permission::Edit);
        let new = state.create_connection(user("a"));
        let displaced = state.join_room(new, user("a"), &canvas_id, Permission::Edit);

        assert_eq!(displaced, Some(old));
        assert_eq!(state.rooms["c1"].occupants.len(), 1);
        assert_eq!(state.rooms["c1"].occupants["a"].connection_id, new);
        assert!(state.connection(old).expect("present").current_room.is_none());

        // the displaced connection's late leave must not evict the new one
        assert!(state.leave_room(old).is_none());
        assert!(state.rooms.contains_key("c1"));
        assert!(state.occupancy_for(new, &canvas_id).is_some());
        assert!(state.occupancy_for(old, &canvas_id).is_none());
    }

    #[test]
    fn it_keeps_membership_in_at_most_one_room() {
        let mut state = ServerState::new();
        let connection_id = state.create_connection(user("a"));
        state.join_room(connection_id, user("a"), &"c1".to_string(), Permission::View);
        state.leave_room(connection_id);
        state.join_room(connection_id, user("a"), &"c2".to_string(), Permission::View);

        assert!(!state.rooms.contains_key("c1"));
        assert_eq!(
            state.connection(connection_id).expect("present").current_room.as_deref(),
            Some("c2")
        );
        assert!(state.occupancy_for(connection_id, &"c2".to_string()).is_some());
        assert!(state.occupancy_for(connection_id, &"c1".to_string()).is_none());
    }

    #[test]
    fn it_sweeps_only_stale_empty_rooms() {
        let mut state = ServerState::new();
        let now = Instant::now();
        let old = now - (ROOM_STALE_AFTER + Duration::from_secs(1));

        // a join that created the room but never added its occupant
        state.rooms.insert(
            "stale-empty".into(),
            Room {
                occupants: HashMap::new(),
                created_at: old,
            },
        );
        state.rooms.insert(
            "fresh-empty".into(),
            Room {
                occupants: HashMap::new(),
                created_at: now,
            },
        );
        let connection_id = state.create_connection(user("a"));
        state.join_room(connection_id, user("a"), &"occupied".to_string(), Permission::View);
        state.rooms.get_mut("occupied").expect("present").created_at = old;

        let reaped = state.sweep_idle_rooms(now);
        assert_eq!(reaped, vec!["stale-empty".to_string()]);
        assert!(state.rooms.contains_key("fresh-empty"));
        assert!(state.rooms.contains_key("occupied"));
    }
}
