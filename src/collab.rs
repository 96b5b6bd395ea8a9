//! Ephemeral presence and edit relay for people editing the same request.
//!
//! Rooms are keyed by resource id and live only while they have members.
//! Edits are relayed verbatim to the other members, at most once, with no
//! merge or reconciliation: two members editing at once can end up with
//! different local copies and nothing here will converge them. Members should
//! treat the roster with the highest `seq` as authoritative.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Participant {
    pub connection_id: String,
    pub display_name: String,
}

/// Frames sent by an editor.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        resource_id: String,
        display_name: String,
    },
    Leave {
        resource_id: String,
    },
    Edit {
        resource_id: String,
        payload: Value,
    },
    Cursor {
        resource_id: String,
        field: String,
        position: Value,
    },
}

/// Frames delivered to an editor.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        connection_id: String,
    },
    Roster {
        resource_id: String,
        seq: u64,
        participants: Vec<Participant>,
    },
    Edited {
        resource_id: String,
        connection_id: String,
        payload: Value,
    },
    CursorMoved {
        resource_id: String,
        connection_id: String,
        field: String,
        position: Value,
    },
}

/// Bounded queue of frames waiting to be written to one connection.
/// Pushing never waits: a full queue drops the frame.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn push(&self, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("outbox is full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Like `push`, but also drops the frame once no more than `headroom`
    /// slots are left, keeping them for rosters and edits.
    pub fn push_droppable(&self, message: ServerMessage, headroom: usize) -> bool {
        if self.tx.capacity() <= headroom {
            debug!("outbox is busy, dropping cursor update");
            return false;
        }
        self.push(message)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub outbox_capacity: usize,
    pub cursor_headroom: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            cursor_headroom: 32,
        }
    }
}

struct Member {
    display_name: String,
    outbox: Outbox,
}

#[derive(Default)]
struct Room {
    members: IndexMap<String, Member>,
    seq: u64,
    // Set once the last member leaves; a closed room is never reused.
    closed: bool,
}

impl Room {
    fn roster(&self) -> Vec<Participant> {
        self.members
            .iter()
            .map(|(connection_id, member)| Participant {
                connection_id: connection_id.clone(),
                display_name: member.display_name.clone(),
            })
            .collect()
    }

    fn broadcast_roster(&mut self, resource_id: &str) {
        self.seq += 1;
        let message = ServerMessage::Roster {
            resource_id: resource_id.to_string(),
            seq: self.seq,
            participants: self.roster(),
        };
        for member in self.members.values() {
            member.outbox.push(message.clone());
        }
    }
}

type SharedRoom = Arc<Mutex<Room>>;

fn lock(room: &SharedRoom) -> MutexGuard<'_, Room> {
    room.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every room and the outbox of every connected editor.
///
/// Each room has its own lock; the registry lock is held only to look up,
/// insert or remove a room, never while a room lock is held.
pub struct SessionManager {
    rooms: RwLock<HashMap<String, SharedRoom>>,
    connections: RwLock<HashMap<String, Outbox>>,
    options: SessionOptions,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn start(options: SessionOptions) -> Self {
        info!(
            outbox_capacity = options.outbox_capacity,
            "collaboration sessions started"
        );
        Self {
            rooms: RwLock::default(),
            connections: RwLock::default(),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Closes every room and releases every outbox, which ends the
    /// connections reading from them. Later calls are no-ops.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let rooms: Vec<SharedRoom> = self
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, room)| room)
            .collect();
        for room in rooms {
            let mut room = lock(&room);
            room.closed = true;
            room.members.clear();
        }
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("collaboration sessions stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn new_outbox(&self) -> (Outbox, mpsc::Receiver<ServerMessage>) {
        Outbox::channel(self.options.outbox_capacity)
    }

    /// Binds a connection id to the outbox its frames are delivered to.
    pub fn register(&self, connection_id: &str, outbox: Outbox) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id.to_string(), outbox);
        true
    }

    fn outbox(&self, connection_id: &str) -> Option<Outbox> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
    }

    fn room(&self, resource_id: &str) -> Option<SharedRoom> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .cloned()
    }

    /// Returns `None` once stopped. The check runs under the registry lock
    /// so no room can be created after `stop` drains the registry.
    fn room_or_create(&self, resource_id: &str) -> Option<SharedRoom> {
        if let Some(room) = self.room(resource_id) {
            return Some(room);
        }
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() {
            return None;
        }
        Some(Arc::clone(rooms.entry(resource_id.to_string()).or_insert_with(|| {
            info!(resource_id, "room created");
            SharedRoom::default()
        })))
    }

    fn remove_room(&self, resource_id: &str, room: &SharedRoom) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms
            .get(resource_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(resource_id);
            info!(resource_id, "room destroyed");
        }
    }

    /// Adds the connection to the room, creating the room if needed, and
    /// sends the new roster to every member including the joiner. Joining
    /// again only updates the display name.
    pub fn join(&self, resource_id: &str, connection_id: &str, display_name: &str) -> bool {
        if self.is_stopped() {
            return false;
        }
        let Some(outbox) = self.outbox(connection_id) else {
            warn!(connection_id, "join from unknown connection ignored");
            return false;
        };

        loop {
            if self.is_stopped() {
                return false;
            }
            let Some(room) = self.room_or_create(resource_id) else {
                return false;
            };
            let mut guard = lock(&room);
            if guard.closed {
                // Emptied by a concurrent leave; drop it and start a fresh one.
                drop(guard);
                self.remove_room(resource_id, &room);
                continue;
            }
            guard.members.insert(
                connection_id.to_string(),
                Member {
                    display_name: display_name.to_string(),
                    outbox: outbox.clone(),
                },
            );
            guard.broadcast_roster(resource_id);
            debug!(resource_id, connection_id, display_name, "joined room");
            return true;
        }
    }

    /// Removes the connection from the room. Remaining members get the new
    /// roster; the room is destroyed once it is empty. Unknown rooms and
    /// non-members are ignored.
    pub fn leave(&self, resource_id: &str, connection_id: &str) -> bool {
        let Some(room) = self.room(resource_id) else {
            return false;
        };

        let emptied = {
            let mut guard = lock(&room);
            if guard.members.shift_remove(connection_id).is_none() {
                return false;
            }
            if guard.members.is_empty() {
                guard.closed = true;
                true
            } else {
                guard.broadcast_roster(resource_id);
                false
            }
        };
        debug!(resource_id, connection_id, "left room");

        if emptied {
            self.remove_room(resource_id, &room);
        }
        true
    }

    /// Leaves every room the connection is in and forgets its outbox.
    /// Calling it again for the same connection does nothing.
    pub fn disconnect(&self, connection_id: &str) -> usize {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);

        let resource_ids: Vec<String> = self
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        resource_ids
            .iter()
            .filter(|resource_id| self.leave(resource_id, connection_id))
            .count()
    }

    /// Relays `payload` to every other member of the room. Returns how many
    /// outboxes accepted it.
    pub fn edit(&self, resource_id: &str, connection_id: &str, payload: Value) -> usize {
        let message = ServerMessage::Edited {
            resource_id: resource_id.to_string(),
            connection_id: connection_id.to_string(),
            payload,
        };
        self.relay(resource_id, connection_id, message, None)
    }

    /// Same as `edit` for cursor positions, which are dropped first when a
    /// recipient falls behind.
    pub fn cursor_move(
        &self,
        resource_id: &str,
        connection_id: &str,
        field: &str,
        position: Value,
    ) -> usize {
        let message = ServerMessage::CursorMoved {
            resource_id: resource_id.to_string(),
            connection_id: connection_id.to_string(),
            field: field.to_string(),
            position,
        };
        self.relay(
            resource_id,
            connection_id,
            message,
            Some(self.options.cursor_headroom),
        )
    }

    fn relay(
        &self,
        resource_id: &str,
        sender: &str,
        message: ServerMessage,
        headroom: Option<usize>,
    ) -> usize {
        let Some(room) = self.room(resource_id) else {
            return 0;
        };
        let guard = lock(&room);
        if !guard.members.contains_key(sender) {
            debug!(resource_id, sender, "relay from non-member ignored");
            return 0;
        }

        let delivered = guard
            .members
            .iter()
            .filter(|(connection_id, _)| connection_id.as_str() != sender)
            .filter(|(_, member)| match headroom {
                Some(headroom) => member.outbox.push_droppable(message.clone(), headroom),
                None => member.outbox.push(message.clone()),
            })
            .count();
        debug!(resource_id, sender, delivered, "relayed");
        delivered
    }

    pub fn handle(&self, connection_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Join {
                resource_id,
                display_name,
            } => {
                self.join(&resource_id, connection_id, &display_name);
            }
            ClientMessage::Leave { resource_id } => {
                self.leave(&resource_id, connection_id);
            }
            ClientMessage::Edit {
                resource_id,
                payload,
            } => {
                self.edit(&resource_id, connection_id, payload);
            }
            ClientMessage::Cursor {
                resource_id,
                field,
                position,
            } => {
                self.cursor_move(&resource_id, connection_id, &field, position);
            }
        }
    }

    pub fn roster(&self, resource_id: &str) -> Option<Vec<Participant>> {
        self.room(resource_id).map(|room| lock(&room).roster())
    }

    pub fn room_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ROOM: &str = "request-1";

    fn manager() -> SessionManager {
        SessionManager::start(SessionOptions::default())
    }

    fn connect(
        manager: &SessionManager,
        connection_id: &str,
    ) -> mpsc::Receiver<ServerMessage> {
        let (outbox, rx) = manager.new_outbox();
        manager.register(connection_id, outbox);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = vec![];
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn participant(connection_id: &str, display_name: &str) -> Participant {
        Participant {
            connection_id: connection_id.to_string(),
            display_name: display_name.to_string(),
        }
    }

    fn roster(seq: u64, participants: Vec<Participant>) -> ServerMessage {
        ServerMessage::Roster {
            resource_id: ROOM.to_string(),
            seq,
            participants,
        }
    }

    #[test]
    fn join_broadcasts_roster_to_everyone() {
        let manager = manager();
        let mut c1 = connect(&manager, "c1");
        let mut c2 = connect(&manager, "c2");

        manager.join(ROOM, "c1", "alice");
        manager.join(ROOM, "c2", "bob");

        let both = vec![participant("c1", "alice"), participant("c2", "bob")];
        assert_eq!(
            vec![
                roster(1, vec![participant("c1", "alice")]),
                roster(2, both.clone())
            ],
            drain(&mut c1)
        );
        assert_eq!(vec![roster(2, both)], drain(&mut c2));
    }

    #[test]
    fn room_lives_until_last_member_leaves() {
        let manager = manager();
        let mut c1 = connect(&manager, "c1");
        let mut c2 = connect(&manager, "c2");
        manager.join(ROOM, "c1", "alice");
        manager.join(ROOM, "c2", "bob");
        drain(&mut c1);
        drain(&mut c2);

        assert!(manager.leave(ROOM, "c1"));

        assert_eq!(Some(vec![participant("c2", "bob")]), manager.roster(ROOM));
        assert_eq!(vec![roster(3, vec![participant("c2", "bob")])], drain(&mut c2));
        assert_eq!(Vec::<ServerMessage>::new(), drain(&mut c1));

        assert!(manager.leave(ROOM, "c2"));
        assert_eq!(None, manager.roster(ROOM));
        assert_eq!(0, manager.room_count());
    }

    #[test]
    fn new_room_after_destroy_restarts_sequence() {
        let manager = manager();
        let mut c1 = connect(&manager, "c1");
        manager.join(ROOM, "c1", "alice");
        manager.leave(ROOM, "c1");
        drain(&mut c1);

        manager.join(ROOM, "c1", "alice");

        assert_eq!(vec![roster(1, vec![participant("c1", "alice")])], drain(&mut c1));
    }

    #[test]
    fn edit_is_relayed_to_others_but_not_echoed() {
        let manager = manager();
        let mut receivers: Vec<_> = ["c1", "c2", "c3"]
            .iter()
            .map(|id| {
                let rx = connect(&manager, id);
                manager.join(ROOM, id, id);
                rx
            })
            .collect();
        receivers.iter_mut().for_each(|rx| {
            drain(rx);
        });

        let delivered = manager.edit(ROOM, "c1", json!({ "url": "http://x" }));

        let expected = ServerMessage::Edited {
            resource_id: ROOM.to_string(),
            connection_id: "c1".to_string(),
            payload: json!({ "url": "http://x" }),
        };
        assert_eq!(2, delivered);
        assert_eq!(Vec::<ServerMessage>::new(), drain(&mut receivers[0]));
        assert_eq!(vec![expected.clone()], drain(&mut receivers[1]));
        assert_eq!(vec![expected], drain(&mut receivers[2]));
    }

    #[test]
    fn relay_preserves_sender_order() {
        let manager = manager();
        let _c1 = connect(&manager, "c1");
        let mut c2 = connect(&manager, "c2");
        manager.join(ROOM, "c1", "alice");
        manager.join(ROOM, "c2", "bob");
        drain(&mut c2);

        for n in 0..5 {
            manager.edit(ROOM, "c1", json!(n));
        }

        let payloads: Vec<Value> = drain(&mut c2)
            .into_iter()
            .filter_map(|message| match message {
                ServerMessage::Edited { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(vec![json!(0), json!(1), json!(2), json!(3), json!(4)], payloads);
    }

    #[test]
    fn operations_on_unknown_rooms_are_no_ops() {
        let manager = manager();
        let _c1 = connect(&manager, "c1");

        assert!(!manager.leave("ghost", "c1"));
        assert_eq!(0, manager.edit("ghost", "c1", json!({})));
        assert_eq!(0, manager.cursor_move("ghost", "c1", "url", json!(3)));
        assert_eq!(0, manager.room_count());
    }

    #[test]
    fn non_members_cannot_relay() {
        let manager = manager();
        let mut c1 = connect(&manager, "c1");
        let _c2 = connect(&manager, "c2");
        manager.join(ROOM, "c1", "alice");
        drain(&mut c1);

        assert_eq!(0, manager.edit(ROOM, "c2", json!({})));
        assert_eq!(Vec::<ServerMessage>::new(), drain(&mut c1));
    }

    #[test]
    fn disconnect_leaves_every_room_and_is_idempotent() {
        let manager = manager();
        let _c1 = connect(&manager, "c1");
        let mut c2 = connect(&manager, "c2");
        manager.join("a", "c1", "alice");
        manager.join("b", "c1", "alice");
        manager.join("b", "c2", "bob");
        drain(&mut c2);

        assert_eq!(2, manager.disconnect("c1"));

        assert_eq!(None, manager.roster("a"));
        assert_eq!(Some(vec![participant("c2", "bob")]), manager.roster("b"));
        assert_eq!(
            vec![ServerMessage::Roster {
                resource_id: "b".to_string(),
                seq: 3,
                participants: vec![participant("c2", "bob")],
            }],
            drain(&mut c2)
        );

        assert_eq!(0, manager.disconnect("c1"));
        assert_eq!(1, manager.room_count());
    }

    #[test]
    fn join_from_unregistered_connection_is_ignored() {
        let manager = manager();
        assert!(!manager.join(ROOM, "nobody", "ghost"));
        assert_eq!(0, manager.room_count());
    }

    #[test]
    fn full_outbox_drops_instead_of_blocking() {
        let manager = SessionManager::start(SessionOptions {
            outbox_capacity: 2,
            cursor_headroom: 1,
        });
        let _c1 = connect(&manager, "c1");
        let mut c2 = connect(&manager, "c2");
        manager.join(ROOM, "c1", "alice");
        manager.join(ROOM, "c2", "bob");

        // c2 holds one roster frame, leaving a single free slot.
        assert_eq!(0, manager.cursor_move(ROOM, "c1", "url", json!(1)));
        assert_eq!(1, manager.edit(ROOM, "c1", json!("first")));
        assert_eq!(0, manager.edit(ROOM, "c1", json!("second")));

        assert_eq!(2, drain(&mut c2).len());
    }

    #[test]
    fn cursor_moves_are_relayed_when_there_is_room() {
        let manager = manager();
        let _c1 = connect(&manager, "c1");
        let mut c2 = connect(&manager, "c2");
        manager.join(ROOM, "c1", "alice");
        manager.join(ROOM, "c2", "bob");
        drain(&mut c2);

        manager.cursor_move(ROOM, "c1", "body", json!({ "line": 3, "column": 7 }));

        assert_eq!(
            vec![ServerMessage::CursorMoved {
                resource_id: ROOM.to_string(),
                connection_id: "c1".to_string(),
                field: "body".to_string(),
                position: json!({ "line": 3, "column": 7 }),
            }],
            drain(&mut c2)
        );
    }

    #[tokio::test]
    async fn stop_closes_rooms_and_outboxes() {
        let manager = manager();
        let mut c1 = connect(&manager, "c1");
        manager.join(ROOM, "c1", "alice");
        drain(&mut c1);

        manager.stop();
        manager.stopped().await;

        assert_eq!(None, c1.recv().await);
        assert_eq!(0, manager.room_count());
        assert!(!manager.join(ROOM, "c1", "alice"));
        manager.stop();
    }

    #[test]
    fn join_racing_stop_leaves_no_room_behind() {
        let manager = manager();
        let mut c1 = connect(&manager, "c1");
        // Cancelled but not yet drained, as seen by a join mid-way through stop.
        manager.shutdown.cancel();

        assert_eq!(None, manager.room_or_create(ROOM).map(|_| ()));
        assert!(!manager.join(ROOM, "c1", "alice"));
        assert_eq!(0, manager.room_count());
        assert_eq!(Vec::<ServerMessage>::new(), drain(&mut c1));
    }

    #[test]
    fn handle_dispatches_client_frames() {
        let manager = manager();
        let mut c1 = connect(&manager, "c1");
        let frame: ClientMessage = serde_json::from_value(json!({
            "type": "join",
            "resource_id": ROOM,
            "display_name": "alice",
        }))
        .unwrap();

        manager.handle("c1", frame);

        assert_eq!(vec![roster(1, vec![participant("c1", "alice")])], drain(&mut c1));
    }
}
