//! Per-event broadcast rooms for live attendee counts.
//!
//! Each event id maps to its own tokio broadcast channel. A WebSocket client
//! joins a room by subscribing to that channel, and the join handler
//! publishes `attendeeUpdated` to it after a successful add. Delivery is
//! fire-and-forget: there is no replay, and a subscriber that falls more
//! than the channel capacity behind skips the missed messages.
//!
//! Rooms are created on first join and removed by
//! [`RoomBroadcaster::prune_empty_rooms`] once nobody is subscribed.
//!
//! # Wire format
//!
//! ```json
//! {"type":"joinRoom","eventId":"6f1c..."}
//! {"type":"attendeeUpdated","eventId":"6f1c...","count":3}
//! ```
//!
//! # Example
//!
//! ```rust
//! use rollcall_server::rooms::{RoomBroadcaster, ServerMessage};
//! use uuid::Uuid;
//!
//! let rooms = RoomBroadcaster::new();
//! let event_id = Uuid::new_v4();
//!
//! let mut rx = rooms.join(event_id);
//! assert_eq!(rooms.publish_attendee_count(event_id, 1), 1);
//! assert_eq!(
//!     rx.try_recv().unwrap(),
//!     ServerMessage::AttendeeUpdated { event_id, count: 1 }
//! );
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};
use uuid::Uuid;

/// Default per-room channel capacity.
///
/// Room traffic is one small message per join, so a modest buffer is
/// plenty. Subscribers further behind than this receive `RecvError::Lagged`.
pub const DEFAULT_ROOM_CAPACITY: usize = 64;

/// Messages the server sends over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AttendeeUpdated { event_id: Uuid, count: usize },

    #[serde(rename_all = "camelCase")]
    RoomJoined { event_id: Uuid },

    #[serde(rename_all = "camelCase")]
    RoomLeft { event_id: Uuid },

    Error { message: String },
}

/// Messages a client sends over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { event_id: Uuid },

    #[serde(rename_all = "camelCase")]
    LeaveRoom { event_id: Uuid },
}

/// Registry of event rooms.
///
/// Cheap to clone; clones share the same rooms.
#[derive(Debug, Clone)]
pub struct RoomBroadcaster {
    rooms: Arc<RwLock<HashMap<Uuid, Sender<ServerMessage>>>>,
    capacity: usize,
    connections: Arc<AtomicUsize>,
}

impl RoomBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ROOM_CAPACITY)
    }

    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "room capacity must be positive");
        debug!(capacity, "Created room broadcaster");
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribes to an event's room, creating the room if needed.
    ///
    /// Only messages published after this call are received.
    #[must_use]
    pub fn join(&self, event_id: Uuid) -> Receiver<ServerMessage> {
        let mut rooms = self.rooms.write().unwrap();
        let sender = rooms
            .entry(event_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        let rx = sender.subscribe();

        debug!(
            event_id = %event_id,
            subscriber_count = sender.receiver_count(),
            "Subscriber joined room"
        );
        rx
    }

    /// Sends a message to everyone in the room.
    ///
    /// Returns the number of subscribers that received it; 0 when the room
    /// does not exist or is empty. Never blocks.
    pub fn publish(&self, event_id: Uuid, message: ServerMessage) -> usize {
        let rooms = self.rooms.read().unwrap();
        let Some(sender) = rooms.get(&event_id) else {
            trace!(event_id = %event_id, "No room to publish to");
            return 0;
        };

        match sender.send(message) {
            Ok(receivers) => {
                trace!(event_id = %event_id, receivers, "Published to room");
                receivers
            }
            Err(_) => {
                trace!(event_id = %event_id, "Room has no active subscribers");
                0
            }
        }
    }

    /// Publishes the new attendee count for an event.
    pub fn publish_attendee_count(&self, event_id: Uuid, count: usize) -> usize {
        self.publish(event_id, ServerMessage::AttendeeUpdated { event_id, count })
    }

    /// Number of live subscribers in a room.
    #[must_use]
    pub fn subscriber_count(&self, event_id: Uuid) -> usize {
        self.rooms
            .read()
            .unwrap()
            .get(&event_id)
            .map_or(0, Sender::receiver_count)
    }

    /// Number of rooms currently allocated, including empty ones not yet
    /// pruned.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    /// Drops rooms with no subscribers. Returns how many were removed.
    pub fn prune_empty_rooms(&self) -> usize {
        let mut rooms = self.rooms.write().unwrap();
        let before = rooms.len();
        rooms.retain(|_, sender| sender.receiver_count() > 0);
        let removed = before - rooms.len();

        if removed > 0 {
            debug!(removed_count = removed, remaining_count = rooms.len(), "Pruned empty rooms");
        }
        removed
    }

    /// Registers an open WebSocket connection until the guard is dropped.
    #[must_use]
    pub fn connection_opened(&self) -> ConnectionGuard {
        let count = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(connection_count = count, "WebSocket connection opened");
        ConnectionGuard {
            connections: Arc::clone(&self.connections),
        }
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Default for RoomBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the connection count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(connection_count = count, "WebSocket connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[test]
    fn test_publish_without_room_returns_zero() {
        let rooms = RoomBroadcaster::new();
        assert_eq!(rooms.publish_attendee_count(Uuid::new_v4(), 3), 0);
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn test_join_creates_room_lazily() {
        let rooms = RoomBroadcaster::new();
        let event_id = Uuid::new_v4();

        let _rx = rooms.join(event_id);
        assert_eq!(rooms.room_count(), 1);
        assert_eq!(rooms.subscriber_count(event_id), 1);

        let _rx2 = rooms.join(event_id);
        assert_eq!(rooms.room_count(), 1);
        assert_eq!(rooms.subscriber_count(event_id), 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_that_room() {
        let rooms = RoomBroadcaster::new();
        let party = Uuid::new_v4();
        let meetup = Uuid::new_v4();

        let mut party_a = rooms.join(party);
        let mut party_b = rooms.join(party);
        let mut meetup_rx = rooms.join(meetup);

        assert_eq!(rooms.publish_attendee_count(party, 2), 2);

        let expected = ServerMessage::AttendeeUpdated {
            event_id: party,
            count: 2,
        };
        assert_eq!(party_a.recv().await.unwrap(), expected);
        assert_eq!(party_b.recv().await.unwrap(), expected);
        assert_eq!(meetup_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_subscriber_does_not_see_earlier_messages() {
        let rooms = RoomBroadcaster::new();
        let event_id = Uuid::new_v4();

        let _early = rooms.join(event_id);
        rooms.publish_attendee_count(event_id, 1);

        let mut late = rooms.join(event_id);
        assert_eq!(late.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_messages() {
        let rooms = RoomBroadcaster::with_capacity(2);
        let event_id = Uuid::new_v4();
        let mut rx = rooms.join(event_id);

        for count in 1..=5 {
            rooms.publish_attendee_count(event_id, count);
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::AttendeeUpdated { event_id, count: 4 }
        );
    }

    #[test]
    fn test_prune_empty_rooms() {
        let rooms = RoomBroadcaster::new();
        let kept = Uuid::new_v4();
        let _rx = rooms.join(kept);
        drop(rooms.join(Uuid::new_v4()));

        assert_eq!(rooms.room_count(), 2);
        assert_eq!(rooms.prune_empty_rooms(), 1);
        assert_eq!(rooms.room_count(), 1);
        assert_eq!(rooms.subscriber_count(kept), 1);
    }

    #[test]
    fn test_clones_share_rooms() {
        let rooms = RoomBroadcaster::new();
        let clone = rooms.clone();
        let event_id = Uuid::new_v4();

        let mut rx = clone.join(event_id);
        assert_eq!(rooms.publish_attendee_count(event_id, 7), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_connection_guard_counts() {
        let rooms = RoomBroadcaster::new();
        assert_eq!(rooms.connection_count(), 0);

        let a = rooms.connection_opened();
        let b = rooms.clone().connection_opened();
        assert_eq!(rooms.connection_count(), 2);

        drop(a);
        assert_eq!(rooms.connection_count(), 1);
        drop(b);
        assert_eq!(rooms.connection_count(), 0);
    }

    #[test]
    fn test_server_message_wire_format() {
        let event_id = Uuid::nil();
        let json = serde_json::to_value(ServerMessage::AttendeeUpdated { event_id, count: 3 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "attendeeUpdated",
                "eventId": "00000000-0000-0000-0000-000000000000",
                "count": 3
            })
        );

        let json = serde_json::to_value(ServerMessage::Error {
            message: "bad frame".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "bad frame");
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"joinRoom","eventId":"00000000-0000-0000-0000-000000000000"}"#,
        )
        .unwrap();
        assert_eq!(msg, ClientMessage::JoinRoom { event_id: Uuid::nil() });

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"leaveRoom","eventId":"00000000-0000-0000-0000-000000000000"}"#,
        )
        .unwrap();
        assert_eq!(msg, ClientMessage::LeaveRoom { event_id: Uuid::nil() });

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"joinRoom","eventId":"x"}"#).is_err());
    }
}
