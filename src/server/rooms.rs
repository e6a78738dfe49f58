//! Pub/Sub Rooms
//!
//! Room name to subscriber tokens. Connections are referenced by token
//! only; the server resolves tokens to live connections at delivery time.

use bytes::Bytes;
use hashbrown::HashMap;
use mio::Token;

/// Room registry owned by the server loop
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<Bytes, Vec<Token>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `token` to `room`. Returns false if it was already a member.
    pub fn join(&mut self, room: Bytes, token: Token) -> bool {
        let members = self.rooms.entry(room).or_default();
        if members.contains(&token) {
            return false;
        }
        members.push(token);
        true
    }

    /// Remove `token` from `room`, dropping the room once it is empty
    pub fn leave(&mut self, room: &[u8], token: Token) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let Some(pos) = members.iter().position(|&member| member == token) else {
            return false;
        };
        members.remove(pos);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        true
    }

    /// Subscribers of `room`, empty if nobody joined it
    pub fn subscribers(&self, room: &[u8]) -> &[Token] {
        self.rooms.get(room).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of non-empty rooms
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
