//! Connection table.
//!
//! Records live in an arena of slots. A cookie packs the slot index in its
//! low 32 bits and a generation in its high 32 bits; generations come from a
//! counter that only grows, so a cookie that outlived its connection never
//! resolves to the connection that reused its slot.

use std::time::Instant;

use switchboard_core::{cookie, Id};
use switchboard_fabric::{Message, MessageId, PeerInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Accepting,
    /// Cookie minted, waiting for `RouterConnect`.
    Accepted,
    Active,
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct ConnectionRecord {
    pub cookie: Id,
    pub peer: PeerInfo,
    pub nick_name: Option<String>,
    pub state: ConnectionState,
    pub last_activity: Instant,
    pub(crate) outbox: mpsc::Sender<Message>,
    pub(crate) cancel: CancellationToken,
    /// Latest `ServiceAvailable` per stub broadcast by this peer.
    pub(crate) announcements: Vec<Message>,
}

impl ConnectionRecord {
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Track a broadcast stub announcement or withdrawal.
    ///
    /// Stubs are identified by the encoded payload.
    pub(crate) fn record_announcement(&mut self, message: &Message) {
        match message.id {
            MessageId::ServiceAvailable => {
                self.announcements.retain(|known| known.payload != message.payload);
                self.announcements.push(message.clone());
            }
            MessageId::ServiceUnavailable => {
                self.announcements.retain(|known| known.payload != message.payload);
            }
            _ => {}
        }
    }

    /// Ask both connection tasks to stop
    pub(crate) fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closing;
        }
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    record: Option<ConnectionRecord>,
}

#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_generation: u32,
    len: usize,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_generation: 1,
            len: 0,
        }
    }

    /// Mint a cookie and store a record in state `Accepted`
    pub(crate) fn insert(
        &mut self,
        peer: PeerInfo,
        outbox: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Id {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let generation = self.mint_generation();
        let cookie = make_cookie(generation, index);
        debug_assert!(!cookie::is_reserved(cookie));

        let slot = &mut self.slots[index as usize];
        slot.generation = generation;
        slot.record = Some(ConnectionRecord {
            cookie,
            peer,
            nick_name: None,
            state: ConnectionState::Accepted,
            last_activity: Instant::now(),
            outbox,
            cancel,
            announcements: Vec::new(),
        });
        self.len += 1;
        cookie
    }

    pub fn get(&self, cookie: Id) -> Option<&ConnectionRecord> {
        let (generation, index) = split_cookie(cookie);
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn get_mut(&mut self, cookie: Id) -> Option<&mut ConnectionRecord> {
        let (generation, index) = split_cookie(cookie);
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.record.as_mut()
    }

    pub fn contains(&self, cookie: Id) -> bool {
        self.get(cookie).is_some()
    }

    /// Remove a record; it comes back in state `Closed`
    pub fn remove(&mut self, cookie: Id) -> Option<ConnectionRecord> {
        let (generation, index) = split_cookie(cookie);
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }

        let mut record = slot.record.take()?;
        record.state = ConnectionState::Closed;
        self.free.push(index);
        self.len -= 1;
        Some(record)
    }

    pub fn touch(&mut self, cookie: Id) {
        if let Some(record) = self.get_mut(cookie) {
            record.last_activity = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cookies(&self) -> Vec<Id> {
        self.iter().map(|record| record.cookie).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.slots.iter().filter_map(|slot| slot.record.as_ref())
    }

    pub fn active(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.iter().filter(|record| record.is_active())
    }

    fn mint_generation(&mut self) -> u32 {
        let generation = self.next_generation;
        // u32::MAX is skipped so no cookie can equal the broadcast id.
        self.next_generation = match generation.wrapping_add(1) {
            0 | u32::MAX => 1,
            next => next,
        };
        generation
    }
}

fn make_cookie(generation: u32, index: u32) -> Id {
    (u64::from(generation) << 32) | u64::from(index)
}

fn split_cookie(cookie: Id) -> (u32, u32) {
    ((cookie >> 32) as u32, cookie as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(table: &mut ConnectionTable, label: &str) -> Id {
        let (tx, _rx) = mpsc::channel(1);
        table.insert(PeerInfo::new(label), tx, CancellationToken::new())
    }

    #[test]
    fn minted_cookies_avoid_reserved_values() {
        let mut table = ConnectionTable::new();
        let first = insert(&mut table, "a");
        let second = insert(&mut table, "b");

        assert!(first >= cookie::FIRST_MINTED);
        assert!(second >= cookie::FIRST_MINTED);
        assert_ne!(first, second);
        assert_eq!(table.get(first).unwrap().state, ConnectionState::Accepted);
    }

    #[test]
    fn stale_cookie_does_not_alias_reused_slot() {
        let mut table = ConnectionTable::new();
        let old = insert(&mut table, "old");
        let removed = table.remove(old).unwrap();
        assert_eq!(removed.state, ConnectionState::Closed);

        let new = insert(&mut table, "new");
        assert_eq!(old as u32, new as u32, "slot is reused");
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.remove(old).is_none());
        assert_eq!(table.get(new).unwrap().peer.label, "new");
    }

    #[test]
    fn len_and_cookies_track_live_records() {
        let mut table = ConnectionTable::new();
        let a = insert(&mut table, "a");
        let b = insert(&mut table, "b");
        assert_eq!(table.len(), 2);

        table.remove(a);
        assert_eq!(table.len(), 1);
        assert_eq!(table.cookies(), vec![b]);
        assert!(!table.contains(a));
    }

    #[test]
    fn active_filters_by_state() {
        let mut table = ConnectionTable::new();
        let a = insert(&mut table, "a");
        insert(&mut table, "b");
        table.get_mut(a).unwrap().state = ConnectionState::Active;

        let active: Vec<Id> = table.active().map(|r| r.cookie).collect();
        assert_eq!(active, vec![a]);
    }

    #[test]
    fn close_cancels_connection_tasks() {
        let mut table = ConnectionTable::new();
        let a = insert(&mut table, "a");
        let record = table.get_mut(a).unwrap();
        record.close();

        assert_eq!(record.state, ConnectionState::Closing);
        assert!(record.cancel.is_cancelled());
    }

    #[test]
    fn announcements_keep_latest_per_stub() {
        let mut table = ConnectionTable::new();
        let a = insert(&mut table, "a");
        let record = table.get_mut(a).unwrap();
        let available = |stub: &[u8], seq: Id| {
            Message::new(MessageId::ServiceAvailable, a, cookie::BROADCAST, seq, stub.to_vec())
        };

        record.record_announcement(&available(b"calc", 1));
        record.record_announcement(&available(b"echo", 2));
        record.record_announcement(&available(b"calc", 3));
        let kept: Vec<Id> = record.announcements.iter().map(|m| m.cookie).collect();
        assert_eq!(kept, vec![2, 3]);

        record.record_announcement(&Message::new(
            MessageId::ServiceUnavailable,
            a,
            cookie::BROADCAST,
            4,
            b"echo".to_vec(),
        ));
        record.record_announcement(&Message::empty(MessageId::ServiceNotify, a, cookie::BROADCAST, 5));
        let kept: Vec<Id> = record.announcements.iter().map(|m| m.cookie).collect();
        assert_eq!(kept, vec![3]);
    }

    #[test]
    fn reserved_cookies_never_resolve() {
        let mut table = ConnectionTable::new();
        insert(&mut table, "a");
        for reserved in [cookie::UNKNOWN, cookie::LOCAL, cookie::ROUTER, cookie::BROADCAST] {
            assert!(table.get(reserved).is_none());
        }
    }
}
