//! Alteration queue
//!
//! Alterations are ordered by target (request first, then ascending block
//! number) and, within one target, by insertion order. Only the head is ever
//! checked against a passing packet.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::alteration::{Alteration, Direction, PacketTarget};

#[derive(Debug)]
struct Entry {
    seq: u64,
    alteration: Alteration,
}

impl Entry {
    fn key(&self) -> (PacketTarget, u64) {
        (self.alteration.target, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Pending alterations, lowest target first
#[derive(Debug, Default)]
pub struct AlterationQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl AlterationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alteration: Alteration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { seq, alteration }));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The alteration that will be checked against the next packet
    pub fn peek(&self) -> Option<&Alteration> {
        self.heap.peek().map(|Reverse(entry)| &entry.alteration)
    }

    /// Whether the head alteration fires on `packet` travelling `direction`
    pub fn check(&self, direction: Direction, packet: &[u8]) -> bool {
        self.peek()
            .is_some_and(|head| head.matches(direction, PacketTarget::of(packet)))
    }

    /// Pop the head alteration if it fires on `packet`
    pub fn take_match(&mut self, direction: Direction, packet: &[u8]) -> Option<Alteration> {
        if !self.check(direction, packet) {
            return None;
        }
        self.heap.pop().map(|Reverse(entry)| entry.alteration)
    }
}

impl Extend<Alteration> for AlterationQueue {
    fn extend<I: IntoIterator<Item = Alteration>>(&mut self, iter: I) {
        for alteration in iter {
            self.push(alteration);
        }
    }
}

impl FromIterator<Alteration> for AlterationQueue {
    fn from_iter<I: IntoIterator<Item = Alteration>>(iter: I) -> Self {
        let mut queue = Self::new();
        queue.extend(iter);
        queue
    }
}

#[cfg(test)]
mod tests {
    use tftp::{Packet, TftpRequest, TransferMode, build_ack, build_data};

    use super::*;

    fn at(direction: Direction, block: u16) -> Alteration {
        Alteration::new(direction, PacketTarget::Block(block))
    }

    #[test]
    fn test_alterations_fire_in_block_order() {
        let mut queue: AlterationQueue = [5, 2, 8]
            .into_iter()
            .map(|block| at(Direction::ClientToServer, block))
            .collect();

        let mut fired = Vec::new();
        for block in 1..=10 {
            if let Some(alteration) = queue.take_match(Direction::ClientToServer, &build_data(block, b"x")) {
                fired.push((block, alteration.target));
            }
        }

        assert_eq!(
            fired,
            [
                (2, PacketTarget::Block(2)),
                (5, PacketTarget::Block(5)),
                (8, PacketTarget::Block(8))
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_alteration_fires_once_on_matching_direction_and_block() {
        let mut queue = AlterationQueue::new();
        queue.push(at(Direction::ClientToServer, 3));

        assert!(queue.take_match(Direction::ServerToClient, &build_data(3, b"")).is_none());
        assert!(queue.take_match(Direction::ServerToClient, &build_ack(3)).is_none());
        assert!(queue.take_match(Direction::ClientToServer, &build_ack(2)).is_none());
        assert!(queue.take_match(Direction::ClientToServer, &build_ack(4)).is_none());
        assert_eq!(queue.len(), 1);

        assert!(queue.take_match(Direction::ClientToServer, &build_ack(3)).is_some());
        assert!(queue.take_match(Direction::ClientToServer, &build_ack(3)).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_request_alteration_is_head_and_matches_requests_only() {
        let mut queue = AlterationQueue::new();
        queue.push(at(Direction::ClientToServer, 0));
        queue.push(Alteration::new(Direction::ClientToServer, PacketTarget::Request).rewrite_mode("bogus"));

        assert_eq!(queue.peek().map(|a| a.target), Some(PacketTarget::Request));
        assert!(!queue.check(Direction::ClientToServer, &build_ack(0)));

        let wrq = Packet::WriteRequest(TftpRequest::new("up.bin", TransferMode::Octet)).encode();
        assert!(!queue.check(Direction::ServerToClient, &wrq));
        let taken = queue.take_match(Direction::ClientToServer, &wrq).unwrap();
        assert_eq!(taken.mode.as_deref(), Some("bogus"));

        assert!(queue.check(Direction::ClientToServer, &build_ack(0)));
    }

    #[test]
    fn test_same_target_keeps_insertion_order() {
        let mut queue = AlterationQueue::new();
        queue.push(at(Direction::ServerToClient, 4).rewrite_opcode(9));
        queue.push(at(Direction::ClientToServer, 4).drop_packet());

        let packet = build_data(4, b"");
        // The head is the server->client one, so a client->server packet does not match.
        assert!(queue.take_match(Direction::ClientToServer, &packet).is_none());
        assert_eq!(
            queue.take_match(Direction::ServerToClient, &packet).and_then(|a| a.opcode),
            Some(9)
        );
        assert!(queue.take_match(Direction::ClientToServer, &packet).unwrap().drop);
    }

    #[test]
    fn test_blocked_head_holds_back_later_alterations() {
        let mut queue = AlterationQueue::new();
        queue.push(at(Direction::ClientToServer, 2));
        queue.push(at(Direction::ClientToServer, 3));

        assert!(queue.take_match(Direction::ClientToServer, &build_ack(3)).is_none());
        assert_eq!(queue.len(), 2);
    }
}
