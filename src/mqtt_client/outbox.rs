use std::time::Instant;

use crate::mqtt_serde::control_packet::ControlPacketType;
use crate::mqtt_serde::packet::Packet;

/// Handle to an entry in the [`Outbox`].
///
/// Handles stay valid while other entries come and go. A handle to a removed entry
/// never resolves again, even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: usize,
    generation: u32,
}

/// Entry in the outbox
#[derive(Debug)]
pub struct OutboxEntry {
    pub packet: Packet,
    /// Last time bytes of this packet went out (enqueue time until then)
    pub time_sent: Instant,
    /// Already acknowledged or discarded while partially written. Leaves the outbox
    /// as soon as its last byte is out.
    pub acknowledged: bool,
}

impl OutboxEntry {
    /// An entry of `kind` still waiting for its acknowledgement.
    pub fn is_pending(&self, kind: ControlPacketType) -> bool {
        !self.acknowledged && self.packet.packet_type() == kind
    }
}

/// Which entries survive a [`Outbox::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Session state: PUBLISH with a packet id, PUBREC and PUBREL.
    KeepSession,
    /// Every PUBLISH, including QoS 0 ones not written yet.
    KeepPublish,
    DiscardAll,
}

impl Retention {
    fn keeps(self, entry: &OutboxEntry) -> bool {
        if entry.acknowledged {
            return false;
        }
        let packet = &entry.packet;
        match self {
            Retention::KeepSession => match packet.packet_type() {
                ControlPacketType::PUBLISH => packet.packet_id() != 0,
                ControlPacketType::PUBREC | ControlPacketType::PUBREL => true,
                _ => false,
            },
            Retention::KeepPublish => packet.packet_type() == ControlPacketType::PUBLISH,
            Retention::DiscardAll => false,
        }
    }
}

#[derive(Debug)]
struct Node {
    entry: OutboxEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Ordered list of packets waiting to be written or acknowledged.
///
/// Entries live in a slot arena and are chained in send order. `current` points at
/// the entry the writer is working on; everything before it has been written and is
/// waiting for its acknowledgement. When `current` runs past the end it becomes
/// `None` until a new entry is appended.
#[derive(Debug, Default)]
pub struct Outbox {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    current: Option<usize>,
    len: usize,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, index: usize) -> Option<&Node> {
        self.slots.get(index).and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.slots.get_mut(index).and_then(|slot| slot.node.as_mut())
    }

    fn id_of(&self, index: usize) -> EntryId {
        EntryId {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn resolve(&self, id: EntryId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        (slot.generation == id.generation && slot.node.is_some()).then_some(id.index)
    }

    fn allocate(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        }
    }

    /// Appends a packet. It becomes `current` if the writer had run out of entries.
    pub fn push_back(&mut self, packet: Packet, now: Instant) -> EntryId {
        let index = self.allocate(Node {
            entry: OutboxEntry {
                packet,
                time_sent: now,
                acknowledged: false,
            },
            prev: self.tail,
            next: None,
        });
        match self.tail.and_then(|tail| self.node_mut(tail)) {
            Some(tail) => tail.next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        if self.current.is_none() {
            self.current = Some(index);
        }
        self.len += 1;
        self.id_of(index)
    }

    /// Prepends a packet and makes it `current`.
    pub fn push_front(&mut self, packet: Packet, now: Instant) -> EntryId {
        let index = self.allocate(Node {
            entry: OutboxEntry {
                packet,
                time_sent: now,
                acknowledged: false,
            },
            prev: None,
            next: self.head,
        });
        match self.head.and_then(|head| self.node_mut(head)) {
            Some(head) => head.prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.current = Some(index);
        self.len += 1;
        self.id_of(index)
    }

    /// Unlinks an entry. If it was `current`, its successor becomes `current`.
    pub fn remove(&mut self, id: EntryId) -> Option<OutboxEntry> {
        let index = self.resolve(id)?;
        let slot = &mut self.slots[index];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        match node.prev.and_then(|prev| self.node_mut(prev)) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|next| self.node_mut(next)) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }
        if self.current == Some(index) {
            self.current = node.next;
        }
        self.len -= 1;
        Some(node.entry)
    }

    pub fn remove_current(&mut self) -> Option<OutboxEntry> {
        let id = self.current_id()?;
        self.remove(id)
    }

    pub fn get(&self, id: EntryId) -> Option<&OutboxEntry> {
        self.resolve(id)
            .and_then(|index| self.node(index))
            .map(|node| &node.entry)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut OutboxEntry> {
        let index = self.resolve(id)?;
        self.node_mut(index).map(|node| &mut node.entry)
    }

    pub fn front(&self) -> Option<EntryId> {
        self.head.map(|index| self.id_of(index))
    }

    pub fn next_of(&self, id: EntryId) -> Option<EntryId> {
        let index = self.resolve(id)?;
        self.node(index)?.next.map(|next| self.id_of(next))
    }

    pub fn current_id(&self) -> Option<EntryId> {
        self.current.map(|index| self.id_of(index))
    }

    pub fn current(&self) -> Option<&OutboxEntry> {
        self.current
            .and_then(|index| self.node(index))
            .map(|node| &node.entry)
    }

    pub fn current_mut(&mut self) -> Option<&mut OutboxEntry> {
        let index = self.current?;
        self.node_mut(index).map(|node| &mut node.entry)
    }

    /// Moves `current` to the next entry.
    pub fn advance(&mut self) {
        self.current = self.current.and_then(|index| self.node(index)?.next);
    }

    /// Moves `current` back to the first entry so that everything is written again.
    pub fn reset_current(&mut self) {
        self.current = self.head;
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            outbox: self,
            next: self.head,
        }
    }

    /// First entry, in send order, matching `predicate`.
    pub fn find<F>(&self, mut predicate: F) -> Option<EntryId>
    where
        F: FnMut(&OutboxEntry) -> bool,
    {
        self.iter()
            .find(|(_, entry)| predicate(entry))
            .map(|(id, _)| id)
    }

    /// Removes every entry `retention` does not keep.
    ///
    /// `in_flight` names an entry that is partially written; instead of being removed
    /// it is marked acknowledged so that the writer can finish it first.
    pub fn flush(&mut self, retention: Retention, in_flight: Option<EntryId>) {
        let doomed: Vec<EntryId> = self
            .iter()
            .filter(|(_, entry)| !retention.keeps(entry))
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            if Some(id) == in_flight {
                if let Some(entry) = self.get_mut(id) {
                    entry.acknowledged = true;
                }
            } else {
                self.remove(id);
            }
        }
    }

    pub fn clear(&mut self) {
        self.flush(Retention::DiscardAll, None);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Iter<'a> {
    outbox: &'a Outbox,
    next: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (EntryId, &'a OutboxEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let node = self.outbox.node(index)?;
        self.next = node.next;
        Some((self.outbox.id_of(index), &node.entry))
    }
}
