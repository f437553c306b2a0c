//! Notification Collector (spec §4.3): accumulates change events for the
//! duration of a transaction and compresses/orders them at commit time.
//!
//! Compression happens once, at commit, the way the spec's design note
//! prescribes ("do not attempt online compression during command
//! handling") — `push` just appends, `drain` does the merging.

use std::collections::HashSet;

use pim_api::wire::ChangeEvent;
use pim_api::{CollectionId, ItemId};

#[derive(Default)]
pub struct Collector {
    events: Vec<ChangeEvent>,
}

impl Collector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Consumes the buffer, applying the transaction-local compression
    /// rules (spec §4.3) and returning events in commit order.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        compress(std::mem::take(&mut self.events))
    }
}

fn compress(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut out: Vec<ChangeEvent> = Vec::with_capacity(events.len());
    let mut added_items: HashSet<ItemId> = HashSet::new();
    let mut added_collections: HashSet<CollectionId> = HashSet::new();

    for event in events {
        match &event {
            ChangeEvent::ItemAdded { item_id, .. } => {
                added_items.insert(*item_id);
                out.push(event);
                continue;
            }
            ChangeEvent::CollectionAdded { collection_id } => {
                added_collections.insert(*collection_id);
                out.push(event);
                continue;
            }
            ChangeEvent::ItemRemoved { item_id, .. } => {
                if added_items.remove(item_id) {
                    // Added then removed inside the same transaction: both
                    // events cancel, the entity never appears committed.
                    out.retain(|e| !matches!(e, ChangeEvent::ItemAdded { item_id: i, .. } if i == item_id));
                    continue;
                }
            }
            ChangeEvent::CollectionRemoved { collection_id } => {
                if added_collections.remove(collection_id) {
                    out.retain(|e| {
                        !matches!(e, ChangeEvent::CollectionAdded { collection_id: c } if c == collection_id)
                    });
                    continue;
                }
            }
            ChangeEvent::ItemChanged { item_id, collection_id, changed_parts } => {
                if added_items.contains(item_id) {
                    // *Changed after *Added merges into the Added: nothing
                    // to emit, the entity already reads as fully formed.
                    continue;
                }
                if let Some(ChangeEvent::ItemChanged {
                    item_id: prev_id,
                    changed_parts: prev_parts,
                    ..
                }) = out.last_mut()
                {
                    if prev_id == item_id {
                        prev_parts.extend(changed_parts.iter().cloned());
                        continue;
                    }
                }
                out.push(ChangeEvent::ItemChanged {
                    item_id: *item_id,
                    collection_id: *collection_id,
                    changed_parts: changed_parts.clone(),
                });
                continue;
            }
            ChangeEvent::CollectionChanged { collection_id, .. } => {
                if added_collections.contains(collection_id) {
                    continue;
                }
            }
            _ => {}
        }
        out.push(event);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as HS;

    #[test]
    fn adjacent_item_changed_merges_changed_parts() {
        let mut c = Collector::new();
        let mut first = HS::new();
        first.insert("FLAGS".to_string());
        let mut second = HS::new();
        second.insert("PLD:RFC822".to_string());
        c.push(ChangeEvent::ItemChanged {
            item_id: ItemId(1),
            collection_id: CollectionId(1),
            changed_parts: first,
        });
        c.push(ChangeEvent::ItemChanged {
            item_id: ItemId(1),
            collection_id: CollectionId(1),
            changed_parts: second,
        });
        let drained = c.drain();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            ChangeEvent::ItemChanged { changed_parts, .. } => assert_eq!(changed_parts.len(), 2),
            _ => panic!("expected ItemChanged"),
        }
    }

    #[test]
    fn added_then_removed_cancels() {
        let mut c = Collector::new();
        c.push(ChangeEvent::ItemAdded {
            item_id: ItemId(5),
            collection_id: CollectionId(1),
        });
        c.push(ChangeEvent::ItemRemoved {
            item_id: ItemId(5),
            collection_id: CollectionId(1),
        });
        assert!(c.drain().is_empty());
    }

    #[test]
    fn changed_after_added_merges_into_added() {
        let mut c = Collector::new();
        c.push(ChangeEvent::ItemAdded {
            item_id: ItemId(9),
            collection_id: CollectionId(1),
        });
        c.push(ChangeEvent::ItemChanged {
            item_id: ItemId(9),
            collection_id: CollectionId(1),
            changed_parts: HS::new(),
        });
        let drained = c.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].is_added());
    }
}
