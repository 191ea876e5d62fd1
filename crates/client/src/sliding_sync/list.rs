//! Per-list window state and server op application.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::sliding::{ReqList, SlidingOp, SyncOp, SyncRoom};
use crate::core::{OwnedRoomId, RoomId};

/// The tracked state of one configured list.
#[derive(Clone, Debug, Default)]
pub(super) struct ListState {
    /// Caller-provided configuration; everything but `ranges` is sticky.
    pub config: ReqList,

    /// Set when a sticky parameter is replaced, cleared once a request
    /// carrying the full configuration has been dispatched and answered.
    pub is_modified: bool,

    /// Sparse mapping from window index to room ID. Only indices within some
    /// active range are authoritative.
    pub index_to_room_id: BTreeMap<u64, OwnedRoomId>,

    /// Total number of matching rooms reported by the server.
    pub joined_count: u64,
}

impl ListState {
    pub fn new(config: ReqList) -> Self {
        Self {
            config,
            is_modified: true,
            index_to_room_id: BTreeMap::new(),
            joined_count: 0,
        }
    }

    /// Whether `index` falls within any of the configured ranges.
    pub fn is_index_in_range(&self, index: u64) -> bool {
        self.config
            .ranges
            .iter()
            .any(|&(start, end)| start <= index && index <= end)
    }

    /// Copies the mapping at `from` over the mapping at `to`, but only when
    /// `to` is inside a configured range. An untracked source slot clears the
    /// destination rather than leaving a stale entry behind.
    fn shift_entry(&mut self, from: u64, to: u64) {
        if !self.is_index_in_range(to) {
            return;
        }
        match self.index_to_room_id.get(&from).cloned() {
            Some(room_id) => {
                self.index_to_room_id.insert(to, room_id);
            }
            None => {
                self.index_to_room_id.remove(&to);
            }
        }
    }
}

/// Applies one response's ops to the lists, in order.
///
/// `on_room` observes every room payload attached to an op. Malformed ops are
/// skipped individually; they never abort the remainder of the stream.
/// Returns the indices of the lists touched by at least one op.
pub(super) fn apply_ops<F>(lists: &mut [ListState], ops: &[SyncOp], mut on_room: F) -> BTreeSet<usize>
where
    F: FnMut(&RoomId, &SyncRoom),
{
    let mut affected = BTreeSet::new();
    // Per-response gap anchor for each list: the index of the most recent
    // DELETE, which decides the following INSERT's shift direction.
    let mut gap_index: BTreeMap<usize, u64> = BTreeMap::new();

    for op in ops {
        if lists.get(op.list).is_none() {
            warn!(list = op.list, op = ?op.op, "op for unknown list, skipping");
            continue;
        }

        match op.op {
            SlidingOp::Sync => apply_sync(lists, op, &mut affected, &mut on_room),
            SlidingOp::Insert => apply_insert(lists, op, &mut affected, &gap_index, &mut on_room),
            SlidingOp::Update => {
                let Some(room) = &op.room else {
                    warn!(list = op.list, "UPDATE without room payload, skipping");
                    continue;
                };
                let Some(room_id) = &room.room_id else {
                    warn!(list = op.list, "UPDATE room without room_id, skipping");
                    continue;
                };
                affected.insert(op.list);
                on_room(room_id, room);
            }
            SlidingOp::Delete => {
                let Some(index) = op.index else {
                    warn!(list = op.list, "DELETE without index, skipping");
                    continue;
                };
                affected.insert(op.list);
                lists[op.list].index_to_room_id.remove(&index);
                gap_index.insert(op.list, index);
            }
            SlidingOp::Invalidate => {
                let Some((start, end)) = op.range else {
                    warn!(list = op.list, "INVALIDATE without range, skipping");
                    continue;
                };
                affected.insert(op.list);
                let invalidated: Vec<u64> = lists[op.list]
                    .index_to_room_id
                    .range(start..=end)
                    .map(|(index, _)| *index)
                    .collect();
                for index in invalidated {
                    lists[op.list].index_to_room_id.remove(&index);
                }
            }
            SlidingOp::Unknown => {
                warn!(list = op.list, "unknown op, skipping");
            }
        }
    }

    affected
}

fn apply_sync<F>(
    lists: &mut [ListState],
    op: &SyncOp,
    affected: &mut BTreeSet<usize>,
    on_room: &mut F,
) where
    F: FnMut(&RoomId, &SyncRoom),
{
    let Some((start, end)) = op.range else {
        warn!(list = op.list, "SYNC without range, skipping");
        return;
    };
    affected.insert(op.list);

    for (offset, room) in op.rooms.iter().enumerate() {
        let index = start + offset as u64;
        if index > end {
            break;
        }
        let Some(room_id) = room.room_id.clone() else {
            warn!(list = op.list, index, "SYNC room without room_id, stopping");
            break;
        };
        lists[op.list].index_to_room_id.insert(index, room_id.clone());
        on_room(&room_id, room);
    }
}

fn apply_insert<F>(
    lists: &mut [ListState],
    op: &SyncOp,
    affected: &mut BTreeSet<usize>,
    gap_index: &BTreeMap<usize, u64>,
    on_room: &mut F,
) where
    F: FnMut(&RoomId, &SyncRoom),
{
    let Some(index) = op.index else {
        warn!(list = op.list, "INSERT without index, skipping");
        return;
    };
    let Some(room) = &op.room else {
        warn!(list = op.list, "INSERT without room payload, skipping");
        return;
    };
    let Some(room_id) = room.room_id.clone() else {
        warn!(list = op.list, "INSERT room without room_id, skipping");
        return;
    };

    let list = &mut lists[op.list];
    if list.index_to_room_id.contains_key(&index) {
        match gap_index.get(&op.list).copied() {
            None => {
                // A well-formed stream always deletes before it inserts into
                // an occupied slot.
                warn!(
                    list = op.list,
                    index, "INSERT into occupied slot with no pending gap, skipping"
                );
                return;
            }
            Some(gap) if gap > index => {
                // The gap is beneath the insertion point: make room by
                // shifting the window (index, gap] one step towards the gap.
                let mut to = gap;
                while to > index {
                    list.shift_entry(to - 1, to);
                    to -= 1;
                }
            }
            Some(gap) if gap < index => {
                // Symmetric leftward shift for [gap, index).
                for to in gap..index {
                    list.shift_entry(to + 1, to);
                }
            }
            Some(_) => {
                // The gap is exactly here; the slot is free to overwrite.
            }
        }
    }

    affected.insert(op.list);
    list.index_to_room_id.insert(index, room_id.clone());
    on_room(&room_id, room);
}
