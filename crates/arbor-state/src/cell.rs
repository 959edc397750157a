//! Key cells - two-phase last-writer-wins registers
//!
//! Each key holds one `ValueCell`. The confirmed slot tracks exactly
//! what the sequenced log has established; speculative writes are this
//! replica's own un-acked mutations, oldest first. Readers see the
//! newest speculative write when one exists, the confirmed slot
//! otherwise, which is how a replica's own writes keep winning locally
//! until the log confirms them.

use std::collections::VecDeque;

use arbor_core::{ReplicaId, Value};

/// One storage position: a value, or the absence of one
///
/// Absence is distinct from `Value::Undefined`. A key whose cell is
/// absent in both phases is removed from the directory entirely.
#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    Absent,
    Present(Value),
}

impl Slot {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Slot::Absent => None,
            Slot::Present(v) => Some(v),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Slot::Present(_))
    }
}

/// An un-acked local write
#[derive(Clone, Debug)]
pub struct SpeculativeWrite {
    pub local_seq: u64,
    pub slot: Slot,
}

/// Last-writer-wins register for one key
#[derive(Clone, Debug)]
pub struct ValueCell {
    confirmed: Slot,
    confirmed_origin: Option<ReplicaId>,
    confirmed_seq: u64,
    speculative: VecDeque<SpeculativeWrite>,
}

impl ValueCell {
    /// Cell established by a confirmed write (sequenced, detached, or
    /// loaded from a snapshot)
    pub fn confirmed(slot: Slot, origin: Option<ReplicaId>, global_seq: u64) -> Self {
        ValueCell {
            confirmed: slot,
            confirmed_origin: origin,
            confirmed_seq: global_seq,
            speculative: VecDeque::new(),
        }
    }

    /// Cell created by an optimistic local write with nothing confirmed
    /// underneath it yet
    pub fn speculative(local_seq: u64, slot: Slot) -> Self {
        let mut cell = ValueCell::confirmed(Slot::Absent, None, 0);
        cell.push_speculative(local_seq, slot);
        cell
    }

    /// The value readers observe
    pub fn visible(&self) -> &Slot {
        self.speculative
            .back()
            .map(|w| &w.slot)
            .unwrap_or(&self.confirmed)
    }

    pub fn confirmed_slot(&self) -> &Slot {
        &self.confirmed
    }

    pub fn confirmed_origin(&self) -> Option<ReplicaId> {
        self.confirmed_origin
    }

    pub fn confirmed_seq(&self) -> u64 {
        self.confirmed_seq
    }

    /// Whether un-acked local writes shadow the confirmed slot
    pub fn is_shadowed(&self) -> bool {
        !self.speculative.is_empty()
    }

    /// Record an optimistic local write
    pub fn push_speculative(&mut self, local_seq: u64, slot: Slot) {
        self.speculative.push_back(SpeculativeWrite { local_seq, slot });
    }

    /// Overwrite the confirmed slot from a sequenced operation. The
    /// visible value only moves when nothing speculative shadows it.
    pub fn confirm(&mut self, slot: Slot, origin: ReplicaId, global_seq: u64) {
        self.confirmed = slot;
        self.confirmed_origin = Some(origin);
        self.confirmed_seq = global_seq;
    }

    /// Promote the oldest speculative write on acknowledgment.
    ///
    /// Returns false when no speculative write matches `local_seq`,
    /// which happens when the write was destroyed together with its
    /// subtree and the path has since been recreated.
    pub fn acknowledge(&mut self, local_seq: u64, origin: ReplicaId, global_seq: u64) -> bool {
        match self.speculative.front() {
            Some(front) if front.local_seq == local_seq => {
                let write = self.speculative.pop_front().unwrap();
                self.confirmed = write.slot;
                self.confirmed_origin = Some(origin);
                self.confirmed_seq = global_seq;
                true
            }
            _ => false,
        }
    }

    /// True once neither phase holds a value - the key is gone
    pub fn is_vacant(&self) -> bool {
        self.speculative.is_empty() && matches!(self.confirmed, Slot::Absent)
    }
}
