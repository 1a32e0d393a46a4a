//! Restoring receive order for echoed data.
//!
//! A connection keeps several receives posted at the same time. The socket fills their buffers
//!  in the order they were posted, but the completions are handled by whichever worker picks
//!  them up first, so receive N+1 can be handled before receive N. Echoing N+1 before N would
//!  scramble the data stream.
//!
//! The [ReorderBuffer] solves this by numbering receives when they are posted, and by holding
//!  back completed receives until all receives with lower numbers have been turned into sends:
//!
//! ```ascii
//!   posted:     0  1  2  3
//!   completed:  2  0  3  1
//!
//!   after 2:    pending {2}        next send 0 -> nothing to send
//!   after 0:    pending {0, 2}     -> send 0, next send 1, stop at gap
//!   after 3:    pending {2, 3}     next send 1 -> nothing to send
//!   after 1:    pending {1, 2, 3}  -> send 1, 2, 3
//! ```

use std::collections::BTreeMap;
use tracing::{trace, warn};
use crate::buffers::descriptor::IoDescriptor;
use crate::sequence::Sequence;

/// An entry in the out-of-order list
#[derive(Debug)]
pub enum PendingSend {
    /// a completed receive's data, waiting to be echoed
    Payload(IoDescriptor),
    /// a sequence slot that will never produce data (e.g. a failed datagram receive), and must
    ///  be passed over rather than block all later sends
    Skipped,
}

/// Per-connection sequencing state: the counters for posted receives and issued sends, and the
///  completed receives that are waiting for their predecessors.
///
/// Invariants:
/// * `next_send_sequence <= next_receive_sequence`
/// * every pending entry has a sequence in `next_send_sequence .. next_receive_sequence`
/// * between calls, there is never a pending entry for `next_send_sequence` as long as callers
///    drain after each insert (see [ReorderBuffer::pop_releasable])
#[derive(Debug)]
pub struct ReorderBuffer {
    next_receive_sequence: Sequence,
    next_send_sequence: Sequence,
    pending_out_of_order: BTreeMap<Sequence, PendingSend>,
}

impl ReorderBuffer {
    /// `first_receive_sequence` is 1 for accepted TCP connections because the accept itself
    ///  occupies sequence 0, and 0 for datagram endpoints
    pub fn new(first_receive_sequence: Sequence) -> ReorderBuffer {
        ReorderBuffer {
            next_receive_sequence: first_receive_sequence,
            next_send_sequence: Sequence::ZERO,
            pending_out_of_order: Default::default(),
        }
    }

    pub fn next_receive_sequence(&self) -> Sequence {
        self.next_receive_sequence
    }

    pub fn next_send_sequence(&self) -> Sequence {
        self.next_send_sequence
    }

    pub fn is_empty(&self) -> bool {
        self.pending_out_of_order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending_out_of_order.len()
    }

    /// the sequences of all pending entries, in ascending order
    pub fn pending_sequences(&self) -> impl Iterator<Item = Sequence> + '_ {
        self.pending_out_of_order.keys().copied()
    }

    /// Hands out the sequence number for a receive that is about to be posted. This must be
    ///  called under the same lock as the actual posting so that numbers reflect post order.
    pub fn assign_receive_sequence(&mut self) -> Sequence {
        let result = self.next_receive_sequence;
        self.next_receive_sequence = result.next();
        result
    }

    /// Inserts a completed receive (or a skipped slot) at its position in sequence order.
    ///
    /// Entries that can not be valid - sequence numbers that were never handed out, that were
    ///  already sent, or that are already pending - are rejected and handed back. They can only
    ///  result from a bug, but a broken descriptor must not corrupt the stream.
    pub fn insert(&mut self, sequence: Sequence, entry: PendingSend) -> Result<(), PendingSend> {
        if sequence < self.next_send_sequence {
            warn!("sequence {} was already sent (next send is {}) - rejecting", sequence, self.next_send_sequence);
            return Err(entry);
        }
        if sequence >= self.next_receive_sequence {
            warn!("sequence {} was never assigned (next receive is {}) - rejecting", sequence, self.next_receive_sequence);
            return Err(entry);
        }
        if self.pending_out_of_order.contains_key(&sequence) {
            warn!("sequence {} is already pending - rejecting duplicate", sequence);
            return Err(entry);
        }

        trace!("inserting sequence {} ({} pending)", sequence, self.pending_out_of_order.len());
        self.pending_out_of_order.insert(sequence, entry);
        Ok(())
    }

    /// Removes and returns the head of the out-of-order list if it is the next entry to be sent,
    ///  advancing the send sequence. The slot counts as consumed regardless of what the caller
    ///  does with the entry, so a send that fails can not block the sends behind it.
    ///
    /// Returns `None` at the first gap. Calling this when nothing is releasable has no effect.
    pub fn pop_releasable(&mut self) -> Option<(Sequence, PendingSend)> {
        let entry = self.pending_out_of_order.first_entry()?;
        if *entry.key() != self.next_send_sequence {
            trace!("sequence {} is not releasable - waiting for {}", entry.key(), self.next_send_sequence);
            return None;
        }

        let sequence = *entry.key();
        let pending = entry.remove();
        self.next_send_sequence = sequence.next();
        Some((sequence, pending))
    }

    /// Discards all pending entries, returning their descriptors so they can be released. Used
    ///  when a connection fails and its remaining data can no longer be echoed in order.
    pub fn discard_pending(&mut self) -> Vec<IoDescriptor> {
        std::mem::take(&mut self.pending_out_of_order)
            .into_values()
            .filter_map(|p| match p {
                PendingSend::Payload(descriptor) => Some(descriptor),
                PendingSend::Skipped => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rstest::rstest;
    use super::*;
    use crate::buffers::descriptor::OpKind;
    use crate::buffers::descriptor_pool::DescriptorPool;

    fn payload(pool: &DescriptorPool, sequence: Sequence, data: &[u8]) -> PendingSend {
        let mut descriptor = pool.allocate(OpKind::Send, data.len()).unwrap();
        descriptor.set_payload(data);
        descriptor.set_sequence(Some(sequence));
        PendingSend::Payload(descriptor)
    }

    /// drains everything that is releasable, returning the payloads in release order
    fn drain(buffer: &mut ReorderBuffer) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        while let Some((sequence, pending)) = buffer.pop_releasable() {
            match pending {
                PendingSend::Payload(descriptor) => {
                    assert_eq!(descriptor.sequence(), Some(sequence));
                    result.push(descriptor.payload().to_vec());
                }
                PendingSend::Skipped => {}
            }
        }
        result
    }

    #[test]
    fn test_assign_is_monotonic() {
        let mut buffer = ReorderBuffer::new(Sequence::from_raw(1));
        let assigned = (0..5).map(|_| buffer.assign_receive_sequence().to_raw()).collect::<Vec<_>>();
        assert_eq!(assigned, vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.next_receive_sequence(), Sequence::from_raw(6));
        assert_eq!(buffer.next_send_sequence(), Sequence::ZERO);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::c_a_b(vec![2, 0, 1])]
    #[case::a_c_b(vec![0, 2, 1])]
    #[case::b_a_c(vec![1, 0, 2])]
    #[case::b_c_a(vec![1, 2, 0])]
    fn test_release_in_receive_order(#[case] completion_order: Vec<u64>) {
        let pool = DescriptorPool::new(16, 16, None);
        let payloads: [&[u8]; 3] = [b"A", b"B", b"C"];

        let mut buffer = ReorderBuffer::new(Sequence::ZERO);
        for _ in 0..3 {
            buffer.assign_receive_sequence();
        }

        let mut sent = Vec::new();
        for raw in completion_order {
            let sequence = Sequence::from_raw(raw);
            buffer.insert(sequence, payload(&pool, sequence, payloads[raw as usize])).unwrap();
            sent.extend(drain(&mut buffer));

            // nothing releasable is ever left behind after a drain
            assert!(buffer.pending_sequences().all(|s| s > buffer.next_send_sequence()));
        }

        assert_eq!(sent, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_send_sequence(), Sequence::from_raw(3));
    }

    #[test]
    fn test_stops_at_gap() {
        let pool = DescriptorPool::new(16, 16, None);
        let mut buffer = ReorderBuffer::new(Sequence::ZERO);
        for _ in 0..4 {
            buffer.assign_receive_sequence();
        }

        buffer.insert(Sequence::from_raw(0), payload(&pool, Sequence::from_raw(0), b"0")).unwrap();
        buffer.insert(Sequence::from_raw(2), payload(&pool, Sequence::from_raw(2), b"2")).unwrap();
        buffer.insert(Sequence::from_raw(3), payload(&pool, Sequence::from_raw(3), b"3")).unwrap();

        assert_eq!(drain(&mut buffer), vec![b"0".to_vec()]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.next_send_sequence(), Sequence::from_raw(1));
    }

    #[test]
    fn test_drain_without_releasable_entry_is_noop() {
        let pool = DescriptorPool::new(16, 16, None);
        let mut buffer = ReorderBuffer::new(Sequence::ZERO);
        for _ in 0..3 {
            buffer.assign_receive_sequence();
        }
        buffer.insert(Sequence::from_raw(2), payload(&pool, Sequence::from_raw(2), b"2")).unwrap();

        for _ in 0..3 {
            assert!(buffer.pop_releasable().is_none());
        }
        assert_eq!(buffer.next_send_sequence(), Sequence::ZERO);
        assert_eq!(buffer.next_receive_sequence(), Sequence::from_raw(3));
        assert_eq!(buffer.pending_sequences().collect::<Vec<_>>(), vec![Sequence::from_raw(2)]);

        let mut empty = ReorderBuffer::new(Sequence::ZERO);
        assert!(empty.pop_releasable().is_none());
    }

    #[test]
    fn test_skipped_slot_is_passed_over() {
        let pool = DescriptorPool::new(16, 16, None);
        let mut buffer = ReorderBuffer::new(Sequence::ZERO);
        for _ in 0..3 {
            buffer.assign_receive_sequence();
        }

        buffer.insert(Sequence::from_raw(2), payload(&pool, Sequence::from_raw(2), b"2")).unwrap();
        buffer.insert(Sequence::from_raw(0), payload(&pool, Sequence::from_raw(0), b"0")).unwrap();
        assert_eq!(drain(&mut buffer), vec![b"0".to_vec()]);

        buffer.insert(Sequence::from_raw(1), PendingSend::Skipped).unwrap();
        assert_eq!(drain(&mut buffer), vec![b"2".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[rstest]
    #[case::already_sent(0)]
    #[case::never_assigned(5)]
    #[case::duplicate(2)]
    fn test_insert_rejects(#[case] raw: u64) {
        let pool = DescriptorPool::new(16, 16, None);
        let mut buffer = ReorderBuffer::new(Sequence::ZERO);
        for _ in 0..3 {
            buffer.assign_receive_sequence();
        }
        buffer.insert(Sequence::from_raw(0), PendingSend::Skipped).unwrap();
        buffer.pop_releasable().unwrap();
        buffer.insert(Sequence::from_raw(2), PendingSend::Skipped).unwrap();

        let sequence = Sequence::from_raw(raw);
        assert!(buffer.insert(sequence, payload(&pool, sequence, b"x")).is_err());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_discard_pending() {
        let pool = DescriptorPool::new(16, 16, None);
        let mut buffer = ReorderBuffer::new(Sequence::ZERO);
        for _ in 0..4 {
            buffer.assign_receive_sequence();
        }
        buffer.insert(Sequence::from_raw(1), payload(&pool, Sequence::from_raw(1), b"1")).unwrap();
        buffer.insert(Sequence::from_raw(2), PendingSend::Skipped).unwrap();
        buffer.insert(Sequence::from_raw(3), payload(&pool, Sequence::from_raw(3), b"3")).unwrap();

        let discarded = buffer.discard_pending();
        assert_eq!(discarded.len(), 2);
        assert!(buffer.is_empty());

        drop(discarded);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_random_completion_orders() {
        let pool = DescriptorPool::new(16, 16, None);
        let mut rng = StdRng::seed_from_u64(0x5150);

        for _ in 0..50 {
            let mut buffer = ReorderBuffer::new(Sequence::from_raw(1));
            let mut posted = (0..64).map(|_| buffer.assign_receive_sequence()).collect::<Vec<_>>();
            // the first slot (accept data) is completed first
            buffer.insert(Sequence::ZERO, PendingSend::Skipped).unwrap();
            assert!(drain(&mut buffer).is_empty());

            posted.shuffle(&mut rng);

            let mut sent = Vec::new();
            for sequence in posted {
                let data = sequence.to_raw().to_be_bytes();
                buffer.insert(sequence, payload(&pool, sequence, &data)).unwrap();
                sent.extend(drain(&mut buffer));
                assert!(buffer.next_send_sequence() <= buffer.next_receive_sequence());
            }

            let expected = (1..=64u64).map(|n| n.to_be_bytes().to_vec()).collect::<Vec<_>>();
            assert_eq!(sent, expected);
        }
    }
}
