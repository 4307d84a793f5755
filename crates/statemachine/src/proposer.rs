//! Batch assembly for owned buckets.
//!
//! The proposer walks the client tracker's ready list and files each request
//! into the queue of the bucket it is ordered through, honoring the
//! checkpoint after which the request becomes valid. Batches are cut from
//! the front of a bucket's ready queue.

use crate::client::{AssignedRequest, ClientTracker, ReadyIterator};
use multibft_types::{BucketId, NetworkConfig, NodeId, SeqNo};
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

pub(crate) struct ProposalBucket {
    batch_size: usize,
    checkpoint_interval: SeqNo,
    /// The checkpoint the ready queue is valid at; advanced as the caller
    /// asks about higher sequence numbers.
    current_checkpoint: SeqNo,
    /// Requests valid at or before the current checkpoint.
    ready: VecDeque<AssignedRequest>,
    /// Requests valid only after a future checkpoint, keyed by it. A request
    /// may reference a checkpoint arbitrarily far ahead; each gets its own
    /// queue and is spliced in when its checkpoint is reached.
    future: BTreeMap<SeqNo, VecDeque<AssignedRequest>>,
    /// The batch being assembled.
    pending: Vec<AssignedRequest>,
}

impl ProposalBucket {
    fn new(base_checkpoint: SeqNo, checkpoint_interval: SeqNo, batch_size: usize) -> Self {
        Self {
            batch_size,
            checkpoint_interval,
            current_checkpoint: base_checkpoint,
            ready: VecDeque::new(),
            future: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    fn queue(&mut self, valid_after: SeqNo, request: AssignedRequest) {
        if valid_after <= self.current_checkpoint {
            self.ready.push_back(request);
        } else {
            self.future.entry(valid_after).or_default().push_back(request);
        }
    }

    /// Advance the checkpoint to cover `to_seq_no` and refill the pending
    /// batch. Advancing twice with the same sequence number is a no-op.
    fn advance(&mut self, to_seq_no: SeqNo) {
        while to_seq_no >= self.current_checkpoint + self.checkpoint_interval {
            self.current_checkpoint += self.checkpoint_interval;
            let due: Vec<SeqNo> = self
                .future
                .range(..=self.current_checkpoint)
                .map(|(k, _)| *k)
                .collect();
            for key in due {
                let queue = self.future.remove(&key).unwrap();
                self.ready.extend(queue);
            }
        }
        while self.pending.len() < self.batch_size {
            match self.ready.pop_front() {
                Some(request) => self.pending.push(request),
                None => break,
            }
        }
    }

    /// Whether a full batch is available for `for_seq_no`.
    pub(crate) fn has_pending(&mut self, for_seq_no: SeqNo) -> bool {
        self.advance(for_seq_no);
        self.pending.len() == self.batch_size
    }

    /// Whether any (possibly short) batch is available for `for_seq_no`.
    pub(crate) fn has_outstanding(&mut self, for_seq_no: SeqNo) -> bool {
        self.advance(for_seq_no);
        !self.pending.is_empty()
    }

    /// Take the assembled batch.
    pub(crate) fn next_batch(&mut self) -> Vec<AssignedRequest> {
        std::mem::take(&mut self.pending)
    }
}

pub(crate) struct Proposer {
    my_id: NodeId,
    total_buckets: u64,
    iterator: ReadyIterator,
    buckets: BTreeMap<BucketId, ProposalBucket>,
}

impl Proposer {
    pub(crate) fn new(
        base_checkpoint: SeqNo,
        batch_size: usize,
        network: &NetworkConfig,
        bucket_owners: &BTreeMap<BucketId, NodeId>,
        clients: &ClientTracker,
        my_id: NodeId,
    ) -> Self {
        let buckets = bucket_owners
            .iter()
            .filter(|(_, owner)| **owner == my_id)
            .map(|(bucket, _)| {
                (
                    *bucket,
                    ProposalBucket::new(base_checkpoint, network.checkpoint_interval, batch_size),
                )
            })
            .collect();
        Self {
            my_id,
            total_buckets: network.number_of_buckets,
            iterator: clients.ready_iterator(),
            buckets,
        }
    }

    /// Pull newly ready requests into the owned buckets' queues.
    pub(crate) fn advance_ready(&mut self, clients: &ClientTracker) {
        while let Some((client_id, req_no)) = clients.ready_next(&mut self.iterator) {
            let bucket = BucketId(req_no.wrapping_add(client_id) % self.total_buckets);
            let Some(proposal_bucket) = self.buckets.get_mut(&bucket) else {
                // Another leader's bucket.
                continue;
            };
            let Some(request) = clients.take_for_proposal(client_id, req_no) else {
                continue;
            };
            trace!(
                node = self.my_id.0,
                client_id,
                req_no,
                %bucket,
                "queueing request for proposal"
            );
            proposal_bucket.queue(clients.valid_after(client_id, req_no), request);
        }
    }

    pub(crate) fn bucket_mut(&mut self, bucket: BucketId) -> Option<&mut ProposalBucket> {
        self.buckets.get_mut(&bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multibft_types::{Digest, RequestData};

    fn request(req_no: u64) -> AssignedRequest {
        let data = RequestData {
            client_id: 0,
            req_no,
            data: vec![req_no as u8],
        };
        AssignedRequest {
            ack: data.ack(Digest(vec![req_no as u8])),
            data,
        }
    }

    fn bucket(batch_size: usize) -> ProposalBucket {
        ProposalBucket::new(0, 5, batch_size)
    }

    #[test]
    fn advance_is_idempotent_for_the_same_sequence() {
        let mut b = bucket(2);
        b.queue(0, request(1));
        b.queue(0, request(2));
        b.queue(0, request(3));
        assert!(b.has_pending(1));
        let first: Vec<u64> = b.pending.iter().map(|r| r.data.req_no).collect();
        assert!(b.has_pending(1));
        let second: Vec<u64> = b.pending.iter().map(|r| r.data.req_no).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![1, 2]);
    }

    #[test]
    fn future_requests_wait_for_their_checkpoint() {
        let mut b = bucket(1);
        b.queue(5, request(1));
        assert!(!b.has_outstanding(4));
        assert!(b.has_outstanding(5));
        assert_eq!(b.next_batch()[0].data.req_no, 1);
    }

    #[test]
    fn requests_multiple_intervals_ahead_are_kept() {
        let mut b = bucket(1);
        // Valid only after checkpoint 15, three intervals ahead.
        b.queue(15, request(9));
        assert!(!b.has_outstanding(5));
        assert!(!b.has_outstanding(10));
        assert!(b.has_outstanding(15));
        assert_eq!(b.next_batch()[0].data.req_no, 9);
    }

    #[test]
    fn short_batches_flush_via_outstanding_only() {
        let mut b = bucket(3);
        b.queue(0, request(1));
        assert!(!b.has_pending(1));
        assert!(b.has_outstanding(1));
        assert_eq!(b.next_batch().len(), 1);
        assert!(!b.has_outstanding(1));
    }
}
