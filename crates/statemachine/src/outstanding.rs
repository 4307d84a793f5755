//! Outstanding-request tracking.
//!
//! A preprepare references requests by ack only. Before the receiving
//! replica can hash the batch it must hold every payload; this tracker
//! validates the batch (bucket closure), indexes the missing payloads to the
//! sequences waiting on them, and emits the fetches that resolve them.

use crate::client::ClientTracker;
use multibft_core::Actions;
use multibft_types::{
    BucketId, ClientId, Digest, Msg, NetworkConfig, NodeId, ReqNo, RequestAck, RequestData, SeqNo,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Result of admitting a preprepare batch: what is already resolvable, what
/// is missing, and the fetches for the missing part.
pub(crate) struct AdmittedBatch {
    pub resolved: BTreeMap<(ClientId, ReqNo), RequestData>,
    pub missing: BTreeSet<(ClientId, ReqNo)>,
    pub fetches: Actions,
}

#[derive(Default)]
pub(crate) struct OutstandingRequests {
    /// Missing payloads, keyed by request then digest, mapped to the
    /// sequences waiting on them.
    missing: BTreeMap<(ClientId, ReqNo), BTreeMap<Digest, BTreeSet<SeqNo>>>,
}

impl OutstandingRequests {
    /// Validate and admit a preprepare batch for `seq_no` in `bucket`.
    ///
    /// Returns `Err` on a bucket-closure violation: an ack whose request
    /// does not map to this bucket. The caller treats that as bucket
    /// misbehavior.
    pub(crate) fn admit_batch(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        bucket: BucketId,
        batch: &[RequestAck],
        network: &NetworkConfig,
        clients: &ClientTracker,
    ) -> Result<AdmittedBatch, ()> {
        for ack in batch {
            let expected = network.request_bucket(ack.client_id, ack.req_no);
            if expected != bucket {
                warn!(
                    seq_no,
                    %source,
                    client_id = ack.client_id,
                    req_no = ack.req_no,
                    %expected,
                    %bucket,
                    "preprepare violates bucket closure"
                );
                return Err(());
            }
        }

        let mut admitted = AdmittedBatch {
            resolved: BTreeMap::new(),
            missing: BTreeSet::new(),
            fetches: Actions::default(),
        };
        for ack in batch {
            let key = (ack.client_id, ack.req_no);
            match clients.resolve(ack) {
                Some(data) => {
                    admitted.resolved.insert(key, data);
                }
                None => {
                    debug!(
                        seq_no,
                        client_id = ack.client_id,
                        req_no = ack.req_no,
                        "fetching request referenced by preprepare"
                    );
                    admitted.missing.insert(key);
                    self.missing
                        .entry(key)
                        .or_default()
                        .entry(ack.digest.clone())
                        .or_default()
                        .insert(seq_no);
                    admitted.fetches.send_to(
                        source,
                        Msg::FetchRequest {
                            client_id: ack.client_id,
                            req_no: ack.req_no,
                            digest: ack.digest.clone(),
                        },
                    );
                }
            }
        }
        Ok(admitted)
    }

    /// A payload with this digest became available; returns the sequences
    /// that were waiting on it.
    pub(crate) fn satisfy(
        &mut self,
        client_id: ClientId,
        req_no: ReqNo,
        digest: &Digest,
    ) -> Vec<SeqNo> {
        let key = (client_id, req_no);
        let Some(digests) = self.missing.get_mut(&key) else {
            return Vec::new();
        };
        let Some(seq_nos) = digests.remove(digest) else {
            return Vec::new();
        };
        if digests.is_empty() {
            self.missing.remove(&key);
        }
        seq_nos.into_iter().collect()
    }

    /// Whether any sequence is still waiting on this request.
    pub(crate) fn is_missing(&self, client_id: ClientId, req_no: ReqNo) -> bool {
        self.missing.contains_key(&(client_id, req_no))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkConfig {
        NetworkConfig {
            nodes: vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)],
            number_of_buckets: 4,
            checkpoint_interval: 5,
            epoch_length: 500,
        }
    }

    fn ack(client_id: ClientId, req_no: ReqNo) -> RequestAck {
        RequestAck {
            client_id,
            req_no,
            digest: Digest(vec![7]),
        }
    }

    #[test]
    fn bucket_violation_is_rejected() {
        let network = network();
        let clients = ClientTracker::new(network.clone(), &[0, 1, 2, 3], NodeId(0));
        let mut outstanding = OutstandingRequests::default();
        // Request (0, 1) belongs to bucket 1, not bucket 2.
        let result = outstanding.admit_batch(
            NodeId(1),
            2,
            BucketId(2),
            &[ack(0, 1)],
            &network,
            &clients,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_requests_are_fetched_and_satisfied() {
        let network = network();
        let clients = ClientTracker::new(network.clone(), &[0, 1, 2, 3], NodeId(0));
        let mut outstanding = OutstandingRequests::default();
        let admitted = outstanding
            .admit_batch(NodeId(1), 1, BucketId(1), &[ack(0, 1)], &network, &clients)
            .unwrap();
        assert_eq!(admitted.missing.len(), 1);
        assert_eq!(admitted.fetches.unicast.len(), 1);
        assert!(outstanding.is_missing(0, 1));

        let waiting = outstanding.satisfy(0, 1, &Digest(vec![7]));
        assert_eq!(waiting, vec![1]);
        assert!(!outstanding.is_missing(0, 1));
    }

    #[test]
    fn null_requests_resolve_without_a_payload() {
        let network = network();
        let clients = ClientTracker::new(network.clone(), &[0, 1, 2, 3], NodeId(0));
        let mut outstanding = OutstandingRequests::default();
        let null_ack = RequestAck {
            client_id: 0,
            req_no: 1,
            digest: Digest::NULL,
        };
        let admitted = outstanding
            .admit_batch(NodeId(1), 1, BucketId(1), &[null_ack], &network, &clients)
            .unwrap();
        assert!(admitted.missing.is_empty());
        assert!(admitted.resolved[&(0, 1)].data.is_empty());
    }
}
