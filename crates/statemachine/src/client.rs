//! Client request tracking.
//!
//! Each replica doubles as a proxy for one client. The tracker keeps a
//! window of requests per client, the acks each request digest has gathered,
//! and the payloads known locally. A request becomes *proposable* once some
//! digest reaches strong attestation (`2f+1` acks) and the payload for that
//! digest is held locally (the null digest needs no payload).
//!
//! Proposable requests are appended to a ready list. Proposers walk it with
//! a stable iterator whose cursor survives both garbage collection and
//! proposer reconstruction at epoch changes.

use multibft_core::{Actions, PreprocessResult, Request};
use multibft_types::{
    ClientId, Digest, Msg, NetworkConfig, NodeId, ReqNo, RequestAck, RequestData, SeqNo,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace, warn};

/// A proposable request chosen for a batch: the ack to put in the
/// preprepare and the payload to hash.
#[derive(Debug, Clone)]
pub(crate) struct AssignedRequest {
    pub ack: RequestAck,
    pub data: RequestData,
}

#[derive(Default)]
struct RequestNode {
    /// Ack senders per digest.
    acks: BTreeMap<Digest, BTreeSet<NodeId>>,
    /// Payloads known locally, per digest.
    data: BTreeMap<Digest, RequestData>,
    /// Checkpoint after which this request may be proposed.
    valid_after: SeqNo,
    committed: Option<SeqNo>,
    allocated: Option<SeqNo>,
    queued: bool,
}

struct ClientWindow {
    /// Next request number for locally submitted proposals.
    next_req_no: ReqNo,
    /// Lowest request number not yet garbage collected.
    low_req_no: ReqNo,
    requests: BTreeMap<ReqNo, RequestNode>,
}

impl Default for ClientWindow {
    fn default() -> Self {
        Self {
            next_req_no: 1,
            low_req_no: 1,
            requests: BTreeMap::new(),
        }
    }
}

/// Append-only list of proposable requests. `base` is the global index of
/// the front entry, so iterator cursors stay valid across front trimming.
#[derive(Default)]
struct ReadyList {
    entries: VecDeque<(ClientId, ReqNo)>,
    base: u64,
}

/// Stable, restartable cursor over the ready list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyIterator {
    cursor: u64,
}

pub(crate) struct ClientTracker {
    my_id: NodeId,
    network: NetworkConfig,
    clients: BTreeMap<ClientId, ClientWindow>,
    ready: ReadyList,
}

impl ClientTracker {
    pub(crate) fn new(network: NetworkConfig, clients: &[ClientId], my_id: NodeId) -> Self {
        Self {
            my_id,
            network,
            clients: clients.iter().map(|c| (*c, ClientWindow::default())).collect(),
            ready: ReadyList::default(),
        }
    }

    pub(crate) fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Accept a locally submitted payload, assigning it the next request
    /// number of the local client, and request its digest.
    pub(crate) fn allocate_proposal(&mut self, data: Vec<u8>) -> Actions {
        let client_id = self.my_id.0;
        let window = self
            .clients
            .get_mut(&client_id)
            .expect("local client missing from client set");
        let req_no = window.next_req_no;
        window.next_req_no += 1;
        window.requests.entry(req_no).or_default();

        trace!(client_id, req_no, "allocated local proposal");

        let mut actions = Actions::default();
        actions.preprocess.push(Request {
            source: self.my_id,
            request: RequestData {
                client_id,
                req_no,
                data,
            },
        });
        actions
    }

    /// Record a hashed request payload: our own ack, plus dissemination if
    /// the request originated here.
    pub(crate) fn apply_preprocess_result(
        &mut self,
        result: &PreprocessResult,
        stable_checkpoint: SeqNo,
    ) -> Actions {
        let request = &result.request;
        if result.invalid {
            warn!(
                client_id = request.client_id,
                req_no = request.req_no,
                "dropping request flagged invalid by the application"
            );
            return Actions::default();
        }
        let strong_quorum = self.network.strong_quorum();
        let my_id = self.my_id;
        let Some(window) = self.clients.get_mut(&request.client_id) else {
            warn!(client_id = request.client_id, "request from unknown client");
            return Actions::default();
        };
        if request.req_no < window.low_req_no {
            trace!(
                client_id = request.client_id,
                req_no = request.req_no,
                "request below client watermark"
            );
            return Actions::default();
        }

        let node = window.requests.entry(request.req_no).or_default();
        let mut actions = Actions::default();
        if node.data.insert(result.digest.clone(), request.clone()).is_none()
            && node.acks.entry(result.digest.clone()).or_default().insert(my_id)
        {
            actions.send(Msg::RequestAck(request.ack(result.digest.clone())));
            if request.client_id == my_id.0 {
                actions.send(Msg::ForwardRequest(request.clone()));
            }
        }
        Self::maybe_queue(
            &mut self.ready,
            request.client_id,
            request.req_no,
            node,
            strong_quorum,
            stable_checkpoint,
        );
        actions
    }

    /// Record a remote replica's request ack.
    pub(crate) fn apply_request_ack(
        &mut self,
        source: NodeId,
        ack: RequestAck,
        stable_checkpoint: SeqNo,
    ) {
        let strong_quorum = self.network.strong_quorum();
        let Some(window) = self.clients.get_mut(&ack.client_id) else {
            warn!(client_id = ack.client_id, %source, "ack for unknown client");
            return;
        };
        if ack.req_no < window.low_req_no {
            return;
        }
        let node = window.requests.entry(ack.req_no).or_default();
        if !node.acks.entry(ack.digest.clone()).or_default().insert(source) {
            return;
        }
        Self::maybe_queue(
            &mut self.ready,
            ack.client_id,
            ack.req_no,
            node,
            strong_quorum,
            stable_checkpoint,
        );
    }

    fn maybe_queue(
        ready: &mut ReadyList,
        client_id: ClientId,
        req_no: ReqNo,
        node: &mut RequestNode,
        strong_quorum: usize,
        stable_checkpoint: SeqNo,
    ) {
        if node.queued || node.committed.is_some() {
            return;
        }
        let proposable = node.acks.iter().any(|(digest, acks)| {
            acks.len() >= strong_quorum && (digest.is_null() || node.data.contains_key(digest))
        });
        if !proposable {
            return;
        }
        node.queued = true;
        // Proposable from the checkpoint that was stable when attestation
        // completed; a proposer still paced behind it will splice the
        // request in as its own checkpoint pointer catches up.
        node.valid_after = stable_checkpoint;
        ready.entries.push_back((client_id, req_no));
        debug!(client_id, req_no, valid_after = node.valid_after, "request ready");
    }

    /// Resolve an ack to a payload we hold. The null digest resolves to the
    /// empty request without needing a stored payload.
    pub(crate) fn resolve(&self, ack: &RequestAck) -> Option<RequestData> {
        if ack.digest.is_null() {
            return Some(RequestData {
                client_id: ack.client_id,
                req_no: ack.req_no,
                data: Vec::new(),
            });
        }
        self.clients
            .get(&ack.client_id)?
            .requests
            .get(&ack.req_no)?
            .data
            .get(&ack.digest)
            .cloned()
    }

    /// Whether any payload for this request is held locally.
    pub(crate) fn has_request(&self, client_id: ClientId, req_no: ReqNo) -> bool {
        self.clients
            .get(&client_id)
            .and_then(|w| w.requests.get(&req_no))
            .is_some_and(|node| !node.data.is_empty())
    }

    /// Pick the digest to propose for a ready request. With multiple strong
    /// digests the null request wins; two strong non-null digests would
    /// contradict quorum intersection.
    pub(crate) fn take_for_proposal(
        &self,
        client_id: ClientId,
        req_no: ReqNo,
    ) -> Option<AssignedRequest> {
        let node = self.clients.get(&client_id)?.requests.get(&req_no)?;
        let strong_quorum = self.network.strong_quorum();
        let strong: Vec<&Digest> = node
            .acks
            .iter()
            .filter(|(_, acks)| acks.len() >= strong_quorum)
            .map(|(digest, _)| digest)
            .collect();
        let digest = match strong.len() {
            0 => return None,
            1 => strong[0].clone(),
            _ => {
                if !strong.iter().any(|d| d.is_null()) {
                    panic!(
                        "client ({client_id}, {req_no}) has multiple strong non-null digests"
                    );
                }
                Digest::NULL
            }
        };
        let data = if digest.is_null() {
            RequestData {
                client_id,
                req_no,
                data: Vec::new(),
            }
        } else {
            node.data.get(&digest)?.clone()
        };
        Some(AssignedRequest {
            ack: data.ack(digest),
            data,
        })
    }

    pub(crate) fn valid_after(&self, client_id: ClientId, req_no: ReqNo) -> SeqNo {
        self.clients
            .get(&client_id)
            .and_then(|w| w.requests.get(&req_no))
            .map(|n| n.valid_after)
            .unwrap_or(0)
    }

    pub(crate) fn mark_allocated(&mut self, client_id: ClientId, req_no: ReqNo, seq_no: SeqNo) {
        if let Some(node) = self
            .clients
            .get_mut(&client_id)
            .and_then(|w| w.requests.get_mut(&req_no))
        {
            node.allocated = Some(seq_no);
        }
    }

    pub(crate) fn mark_committed(&mut self, client_id: ClientId, req_no: ReqNo, seq_no: SeqNo) {
        if let Some(node) = self
            .clients
            .get_mut(&client_id)
            .and_then(|w| w.requests.get_mut(&req_no))
        {
            node.committed = Some(seq_no);
        }
    }

    /// Forget in-flight allocations; used when an epoch change invalidates
    /// them so uncommitted requests become proposable again.
    pub(crate) fn clear_allocations(&mut self) {
        for window in self.clients.values_mut() {
            for node in window.requests.values_mut() {
                if node.committed.is_none() {
                    node.allocated = None;
                }
            }
        }
    }

    /// Drop requests covered by a stable checkpoint and trim the ready list.
    pub(crate) fn garbage_collect(&mut self, stable: SeqNo) {
        for window in self.clients.values_mut() {
            while let Some(node) = window.requests.get(&window.low_req_no) {
                if node.committed.is_some_and(|seq| seq <= stable) {
                    window.requests.remove(&window.low_req_no);
                    window.low_req_no += 1;
                } else {
                    break;
                }
            }
        }
        while let Some((client_id, req_no)) = self.ready.entries.front().copied() {
            let gone = self
                .clients
                .get(&client_id)
                .map_or(true, |w| req_no < w.low_req_no);
            if gone {
                self.ready.entries.pop_front();
                self.ready.base += 1;
            } else {
                break;
            }
        }
    }

    /// A fresh iterator positioned at the oldest retained ready entry.
    pub(crate) fn ready_iterator(&self) -> ReadyIterator {
        ReadyIterator {
            cursor: self.ready.base,
        }
    }

    /// Advance `iter` to the next request that is still worth proposing.
    pub(crate) fn ready_next(&self, iter: &mut ReadyIterator) -> Option<(ClientId, ReqNo)> {
        if iter.cursor < self.ready.base {
            iter.cursor = self.ready.base;
        }
        loop {
            let offset = (iter.cursor - self.ready.base) as usize;
            let (client_id, req_no) = *self.ready.entries.get(offset)?;
            iter.cursor += 1;
            let Some(node) = self
                .clients
                .get(&client_id)
                .and_then(|w| w.requests.get(&req_no))
            else {
                continue;
            };
            if node.committed.is_some() || node.allocated.is_some() {
                continue;
            }
            return Some((client_id, req_no));
        }
    }

    /// Record the requests carried by a replayed QEntry so recovery leaves
    /// them resolvable and not re-proposable.
    pub(crate) fn note_recovered_batch(&mut self, seq_no: SeqNo, requests: &[RequestData]) {
        for request in requests {
            let Some(window) = self.clients.get_mut(&request.client_id) else {
                continue;
            };
            if request.req_no < window.low_req_no {
                continue;
            }
            let node = window.requests.entry(request.req_no).or_default();
            node.allocated = Some(seq_no);
            if request.client_id == self.my_id.0 {
                window.next_req_no = window.next_req_no.max(request.req_no + 1);
            }
        }
    }

    pub(crate) fn status(&self) -> Vec<crate::status::ClientStatus> {
        self.clients
            .iter()
            .map(|(client_id, window)| crate::status::ClientStatus {
                client_id: *client_id,
                low_req_no: window.low_req_no,
                tracked_requests: window.requests.len(),
            })
            .collect()
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

    fn tracker() -> ClientTracker {
        ClientTracker::new(network(), &[0, 1, 2, 3], NodeId(0))
    }

    fn preprocessed(client_id: ClientId, req_no: ReqNo, digest: u8) -> PreprocessResult {
        PreprocessResult {
            request: RequestData {
                client_id,
                req_no,
                data: vec![0xaa],
            },
            digest: Digest(vec![digest]),
            invalid: false,
        }
    }

    #[test]
    fn local_proposal_is_acked_and_forwarded() {
        let mut t = tracker();
        let actions = t.allocate_proposal(vec![0xaa]);
        assert_eq!(actions.preprocess.len(), 1);
        assert_eq!(actions.preprocess[0].request.req_no, 1);

        let actions = t.apply_preprocess_result(&preprocessed(0, 1, 7), 0);
        assert_eq!(actions.broadcast.len(), 2);
        assert!(matches!(actions.broadcast[0], Msg::RequestAck(_)));
        assert!(matches!(actions.broadcast[1], Msg::ForwardRequest(_)));
    }

    #[test]
    fn foreign_request_is_acked_but_not_forwarded() {
        let mut t = tracker();
        let actions = t.apply_preprocess_result(&preprocessed(2, 1, 7), 0);
        assert_eq!(actions.broadcast.len(), 1);
        assert!(matches!(actions.broadcast[0], Msg::RequestAck(_)));
    }

    #[test]
    fn strong_attestation_queues_the_request() {
        let mut t = tracker();
        t.apply_preprocess_result(&preprocessed(0, 1, 7), 0);
        let ack = RequestData {
            client_id: 0,
            req_no: 1,
            data: vec![0xaa],
        }
        .ack(Digest(vec![7]));
        t.apply_request_ack(NodeId(1), ack.clone(), 0);
        let mut iter = t.ready_iterator();
        assert!(t.ready_next(&mut iter).is_none());
        t.apply_request_ack(NodeId(2), ack, 0);
        let mut iter = t.ready_iterator();
        assert_eq!(t.ready_next(&mut iter), Some((0, 1)));
        assert_eq!(t.valid_after(0, 1), 0);
    }

    #[test]
    fn attestation_without_payload_waits_for_the_payload() {
        let mut t = tracker();
        let ack = RequestData {
            client_id: 1,
            req_no: 1,
            data: vec![0xaa],
        }
        .ack(Digest(vec![7]));
        for node in [0, 1, 2] {
            t.apply_request_ack(NodeId(node), ack.clone(), 0);
        }
        let mut iter = t.ready_iterator();
        assert!(t.ready_next(&mut iter).is_none());
        // The payload arrives (forwarded) and is preprocessed.
        t.apply_preprocess_result(&preprocessed(1, 1, 7), 0);
        let mut iter = t.ready_iterator();
        assert_eq!(t.ready_next(&mut iter), Some((1, 1)));
    }

    #[test]
    fn null_digest_is_preferred_over_a_strong_payload() {
        let mut t = tracker();
        t.apply_preprocess_result(&preprocessed(0, 1, 7), 0);
        let data = RequestData {
            client_id: 0,
            req_no: 1,
            data: vec![0xaa],
        };
        for node in [1, 2] {
            t.apply_request_ack(NodeId(node), data.ack(Digest(vec![7])), 0);
        }
        for node in [0, 1, 2] {
            t.apply_request_ack(NodeId(node), data.ack(Digest::NULL), 0);
        }
        let assigned = t.take_for_proposal(0, 1).unwrap();
        assert!(assigned.ack.digest.is_null());
        assert!(assigned.data.data.is_empty());
    }

    #[test]
    fn iterator_survives_garbage_collection() {
        let mut t = tracker();
        for req_no in 1..=3u64 {
            t.allocate_proposal(vec![req_no as u8]);
            t.apply_preprocess_result(&preprocessed(0, req_no, req_no as u8), 0);
            let ack = RequestData {
                client_id: 0,
                req_no,
                data: vec![req_no as u8],
            }
            .ack(Digest(vec![req_no as u8]));
            t.apply_request_ack(NodeId(1), ack.clone(), 0);
            t.apply_request_ack(NodeId(2), ack, 0);
        }
        let mut iter = t.ready_iterator();
        assert_eq!(t.ready_next(&mut iter), Some((0, 1)));
        // Request 1 commits and is collected; the cursor keeps going.
        t.mark_committed(0, 1, 3);
        t.garbage_collect(5);
        assert_eq!(t.ready_next(&mut iter), Some((0, 2)));
        assert_eq!(t.ready_next(&mut iter), Some((0, 3)));
        assert!(t.ready_next(&mut iter).is_none());
    }

    #[test]
    fn allocated_requests_are_skipped_until_cleared() {
        let mut t = tracker();
        t.apply_preprocess_result(&preprocessed(0, 1, 7), 0);
        let ack = RequestData {
            client_id: 0,
            req_no: 1,
            data: vec![0xaa],
        }
        .ack(Digest(vec![7]));
        t.apply_request_ack(NodeId(1), ack.clone(), 0);
        t.apply_request_ack(NodeId(2), ack, 0);
        t.mark_allocated(0, 1, 9);
        let mut iter = t.ready_iterator();
        assert!(t.ready_next(&mut iter).is_none());
        // An epoch change abandons the allocation; the request is
        // proposable again from a fresh iterator.
        t.clear_allocations();
        let mut iter = t.ready_iterator();
        assert_eq!(t.ready_next(&mut iter), Some((0, 1)));
    }
}
