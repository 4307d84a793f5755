//! Client request types.

use crate::{ClientId, Digest, ReqNo};

/// A client request payload.
///
/// Requests are identified by `(client_id, req_no)`; the payload bytes are
/// opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestData {
    pub client_id: ClientId,
    pub req_no: ReqNo,
    pub data: Vec<u8>,
}

impl RequestData {
    /// Build the acknowledgement for this request under the given digest.
    pub fn ack(&self, digest: Digest) -> RequestAck {
        RequestAck {
            client_id: self.client_id,
            req_no: self.req_no,
            digest,
        }
    }
}

/// An acknowledgement that a replica knows a request with a given digest.
///
/// Once `2f+1` replicas have acked the same digest for `(client_id, req_no)`
/// the request is *strongly attested* and becomes proposable. Preprepare
/// batches carry acks, not payloads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestAck {
    pub client_id: ClientId,
    pub req_no: ReqNo,
    pub digest: Digest,
}
