//! Identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica identifier (monotonically assigned by the deployment).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Bucket identifier: a partition of the sequence-number space.
///
/// The bucket of a sequence number is `seq_no % number_of_buckets`, and every
/// bucket has exactly one leader per epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct BucketId(pub u64);

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bucket({})", self.0)
    }
}

/// Sequence number: a slot in the totally ordered log.
pub type SeqNo = u64;

/// Epoch number.
pub type EpochNo = u64;

/// Client identifier. Replicas double as client proxies, so client ids are
/// drawn from the same space as node ids.
pub type ClientId = u64;

/// Per-client request number.
pub type ReqNo = u64;

/// A caller-computed hash.
///
/// The engine never hashes anything itself; it emits hashing work as actions
/// and stores whatever bytes the caller returns. The empty digest is reserved
/// for the *null request*, the tie-breaking empty variant of a client request.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(pub Vec<u8>);

impl Digest {
    /// The null-request digest.
    pub const NULL: Digest = Digest(Vec::new());

    /// Whether this is the null-request digest.
    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Digest {
    fn from(bytes: Vec<u8>) -> Self {
        Digest(bytes)
    }
}

impl From<&[u8]> for Digest {
    fn from(bytes: &[u8]) -> Self {
        Digest(bytes.to_vec())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Digest(null)");
        }
        // Print a short prefix, enough to tell digests apart in logs.
        write!(f, "Digest(")?;
        for b in self.0.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}
