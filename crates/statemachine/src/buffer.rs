//! Buffering for messages that cannot be applied yet.
//!
//! Messages above the high watermark or addressed to an epoch we have not
//! activated are parked per sender and replayed when the window or the
//! epoch moves. Each sender gets a bounded queue; the oldest message is
//! shed on overflow.

use multibft_types::{Msg, NodeId};
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

pub(crate) struct MsgBuffers {
    capacity: usize,
    buffers: BTreeMap<NodeId, VecDeque<Msg>>,
}

impl MsgBuffers {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: BTreeMap::new(),
        }
    }

    pub(crate) fn store(&mut self, source: NodeId, msg: Msg) {
        let buffer = self.buffers.entry(source).or_default();
        if buffer.len() >= self.capacity {
            let dropped = buffer.pop_front();
            warn!(
                %source,
                kind = dropped.as_ref().map(|m| m.type_name()).unwrap_or(""),
                "message buffer overflow, shedding oldest"
            );
        }
        buffer.push_back(msg);
    }

    /// Take every buffered message, oldest first per sender.
    pub(crate) fn drain(&mut self) -> Vec<(NodeId, Msg)> {
        let mut drained = Vec::new();
        for (source, buffer) in std::mem::take(&mut self.buffers) {
            for msg in buffer {
                drained.push((source, msg));
            }
        }
        drained
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
