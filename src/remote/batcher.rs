//! The pending-request queue and the batch collection loop.
//!
//! Requests enter a priority queue ordered by their monotonic request id
//! (FIFO by issuance; recoveries re-enter with their original id and jump
//! ahead of newer work). The batcher pulls the first item, drains whatever
//! else is already queued, waits one short collection period for
//! stragglers, and partitions the result by batch key into provider-call
//! descriptors.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::error::Result;
use crate::request::{ApiConfig, CompletionRequest};
use crate::remote::slice::ResponseSlice;

/// A pending request awaiting batching.
pub(crate) struct QueueItem {
    pub request: CompletionRequest,
    pub request_id: u64,
    pub responder: oneshot::Sender<Result<ResponseSlice>>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the lowest request id pops first
        other.request_id.cmp(&self.request_id)
    }
}

/// Priority queue of pending requests, lowest request id first.
pub(crate) struct RequestQueue {
    heap: Mutex<BinaryHeap<QueueItem>>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new() -> RequestQueue {
        RequestQueue {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, item: QueueItem) {
        self.heap.lock().expect("request queue poisoned").push(item);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<QueueItem> {
        self.heap.lock().expect("request queue poisoned").pop()
    }

    pub async fn pop(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.lock().expect("request queue poisoned").len()
    }
}

/// One provider call's worth of fused requests.
pub(crate) struct CallDescriptor {
    pub members: Vec<QueueItem>,
    pub chat: bool,
    /// First configuration supplied by any member.
    pub api_config: Option<ApiConfig>,
    /// Maximum of the members' stall timeouts.
    pub stall_timeout: Duration,
}

/// Groups compatible queue items into call descriptors.
pub(crate) struct Batcher {
    pub batch_size: usize,
    pub collection_period: Duration,
    pub default_stall_timeout: Duration,
}

impl Batcher {
    /// Block for the first pending item, gather up to `batch_size`, and
    /// partition into descriptors. Tie-breaking inside a partition preserves
    /// queue order; partitions are emitted in discovery order.
    pub async fn collect(&self, queue: &RequestQueue) -> Vec<CallDescriptor> {
        let first = queue.pop().await;
        let mut items = vec![first];
        self.drain(queue, &mut items);
        if items.len() < self.batch_size {
            tokio::time::sleep(self.collection_period).await;
            self.drain(queue, &mut items);
        }
        self.group(items)
    }

    fn drain(&self, queue: &RequestQueue, items: &mut Vec<QueueItem>) {
        while items.len() < self.batch_size {
            match queue.try_pop() {
                Some(item) => items.push(item),
                None => break,
            }
        }
    }

    fn group(&self, items: Vec<QueueItem>) -> Vec<CallDescriptor> {
        let mut buckets: Vec<(String, Vec<QueueItem>)> = Vec::new();
        for item in items {
            let key = item.request.batch_key();
            match buckets.iter_mut().find(|(k, _)| *k == key) {
                Some((_, bucket)) => bucket.push(item),
                None => buckets.push((key, vec![item])),
            }
        }

        let mut descriptors = Vec::new();
        for (_, bucket) in buckets {
            if bucket[0].request.is_chat() {
                // the chat endpoint has no batched prompt form
                for item in bucket {
                    descriptors.push(self.descriptor(vec![item], true));
                }
            } else {
                descriptors.push(self.descriptor(bucket, false));
            }
        }
        descriptors
    }

    fn descriptor(&self, members: Vec<QueueItem>, chat: bool) -> CallDescriptor {
        let api_config = members
            .iter()
            .find_map(|m| m.request.api_config.clone());
        let stall_timeout = members
            .iter()
            .filter_map(|m| m.request.timeout)
            .max()
            .unwrap_or(self.default_stall_timeout);
        CallDescriptor {
            members,
            chat,
            api_config,
            stall_timeout,
        }
    }
}
