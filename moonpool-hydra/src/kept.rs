//! Responses kept for idempotent retries.
//!
//! When a mutation carrying a [`MutationId`] is applied, its response is
//! remembered. A client that lost the answer (failover, timeout) resubmits
//! with the same id and gets the kept response back instead of a second
//! application. Registration happens in apply order on every peer, so the
//! keeper content is part of the replicated state and travels in snapshots.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{MutationId, MutationResponse};

/// Bounded map from mutation id to response, evicting the oldest entry.
#[derive(Debug, Clone)]
pub struct ResponseKeeper {
    capacity: usize,
    responses: HashMap<MutationId, MutationResponse>,
    order: VecDeque<MutationId>,
}

#[derive(Serialize, Deserialize)]
struct KeptEntry {
    id: MutationId,
    data: Vec<u8>,
}

impl ResponseKeeper {
    /// Create an empty keeper holding at most `capacity` responses.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            responses: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// The response kept for `id`.
    pub fn find(&self, id: &MutationId) -> Option<&MutationResponse> {
        self.responses.get(id)
    }

    /// Remember a response. A second registration of the same id is ignored.
    pub fn register(&mut self, id: MutationId, response: MutationResponse) {
        if self.capacity == 0 || self.responses.contains_key(&id) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.responses.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.responses.insert(id, response);
    }

    /// Number of kept responses.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is kept.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.responses.clear();
        self.order.clear();
    }

    /// Serialize in eviction order.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let entries: Vec<KeptEntry> = self
            .order
            .iter()
            .filter_map(|id| {
                self.responses.get(id).map(|response| KeptEntry {
                    id: *id,
                    data: response.data.clone(),
                })
            })
            .collect();
        serde_json::to_vec(&entries)
    }

    /// Replace the content with an encoded keeper.
    pub fn decode(&mut self, data: &[u8]) -> Result<(), serde_json::Error> {
        self.clear();
        if data.is_empty() {
            return Ok(());
        }
        let entries: Vec<KeptEntry> = serde_json::from_slice(data)?;
        for entry in entries {
            self.register(entry.id, MutationResponse::new(entry.data));
        }
        Ok(())
    }
}
