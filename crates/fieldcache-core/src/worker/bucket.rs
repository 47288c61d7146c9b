//! Named, capacity-bounded response buckets.
//!
//! Trimming evicts in insertion order. Re-storing a key counts as a new
//! insertion, so a refreshed response moves to the back of the queue.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::debug;

use crate::http::HttpResponse;

#[derive(Debug, Clone, Default)]
pub struct Bucket {
    order: VecDeque<String>,
    entries: HashMap<String, HttpResponse>,
}

impl Bucket {
    pub fn get(&self, key: &str) -> Option<&HttpResponse> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: &str, response: HttpResponse) {
        if self.entries.insert(key.to_string(), response).is_some() {
            self.order.retain(|k| k != key);
        }
        self.order.push_back(key.to_string());
    }

    /// Drop oldest-inserted entries until at most `ceiling` remain.
    /// Returns the evicted keys, oldest first.
    pub fn trim(&mut self, ceiling: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.order.len() > ceiling {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

/// Every bucket the worker can see, by name.
#[derive(Debug, Clone, Default)]
pub struct BucketStorage {
    buckets: BTreeMap<String, Bucket>,
}

impl BucketStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name`, creating it empty if needed.
    pub fn open(&mut self, name: &str) -> &mut Bucket {
        self.buckets.entry(name.to_string()).or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    /// Look up `key` in bucket `name` without creating the bucket.
    pub fn lookup(&self, name: &str, key: &str) -> Option<HttpResponse> {
        self.buckets.get(name)?.get(key).cloned()
    }

    /// Store and then trim to `ceiling` if the bucket has one.
    pub fn store(&mut self, name: &str, key: &str, response: HttpResponse, ceiling: Option<usize>) {
        let bucket = self.open(name);
        bucket.put(key, response);
        if let Some(ceiling) = ceiling {
            let evicted = bucket.trim(ceiling);
            if !evicted.is_empty() {
                debug!(bucket = name, evicted = evicted.len(), ceiling = ceiling, "Trimmed bucket");
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.buckets.remove(name).is_some()
    }

    /// Delete every bucket not named in `keep`. Returns the deleted names.
    pub fn retain_only(&mut self, keep: &[String]) -> Vec<String> {
        let doomed: Vec<String> = self
            .buckets
            .keys()
            .filter(|name| !keep.contains(name))
            .cloned()
            .collect();
        for name in &doomed {
            self.buckets.remove(name);
        }
        doomed
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.buckets
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.len()))
            .collect()
    }
}
