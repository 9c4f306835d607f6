//! Pod address cache for resolving endpoint addresses to pods
//!
//! Pods are scheduled before they get an address, so the pod informer's own
//! store cannot be indexed by IP up front. This cache keeps a stable
//! `address -> namespace/name` mapping that converges as pod notifications
//! arrive, and resolves the key against the pod informer's store on lookup.

use crate::k8s::types::{object_key, ClusterObject};
use crate::k8s::watcher::Informer;
use crate::queue::{handler_fn, HandlerFn};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kubedox_model::Event;
use std::sync::Arc;
use tracing::debug;

/// Eventually consistent map from pod IP to pod key
#[derive(Clone)]
pub struct PodCache {
    keys: Arc<DashMap<String, String>>,
    pods: Arc<Informer<Pod>>,
}

impl PodCache {
    pub fn new(pods: Arc<Informer<Pod>>) -> Self {
        Self {
            keys: Arc::new(DashMap::new()),
            pods,
        }
    }

    /// Handler keeping the cache in step with pod notifications
    pub fn handler(&self) -> HandlerFn {
        let cache = self.clone();
        handler_fn(move |obj, event| {
            if let ClusterObject::Pod(pod) = &obj {
                cache.update(pod, event);
            }
            async { Ok(()) }
        })
    }

    /// Record or drop the address of a pod. A pod reported without an address
    /// falls back to the address previously recorded for the same key.
    pub fn update(&self, pod: &Pod, event: Event) {
        let key = object_key(pod);

        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.address_of(&key));

        let Some(ip) = ip else {
            debug!("Pod {} has no address yet", key);
            return;
        };

        match event {
            Event::Add | Event::Update => {
                // a pod holds one address at a time
                self.keys.retain(|addr, k| *k != key || *addr == ip);
                debug!("Mapped {} -> {}", ip, key);
                self.keys.insert(ip, key);
            }
            Event::Delete => {
                // the address may already belong to a newer pod
                if self.keys.remove_if(&ip, |_, k| *k == key).is_some() {
                    debug!("Removed {} from pod cache", ip);
                }
            }
        }
    }

    /// Pod key recorded for an address
    pub fn key_for(&self, addr: &str) -> Option<String> {
        self.keys.get(addr).map(|r| r.value().clone())
    }

    fn address_of(&self, key: &str) -> Option<String> {
        self.keys
            .iter()
            .find(|r| r.value() == key)
            .map(|r| r.key().clone())
    }

    /// Current state of the pod at `addr`; `None` when the address is not
    /// mapped or the pod is gone from the informer store
    pub fn get_pod_by_ip(&self, addr: &str) -> Option<Arc<Pod>> {
        let key = self.key_for(addr)?;
        self.pods.get(&key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All `(address, key)` pairs, sorted by address
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .keys
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        entries.sort();
        entries
    }
}
