//! In-memory list/watch source
//!
//! Holds a set of objects and broadcasts changes to every open watch. Each
//! watch starts with a full listing of the current objects. A source created
//! with [`MemoryListWatch::unsynced`] withholds that listing until
//! [`MemoryListWatch::mark_ready`] is called, which lets tests observe an
//! informer that has not finished its initial sync.

use crate::k8s::types::object_key;
use crate::k8s::watcher::{ListWatch, WatchEvent, WatchedResource};
use crate::{KubedoxError, Result};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryListWatch<K: Clone> {
    objects: Arc<Mutex<BTreeMap<String, K>>>,
    events: broadcast::Sender<WatchEvent<K>>,
    ready: watch::Sender<bool>,
}

impl<K: WatchedResource> MemoryListWatch<K> {
    pub fn new() -> Self {
        Self::build(Vec::new(), true)
    }

    pub fn with_objects(objects: Vec<K>) -> Self {
        Self::build(objects, true)
    }

    /// A source whose watches block before listing until [`Self::mark_ready`]
    pub fn unsynced(objects: Vec<K>) -> Self {
        Self::build(objects, false)
    }

    fn build(objects: Vec<K>, ready: bool) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (ready, _) = watch::channel(ready);
        let objects = objects
            .into_iter()
            .map(|obj| (object_key(&obj), obj))
            .collect();

        Self {
            objects: Arc::new(Mutex::new(objects)),
            events,
            ready,
        }
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Create or replace an object
    pub fn apply(&self, obj: K) {
        let mut objects = self.objects.lock();
        objects.insert(object_key(&obj), obj.clone());
        let _ = self.events.send(WatchEvent::Apply(obj));
    }

    /// Remove an object
    pub fn delete(&self, obj: &K) {
        let mut objects = self.objects.lock();
        if let Some(last) = objects.remove(&object_key(obj)) {
            let _ = self.events.send(WatchEvent::Delete(last));
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl<K: WatchedResource> Default for MemoryListWatch<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: WatchedResource> ListWatch<K> for MemoryListWatch<K> {
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let objects = Arc::clone(&self.objects);
        let events = self.events.clone();
        let mut ready = self.ready.subscribe();

        stream::once(async move {
            let _ = ready.wait_for(|ready| *ready).await;

            // subscribe under the lock so no change is missed or seen twice
            let (listed, updates) = {
                let objects = objects.lock();
                let listed: Vec<K> = objects.values().cloned().collect();
                (listed, events.subscribe())
            };

            let listing = std::iter::once(WatchEvent::Init)
                .chain(listed.into_iter().map(WatchEvent::InitApply))
                .chain(std::iter::once(WatchEvent::InitDone))
                .map(Ok);

            let updates = BroadcastStream::new(updates).map(|event| {
                event.map_err(|e| KubedoxError::WatchFailed {
                    kind: <K as k8s_openapi::Resource>::KIND,
                    reason: e.to_string(),
                })
            });

            stream::iter(listing).chain(updates)
        })
        .flatten()
        .boxed()
    }
}
