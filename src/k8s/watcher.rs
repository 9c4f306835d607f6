//! Resource informers
//!
//! An [`Informer`] keeps a local mirror of one resource kind and turns raw
//! watch events from a [`ListWatch`] source into Add/Update/Delete
//! notifications. The orchestrator connection sits behind [`ListWatch`] so the
//! rest of the crate can run against [`crate::k8s::MemoryListWatch`].

use crate::k8s::types::object_key;
use crate::{KubedoxError, Result};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use kube::runtime::watcher;
use kube::Api;
use kubedox_model::Event;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Resource types an [`Informer`] can mirror
pub trait WatchedResource:
    kube::Resource<DynamicType = ()>
    + k8s_openapi::Resource
    + Clone
    + PartialEq
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> WatchedResource for K where
    K: kube::Resource<DynamicType = ()>
        + k8s_openapi::Resource
        + Clone
        + PartialEq
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Raw event produced by a list/watch source
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// A (re)list is starting
    Init,
    /// Object that is part of the current list
    InitApply(K),
    /// The list is complete; objects not listed since `Init` are gone
    InitDone,
    /// Object created or modified
    Apply(K),
    /// Object deleted, with its last known state
    Delete(K),
}

/// List/watch capability for one resource kind
pub trait ListWatch<K>: Send + Sync {
    /// Start a fresh list followed by a watch
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// [`ListWatch`] backed by the Kubernetes API
pub struct KubeListWatch<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K: WatchedResource> KubeListWatch<K> {
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            config: watcher::Config::default(),
        }
    }
}

impl<K: WatchedResource> ListWatch<K> for KubeListWatch<K> {
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        watcher::watcher(self.api.clone(), self.config.clone())
            .map(|event| match event {
                Ok(watcher::Event::Init) => Ok(WatchEvent::Init),
                Ok(watcher::Event::InitApply(obj)) => Ok(WatchEvent::InitApply(obj)),
                Ok(watcher::Event::InitDone) => Ok(WatchEvent::InitDone),
                Ok(watcher::Event::Apply(obj)) => Ok(WatchEvent::Apply(obj)),
                Ok(watcher::Event::Delete(obj)) => Ok(WatchEvent::Delete(obj)),
                Err(e) => Err(KubedoxError::WatchFailed {
                    kind: <K as k8s_openapi::Resource>::KIND,
                    reason: e.to_string(),
                }),
            })
            .boxed()
    }
}

enum WatchOutcome {
    Stopped,
    Resync,
    Ended,
    Failed(KubedoxError),
}

/// Local, periodically relisted mirror of one resource kind
pub struct Informer<K> {
    source: Arc<dyn ListWatch<K>>,
    store: DashMap<String, Arc<K>>,
    synced: AtomicBool,
    resync_period: Option<Duration>,
}

impl<K: WatchedResource> Informer<K> {
    pub fn new(source: Arc<dyn ListWatch<K>>, resync_period: Option<Duration>) -> Self {
        Self {
            source,
            store: DashMap::new(),
            synced: AtomicBool::new(false),
            resync_period,
        }
    }

    pub fn kind(&self) -> &'static str {
        <K as k8s_openapi::Resource>::KIND
    }

    /// True once the first full list has been applied to the store
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.store.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Snapshot of the store, sorted by key
    pub fn list(&self) -> Vec<Arc<K>> {
        let mut entries: Vec<(String, Arc<K>)> = self
            .store
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Mirror the source until `stop` fires, passing every change to `notify`.
    /// Failed streams are reopened with exponential backoff.
    pub async fn run<F>(&self, stop: CancellationToken, mut notify: F)
    where
        F: FnMut(Arc<K>, Event) + Send,
    {
        info!("Starting {} informer", self.kind());

        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.watch_once(&stop, &mut notify, &mut backoff).await {
                WatchOutcome::Stopped => break,
                WatchOutcome::Resync => {
                    debug!("Resyncing {} informer", self.kind());
                }
                WatchOutcome::Ended => {
                    warn!("{} watch stream ended, reconnecting...", self.kind());
                    backoff = INITIAL_BACKOFF;
                }
                WatchOutcome::Failed(e) => {
                    error!("{} watch failed: {}, reconnecting in {:?}", self.kind(), e, backoff);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                }
            }
        }

        info!("{} informer stopped", self.kind());
    }

    async fn watch_once<F>(
        &self,
        stop: &CancellationToken,
        notify: &mut F,
        backoff: &mut Duration,
    ) -> WatchOutcome
    where
        F: FnMut(Arc<K>, Event) + Send,
    {
        let mut stream = self.source.watch();
        let mut listing: Option<BTreeMap<String, Arc<K>>> = None;

        let resync = async {
            match self.resync_period {
                Some(period) => tokio::time::sleep(period).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(resync);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return WatchOutcome::Stopped,
                _ = &mut resync => return WatchOutcome::Resync,
                event = stream.next() => match event {
                    None => return WatchOutcome::Ended,
                    Some(Err(e)) => return WatchOutcome::Failed(e),
                    Some(Ok(event)) => {
                        *backoff = INITIAL_BACKOFF;
                        self.handle(event, &mut listing, notify);
                    }
                },
            }
        }
    }

    fn handle<F>(
        &self,
        event: WatchEvent<K>,
        listing: &mut Option<BTreeMap<String, Arc<K>>>,
        notify: &mut F,
    ) where
        F: FnMut(Arc<K>, Event),
    {
        match event {
            WatchEvent::Init => {
                *listing = Some(BTreeMap::new());
            }
            WatchEvent::InitApply(obj) => {
                let obj = Arc::new(obj);
                listing
                    .get_or_insert_with(BTreeMap::new)
                    .insert(object_key(obj.as_ref()), obj);
            }
            WatchEvent::InitDone => {
                let listed = listing.take().unwrap_or_default();
                self.replace(listed, notify);
                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!(
                        "{} informer initial sync complete. Tracking {} objects",
                        self.kind(),
                        self.store.len()
                    );
                }
            }
            WatchEvent::Apply(obj) => {
                let obj = Arc::new(obj);
                self.upsert(object_key(obj.as_ref()), obj, notify);
            }
            WatchEvent::Delete(obj) => {
                let key = object_key(&obj);
                if self.store.remove(&key).is_some() {
                    notify(Arc::new(obj), Event::Delete);
                } else {
                    debug!("Delete for unknown {} {}", self.kind(), key);
                }
            }
        }
    }

    fn upsert<F>(&self, key: String, obj: Arc<K>, notify: &mut F)
    where
        F: FnMut(Arc<K>, Event),
    {
        match self.store.insert(key, Arc::clone(&obj)) {
            None => notify(obj, Event::Add),
            Some(old) if *old != *obj => notify(obj, Event::Update),
            Some(_) => {}
        }
    }

    /// Apply a complete listing: new keys become Add, changed ones Update and
    /// keys missing from the listing Delete
    fn replace<F>(&self, listed: BTreeMap<String, Arc<K>>, notify: &mut F)
    where
        F: FnMut(Arc<K>, Event),
    {
        let mut stale: Vec<String> = self
            .store
            .iter()
            .filter(|r| !listed.contains_key(r.key()))
            .map(|r| r.key().clone())
            .collect();
        stale.sort();

        for (key, obj) in listed {
            self.upsert(key, obj, notify);
        }

        for key in stale {
            if let Some((_, old)) = self.store.remove(&key) {
                notify(old, Event::Delete);
            }
        }
    }
}
