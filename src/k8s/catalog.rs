//! Service catalog: synchronized informers feeding a single work queue
//!
//! The catalog guarantees that a handler never observes a notification
//! before every local store is at least as fresh as that notification: the
//! first handler of every chain refuses to proceed until all informers have
//! completed their initial sync, which makes the queue retry the task. The
//! store may be fresher than the notification (a delete can overtake the add
//! it cancels).
//!
//! Handlers run on the single queue consumer in the order they were
//! appended. All handlers must be appended before [`Catalog::run`].

use crate::config::DiscoveryConfig;
use crate::k8s::conversion::{
    convert_deployment, convert_endpoints, convert_probes_to_ports, convert_service,
    ready_replicas,
};
use crate::k8s::pod_cache::PodCache;
use crate::k8s::types::{object_key, ClusterObject, NAMESPACE_SYSTEM};
use crate::k8s::watcher::{Informer, ListWatch, WatchedResource};
use crate::metrics::DiscoveryMetrics;
use crate::queue::{handler_fn, ChainHandler, HandlerFn, Queue, QueueOptions, Task};
use crate::KubedoxError;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kubedox_model as model;
use kubedox_model::{Event, PortList, ServiceInstance};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    pub resync_period: Option<Duration>,
    pub domain_suffix: String,
    pub queue: QueueOptions,
}

impl From<&DiscoveryConfig> for CatalogOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            resync_period: config.resync_period(),
            domain_suffix: config.domain_suffix.clone(),
            queue: QueueOptions::from(config),
        }
    }
}

/// List/watch sources for every kind the catalog mirrors
pub struct CatalogSources {
    pub services: Arc<dyn ListWatch<Service>>,
    pub endpoints: Arc<dyn ListWatch<Endpoints>>,
    pub deployments: Arc<dyn ListWatch<Deployment>>,
    pub pods: Arc<dyn ListWatch<Pod>>,
}

trait SyncStatus: Send + Sync {
    fn kind(&self) -> &'static str;
    fn has_synced(&self) -> bool;
}

impl<K: WatchedResource> SyncStatus for Informer<K> {
    fn kind(&self) -> &'static str {
        Informer::kind(self)
    }

    fn has_synced(&self) -> bool {
        Informer::has_synced(self)
    }
}

struct CacheHandler<K> {
    informer: Arc<Informer<K>>,
    handler: Arc<ChainHandler>,
}

impl<K: WatchedResource> CacheHandler<K> {
    fn new(source: Arc<dyn ListWatch<K>>, resync_period: Option<Duration>) -> Self {
        Self {
            informer: Arc::new(Informer::new(source, resync_period)),
            handler: Arc::new(ChainHandler::default()),
        }
    }
}

pub struct Catalog {
    domain_suffix: String,
    queue: Arc<Queue>,
    services: CacheHandler<Service>,
    endpoints: CacheHandler<Endpoints>,
    deployments: CacheHandler<Deployment>,
    pods: CacheHandler<Pod>,
    pod_cache: PodCache,
    /// Instances last reported for each Endpoints object
    instances: Arc<DashMap<String, Vec<ServiceInstance>>>,
}

impl Catalog {
    pub fn new(
        sources: CatalogSources,
        options: CatalogOptions,
        metrics: Option<DiscoveryMetrics>,
    ) -> Self {
        info!(
            "Service catalog watching namespace {:?}",
            options.namespace.as_deref().unwrap_or("<all>")
        );

        let mut queue = Queue::new(options.queue.clone());
        if let Some(metrics) = metrics {
            queue = queue.with_metrics(metrics);
        }

        let services = CacheHandler::new(sources.services, options.resync_period);
        let endpoints = CacheHandler::new(sources.endpoints, options.resync_period);
        let deployments = CacheHandler::new(sources.deployments, options.resync_period);
        let pods = CacheHandler::new(sources.pods, options.resync_period);

        let gate = sync_gate(vec![
            Arc::clone(&services.informer) as Arc<dyn SyncStatus>,
            Arc::clone(&endpoints.informer) as Arc<dyn SyncStatus>,
            Arc::clone(&deployments.informer) as Arc<dyn SyncStatus>,
            Arc::clone(&pods.informer) as Arc<dyn SyncStatus>,
        ]);
        services.handler.append(Arc::clone(&gate));
        endpoints.handler.append(Arc::clone(&gate));
        deployments.handler.append(Arc::clone(&gate));
        pods.handler.append(gate);

        let pod_cache = PodCache::new(Arc::clone(&pods.informer));
        pods.handler.append(pod_cache.handler());

        Self {
            domain_suffix: options.domain_suffix,
            queue: Arc::new(queue),
            services,
            endpoints,
            deployments,
            pods,
            pod_cache,
            instances: Arc::new(DashMap::new()),
        }
    }

    /// Notify `f` about changes to the service catalog
    pub fn append_service_handler<F, Fut>(&self, f: F)
    where
        F: Fn(model::Service, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let domain_suffix = self.domain_suffix.clone();
        self.services.handler.append(handler_fn(move |obj, event| {
            let ClusterObject::Service(svc) = &obj else {
                return unexpected(&obj, "Service");
            };
            if is_system(&obj) {
                return done();
            }
            debug!("Handle service {} ({})", obj.key(), event);

            match convert_service(svc, &domain_suffix) {
                Some(converted) => deliver(vec![f(converted, event)]),
                None => done(),
            }
        }));
    }

    /// Notify `f` about changes to the deployment catalog. Deployments
    /// without a ready replica are not reported as added or updated.
    pub fn append_deployment_handler<F, Fut>(&self, f: F)
    where
        F: Fn(model::Deployment, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.deployments.handler.append(handler_fn(move |obj, event| {
            let ClusterObject::Deployment(dpl) = &obj else {
                return unexpected(&obj, "Deployment");
            };
            if is_system(&obj) {
                return done();
            }
            if event != Event::Delete && ready_replicas(dpl) == 0 {
                debug!("Deployment {} has no ready replicas, skipping", obj.key());
                return done();
            }
            debug!("Handle deployment {} ({})", obj.key(), event);

            match convert_deployment(dpl) {
                Some(converted) => deliver(vec![f(converted, event)]),
                None => done(),
            }
        }));
    }

    /// Notify `f` about changes to the instances behind services. Instances
    /// that vanish from an updated Endpoints object are reported as deleted.
    pub fn append_instance_handler<F, Fut>(&self, f: F)
    where
        F: Fn(ServiceInstance, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let domain_suffix = self.domain_suffix.clone();
        let services = Arc::clone(&self.services.informer);
        let reported = Arc::clone(&self.instances);

        self.endpoints.handler.append(handler_fn(move |obj, event| {
            let ClusterObject::Endpoints(ep) = &obj else {
                return unexpected(&obj, "Endpoints");
            };
            if is_system(&obj) {
                return done();
            }
            debug!("Handle endpoints {} ({})", obj.key(), event);

            let key = object_key(ep.as_ref());
            let current = || -> Vec<ServiceInstance> {
                match services
                    .get(&key)
                    .and_then(|svc| convert_service(&svc, &domain_suffix))
                {
                    Some(service) => convert_endpoints(ep, &service),
                    None => {
                        debug!("No service found for endpoints {}", key);
                        Vec::new()
                    }
                }
            };

            let changes: Vec<(ServiceInstance, Event)> = match event {
                Event::Delete => {
                    let gone = reported
                        .remove(&key)
                        .map(|(_, v)| v)
                        .unwrap_or_else(current);
                    gone.into_iter().map(|i| (i, Event::Delete)).collect()
                }
                Event::Add | Event::Update => {
                    let instances = current();
                    let previous = reported
                        .insert(key.clone(), instances.clone())
                        .unwrap_or_default();
                    let live: HashSet<String> = instances.iter().map(|i| i.key()).collect();

                    previous
                        .into_iter()
                        .filter(|i| !live.contains(&i.key()))
                        .map(|i| (i, Event::Delete))
                        .chain(instances.into_iter().map(|i| (i, event)))
                        .collect()
                }
            };

            deliver(changes.into_iter().map(|(i, e)| f(i, e)).collect())
        }));
    }

    /// Management ports of the pod at `addr`, from its health probes
    pub fn management_ports(&self, addr: &str) -> PortList {
        let Some(pod) = self.pod_cache.get_pod_by_ip(addr) else {
            return PortList::default();
        };
        let Some(spec) = pod.spec.as_ref() else {
            return PortList::default();
        };

        let (ports, errors) = convert_probes_to_ports(spec);
        // the partial list is still usable
        for e in errors {
            info!("Error while parsing probe ports for {}: {}", addr, e);
        }
        ports
    }

    /// True once every informer has completed its initial sync
    pub fn has_synced(&self) -> bool {
        self.services.informer.has_synced()
            && self.endpoints.informer.has_synced()
            && self.deployments.informer.has_synced()
            && self.pods.informer.has_synced()
    }

    pub fn pod_cache(&self) -> &PodCache {
        &self.pod_cache
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Run the queue and every informer until `stop` fires
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let mut tasks = JoinSet::new();

        tasks.spawn({
            let queue = Arc::clone(&self.queue);
            let stop = stop.clone();
            async move { queue.run(stop).await }
        });
        self.spawn_informer(&mut tasks, &self.services, ClusterObject::Service, &stop);
        self.spawn_informer(&mut tasks, &self.endpoints, ClusterObject::Endpoints, &stop);
        self.spawn_informer(&mut tasks, &self.deployments, ClusterObject::Deployment, &stop);
        self.spawn_informer(&mut tasks, &self.pods, ClusterObject::Pod, &stop);

        stop.cancelled().await;
        while tasks.join_next().await.is_some() {}

        info!("Catalog terminated");
    }

    fn spawn_informer<K: WatchedResource>(
        &self,
        tasks: &mut JoinSet<()>,
        cache: &CacheHandler<K>,
        wrap: fn(Arc<K>) -> ClusterObject,
        stop: &CancellationToken,
    ) {
        let informer = Arc::clone(&cache.informer);
        let handler = cache.handler.as_handler();
        let queue = Arc::clone(&self.queue);
        let stop = stop.clone();

        tasks.spawn(async move {
            informer
                .run(stop, move |obj, event| {
                    queue.push(Task::new(Arc::clone(&handler), wrap(obj), event))
                })
                .await
        });
    }
}

/// First handler of every chain: fails until all informers have synced
fn sync_gate(informers: Vec<Arc<dyn SyncStatus>>) -> HandlerFn {
    handler_fn(move |obj, event| {
        let result = match informers.iter().find(|i| !i.has_synced()) {
            Some(pending) => {
                debug!("{} informer not synced yet", pending.kind());
                Err(KubedoxError::NotSynced)
            }
            None => {
                debug!("Event {}: key {}", event, obj.key());
                Ok(())
            }
        };
        future::ready(result)
    })
}

fn is_system(obj: &ClusterObject) -> bool {
    obj.namespace().as_deref() == Some(NAMESPACE_SYSTEM)
}

type HandlerFuture = BoxFuture<'static, crate::Result<()>>;

fn done() -> HandlerFuture {
    future::ready(Ok(())).boxed()
}

fn unexpected(obj: &ClusterObject, expected: &str) -> HandlerFuture {
    warn!(
        "Expected {} object, got {} {}; skipping",
        expected,
        obj.kind(),
        obj.key()
    );
    done()
}

/// Await caller callbacks in order
fn deliver<Fut>(calls: Vec<Fut>) -> HandlerFuture
where
    Fut: Future<Output = ()> + Send + 'static,
{
    async move {
        for call in calls {
            call.await;
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::conversion::REVISION_ANNOTATION;
    use crate::k8s::MemoryListWatch;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::core::v1::{
        Container, EndpointAddress, EndpointPort, EndpointSubset, HTTPGetAction, PodSpec,
        PodStatus, Probe, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::ObjectMeta;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Fixture {
        services: Arc<MemoryListWatch<Service>>,
        endpoints: Arc<MemoryListWatch<Endpoints>>,
        deployments: Arc<MemoryListWatch<Deployment>>,
        pods: Arc<MemoryListWatch<Pod>>,
        catalog: Arc<Catalog>,
    }

    fn fixture(pods: MemoryListWatch<Pod>) -> Fixture {
        let services = Arc::new(MemoryListWatch::new());
        let endpoints = Arc::new(MemoryListWatch::new());
        let deployments = Arc::new(MemoryListWatch::new());
        let pods = Arc::new(pods);
        let catalog = Arc::new(Catalog::new(
            CatalogSources {
                services: Arc::clone(&services) as Arc<dyn ListWatch<Service>>,
                endpoints: Arc::clone(&endpoints) as Arc<dyn ListWatch<Endpoints>>,
                deployments: Arc::clone(&deployments) as Arc<dyn ListWatch<Deployment>>,
                pods: Arc::clone(&pods) as Arc<dyn ListWatch<Pod>>,
            },
            CatalogOptions {
                namespace: None,
                resync_period: None,
                domain_suffix: "cluster.local".to_string(),
                queue: QueueOptions {
                    error_delay: Duration::from_millis(10),
                    qps: 1000.0,
                    burst: 100,
                    max_retries: None,
                },
            },
            None,
        ));

        Fixture {
            services,
            endpoints,
            deployments,
            pods,
            catalog,
        }
    }

    fn meta(name: &str, namespace: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    fn service(name: &str, namespace: &str) -> Service {
        Service {
            metadata: meta(name, namespace),
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.10".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn endpoints(name: &str, ips: &[&str]) -> Endpoints {
        Endpoints {
            metadata: meta(name, "shop"),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    ips.iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    fn deployment(name: &str, revision: &str, ready: i32) -> Deployment {
        let mut metadata = meta(name, "shop");
        metadata.annotations = Some(
            [(REVISION_ANNOTATION.to_string(), revision.to_string())]
                .into_iter()
                .collect(),
        );
        Deployment {
            metadata,
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn probed_pod(ip: Option<&str>) -> Pod {
        Pod {
            metadata: meta("web-0", "shop"),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "web".to_string(),
                    readiness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            port: IntOrString::Int(8081),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_handlers_wait_for_full_sync() {
        let fx = fixture(MemoryListWatch::unsynced(Vec::new()));
        let seen: Arc<Mutex<Vec<(String, Event)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            fx.catalog.append_service_handler(move |svc, event| {
                seen.lock().push((svc.hostname, event));
                async {}
            });
        }
        fx.services.apply(service("catalog", "shop"));

        let stop = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&fx.catalog).run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fx.catalog.has_synced());
        assert!(seen.lock().is_empty());

        fx.pods.mark_ready();
        assert!(eventually(|| !seen.lock().is_empty()).await);
        assert_eq!(
            *seen.lock(),
            vec![("catalog.shop.svc.cluster.local".to_string(), Event::Add)]
        );

        stop.cancel();
        runner.await.expect("catalog task");
    }

    #[tokio::test]
    async fn test_system_namespace_is_skipped() {
        let fx = fixture(MemoryListWatch::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            fx.catalog.append_service_handler(move |svc, _| {
                seen.lock().push(svc.hostname);
                async {}
            });
        }

        let stop = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&fx.catalog).run(stop.clone()));

        fx.services.apply(service("kube-dns", NAMESPACE_SYSTEM));
        fx.services.apply(service("catalog", "shop"));

        assert!(eventually(|| !seen.lock().is_empty()).await);
        assert_eq!(*seen.lock(), vec!["catalog.shop.svc.cluster.local".to_string()]);

        stop.cancel();
        runner.await.expect("catalog task");
    }

    #[tokio::test]
    async fn test_management_ports_follow_pod_address() {
        let fx = fixture(MemoryListWatch::new());
        let stop = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&fx.catalog).run(stop.clone()));

        fx.pods.apply(probed_pod(None));
        assert!(eventually(|| fx.catalog.has_synced()).await);
        assert!(fx.catalog.management_ports("10.1.0.5").is_empty());

        fx.pods.apply(probed_pod(Some("10.1.0.5")));
        assert!(eventually(|| !fx.catalog.management_ports("10.1.0.5").is_empty()).await);
        let ports: Vec<u16> = fx
            .catalog
            .management_ports("10.1.0.5")
            .iter()
            .map(|p| p.port)
            .collect();
        assert_eq!(ports, vec![8081]);

        fx.pods.delete(&probed_pod(Some("10.1.0.5")));
        assert!(eventually(|| fx.catalog.management_ports("10.1.0.5").is_empty()).await);
        assert!(fx.catalog.pod_cache().is_empty());

        stop.cancel();
        runner.await.expect("catalog task");
    }

    #[tokio::test]
    async fn test_instance_handler_reports_vanished_instances() {
        let fx = fixture(MemoryListWatch::new());
        let seen: Arc<Mutex<Vec<(String, Event)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            fx.catalog.append_instance_handler(move |instance, event| {
                seen.lock().push((instance.endpoint.address, event));
                async {}
            });
        }
        fx.services.apply(service("catalog", "shop"));

        let stop = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&fx.catalog).run(stop.clone()));
        assert!(eventually(|| fx.catalog.has_synced()).await);

        fx.endpoints.apply(endpoints("catalog", &["172.16.0.1", "172.16.0.2"]));
        assert!(eventually(|| seen.lock().len() == 2).await);

        fx.endpoints.apply(endpoints("catalog", &["172.16.0.2"]));
        assert!(eventually(|| seen.lock().len() == 4).await);

        assert_eq!(
            *seen.lock(),
            vec![
                ("172.16.0.1".to_string(), Event::Add),
                ("172.16.0.2".to_string(), Event::Add),
                ("172.16.0.1".to_string(), Event::Delete),
                ("172.16.0.2".to_string(), Event::Update),
            ]
        );

        stop.cancel();
        runner.await.expect("catalog task");
    }

    #[tokio::test]
    async fn test_deployment_handler_waits_for_ready_replicas() {
        let fx = fixture(MemoryListWatch::new());
        let seen: Arc<Mutex<Vec<(String, Event)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            fx.catalog.append_deployment_handler(move |dpl, event| {
                seen.lock().push((dpl.key(), event));
                async {}
            });
        }

        let stop = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&fx.catalog).run(stop.clone()));
        assert!(eventually(|| fx.catalog.has_synced()).await);

        // tasks run in order, so "other" arriving means "abc" was handled
        fx.deployments.apply(deployment("abc", "3", 0));
        fx.deployments.apply(deployment("other", "1", 1));
        assert!(eventually(|| !seen.lock().is_empty()).await);
        assert_eq!(*seen.lock(), vec![("other:1".to_string(), Event::Add)]);

        fx.deployments.apply(deployment("abc", "3", 1));
        assert!(eventually(|| seen.lock().len() == 2).await);

        fx.deployments.delete(&deployment("abc", "3", 1));
        assert!(eventually(|| seen.lock().len() == 3).await);

        // the skipped add leaves the first delivery as an update
        assert_eq!(
            *seen.lock(),
            vec![
                ("other:1".to_string(), Event::Add),
                ("abc:3".to_string(), Event::Update),
                ("abc:3".to_string(), Event::Delete),
            ]
        );

        stop.cancel();
        runner.await.expect("catalog task");
    }

    #[tokio::test]
    async fn test_deployment_delete_ignores_readiness() {
        let fx = fixture(MemoryListWatch::new());
        let seen: Arc<Mutex<Vec<(String, Event)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            fx.catalog.append_deployment_handler(move |dpl, event| {
                seen.lock().push((dpl.key(), event));
                async {}
            });
        }

        let stop = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&fx.catalog).run(stop.clone()));
        assert!(eventually(|| fx.catalog.has_synced()).await);

        fx.deployments.apply(deployment("abc", "3", 0));
        fx.deployments.delete(&deployment("abc", "3", 0));
        assert!(eventually(|| !seen.lock().is_empty()).await);

        assert_eq!(*seen.lock(), vec![("abc:3".to_string(), Event::Delete)]);

        stop.cancel();
        runner.await.expect("catalog task");
    }
}
