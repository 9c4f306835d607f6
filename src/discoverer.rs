//! Discoverer: registries of the cluster catalog and the API documents
//! derived from them
//!
//! Every catalog notification mutates one registry and then recomputes the
//! discovered documents from scratch. Recomputations are serialized; each one
//! snapshots the registries, releases every lock, probes the candidate
//! locations and finally swaps the new result in.

use crate::config::DiscoveryConfig;
use crate::k8s::{Catalog, CatalogOptions, CatalogSources, K8sClient};
use crate::metrics::DiscoveryMetrics;
use crate::probe::{DocumentProcessor, HttpProbe, PassthroughProcessor, ProbedDocument, SpecProbe};
use crate::Result;
use bytes::Bytes;
use kubedox_model::{
    Deployment, DeploymentMap, Event, InstanceMap, Port, Service, ServiceInstance, ServiceMap,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Registries {
    services: ServiceMap,
    deployments: DeploymentMap,
    instances: InstanceMap,
}

#[derive(Debug, Clone, Default)]
struct Discovered {
    specs: BTreeMap<String, Bytes>,
    apis: Vec<String>,
}

/// A service port and the locations to probe for it, best first
struct Candidate {
    hostname: String,
    locations: Vec<String>,
}

struct Inner {
    config: DiscoveryConfig,
    catalog: Arc<Catalog>,
    probe: Arc<dyn SpecProbe>,
    processor: Arc<dyn DocumentProcessor>,
    metrics: DiscoveryMetrics,
    registries: RwLock<Registries>,
    discovered: RwLock<Discovered>,
    recompute_lock: tokio::sync::Mutex<()>,
    stop: CancellationToken,
    started: AtomicBool,
    shut_down: AtomicBool,
    catalog_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Discoverer {
    inner: Arc<Inner>,
}

impl Discoverer {
    /// Discoverer watching the cluster reachable from the ambient kube config
    pub async fn new(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let client = K8sClient::try_default().await?;
        let sources = client.catalog_sources(config.namespace.as_deref());
        Self::from_sources(sources, config)
    }

    /// Discoverer over custom list/watch sources, probing over HTTP
    pub fn from_sources(sources: CatalogSources, config: DiscoveryConfig) -> Result<Self> {
        let metrics = DiscoveryMetrics::new()?;
        let probe = HttpProbe::new(config.probe_timeout(), &config.spec_path)?;
        let processor = PassthroughProcessor::new(&config.spec_dir);
        let catalog = Catalog::new(
            sources,
            CatalogOptions::from(&config),
            Some(metrics.clone()),
        );

        Ok(Self::with_catalog(
            catalog,
            config,
            Arc::new(probe),
            Arc::new(processor),
            metrics,
        ))
    }

    pub fn with_catalog(
        catalog: Catalog,
        config: DiscoveryConfig,
        probe: Arc<dyn SpecProbe>,
        processor: Arc<dyn DocumentProcessor>,
        metrics: DiscoveryMetrics,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            catalog: Arc::new(catalog),
            probe,
            processor,
            metrics,
            registries: RwLock::new(Registries::default()),
            discovered: RwLock::new(Discovered::default()),
            recompute_lock: tokio::sync::Mutex::new(()),
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            catalog_task: Mutex::new(None),
        });

        // handlers hold a weak reference so the catalog does not keep the
        // discoverer alive
        let weak = Arc::downgrade(&inner);
        inner.catalog.append_service_handler(move |service, event| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.update_services(service, event).await;
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.catalog.append_deployment_handler(move |deployment, event| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.update_deployments(deployment, event).await;
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.catalog.append_instance_handler(move |instance, event| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.update_instances(instance, event).await;
                }
            }
        });

        Self { inner }
    }

    /// Compute the discovered documents once, then start watching the
    /// cluster in the background
    pub async fn run(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Discoverer already running");
            return;
        }

        self.inner.recompute().await;

        let catalog = Arc::clone(&self.inner.catalog);
        let handle = tokio::spawn(catalog.run(self.inner.stop.clone()));
        *self.inner.catalog_task.lock() = Some(handle);

        info!("Discovery started");
    }

    /// Stop all background activity and wait for it to finish. Only the
    /// first call has any effect.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            warn!("Discoverer already shut down");
            return;
        }

        info!("Shutting down discovery");
        self.inner.stop.cancel();

        let handle = self.inner.catalog_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Catalog task failed: {}", e);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Discovered documents keyed by path; empty until the first recomputation
    pub fn specs(&self) -> BTreeMap<String, Bytes> {
        self.inner.discovered.read().specs.clone()
    }

    /// URLs of the discovered API documents
    pub fn api_list(&self) -> Vec<String> {
        self.inner.discovered.read().apis.clone()
    }

    pub fn services(&self) -> Vec<Service> {
        self.inner.registries.read().services.list()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.inner.registries.read().deployments.list()
    }

    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.inner.registries.read().instances.list()
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.inner.metrics
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }
}

impl Inner {
    async fn update_services(&self, service: Service, event: Event) {
        info!("Service {} event: {}", service.hostname, event);

        {
            let mut registries = self.registries.write();
            match event {
                Event::Add | Event::Update if self.config.is_ignored(&service.hostname) => {
                    debug!("Ignoring service {}", service.hostname);
                }
                Event::Add | Event::Update => {
                    registries.services.insert(service);
                }
                Event::Delete => {
                    registries.services.delete(&service);
                }
            }
        }

        self.recompute().await;
    }

    async fn update_deployments(&self, deployment: Deployment, event: Event) {
        info!("Deployment {} event: {}", deployment.key(), event);

        {
            let mut registries = self.registries.write();
            match event {
                Event::Add | Event::Update => {
                    registries.deployments.insert(deployment);
                }
                Event::Delete => {
                    registries.deployments.delete(&deployment);
                }
            }
        }

        self.recompute().await;
    }

    async fn update_instances(&self, instance: ServiceInstance, event: Event) {
        info!("Instance {} event: {}", instance.key(), event);

        {
            let mut registries = self.registries.write();
            match event {
                Event::Add | Event::Update => {
                    registries.instances.insert(instance);
                }
                Event::Delete => {
                    registries.instances.delete(&instance);
                }
            }
        }

        self.recompute().await;
    }

    /// Rebuild the discovered documents and replace the previous result.
    /// Abandoned, keeping the previous result, once discovery is stopping.
    async fn recompute(&self) {
        let _serial = self.recompute_lock.lock().await;

        let candidates = self.candidates();
        let discovered = tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                debug!("Discovery stopping, abandoning recompute");
                return;
            }
            discovered = self.probe_candidates(candidates) => discovered,
        };

        info!("Discovered {} APIs", discovered.apis.len());
        self.metrics.recomputations.inc();
        self.metrics
            .apis_discovered
            .set(discovered.apis.len() as i64);

        *self.discovered.write() = discovered;
    }

    async fn probe_candidates(&self, candidates: Vec<Candidate>) -> Discovered {
        let mut discovered = Discovered::default();

        for candidate in candidates {
            let Some(document) = self.service_api(&candidate).await else {
                continue;
            };

            discovered.apis.push(document.url.clone());
            match self.processor.process(&candidate.hostname, &document) {
                Ok((path, body)) => {
                    discovered.specs.insert(path, body);
                }
                Err(e) => error!("Unable to process spec from {}: {}", document.url, e),
            }
        }

        discovered
    }

    /// Snapshot of every HTTP service port worth probing
    fn candidates(&self) -> Vec<Candidate> {
        let registries = self.registries.read();
        let mut candidates = Vec::new();

        for service in registries.services.list() {
            if service.hostname.is_empty() || self.config.is_ignored(&service.hostname) {
                continue;
            }

            for port in service.ports.iter().filter(|p| p.protocol.is_http()) {
                debug!("Candidate {}:{}", service.hostname, port.port);
                candidates.push(Candidate {
                    hostname: service.hostname.clone(),
                    locations: self.locations(&registries.instances, &service, port),
                });
            }
        }

        candidates
    }

    /// Management ports of the instances behind a service port, then the
    /// service's own `hostname:port`
    fn locations(&self, instances: &InstanceMap, service: &Service, port: &Port) -> Vec<String> {
        let mut locations: Vec<String> = instances
            .list_by_service(service, port)
            .iter()
            .flat_map(|instance| {
                let address = instance.endpoint.address.clone();
                self.catalog
                    .management_ports(&address)
                    .iter()
                    .filter(|p| p.protocol.is_http())
                    .map(|p| format!("{}:{}", address, p.port))
                    .collect::<Vec<_>>()
            })
            .collect();

        locations.push(format!("{}:{}", service.hostname, port.port));
        locations
    }

    /// First location answering the probe
    async fn service_api(&self, candidate: &Candidate) -> Option<ProbedDocument> {
        for location in &candidate.locations {
            if let Some(document) = self.probe.probe(location).await {
                return Some(document);
            }
            self.metrics.probe_failures.inc();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{ListWatch, MemoryListWatch};
    use crate::queue::QueueOptions;
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
        HTTPGetAction, Pod, PodSpec, PodStatus, Probe, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::ObjectMeta;
    use kubedox_model::{NetworkEndpoint, PortList, Protocol};
    use std::collections::HashSet;
    use std::time::Duration;

    struct FakeProbe {
        answering: HashSet<String>,
        stall: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn answering(locations: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                answering: locations.iter().map(|l| l.to_string()).collect(),
                stall: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        /// Never answers
        fn stalling() -> Arc<Self> {
            Arc::new(Self {
                answering: HashSet::new(),
                stall: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SpecProbe for FakeProbe {
        async fn probe(&self, location: &str) -> Option<ProbedDocument> {
            self.calls.lock().push(location.to_string());
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.answering.contains(location).then(|| ProbedDocument {
                url: format!("http://{}/swagger.json", location),
                body: Bytes::from_static(b"{}"),
            })
        }
    }

    struct Sources {
        services: Arc<MemoryListWatch<k8s_openapi::api::core::v1::Service>>,
        endpoints: Arc<MemoryListWatch<Endpoints>>,
        pods: Arc<MemoryListWatch<Pod>>,
    }

    fn discoverer(probe: Arc<FakeProbe>, config: DiscoveryConfig) -> (Discoverer, Sources) {
        let sources = Sources {
            services: Arc::new(MemoryListWatch::new()),
            endpoints: Arc::new(MemoryListWatch::new()),
            pods: Arc::new(MemoryListWatch::new()),
        };
        let catalog = Catalog::new(
            CatalogSources {
                services: Arc::clone(&sources.services)
                    as Arc<dyn ListWatch<k8s_openapi::api::core::v1::Service>>,
                endpoints: Arc::clone(&sources.endpoints) as Arc<dyn ListWatch<Endpoints>>,
                deployments: Arc::new(MemoryListWatch::<v1::Deployment>::new()),
                pods: Arc::clone(&sources.pods) as Arc<dyn ListWatch<Pod>>,
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
        );

        let discoverer = Discoverer::with_catalog(
            catalog,
            config,
            probe,
            Arc::new(PassthroughProcessor::new("/specs")),
            DiscoveryMetrics::new().expect("metrics"),
        );
        (discoverer, sources)
    }

    fn http_service(hostname: &str, port: u16) -> Service {
        Service {
            hostname: hostname.to_string(),
            address: Some("10.0.0.10".to_string()),
            ports: PortList::from(vec![Port {
                name: Some("http".to_string()),
                port,
                protocol: Protocol::Http,
            }]),
            external_name: None,
            load_balancing_disabled: false,
        }
    }

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("shop".to_string()),
            ..Default::default()
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
    async fn test_falls_back_to_service_location() {
        let probe = FakeProbe::answering(&["svc.ns:8080"]);
        let (d, _) = discoverer(Arc::clone(&probe), DiscoveryConfig::default());

        d.inner.update_services(http_service("svc.ns", 8080), Event::Add).await;

        assert_eq!(probe.calls(), vec!["svc.ns:8080".to_string()]);
        assert_eq!(d.api_list(), vec!["http://svc.ns:8080/swagger.json".to_string()]);
        assert_eq!(
            d.specs().keys().cloned().collect::<Vec<_>>(),
            vec!["/specs/svc.ns".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_probe_is_excluded() {
        let probe = FakeProbe::answering(&[]);
        let (d, _) = discoverer(Arc::clone(&probe), DiscoveryConfig::default());

        d.inner.update_services(http_service("svc.ns", 8080), Event::Add).await;

        assert_eq!(probe.calls().len(), 1);
        assert!(d.api_list().is_empty());
        assert!(d.specs().is_empty());
        assert_eq!(d.metrics().probe_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_ignored_service_never_listed() {
        let probe = FakeProbe::answering(&["apigw.shop:80"]);
        let config = DiscoveryConfig {
            ignored_services: vec!["apigw".to_string()],
            ..Default::default()
        };
        let (d, _) = discoverer(Arc::clone(&probe), config);

        for _ in 0..3 {
            d.inner.update_services(http_service("apigw.shop", 80), Event::Add).await;
        }

        assert!(d.api_list().is_empty());
        assert!(d.services().is_empty());
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_replaces_result() {
        let probe = FakeProbe::answering(&["svc.ns:8080"]);
        let (d, _) = discoverer(probe, DiscoveryConfig::default());

        d.inner.update_services(http_service("svc.ns", 8080), Event::Add).await;
        assert_eq!(d.api_list().len(), 1);

        d.inner.update_services(http_service("svc.ns", 8080), Event::Delete).await;
        assert!(d.api_list().is_empty());
        assert!(d.specs().is_empty());
    }

    #[tokio::test]
    async fn test_non_http_ports_are_not_probed() {
        let probe = FakeProbe::answering(&[]);
        let (d, _) = discoverer(Arc::clone(&probe), DiscoveryConfig::default());

        let mut service = http_service("db.shop", 5432);
        service.ports = PortList::from(vec![Port {
            name: Some("postgres".to_string()),
            port: 5432,
            protocol: Protocol::Tcp,
        }]);
        d.inner.update_services(service, Event::Add).await;

        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_instance_without_management_ports_uses_service() {
        let probe = FakeProbe::answering(&["svc.ns:8080"]);
        let (d, _) = discoverer(Arc::clone(&probe), DiscoveryConfig::default());
        let service = http_service("svc.ns", 8080);

        d.inner.update_services(service.clone(), Event::Add).await;
        d.inner
            .update_instances(
                ServiceInstance {
                    endpoint: NetworkEndpoint {
                        address: "172.16.0.1".to_string(),
                        port: 9090,
                        service_port: service.ports.iter().next().cloned().expect("port"),
                    },
                    service,
                },
                Event::Add,
            )
            .await;

        assert_eq!(d.instances().len(), 1);
        assert_eq!(d.api_list(), vec!["http://svc.ns:8080/swagger.json".to_string()]);
    }

    #[tokio::test]
    async fn test_management_port_takes_precedence() {
        let probe = FakeProbe::answering(&["172.16.0.1:8081", "catalog.shop.svc.cluster.local:80"]);
        let (d, sources) = discoverer(Arc::clone(&probe), DiscoveryConfig::default());
        d.run().await;

        sources.pods.apply(Pod {
            metadata: meta("catalog-0"),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "catalog".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some("admin".to_string()),
                        container_port: 8081,
                        ..Default::default()
                    }]),
                    liveness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            port: IntOrString::String("admin".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("172.16.0.1".to_string()),
                ..Default::default()
            }),
        });
        assert!(eventually(|| !d.catalog().management_ports("172.16.0.1").is_empty()).await);

        sources.services.apply(k8s_openapi::api::core::v1::Service {
            metadata: meta("catalog"),
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
        });
        sources.endpoints.apply(Endpoints {
            metadata: meta("catalog"),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "172.16.0.1".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        });

        assert!(
            eventually(|| d.api_list() == vec!["http://172.16.0.1:8081/swagger.json".to_string()])
                .await
        );
        assert_eq!(
            d.specs().keys().cloned().collect::<Vec<_>>(),
            vec!["/specs/catalog.shop.svc.cluster.local".to_string()]
        );

        d.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let (d, _) = discoverer(FakeProbe::answering(&[]), DiscoveryConfig::default());
        d.run().await;

        d.shutdown().await;
        d.shutdown().await;

        assert!(d.is_shut_down());
        assert!(d.catalog().queue().is_closing());
    }

    fn deployment(name: &str, version: &str) -> Deployment {
        Deployment {
            name: name.to_string(),
            namespace: "shop".to_string(),
            creation_timestamp: None,
            version: version.to_string(),
        }
    }

    #[tokio::test]
    async fn test_deployments_follow_events() {
        let (d, _) = discoverer(FakeProbe::answering(&[]), DiscoveryConfig::default());

        d.inner.update_deployments(deployment("abc-svc", "3"), Event::Add).await;
        d.inner.update_deployments(deployment("abc-svc", "3"), Event::Update).await;
        assert_eq!(d.deployments(), vec![deployment("abc-svc", "3")]);

        d.inner.update_deployments(deployment("abc-svc", "4"), Event::Add).await;
        assert_eq!(
            d.deployments(),
            vec![deployment("abc-svc", "3"), deployment("abc-svc", "4")]
        );

        d.inner.update_deployments(deployment("abc-svc", "3"), Event::Delete).await;
        assert_eq!(d.deployments(), vec![deployment("abc-svc", "4")]);
        assert_eq!(d.metrics().recomputations.get(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_recompute() {
        let probe = FakeProbe::stalling();
        let (d, sources) = discoverer(Arc::clone(&probe), DiscoveryConfig::default());
        d.run().await;

        sources.services.apply(k8s_openapi::api::core::v1::Service {
            metadata: meta("catalog"),
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
        });
        assert!(eventually(|| !probe.calls().is_empty()).await);

        tokio::time::timeout(Duration::from_secs(2), d.shutdown())
            .await
            .expect("shutdown returns while a probe is stalled");
        assert!(d.api_list().is_empty());
        assert!(d.catalog().queue().is_closing());
    }
}
