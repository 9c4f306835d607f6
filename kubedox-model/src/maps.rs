//! Keyed, de-duplicating registries with set semantics
//!
//! `insert` only writes an entry that is absent or structurally different from
//! the stored value and reports whether anything changed. `delete` ignores
//! absent keys. `list` returns a snapshot in a deterministic order so that
//! consumers produce stable output regardless of insertion order.

use crate::{Deployment, Port, Service, ServiceInstance};
use std::collections::HashMap;

/// Set of services keyed by hostname
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceMap {
    items: HashMap<String, Service>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service; returns true if the registry changed
    pub fn insert(&mut self, item: Service) -> bool {
        upsert(&mut self.items, item.hostname.clone(), item)
    }

    /// Remove a service by hostname; returns true if it was present
    pub fn delete(&mut self, item: &Service) -> bool {
        self.items.remove(&item.hostname).is_some()
    }

    pub fn has(&self, item: &Service) -> bool {
        self.items.contains_key(&item.hostname)
    }

    pub fn get(&self, hostname: &str) -> Option<&Service> {
        self.items.get(hostname)
    }

    /// Snapshot sorted by hostname
    pub fn list(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.items.values().cloned().collect();
        services.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        services
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Set of deployments keyed by `name:version`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentMap {
    items: HashMap<String, Deployment>,
}

impl DeploymentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: Deployment) -> bool {
        upsert(&mut self.items, item.key(), item)
    }

    pub fn delete(&mut self, item: &Deployment) -> bool {
        self.items.remove(&item.key()).is_some()
    }

    pub fn has(&self, item: &Deployment) -> bool {
        self.items.contains_key(&item.key())
    }

    /// Snapshot sorted by name, then version
    pub fn list(&self) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> = self.items.values().cloned().collect();
        deployments.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        deployments
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Set of service instances keyed by [`ServiceInstance::key`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceMap {
    items: HashMap<String, ServiceInstance>,
}

impl InstanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: ServiceInstance) -> bool {
        upsert(&mut self.items, item.key(), item)
    }

    pub fn delete(&mut self, item: &ServiceInstance) -> bool {
        self.items.remove(&item.key()).is_some()
    }

    pub fn has(&self, item: &ServiceInstance) -> bool {
        self.items.contains_key(&item.key())
    }

    /// Snapshot sorted by service hostname, then endpoint port
    pub fn list(&self) -> Vec<ServiceInstance> {
        sorted_instances(self.items.iter())
    }

    /// Instances of `service` whose service port number matches `port`
    pub fn list_by_service(&self, service: &Service, port: &Port) -> Vec<ServiceInstance> {
        sorted_instances(self.items.iter().filter(|(_, v)| {
            v.service.hostname == service.hostname && v.endpoint.service_port.port == port.port
        }))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn upsert<T: PartialEq>(items: &mut HashMap<String, T>, key: String, item: T) -> bool {
    match items.get(&key) {
        Some(existing) if *existing == item => false,
        _ => {
            items.insert(key, item);
            true
        }
    }
}

fn sorted_instances<'a>(
    entries: impl Iterator<Item = (&'a String, &'a ServiceInstance)>,
) -> Vec<ServiceInstance> {
    let mut entries: Vec<(&String, &ServiceInstance)> = entries.collect();
    // key as the final tie-breaker keeps the order total
    entries.sort_by(|(ka, a), (kb, b)| {
        (&a.service.hostname, a.endpoint.port, *ka).cmp(&(&b.service.hostname, b.endpoint.port, *kb))
    });
    entries.into_iter().map(|(_, v)| v.clone()).collect()
}
