//! Mapping of Kubernetes objects onto the discovery domain model
//!
//! Every function here is pure. A conversion that cannot produce a meaningful
//! value returns `None` and the caller drops the object.

use crate::KubedoxError;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Endpoints, PodSpec, Probe, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kubedox_model as model;
use kubedox_model::{NetworkEndpoint, Port, PortList, Protocol, ServiceInstance};
use std::collections::BTreeMap;
use tracing::warn;

/// Annotation carrying the rollout revision of a deployment
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

const CLUSTER_IP_NONE: &str = "None";
const SERVICE_TYPE_EXTERNAL_NAME: &str = "ExternalName";

/// FQDN of a service, e.g. `catalog.shop.svc.cluster.local`
pub fn service_hostname(name: &str, namespace: &str, domain_suffix: &str) -> String {
    format!("{}.{}.svc.{}", name, namespace, domain_suffix)
}

/// Infer the protocol of a port. For TCP ports the text of the port name up
/// to the first `-` selects the protocol (`http-api` is HTTP); unknown
/// prefixes fall back to TCP.
pub fn convert_protocol(name: Option<&str>, protocol: Option<&str>) -> Protocol {
    match protocol.unwrap_or("TCP") {
        "TCP" => {
            let prefix = name
                .map(|n| n.split('-').next().unwrap_or(n))
                .unwrap_or_default();
            match Protocol::parse(prefix) {
                Protocol::Unsupported => Protocol::Tcp,
                protocol => protocol,
            }
        }
        "UDP" => Protocol::Udp,
        _ => Protocol::Tcp,
    }
}

fn port_number(value: i32) -> Option<u16> {
    u16::try_from(value).ok().filter(|p| *p != 0)
}

fn port_name(name: Option<&String>) -> Option<String> {
    name.filter(|n| !n.is_empty()).cloned()
}

pub fn convert_port(port: &ServicePort) -> Option<Port> {
    let number = port_number(port.port)?;
    let name = port_name(port.name.as_ref());
    Some(Port {
        protocol: convert_protocol(name.as_deref(), port.protocol.as_deref()),
        name,
        port: number,
    })
}

pub fn convert_service(svc: &Service, domain_suffix: &str) -> Option<model::Service> {
    let Some(name) = svc.metadata.name.as_deref() else {
        warn!("Skipping service without a name");
        return None;
    };
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let Some(spec) = svc.spec.as_ref() else {
        warn!("Skipping service {}/{} without a spec", namespace, name);
        return None;
    };

    let address = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != CLUSTER_IP_NONE)
        .map(str::to_string);

    let external_name = match spec.type_.as_deref() {
        Some(SERVICE_TYPE_EXTERNAL_NAME) => spec
            .external_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        _ => None,
    };

    let mut ports = Vec::new();
    for port in spec.ports.iter().flatten() {
        match convert_port(port) {
            Some(p) => ports.push(p),
            None => warn!(
                "Skipping invalid port {} on service {}/{}",
                port.port, namespace, name
            ),
        }
    }

    // headless services are not load balanced
    let load_balancing_disabled = address.is_none() && external_name.is_none();

    Some(model::Service {
        hostname: service_hostname(name, &namespace, domain_suffix),
        address,
        ports: PortList::from(ports),
        external_name,
        load_balancing_disabled,
    })
}

pub fn convert_deployment(dpl: &Deployment) -> Option<model::Deployment> {
    let Some(name) = dpl.metadata.name.clone() else {
        warn!("Skipping deployment without a name");
        return None;
    };

    Some(model::Deployment {
        name,
        namespace: dpl.namespace().unwrap_or_else(|| "default".to_string()),
        creation_timestamp: dpl.metadata.creation_timestamp.as_ref().map(|t| t.0),
        version: dpl
            .annotations()
            .get(REVISION_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
    })
}

pub fn ready_replicas(dpl: &Deployment) -> i32 {
    dpl.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Instances of `service` described by its Endpoints object. Endpoint ports
/// are matched to service ports by name; unmatched ports are skipped.
pub fn convert_endpoints(ep: &Endpoints, service: &model::Service) -> Vec<ServiceInstance> {
    let mut out = Vec::new();

    for subset in ep.subsets.iter().flatten() {
        for address in subset.addresses.iter().flatten() {
            for port in subset.ports.iter().flatten() {
                let Some(number) = port_number(port.port) else {
                    continue;
                };
                let name = port_name(port.name.as_ref());
                let Some(service_port) = service.ports.get(name.as_deref()) else {
                    continue;
                };

                out.push(ServiceInstance {
                    endpoint: NetworkEndpoint {
                        address: address.ip.clone(),
                        port: number,
                        service_port: service_port.clone(),
                    },
                    service: service.clone(),
                });
            }
        }
    }

    out
}

/// Management ports of a pod, derived from its liveness and readiness probes.
/// Named probe ports are resolved against the container's declared ports;
/// names that cannot be resolved are reported alongside the ports that could.
pub fn convert_probes_to_ports(spec: &PodSpec) -> (PortList, Vec<KubedoxError>) {
    let mut ports: BTreeMap<u16, Port> = BTreeMap::new();
    let mut errors = Vec::new();

    for container in &spec.containers {
        let probes = [
            container.liveness_probe.as_ref(),
            container.readiness_probe.as_ref(),
        ];
        for probe in probes.into_iter().flatten() {
            match convert_probe_port(container, probe) {
                Ok(Some(port)) => {
                    ports.entry(port.port).or_insert(port);
                }
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
    }

    (PortList::from(ports.into_values().collect::<Vec<_>>()), errors)
}

fn convert_probe_port(container: &Container, probe: &Probe) -> Result<Option<Port>, KubedoxError> {
    let (target, protocol) = if let Some(action) = &probe.http_get {
        (&action.port, Protocol::Http)
    } else if let Some(action) = &probe.tcp_socket {
        (&action.port, Protocol::Tcp)
    } else {
        return Ok(None);
    };

    let number = match target {
        IntOrString::Int(value) => port_number(*value),
        IntOrString::String(name) => container
            .ports
            .iter()
            .flatten()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(|p| port_number(p.container_port)),
    };

    match number {
        Some(port) => Ok(Some(Port {
            name: None,
            port,
            protocol,
        })),
        None => Err(KubedoxError::MalformedObject {
            kind: "Pod",
            reason: format!(
                "probe port {:?} of container {} does not resolve to a port",
                target, container.name
            ),
        }),
    }
}
