//! Domain model shared by the kubedox discovery engine
//!
//! These types are independent of the orchestrator API: the conversion layer in
//! the `kubedox` crate maps raw cluster objects onto them, and the registries in
//! [`maps`] keep de-duplicated, deterministically ordered collections of them.

pub mod deployment;
pub mod event;
pub mod maps;
pub mod service;

pub use deployment::Deployment;
pub use event::Event;
pub use maps::{DeploymentMap, InstanceMap, ServiceMap};
pub use service::{NetworkEndpoint, Port, PortList, Protocol, Service, ServiceInstance};
