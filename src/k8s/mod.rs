pub mod catalog;
pub mod client;
pub mod conversion;
pub mod memory;
pub mod pod_cache;
pub mod types;
pub mod watcher;

pub use catalog::{Catalog, CatalogOptions, CatalogSources};
pub use client::K8sClient;
pub use memory::MemoryListWatch;
pub use pod_cache::PodCache;
pub use types::{key_for, object_key, ClusterObject, NAMESPACE_SYSTEM};
pub use watcher::{Informer, KubeListWatch, ListWatch, WatchEvent, WatchedResource};
