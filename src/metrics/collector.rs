use crate::Result;
use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Counters describing the discovery pipeline
#[derive(Clone)]
pub struct DiscoveryMetrics {
    registry: Registry,
    pub tasks_processed: IntCounter,
    pub task_retries: IntCounter,
    pub tasks_dropped: IntCounter,
    pub recomputations: IntCounter,
    pub probe_failures: IntCounter,
    pub apis_discovered: IntGauge,
}

impl DiscoveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("kubedox".to_string()), None)?;

        let tasks_processed = IntCounter::with_opts(Opts::new(
            "queue_tasks_processed_total",
            "Queue tasks whose handler chain completed",
        ))?;
        let task_retries = IntCounter::with_opts(Opts::new(
            "queue_task_retries_total",
            "Handler chain failures that caused a retry",
        ))?;
        let tasks_dropped = IntCounter::with_opts(Opts::new(
            "queue_tasks_dropped_total",
            "Tasks abandoned after exhausting the retry limit",
        ))?;
        let recomputations = IntCounter::with_opts(Opts::new(
            "recomputations_total",
            "Recomputations of the discovered API set",
        ))?;
        let probe_failures = IntCounter::with_opts(Opts::new(
            "probe_failures_total",
            "Documentation probes that failed or returned a non-200 status",
        ))?;
        let apis_discovered = IntGauge::with_opts(Opts::new(
            "apis_discovered",
            "API documents found by the latest recomputation",
        ))?;

        registry.register(Box::new(tasks_processed.clone()))?;
        registry.register(Box::new(task_retries.clone()))?;
        registry.register(Box::new(tasks_dropped.clone()))?;
        registry.register(Box::new(recomputations.clone()))?;
        registry.register(Box::new(probe_failures.clone()))?;
        registry.register(Box::new(apis_discovered.clone()))?;

        Ok(Self {
            registry,
            tasks_processed,
            task_retries,
            tasks_dropped,
            recomputations,
            probe_failures,
            apis_discovered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
