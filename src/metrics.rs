use std::time::Instant;

use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub lock_contentions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "network_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "network_operator_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["instance", "error"],
        )?;
        let reconciliations =
            IntCounter::new("network_operator_reconciliations_total", "reconciliations")?;
        let lock_contentions = IntCounterVec::new(
            opts!(
                "network_operator_device_lock_contentions_total",
                "reconciles deferred because their device was locked"
            ),
            &["device"],
        )?;

        Ok(Self {
            reconciliations,
            failures,
            reconcile_duration,
            lock_contentions,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> prometheus::Result<Self> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.lock_contentions.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<K: ResourceExt>(&self, obj: &K, e: &Error) {
        self.failures
            .with_label_values(&[obj.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn lock_contention(&self, device: &str) {
        self.lock_contentions.with_label_values(&[device]).inc()
    }

    pub fn count_and_measure(&self, kind: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            kind: kind.into(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    kind: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.kind.as_str()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_counts() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap().register(&registry).unwrap();

        metrics.lock_contention("default/leaf-1");
        metrics.lock_contention("default/leaf-1");
        drop(metrics.count_and_measure("Interface"));
        metrics.reconcile_failure(
            &crate::reconcilers::fixtures::interface("eth1", "leaf-1", Default::default()),
            &Error::provider("timeout"),
        );

        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(
            metrics
                .lock_contentions
                .with_label_values(&["default/leaf-1"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .failures
                .with_label_values(&["eth1", "provider"])
                .get(),
            1
        );
        // Vectors only show up once they have a labelled child
        assert_eq!(registry.gather().len(), 4);
    }
}
