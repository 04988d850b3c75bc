//! Reconcile metrics
//!
//! Counters and histograms labelled by controller name. The binary registers
//! them with the default registry so `/metrics` picks them up through
//! `prometheus::gather`.

use prometheus::{HistogramOpts, HistogramTimer, HistogramVec, IntCounterVec, Opts, Registry};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct ReconcileMetrics {
    reconciles: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
}

impl ReconcileMetrics {
    pub fn register(registry: &Registry) -> Result<Self> {
        let reconciles = IntCounterVec::new(
            Opts::new("rbln_operator_reconcile_total", "Reconcile passes started"),
            &["controller"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("rbln_operator_reconcile_failures_total", "Reconcile passes that failed"),
            &["controller", "error"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("rbln_operator_reconcile_duration_seconds", "Duration of reconcile passes")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["controller"],
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        Ok(Self {
            reconciles,
            failures,
            duration,
        })
    }

    /// Count a pass and time it until the returned timer drops
    pub fn start(&self, controller: &str) -> HistogramTimer {
        self.reconciles.with_label_values(&[controller]).inc();
        self.duration.with_label_values(&[controller]).start_timer()
    }

    pub fn failure(&self, controller: &str, error: &Error) {
        self.failures
            .with_label_values(&[controller, error.metric_label()])
            .inc();
    }

    pub fn reconcile_count(&self, controller: &str) -> u64 {
        self.reconciles.with_label_values(&[controller]).get()
    }

    pub fn failure_count(&self, controller: &str, label: &str) -> u64 {
        self.failures.with_label_values(&[controller, label]).get()
    }
}
