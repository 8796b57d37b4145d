//! Prometheus metrics for the control plane

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exposed on `/metrics`
#[derive(Clone)]
pub struct ControlPlaneMetrics {
    registry: Registry,
    pub instances_created: IntCounter,
    pub instances_destroyed: IntCounter,
    /// Orphaned side effects left behind by destroys and failed creates
    pub cleanup_failures: IntCounterVec,
    /// Bootstrap handshakes by outcome (`granted`, `denied`)
    pub bootstrap_attempts: IntCounterVec,
}

impl ControlPlaneMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let instances_created = IntCounter::new(
            "fleet_instances_created_total",
            "Instances created and provisioned",
        )
        .map_err(metric_error)?;
        let instances_destroyed = IntCounter::new(
            "fleet_instances_destroyed_total",
            "Instances destroyed",
        )
        .map_err(metric_error)?;
        let cleanup_failures = IntCounterVec::new(
            Opts::new(
                "fleet_cleanup_failures_total",
                "Best-effort cleanup steps that failed",
            ),
            &["step"],
        )
        .map_err(metric_error)?;
        let bootstrap_attempts = IntCounterVec::new(
            Opts::new("fleet_bootstrap_attempts_total", "Bootstrap handshakes"),
            &["outcome"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(instances_created.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(instances_destroyed.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(cleanup_failures.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(bootstrap_attempts.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            instances_created,
            instances_destroyed,
            cleanup_failures,
            bootstrap_attempts,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = ControlPlaneMetrics::new().unwrap();
        metrics.instances_created.inc();
        metrics
            .bootstrap_attempts
            .with_label_values(&["denied"])
            .inc();

        let (content_type, body) = metrics.render().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("fleet_instances_created_total 1"));
        assert!(body.contains("fleet_bootstrap_attempts_total{outcome=\"denied\"} 1"));
    }
}
