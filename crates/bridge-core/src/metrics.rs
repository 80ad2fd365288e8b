//! Prometheus metrics for the host bridge.
//!
//! Only compiled with the `metrics` feature.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Label set for routed envelopes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EnvelopeLabels {
    /// Envelope type tag, or "malformed".
    pub kind: String,
}

/// Label set for settled host calls.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "ok", or the error code of the failure.
    pub outcome: String,
}

/// Host bridge metrics.
pub struct BridgeMetrics {
    /// Inbound envelopes routed, by kind.
    pub envelopes_routed_total: Family<EnvelopeLabels, Counter>,
    /// Host-issued calls settled, by outcome.
    pub calls_settled_total: Family<OutcomeLabels, Counter>,
    /// Latency of host-issued calls.
    pub call_duration_seconds: Family<OutcomeLabels, Histogram>,
    /// Instances currently registered.
    pub instances_registered: Gauge<i64, AtomicI64>,
}

impl BridgeMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let envelopes_routed_total = Family::default();
        registry.register(
            "miniapp_bridge_envelopes_routed_total",
            "Inbound envelopes routed by kind",
            envelopes_routed_total.clone(),
        );

        let calls_settled_total = Family::default();
        registry.register(
            "miniapp_bridge_calls_settled_total",
            "Host-issued calls settled by outcome",
            calls_settled_total.clone(),
        );

        let call_duration_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter())
            });
        registry.register(
            "miniapp_bridge_call_duration_seconds",
            "Host-issued call latency",
            call_duration_seconds.clone(),
        );

        let instances_registered = Gauge::default();
        registry.register(
            "miniapp_bridge_instances_registered",
            "Sandbox instances currently registered",
            instances_registered.clone(),
        );

        Self {
            envelopes_routed_total,
            calls_settled_total,
            call_duration_seconds,
            instances_registered,
        }
    }

    /// Count one routed envelope.
    pub fn record_envelope(&self, kind: &str) {
        self.envelopes_routed_total
            .get_or_create(&EnvelopeLabels { kind: kind.into() })
            .inc();
    }

    /// Count one settled host call.
    pub fn record_call(&self, outcome: &str, duration_secs: f64) {
        let labels = OutcomeLabels {
            outcome: outcome.into(),
        };
        self.calls_settled_total.get_or_create(&labels).inc();
        self.call_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn envelope_counter_is_per_kind() {
        let mut registry = Registry::default();
        let metrics = BridgeMetrics::new(&mut registry);
        metrics.record_envelope("apiRequest");
        metrics.record_envelope("apiRequest");
        metrics.record_envelope("malformed");

        let count = metrics
            .envelopes_routed_total
            .get_or_create(&EnvelopeLabels {
                kind: "apiRequest".into(),
            })
            .get();
        assert_eq!(count, 2);
    }

    #[test]
    fn call_outcomes_encode_to_text() {
        let mut registry = Registry::default();
        let metrics = BridgeMetrics::new(&mut registry);
        metrics.record_call("ok", 0.01);
        metrics.record_call("TIMEOUT", 15.0);
        metrics.instances_registered.set(3);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("miniapp_bridge_calls_settled_total"), "{buf}");
        assert!(buf.contains("TIMEOUT"), "{buf}");
        assert!(buf.contains("miniapp_bridge_instances_registered 3"), "{buf}");
    }
}
