//! Prometheus metrics for proxy_gate.
//!
//! Counters and gauges for relay sessions, byte volumes, health probes, and
//! heal cycles. Registered against a custom registry so embedders control
//! exactly what gets exported.
//!
//! ```rust,ignore
//! proxy_gate::metrics::init_metrics().expect("metrics init");
//! let exposition = proxy_gate::metrics::encode_metrics();
//! ```

use prometheus::{Counter, CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;

/// Custom registry for proxy_gate metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Relay sessions opened, labeled by target port.
pub static CONNECTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    CounterVec::new(
        Opts::new("proxy_gate_connections_total", "Relay sessions opened"),
        &["target"],
    )
    .expect("Failed to create CONNECTIONS_TOTAL metric")
});

/// Currently open relay sessions, labeled by target port.
pub static ACTIVE_CONNECTIONS: LazyLock<GaugeVec> = LazyLock::new(|| {
    GaugeVec::new(
        Opts::new("proxy_gate_active_connections", "Open relay sessions"),
        &["target"],
    )
    .expect("Failed to create ACTIVE_CONNECTIONS metric")
});

/// Bytes sent to upstream targets, labeled by target port.
pub static BYTES_SENT: LazyLock<CounterVec> = LazyLock::new(|| {
    CounterVec::new(
        Opts::new("proxy_gate_bytes_sent_total", "Bytes relayed to upstream"),
        &["target"],
    )
    .expect("Failed to create BYTES_SENT metric")
});

/// Bytes returned to clients, labeled by target port.
pub static BYTES_RECEIVED: LazyLock<CounterVec> = LazyLock::new(|| {
    CounterVec::new(
        Opts::new(
            "proxy_gate_bytes_received_total",
            "Bytes relayed back to clients",
        ),
        &["target"],
    )
    .expect("Failed to create BYTES_RECEIVED metric")
});

/// Health probe outcomes, labeled by target port and result.
pub static HEALTH_PROBES: LazyLock<CounterVec> = LazyLock::new(|| {
    CounterVec::new(
        Opts::new("proxy_gate_health_probes_total", "Health probe results"),
        &["target", "result"],
    )
    .expect("Failed to create HEALTH_PROBES metric")
});

/// Target selections, labeled by algorithm.
pub static PICKS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    CounterVec::new(
        Opts::new("proxy_gate_picks_total", "Target selections"),
        &["algorithm"],
    )
    .expect("Failed to create PICKS_TOTAL metric")
});

/// Heal cycles run by the cluster manager.
pub static HEAL_CYCLES: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("proxy_gate_heal_cycles_total", "Heal cycles run")
        .expect("Failed to create HEAL_CYCLES")
});

/// Members replaced across all heal cycles.
pub static HEAL_REPLACEMENTS: LazyLock<CounterVec> = LazyLock::new(|| {
    CounterVec::new(
        Opts::new(
            "proxy_gate_heal_members_total",
            "Members seen by heal cycles",
        ),
        &["outcome"],
    )
    .expect("Failed to create HEAL_REPLACEMENTS metric")
});

/// Register every metric against [`REGISTRY`]. Call once at startup;
/// repeated registration is reported as an error by prometheus.
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(CONNECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone()))?;
    REGISTRY.register(Box::new(BYTES_SENT.clone()))?;
    REGISTRY.register(Box::new(BYTES_RECEIVED.clone()))?;
    REGISTRY.register(Box::new(HEALTH_PROBES.clone()))?;
    REGISTRY.register(Box::new(PICKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HEAL_CYCLES.clone()))?;
    REGISTRY.register(Box::new(HEAL_REPLACEMENTS.clone()))?;
    Ok(())
}

/// Encode the registry in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_pick(algorithm: &str) {
    PICKS_TOTAL.with_label_values(&[algorithm]).inc();
}

pub fn connection_started(target: u16) {
    let label = target.to_string();
    CONNECTIONS_TOTAL.with_label_values(&[&label]).inc();
    ACTIVE_CONNECTIONS.with_label_values(&[&label]).inc();
}

pub fn connection_ended(target: u16) {
    ACTIVE_CONNECTIONS
        .with_label_values(&[&target.to_string()])
        .dec();
}

pub fn record_bytes(target: u16, sent: u64, received: u64) {
    let label = target.to_string();
    BYTES_SENT.with_label_values(&[&label]).inc_by(sent as f64);
    BYTES_RECEIVED
        .with_label_values(&[&label])
        .inc_by(received as f64);
}

pub fn record_probe(target: u16, passed: bool) {
    let result = if passed { "pass" } else { "fail" };
    HEALTH_PROBES
        .with_label_values(&[&target.to_string(), result])
        .inc();
}

pub fn record_heal(failed: usize, replaced: usize) {
    HEAL_CYCLES.inc();
    HEAL_REPLACEMENTS
        .with_label_values(&["failed"])
        .inc_by(failed as f64);
    HEAL_REPLACEMENTS
        .with_label_values(&["replaced"])
        .inc_by(replaced as f64);
}
