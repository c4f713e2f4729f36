//! Prometheus metrics for the Partybot gateway
//!
//! Exposes relay, history and completion metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, GaugeVec, HistogramVec,
};

lazy_static! {
    // ============================================================================
    // Relay Metrics
    // ============================================================================

    /// Mentions handed to the relay
    pub static ref MENTIONS_RECEIVED: Counter =
        register_counter!("partybot_mentions_received_total", "Total mentions received").unwrap();

    /// Relay outcomes by kind
    pub static ref RELAY_OUTCOMES: CounterVec =
        register_counter_vec!("partybot_relay_outcomes_total", "Relay outcomes by kind", &["outcome"]).unwrap();

    /// History messages left out of a context window
    pub static ref HISTORY_DROPPED: Counter =
        register_counter!("partybot_history_dropped_total", "History messages truncated from context windows").unwrap();

    /// Conversation resets
    pub static ref RESETS_TOTAL: Counter =
        register_counter!("partybot_resets_total", "Conversation history resets").unwrap();

    // ============================================================================
    // Completion Metrics
    // ============================================================================

    /// Completion latency
    pub static ref COMPLETION_LATENCY: HistogramVec = register_histogram_vec!(
        "partybot_completion_latency_seconds",
        "Completion request latency in seconds",
        &["provider"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    /// Completion errors
    pub static ref COMPLETION_ERRORS: CounterVec =
        register_counter_vec!("partybot_completion_errors_total", "Completion errors", &["provider", "error_type"]).unwrap();

    // ============================================================================
    // System Metrics
    // ============================================================================

    /// Build info
    pub static ref BUILD_INFO: GaugeVec =
        register_gauge_vec!("partybot_build_info", "Build information", &["version", "commit"]).unwrap();
}

/// Register every metric and set build info
pub fn init_metrics() {
    lazy_static::initialize(&MENTIONS_RECEIVED);
    lazy_static::initialize(&RELAY_OUTCOMES);
    lazy_static::initialize(&HISTORY_DROPPED);
    lazy_static::initialize(&RESETS_TOTAL);
    lazy_static::initialize(&COMPLETION_LATENCY);
    lazy_static::initialize(&COMPLETION_ERRORS);

    BUILD_INFO
        .with_label_values(&[
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_COMMIT_SHA").unwrap_or("unknown"),
        ])
        .set(1.0);
}

/// Export metrics in Prometheus format
pub fn export() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_can_be_exported() {
        init_metrics();
        RESETS_TOTAL.inc();

        let exported = export().unwrap();
        assert!(exported.contains("partybot_mentions_received_total"));
        assert!(exported.contains("partybot_resets_total"));
        assert!(exported.contains("partybot_build_info"));
    }
}
