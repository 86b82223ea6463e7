use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rlsp_requests_total",
        "The total number of requests",
        &["origin"]
    )
    .expect("counter")
});

// Buckets sized for proxy response times.
pub static RESPONSE_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rlsp_response_time_seconds",
        "Response time in seconds",
        &["origin"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
    )
    .expect("histogram")
});

pub static RESPONSE_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rlsp_response_status_total",
        "The total number of responses by HTTP status code",
        &["origin", "status"]
    )
    .expect("counter")
});

pub static RATE_LIMIT_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rlsp_rate_limit_hits_total",
        "The total number of rate limit hits",
        &["origin", "ip"]
    )
    .expect("counter")
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "rlsp_active_connections",
        "The number of active connections",
        &["origin"]
    )
    .expect("gauge")
});

/// Renders every registered metric in the prometheus text format.
pub fn render() -> (String, Vec<u8>) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&prometheus::gather(), &mut buffer);
    (encoder.format_type().to_string(), buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposes_samples() {
        REQUESTS_TOTAL.with_label_values(&["example.com"]).inc();
        RESPONSE_TIME
            .with_label_values(&["example.com"])
            .observe(0.02);
        RESPONSE_STATUS
            .with_label_values(&["example.com", "200"])
            .inc();
        RATE_LIMIT_HITS
            .with_label_values(&["example.com", "1.2.3.4"])
            .inc();
        ACTIVE_CONNECTIONS.with_label_values(&["example.com"]).inc();
        ACTIVE_CONNECTIONS.with_label_values(&["example.com"]).dec();

        let (format, body) = render();
        let text = String::from_utf8(body).unwrap();
        assert!(format.starts_with("text/plain"));
        assert!(text.contains("rlsp_requests_total"));
        assert!(text.contains("rlsp_response_time_seconds"));
        assert!(text.contains("rlsp_response_status_total"));
        assert!(text.contains("rlsp_rate_limit_hits_total"));
        assert!(text.contains("rlsp_active_connections"));
        assert!(text.contains("origin=\"example.com\""));
    }
}
