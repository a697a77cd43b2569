//! Prometheus metrics side-channel
//!
//! Counters and per-method duration histograms, exposed over an HTTP
//! listener independent of the stdio protocol. Recording is fire-and-forget:
//! a failed or absent exporter never fails a request.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

/// Install the Prometheus exporter on the configured port. Failure is
/// logged and swallowed: the metrics endpoint is optional for correctness.
pub fn install(config: &crate::config::MetricsConfig) {
    if !config.enabled {
        info!("metrics exporter disabled by config");
        return;
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            info!("Prometheus metrics server listening on :{}", config.port);
            describe_counter!("requests_total", "Total requests by method");
            describe_counter!("pages_processed_total", "Total pages processed for embedding");
            describe_histogram!(
                "request_duration_seconds",
                "Request duration in seconds by method"
            );
        }
        Err(e) => warn!("failed to start metrics exporter on :{}: {}", config.port, e),
    }
}

/// Count one request for `method`.
pub fn record_request(method: &str) {
    counter!("requests_total", "method" => method.to_string()).increment(1);
}

/// Count pages submitted for image embedding.
pub fn record_pages(count: usize) {
    counter!("pages_processed_total").increment(count as u64);
}

/// Times one request; records the duration histogram on drop so every exit
/// path of a handler is covered.
pub struct RequestTimer {
    method: String,
    start: Instant,
}

impl RequestTimer {
    pub fn start(method: &str) -> Self {
        Self {
            method: method.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        histogram!("request_duration_seconds", "method" => self.method.clone())
            .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_a_no_op() {
        // No recorder installed here: all of these must silently succeed
        record_request("health");
        record_pages(3);
        let _timer = RequestTimer::start("embed_images");
    }
}
