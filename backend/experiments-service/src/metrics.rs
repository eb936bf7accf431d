//! Prometheus metrics for experiments-service.
//!
//! Per-component collectors (CDC consumer, outbox processor, cache) are
//! registered where they're defined; this module only owns the `/metrics`
//! exposition endpoint and the HTTP request middleware.

use actix_web::HttpResponse;
use prometheus::{Encoder, TextEncoder};

pub use actix_middleware::metrics::MetricsMiddleware;

/// Actix handler that renders Prometheus metrics in text format.
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
