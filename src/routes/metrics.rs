use axum::http::{header, StatusCode};
use prometheus::{Encoder, TextEncoder};

/// GET /metrics: auth counters in the Prometheus text format.
pub async fn metrics_handler() -> Result<([(header::HeaderName, String); 1], Vec<u8>), StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer))
}
