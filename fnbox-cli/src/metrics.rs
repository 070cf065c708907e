use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use fnbox_core::RouterResponse;

lazy_static! {
    pub static ref INVOCATIONS: IntCounterVec = register_int_counter_vec!(
        "fnbox_invocations_total",
        "Invocations that reached a sandbox, by engine and outcome",
        &["engine", "outcome"]
    )
    .unwrap();
    pub static ref INVOCATION_DURATION: HistogramVec = register_histogram_vec!(
        "fnbox_invocation_duration_seconds",
        "Request accepted to teardown, provisioning included",
        &["engine"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
    pub static ref BOOT_LATENCY: HistogramVec = register_histogram_vec!(
        "fnbox_boot_latency_seconds",
        "Sandbox process start to runtime boot marker",
        &["engine"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();
    pub static ref COLD_STARTS: IntCounterVec = register_int_counter_vec!(
        "fnbox_cold_starts_total",
        "Invocations that had to build an image or fetch a package",
        &["engine"]
    )
    .unwrap();
    pub static ref REJECTED: IntCounterVec = register_int_counter_vec!(
        "fnbox_rejected_total",
        "Requests answered without running a sandbox, by error kind",
        &["kind"]
    )
    .unwrap();
}

/// Record one routed request.
pub fn record(response: &RouterResponse) {
    let Some(metrics) = &response.metrics else {
        let kind = response.error_kind.unwrap_or("unknown");
        REJECTED.with_label_values(&[kind]).inc();
        return;
    };

    let engine = metrics.engine.name();
    INVOCATIONS
        .with_label_values(&[engine, metrics.outcome.name()])
        .inc();
    INVOCATION_DURATION
        .with_label_values(&[engine])
        .observe(metrics.total_ms as f64 / 1000.0);
    if let Some(boot_ms) = metrics.boot_ms {
        BOOT_LATENCY
            .with_label_values(&[engine])
            .observe(boot_ms as f64 / 1000.0);
    }
    if metrics.cold_start {
        COLD_STARTS.with_label_values(&[engine]).inc();
    }
    if let Some(kind) = response.error_kind {
        // Capacity refusals also count as rejections
        if kind == "ResourceExhaustedError" {
            REJECTED.with_label_values(&[kind]).inc();
        }
    }
}

/// Start the metrics server in a background task.
pub fn start_metrics_server(port: u16) {
    // Force initialization of metrics
    lazy_static::initialize(&INVOCATIONS);
    lazy_static::initialize(&INVOCATION_DURATION);
    lazy_static::initialize(&BOOT_LATENCY);
    lazy_static::initialize(&COLD_STARTS);
    lazy_static::initialize(&REJECTED);

    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!("Metrics server starting on {}", addr);
                loop {
                    if let Ok((mut socket, _)) = listener.accept().await {
                        tokio::spawn(async move {
                            let body = metrics_handler();
                            let response = format!(
                                "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain; version=0.0.4\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.flush().await;
                        });
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to bind metrics server: {}", e);
            }
        }
    });
}

fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnbox_core::InvocationError;

    #[test]
    fn test_rejections_counted_by_kind() {
        let response = RouterResponse::from_error(&InvocationError::NotFound {
            user_id: "u1".to_string(),
            handler: "main.run".to_string(),
        });
        let before = REJECTED.with_label_values(&["NotFoundError"]).get();
        record(&response);
        assert_eq!(
            REJECTED.with_label_values(&["NotFoundError"]).get(),
            before + 1
        );
        assert!(metrics_handler().contains("fnbox_rejected_total"));
    }
}
