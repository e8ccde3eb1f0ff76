//! Health and Prometheus metrics HTTP endpoint
//!
//! `GET /health` answers `{"status":"ok"}`, `GET /metrics` renders the
//! registry in Prometheus text format. Everything else is 404.

use crate::infra::metrics::{Metrics, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const METRIC_PREFIX: &str = "flow_classifier";

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {METRIC_PREFIX}_{name} {help}");
    let _ = writeln!(output, "# TYPE {METRIC_PREFIX}_{name} {}", typ.as_str());
    let _ = writeln!(output, "{METRIC_PREFIX}_{name} {val}");
}

/// Cumulative buckets, sum and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let name = format!("{METRIC_PREFIX}_{name}");
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {cumulative}");
}

/// Render the registry without touching the periodic report counters
pub fn format_prometheus_metrics(metrics: &Metrics) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "events_received_total",
        "Completed-mission messages received",
        MetricType::Counter,
        metrics.events_received(),
    );
    write_metric(
        &mut output,
        "events_classified_total",
        "Missions classified",
        MetricType::Counter,
        metrics.events_classified(),
    );
    write_metric(
        &mut output,
        "decode_failures_total",
        "Messages that could not be decoded into a completed mission",
        MetricType::Counter,
        metrics.decode_failures(),
    );
    write_metric(
        &mut output,
        "pipeline_failures_total",
        "Missions dropped by a query, inference or label failure",
        MetricType::Counter,
        metrics.pipeline_failures(),
    );
    write_metric(
        &mut output,
        "sink_failures_total",
        "Classifications that could not be written",
        MetricType::Counter,
        metrics.sink_failures(),
    );
    write_metric(
        &mut output,
        "reconnects_total",
        "Mission stream reconnect attempts",
        MetricType::Counter,
        metrics.reconnects(),
    );
    write_metric(
        &mut output,
        "stream_state",
        "Mission stream state (0 connecting, 1 connected, 2 reconnecting)",
        MetricType::Gauge,
        metrics.stream_state(),
    );

    let _ = writeln!(output, "# HELP {METRIC_PREFIX}_predictions_total Predictions per end use");
    let _ = writeln!(output, "# TYPE {METRIC_PREFIX}_predictions_total counter");
    for (end_use, count) in metrics.predictions() {
        let _ = writeln!(output, "{METRIC_PREFIX}_predictions_total{{end_use=\"{end_use}\"}} {count}");
    }

    let (buckets, sum) = metrics.latency_histogram();
    write_histogram(
        &mut output,
        "classification_latency_ms",
        "Pipeline latency per classified mission in milliseconds",
        &buckets,
        sum,
    );

    output
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Route one request
pub fn route(method: &Method, path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/health") => {
            respond(StatusCode::OK, "application/json", r#"{"status":"ok"}"#)
        }
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(metrics),
        ),
        _ => respond(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", "Not Found"),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &metrics))
}

/// Bind and serve until shutdown
pub async fn start_http_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "http_server_started");
    serve(listener, metrics, shutdown).await;
    Ok(())
}

/// Accept loop on an already bound listener
pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("http_server_shutdown");
                return;
            }
        }
    }
}
