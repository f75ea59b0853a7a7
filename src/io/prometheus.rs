//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
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

/// Prometheus metric type
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

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_ingest_metrics(&mut output, site_id, &summary);
    write_publish_metrics(&mut output, site_id, &summary);
    write_doorway_metrics(&mut output, site_id, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "occupancy_lines_total",
        "Raw sensor lines read",
        MetricType::Counter,
        site,
        summary.lines_total,
    );
    write_metric(
        output,
        "occupancy_parse_errors_total",
        "Lines skipped as malformed",
        MetricType::Counter,
        site,
        summary.parse_errors_total,
    );
    write_metric(
        output,
        "occupancy_lines_filtered_total",
        "Lines ignored by doorway mode",
        MetricType::Counter,
        site,
        summary.lines_filtered_total,
    );
    write_metric(
        output,
        "occupancy_enters_total",
        "ENTER crossings detected",
        MetricType::Counter,
        site,
        summary.enters_total,
    );
    write_metric(
        output,
        "occupancy_exits_total",
        "EXIT crossings detected",
        MetricType::Counter,
        site,
        summary.exits_total,
    );
    write_metric(
        output,
        "occupancy_snapshots_total",
        "Occupancy snapshots produced",
        MetricType::Counter,
        site,
        summary.snapshots_total,
    );
    write_metric(
        output,
        "occupancy_source_reconnects_total",
        "Sensor source reopen attempts",
        MetricType::Counter,
        site,
        summary.source_reconnects_total,
    );
}

fn write_publish_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "occupancy_publish_ok_total",
        "Store writes that succeeded",
        MetricType::Counter,
        site,
        summary.publish_ok_total,
    );
    write_metric(
        output,
        "occupancy_publish_failed_total",
        "Store writes abandoned after retries",
        MetricType::Counter,
        site,
        summary.publish_failed_total,
    );
    write_metric(
        output,
        "occupancy_publish_retries_total",
        "Store write retries",
        MetricType::Counter,
        site,
        summary.publish_retries_total,
    );
    write_metric(
        output,
        "occupancy_publish_dropped_total",
        "Publish jobs dropped by backpressure",
        MetricType::Counter,
        site,
        summary.publish_dropped_total,
    );
    write_metric(
        output,
        "occupancy_publish_queue_depth",
        "Jobs waiting in the publish queue",
        MetricType::Gauge,
        site,
        summary.publish_queue_depth,
    );
    write_histogram(
        output,
        "occupancy_publish_latency_ms",
        "Store write latency in milliseconds",
        site,
        &summary.publish_latency_buckets,
        summary.publish_latency_avg_ms,
    );
}

fn write_doorway_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP occupancy_count Current occupancy per doorway");
    let _ = writeln!(output, "# TYPE occupancy_count gauge");
    for (doorway, gauge) in &summary.doorways {
        let _ = writeln!(
            output,
            "occupancy_count{{site=\"{site}\",doorway=\"{doorway}\",room=\"{}\"}} {}",
            gauge.room_id, gauge.occupancy
        );
    }

    let _ = writeln!(output, "# HELP occupancy_crowdiness_index Latest crowdiness per doorway");
    let _ = writeln!(output, "# TYPE occupancy_crowdiness_index gauge");
    for (doorway, gauge) in &summary.doorways {
        if let Some(index) = gauge.crowdiness_index {
            let _ = writeln!(
                output,
                "occupancy_crowdiness_index{{site=\"{site}\",doorway=\"{doorway}\",room=\"{}\"}} {index:.6}",
                gauge.room_id
            );
        }
    }

    let _ = writeln!(output, "# HELP occupancy_debounce_seconds Current adaptive debounce window");
    let _ = writeln!(output, "# TYPE occupancy_debounce_seconds gauge");
    for (doorway, gauge) in &summary.doorways {
        let _ = writeln!(
            output,
            "occupancy_debounce_seconds{{site=\"{site}\",doorway=\"{doorway}\"}} {:.3}",
            gauge.debounce_secs
        );
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            let mut response = text_response(StatusCode::OK, body);
            if let Ok(value) = "text/plain; version=0.0.4; charset=utf-8".parse() {
                response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
            }
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
