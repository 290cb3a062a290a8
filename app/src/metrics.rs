use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;

// Create a new registry named `chaos`
lazy_static! {
    pub static ref CHAOS_REGISTRY: Registry =
        Registry::new_custom(Some("chaos".to_string()), None).unwrap();
}

// Register metrics with the `chaos` registry
lazy_static! {
    pub static ref CHAOS_TICKS: IntCounterVec = register_int_counter_vec_with_registry!(
        "ticks_total",
        "Evaluations of the chaos state machine by outcome",
        &["outcome"],
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_TRIGGERS: IntCounterVec = register_int_counter_vec_with_registry!(
        "triggers_total",
        "Simulated failures served, by crash category",
        &["category"],
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_CRASHES: IntCounterVec = register_int_counter_vec_with_registry!(
        "forced_crashes_total",
        "Connections aborted by a forced crash, by crash category",
        &["category"],
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_CYCLE_RESETS: IntCounter = register_int_counter_with_registry!(
        "cycle_resets_total",
        "Completed chaos cycles",
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_ACTIVE_CATEGORY: IntGaugeVec = register_int_gauge_vec_with_registry!(
        "active_category",
        "1 for the crash category currently building up",
        &["category"],
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_MEMORY_BYTES: IntGauge = register_int_gauge_with_registry!(
        "memory_growth_bytes",
        "Bytes retained by the memory growth injector",
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref CHAOS_BACKGROUND_TASKS: IntGauge = register_int_gauge_with_registry!(
        "background_tasks",
        "Injector tasks of the current cycle that are still running",
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref HTTP_REQUESTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "http_requests_total",
        "Requests served by the unstable server",
        &["path", "status"],
        CHAOS_REGISTRY
    )
    .unwrap();
    pub static ref PROCESS_START_TIME: IntGauge = register_int_gauge_with_registry!(
        "process_start_time_seconds",
        "Process start time in Unix timestamp",
        CHAOS_REGISTRY
    )
    .unwrap();
}

fn encode_metrics() -> Result<(Vec<u8>, String), prometheus::Error> {
    // Gather the metrics from both the `chaos` registry and the default registry
    let mut metric_families = CHAOS_REGISTRY.gather();
    metric_families.extend(prometheus::gather());

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, hyper::http::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match encode_metrics() {
            Ok((buffer, format_type)) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, format_type)
                .body(Body::from(buffer)),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {e}");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(e.to_string()))
            }
        },
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
                "metrics_count": CHAOS_REGISTRY.gather().len()
            });

            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(health_status.to_string()))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found")),
    }
}

/// Serves `/metrics` on its own port, detached from the chaos listener
pub async fn start_server(port: u16) -> Result<SocketAddr, hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(handle_request))
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();

    PROCESS_START_TIME.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
    );

    tokio::spawn(async move {
        tracing::info!("Starting metrics server on {}", local_addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(local_addr)
}
