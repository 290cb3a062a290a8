use crate::chaos::{ChaosOutcome, ChaosSupervisor};
use crate::error::Error;
use crate::metrics::HTTP_REQUESTS;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, Error>;

/// Closed set of path labels so unknown URLs share one series
fn route_label(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/health" => "/health",
        "/status" => "/status",
        _ => "other",
    }
}

fn text_response(status: StatusCode, body: String) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.into())?)
}

fn chaos_response(outcome: ChaosOutcome) -> Result<Response<Body>> {
    match outcome {
        ChaosOutcome::Initializing { remaining } => text_response(
            StatusCode::OK,
            format!("Server is initializing... (Remaining delay: {remaining:?})"),
        ),
        ChaosOutcome::Healthy(report) => text_response(StatusCode::OK, report.running_message()),
        ChaosOutcome::Failure {
            category,
            trigger_count,
            ..
        } => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Error: Server failed due to {} buildup (Count: {trigger_count})",
                category.description()
            ),
        ),
        ChaosOutcome::Crash { category, .. } => Err(Error::ForcedCrash { category }),
    }
}

pub async fn handle_request(
    req: Request<Body>,
    supervisor: Arc<ChaosSupervisor>,
) -> Result<Response<Body>> {
    let path = req.uri().path().to_string();
    let result = match (req.method(), path.as_str()) {
        (&Method::GET, "/") => chaos_response(supervisor.tick(Instant::now()).await),
        (&Method::GET, "/health") => text_response(
            StatusCode::OK,
            supervisor.status(Instant::now()).health_message(),
        ),
        (&Method::GET, "/status") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(supervisor.status(Instant::now()).to_json().to_string().into())?),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found".to_string()),
    };

    let status = match &result {
        Ok(response) => response.status().as_str().to_string(),
        Err(_) => "aborted".to_string(),
    };
    HTTP_REQUESTS
        .with_label_values(&[route_label(&path), status.as_str()])
        .inc();
    debug!(path = %path, status = %status, "Request served");

    result
}

/// Binds the chaos listener. The returned future serves connections until
/// the listener fails; forced crashes only drop the affected connection.
pub fn bind(
    supervisor: Arc<ChaosSupervisor>,
    port: u16,
) -> Result<(SocketAddr, impl Future<Output = Result<()>>)> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let builder = Server::try_bind(&addr).map_err(|source| Error::Bind { addr, source })?;
    let server = builder.serve(make_service_fn(move |_conn| {
        let supervisor = supervisor.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, supervisor.clone())
            }))
        }
    }));
    let local_addr = server.local_addr();

    info!("Starting unstable server on {}", local_addr);
    Ok((local_addr, async move { server.await.map_err(Error::from) }))
}
