//! Stable echo server, the healthy baseline the unstable server is compared against

use clap::Parser;
use eyre::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_derive::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
pub struct Args {
    #[clap(long, default_value_t = 8080)]
    port: u16,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn json_response<T: serde::Serialize>(
    payload: &T,
    status: StatusCode,
) -> Result<Response<Body>, hyper::http::Error> {
    match serde_json::to_vec(payload) {
        Ok(body) => Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body)),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Failed to encode response"))
        }
    }
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, hyper::http::Error> {
    let started = Instant::now();
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => json_response(
            &Message {
                message: "Server is running!!!",
            },
            StatusCode::OK,
        ),
        (&Method::GET, _) => json_response(
            &ErrorBody { error: "Not Found" },
            StatusCode::NOT_FOUND,
        ),
        _ => json_response(
            &ErrorBody {
                error: "Method Not Allowed",
            },
            StatusCode::METHOD_NOT_ALLOWED,
        ),
    }?;

    info!(
        method = %req.method(),
        path = req.uri().path(),
        status = response.status().as_u16(),
        elapsed = ?started.elapsed(),
        "request"
    );
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });
    let server = Server::try_bind(&addr)?.serve(make_svc);

    info!("Server is running on port {}", args.port);
    server.await?;
    Ok(())
}
