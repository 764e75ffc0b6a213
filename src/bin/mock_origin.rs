//! Stand-in for the slow image-generating origin.
//!
//! `GET /image` sleeps for `--delay`, then returns a short timestamped payload
//! labelled as a JPEG, which is enough to watch the proxy's stampede control
//! from the outside.

use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::{Router, extract::State, routing::get};
use clap::Parser;
use image_proxy::config::parse_duration;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Slow mock origin for the image proxy")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8888)]
    port: u16,
    /// Time to spend "generating" each image
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    delay: Duration,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let router = Router::new()
        .route("/image", get(generate_image))
        .with_state(args.delay);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = ?e, %addr, "Failed to bind listener");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, delay = ?args.delay, "mock origin listening");

    match axum::serve(listener, router).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "mock origin failed");
            ExitCode::FAILURE
        }
    }
}

async fn generate_image(State(delay): State<Duration>) -> Response {
    info!("image requested");
    tokio::time::sleep(delay).await;

    let body = format!(
        "API called at: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
            (header::CONTENT_LENGTH, HeaderValue::from(body.len())),
        ],
        body,
    )
        .into_response()
}
