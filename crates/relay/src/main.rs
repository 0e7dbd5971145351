//! User-facing relay in front of the operator's admission endpoint.
//!
//! Listens on a local port and forwards each inbound request as a POST to
//! the configured operator address, translating the upstream status into a
//! fixed human-readable response.

use anyhow::Result;
use clap::Parser;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::web::Data;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tracing::error;
use tracing::info;

#[derive(Parser, Clone)]
#[command(name = "relay", about, version)]
struct RelayArgs {
    #[arg(
        long,
        env = "OPERATOR_DNS_NAME",
        default_value = "localhost",
        help = "Host the operator admission endpoint is reachable at"
    )]
    operator_host: String,

    #[arg(
        long,
        env = "OPERATOR_PORT",
        default_value = "19090",
        help = "Port of the operator admission endpoint"
    )]
    operator_port: u16,

    #[arg(
        long,
        env = "OPERATOR_PATH",
        default_value = "/",
        help = "Path of the operator admission endpoint"
    )]
    operator_path: String,

    #[arg(long, env = "PORT", default_value = "8080", help = "Local listen port")]
    port: u16,
}

impl RelayArgs {
    fn operator_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.operator_host, self.operator_port, self.operator_path
        )
    }
}

#[derive(Clone)]
struct RelayState {
    operator_url: String,
    http: reqwest::Client,
}

/// Forward one inbound request to the operator.
#[handler]
async fn forward(state: Data<&RelayState>) -> Response {
    info!("Received request for a pool unit");

    let upstream = match state
        .http
        .post(&state.operator_url)
        .body("Request")
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            error!("Could not contact operator: {err}");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body("Could not contact operator.\n");
        }
    };

    let code = upstream.status().as_u16();
    info!(code, "Received response from operator");
    let (status, body) = map_upstream_status(code);
    Response::builder().status(status).body(body)
}

/// Translate the operator's status into the fixed responses external
/// callers see. Unmapped statuses pass through with an empty body.
fn map_upstream_status(code: u16) -> (StatusCode, &'static str) {
    match code {
        200 => (StatusCode::OK, "Spinning up pool unit...\n"),
        500 => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to schedule a pool unit.\n",
        ),
        404 => (
            StatusCode::NOT_FOUND,
            "No resources currently available. Try again later.\n",
        ),
        other => (
            StatusCode::from_u16(other).unwrap_or(StatusCode::BAD_GATEWAY),
            "",
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = RelayArgs::parse();
    let state = RelayState {
        operator_url: args.operator_url(),
        http: reqwest::Client::new(),
    };

    let listen_addr = format!("0.0.0.0:{}", args.port);
    info!(
        operator = %state.operator_url,
        "Starting relay on {listen_addr}"
    );

    let app = Route::new().at("/", forward).data(state);
    Server::new(TcpListener::bind(listen_addr)).run(app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_the_three_known_statuses() {
        assert_eq!(
            map_upstream_status(200),
            (StatusCode::OK, "Spinning up pool unit...\n")
        );
        assert_eq!(
            map_upstream_status(500),
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to schedule a pool unit.\n"
            )
        );
        assert_eq!(
            map_upstream_status(404),
            (
                StatusCode::NOT_FOUND,
                "No resources currently available. Try again later.\n"
            )
        );
    }

    #[test]
    fn passes_other_statuses_through_with_empty_body() {
        assert_eq!(map_upstream_status(202), (StatusCode::ACCEPTED, ""));
        assert_eq!(map_upstream_status(400), (StatusCode::BAD_REQUEST, ""));
    }

    #[test]
    fn operator_url_is_assembled_from_parts() {
        let args = RelayArgs {
            operator_host: "operator.svc".to_string(),
            operator_port: 19090,
            operator_path: "/".to_string(),
            port: 8080,
        };
        assert_eq!(args.operator_url(), "http://operator.svc:19090/");
    }
}
