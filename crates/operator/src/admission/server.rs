//! HTTP admission endpoint.

use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::web::Data;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::AdmissionDecision;
use super::AdmissionScheduler;

/// Response body when no inactive record is available.
pub const BUSY_BODY: &str = "All resources in use. Try again later.\n";

/// Errors that can occur while serving the admission endpoint.
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("admission server failed: {message}")]
    ServerError { message: String },
}

impl core::error::Error for ApiError {}

/// HTTP server exposing the admission scheduler.
pub struct AdmissionServer {
    scheduler: Arc<AdmissionScheduler>,
    listen_addr: String,
}

impl AdmissionServer {
    pub fn new(scheduler: Arc<AdmissionScheduler>, listen_addr: String) -> Self {
        Self {
            scheduler,
            listen_addr,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting admission server on {}", self.listen_addr);

        let app = routes(self.scheduler);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("Admission server stopped normally");
                        Ok(())
                    }
                    Err(err) => {
                        error!("Admission server failed: {err}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("server failed: {err}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("Admission server shutdown requested");
                Ok(())
            }
        }
    }
}

fn routes(scheduler: Arc<AdmissionScheduler>) -> impl poem::Endpoint {
    Route::new()
        .at("/", post(schedule_unit))
        .at("/healthz", get(healthz))
        .data(scheduler)
        .with(Tracing)
}

/// Activate one pool unit on behalf of an external caller.
#[handler]
async fn schedule_unit(scheduler: Data<&Arc<AdmissionScheduler>>) -> Response {
    match scheduler.schedule().await {
        Ok(AdmissionDecision::Accepted(id)) => {
            info!(unit = %id, "admission request accepted");
            Response::builder().status(StatusCode::ACCEPTED).finish()
        }
        Ok(AdmissionDecision::Busy) => Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(BUSY_BODY),
        Err(report) => {
            error!("admission scheduling failed: {report:?}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .finish()
        }
    }
}

#[handler]
async fn healthz() -> &'static str {
    "ok"
}
