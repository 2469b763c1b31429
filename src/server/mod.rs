mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Extension, FromRequest, RequestParts},
    http::header::AUTHORIZATION,
    routing::{get, patch, post},
    Router,
};

use crate::server::handlers::{drivers, rides, ws};
use crate::{
    api::API,
    auth::User,
    engine::Engine,
    error::{Error, Result},
};

type DynAPI = Arc<dyn API + Send + Sync>;

/// Requests authenticate with `Authorization: Bearer <jwt>`.
#[async_trait]
impl<B: Send> FromRequest<B> for User {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let Extension(engine) = Extension::<Arc<Engine>>::from_request(req)
            .await
            .map_err(|err| Error::Unexpected(err.to_string()))?;

        let token = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(Error::Unauthorized)?;

        engine.authenticate(token).await
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    let api = engine.clone() as DynAPI;

    Router::new()
        .route("/rides", post(rides::create))
        .route("/rides/:id", get(rides::find))
        .route("/rides/:id/events", get(rides::events))
        .route("/rides/:id/cancel", patch(rides::cancel))
        .route("/rides/:id/en_route", patch(rides::confirm_en_route))
        .route("/rides/:id/start", patch(rides::start))
        .route("/rides/:id/complete", patch(rides::complete))
        .route("/drivers", post(drivers::create))
        .route("/drivers/:id", get(drivers::find))
        .route("/drivers/:id/online", patch(drivers::go_online))
        .route("/drivers/:id/offline", patch(drivers::go_offline))
        .route("/drivers/:id/location", patch(drivers::update_location))
        .route("/ws/driver", get(ws::driver))
        .route("/ws/passenger", get(ws::passenger))
        .layer(Extension(api))
        .layer(Extension(engine))
}

/// Serves until Ctrl-C, then shuts the engine down so live sockets close too.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> Result<()> {
    let app = router(engine.clone());

    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(engine))
        .await
        .map_err(|err| Error::Unexpected(err.to_string()))
}

async fn shutdown_signal(engine: Arc<Engine>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }

    tracing::info!("shutting down");
    engine.shutdown();
}
