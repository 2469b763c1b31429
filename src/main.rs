use std::sync::Arc;

use vectura::auth::JwtValidator;
use vectura::broker::InMemoryBroker;
use vectura::config::{Config, StoreKind};
use vectura::db::{memory::MemoryStore, postgres::PgStore};
use vectura::engine::Engine;
use vectura::error::{Error, Result};
use vectura::external::GoogleMaps;
use vectura::{logging, server};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    logging::init(logging::LogFormat::from_env());

    let store = match config.store {
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| Error::Unexpected("DATABASE_URL is not set".into()))?;
            PgStore::connect(url, config.database_max_connections)
                .await?
                .store()
        }
        StoreKind::Memory => {
            tracing::warn!("using the in-memory store, nothing will be persisted");
            MemoryStore::new().store()
        }
    };

    let broker = Arc::new(InMemoryBroker::new());
    let validator = Arc::new(JwtValidator::new(config.jwt_secret.as_bytes()));

    let mut engine = Engine::new(
        store,
        broker.clone(),
        validator,
        config.timeouts.clone(),
        config.dispatch.clone(),
    )?;
    if let Some(maps) = &config.google_maps {
        engine = engine.with_geocoder(Arc::new(GoogleMaps::new(&maps.api_base, &maps.key)));
    }
    let engine = Arc::new(engine);

    let consumers = engine.start(&broker);

    server::serve(engine.clone(), config.listen_addr).await?;

    broker.close();
    futures::future::join_all(consumers).await;
    tracing::info!("stopped");

    Ok(())
}
