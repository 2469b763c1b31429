mod dispatch;
mod driver_api;
mod lifecycle;
mod ride_api;

use dashmap::DashMap;
use oso::Oso;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    api::API,
    auth::{authorizor, AuthValidator, User},
    broker::{DynPublisher, Event, InMemoryBroker, Topic},
    config::{DispatchConfig, Timeouts},
    connection::ConnectionRegistry,
    db::Store,
    error::{Error, Result},
    external::GeoCoder,
};

use lifecycle::Lifecycle;

pub struct Engine {
    store: Store,
    drivers: Arc<ConnectionRegistry>,
    passengers: Arc<ConnectionRegistry>,
    lifecycle: Lifecycle,
    publisher: DynPublisher,
    validator: Arc<dyn AuthValidator>,
    geocoder: Option<Arc<dyn GeoCoder>>,
    authorizor: Oso,
    timeouts: Timeouts,
    dispatch: DispatchConfig,
    searches: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

impl Engine {
    #[tracing::instrument(name = "Engine::new", skip_all)]
    pub fn new(
        store: Store,
        publisher: DynPublisher,
        validator: Arc<dyn AuthValidator>,
        timeouts: Timeouts,
        dispatch: DispatchConfig,
    ) -> Result<Self> {
        let drivers = Arc::new(ConnectionRegistry::new("drivers"));
        let passengers = Arc::new(ConnectionRegistry::new("passengers"));
        let shutdown = CancellationToken::new();
        let lifecycle = Lifecycle::new(
            store.clone(),
            drivers.clone(),
            passengers.clone(),
            publisher.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            store,
            drivers,
            passengers,
            lifecycle,
            publisher,
            validator,
            geocoder: None,
            authorizor: authorizor::new()?,
            timeouts,
            dispatch,
            searches: DashMap::new(),
            shutdown,
        })
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn GeoCoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn drivers(&self) -> &ConnectionRegistry {
        &self.drivers
    }

    pub fn passengers(&self) -> &ConnectionRegistry {
        &self.passengers
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn authorize<Actor, Action, Resource>(
        &self,
        actor: Actor,
        action: Action,
        resource: Resource,
    ) -> Result<()>
    where
        Actor: oso::ToPolar,
        Action: oso::ToPolar,
        Resource: oso::ToPolar,
    {
        if self.authorizor.is_allowed(actor, action, resource)? {
            return Ok(());
        }

        Err(Error::Forbidden)
    }

    /// Validates a bearer token and adds the roles granted since it was issued.
    pub async fn authenticate(&self, token: &str) -> Result<User> {
        let user = self.validator.validate(token)?;
        let granted = self.store.users.roles(user.id).await?;

        Ok(user.with_roles(granted))
    }

    async fn publish(&self, event: impl Into<Event>) -> Result<()> {
        self.publisher.publish(event.into()).await
    }

    /// Spawns the broker consumers: one dispatch task per requested ride, and the
    /// lifecycle's reaction to driver status changes. Consumers stop when the broker
    /// closes.
    pub fn start(self: &Arc<Self>, broker: &InMemoryBroker) -> Vec<JoinHandle<()>> {
        let requests = broker.consumer(Topic::RideRequested);
        let statuses = broker.consumer(Topic::DriverStatusUpdate);

        let dispatcher = {
            let engine = self.clone();
            tokio::spawn(async move {
                while let Ok(event) = requests.recv().await {
                    if let Event::RideRequested(request) = event {
                        let engine = engine.clone();
                        tokio::spawn(async move { engine.run_dispatch(request).await });
                    }
                }
                tracing::info!("ride request consumer stopped");
            })
        };

        let lifecycle = {
            let engine = self.clone();
            tokio::spawn(async move {
                while let Ok(event) = statuses.recv().await {
                    if let Event::DriverStatusUpdate(update) = event {
                        if let Err(err) = engine.lifecycle.on_driver_status(&update).await {
                            tracing::warn!(driver_id = %update.driver_id, error = %err, "driver status update not applied");
                        }
                    }
                }
                tracing::info!("driver status consumer stopped");
            })
        };

        vec![dispatcher, lifecycle]
    }

    /// Stops running searches and location tracking, then closes every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drivers = self.drivers.close_all();
        let passengers = self.passengers.close_all();
        tracing::info!(drivers, passengers, "engine shut down");
    }
}

impl API for Engine {}

#[test]
fn authentication_picks_up_roles_granted_after_issue() {
    use crate::auth::JwtValidator;
    use crate::db::memory::MemoryStore;

    let jwt = Arc::new(JwtValidator::new(b"secret"));
    let engine = Engine::new(
        MemoryStore::new().store(),
        Arc::new(InMemoryBroker::new()),
        jwt.clone(),
        Timeouts::default(),
        DispatchConfig::default(),
    )
    .unwrap();

    let user = User::new(Uuid::new_v4());
    let token = jwt.issue(&user, chrono::Duration::minutes(5)).unwrap();

    tokio_test::block_on(async {
        engine.store.users.assign_role(user.id, "driver").await.unwrap();

        let authenticated = engine.authenticate(&format!("Bearer {token}")).await.unwrap();
        assert_eq!(authenticated.id, user.id);
        assert!(authenticated.has_role("driver".into()));

        assert!(matches!(
            engine.authenticate("Bearer not-a-token").await,
            Err(Error::Unauthorized)
        ));
    });
}
