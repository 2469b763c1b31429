use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use geo_types::Geometry;
use geozero::wkb;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{types::Json, Executor, Pool, Postgres, Row};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    current_transaction, CoordinateRepo, DriverRepo, NearbyDriver, RideRepo, SessionRepo, Store,
    Transaction, TransactionManager, TxBackend, TxOptions, UserRepo,
};
use crate::entities::{
    Coordinates, Driver, DriverSession, DriverStatus, Location, Ride, RideEvent, RideStatus,
    RideType,
};
use crate::error::{driver_not_found, ride_not_found, Error, Result};

type Database = Postgres;
type PgQuery<'q> = Query<'q, Database, PgArguments>;

const SCHEMA: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS postgis",
    "CREATE TABLE IF NOT EXISTS drivers (id UUID PRIMARY KEY, license_number VARCHAR NOT NULL UNIQUE, vehicle_class VARCHAR NOT NULL, status VARCHAR NOT NULL, data JSONB NOT NULL)",
    "CREATE TABLE IF NOT EXISTS driver_sessions (id UUID PRIMARY KEY, driver_id UUID NOT NULL REFERENCES drivers(id), started_at TIMESTAMPTZ NOT NULL, ended_at TIMESTAMPTZ, total_rides INT8 NOT NULL DEFAULT 0, total_earnings FLOAT8 NOT NULL DEFAULT 0)",
    "CREATE UNIQUE INDEX IF NOT EXISTS driver_sessions_one_open ON driver_sessions (driver_id) WHERE ended_at IS NULL",
    "CREATE TABLE IF NOT EXISTS driver_locations (driver_id UUID PRIMARY KEY, location geometry(Point, 4326) NOT NULL, data JSONB NOT NULL, updated_at TIMESTAMPTZ NOT NULL)",
    "CREATE TABLE IF NOT EXISTS coordinates (id BIGSERIAL PRIMARY KEY, driver_id UUID NOT NULL, ride_id UUID, location geometry(Point, 4326) NOT NULL, data JSONB NOT NULL, recorded_at TIMESTAMPTZ NOT NULL)",
    "CREATE TABLE IF NOT EXISTS rides (id UUID PRIMARY KEY, number VARCHAR NOT NULL UNIQUE, status VARCHAR NOT NULL, passenger_id UUID NOT NULL, driver_id UUID, matched_at TIMESTAMPTZ, arrived_at TIMESTAMPTZ, started_at TIMESTAMPTZ, completed_at TIMESTAMPTZ, cancelled_at TIMESTAMPTZ, data JSONB NOT NULL)",
    "CREATE INDEX IF NOT EXISTS rides_driver_status ON rides (driver_id, status)",
    "CREATE TABLE IF NOT EXISTS ride_events (id UUID PRIMARY KEY, ride_id UUID NOT NULL REFERENCES rides(id), event_type VARCHAR NOT NULL, from_status VARCHAR, to_status VARCHAR NOT NULL, payload JSONB NOT NULL, created_at TIMESTAMPTZ NOT NULL)",
    "CREATE TABLE IF NOT EXISTS ride_counters (day DATE PRIMARY KEY, value INT4 NOT NULL)",
    "CREATE TABLE IF NOT EXISTS user_roles (user_id UUID NOT NULL, role VARCHAR NOT NULL, PRIMARY KEY (user_id, role))",
];

pub struct PgTransaction {
    inner: Mutex<Option<sqlx::Transaction<'static, Database>>>,
}

fn finished_error() -> Error {
    Error::Unexpected("transaction already finished".into())
}

impl PgTransaction {
    async fn execute_raw(&self, sql: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(finished_error)?;
        tx.execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("SAVEPOINT {name}")).await
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("ROLLBACK TO SAVEPOINT {name}")).await
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("RELEASE SAVEPOINT {name}")).await
    }

    async fn commit(&self) -> Result<()> {
        let tx = self.inner.lock().await.take().ok_or_else(finished_error)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.inner.lock().await.take().ok_or_else(finished_error)?;
        tx.rollback().await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Database>,
}

#[async_trait]
impl TxBackend for PgStore {
    #[tracing::instrument(skip(self))]
    async fn begin(&self, options: TxOptions) -> Result<Arc<dyn Transaction>> {
        let mut tx = self.pool.begin().await?;

        if let Some(isolation) = options.isolation {
            tx.execute(format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()).as_str())
                .await?;
        }
        if options.read_only {
            tx.execute("SET TRANSACTION READ ONLY").await?;
        }

        Ok(Arc::new(PgTransaction {
            inner: Mutex::new(Some(tx)),
        }))
    }
}

impl PgStore {
    pub async fn connect(db_uri: &str, max_connections: u32) -> Result<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_uri)
            .await?;

        // TODO: move this to sqlx migrations once the schema settles
        for statement in SCHEMA {
            pool.execute(*statement).await?;
        }

        Ok(Arc::new(Self { pool }))
    }

    pub fn store(self: &Arc<Self>) -> Store {
        Store {
            drivers: self.clone(),
            rides: self.clone(),
            sessions: self.clone(),
            coordinates: self.clone(),
            users: self.clone(),
            tx: TransactionManager::new(self.clone()),
        }
    }

    fn transaction(&self) -> Option<Arc<dyn Transaction>> {
        current_transaction().filter(|tx| tx.as_any().is::<PgTransaction>())
    }

    /// Runs on the task's open transaction when there is one, otherwise on the pool.
    async fn execute(&self, query: PgQuery<'_>) -> Result<u64> {
        if let Some(tx) = self.transaction() {
            if let Some(pg) = tx.as_any().downcast_ref::<PgTransaction>() {
                let mut guard = pg.inner.lock().await;
                let conn = guard.as_mut().ok_or_else(finished_error)?;
                return Ok(conn.execute(query).await?.rows_affected());
            }
        }

        Ok(self.pool.execute(query).await?.rows_affected())
    }

    async fn fetch_optional(&self, query: PgQuery<'_>) -> Result<Option<PgRow>> {
        if let Some(tx) = self.transaction() {
            if let Some(pg) = tx.as_any().downcast_ref::<PgTransaction>() {
                let mut guard = pg.inner.lock().await;
                let conn = guard.as_mut().ok_or_else(finished_error)?;
                return Ok(conn.fetch_optional(query).await?);
            }
        }

        Ok(self.pool.fetch_optional(query).await?)
    }

    async fn fetch_all(&self, query: PgQuery<'_>) -> Result<Vec<PgRow>> {
        if let Some(tx) = self.transaction() {
            if let Some(pg) = tx.as_any().downcast_ref::<PgTransaction>() {
                let mut guard = pg.inner.lock().await;
                let conn = guard.as_mut().ok_or_else(finished_error)?;
                return Ok(conn.fetch_all(query).await?);
            }
        }

        Ok(self.pool.fetch_all(query).await?)
    }
}

#[async_trait]
impl DriverRepo for PgStore {
    #[tracing::instrument(skip(self, driver), fields(driver_id = %driver.id))]
    async fn create(&self, driver: &Driver) -> Result<()> {
        self.execute(
            sqlx::query(
                "INSERT INTO drivers (id, license_number, vehicle_class, status, data) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(driver.id)
            .bind(&driver.license_number)
            .bind(driver.vehicle_class.name())
            .bind(driver.status.name())
            .bind(Json(driver)),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Driver> {
        let row = self
            .fetch_optional(sqlx::query("SELECT status, data FROM drivers WHERE id = $1").bind(id))
            .await?
            .ok_or_else(|| driver_not_found(&id))?;

        let status: String = row.try_get("status")?;
        let Json(mut driver): Json<Driver> = row.try_get("data")?;
        driver.status = status.parse()?;

        Ok(driver)
    }

    async fn license_exists(&self, license_number: &str) -> Result<bool> {
        let row = self
            .fetch_optional(
                sqlx::query("SELECT 1 AS found FROM drivers WHERE license_number = $1")
                    .bind(license_number),
            )
            .await?;

        Ok(row.is_some())
    }

    #[tracing::instrument(skip(self))]
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: DriverStatus,
        new: DriverStatus,
    ) -> Result<DriverStatus> {
        // one statement: lock the row, remember the old status, write only on a match
        let query = "
            WITH previous AS (
                SELECT id, status FROM drivers WHERE id = $1 FOR UPDATE
            ), updated AS (
                UPDATE drivers d
                SET status = $3, data = jsonb_set(d.data, '{status}', to_jsonb($3::text))
                FROM previous p
                WHERE d.id = p.id AND p.status = $2
                RETURNING d.id
            )
            SELECT status FROM previous
        ";

        let status: String = self
            .fetch_optional(
                sqlx::query(query)
                    .bind(id)
                    .bind(expected.name())
                    .bind(new.name()),
            )
            .await?
            .ok_or_else(|| driver_not_found(&id))?
            .try_get("status")?;

        status.parse()
    }

    #[tracing::instrument(skip(self))]
    async fn find_available_nearby(
        &self,
        pickup: &Coordinates,
        vehicle_class: RideType,
        max_distance_km: f64,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>> {
        let origin: Geometry<f64> = (*pickup).into();

        let query = "
            SELECT
                d.data AS driver,
                l.data AS location,
                ST_Distance(l.location::geography, ST_SetSRID($1, 4326)::geography) / 1000.0 AS distance_km
            FROM
                drivers d
                JOIN driver_locations l ON d.id = l.driver_id
            WHERE
                d.status = 'AVAILABLE'
                AND d.vehicle_class = $2
                AND ST_DWithin(l.location::geography, ST_SetSRID($1, 4326)::geography, $3)
            ORDER BY
                distance_km ASC
            LIMIT $4
        ";

        let rows = self
            .fetch_all(
                sqlx::query(query)
                    .bind(wkb::Encode(origin))
                    .bind(vehicle_class.name())
                    .bind(max_distance_km * 1000.0)
                    .bind(limit as i64),
            )
            .await?;

        let mut nearby = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let Json(mut driver): Json<Driver> = row.try_get("driver")?;
            let Json(location): Json<Location> = row.try_get("location")?;
            let distance_km: f64 = row.try_get("distance_km")?;

            driver.status = DriverStatus::Available;
            nearby.push(NearbyDriver {
                driver,
                location,
                distance_km,
            });
        }

        Ok(nearby)
    }

    #[tracing::instrument(skip(self))]
    async fn record_completed_ride(&self, id: Uuid, earnings: f64) -> Result<()> {
        let affected = self
            .execute(
                sqlx::query(
                    "UPDATE drivers SET data = jsonb_set(jsonb_set(data, '{total_rides}', to_jsonb((data->>'total_rides')::int8 + 1)), '{total_earnings}', to_jsonb((data->>'total_earnings')::float8 + $2)) WHERE id = $1",
                )
                .bind(id)
                .bind(earnings),
            )
            .await?;

        if affected == 0 {
            return Err(driver_not_found(&id));
        }

        Ok(())
    }
}

#[async_trait]
impl RideRepo for PgStore {
    #[tracing::instrument(skip(self, ride), fields(ride_id = %ride.id))]
    async fn create(&self, ride: &Ride) -> Result<()> {
        self.execute(
            sqlx::query(
                "INSERT INTO rides (id, number, status, passenger_id, driver_id, data) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(ride.id)
            .bind(&ride.number)
            .bind(ride.status.name())
            .bind(ride.passenger_id)
            .bind(ride.driver_id)
            .bind(Json(ride)),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Ride> {
        let Json(ride): Json<Ride> = self
            .fetch_optional(sqlx::query("SELECT data FROM rides WHERE id = $1").bind(id))
            .await?
            .ok_or_else(|| ride_not_found(&id))?
            .try_get("data")?;

        Ok(ride)
    }

    #[tracing::instrument(skip(self, ride), fields(ride_id = %ride.id, status = %ride.status))]
    async fn save_transition(&self, ride: &Ride, expected: RideStatus) -> Result<bool> {
        let affected = self
            .execute(
                sqlx::query(
                    "UPDATE rides SET status = $2, driver_id = $3, matched_at = $4, arrived_at = $5, started_at = $6, completed_at = $7, cancelled_at = $8, data = $9 WHERE id = $1 AND status = $10",
                )
                .bind(ride.id)
                .bind(ride.status.name())
                .bind(ride.driver_id)
                .bind(ride.matched_at)
                .bind(ride.arrived_at)
                .bind(ride.started_at)
                .bind(ride.completed_at)
                .bind(ride.cancelled_at)
                .bind(Json(ride))
                .bind(expected.name()),
            )
            .await?;

        Ok(affected == 1)
    }

    async fn append_event(&self, event: &RideEvent) -> Result<()> {
        self.execute(
            sqlx::query(
                "INSERT INTO ride_events (id, ride_id, event_type, from_status, to_status, payload, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(event.id)
            .bind(event.ride_id)
            .bind(&event.event_type)
            .bind(event.from_status.map(|s| s.name()))
            .bind(event.to_status.name())
            .bind(&event.payload)
            .bind(event.created_at),
        )
        .await?;

        Ok(())
    }

    async fn events(&self, ride_id: Uuid) -> Result<Vec<RideEvent>> {
        let rows = self
            .fetch_all(
                sqlx::query(
                    "SELECT id, event_type, from_status, to_status, payload, created_at FROM ride_events WHERE ride_id = $1 ORDER BY created_at ASC",
                )
                .bind(ride_id),
            )
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let from_status: Option<String> = row.try_get("from_status")?;
            let to_status: String = row.try_get("to_status")?;

            events.push(RideEvent {
                id: row.try_get("id")?,
                ride_id,
                event_type: row.try_get("event_type")?,
                from_status: from_status.map(|s| s.parse()).transpose()?,
                to_status: to_status.parse()?,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
            });
        }

        Ok(events)
    }

    async fn next_daily_sequence(&self, date: NaiveDate) -> Result<u32> {
        let value: i32 = self
            .fetch_optional(
                sqlx::query(
                    "INSERT INTO ride_counters (day, value) VALUES ($1, 1) ON CONFLICT (day) DO UPDATE SET value = ride_counters.value + 1 RETURNING value",
                )
                .bind(date),
            )
            .await?
            .ok_or_else(|| Error::Unexpected("ride counter returned no row".into()))?
            .try_get("value")?;

        Ok(value as u32)
    }

    async fn find_active_for_driver(&self, driver_id: Uuid) -> Result<Option<Ride>> {
        let row = self
            .fetch_optional(
                sqlx::query(
                    "SELECT data FROM rides WHERE driver_id = $1 AND status IN ('MATCHED', 'EN_ROUTE', 'ARRIVED', 'IN_PROGRESS') LIMIT 1",
                )
                .bind(driver_id),
            )
            .await?;

        match row {
            Some(row) => {
                let Json(ride): Json<Ride> = row.try_get("data")?;
                Ok(Some(ride))
            }
            None => Ok(None),
        }
    }
}

fn session_from_row(row: &PgRow) -> Result<DriverSession> {
    Ok(DriverSession {
        id: row.try_get("id")?,
        driver_id: row.try_get("driver_id")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        total_rides: row.try_get("total_rides")?,
        total_earnings: row.try_get("total_earnings")?,
    })
}

#[async_trait]
impl SessionRepo for PgStore {
    async fn create(&self, session: &DriverSession) -> Result<()> {
        self.execute(
            sqlx::query(
                "INSERT INTO driver_sessions (id, driver_id, started_at, ended_at, total_rides, total_earnings) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(session.id)
            .bind(session.driver_id)
            .bind(session.started_at)
            .bind(session.ended_at)
            .bind(session.total_rides)
            .bind(session.total_earnings),
        )
        .await?;

        Ok(())
    }

    async fn find_open(&self, driver_id: Uuid) -> Result<Option<DriverSession>> {
        self.fetch_optional(
            sqlx::query("SELECT * FROM driver_sessions WHERE driver_id = $1 AND ended_at IS NULL")
                .bind(driver_id),
        )
        .await?
        .as_ref()
        .map(session_from_row)
        .transpose()
    }

    async fn add_ride(&self, session_id: Uuid, earnings: f64) -> Result<()> {
        let affected = self
            .execute(
                sqlx::query(
                    "UPDATE driver_sessions SET total_rides = total_rides + 1, total_earnings = total_earnings + $2 WHERE id = $1",
                )
                .bind(session_id)
                .bind(earnings),
            )
            .await?;

        if affected == 0 {
            return Err(Error::not_found("session", session_id));
        }

        Ok(())
    }

    async fn close(&self, session_id: Uuid, ended_at: DateTime<Utc>) -> Result<DriverSession> {
        let row = self
            .fetch_optional(
                sqlx::query("UPDATE driver_sessions SET ended_at = $2 WHERE id = $1 RETURNING *")
                    .bind(session_id)
                    .bind(ended_at),
            )
            .await?
            .ok_or_else(|| Error::not_found("session", session_id))?;

        session_from_row(&row)
    }
}

#[async_trait]
impl CoordinateRepo for PgStore {
    async fn record(&self, driver_id: Uuid, location: &Location, ride_id: Option<Uuid>) -> Result<()> {
        let point: Geometry<f64> = location.coordinates.into();
        let now = Utc::now();

        self.execute(
            sqlx::query(
                "INSERT INTO coordinates (driver_id, ride_id, location, data, recorded_at) VALUES ($1, $2, ST_SetSRID($3, 4326), $4, $5)",
            )
            .bind(driver_id)
            .bind(ride_id)
            .bind(wkb::Encode(point.clone()))
            .bind(Json(location))
            .bind(now),
        )
        .await?;

        self.execute(
            sqlx::query(
                "INSERT INTO driver_locations (driver_id, location, data, updated_at) VALUES ($1, ST_SetSRID($2, 4326), $3, $4) ON CONFLICT (driver_id) DO UPDATE SET location = EXCLUDED.location, data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
            )
            .bind(driver_id)
            .bind(wkb::Encode(point))
            .bind(Json(location))
            .bind(now),
        )
        .await?;

        Ok(())
    }

    async fn last_known(&self, driver_id: Uuid) -> Result<Location> {
        let Json(location): Json<Location> = self
            .fetch_optional(
                sqlx::query("SELECT data FROM driver_locations WHERE driver_id = $1").bind(driver_id),
            )
            .await?
            .ok_or_else(|| Error::not_found("coordinate", driver_id))?
            .try_get("data")?;

        Ok(location)
    }
}

#[async_trait]
impl UserRepo for PgStore {
    async fn assign_role(&self, user_id: Uuid, role: &str) -> Result<()> {
        self.execute(
            sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(user_id)
                .bind(role),
        )
        .await?;

        Ok(())
    }

    async fn roles(&self, user_id: Uuid) -> Result<Vec<String>> {
        let rows = self
            .fetch_all(sqlx::query("SELECT role FROM user_roles WHERE user_id = $1").bind(user_id))
            .await?;

        let mut roles = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            roles.push(row.try_get("role")?);
        }

        Ok(roles)
    }
}
