use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreKind::Postgres),
            "memory" => Ok(StoreKind::Memory),
            _ => Err(Error::Unexpected(format!("unknown STORE {s}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Timeouts {
    pub offer: Duration,
    pub search: Duration,
    pub search_retry_interval: Duration,
    pub auth_handshake: Duration,
    pub heartbeat_interval: Duration,
    pub idle: Duration,
    pub fanout_deadline: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            offer: Duration::from_secs(30),
            search: Duration::from_secs(120),
            search_retry_interval: Duration::from_secs(5),
            auth_handshake: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            idle: Duration::from_secs(75),
            fanout_deadline: Duration::from_millis(100),
        }
    }
}

impl Timeouts {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            fanout_deadline: self.fanout_deadline,
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle,
            ..ConnectionConfig::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Share of the fare paid out to the driver.
    pub earnings_share: f64,
    pub max_distance_km: f64,
    pub candidate_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            earnings_share: 0.8,
            max_distance_km: 5.0,
            candidate_limit: 20,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GoogleMapsConfig {
    pub api_base: String,
    pub key: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub store: StoreKind,
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    pub google_maps: Option<GoogleMapsConfig>,
    pub timeouts: Timeouts,
    pub dispatch: DispatchConfig,
}

fn var_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Unexpected(format!("{name} has an invalid value: {value}"))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

fn secs(name: &str, default: Duration) -> Result<Duration> {
    var_or(name, default.as_secs()).map(Duration::from_secs)
}

impl Config {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            offer: secs("OFFER_TIMEOUT_SECS", defaults.offer)?,
            search: secs("SEARCH_TIMEOUT_SECS", defaults.search)?,
            search_retry_interval: secs(
                "SEARCH_RETRY_INTERVAL_SECS",
                defaults.search_retry_interval,
            )?,
            auth_handshake: secs("AUTH_HANDSHAKE_TIMEOUT_SECS", defaults.auth_handshake)?,
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            idle: secs("IDLE_TIMEOUT_SECS", defaults.idle)?,
            fanout_deadline: var_or(
                "FANOUT_DEADLINE_MILLIS",
                defaults.fanout_deadline.as_millis() as u64,
            )
            .map(Duration::from_millis)?,
        };

        let dispatch = DispatchConfig {
            earnings_share: var_or("DRIVER_EARNINGS_SHARE", DispatchConfig::default().earnings_share)?,
            max_distance_km: var_or("MAX_SEARCH_DISTANCE_KM", DispatchConfig::default().max_distance_km)?,
            candidate_limit: var_or("CANDIDATE_LIMIT", DispatchConfig::default().candidate_limit)?,
        };

        let google_maps = match (env::var("GOOGLE_MAPS_API_BASE"), env::var("GOOGLE_MAPS_API_KEY")) {
            (Ok(api_base), Ok(key)) => Some(GoogleMapsConfig { api_base, key }),
            _ => None,
        };

        let store: StoreKind = var_or("STORE", StoreKind::Postgres)?;
        let database_url = env::var("DATABASE_URL").ok();
        if store == StoreKind::Postgres && database_url.is_none() {
            return Err(env::VarError::NotPresent.into());
        }

        Ok(Self {
            database_url,
            database_max_connections: var_or("DATABASE_MAX_CONNECTIONS", 5)?,
            store,
            listen_addr: var_or("LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            jwt_secret: env::var("JWT_SECRET")?,
            google_maps,
            timeouts,
            dispatch,
        })
    }
}

#[test]
fn store_kind_parses_case_insensitively() {
    assert_eq!("Memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
    assert_eq!("postgres".parse::<StoreKind>().unwrap(), StoreKind::Postgres);
    assert!("sqlite".parse::<StoreKind>().is_err());
}

#[test]
fn connection_config_follows_timeouts() {
    let timeouts = Timeouts {
        heartbeat_interval: Duration::from_secs(45),
        idle: Duration::from_secs(90),
        ..Timeouts::default()
    };

    let config = timeouts.connection();
    assert_eq!(config.heartbeat_interval, Duration::from_secs(45));
    assert_eq!(config.idle_timeout, Duration::from_secs(90));
    assert_eq!(config.fanout_deadline, Duration::from_millis(100));
}
