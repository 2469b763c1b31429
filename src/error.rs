use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::env;
use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // infrastructure (1..=99)
    #[error("environment variable error: {0}")]
    Env(#[from] env::VarError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("{source}; rollback also failed: {rollback}")]
    Transaction {
        source: Box<Error>,
        rollback: Box<Error>,
    },

    #[error("{action}: {source}")]
    Context {
        action: String,
        source: Box<Error>,
    },

    #[error("unexpected error: {0}")]
    Unexpected(String),

    // client-facing (100+)
    #[error("invalid input")]
    InvalidInput,

    #[error("invalid license number format")]
    InvalidLicenseFormat,

    #[error("license number already registered")]
    LicenseAlreadyRegistered,

    #[error("driver is already online")]
    DriverAlreadyOnline,

    #[error("driver is already offline")]
    DriverAlreadyOffline,

    #[error("driver is not available")]
    DriverNotAvailable,

    #[error("ride in status {status} does not accept {event}")]
    InvalidRideTransition { status: String, event: String },

    #[error("driver is not assigned to this ride")]
    DriverRideMismatch,

    #[error("ride cannot be cancelled")]
    RideCannotBeCancelled,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("no driver accepted the ride before the search timed out")]
    DriverSearchTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Self::Unexpected(_) => 0,
            Self::Env(_) => 1,
            Self::Database(_) => 2,
            Self::Upstream(_) => 3,
            Self::Serialization(_) => 4,
            Self::Broker(_) => 5,
            Self::Connection(_) => 6,
            Self::Authorization(_) => 7,
            Self::Transaction { source, .. } => source.code(),
            Self::Context { source, .. } => source.code(),
            Self::InvalidInput => 100,
            Self::InvalidLicenseFormat => 101,
            Self::LicenseAlreadyRegistered => 102,
            Self::DriverAlreadyOnline => 103,
            Self::DriverAlreadyOffline => 104,
            Self::DriverNotAvailable => 105,
            Self::InvalidRideTransition { .. } => 106,
            Self::DriverRideMismatch => 107,
            Self::RideCannotBeCancelled => 108,
            Self::NotFound { .. } => 109,
            Self::DriverSearchTimeout => 110,
            Self::Cancelled => 111,
            Self::Unauthorized => 112,
            Self::Forbidden => 113,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Context { source, .. } | Self::Transaction { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Infrastructure failures are the only errors worth retrying or alerting on;
    /// everything with a client-facing code is a deterministic answer.
    pub fn is_transient(&self) -> bool {
        (1..=99).contains(&self.code())
    }

    /// Strips `Context` and `Transaction` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } | Self::Transaction { source, .. } => source.root(),
            other => other,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.root() {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::LicenseAlreadyRegistered
            | Self::DriverAlreadyOnline
            | Self::DriverAlreadyOffline
            | Self::DriverNotAvailable
            | Self::InvalidRideTransition { .. }
            | Self::RideCannotBeCancelled => StatusCode::CONFLICT,
            Self::DriverSearchTimeout => StatusCode::REQUEST_TIMEOUT,
            other if other.is_transient() || other.code() == 0 => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<oso::OsoError> for Error {
    fn from(err: oso::OsoError) -> Self {
        Self::Authorization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(_: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, "request failed");
                "Internal Server Error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "code": self.code(),
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Attaches the failing action (and the ids involved) to infrastructure errors.
/// Typed domain errors pass through untouched so callers can still match on them.
pub trait ErrorContext<T> {
    fn context(self, action: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn context(self, action: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|err| {
            if err.is_transient() {
                Error::Context {
                    action: action(),
                    source: Box::new(err),
                }
            } else {
                err
            }
        })
    }
}

pub fn ride_not_found(id: &Uuid) -> Error {
    Error::not_found("ride", id)
}

pub fn driver_not_found(id: &Uuid) -> Error {
    Error::not_found("driver", id)
}

#[test]
fn context_wraps_only_infrastructure_errors() {
    let wrapped: Result<()> = Err(Error::Broker("queue closed".into()));
    let err = wrapped.context(|| "publish ride_requested".into()).unwrap_err();
    assert_eq!(err.to_string(), "publish ride_requested: broker error: queue closed");
    assert_eq!(err.code(), 5);

    let domain: Result<()> = Err(Error::RideCannotBeCancelled);
    let err = domain.context(|| "cancel ride".into()).unwrap_err();
    assert!(matches!(err, Error::RideCannotBeCancelled));
}

#[test]
fn transaction_error_keeps_original_code() {
    let err = Error::Transaction {
        source: Box::new(Error::DriverRideMismatch),
        rollback: Box::new(Error::Unexpected("connection reset".into())),
    };

    assert_eq!(err.code(), 107);
    assert!(matches!(err.root(), Error::DriverRideMismatch));
    assert!(err.to_string().contains("rollback also failed"));
}

#[test]
fn not_found_maps_to_404() {
    let err = Error::Context {
        action: "load ride".into(),
        source: Box::new(ride_not_found(&Uuid::nil())),
    };

    assert!(err.is_not_found());
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
}
