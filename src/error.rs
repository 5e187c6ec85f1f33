use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid request: {message}"))]
    Validation { message: String },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Failed to persist message"))]
    Persistence {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Failed to publish to {topic}: {message}"))]
    PublishFailure { topic: String, message: String },

    #[snafu(display("Publisher is closed"))]
    PublisherClosed,

    #[snafu(display("Status updater is closed"))]
    UpdaterClosed,

    #[snafu(display("Failed to decode payload: {message}"))]
    Decode { message: String },

    #[snafu(display("No stored message matches the consumed record"))]
    Resolution { content: String },

    #[snafu(display("Failed to update message {message_id}"))]
    Processing {
        message_id: i64,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("Too many requests from {ip}"))]
    RateLimited { ip: String },

    #[snafu(display("{ip} is temporarily blocked"))]
    Blocked { ip: String },

    #[snafu(display("Broker error: {message}"))]
    Broker { message: String, fatal: bool },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode {
            message: e.to_string(),
        }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn message_not_found(id: i64) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal_broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            fatal: true,
        }
    }

    /// Whether the consumer loop must stop instead of reclaiming.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Broker { fatal: true, .. })
    }
}

/// `{code, message}` JSON body shared by error responses and plain status replies.
#[derive(Debug, Serialize, serde::Deserialize)]
pub struct StatusBody {
    pub code: u16,
    pub message: String,
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::Decode { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Persistence { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::PublisherClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Blocked { .. } => StatusCode::FORBIDDEN,

            Self::Sqlx { .. }
            | Self::Migration { .. }
            | Self::PublishFailure { .. }
            | Self::UpdaterClosed
            | Self::Resolution { .. }
            | Self::Processing { .. }
            | Self::Broker { .. }
            | Self::InternalServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(StatusBody {
            code: status.as_u16(),
            message: self.to_string(),
        })
    }
}
