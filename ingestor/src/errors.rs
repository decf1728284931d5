use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed data for device {device}: field '{field}' has non-numeric value {value}")]
    MalformedData {
        device: String,
        field: String,
        value: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(device: &str, field: &str, value: impl ToString) -> Self {
        Error::MalformedData {
            device: device.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    /// Short label used for logs and the failure counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Auth(_) => "auth",
            Error::Upstream { .. } => "upstream",
            Error::Protocol(_) => "protocol",
            Error::MalformedData { .. } => "malformed_data",
            Error::Config(_) => "config",
            Error::Http(_) => "http",
            Error::Database(_) | Error::Migration(_) => "database",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Auth("denied".to_string()).kind(), "auth");
        assert_eq!(
            Error::Upstream {
                status: 503,
                body: "busy".to_string()
            }
            .kind(),
            "upstream"
        );
        assert_eq!(Error::malformed("AA:BB", "co2", "\"n/a\"").kind(), "malformed_data");
    }

    #[test]
    fn test_malformed_message_names_device_and_field() {
        let msg = Error::malformed("AA:BB", "co2", "\"n/a\"").to_string();
        assert!(msg.contains("AA:BB"));
        assert!(msg.contains("co2"));
    }
}
