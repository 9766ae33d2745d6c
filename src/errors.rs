use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Unexpected status code {0}")]
    Status(u16),
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

impl Error {
    /// Errors after which the HTTP session should be rebuilt before retrying.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Timeout | Error::Connection(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else if e.is_connect() {
            Error::Connection(e.to_string())
        } else {
            Error::Http(e)
        }
    }
}
