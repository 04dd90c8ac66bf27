use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request to {0} failed")]
    Request(#[source] reqwest_middleware::Error),
    #[error("{0} returned {1:?}")]
    Status(String, Option<StatusCode>),
    #[error("{0} was not found")]
    NotFound(String),
    #[error("failed to decode JSON from {0}: {1}")]
    Decode(String, #[source] serde_json::Error),
}
