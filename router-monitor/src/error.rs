use std::io;
use std::num::ParseFloatError;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum DnsmasqError {
    #[error("dns exchange with {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("dns exchange with {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("malformed dns reply: {0}")]
    Malformed(&'static str),
    #[error("dns reply id {got:#06x} does not match query id {want:#06x}")]
    IdMismatch { got: u16, want: u16 },
    #[error("dns server returned rcode {0}")]
    Rcode(u8),
    #[error("unexpected number of argument in record {record}: got {got}, want {want}")]
    FieldCount {
        record: String,
        got: usize,
        want: usize,
    },
    #[error("unexpected number of replies for {record}: got {got}")]
    ReplyCount { record: String, got: usize },
    #[error("invalid number {value:?} in {record}: {source}")]
    Number {
        record: String,
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("failed to read lease file {path}: {source}")]
    LeaseFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("lease line {line}: expected at least {want} fields, got {got}")]
    LeaseFields { line: usize, got: usize, want: usize },
    #[error("lease line {line}: invalid expiry {value:?}")]
    LeaseExpiry { line: usize, value: String },
}

/// Reasons a scrape returns no document.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("flow counter table unreadable: {0:#}")]
    FlowTable(anyhow::Error),
    #[error(transparent)]
    Dnsmasq(#[from] DnsmasqError),
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] std::fmt::Error),
}

impl IntoResponse for ScrapeError {
    fn into_response(self) -> Response {
        error!(error = %self, "scrape failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_error_maps_to_500_with_text() {
        let err = ScrapeError::from(DnsmasqError::FieldCount {
            record: "servers.bind.".to_string(),
            got: 2,
            want: 3,
        });
        assert_eq!(
            err.to_string(),
            "unexpected number of argument in record servers.bind.: got 2, want 3"
        );
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
