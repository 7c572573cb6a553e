//! Mapping of non-success statuses to backend errors.

use crate::context::ContextResponse;
use crate::error::FrameError;
use crate::headers::{ContextHeader, ResponseHeader};
use crate::response::{Response, ResponseHeaders};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Status codes that carry meaning for the client
pub mod status_codes {
    /// OK
    pub const OK: u32 = 200;
    /// Bad request
    pub const BAD_REQUEST: u32 = 400;
    /// Unauthorized
    pub const UNAUTHORIZED: u32 = 401;
    /// Forbidden
    pub const FORBIDDEN: u32 = 403;
    /// Not found
    pub const NOT_FOUND: u32 = 404;
    /// Method not allowed
    pub const METHOD_NOT_ALLOWED: u32 = 405;
    /// Request timeout
    pub const REQUEST_TIMEOUT: u32 = 408;
    /// Conflict
    pub const CONFLICT: u32 = 409;
    /// Gone
    pub const GONE: u32 = 410;
    /// Precondition failed
    pub const PRECONDITION_FAILED: u32 = 412;
    /// Request entity too large
    pub const REQUEST_ENTITY_TOO_LARGE: u32 = 413;
    /// Locked
    pub const LOCKED: u32 = 423;
    /// Too many requests
    pub const TOO_MANY_REQUESTS: u32 = 429;
    /// Retry with
    pub const RETRY_WITH: u32 = 449;
    /// Internal server error
    pub const INTERNAL_SERVER_ERROR: u32 = 500;
    /// Service unavailable
    pub const SERVICE_UNAVAILABLE: u32 = 503;
}

/// Sub-status codes that refine a Gone status
pub mod sub_status_codes {
    /// Name cache is stale
    pub const NAME_CACHE_IS_STALE: u32 = 1000;
    /// Partition key range is gone
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    /// Split in progress
    pub const COMPLETING_SPLIT: u32 = 1007;
    /// Partition migration in progress
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
}

/// Classification of a non-success status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 400
    BadRequest,
    /// 401
    Unauthorized,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 405
    MethodNotAllowed,
    /// 408
    RequestTimeout,
    /// 409
    Conflict,
    /// 410 without a recognized sub-status
    Gone,
    /// 410 / 1000: stale name cache
    InvalidPartition,
    /// 410 / 1002
    PartitionKeyRangeGone,
    /// 410 / 1007
    CompletingSplit,
    /// 410 / 1008
    CompletingPartitionMigration,
    /// 412
    PreconditionFailed,
    /// 413
    RequestEntityTooLarge,
    /// 423
    Locked,
    /// 429
    TooManyRequests,
    /// 449
    RetryWith,
    /// 500
    InternalServerError,
    /// 503
    ServiceUnavailable,
    /// Any other non-success status
    Other(u32),
}

impl ErrorKind {
    /// Classify a status. Returns `None` for 2xx.
    #[must_use]
    pub fn from_status(status_code: u32, sub_status: u32) -> Option<Self> {
        use status_codes::*;

        if (200..300).contains(&status_code) {
            return None;
        }

        Some(match status_code {
            BAD_REQUEST => Self::BadRequest,
            UNAUTHORIZED => Self::Unauthorized,
            FORBIDDEN => Self::Forbidden,
            NOT_FOUND => Self::NotFound,
            METHOD_NOT_ALLOWED => Self::MethodNotAllowed,
            REQUEST_TIMEOUT => Self::RequestTimeout,
            CONFLICT => Self::Conflict,
            GONE => Self::gone(sub_status),
            PRECONDITION_FAILED => Self::PreconditionFailed,
            REQUEST_ENTITY_TOO_LARGE => Self::RequestEntityTooLarge,
            LOCKED => Self::Locked,
            TOO_MANY_REQUESTS => Self::TooManyRequests,
            RETRY_WITH => Self::RetryWith,
            INTERNAL_SERVER_ERROR => Self::InternalServerError,
            SERVICE_UNAVAILABLE => Self::ServiceUnavailable,
            other => Self::Other(other),
        })
    }

    fn gone(sub_status: u32) -> Self {
        use sub_status_codes::*;

        match sub_status {
            NAME_CACHE_IS_STALE => Self::InvalidPartition,
            PARTITION_KEY_RANGE_GONE => Self::PartitionKeyRangeGone,
            COMPLETING_SPLIT => Self::CompletingSplit,
            COMPLETING_PARTITION_MIGRATION => Self::CompletingPartitionMigration,
            _ => Self::Gone,
        }
    }

    /// Whether this is one of the 410 classifications
    #[must_use]
    pub fn is_gone(self) -> bool {
        matches!(
            self,
            Self::Gone
                | Self::InvalidPartition
                | Self::PartitionKeyRangeGone
                | Self::CompletingSplit
                | Self::CompletingPartitionMigration
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(status) => write!(f, "unexpected status {status}"),
            kind => write!(f, "{kind:?}"),
        }
    }
}

/// A non-success response surfaced to the caller
#[derive(Debug, Clone, Error)]
#[error("{kind} (status {status_code}, sub-status {sub_status}, activity {activity_id})")]
pub struct BackendError {
    /// Classification
    pub kind: ErrorKind,
    /// Status code
    pub status_code: u32,
    /// Sub-status; zero when absent
    pub sub_status: u32,
    /// Correlation id of the failed request
    pub activity_id: Uuid,
    /// Error body returned by the backend
    pub body: Option<Bytes>,
    /// Partition key range the backend reported
    pub partition_key_range_id: Option<String>,
    /// LSN the backend reported
    pub lsn: Option<i64>,
    /// Collection partition index
    pub partition_index: Option<u32>,
    /// Collection service index
    pub service_index: Option<u32>,
    /// Suggested retry delay
    pub retry_after: Option<Duration>,
    /// All response headers
    pub headers: ResponseHeaders,
}

impl BackendError {
    /// Build from a non-success data response
    pub fn from_response(response: &Response, server_version: &str) -> Result<Self, FrameError> {
        let headers = response.headers();
        let sub_status = response.sub_status()?;
        let status_code = response.status_code();

        Ok(Self {
            kind: ErrorKind::from_status(status_code, sub_status)
                .unwrap_or(ErrorKind::Other(status_code)),
            status_code,
            sub_status,
            activity_id: response.activity_id(),
            body: response.payload().cloned(),
            partition_key_range_id: headers
                .get(ResponseHeader::PartitionKeyRangeId)
                .as_str()?
                .map(str::to_string),
            lsn: headers.get(ResponseHeader::Lsn).as_i64()?,
            partition_index: headers.get(ResponseHeader::CollectionPartitionIndex).as_u32()?,
            service_index: headers.get(ResponseHeader::CollectionServiceIndex).as_u32()?,
            retry_after: headers
                .get(ResponseHeader::RetryAfterMilliseconds)
                .as_u32()?
                .map(|ms| Duration::from_millis(u64::from(ms))),
            headers: response.mapped_headers(server_version)?,
        })
    }

    /// Build from a rejected context negotiation
    pub fn from_context_response(response: &ContextResponse) -> Result<Self, FrameError> {
        let status_code = response.status_code();
        let server_version = response
            .headers()
            .get(ContextHeader::ServerVersion)
            .as_str()?
            .unwrap_or_default();

        Ok(Self {
            kind: ErrorKind::from_status(status_code, 0).unwrap_or(ErrorKind::Other(status_code)),
            status_code,
            sub_status: 0,
            activity_id: response.activity_id(),
            body: None,
            partition_key_range_id: None,
            lsn: None,
            partition_index: None,
            service_index: None,
            retry_after: None,
            headers: ResponseHeaders::from_stream(
                response.headers(),
                server_version,
                response.activity_id(),
            )?,
        })
    }
}
