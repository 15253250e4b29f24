//! Validated read API over the repository.
//!
//! This is the contract external HTTP/gRPC transports consume: request
//! validation happens here, so transports only map outcomes onto their wire
//! format. Validation failures classify as bad requests; repository failures
//! classify as internal, with the cause preserved for logs rather than user
//! responses.

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use uuid::Uuid;

use crate::error::{
    InvalidPacketIdSnafu, InvalidRangeSnafu, QueryError, RepositorySnafu, ValidationSnafu,
};
use crate::repository::RepositoryRef;
use crate::types::Reduction;

/// Read-side service over a repository.
#[derive(Clone)]
pub struct QueryService {
    repository: RepositoryRef,
}

impl QueryService {
    pub fn new(repository: RepositoryRef) -> Self {
        Self { repository }
    }

    /// Look up the reduction for one packet id.
    ///
    /// The id must be in canonical lowercase hyphenated 36-character form;
    /// anything else is a validation failure. An unknown id is `Ok(None)`.
    pub async fn max_by_id(&self, packet_id: &str) -> Result<Option<Reduction>, QueryError> {
        validate_packet_id(packet_id).context(ValidationSnafu)?;
        self.repository
            .get_by_id(packet_id)
            .await
            .context(RepositorySnafu)
    }

    /// List reductions with `from <= timestamp < to`, ascending.
    ///
    /// Requires `to > from`; an empty result is a successful response.
    pub async fn max_by_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reduction>, QueryError> {
        if to <= from {
            return InvalidRangeSnafu.fail().context(ValidationSnafu);
        }
        self.repository
            .get_by_time_range(from, to)
            .await
            .context(RepositorySnafu)
    }
}

fn validate_packet_id(packet_id: &str) -> Result<(), crate::error::ValidationError> {
    let canonical = Uuid::parse_str(packet_id)
        .ok()
        .map(|u| u.as_hyphenated().to_string());
    ensure!(
        canonical.as_deref() == Some(packet_id),
        InvalidPacketIdSnafu { packet_id }
    );
    Ok(())
}
