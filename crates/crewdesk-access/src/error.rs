//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use thiserror::Error;

use crate::roles::MatrixError;
use crate::tiers::CatalogError;

/// Infrastructure and setup failures around an access decision.
///
/// Policy and limit denials are not errors; they are
/// [`Decision`](crate::engine::Decision) values carrying a reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// No valid session or identity for the caller.
    #[error("caller is not authenticated")]
    NotAuthenticated,
    /// Tables or settings failed validation.
    #[error("access configuration error: {0}")]
    Configuration(String),
    /// Identity provider or tenant store could not be reached.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl From<MatrixError> for AccessError {
    fn from(value: MatrixError) -> Self {
        AccessError::Configuration(value.to_string())
    }
}

impl From<CatalogError> for AccessError {
    fn from(value: CatalogError) -> Self {
        AccessError::Configuration(value.to_string())
    }
}
