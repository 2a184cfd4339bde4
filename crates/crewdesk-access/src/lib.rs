//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! CrewDesk access-control crate.
//!
//! Decisions combine four static or derived inputs: the [`RoleMatrix`], the
//! [`TierCatalog`], the effective subscription state computed by the
//! [`SubscriptionStateResolver`], and the super-admin override. The
//! [`EntitlementEngine`] is pure; callers load the principal and company
//! snapshots and hand them in, usually through an [`AccessGate`].

pub mod engine;
pub mod error;
pub mod gate;
pub mod identity;
pub mod model;
pub mod roles;
pub mod subscription;
pub mod tiers;

pub use engine::{
    AccessRequest, Decision, DecisionReason, EntitlementEngine, ResourceRef, NO_OVERRIDE_ACTIONS,
};
pub use error::AccessError;
pub use gate::AccessGate;
pub use identity::{IdentityProvider, StaticIdentityProvider};
pub use model::{Company, CompanyId, PlanTier, Principal, PrincipalId, Role, SubscriptionStatus};
pub use roles::{Action, ActionSet, MatrixError, Resource, RoleMatrix, RoleMatrixBuilder};
pub use subscription::{SubscriptionPolicy, SubscriptionState, SubscriptionStateResolver};
pub use tiers::{
    CatalogError, Feature, LimitName, LimitValue, Tier, TierCatalog, TierCatalogBuilder,
    TierDefinition,
};
