//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
//! Entitlement decisions.
//!
//! [`EntitlementEngine::authorize`] and [`EntitlementEngine::check_limit`] are
//! pure functions of their inputs. Neither reserves anything: a caller that
//! creates a limited resource after a positive `check_limit` must still
//! perform an atomic compare-and-increment in the store, otherwise two
//! concurrent creations can both pass the check.

use chrono::{DateTime, Utc};
use crewdesk_common::config::{AccessConfig, SubscriptionConfig};
use serde::Serialize;
use strum::{Display, IntoStaticStr};
use tracing::error;

use crate::error::AccessError;
use crate::model::{Company, Principal, PrincipalId, Role};
use crate::roles::{Action, Resource, RoleMatrix};
use crate::subscription::{SubscriptionPolicy, SubscriptionState, SubscriptionStateResolver};
use crate::tiers::{Feature, LimitName, LimitValue, TierCatalog};

/// Actions the super-admin override never covers.
pub const NO_OVERRIDE_ACTIONS: &[Action] = &[Action::Purge];

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionReason {
    /// Allowed by the super-admin override.
    SuperAdmin,
    /// Allowed by the role matrix.
    Granted,
    /// Usage is below the tier limit.
    WithinLimit,
    /// The tier has no ceiling for the limit.
    Unlimited,
    /// The effective tier lacks the required feature.
    FeatureNotInTier,
    /// The role matrix does not grant the action.
    RoleForbidden,
    /// Owner-scoped action on someone else's resource.
    NotOwner,
    /// Usage reached the tier limit.
    LimitReached,
    /// No authenticated principal.
    NotAuthenticated,
    /// A tenant is required but none was supplied.
    MissingTenant,
    /// Identity or tenant data could not be loaded.
    UpstreamUnavailable,
    /// Access tables or settings are invalid.
    Misconfigured,
}

/// Outcome of an access or limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the caller may proceed.
    pub allowed: bool,
    /// Reason code surfaced to callers and logs.
    pub reason: DecisionReason,
}

impl Decision {
    /// Positive decision.
    pub fn allow(reason: DecisionReason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    /// Negative decision.
    pub fn deny(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }

    /// Deny with the reason matching an infrastructure failure. A
    /// configuration error is a defect and is logged at error level.
    pub fn fail_closed(error: &AccessError) -> Self {
        let reason = match error {
            AccessError::NotAuthenticated => DecisionReason::NotAuthenticated,
            AccessError::UpstreamUnavailable(_) => DecisionReason::UpstreamUnavailable,
            AccessError::Configuration(message) => {
                error!(error = %message, "access configuration defect; denying");
                DecisionReason::Misconfigured
            }
        };
        Self::deny(reason)
    }

    /// Whether the caller may proceed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// `Ok` with the allow reason, `Err` with the deny reason.
    pub fn into_result(self) -> Result<DecisionReason, DecisionReason> {
        if self.allowed {
            Ok(self.reason)
        } else {
            Err(self.reason)
        }
    }
}

/// Target of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// Resource type.
    pub kind: Resource,
    /// Owning principal, needed for `_own` actions.
    pub owner_id: Option<PrincipalId>,
}

impl ResourceRef {
    /// Resource without an owner.
    pub fn new(kind: Resource) -> Self {
        Self {
            kind,
            owner_id: None,
        }
    }

    /// Resource owned by a principal.
    pub fn owned_by(kind: Resource, owner_id: impl Into<PrincipalId>) -> Self {
        Self {
            kind,
            owner_id: Some(owner_id.into()),
        }
    }
}

impl From<Resource> for ResourceRef {
    fn from(kind: Resource) -> Self {
        Self::new(kind)
    }
}

/// One authorization question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    /// Requested action.
    pub action: Action,
    /// Target resource.
    pub resource: ResourceRef,
    /// Feature the tenant's tier must include, if any.
    pub required_feature: Option<Feature>,
}

impl AccessRequest {
    /// Request without a feature requirement.
    pub fn new(action: Action, resource: ResourceRef) -> Self {
        Self {
            action,
            resource,
            required_feature: None,
        }
    }

    /// Add a feature requirement.
    pub fn requiring(mut self, feature: Feature) -> Self {
        self.required_feature = Some(feature);
        self
    }
}

/// Combines role grants, tier features, limits, and the super-admin override.
///
/// Built once at startup and shared by reference or `Arc`; holds only
/// immutable tables.
#[derive(Debug, Clone)]
pub struct EntitlementEngine {
    roles: RoleMatrix,
    tiers: TierCatalog,
    resolver: SubscriptionStateResolver,
    super_admin_email: Option<String>,
}

impl EntitlementEngine {
    /// Assemble an engine from prebuilt tables. A blank super-admin address
    /// disables the override.
    pub fn new(
        roles: RoleMatrix,
        tiers: TierCatalog,
        resolver: SubscriptionStateResolver,
        super_admin_email: Option<String>,
    ) -> Self {
        let super_admin_email = super_admin_email
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty());
        Self {
            roles,
            tiers,
            resolver,
            super_admin_email,
        }
    }

    /// Engine over the standard role matrix and tier catalog.
    pub fn standard(super_admin_email: Option<String>) -> Result<Self, AccessError> {
        Ok(Self::new(
            RoleMatrix::standard()?,
            TierCatalog::standard()?,
            SubscriptionStateResolver::default(),
            super_admin_email,
        ))
    }

    /// Engine over the standard tables with settings from configuration.
    pub fn from_config(
        access: &AccessConfig,
        subscription: &SubscriptionConfig,
    ) -> Result<Self, AccessError> {
        Ok(Self::new(
            RoleMatrix::standard()?,
            TierCatalog::standard()?,
            SubscriptionStateResolver::new(SubscriptionPolicy::from_config(subscription)),
            access.super_admin_email.clone(),
        ))
    }

    /// Tier catalog in use.
    pub fn tiers(&self) -> &TierCatalog {
        &self.tiers
    }

    /// Whether the principal gets the override: admin role and the
    /// configured address, compared trimmed and case-insensitively.
    pub fn is_super_admin(&self, principal: &Principal) -> bool {
        match &self.super_admin_email {
            Some(configured) => {
                principal.role == Role::Admin
                    && principal.email.trim().to_lowercase() == *configured
            }
            None => false,
        }
    }

    /// Effective subscription state for the company at `now`.
    pub fn resolve(&self, company: &Company, now: DateTime<Utc>) -> SubscriptionState {
        self.resolver.resolve(company, now)
    }

    /// Decide whether `principal` may perform `request`. First matching rule wins:
    ///
    /// 1. super admin, action not in [`NO_OVERRIDE_ACTIONS`]: allow;
    /// 2. a required feature needs a company whose effective tier has it;
    /// 3. the role matrix must grant the action;
    /// 4. `_own` actions need `owner_id` equal to the principal id;
    /// 5. allow.
    pub fn authorize(
        &self,
        principal: &Principal,
        company: Option<&Company>,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> Decision {
        if self.is_super_admin(principal) && !NO_OVERRIDE_ACTIONS.contains(&request.action) {
            return Decision::allow(DecisionReason::SuperAdmin);
        }

        if let Some(feature) = request.required_feature {
            let Some(company) = company else {
                return Decision::deny(DecisionReason::MissingTenant);
            };
            let state = self.resolver.resolve(company, now);
            if !self.tiers.has_feature(state.effective_tier, feature) {
                return Decision::deny(DecisionReason::FeatureNotInTier);
            }
        }

        if !self
            .roles
            .permits(principal.role, request.resource.kind, request.action)
        {
            return Decision::deny(DecisionReason::RoleForbidden);
        }

        if request.action.is_owner_scoped()
            && request.resource.owner_id.as_deref() != Some(principal.id.as_str())
        {
            return Decision::deny(DecisionReason::NotOwner);
        }

        Decision::allow(DecisionReason::Granted)
    }

    /// Compare `current_usage` with the limit of the company's effective tier.
    pub fn check_limit(
        &self,
        company: &Company,
        limit: LimitName,
        current_usage: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        let state = self.resolver.resolve(company, now);
        match self.tiers.limit_for(state.effective_tier, limit) {
            LimitValue::Unlimited => Decision::allow(DecisionReason::Unlimited),
            value if value.is_reached(current_usage) => {
                Decision::deny(DecisionReason::LimitReached)
            }
            LimitValue::Finite(_) => Decision::allow(DecisionReason::WithinLimit),
        }
    }

    /// [`authorize`](Self::authorize) over fallible lookups. Any lookup
    /// failure denies, principal errors taking precedence.
    pub fn authorize_lookup(
        &self,
        principal: Result<&Principal, &AccessError>,
        company: Result<Option<&Company>, &AccessError>,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> Decision {
        let principal = match principal {
            Ok(principal) => principal,
            Err(error) => return Decision::fail_closed(error),
        };
        match company {
            Ok(company) => self.authorize(principal, company, request, now),
            Err(error) => Decision::fail_closed(error),
        }
    }

    /// [`check_limit`](Self::check_limit) over a fallible company lookup.
    pub fn check_limit_lookup(
        &self,
        company: Result<&Company, &AccessError>,
        limit: LimitName,
        current_usage: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        match company {
            Ok(company) => self.check_limit(company, limit, current_usage, now),
            Err(error) => Decision::fail_closed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanTier, SubscriptionStatus};
    use chrono::TimeZone;

    const ROOT: &str = "root@crewdesk.example";

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn engine() -> EntitlementEngine {
        EntitlementEngine::standard(Some(format!("  {}  ", ROOT.to_uppercase()))).unwrap()
    }

    fn company(tier: PlanTier, status: SubscriptionStatus) -> Company {
        let mut company = Company::new_trial("co-1", "Acme Painting", at(1), 14);
        company.subscription_tier = tier;
        company.subscription_status = status;
        company
    }

    fn painter() -> Principal {
        Principal::new("u-painter", "paint@acme.example", Role::Painter).in_company("co-1")
    }

    #[test]
    fn painter_cannot_delete_projects() {
        let request = AccessRequest::new(Action::Delete, ResourceRef::new(Resource::Project));
        let decision = engine().authorize(&painter(), None, &request, at(2));
        assert_eq!(decision, Decision::deny(DecisionReason::RoleForbidden));
    }

    #[test]
    fn unswept_trial_is_denied_paid_features() {
        let mut company = company(PlanTier::Starter, SubscriptionStatus::Trialing);
        company.trial_ends_at = Some(at(1));
        let admin = Principal::new("u-admin", "boss@acme.example", Role::Admin).in_company("co-1");
        let request = AccessRequest::new(Action::Read, ResourceRef::new(Resource::Project))
            .requiring(Feature::AdvancedPlanning);

        let engine = engine();
        assert!(engine.resolve(&company, at(10)).is_expired);
        let decision = engine.authorize(&admin, Some(&company), &request, at(10));
        assert_eq!(decision, Decision::deny(DecisionReason::FeatureNotInTier));
    }

    #[test]
    fn super_admin_overrides_role_and_tier() {
        let root = Principal::new("u-root", ROOT, Role::Admin);
        let canceled = company(PlanTier::Trial, SubscriptionStatus::Canceled);
        let request = AccessRequest::new(Action::Delete, ResourceRef::new(Resource::Company))
            .requiring(Feature::ApiAccess);
        let decision = engine().authorize(&root, Some(&canceled), &request, at(2));
        assert_eq!(decision, Decision::allow(DecisionReason::SuperAdmin));
    }

    #[test]
    fn super_admin_override_excludes_purge() {
        let root = Principal::new("u-root", ROOT, Role::Admin);
        let request = AccessRequest::new(Action::Purge, ResourceRef::new(Resource::Company));
        let decision = engine().authorize(&root, None, &request, at(2));
        assert_eq!(decision, Decision::deny(DecisionReason::RoleForbidden));
    }

    #[test]
    fn super_admin_needs_admin_role_and_matching_email() {
        let engine = engine();
        assert!(!engine.is_super_admin(&Principal::new("u-1", ROOT, Role::Helpdesk)));
        assert!(!engine.is_super_admin(&Principal::new(
            "u-2",
            "other@crewdesk.example",
            Role::Admin
        )));
        assert!(engine.is_super_admin(&Principal::new("u-3", "Root@CrewDesk.example ", Role::Admin)));

        let disabled = EntitlementEngine::standard(Some("   ".into())).unwrap();
        assert!(!disabled.is_super_admin(&Principal::new("u-3", ROOT, Role::Admin)));
    }

    #[test]
    fn feature_requirement_without_company_is_missing_tenant() {
        let admin = Principal::new("u-admin", "boss@acme.example", Role::Admin);
        let request = AccessRequest::new(Action::Read, ResourceRef::new(Resource::Project))
            .requiring(Feature::Projects);
        let decision = engine().authorize(&admin, None, &request, at(2));
        assert_eq!(decision, Decision::deny(DecisionReason::MissingTenant));
    }

    #[test]
    fn feature_check_precedes_role_check() {
        let company = company(PlanTier::Trial, SubscriptionStatus::Trialing);
        let supplier = Principal::new("u-sup", "sales@paints.example", Role::Supplier);
        let request = AccessRequest::new(Action::Delete, ResourceRef::new(Resource::Invoice))
            .requiring(Feature::Invoicing);
        let decision = engine().authorize(&supplier, Some(&company), &request, at(2));
        assert_eq!(decision.reason, DecisionReason::FeatureNotInTier);
    }

    #[test]
    fn owner_scoped_actions_check_ownership() {
        let engine = engine();
        let painter = painter();
        let mine = AccessRequest::new(
            Action::UpdateOwn,
            ResourceRef::owned_by(Resource::Project, "u-painter"),
        );
        let theirs = AccessRequest::new(
            Action::UpdateOwn,
            ResourceRef::owned_by(Resource::Project, "u-other"),
        );
        let unowned = AccessRequest::new(Action::UpdateOwn, ResourceRef::new(Resource::Project));

        assert_eq!(
            engine.authorize(&painter, None, &mine, at(2)),
            Decision::allow(DecisionReason::Granted)
        );
        assert_eq!(
            engine.authorize(&painter, None, &theirs, at(2)).reason,
            DecisionReason::NotOwner
        );
        assert_eq!(
            engine.authorize(&painter, None, &unowned, at(2)).reason,
            DecisionReason::NotOwner
        );
    }

    #[test]
    fn absent_grants_are_denied() {
        let supplier = Principal::new("u-sup", "sales@paints.example", Role::Supplier);
        let request = AccessRequest::new(Action::Read, ResourceRef::new(Resource::Project));
        assert!(!engine().authorize(&supplier, None, &request, at(2)).is_allowed());
    }

    #[test]
    fn granted_with_feature_in_active_tier() {
        let company = company(PlanTier::Professional, SubscriptionStatus::Active);
        let admin = Principal::new("u-admin", "boss@acme.example", Role::Admin).in_company("co-1");
        let request = AccessRequest::new(Action::Create, ResourceRef::new(Resource::Schedule))
            .requiring(Feature::AdvancedPlanning);
        let decision = engine().authorize(&admin, Some(&company), &request, at(20));
        assert_eq!(decision.into_result(), Ok(DecisionReason::Granted));
    }

    #[test]
    fn limit_checks_follow_effective_tier() {
        let engine = engine();
        let trial = company(PlanTier::Trial, SubscriptionStatus::Trialing);
        assert_eq!(
            engine.check_limit(&trial, LimitName::ActiveProjects, 2, at(2)),
            Decision::allow(DecisionReason::WithinLimit)
        );
        assert_eq!(
            engine.check_limit(&trial, LimitName::ActiveProjects, 3, at(2)),
            Decision::deny(DecisionReason::LimitReached)
        );

        let enterprise = company(PlanTier::Enterprise, SubscriptionStatus::Active);
        assert_eq!(
            engine.check_limit(&enterprise, LimitName::ActiveProjects, 10_000, at(2)),
            Decision::allow(DecisionReason::Unlimited)
        );

        let canceled = company(PlanTier::Enterprise, SubscriptionStatus::Canceled);
        assert_eq!(
            engine.check_limit(&canceled, LimitName::ActiveProjects, 0, at(2)),
            Decision::deny(DecisionReason::LimitReached)
        );
    }

    #[test]
    fn lookup_failures_fail_closed() {
        let engine = engine();
        let request = AccessRequest::new(Action::Read, ResourceRef::new(Resource::Project));
        let root = Principal::new("u-root", ROOT, Role::Admin);
        let down = AccessError::UpstreamUnavailable("tenant store timeout".into());

        let decision = engine.authorize_lookup(
            Err(&AccessError::NotAuthenticated),
            Ok(None),
            &request,
            at(2),
        );
        assert_eq!(decision, Decision::deny(DecisionReason::NotAuthenticated));

        let decision = engine.authorize_lookup(Ok(&root), Err(&down), &request, at(2));
        assert_eq!(decision, Decision::deny(DecisionReason::UpstreamUnavailable));

        let decision = engine.check_limit_lookup(
            Err(&AccessError::Configuration("bad table".into())),
            LimitName::TeamMembers,
            0,
            at(2),
        );
        assert_eq!(decision, Decision::deny(DecisionReason::Misconfigured));
    }

    #[test]
    fn reasons_serialize_as_snake_case() {
        assert_eq!(DecisionReason::FeatureNotInTier.to_string(), "feature_not_in_tier");
        let json = serde_json::to_value(Decision::deny(DecisionReason::NotOwner)).unwrap();
        assert_eq!(json["reason"], "not_owner");
        assert_eq!(json["allowed"], false);
    }
}
