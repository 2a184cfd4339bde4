//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::engine::{AccessRequest, Decision, DecisionReason, EntitlementEngine, ResourceRef};
use crate::error::AccessError;
use crate::model::{Company, Principal};
use crate::roles::Action;
use crate::subscription::SubscriptionState;
use crate::tiers::{Feature, LimitName};

#[derive(Debug, Clone, Copy)]
enum Subject<'a> {
    Loaded {
        principal: &'a Principal,
        company: Option<&'a Company>,
    },
    Failed(Decision),
}

/// Synchronous view over already-loaded snapshots for UI and handler code.
///
/// The gate never reloads anything; build a new one when the principal or
/// company may have changed.
#[derive(Debug, Clone, Copy)]
pub struct AccessGate<'a> {
    engine: &'a EntitlementEngine,
    subject: Subject<'a>,
    now: DateTime<Utc>,
}

impl<'a> AccessGate<'a> {
    /// Gate over a loaded principal and optional company.
    pub fn new(
        engine: &'a EntitlementEngine,
        principal: &'a Principal,
        company: Option<&'a Company>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            engine,
            subject: Subject::Loaded { principal, company },
            now,
        }
    }

    /// Gate over fallible lookups. If either lookup failed, every check on
    /// the gate is denied with the mapped reason.
    pub fn from_lookup(
        engine: &'a EntitlementEngine,
        principal: Result<&'a Principal, &AccessError>,
        company: Result<Option<&'a Company>, &AccessError>,
        now: DateTime<Utc>,
    ) -> Self {
        let subject = match (principal, company) {
            (Err(error), _) | (Ok(_), Err(error)) => Subject::Failed(Decision::fail_closed(error)),
            (Ok(principal), Ok(company)) => Subject::Loaded { principal, company },
        };
        Self {
            engine,
            subject,
            now,
        }
    }

    /// Loaded principal, if the lookup succeeded.
    pub fn principal(&self) -> Option<&'a Principal> {
        match self.subject {
            Subject::Loaded { principal, .. } => Some(principal),
            Subject::Failed(_) => None,
        }
    }

    /// Effective subscription state of the loaded company.
    pub fn subscription(&self) -> Option<SubscriptionState> {
        match self.subject {
            Subject::Loaded {
                company: Some(company),
                ..
            } => Some(self.engine.resolve(company, self.now)),
            _ => None,
        }
    }

    /// Full decision for a request.
    pub fn decide(&self, request: &AccessRequest) -> Decision {
        let decision = match self.subject {
            Subject::Loaded { principal, company } => {
                self.engine.authorize(principal, company, request, self.now)
            }
            Subject::Failed(decision) => decision,
        };
        if !decision.allowed {
            debug!(
                action = %request.action,
                resource = %request.resource.kind,
                reason = %decision.reason,
                "access denied"
            );
        }
        decision
    }

    /// Whether the role grants `action` on `resource`.
    pub fn can(&self, action: Action, resource: impl Into<ResourceRef>) -> bool {
        self.decide(&AccessRequest::new(action, resource.into()))
            .is_allowed()
    }

    /// Like [`can`](Self::can) but also requires `feature` in the effective tier.
    pub fn can_use(&self, action: Action, resource: impl Into<ResourceRef>, feature: Feature) -> bool {
        self.decide(&AccessRequest::new(action, resource.into()).requiring(feature))
            .is_allowed()
    }

    /// Limit decision for an explicit usage figure.
    pub fn limit_decision(&self, limit: LimitName, usage: u64) -> Decision {
        match self.subject {
            Subject::Loaded {
                company: Some(company),
                ..
            } => self.engine.check_limit(company, limit, usage, self.now),
            Subject::Loaded { company: None, .. } => Decision::deny(DecisionReason::MissingTenant),
            Subject::Failed(decision) => decision,
        }
    }

    /// Whether `usage` is below the company's limit.
    pub fn within_limit(&self, limit: LimitName, usage: u64) -> bool {
        self.limit_decision(limit, usage).is_allowed()
    }

    /// Whether the company's stored counter for `limit` is below the limit.
    pub fn usage_within_limit(&self, limit: LimitName) -> bool {
        let usage = match self.subject {
            Subject::Loaded {
                company: Some(company),
                ..
            } => company.usage(limit),
            _ => 0,
        };
        self.within_limit(limit, usage)
    }
}
