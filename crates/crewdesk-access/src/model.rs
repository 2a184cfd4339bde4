//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::tiers::{LimitName, Tier};

/// Identifier for an authenticated principal.
pub type PrincipalId = String;

/// Identifier for a tenant company.
pub type CompanyId = String;

/// Closed set of roles a principal can hold.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    /// Company owner or office manager.
    Admin,
    /// Field painter working assigned projects.
    Painter,
    /// Support staff with read-mostly access across a tenant.
    Helpdesk,
    /// External material supplier.
    Supplier,
}

/// Snapshot of the authenticated actor, as returned by the identity provider.
///
/// Super-admin status is not part of the snapshot; the engine derives it from
/// the role and the configured address on every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier.
    pub id: PrincipalId,
    /// Login address.
    pub email: String,
    /// Assigned role.
    pub role: Role,
    /// Tenant the principal belongs to, if any.
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    /// Supplier record for supplier principals.
    #[serde(default)]
    pub supplier_id: Option<String>,
}

impl Principal {
    /// Construct a principal without tenant or supplier bindings.
    pub fn new(id: impl Into<PrincipalId>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            role,
            company_id: None,
            supplier_id: None,
        }
    }

    /// Bind the principal to a tenant company.
    pub fn in_company(mut self, company_id: impl Into<CompanyId>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    /// Bind the principal to a supplier record.
    pub fn for_supplier(mut self, supplier_id: impl Into<String>) -> Self {
        self.supplier_id = Some(supplier_id.into());
        self
    }
}

/// Subscription plan stored on a company record.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanTier {
    /// Free evaluation plan.
    Trial,
    /// Entry paid plan.
    Starter,
    /// Mid paid plan.
    Professional,
    /// Top paid plan.
    Enterprise,
}

impl From<PlanTier> for Tier {
    fn from(value: PlanTier) -> Self {
        match value {
            PlanTier::Trial => Tier::Trial,
            PlanTier::Starter => Tier::Starter,
            PlanTier::Professional => Tier::Professional,
            PlanTier::Enterprise => Tier::Enterprise,
        }
    }
}

/// Subscription status stored on a company record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Evaluation period, bounded by `trial_ends_at`.
    Trialing,
    /// Paid and in good standing.
    Active,
    /// Payment failed; paid access continues for the grace window.
    PastDue,
    /// Subscription ended by the customer or support staff.
    Canceled,
    /// Trial ran out without conversion.
    Expired,
}

/// Tenant snapshot used for entitlement decisions.
///
/// `subscription_status` and `subscription_tier` are a persisted cache. The
/// effective state is always computed by
/// [`SubscriptionStateResolver`](crate::subscription::SubscriptionStateResolver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    /// Tenant identifier.
    pub id: CompanyId,
    /// Display name.
    pub name: String,
    /// Stored plan.
    pub subscription_tier: PlanTier,
    /// Stored status.
    pub subscription_status: SubscriptionStatus,
    /// Start of the evaluation period.
    #[serde(default)]
    pub trial_started_at: Option<DateTime<Utc>>,
    /// End of the evaluation period.
    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// When the subscription entered `past_due`.
    #[serde(default)]
    pub past_due_since: Option<DateTime<Utc>>,
    /// Current usage per limited resource.
    #[serde(default)]
    pub usage_counters: BTreeMap<LimitName, u64>,
}

impl Company {
    /// Create a company at the start of its trial.
    pub fn new_trial(
        id: impl Into<CompanyId>,
        name: impl Into<String>,
        now: DateTime<Utc>,
        trial_days: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            subscription_tier: PlanTier::Trial,
            subscription_status: SubscriptionStatus::Trialing,
            trial_started_at: Some(now),
            trial_ends_at: Some(now + Duration::days(i64::from(trial_days))),
            past_due_since: None,
            usage_counters: BTreeMap::new(),
        }
    }

    /// Recorded usage for a limit, zero when absent.
    pub fn usage(&self, limit: LimitName) -> u64 {
        self.usage_counters.get(&limit).copied().unwrap_or(0)
    }
}
