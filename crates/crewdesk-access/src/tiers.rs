//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

/// Tiers in ascending order. `Baseline` is the sentinel used when a tenant has
/// no subscription at all; it is never stored on a company record.
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
pub enum Tier {
    /// No subscription; baseline features only.
    Baseline,
    /// Evaluation tier and the floor for expired or lapsed tenants.
    Trial,
    /// Entry paid tier.
    Starter,
    /// Mid paid tier.
    Professional,
    /// Top paid tier.
    Enterprise,
}

impl Tier {
    /// Highest tier in the ordering.
    pub const TOP: Tier = Tier::Enterprise;

    /// Lowest tier that is not paid for. Expired trials and lapsed
    /// subscriptions resolve here.
    pub const LOWEST_UNPAID: Tier = Tier::Trial;
}

/// Features gated by subscription tier.
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
pub enum Feature {
    /// Dashboard and account pages.
    Dashboard,
    /// Project tracking.
    Projects,
    /// Quote builder.
    Quotes,
    /// Lead pipeline.
    Leads,
    /// Damage reporting.
    Damages,
    /// Crew scheduling.
    Scheduling,
    /// Material ordering.
    Materials,
    /// Standard reports.
    Reports,
    /// Multi-crew capacity planning.
    AdvancedPlanning,
    /// Inviting and managing staff accounts.
    TeamManagement,
    /// Supplier self-service portal.
    SupplierPortal,
    /// Invoice generation.
    Invoicing,
    /// Programmatic API access.
    ApiAccess,
    /// White-label branding.
    CustomBranding,
    /// Priority support channel.
    PrioritySupport,
}

/// Numeric limits enforced per tenant.
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
pub enum LimitName {
    /// Projects not yet closed.
    ActiveProjects,
    /// Staff accounts in the tenant.
    TeamMembers,
    /// Quotes created in the current month.
    MonthlyQuotes,
    /// Leads not yet converted or dropped.
    OpenLeads,
    /// Attachment storage in megabytes.
    StorageMb,
}

/// A limit is either a finite ceiling or unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitValue {
    /// Usage must stay strictly below this value.
    Finite(u64),
    /// No ceiling.
    Unlimited,
}

impl LimitValue {
    /// True when `usage` has reached the ceiling.
    pub fn is_reached(self, usage: u64) -> bool {
        match self {
            LimitValue::Finite(limit) => usage >= limit,
            LimitValue::Unlimited => false,
        }
    }

    fn at_least(self, other: LimitValue) -> bool {
        match (self, other) {
            (LimitValue::Unlimited, _) => true,
            (LimitValue::Finite(_), LimitValue::Unlimited) => false,
            (LimitValue::Finite(a), LimitValue::Finite(b)) => a >= b,
        }
    }
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitValue::Finite(value) => write!(f, "{value}"),
            LimitValue::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Features and limits attached to one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDefinition {
    /// Tier described by this definition.
    pub tier: Tier,
    /// Enabled features.
    pub features: BTreeSet<Feature>,
    /// Limits; an absent entry means zero.
    pub limits: BTreeMap<LimitName, LimitValue>,
}

/// Errors raised while building a [`TierCatalog`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// Tiers must be declared exactly once, in ascending order.
    #[error("tier '{found}' declared out of order; expected '{expected}'")]
    OutOfOrder {
        /// Tier that should have come next.
        expected: Tier,
        /// Tier that was declared.
        found: Tier,
    },
    /// A tier was never declared.
    #[error("tier '{0}' missing from catalog")]
    MissingTier(Tier),
    /// A higher tier dropped a feature of a lower tier.
    #[error("tier '{higher}' does not include feature '{feature}' of tier '{lower}'")]
    NotSuperset {
        /// Lower tier.
        lower: Tier,
        /// Higher tier.
        higher: Tier,
        /// Missing feature.
        feature: Feature,
    },
    /// A limit shrank from one tier to the next.
    #[error("limit '{limit}' decreases from {lower_value} on '{lower}' to {higher_value} on '{higher}'")]
    DecreasingLimit {
        /// Offending limit.
        limit: LimitName,
        /// Lower tier.
        lower: Tier,
        /// Value on the lower tier.
        lower_value: LimitValue,
        /// Higher tier.
        higher: Tier,
        /// Value on the higher tier.
        higher_value: LimitValue,
    },
    /// `Unlimited` below the top tier without an explicit override.
    #[error("limit '{limit}' is unlimited on '{tier}' below the top tier")]
    UnlimitedBelowTop {
        /// Offending limit.
        limit: LimitName,
        /// Tier carrying the unlimited value.
        tier: Tier,
    },
}

/// Immutable tier → {features, limits} table.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: BTreeMap<Tier, TierDefinition>,
}

impl TierCatalog {
    /// Start a builder seeded with the baseline tier.
    pub fn builder(
        baseline_features: impl IntoIterator<Item = Feature>,
        baseline_limits: impl IntoIterator<Item = (LimitName, LimitValue)>,
    ) -> TierCatalogBuilder {
        TierCatalogBuilder {
            definitions: vec![TierDefinition {
                tier: Tier::Baseline,
                features: baseline_features.into_iter().collect(),
                limits: baseline_limits.into_iter().collect(),
            }],
            unlimited_below_top: BTreeSet::new(),
        }
    }

    /// Default plans shipped with the product.
    pub fn standard() -> Result<Self, CatalogError> {
        use Feature::*;
        use LimitName::*;
        use LimitValue::{Finite, Unlimited};

        TierCatalog::builder(
            [Dashboard],
            [
                (ActiveProjects, Finite(0)),
                (TeamMembers, Finite(1)),
                (MonthlyQuotes, Finite(0)),
                (OpenLeads, Finite(0)),
                (StorageMb, Finite(50)),
            ],
        )
        .extend(
            Tier::Trial,
            [Projects, Quotes, Leads, Damages, Scheduling],
            [
                (ActiveProjects, Finite(3)),
                (TeamMembers, Finite(2)),
                (MonthlyQuotes, Finite(10)),
                (OpenLeads, Finite(25)),
                (StorageMb, Finite(250)),
            ],
        )
        .extend(
            Tier::Starter,
            [Materials, Reports],
            [
                (ActiveProjects, Finite(10)),
                (TeamMembers, Finite(5)),
                (MonthlyQuotes, Finite(50)),
                (OpenLeads, Finite(100)),
                (StorageMb, Finite(1_024)),
            ],
        )
        .extend(
            Tier::Professional,
            [AdvancedPlanning, TeamManagement, SupplierPortal, Invoicing],
            [
                (ActiveProjects, Finite(50)),
                (TeamMembers, Finite(25)),
                (MonthlyQuotes, Finite(500)),
                (OpenLeads, Finite(1_000)),
                (StorageMb, Finite(10_240)),
            ],
        )
        .extend(
            Tier::Enterprise,
            [ApiAccess, CustomBranding, PrioritySupport],
            [
                (ActiveProjects, Unlimited),
                (TeamMembers, Unlimited),
                (MonthlyQuotes, Unlimited),
                (OpenLeads, Unlimited),
                (StorageMb, Finite(102_400)),
            ],
        )
        .build()
    }

    /// Whether `tier` includes `feature`.
    pub fn has_feature(&self, tier: Tier, feature: Feature) -> bool {
        self.tiers
            .get(&tier)
            .map(|definition| definition.features.contains(&feature))
            .unwrap_or(false)
    }

    /// Limit value for `tier`; absent entries resolve to zero.
    pub fn limit_for(&self, tier: Tier, limit: LimitName) -> LimitValue {
        self.tiers
            .get(&tier)
            .and_then(|definition| definition.limits.get(&limit).copied())
            .unwrap_or(LimitValue::Finite(0))
    }

    /// Full definition for a tier.
    pub fn definition(&self, tier: Tier) -> Option<&TierDefinition> {
        self.tiers.get(&tier)
    }

    /// Lowest tier that includes `feature`, used for upgrade prompts.
    pub fn minimum_tier_for(&self, feature: Feature) -> Option<Tier> {
        self.tiers
            .values()
            .find(|definition| definition.features.contains(&feature))
            .map(|definition| definition.tier)
    }
}

/// Declares tiers bottom-up. Each [`extend`](TierCatalogBuilder::extend) call
/// starts from a copy of the previous tier, so features can only be added.
#[derive(Debug, Clone)]
pub struct TierCatalogBuilder {
    definitions: Vec<TierDefinition>,
    unlimited_below_top: BTreeSet<LimitName>,
}

impl TierCatalogBuilder {
    /// Declare the next tier, inheriting everything from the previous one.
    /// Limits listed here replace the inherited values.
    pub fn extend(
        mut self,
        tier: Tier,
        added_features: impl IntoIterator<Item = Feature>,
        limits: impl IntoIterator<Item = (LimitName, LimitValue)>,
    ) -> Self {
        let mut next = match self.definitions.last() {
            Some(previous) => previous.clone(),
            None => TierDefinition {
                tier,
                features: BTreeSet::new(),
                limits: BTreeMap::new(),
            },
        };
        next.tier = tier;
        next.features.extend(added_features);
        next.limits.extend(limits);
        self.definitions.push(next);
        self
    }

    /// Allow `Unlimited` for `limit` on tiers below the top.
    pub fn allow_unlimited_below_top(mut self, limit: LimitName) -> Self {
        self.unlimited_below_top.insert(limit);
        self
    }

    /// Validate ordering, supersets, and monotonic limits, then freeze.
    pub fn build(self) -> Result<TierCatalog, CatalogError> {
        let mut expected_tiers = Tier::iter();
        for definition in &self.definitions {
            match expected_tiers.next() {
                Some(expected) if expected == definition.tier => {}
                Some(expected) => {
                    return Err(CatalogError::OutOfOrder {
                        expected,
                        found: definition.tier,
                    })
                }
                None => {
                    return Err(CatalogError::OutOfOrder {
                        expected: Tier::TOP,
                        found: definition.tier,
                    })
                }
            }
        }
        if let Some(missing) = expected_tiers.next() {
            return Err(CatalogError::MissingTier(missing));
        }

        for pair in self.definitions.windows(2) {
            let (lower, higher) = (&pair[0], &pair[1]);
            if let Some(feature) = lower.features.difference(&higher.features).next() {
                return Err(CatalogError::NotSuperset {
                    lower: lower.tier,
                    higher: higher.tier,
                    feature: *feature,
                });
            }
            for limit in LimitName::iter() {
                let lower_value = limit_of(lower, limit);
                let higher_value = limit_of(higher, limit);
                if !higher_value.at_least(lower_value) {
                    return Err(CatalogError::DecreasingLimit {
                        limit,
                        lower: lower.tier,
                        lower_value,
                        higher: higher.tier,
                        higher_value,
                    });
                }
            }
        }

        for definition in &self.definitions {
            if definition.tier == Tier::TOP {
                continue;
            }
            for (limit, value) in &definition.limits {
                if *value == LimitValue::Unlimited && !self.unlimited_below_top.contains(limit) {
                    return Err(CatalogError::UnlimitedBelowTop {
                        limit: *limit,
                        tier: definition.tier,
                    });
                }
            }
        }

        Ok(TierCatalog {
            tiers: self
                .definitions
                .into_iter()
                .map(|definition| (definition.tier, definition))
                .collect(),
        })
    }
}

fn limit_of(definition: &TierDefinition, limit: LimitName) -> LimitValue {
    definition
        .limits
        .get(&limit)
        .copied()
        .unwrap_or(LimitValue::Finite(0))
}
