//! ---
//! cd_section: "06-security-access-control"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Entitlement engine, role matrix, and tier catalog."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};
use thiserror::Error;

use crate::model::Role;

/// Wildcard token accepted by [`RoleMatrix::from_table`].
pub const WILDCARD: &str = "*";

/// Resources the role matrix can grant access to.
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
pub enum Resource {
    /// Painting jobs.
    Project,
    /// Customer quotes.
    Quote,
    /// Sales leads.
    Lead,
    /// Damage reports raised on site.
    Damage,
    /// Crew schedule entries.
    Schedule,
    /// Material catalogue and orders.
    Material,
    /// Customer invoices.
    Invoice,
    /// The tenant record itself.
    Company,
    /// User accounts within a tenant.
    User,
    /// Supplier profiles.
    Supplier,
    /// Aggregated reports.
    Report,
}

/// Actions a principal can request on a resource.
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
pub enum Action {
    /// Read any record.
    Read,
    /// Create a record.
    Create,
    /// Update any record.
    Update,
    /// Delete any record.
    Delete,
    /// Read records owned by the principal.
    ReadOwn,
    /// Update records owned by the principal.
    UpdateOwn,
    /// Delete records owned by the principal.
    DeleteOwn,
    /// Export records.
    Export,
    /// Assign records to other users.
    Assign,
    /// Approve records (quotes, invoices).
    Approve,
    /// Irreversibly erase tenant data.
    Purge,
}

impl Action {
    /// Actions suffixed `_own` require the principal to own the resource.
    pub fn is_owner_scoped(self) -> bool {
        let name: &'static str = self.into();
        name.ends_with("_own")
    }
}

impl Resource {
    /// Actions that are meaningful for this resource. Grants outside this set
    /// are rejected when the matrix is built.
    pub fn vocabulary(self) -> &'static [Action] {
        use Action::*;
        match self {
            Resource::Project => &[
                Read, Create, Update, Delete, ReadOwn, UpdateOwn, DeleteOwn, Assign, Export,
            ],
            Resource::Quote => &[
                Read, Create, Update, Delete, ReadOwn, UpdateOwn, Approve, Export,
            ],
            Resource::Lead => &[Read, Create, Update, Delete, Assign, Export],
            Resource::Damage => &[Read, Create, Update, Delete, ReadOwn, UpdateOwn],
            Resource::Schedule => &[Read, Create, Update, Delete, ReadOwn, UpdateOwn, Assign],
            Resource::Material => &[Read, Create, Update, Delete],
            Resource::Invoice => &[Read, Create, Update, Delete, Approve, Export],
            Resource::Company => &[Read, Update, Delete, Purge],
            Resource::User => &[Read, Create, Update, Delete, ReadOwn, UpdateOwn, Assign],
            Resource::Supplier => &[Read, Create, Update, Delete, ReadOwn, UpdateOwn],
            Resource::Report => &[Read, Export],
        }
    }

    /// Whether `action` belongs to this resource's vocabulary.
    pub fn supports(self, action: Action) -> bool {
        self.vocabulary().contains(&action)
    }
}

/// Set of actions granted to a role on one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSet {
    wildcard: bool,
    actions: BTreeSet<Action>,
}

impl ActionSet {
    /// The empty set; denies everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The wildcard set; grants every action on the resource.
    pub fn all() -> Self {
        Self {
            wildcard: true,
            actions: BTreeSet::new(),
        }
    }

    /// True when the set grants `action`.
    pub fn contains(&self, action: Action) -> bool {
        self.wildcard || self.actions.contains(&action)
    }

    /// True when nothing is granted.
    pub fn is_empty(&self) -> bool {
        !self.wildcard && self.actions.is_empty()
    }

    /// True for a wildcard grant.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Explicitly listed actions (empty for a pure wildcard grant).
    pub fn actions(&self) -> impl Iterator<Item = Action> + '_ {
        self.actions.iter().copied()
    }
}

/// Errors raised while building a [`RoleMatrix`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    /// A table entry names a role that does not exist.
    #[error("unknown role '{0}'")]
    UnknownRole(String),
    /// A table entry names a resource that does not exist.
    #[error("unknown resource '{0}'")]
    UnknownResource(String),
    /// A table entry names an action that does not exist.
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    /// The action exists but is not valid for the resource.
    #[error("action '{action}' is not defined for resource '{resource}'")]
    ActionNotInVocabulary {
        /// Resource the grant targeted.
        resource: Resource,
        /// Offending action.
        action: Action,
    },
    /// A role has no grants at all.
    #[error("role '{0}' has no entries in the role matrix")]
    MissingRole(Role),
}

/// Static role → resource → allowed-actions table.
#[derive(Debug, Clone)]
pub struct RoleMatrix {
    grants: HashMap<(Role, Resource), ActionSet>,
}

impl RoleMatrix {
    /// Start an empty builder.
    pub fn builder() -> RoleMatrixBuilder {
        RoleMatrixBuilder::default()
    }

    /// Default permissions for the painting-contractor product.
    pub fn standard() -> Result<Self, MatrixError> {
        use Action::*;
        let mut builder = Self::builder();
        for resource in Resource::iter() {
            if resource != Resource::Company {
                builder = builder.grant_all(Role::Admin, resource);
            }
        }
        builder
            .grant(Role::Admin, Resource::Company, [Read, Update])
            .grant(Role::Painter, Resource::Project, [Read, UpdateOwn])
            .grant(Role::Painter, Resource::Schedule, [Read, UpdateOwn])
            .grant(Role::Painter, Resource::Damage, [Read, Create, UpdateOwn])
            .grant(Role::Painter, Resource::Material, [Read])
            .grant(Role::Painter, Resource::User, [ReadOwn, UpdateOwn])
            .grant(Role::Helpdesk, Resource::Project, [Read])
            .grant(Role::Helpdesk, Resource::Quote, [Read])
            .grant(Role::Helpdesk, Resource::Lead, [Read, Update])
            .grant(Role::Helpdesk, Resource::Damage, [Read])
            .grant(Role::Helpdesk, Resource::Schedule, [Read])
            .grant(Role::Helpdesk, Resource::Invoice, [Read])
            .grant(Role::Helpdesk, Resource::Company, [Read])
            .grant(Role::Helpdesk, Resource::User, [Read, Update])
            .grant(Role::Helpdesk, Resource::Supplier, [Read])
            .grant(Role::Helpdesk, Resource::Report, [Read])
            .grant(Role::Supplier, Resource::Material, [Read, Create, Update])
            .grant(Role::Supplier, Resource::Supplier, [ReadOwn, UpdateOwn])
            .grant(Role::Supplier, Resource::User, [ReadOwn, UpdateOwn])
            .build()
    }

    /// Build a matrix from a loosely typed table of `(role, resource, actions)`
    /// entries. Every name is parsed against the closed vocabularies, so a
    /// typo fails here instead of silently denying at decision time.
    pub fn from_table(entries: &[(&str, &str, &[&str])]) -> Result<Self, MatrixError> {
        let mut builder = Self::builder();
        for (role, resource, actions) in entries {
            let role =
                Role::from_str(role).map_err(|_| MatrixError::UnknownRole((*role).to_owned()))?;
            let resource = Resource::from_str(resource)
                .map_err(|_| MatrixError::UnknownResource((*resource).to_owned()))?;
            if actions.iter().any(|action| *action == WILDCARD) {
                builder = builder.grant_all(role, resource);
                continue;
            }
            let parsed = actions
                .iter()
                .map(|action| {
                    Action::from_str(action)
                        .map_err(|_| MatrixError::UnknownAction((*action).to_owned()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.grant(role, resource, parsed);
        }
        builder.build()
    }

    /// Actions granted to `role` on `resource`; empty when absent.
    pub fn allowed_actions(&self, role: Role, resource: Resource) -> ActionSet {
        self.grants
            .get(&(role, resource))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `role` may perform `action` on `resource`.
    pub fn permits(&self, role: Role, resource: Resource, action: Action) -> bool {
        self.grants
            .get(&(role, resource))
            .map(|set| set.contains(action))
            .unwrap_or(false)
    }
}

/// Accumulates grants and validates them on [`build`](RoleMatrixBuilder::build).
#[derive(Debug, Default)]
pub struct RoleMatrixBuilder {
    grants: HashMap<(Role, Resource), ActionSet>,
    errors: Vec<MatrixError>,
}

impl RoleMatrixBuilder {
    /// Grant explicit actions. Repeated grants for the same pair are merged.
    pub fn grant(
        mut self,
        role: Role,
        resource: Resource,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        let entry = self.grants.entry((role, resource)).or_default();
        for action in actions {
            if resource.supports(action) {
                entry.actions.insert(action);
            } else {
                self.errors
                    .push(MatrixError::ActionNotInVocabulary { resource, action });
            }
        }
        self
    }

    /// Grant every action on `resource`.
    pub fn grant_all(mut self, role: Role, resource: Resource) -> Self {
        self.grants.entry((role, resource)).or_default().wildcard = true;
        self
    }

    /// Validate and freeze the matrix.
    pub fn build(mut self) -> Result<RoleMatrix, MatrixError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        for role in Role::iter() {
            let present = self
                .grants
                .iter()
                .any(|((granted, _), set)| *granted == role && !set.is_empty());
            if !present {
                return Err(MatrixError::MissingRole(role));
            }
        }
        Ok(RoleMatrix {
            grants: self.grants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_matrix_builds() {
        let matrix = RoleMatrix::standard().unwrap();
        assert!(matrix.permits(Role::Admin, Resource::Project, Action::Delete));
        assert!(matrix.allowed_actions(Role::Admin, Resource::Lead).is_wildcard());
        assert!(!matrix.permits(Role::Admin, Resource::Company, Action::Purge));
    }

    #[test]
    fn painter_only_reads_and_updates_own_projects() {
        let matrix = RoleMatrix::standard().unwrap();
        let set = matrix.allowed_actions(Role::Painter, Resource::Project);
        assert_eq!(
            set.actions().collect::<Vec<_>>(),
            vec![Action::Read, Action::UpdateOwn]
        );
        assert!(!matrix.permits(Role::Painter, Resource::Project, Action::Delete));
    }

    #[test]
    fn absent_pairs_are_empty() {
        let matrix = RoleMatrix::standard().unwrap();
        for role in Role::iter() {
            for resource in Resource::iter() {
                let set = matrix.allowed_actions(role, resource);
                if !matrix.grants.contains_key(&(role, resource)) {
                    assert!(set.is_empty(), "{role}/{resource} should be empty");
                    for action in Action::iter() {
                        assert!(!set.contains(action));
                    }
                }
            }
        }
        assert!(matrix
            .allowed_actions(Role::Supplier, Resource::Invoice)
            .is_empty());
    }

    #[test]
    fn wildcard_grants_every_action() {
        let set = ActionSet::all();
        assert!(Action::iter().all(|action| set.contains(action)));
    }

    #[test]
    fn owner_scoped_actions_are_detected_by_suffix() {
        assert!(Action::UpdateOwn.is_owner_scoped());
        assert!(Action::DeleteOwn.is_owner_scoped());
        assert!(!Action::Update.is_owner_scoped());
    }

    #[test]
    fn table_typos_fail_at_build_time() {
        let all_roles: &[(&str, &str, &[&str])] = &[
            ("admin", "project", &["*"]),
            ("painter", "project", &["read"]),
            ("helpdesk", "project", &["read"]),
            ("supplier", "material", &["read"]),
        ];
        assert!(RoleMatrix::from_table(all_roles).is_ok());

        let err = RoleMatrix::from_table(&[("admin", "projct", &["read"])]).unwrap_err();
        assert_eq!(err, MatrixError::UnknownResource("projct".into()));

        let err = RoleMatrix::from_table(&[("admin", "project", &["raed"])]).unwrap_err();
        assert_eq!(err, MatrixError::UnknownAction("raed".into()));

        let err = RoleMatrix::from_table(&[("owner", "project", &["read"])]).unwrap_err();
        assert_eq!(err, MatrixError::UnknownRole("owner".into()));
    }

    #[test]
    fn grants_outside_vocabulary_are_rejected() {
        let err = RoleMatrix::builder()
            .grant(Role::Admin, Resource::Report, [Action::Delete])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            MatrixError::ActionNotInVocabulary {
                resource: Resource::Report,
                action: Action::Delete,
            }
        );
    }

    #[test]
    fn every_role_must_be_present() {
        let err = RoleMatrix::builder()
            .grant_all(Role::Admin, Resource::Project)
            .build()
            .unwrap_err();
        assert_eq!(err, MatrixError::MissingRole(Role::Painter));
    }
}
