//! Pre-resolved caller identity and capabilities.
//!
//! Permission lookup (roles, menus) happens outside the ledger. Callers resolve
//! an [`Actor`] once per session and pass it in; the ledger only checks the
//! capability an operation requires and records the user for audit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;

/// Ledger resources guarded by capabilities.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Movements,
    Reservations,
    Adjustments,
    Fulfillment,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Movements => "movements",
            Resource::Reservations => "reservations",
            Resource::Adjustments => "adjustments",
            Resource::Fulfillment => "fulfillment",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Create,
    Read,
    Update,
    Delete,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Create => "create",
            Capability::Read => "read",
            Capability::Update => "update",
            Capability::Delete => "delete",
        }
    }
}

/// Explicit {create, read, update, delete} grant for one resource.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
}

impl CapabilitySet {
    pub const NONE: CapabilitySet = CapabilitySet {
        create: false,
        read: false,
        update: false,
        delete: false,
    };

    pub const ALL: CapabilitySet = CapabilitySet {
        create: true,
        read: true,
        update: true,
        delete: true,
    };

    pub const READ_ONLY: CapabilitySet = CapabilitySet {
        create: false,
        read: true,
        update: false,
        delete: false,
    };

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Create => self.create,
            Capability::Read => self.read,
            Capability::Update => self.update,
            Capability::Delete => self.delete,
        }
    }
}

/// Authenticated caller acting on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    user_id: UserId,
    grants: HashMap<Resource, CapabilitySet>,
}

impl Actor {
    /// An actor with no grants.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            grants: HashMap::new(),
        }
    }

    /// An actor holding every capability on every resource (jobs, migrations, tests).
    pub fn system(user_id: UserId) -> Self {
        [
            Resource::Movements,
            Resource::Reservations,
            Resource::Adjustments,
            Resource::Fulfillment,
        ]
        .into_iter()
        .fold(Self::new(user_id), |actor, r| actor.with_grant(r, CapabilitySet::ALL))
    }

    pub fn with_grant(mut self, resource: Resource, set: CapabilitySet) -> Self {
        self.grants.insert(resource, set);
        self
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn can(&self, resource: Resource, capability: Capability) -> bool {
        self.grants
            .get(&resource)
            .map(|set| set.allows(capability))
            .unwrap_or(false)
    }

    pub fn require(&self, resource: Resource, capability: Capability) -> DomainResult<()> {
        if self.can(resource, capability) {
            Ok(())
        } else {
            Err(DomainError::unauthorized(format!(
                "user {} lacks '{}' on '{}'",
                self.user_id,
                capability.as_str(),
                resource.as_str()
            )))
        }
    }
}
