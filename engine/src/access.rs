//! # Access Control
//!
//! One capability table per vault. Every privileged entry point calls
//! [`AccessControl::authorize`] with the caller and the [`Capability`] it
//! needs; the table resolves the capability to the role that grants it.
//!
//! | Capability          | Role              |
//! |---------------------|-------------------|
//! | `ManageStrategies`  | `StrategyManager` |
//! | `Rebalance`         | `VaultManager`    |
//! | `Pause`             | `VaultManager`    |
//! | `Harvest`           | `VaultManager`    |
//! | `RelayMessages`     | `Relayer`         |
//! | everything else     | `Admin`           |
//!
//! `Admin` implicitly holds every capability.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    StrategyManager,
    VaultManager,
    Relayer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::StrategyManager => "strategy_manager",
            Role::VaultManager => "vault_manager",
            Role::Relayer => "relayer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    ManageStrategies,
    Rebalance,
    Pause,
    Harvest,
    SetFeeRecipient,
    SetFees,
    EmergencyShutdown,
    ConfigureChains,
    RelayMessages,
    GrantRoles,
    RecoverFunds,
}

impl Capability {
    /// The role that grants this capability (besides `Admin`).
    pub fn required_role(self) -> Role {
        match self {
            Capability::ManageStrategies => Role::StrategyManager,
            Capability::Rebalance | Capability::Pause | Capability::Harvest => Role::VaultManager,
            Capability::RelayMessages => Role::Relayer,
            Capability::SetFeeRecipient
            | Capability::SetFees
            | Capability::EmergencyShutdown
            | Capability::ConfigureChains
            | Capability::GrantRoles
            | Capability::RecoverFunds => Role::Admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("{caller} lacks {capability:?} (requires role {required})")]
    Unauthorized {
        caller: Address,
        capability: Capability,
        required: Role,
    },

    #[error("{caller} cannot act for {owner}")]
    NotOwner { caller: Address, owner: Address },

    #[error("cannot revoke the last admin")]
    LastAdmin,
}

/// Address → roles table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    roles: BTreeMap<Address, BTreeSet<Role>>,
}

impl AccessControl {
    /// A table whose only entry is `admin` holding [`Role::Admin`].
    pub fn with_admin(admin: Address) -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(admin, BTreeSet::from([Role::Admin]));
        Self { roles }
    }

    pub fn has_role(&self, account: &Address, role: Role) -> bool {
        self.roles
            .get(account)
            .map(|set| set.contains(&role))
            .unwrap_or(false)
    }

    pub fn roles_of(&self, account: &Address) -> Vec<Role> {
        self.roles
            .get(account)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn members(&self, role: Role) -> Vec<Address> {
        self.roles
            .iter()
            .filter(|(_, set)| set.contains(&role))
            .map(|(a, _)| a.clone())
            .collect()
    }

    pub fn authorize(&self, caller: &Address, capability: Capability) -> Result<(), AccessError> {
        let required = capability.required_role();
        if self.has_role(caller, Role::Admin) || self.has_role(caller, required) {
            return Ok(());
        }
        tracing::warn!(%caller, ?capability, "unauthorized call rejected");
        Err(AccessError::Unauthorized {
            caller: caller.clone(),
            capability,
            required,
        })
    }

    /// Grants `role` to `account`. Returns `false` if it was already held.
    pub fn grant(&mut self, caller: &Address, account: &Address, role: Role) -> Result<bool, AccessError> {
        self.authorize(caller, Capability::GrantRoles)?;
        Ok(self.roles.entry(account.clone()).or_default().insert(role))
    }

    /// Revokes `role` from `account`. Returns `false` if it was not held.
    pub fn revoke(&mut self, caller: &Address, account: &Address, role: Role) -> Result<bool, AccessError> {
        self.authorize(caller, Capability::GrantRoles)?;
        if role == Role::Admin && self.has_role(account, Role::Admin) && self.members(Role::Admin).len() == 1 {
            return Err(AccessError::LastAdmin);
        }
        let Some(set) = self.roles.get_mut(account) else {
            return Ok(false);
        };
        let removed = set.remove(&role);
        if set.is_empty() {
            self.roles.remove(account);
        }
        Ok(removed)
    }
}
