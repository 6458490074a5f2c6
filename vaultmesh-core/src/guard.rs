//! Role/policy guard
//!
//! Every mutating controller entry point runs one of the `require_*` checks
//! before touching state. A failed check returns `Unauthorized` and the caller
//! returns early, so no partial mutation is possible.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use vaultmesh_gmp::ChainId;

use crate::error::{OrchestratorError, RequiredRole, Result};

/// An account or endpoint identity. Compared case-insensitively, like EVM
/// addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Principal(String);

impl Principal {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Principal {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Principal {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Roles a principal can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Dao,
    Guardian,
    Scheduler,
    Vault(ChainId),
}

/// Current role assignments
#[derive(Debug, Clone, Serialize)]
pub struct RoleBindings {
    pub dao: Principal,
    pub guardian: Principal,
    pub scheduler: Option<Principal>,
    pub vaults: BTreeMap<ChainId, Principal>,
}

/// Capability checks over the role bindings
#[derive(Debug, Clone)]
pub struct PolicyGuard {
    bindings: RoleBindings,
}

impl PolicyGuard {
    pub fn new(dao: Principal, guardian: Principal) -> Self {
        Self {
            bindings: RoleBindings {
                dao,
                guardian,
                scheduler: None,
                vaults: BTreeMap::new(),
            },
        }
    }

    pub fn with_scheduler(mut self, scheduler: Principal) -> Self {
        self.bindings.scheduler = Some(scheduler);
        self
    }

    pub fn bindings(&self) -> &RoleBindings {
        &self.bindings
    }

    /// Every role `caller` currently holds
    pub fn roles_of(&self, caller: &Principal) -> Vec<Role> {
        let mut roles = Vec::new();
        if *caller == self.bindings.dao {
            roles.push(Role::Dao);
        }
        if *caller == self.bindings.guardian {
            roles.push(Role::Guardian);
        }
        if self.bindings.scheduler.as_ref() == Some(caller) {
            roles.push(Role::Scheduler);
        }
        roles.extend(
            self.bindings
                .vaults
                .iter()
                .filter(|(_, p)| *p == caller)
                .map(|(chain_id, _)| Role::Vault(*chain_id)),
        );
        roles
    }

    pub fn require_dao(&self, caller: &Principal) -> Result<()> {
        self.check(*caller == self.bindings.dao, caller, RequiredRole::Dao)
    }

    pub fn require_guardian(&self, caller: &Principal) -> Result<()> {
        self.check(*caller == self.bindings.guardian, caller, RequiredRole::Guardian)
    }

    pub fn require_dao_or_scheduler(&self, caller: &Principal) -> Result<()> {
        let allowed = *caller == self.bindings.dao
            || self.bindings.scheduler.as_ref() == Some(caller);
        self.check(allowed, caller, RequiredRole::DaoOrScheduler)
    }

    pub fn require_guardian_or_dao(&self, caller: &Principal) -> Result<()> {
        let allowed = *caller == self.bindings.guardian || *caller == self.bindings.dao;
        self.check(allowed, caller, RequiredRole::GuardianOrDao)
    }

    /// Caller must be the registered vault endpoint of `chain_id`
    pub fn require_vault(&self, chain_id: ChainId, caller: &Principal) -> Result<()> {
        let allowed = self.bindings.vaults.get(&chain_id) == Some(caller);
        self.check(allowed, caller, RequiredRole::Vault(chain_id))
    }

    pub(crate) fn bind_vault(&mut self, chain_id: ChainId, principal: Principal) {
        self.bindings.vaults.insert(chain_id, principal);
    }

    pub(crate) fn unbind_vault(&mut self, chain_id: ChainId) {
        self.bindings.vaults.remove(&chain_id);
    }

    /// Replace the dao. Takes effect immediately; returns the previous dao.
    pub fn set_dao(&mut self, caller: &Principal, new_dao: Principal) -> Result<Principal> {
        self.require_dao(caller)?;
        Ok(std::mem::replace(&mut self.bindings.dao, new_dao))
    }

    /// Replace the guardian. Dao-only, so a guardian can never promote itself.
    pub fn set_guardian(&mut self, caller: &Principal, new_guardian: Principal) -> Result<Principal> {
        self.require_dao(caller)?;
        Ok(std::mem::replace(&mut self.bindings.guardian, new_guardian))
    }

    pub fn set_scheduler(
        &mut self,
        caller: &Principal,
        scheduler: Option<Principal>,
    ) -> Result<Option<Principal>> {
        self.require_dao(caller)?;
        Ok(std::mem::replace(&mut self.bindings.scheduler, scheduler))
    }

    fn check(&self, allowed: bool, caller: &Principal, required: RequiredRole) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(OrchestratorError::Unauthorized {
                caller: caller.to_string(),
                required,
            })
        }
    }
}
