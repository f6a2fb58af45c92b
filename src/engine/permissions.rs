// Permission predicates consulted before guarded transitions

//! The engine treats permission checks as opaque booleans. It asks a
//! [`PermissionPolicy`] before starting a process as a user, assigning or
//! executing a human task, and before administrative transitions
//! (cancel, undo, revive, retry). System callers (`Caller::system()`) are
//! never checked.

use std::collections::{HashMap, HashSet};

use crate::models::Task;

pub trait PermissionPolicy: Send + Sync {
    /// May `user` start a process through a start node guarded by `permission`?
    fn can_start(&self, user: &str, permission: Option<&str>) -> bool;

    /// May `user` take (or be given) this task?
    fn can_assign(&self, user: &str, task: &Task) -> bool;

    /// May `user` execute this task? Ownership is checked separately.
    fn can_execute(&self, user: &str, task: &Task) -> bool;

    /// May `user` cancel, undo, revive or retry this task?
    fn can_manage(&self, user: &str, task: &Task) -> bool;
}

/// Grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
    fn can_start(&self, _user: &str, _permission: Option<&str>) -> bool {
        true
    }

    fn can_assign(&self, _user: &str, _task: &Task) -> bool {
        true
    }

    fn can_execute(&self, _user: &str, _task: &Task) -> bool {
        true
    }

    fn can_manage(&self, _user: &str, _task: &Task) -> bool {
        true
    }
}

/// Static per-user permission grants plus a set of managers.
///
/// A task or start node without a permission descriptor is open to every
/// user. Managers hold every permission.
#[derive(Debug, Default, Clone)]
pub struct RolePermissions {
    grants: HashMap<String, HashSet<String>>,
    managers: HashSet<String>,
}

impl RolePermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant<U: Into<String>, P: Into<String>>(mut self, user: U, permission: P) -> Self {
        self.grants.entry(user.into()).or_default().insert(permission.into());
        self
    }

    pub fn manager<U: Into<String>>(mut self, user: U) -> Self {
        self.managers.insert(user.into());
        self
    }

    fn holds(&self, user: &str, permission: Option<&str>) -> bool {
        match permission {
            None => true,
            Some(_) if self.managers.contains(user) => true,
            Some(permission) => self
                .grants
                .get(user)
                .map_or(false, |granted| granted.contains(permission)),
        }
    }
}

impl PermissionPolicy for RolePermissions {
    fn can_start(&self, user: &str, permission: Option<&str>) -> bool {
        self.holds(user, permission)
    }

    fn can_assign(&self, user: &str, task: &Task) -> bool {
        self.holds(user, task.owner_permission.as_deref())
    }

    fn can_execute(&self, user: &str, task: &Task) -> bool {
        self.holds(user, task.owner_permission.as_deref())
    }

    fn can_manage(&self, user: &str, _task: &Task) -> bool {
        self.managers.contains(user)
    }
}
