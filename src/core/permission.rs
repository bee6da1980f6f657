use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display, EnumString)]
pub enum Role {
    Admin,
    #[default]
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub role: Role,
    pub visible_gpus: BTreeSet<u32>,
}

impl User {
    pub fn new(id: u32, username: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            username: username.into(),
            role,
            visible_gpus: BTreeSet::new(),
        }
    }

    pub fn with_visible_gpus(mut self, gpus: impl IntoIterator<Item = u32>) -> Self {
        self.visible_gpus = gpus.into_iter().collect();
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Answers "may this user use that GPU".
///
/// Unknown users are treated as non-admins with no visible GPUs.
#[cfg_attr(test, mockall::automock)]
pub trait PermissionOracle: Send + Sync {
    fn is_admin(&self, user_id: u32) -> Result<bool>;

    fn visible_gpu_ids(&self, user_id: u32) -> Result<BTreeSet<u32>>;
}
