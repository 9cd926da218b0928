//! Access-control policy embedded in object metadata.
//!
//! The JSON form is what lands in the reserved metadata field, e.g.
//! `{"owner":"u1","visibility":"private","aclRules":[{"group":{"type":"static","id":"g1"},"permission":"read"}]}`.

use serde::{Deserialize, Serialize};

/// Requested or granted access level.
///
/// Ordered so that `Write > Read`: a grant satisfies every request at or
/// below its own level.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    /// True when a grant of `self` covers a request for `requested`.
    pub fn satisfies(self, requested: Permission) -> bool {
        self >= requested
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// Reference to a group whose membership is resolved by a registered checker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessGroup {
    /// Checker tag, looked up in the group registry.
    #[serde(rename = "type")]
    pub group_type: String,
    pub id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AclRule {
    pub group: AccessGroup,
    pub permission: Permission,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AclPolicy {
    pub owner: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub acl_rules: Vec<AclRule>,
}

impl AclPolicy {
    pub fn new(owner: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            owner: owner.into(),
            visibility,
            acl_rules: Vec::new(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }
}
