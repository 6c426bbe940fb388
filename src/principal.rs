//! Who is calling, and what they may do.
//!
//! The authentication stage resolves a [`Principal`] for every request and
//! stores it on the [`Request`](crate::Request). Unauthenticated callers get
//! [`Principal::anonymous`], never an absent value, so the permission gates
//! downstream only ever ask one question: what does this principal hold?

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Permission required to read movies.
pub const MOVIES_READ: &str = "movies:read";
/// Permission required to create, update or delete movies.
pub const MOVIES_WRITE: &str = "movies:write";

/// Stable identifier of a registered user.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller identity. `Anonymous` is the sentinel for "no credential presented".
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Identity {
    Anonymous,
    User(UserId),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// A set of permission codes such as `movies:read`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(BTreeSet<String>);

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn includes(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn insert(&mut self, code: impl Into<String>) {
        self.0.insert(code.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Permissions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Resolved identity and permission set of the caller for one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Principal {
    identity: Identity,
    activated: bool,
    permissions: Permissions,
}

impl Principal {
    /// The caller that presented no credential. Holds nothing.
    pub fn anonymous() -> Self {
        Self {
            identity: Identity::Anonymous,
            activated: false,
            permissions: Permissions::new(),
        }
    }

    pub fn user(id: UserId, activated: bool, permissions: Permissions) -> Self {
        Self { identity: Identity::User(id), activated, permissions }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity == Identity::Anonymous
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn has_permission(&self, code: &str) -> bool {
        self.permissions.includes(code)
    }
}

impl Default for Principal {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_holds_nothing() {
        let p = Principal::anonymous();
        assert!(p.is_anonymous());
        assert!(!p.is_activated());
        assert!(p.permissions().is_empty());
        assert!(!p.has_permission(MOVIES_READ));
        assert_eq!(p.identity().to_string(), "anonymous");
    }

    #[test]
    fn user_permissions_are_exact_codes() {
        let p = Principal::user(UserId(7), true, [MOVIES_READ].into_iter().collect());
        assert!(!p.is_anonymous());
        assert!(p.has_permission("movies:read"));
        assert!(!p.has_permission("movies:write"));
        assert!(!p.has_permission("movies"));
        assert_eq!(p.identity().to_string(), "user:7");
    }

    #[test]
    fn permissions_serialize_as_sorted_list() {
        let perms: Permissions = ["movies:write", "movies:read"].into_iter().collect();
        let json = serde_json::to_string(&perms).unwrap();
        assert_eq!(json, r#"["movies:read","movies:write"]"#);
    }
}
