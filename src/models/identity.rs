//! Viewer identity returned by the identity provider.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profile of the caller behind an authorization token.
///
/// `userid` is `None` for anonymous callers. Other profile fields are kept
/// so the cached record round-trips unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub userid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A group the caller is a member of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: Map::new(),
        }
    }
}

/// Resolved identity of a request: profile plus group memberships.
///
/// This is the value cached under `profile|{token}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub profile: Profile,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Principal {
    pub fn new(profile: Profile, groups: Vec<Group>) -> Self {
        Self { profile, groups }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn principal_keeps_unknown_profile_fields() {
        let value = json!({
            "profile": {"userid": "acct:alice@x.test", "authority": "x.test"},
            "groups": [{"id": "g1", "name": "Group One"}]
        });

        let principal: Principal = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(principal.profile.userid.as_deref(), Some("acct:alice@x.test"));
        assert_eq!(principal.groups[0].id, "g1");
        assert_eq!(serde_json::to_value(&principal).unwrap(), value);
    }

    #[test]
    fn anonymous_profile_has_no_userid() {
        let profile: Profile = serde_json::from_value(json!({"userid": null})).unwrap();
        assert!(profile.userid.is_none());
    }
}
