//! Organization and membership projections read from the identity provider.
//!
//! None of these are owned by the sync core. They are consumed to populate
//! the organization switcher and to report invitation results.

use serde::{Deserialize, Serialize};

/// An organization the user can switch into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    /// Organization ID, used verbatim as the scoping key when active.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Avatar image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Organization {
    /// Creates an organization without an image.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image_url: None,
        }
    }

    /// Sets the image reference.
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// The initial shown when no image is available.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskscope::domain::Organization;
    ///
    /// assert_eq!(Organization::new("o1", "acme").initial(), 'A');
    /// assert_eq!(Organization::new("o2", "").initial(), '?');
    /// ```
    pub fn initial(&self) -> char {
        self.name
            .chars()
            .next()
            .map_or('?', |c| c.to_ascii_uppercase())
    }
}

/// Role of a member inside an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemberRole {
    /// Organization administrator.
    #[serde(rename = "org:admin")]
    Admin,
    /// Regular member. Invitations use this role.
    #[default]
    #[serde(rename = "org:member")]
    Member,
}

impl MemberRole {
    /// Identity-provider wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "org:admin",
            Self::Member => "org:member",
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A membership record: which organization, and with what role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// The organization.
    pub organization: Organization,
    /// The user's role in it.
    pub role: MemberRole,
}

/// An invitation accepted by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    /// Target organization.
    pub organization_id: String,
    /// Invitee address, trimmed.
    pub email_address: String,
    /// Granted role.
    pub role: MemberRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_wire_names() {
        assert_eq!(
            serde_json::to_value(MemberRole::Member).unwrap(),
            serde_json::json!("org:member")
        );
        assert_eq!(MemberRole::Admin.to_string(), "org:admin");
        assert_eq!(MemberRole::default(), MemberRole::Member);
    }

    #[test]
    fn organization_serializes_camel_case() {
        let org = Organization::new("org_1", "Acme").with_image_url("https://img/acme.png");
        let json = serde_json::to_value(&org).unwrap();
        assert_eq!(json["imageUrl"], "https://img/acme.png");

        let plain = serde_json::to_value(Organization::new("org_2", "Beta")).unwrap();
        assert!(plain.get("imageUrl").is_none());
    }

    #[test]
    fn initial_is_uppercased() {
        assert_eq!(Organization::new("o", "beta team").initial(), 'B');
    }
}
