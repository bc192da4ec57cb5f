//! Normalized resources, entitlements and grants.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{GroupRecord, RoleRecord, UserRecord};
use crate::{ServiceNowError, ServiceNowResult};

/// The only relation this connector grants.
pub const MEMBER_SLUG: &str = "member";

/// Kind of object mirrored from the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    User,
    Group,
    Role,
}

impl ResourceType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::User => "user",
            ResourceType::Group => "group",
            ResourceType::Role => "role",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ServiceNowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ResourceType::User),
            "group" => Ok(ResourceType::Group),
            "role" => Ok(ResourceType::Role),
            other => Err(ServiceNowError::InvalidEntitlement(format!(
                "unknown resource type '{other}'"
            ))),
        }
    }
}

/// Typed reference to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub resource_type: ResourceType,
    pub id: String,
}

impl ResourceId {
    #[must_use]
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::new(ResourceType::User, id)
    }

    #[must_use]
    pub fn group(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Group, id)
    }

    #[must_use]
    pub fn role(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Role, id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.id)
    }
}

/// Whether a user account can sign in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Enabled,
    Disabled,
}

/// User attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTrait {
    pub login: String,
    pub email: String,
    pub status: AccountStatus,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, String>,
}

/// Group attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTrait {
    pub description: String,
}

/// Role attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleTrait {
    pub name: String,
}

/// Type-specific payload of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceTraits {
    User(UserTrait),
    Group(GroupTrait),
    Role(RoleTrait),
}

/// A mirrored user, group or role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub display_name: String,
    pub traits: ResourceTraits,
}

impl From<UserRecord> for Resource {
    fn from(user: UserRecord) -> Self {
        let display_name = user.display_name();
        Resource {
            id: ResourceId::user(user.sys_id),
            display_name,
            traits: ResourceTraits::User(UserTrait {
                login: user.user_name,
                email: user.email,
                status: if user.active {
                    AccountStatus::Enabled
                } else {
                    AccountStatus::Disabled
                },
                first_name: user.first_name,
                last_name: user.last_name,
                custom_fields: user.custom_fields,
            }),
        }
    }
}

impl From<GroupRecord> for Resource {
    fn from(group: GroupRecord) -> Self {
        Resource {
            id: ResourceId::group(group.sys_id),
            display_name: group.name,
            traits: ResourceTraits::Group(GroupTrait {
                description: group.description,
            }),
        }
    }
}

impl From<RoleRecord> for Resource {
    fn from(role: RoleRecord) -> Self {
        Resource {
            id: ResourceId::role(role.sys_id),
            display_name: role.name.clone(),
            traits: ResourceTraits::Role(RoleTrait { name: role.name }),
        }
    }
}

/// A grantable relation on a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    /// `<type>:<id>:<slug>`.
    pub id: String,
    pub resource: ResourceId,
    pub slug: String,
    pub display_name: String,
    pub description: String,
    pub grantable_to: Vec<ResourceType>,
}

impl Entitlement {
    /// The `member` entitlement of a role or group.
    #[must_use]
    pub fn member_of(resource: &Resource) -> Self {
        let grantable_to = match resource.id.resource_type {
            ResourceType::Role => vec![ResourceType::User, ResourceType::Group],
            _ => vec![ResourceType::User],
        };
        let kind = resource.id.resource_type;
        Entitlement {
            id: entitlement_id(&resource.id, MEMBER_SLUG),
            resource: resource.id.clone(),
            slug: MEMBER_SLUG.to_string(),
            display_name: format!("{} {kind} {MEMBER_SLUG}", resource.display_name),
            description: format!("Member of {} {kind}", resource.display_name),
            grantable_to,
        }
    }
}

/// Formats `<type>:<id>:<slug>`.
#[must_use]
pub fn entitlement_id(resource: &ResourceId, slug: &str) -> String {
    format!("{}:{}:{slug}", resource.resource_type, resource.id)
}

/// Splits an entitlement id back into its resource and slug.
///
/// # Errors
///
/// Returns [`ServiceNowError::InvalidEntitlement`] unless the id has exactly
/// three non-empty parts and a known resource type.
pub fn parse_entitlement_id(id: &str) -> ServiceNowResult<(ResourceId, String)> {
    let parts: Vec<&str> = id.split(':').collect();
    match parts.as_slice() {
        [kind, resource_id, slug] if !resource_id.is_empty() && !slug.is_empty() => {
            let resource_type = kind.parse::<ResourceType>()?;
            Ok((
                ResourceId::new(resource_type, *resource_id),
                (*slug).to_string(),
            ))
        }
        _ => Err(ServiceNowError::InvalidEntitlement(id.to_string())),
    }
}

/// Lets a consumer expand a group-level grant into member grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantExpansion {
    pub entitlement_ids: Vec<String>,
    /// Expand one level only.
    pub shallow: bool,
}

impl GrantExpansion {
    /// Expansion over the group's `member` entitlement.
    #[must_use]
    pub fn group_members(group_id: &str) -> Self {
        Self {
            entitlement_ids: vec![entitlement_id(&ResourceId::group(group_id), MEMBER_SLUG)],
            shallow: true,
        }
    }
}

/// A principal holding an entitlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub entitlement_id: String,
    pub principal: Resource,
    /// The assignment came through role or group inheritance.
    #[serde(default)]
    pub inherited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion: Option<GrantExpansion>,
}

impl Grant {
    #[must_use]
    pub fn new(entitlement_id: impl Into<String>, principal: Resource) -> Self {
        Self {
            entitlement_id: entitlement_id.into(),
            principal,
            inherited: false,
            expansion: None,
        }
    }

    #[must_use]
    pub fn inherited(mut self, inherited: bool) -> Self {
        self.inherited = inherited;
        self
    }

    #[must_use]
    pub fn expandable(mut self, expansion: GrantExpansion) -> Self {
        self.expansion = Some(expansion);
        self
    }
}

/// A page of results plus the token for the next call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` once the listing is complete.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.next_token.is_none()
    }
}
