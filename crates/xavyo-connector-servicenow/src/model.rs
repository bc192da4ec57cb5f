//! Typed Table API records.
//!
//! The Table API returns every scalar as a string. Flags arrive as
//! `"true"`/`"false"` (sometimes `"1"`/`"0"`), so they are decoded leniently.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub(crate) const USERS_TABLE: &str = "sys_user";
pub(crate) const GROUPS_TABLE: &str = "sys_user_group";
pub(crate) const ROLES_TABLE: &str = "sys_user_role";
pub(crate) const GROUP_MEMBERS_TABLE: &str = "sys_user_grmember";
pub(crate) const USER_ROLES_TABLE: &str = "sys_user_has_role";
pub(crate) const GROUP_ROLES_TABLE: &str = "sys_group_has_role";

pub(crate) const USER_FIELDS: &[&str] = &[
    "sys_id",
    "name",
    "user_name",
    "email",
    "first_name",
    "last_name",
    "active",
];
pub(crate) const GROUP_FIELDS: &[&str] = &["sys_id", "name", "description"];
pub(crate) const ROLE_FIELDS: &[&str] = &["sys_id", "name", "grantable"];
pub(crate) const GROUP_MEMBER_FIELDS: &[&str] = &["sys_id", "user", "group"];
pub(crate) const USER_ROLE_FIELDS: &[&str] = &["sys_id", "user", "role", "inherited"];
pub(crate) const GROUP_ROLE_FIELDS: &[&str] = &["sys_id", "group", "role", "inherits"];

/// Returns true for the truthy spellings the instance uses.
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(value, "true" | "True" | "TRUE" | "1")
}

/// Decodes a flag that may be a JSON bool, a string or missing.
pub(crate) fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => is_truthy(&s),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    })
}

/// Decodes a string that may be `null`.
pub(crate) fn null_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decodes a reference that is either a bare `sys_id` or a
/// `{ "value": ..., "link": ... }` object.
pub(crate) fn reference_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Object(map)) => map
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    })
}

/// Row of `sys_user`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub sys_id: String,
    pub name: String,
    pub user_name: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub active: bool,
    /// Custom `u_*` string columns.
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawUserRecord {
    #[serde(default)]
    sys_id: String,
    #[serde(default, deserialize_with = "null_string")]
    name: String,
    #[serde(default, deserialize_with = "null_string")]
    user_name: String,
    #[serde(default, deserialize_with = "null_string")]
    email: String,
    #[serde(default, deserialize_with = "null_string")]
    first_name: String,
    #[serde(default, deserialize_with = "null_string")]
    last_name: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    active: bool,
    #[serde(flatten)]
    rest: BTreeMap<String, Value>,
}

impl<'de> Deserialize<'de> for UserRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawUserRecord::deserialize(deserializer)?;
        let custom_fields = raw
            .rest
            .into_iter()
            .filter(|(key, _)| key.starts_with("u_"))
            .filter_map(|(key, value)| match value {
                Value::String(s) => Some((key, s)),
                _ => None,
            })
            .collect();

        Ok(UserRecord {
            sys_id: raw.sys_id,
            name: raw.name,
            user_name: raw.user_name,
            email: raw.email,
            first_name: raw.first_name,
            last_name: raw.last_name,
            active: raw.active,
            custom_fields,
        })
    }
}

impl UserRecord {
    /// Display name, falling back to first and last name, then login.
    #[must_use]
    pub fn display_name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        let full = format!("{} {}", self.first_name, self.last_name);
        if full.trim().is_empty() {
            self.user_name.clone()
        } else {
            full.trim().to_string()
        }
    }
}

/// Row of `sys_user_group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    #[serde(default)]
    pub sys_id: String,
    #[serde(default, deserialize_with = "null_string")]
    pub name: String,
    #[serde(default, deserialize_with = "null_string")]
    pub description: String,
}

/// Row of `sys_user_role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleRecord {
    #[serde(default)]
    pub sys_id: String,
    #[serde(default, deserialize_with = "null_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub grantable: bool,
}

/// Row of `sys_user_grmember`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMemberRecord {
    #[serde(default)]
    pub sys_id: String,
    #[serde(default, deserialize_with = "reference_id")]
    pub user: String,
    #[serde(default, deserialize_with = "reference_id")]
    pub group: String,
}

/// Row of `sys_user_has_role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRoleRecord {
    #[serde(default)]
    pub sys_id: String,
    #[serde(default, deserialize_with = "reference_id")]
    pub user: String,
    #[serde(default, deserialize_with = "reference_id")]
    pub role: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub inherited: bool,
}

/// Row of `sys_group_has_role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRoleRecord {
    #[serde(default)]
    pub sys_id: String,
    #[serde(default, deserialize_with = "reference_id")]
    pub group: String,
    #[serde(default, deserialize_with = "reference_id")]
    pub role: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub inherits: bool,
}

/// Decodes a single record.
pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(
    record: Value,
) -> crate::ServiceNowResult<T> {
    Ok(serde_json::from_value(record)?)
}
