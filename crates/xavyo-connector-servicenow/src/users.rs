//! Users: listing, account creation and enable/disable actions.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::client::TableQuery;
use crate::connector::{listing_token, resume_offset};
use crate::filter::EncodedQuery;
use crate::model::{decode_record, UserRecord, USERS_TABLE};
use crate::resource::{Page, Resource, ResourceType};
use crate::{ServiceNowConnector, ServiceNowError, ServiceNowResult};

/// Attributes for a new account. Accounts are created without a password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl AccountProfile {
    fn validate(&self) -> ServiceNowResult<()> {
        for (field, value) in [
            ("username", &self.username),
            ("email", &self.email),
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
        ] {
            if value.trim().is_empty() {
                return Err(ServiceNowError::InvalidProfile(format!(
                    "missing or empty '{field}'"
                )));
            }
        }
        Ok(())
    }
}

impl ServiceNowConnector {
    /// Lists users, one page per call.
    ///
    /// When `allowed_domains` is configured only users whose email ends with
    /// one of those domains are returned.
    #[instrument(skip(self))]
    pub async fn list_users(&self, token: &str) -> ServiceNowResult<Page<Resource>> {
        let offset = resume_offset(token, ResourceType::User, "")?;
        let query = TableQuery::new(EncodedQuery::email_domains(
            &self.config().allowed_domains,
        ))
        .fields(&self.user_fields())
        .limit(self.page_size())
        .offset(offset);

        let page = self.api().query(USERS_TABLE, &query).await?;
        let last = page.is_last(offset);
        let items: Vec<Resource> = page
            .decode::<UserRecord>()?
            .into_iter()
            .map(Resource::from)
            .collect();

        debug!(count = items.len(), offset, last, "Listed users");

        Ok(Page {
            items,
            next_token: listing_token(
                ResourceType::User,
                "",
                offset + u64::from(self.page_size()),
                last,
            )?,
        })
    }

    /// Fetches a user by `sys_id`.
    #[instrument(skip(self))]
    pub async fn get_user(&self, user_id: &str) -> ServiceNowResult<Resource> {
        if user_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("user"));
        }
        let record = self.api().get(USERS_TABLE, user_id, &self.user_fields()).await?;
        Ok(Resource::from(decode_record::<UserRecord>(record)?))
    }

    /// Creates an active account.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceNowError::InvalidProfile`] without sending anything
    /// when a required attribute is empty.
    #[instrument(skip(self), fields(username = %profile.username))]
    pub async fn create_account(&self, profile: &AccountProfile) -> ServiceNowResult<Resource> {
        profile.validate()?;

        let record = self
            .api()
            .create(
                USERS_TABLE,
                json!({
                    "user_name": profile.username,
                    "first_name": profile.first_name,
                    "last_name": profile.last_name,
                    "email": profile.email,
                    "active": "true",
                }),
            )
            .await?;

        let user = Resource::from(decode_record::<UserRecord>(record)?);
        info!(user_id = %user.id.id, "Created account");
        Ok(user)
    }

    /// Marks an account active.
    #[instrument(skip(self))]
    pub async fn enable_user(&self, user_id: &str) -> ServiceNowResult<()> {
        self.set_user_active(user_id, true).await
    }

    /// Marks an account inactive.
    #[instrument(skip(self))]
    pub async fn disable_user(&self, user_id: &str) -> ServiceNowResult<()> {
        self.set_user_active(user_id, false).await
    }

    async fn set_user_active(&self, user_id: &str, active: bool) -> ServiceNowResult<()> {
        if user_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("user"));
        }
        self.api()
            .update(USERS_TABLE, user_id, json!({ "active": active.to_string() }))
            .await?;
        info!(user_id, active, "Updated account status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_requires_every_field() {
        let profile = AccountProfile {
            username: "jdoe".into(),
            email: "jdoe@acme.com".into(),
            first_name: "Jane".into(),
            last_name: String::new(),
        };
        let err = profile.validate().unwrap_err();
        assert!(err.to_string().contains("last_name"));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_profile_deserializes() {
        let profile: AccountProfile = serde_json::from_str(
            r#"{"username":"jdoe","email":"jdoe@acme.com","first_name":"Jane","last_name":"Doe"}"#,
        )
        .unwrap();
        assert!(profile.validate().is_ok());
    }
}
