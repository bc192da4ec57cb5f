//! Groups and group membership.

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::client::TableQuery;
use crate::connector::{listing_token, resume_offset};
use crate::filter::EncodedQuery;
use crate::model::{
    decode_record, GroupMemberRecord, GroupRecord, UserRecord, GROUPS_TABLE, GROUP_FIELDS,
    GROUP_MEMBERS_TABLE, GROUP_MEMBER_FIELDS, USERS_TABLE,
};
use crate::resource::{
    entitlement_id, Entitlement, Grant, Page, Resource, ResourceId, ResourceType, MEMBER_SLUG,
};
use crate::roles::{check_principal, MutationOutcome, RecordId};
use crate::{ServiceNowConnector, ServiceNowError, ServiceNowResult};

fn membership_query(group_id: &str, user_id: &str) -> EncodedQuery {
    EncodedQuery::eq("group", group_id).and_eq("user", user_id)
}

impl ServiceNowConnector {
    /// Lists groups, one page per call.
    #[instrument(skip(self))]
    pub async fn list_groups(&self, token: &str) -> ServiceNowResult<Page<Resource>> {
        let offset = resume_offset(token, ResourceType::Group, "")?;
        let query = TableQuery::new(EncodedQuery::new())
            .fields(GROUP_FIELDS)
            .limit(self.page_size())
            .offset(offset);

        let page = self.api().query(GROUPS_TABLE, &query).await?;
        let last = page.is_last(offset);
        let items: Vec<Resource> = page
            .decode::<GroupRecord>()?
            .into_iter()
            .map(Resource::from)
            .collect();

        debug!(count = items.len(), offset, last, "Listed groups");

        Ok(Page {
            items,
            next_token: listing_token(
                ResourceType::Group,
                "",
                offset + u64::from(self.page_size()),
                last,
            )?,
        })
    }

    /// Fetches a group by `sys_id`.
    #[instrument(skip(self))]
    pub async fn get_group(&self, group_id: &str) -> ServiceNowResult<Resource> {
        if group_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("group"));
        }
        let record = self.api().get(GROUPS_TABLE, group_id, GROUP_FIELDS).await?;
        Ok(Resource::from(decode_record::<GroupRecord>(record)?))
    }

    /// The `member` entitlement of a group, grantable to users.
    #[must_use]
    pub fn group_entitlements(&self, group: &Resource) -> Vec<Entitlement> {
        vec![Entitlement::member_of(group)]
    }

    /// Returns one page of group members as grants.
    ///
    /// Membership rows pointing at users that no longer resolve are skipped.
    #[instrument(skip(self, token))]
    pub async fn group_grants(
        &self,
        group_id: &str,
        token: &str,
    ) -> ServiceNowResult<Page<Grant>> {
        if group_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("group"));
        }

        let offset = resume_offset(token, ResourceType::Group, group_id)?;
        let query = TableQuery::new(EncodedQuery::eq("group", group_id))
            .fields(GROUP_MEMBER_FIELDS)
            .limit(self.page_size())
            .offset(offset);

        let page = self.api().query(GROUP_MEMBERS_TABLE, &query).await?;
        let last = page.is_last(offset);
        let entitlement = entitlement_id(&ResourceId::group(group_id), MEMBER_SLUG);

        let user_fields = self.user_fields();
        let mut grants = Vec::new();
        for member in page.decode::<GroupMemberRecord>()? {
            if member.user.is_empty() {
                continue;
            }
            let record = match self.api().get(USERS_TABLE, &member.user, &user_fields).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    warn!(group_id, user = %member.user, "Group member not found, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let user = Resource::from(decode_record::<UserRecord>(record)?);
            grants.push(Grant::new(entitlement.clone(), user));
        }

        Ok(Page {
            items: grants,
            next_token: listing_token(
                ResourceType::Group,
                group_id,
                offset + u64::from(self.page_size()),
                last,
            )?,
        })
    }

    /// Adds a user to a group unless a membership already exists.
    #[instrument(skip(self))]
    pub async fn add_member(
        &self,
        principal: &ResourceId,
        group_id: &str,
    ) -> ServiceNowResult<MutationOutcome> {
        check_principal(principal, &[ResourceType::User], "group membership")?;
        if group_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("group"));
        }

        let existing = self
            .api()
            .query(
                GROUP_MEMBERS_TABLE,
                &TableQuery::new(membership_query(group_id, &principal.id))
                    .fields(&["sys_id"])
                    .limit(1),
            )
            .await?;

        if !existing.records.is_empty() {
            warn!(%principal, group_id, "User is already a member of the group");
            return Ok(MutationOutcome::AlreadyGranted);
        }

        self.api()
            .create(
                GROUP_MEMBERS_TABLE,
                json!({ "user": principal.id, "group": group_id }),
            )
            .await?;

        info!(%principal, group_id, "Added user to group");
        Ok(MutationOutcome::Granted)
    }

    /// Removes every membership record linking the user to the group.
    #[instrument(skip(self))]
    pub async fn remove_member(
        &self,
        principal: &ResourceId,
        group_id: &str,
    ) -> ServiceNowResult<MutationOutcome> {
        check_principal(principal, &[ResourceType::User], "group membership")?;
        if group_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("group"));
        }

        let memberships: Vec<RecordId> = self
            .query_all(
                GROUP_MEMBERS_TABLE,
                membership_query(group_id, &principal.id),
                &["sys_id"],
            )
            .await?;

        if memberships.is_empty() {
            warn!(%principal, group_id, "User is not a member of the group");
            return Ok(MutationOutcome::AlreadyRevoked);
        }

        let removed = self.delete_all(GROUP_MEMBERS_TABLE, &memberships).await?;
        info!(%principal, group_id, removed, "Removed user from group");
        Ok(MutationOutcome::Revoked { removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_query() {
        assert_eq!(membership_query("g1", "u1").as_str(), "group=g1^user=u1");
    }
}
