//! Roles: listing, role grants enumeration and role assignment.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::client::TableQuery;
use crate::connector::{listing_token, resume_offset};
use crate::cursor::{Frame, PageCursor};
use crate::filter::EncodedQuery;
use crate::model::{
    decode_record, GroupRecord, GroupRoleRecord, RoleRecord, UserRecord, UserRoleRecord,
    GROUPS_TABLE, GROUP_FIELDS, GROUP_ROLES_TABLE, GROUP_ROLE_FIELDS, ROLES_TABLE, ROLE_FIELDS,
    USERS_TABLE, USER_ROLES_TABLE, USER_ROLE_FIELDS,
};
use crate::resource::{
    entitlement_id, Entitlement, Grant, GrantExpansion, Page, Resource, ResourceId,
    ResourceType, MEMBER_SLUG,
};
use crate::{ServiceNowConnector, ServiceNowError, ServiceNowResult};

/// Result of an idempotent grant or revoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// A record was created.
    Granted,
    /// The principal already held the entitlement; nothing was written.
    AlreadyGranted,
    /// Every matching record was deleted.
    Revoked { removed: usize },
    /// The principal did not hold the entitlement; nothing was deleted.
    AlreadyRevoked,
}

impl MutationOutcome {
    /// Returns true when the store was changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(
            self,
            MutationOutcome::Granted | MutationOutcome::Revoked { .. }
        )
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecordId {
    pub sys_id: String,
}

/// Checks principal type and ids before anything is sent.
pub(crate) fn check_principal(
    principal: &ResourceId,
    allowed: &[ResourceType],
    operation: &'static str,
) -> ServiceNowResult<()> {
    if !allowed.contains(&principal.resource_type) {
        return Err(ServiceNowError::InvalidPrincipal {
            principal_type: principal.resource_type,
            operation,
        });
    }
    if principal.id.trim().is_empty() {
        return Err(ServiceNowError::MissingId("principal"));
    }
    Ok(())
}

/// Assignment table and principal column for a principal type.
fn assignment_table(principal_type: ResourceType) -> (&'static str, &'static str) {
    match principal_type {
        ResourceType::Group => (GROUP_ROLES_TABLE, "group"),
        _ => (USER_ROLES_TABLE, "user"),
    }
}

fn assignment_query(role_id: &str, principal: &ResourceId) -> EncodedQuery {
    let (_, column) = assignment_table(principal.resource_type);
    EncodedQuery::eq("role", role_id).and_eq(column, &principal.id)
}

/// Accepts only the stacks `role_grants` itself produces, bottom to top:
/// `[Role]`, `[Group]` and `[Group, User]`.
fn check_grants_stack(cursor: &PageCursor) -> ServiceNowResult<()> {
    let shape: Vec<ResourceType> = cursor.frames().iter().map(|f| f.resource_type).collect();
    match shape.as_slice() {
        [ResourceType::Role] | [ResourceType::Group] | [ResourceType::Group, ResourceType::User] => {
            Ok(())
        }
        _ => Err(ServiceNowError::InvalidCursor(format!(
            "unexpected frame stack for role grants: {shape:?}"
        ))),
    }
}

impl ServiceNowConnector {
    /// Lists grantable roles, one page per call.
    #[instrument(skip(self))]
    pub async fn list_roles(&self, token: &str) -> ServiceNowResult<Page<Resource>> {
        let offset = resume_offset(token, ResourceType::Role, "")?;
        let query = TableQuery::new(EncodedQuery::eq("grantable", "true"))
            .fields(ROLE_FIELDS)
            .limit(self.page_size())
            .offset(offset);

        let page = self.api().query(ROLES_TABLE, &query).await?;
        let last = page.is_last(offset);
        let items: Vec<Resource> = page
            .decode::<RoleRecord>()?
            .into_iter()
            .map(Resource::from)
            .collect();

        debug!(count = items.len(), offset, last, "Listed roles");

        Ok(Page {
            items,
            next_token: listing_token(
                ResourceType::Role,
                "",
                offset + u64::from(self.page_size()),
                last,
            )?,
        })
    }

    /// Fetches a role by `sys_id`.
    #[instrument(skip(self))]
    pub async fn get_role(&self, role_id: &str) -> ServiceNowResult<Resource> {
        if role_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("role"));
        }
        let record = self.api().get(ROLES_TABLE, role_id, ROLE_FIELDS).await?;
        Ok(Resource::from(decode_record::<RoleRecord>(record)?))
    }

    /// The `member` entitlement of a role, grantable to users and groups.
    #[must_use]
    pub fn role_entitlements(&self, role: &Resource) -> Vec<Entitlement> {
        vec![Entitlement::member_of(role)]
    }

    /// Returns one page of principals holding `role_id`.
    ///
    /// Users are paged first, then groups, behind a single token. Pass the
    /// empty string to start and the returned token to continue; `None`
    /// means every assignment has been returned. The input token is never
    /// modified, so a failed call can be retried with the same token.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceNowError::InvalidCursor`] for a malformed token or a
    /// frame stack this enumerator never issues,
    /// [`ServiceNowError::CursorMismatch`] for a token issued for another
    /// role, and the store error if any fetch fails.
    #[instrument(skip(self, token))]
    pub async fn role_grants(&self, role_id: &str, token: &str) -> ServiceNowResult<Page<Grant>> {
        if role_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("role"));
        }

        let mut cursor = PageCursor::decode(token)?;
        if cursor.is_empty() {
            cursor = PageCursor::single(Frame::new(ResourceType::Role, role_id));
        }
        if let Some(frame) = cursor.frames().iter().find(|f| f.resource_id != role_id) {
            return Err(ServiceNowError::CursorMismatch {
                expected: role_id.to_string(),
                found: frame.resource_id.clone(),
            });
        }
        check_grants_stack(&cursor)?;

        let page_size = u64::from(self.page_size());
        let mut grants = Vec::new();

        while let Some(frame) = cursor.top().cloned() {
            match frame.resource_type {
                ResourceType::Role => {
                    let (rest, _) = cursor.pop();
                    cursor = rest
                        .push(Frame::new(ResourceType::Group, role_id))
                        .push(Frame::new(ResourceType::User, role_id));
                    debug!(role_id, "Expanded role into user and group frames");
                    continue;
                }
                ResourceType::User => {
                    let last = self
                        .user_role_page(role_id, frame.offset, &mut grants)
                        .await?;
                    cursor = if last {
                        debug!(role_id, "User assignments exhausted");
                        cursor.pop().0
                    } else {
                        cursor.advance(frame.offset + page_size)
                    };
                }
                ResourceType::Group => {
                    let last = self
                        .group_role_page(role_id, frame.offset, &mut grants)
                        .await?;
                    cursor = if last {
                        debug!(role_id, "Group assignments exhausted");
                        cursor.pop().0
                    } else {
                        cursor.advance(frame.offset + page_size)
                    };
                }
            }

            // Keep going in this call only while nothing has been emitted, so
            // an empty phase never costs the caller a round trip.
            if !grants.is_empty() {
                break;
            }
        }

        Ok(Page {
            items: grants,
            next_token: cursor.encode()?,
        })
    }

    /// Emits user grants for one page of `sys_user_has_role`. Returns true
    /// on the last page.
    async fn user_role_page(
        &self,
        role_id: &str,
        offset: u64,
        grants: &mut Vec<Grant>,
    ) -> ServiceNowResult<bool> {
        let query = TableQuery::new(EncodedQuery::eq("role", role_id))
            .fields(USER_ROLE_FIELDS)
            .limit(self.page_size())
            .offset(offset);
        let page = self.api().query(USER_ROLES_TABLE, &query).await?;
        let last = page.is_last(offset);
        let entitlement = entitlement_id(&ResourceId::role(role_id), MEMBER_SLUG);

        let user_fields = self.user_fields();
        for assignment in page.decode::<UserRoleRecord>()? {
            if assignment.user.is_empty() {
                warn!(assignment = %assignment.sys_id, "Role assignment without a user, skipping");
                continue;
            }
            let record = self
                .api()
                .get(USERS_TABLE, &assignment.user, &user_fields)
                .await?;
            let user = Resource::from(decode_record::<UserRecord>(record)?);
            grants.push(Grant::new(entitlement.clone(), user).inherited(assignment.inherited));
        }

        Ok(last)
    }

    /// Emits group grants for one page of `sys_group_has_role`. Returns true
    /// on the last page.
    async fn group_role_page(
        &self,
        role_id: &str,
        offset: u64,
        grants: &mut Vec<Grant>,
    ) -> ServiceNowResult<bool> {
        let query = TableQuery::new(EncodedQuery::eq("role", role_id))
            .fields(GROUP_ROLE_FIELDS)
            .limit(self.page_size())
            .offset(offset);
        let page = self.api().query(GROUP_ROLES_TABLE, &query).await?;
        let last = page.is_last(offset);
        let entitlement = entitlement_id(&ResourceId::role(role_id), MEMBER_SLUG);

        for assignment in page.decode::<GroupRoleRecord>()? {
            if assignment.group.is_empty() {
                warn!(assignment = %assignment.sys_id, "Role assignment without a group, skipping");
                continue;
            }
            let record = self
                .api()
                .get(GROUPS_TABLE, &assignment.group, GROUP_FIELDS)
                .await?;
            let group = Resource::from(decode_record::<GroupRecord>(record)?);
            // `inherits` controls propagation to the group's members. The
            // group itself holds the role directly.
            debug!(
                group = %assignment.group,
                inherits = assignment.inherits,
                "Group holds role"
            );
            grants.push(
                Grant::new(entitlement.clone(), group)
                    .expandable(GrantExpansion::group_members(&assignment.group)),
            );
        }

        Ok(last)
    }

    /// Grants `role_id` to a user or group unless it is already held.
    ///
    /// # Errors
    ///
    /// Principals other than users and groups, and empty ids, are rejected
    /// before any request is sent.
    #[instrument(skip(self))]
    pub async fn grant_role(
        &self,
        principal: &ResourceId,
        role_id: &str,
    ) -> ServiceNowResult<MutationOutcome> {
        check_principal(
            principal,
            &[ResourceType::User, ResourceType::Group],
            "role membership",
        )?;
        if role_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("role"));
        }

        let (table, column) = assignment_table(principal.resource_type);
        let existing = self
            .api()
            .query(
                table,
                &TableQuery::new(assignment_query(role_id, principal))
                    .fields(&["sys_id"])
                    .limit(1),
            )
            .await?;

        if !existing.records.is_empty() {
            warn!(%principal, role_id, "Principal already has the role");
            return Ok(MutationOutcome::AlreadyGranted);
        }

        self.api()
            .create(table, json!({ column: principal.id, "role": role_id }))
            .await?;

        info!(%principal, role_id, "Granted role");
        Ok(MutationOutcome::Granted)
    }

    /// Removes every assignment of `role_id` to the principal, direct or
    /// inherited.
    ///
    /// # Errors
    ///
    /// A delete failure after at least one record was removed is reported
    /// as [`ServiceNowError::PartialRevoke`]. Removed records are not
    /// restored.
    #[instrument(skip(self))]
    pub async fn revoke_role(
        &self,
        principal: &ResourceId,
        role_id: &str,
    ) -> ServiceNowResult<MutationOutcome> {
        check_principal(
            principal,
            &[ResourceType::User, ResourceType::Group],
            "role membership",
        )?;
        if role_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("role"));
        }

        let (table, _) = assignment_table(principal.resource_type);
        let assignments: Vec<RecordId> = self
            .query_all(table, assignment_query(role_id, principal), &["sys_id"])
            .await?;

        if assignments.is_empty() {
            warn!(%principal, role_id, "Principal does not have the role");
            return Ok(MutationOutcome::AlreadyRevoked);
        }

        let removed = self.delete_all(table, &assignments).await?;
        info!(%principal, role_id, removed, "Revoked role");
        Ok(MutationOutcome::Revoked { removed })
    }

    /// Deletes records in order, reporting partial progress on failure.
    pub(crate) async fn delete_all(
        &self,
        table: &str,
        records: &[RecordId],
    ) -> ServiceNowResult<usize> {
        for (removed, record) in records.iter().enumerate() {
            if let Err(e) = self.api().delete(table, &record.sys_id).await {
                if removed == 0 {
                    return Err(e);
                }
                return Err(ServiceNowError::PartialRevoke {
                    removed,
                    remaining: records.len() - removed,
                    source: Box::new(e),
                });
            }
            debug!(table, record = %record.sys_id, "Deleted record");
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_principal() {
        let allowed = [ResourceType::User, ResourceType::Group];
        assert!(check_principal(&ResourceId::user("u1"), &allowed, "role membership").is_ok());

        let err = check_principal(&ResourceId::role("r2"), &allowed, "role membership")
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceNowError::InvalidPrincipal {
                principal_type: ResourceType::Role,
                ..
            }
        ));

        let err = check_principal(&ResourceId::group(" "), &allowed, "role membership")
            .unwrap_err();
        assert!(matches!(err, ServiceNowError::MissingId("principal")));
    }

    #[test]
    fn test_grants_stack_shapes() {
        let frame = |t| Frame::new(t, "r1");
        let role = PageCursor::single(frame(ResourceType::Role));
        let groups = PageCursor::single(frame(ResourceType::Group));
        let users = groups.push(frame(ResourceType::User));
        for cursor in [&role, &groups, &users] {
            assert!(check_grants_stack(cursor).is_ok());
        }

        let rejected = [
            role.push(frame(ResourceType::User)),
            PageCursor::single(frame(ResourceType::User)).push(frame(ResourceType::Group)),
            PageCursor::single(frame(ResourceType::User)),
            users.push(frame(ResourceType::User)),
            groups.push(frame(ResourceType::Group)),
        ];
        for cursor in &rejected {
            assert!(matches!(
                check_grants_stack(cursor),
                Err(ServiceNowError::InvalidCursor(_))
            ));
        }
    }

    #[test]
    fn test_assignment_query_per_principal_type() {
        assert_eq!(
            assignment_query("r1", &ResourceId::user("u1")).as_str(),
            "role=r1^user=u1"
        );
        assert_eq!(
            assignment_query("r1", &ResourceId::group("g1")).as_str(),
            "role=r1^group=g1"
        );
        assert_eq!(
            assignment_table(ResourceType::Group).0,
            "sys_group_has_role"
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(MutationOutcome::Revoked { removed: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "revoked", "removed": 2}));
        assert!(!MutationOutcome::AlreadyGranted.changed());
        assert!(MutationOutcome::Granted.changed());
    }
}
