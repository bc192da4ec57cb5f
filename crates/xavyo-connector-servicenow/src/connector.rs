//! Connector entry point.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::client::{ServiceNowClient, TableApi, TablePage, TableQuery};
use crate::cursor::{Frame, PageCursor};
use crate::filter::EncodedQuery;
use crate::model::{
    GroupRecord, RoleRecord, GROUPS_TABLE, GROUP_FIELDS, GROUP_MEMBERS_TABLE,
    GROUP_MEMBER_FIELDS, GROUP_ROLES_TABLE, GROUP_ROLE_FIELDS, ROLES_TABLE, ROLE_FIELDS,
    USERS_TABLE, USER_FIELDS, USER_ROLES_TABLE, USER_ROLE_FIELDS,
};
use crate::resource::{parse_entitlement_id, ResourceId, ResourceType, MEMBER_SLUG};
use crate::roles::MutationOutcome;
use crate::{ServiceNowConfig, ServiceNowError, ServiceNowResult};

/// Describes the connector and the resource types it syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorMetadata {
    pub display_name: &'static str,
    pub description: &'static str,
    pub resource_types: Vec<ResourceType>,
}

/// ServiceNow connector.
///
/// Holds no enumeration state: every paged operation takes and returns an
/// opaque token, so one connector can serve concurrent callers.
#[derive(Clone)]
pub struct ServiceNowConnector {
    api: Arc<dyn TableApi>,
    config: ServiceNowConfig,
}

impl fmt::Debug for ServiceNowConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNowConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceNowConnector {
    /// Creates a connector talking HTTP to the configured instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: ServiceNowConfig) -> ServiceNowResult<Self> {
        let client = ServiceNowClient::new(&config)?;
        info!(instance = %config.instance_url(), "Created ServiceNow connector");
        Ok(Self::with_api(config, Arc::new(client)))
    }

    /// Creates a connector over any backing store.
    #[must_use]
    pub fn with_api(config: ServiceNowConfig, api: Arc<dyn TableApi>) -> Self {
        Self { api, config }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceNowConfig {
        &self.config
    }

    pub(crate) fn api(&self) -> &dyn TableApi {
        self.api.as_ref()
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.config.page_size
    }

    /// Standard user columns plus the configured custom ones.
    pub(crate) fn user_fields(&self) -> Vec<&str> {
        USER_FIELDS
            .iter()
            .copied()
            .chain(self.config.custom_user_fields.iter().map(String::as_str))
            .collect()
    }

    #[must_use]
    pub fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            display_name: "ServiceNow",
            description: "Syncs ServiceNow users, their roles and groups",
            resource_types: vec![ResourceType::User, ResourceType::Role, ResourceType::Group],
        }
    }

    /// Checks that the configured account can read every table the
    /// connector uses.
    ///
    /// Each table is probed with a page size of one. Empty tables pass.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceNowError::Capability`] naming the first capability
    /// that failed.
    #[instrument(skip(self))]
    pub async fn validate(&self) -> ServiceNowResult<()> {
        self.probe(USERS_TABLE, EncodedQuery::new(), &self.user_fields(), "list users")
            .await?;

        let roles = self
            .probe(
                ROLES_TABLE,
                EncodedQuery::eq("grantable", "true"),
                ROLE_FIELDS,
                "list roles",
            )
            .await?
            .decode::<RoleRecord>()?;

        let groups = self
            .probe(GROUPS_TABLE, EncodedQuery::new(), GROUP_FIELDS, "list groups")
            .await?
            .decode::<GroupRecord>()?;

        let group_id = groups.first().map(|g| g.sys_id.as_str());
        let role_id = roles.first().map(|r| r.sys_id.as_str());

        self.probe(
            GROUP_MEMBERS_TABLE,
            optional_eq("group", group_id),
            GROUP_MEMBER_FIELDS,
            "list group members",
        )
        .await?;
        self.probe(
            USER_ROLES_TABLE,
            optional_eq("role", role_id),
            USER_ROLE_FIELDS,
            "list users to roles",
        )
        .await?;
        self.probe(
            GROUP_ROLES_TABLE,
            optional_eq("group", group_id),
            GROUP_ROLE_FIELDS,
            "list groups to roles",
        )
        .await?;

        info!("ServiceNow credentials validated");
        Ok(())
    }

    async fn probe(
        &self,
        table: &str,
        query: EncodedQuery,
        fields: &[&str],
        capability: &'static str,
    ) -> ServiceNowResult<TablePage> {
        debug!(table, capability, "Probing table");
        self.api
            .query(table, &TableQuery::new(query).fields(fields).limit(1))
            .await
            .map_err(|e| ServiceNowError::Capability {
                capability,
                source: Box::new(e),
            })
    }

    /// Grants the entitlement named by `entitlement_id` to `principal`.
    ///
    /// `role:<id>:member` assigns the role and `group:<id>:member` adds the
    /// user to the group.
    #[instrument(skip(self))]
    pub async fn grant(
        &self,
        principal: &ResourceId,
        entitlement_id: &str,
    ) -> ServiceNowResult<MutationOutcome> {
        match member_target(entitlement_id)? {
            ResourceId {
                resource_type: ResourceType::Role,
                id,
            } => self.grant_role(principal, &id).await,
            ResourceId {
                resource_type: ResourceType::Group,
                id,
            } => self.add_member(principal, &id).await,
            _ => Err(ServiceNowError::InvalidEntitlement(entitlement_id.to_string())),
        }
    }

    /// Revokes the entitlement named by `entitlement_id` from `principal`.
    #[instrument(skip(self))]
    pub async fn revoke(
        &self,
        principal: &ResourceId,
        entitlement_id: &str,
    ) -> ServiceNowResult<MutationOutcome> {
        match member_target(entitlement_id)? {
            ResourceId {
                resource_type: ResourceType::Role,
                id,
            } => self.revoke_role(principal, &id).await,
            ResourceId {
                resource_type: ResourceType::Group,
                id,
            } => self.remove_member(principal, &id).await,
            _ => Err(ServiceNowError::InvalidEntitlement(entitlement_id.to_string())),
        }
    }

    /// Reads every record matching `query`, page by page.
    pub(crate) async fn query_all<T: DeserializeOwned>(
        &self,
        table: &str,
        query: EncodedQuery,
        fields: &[&str],
    ) -> ServiceNowResult<Vec<T>> {
        let page_size = self.page_size();
        let mut offset = 0u64;
        let mut out = Vec::new();

        loop {
            let request = TableQuery::new(query.clone())
                .fields(fields)
                .limit(page_size)
                .offset(offset);
            let page = self.api.query(table, &request).await?;
            let last = page.is_last(offset);
            out.extend(page.decode::<T>()?);

            if last {
                return Ok(out);
            }
            offset += u64::from(page_size);
        }
    }
}

/// Resource behind a `member` entitlement id.
fn member_target(entitlement_id: &str) -> ServiceNowResult<ResourceId> {
    let (resource, slug) = parse_entitlement_id(entitlement_id)?;
    if slug != MEMBER_SLUG {
        return Err(ServiceNowError::InvalidEntitlement(entitlement_id.to_string()));
    }
    Ok(resource)
}

/// Offset stored in a single-frame listing token.
///
/// `scope_id` is the parent resource for nested listings and empty for
/// top-level ones.
pub(crate) fn resume_offset(
    token: &str,
    resource_type: ResourceType,
    scope_id: &str,
) -> ServiceNowResult<u64> {
    let cursor = PageCursor::decode(token)?;
    match cursor.frames() {
        [] => Ok(0),
        [frame] if frame.resource_type == resource_type && frame.resource_id == scope_id => {
            Ok(frame.offset)
        }
        [frame] => Err(ServiceNowError::CursorMismatch {
            expected: format!("{resource_type}:{scope_id}"),
            found: format!("{}:{}", frame.resource_type, frame.resource_id),
        }),
        frames => Err(ServiceNowError::InvalidCursor(format!(
            "expected one frame, found {}",
            frames.len()
        ))),
    }
}

/// Token for the page after `offset`, or `None` once `last`.
pub(crate) fn listing_token(
    resource_type: ResourceType,
    scope_id: &str,
    next_offset: u64,
    last: bool,
) -> ServiceNowResult<Option<String>> {
    if last {
        return Ok(None);
    }
    PageCursor::single(Frame::new(resource_type, scope_id).at(next_offset)).encode()
}

fn optional_eq(field: &str, value: Option<&str>) -> EncodedQuery {
    match value {
        Some(value) => EncodedQuery::eq(field, value),
        None => EncodedQuery::new(),
    }
}
