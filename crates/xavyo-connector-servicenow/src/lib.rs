//! ServiceNow Connector for xavyo
//!
//! This crate syncs identities from a ServiceNow instance through its Table
//! and Service Catalog REST APIs.
//!
//! # Features
//!
//! - User, group and role listing with resumable page tokens
//! - Role grants across direct user and group assignments behind one token
//! - Idempotent role assignment and group membership changes
//! - Account creation and enable/disable
//! - Service catalog items exposed as ticket schemas, and requested items as tickets
//!
//! # Example
//!
//! ```no_run
//! use xavyo_connector_servicenow::{ServiceNowConfig, ServiceNowConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceNowConfig::builder()
//!     .deployment("acme")
//!     .username("integration")
//!     .password("secret")
//!     .build()?;
//!
//! let connector = ServiceNowConnector::new(config)?;
//! connector.validate().await?;
//!
//! let mut token = String::new();
//! loop {
//!     let page = connector.role_grants("282bf1fac6112285017366cb5f867469", &token).await?;
//!     for grant in &page.items {
//!         println!("{} -> {}", grant.entitlement_id, grant.principal.id);
//!     }
//!     match page.next_token {
//!         Some(next) => token = next,
//!         None => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod catalog;
mod client;
mod config;
mod connector;
mod cursor;
mod error;
mod filter;
mod groups;
mod model;
mod resource;
mod roles;
mod users;

// Re-exports
pub use catalog::{
    field_from_variable, CatalogItem, CatalogItemVariable, Choice, FieldKind, FieldValue, Ticket,
    TicketField, TicketRequest, TicketSchema, TicketStatus, VariableType, CATALOG_ITEM_FIELD,
    SYSTEM_ADMIN_USER_ID,
};
pub use client::{PageSignal, ServiceNowClient, TableApi, TablePage, TableQuery};
pub use config::{
    ServiceNowConfig, ServiceNowConfigBuilder, DEFAULT_PAGE_SIZE, DEFAULT_TIMEOUT_SECS,
    MAX_PAGE_SIZE,
};
pub use connector::{ConnectorMetadata, ServiceNowConnector};
pub use cursor::{Frame, PageCursor};
pub use error::{ServiceNowError, ServiceNowResult};
pub use filter::EncodedQuery;
pub use model::is_truthy;
pub use resource::{
    entitlement_id, parse_entitlement_id, AccountStatus, Entitlement, Grant, GrantExpansion,
    GroupTrait, Page, Resource, ResourceId, ResourceTraits, ResourceType, RoleTrait, UserTrait,
    MEMBER_SLUG,
};
pub use roles::MutationOutcome;
pub use users::AccountProfile;
