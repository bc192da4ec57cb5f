//! Connection settings for a ServiceNow instance.

use std::env::VarError;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};

use crate::{ServiceNowError, ServiceNowResult};

/// Default number of records requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest page the Table API accepts without a system property change.
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// Default HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// ServiceNow connector configuration.
#[derive(Clone)]
pub struct ServiceNowConfig {
    /// Instance name, the `<deployment>` in `<deployment>.service-now.com`.
    pub deployment: String,
    /// Basic-auth user name.
    pub username: String,
    /// Basic-auth password.
    pub password: SecretString,
    /// Overrides the derived instance URL (used against mock servers).
    pub base_url: Option<String>,
    /// Restricts ticket schemas to one catalog.
    pub catalog_id: Option<String>,
    /// Restricts ticket schemas to one catalog category.
    pub category_id: Option<String>,
    /// Only users whose email ends with one of these domains are listed.
    pub allowed_domains: Vec<String>,
    /// Custom `u_*` user columns requested alongside the standard ones.
    pub custom_user_fields: Vec<String>,
    /// Records per page for every paged query.
    pub page_size: u32,
    /// HTTP timeout in seconds.
    pub timeout_secs: u64,
}

impl fmt::Debug for ServiceNowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNowConfig")
            .field("deployment", &self.deployment)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("catalog_id", &self.catalog_id)
            .field("category_id", &self.category_id)
            .field("allowed_domains", &self.allowed_domains)
            .field("custom_user_fields", &self.custom_user_fields)
            .field("page_size", &self.page_size)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ServiceNowConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ServiceNowConfigBuilder {
        ServiceNowConfigBuilder::default()
    }

    /// Load configuration from `SERVICENOW_*` environment variables.
    pub fn from_env() -> ServiceNowResult<Self> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Tests use this to supply variables without touching the process
    /// environment.
    pub fn from_reader<F>(reader: F) -> ServiceNowResult<Self>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let optional = |key: &str| reader(key).ok().filter(|v| !v.trim().is_empty());

        let mut builder = Self::builder();
        if let Some(deployment) = optional("SERVICENOW_DEPLOYMENT") {
            builder = builder.deployment(deployment);
        }
        if let Some(username) = optional("SERVICENOW_USERNAME") {
            builder = builder.username(username);
        }
        if let Some(password) = optional("SERVICENOW_PASSWORD") {
            builder = builder.password(password);
        }
        if let Some(base_url) = optional("SERVICENOW_BASE_URL") {
            builder = builder.base_url(base_url);
        }
        if let Some(catalog_id) = optional("SERVICENOW_CATALOG_ID") {
            builder = builder.catalog_id(catalog_id);
        }
        if let Some(category_id) = optional("SERVICENOW_CATEGORY_ID") {
            builder = builder.category_id(category_id);
        }
        if let Some(domains) = optional("SERVICENOW_ALLOWED_DOMAINS") {
            builder = builder.allowed_domains(
                domains
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from),
            );
        }
        if let Some(fields) = optional("SERVICENOW_CUSTOM_USER_FIELDS") {
            builder = builder.custom_user_fields(
                fields
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from),
            );
        }
        if let Some(page_size) = optional("SERVICENOW_PAGE_SIZE") {
            let page_size = page_size.parse::<u32>().map_err(|e| {
                ServiceNowError::Config(format!("invalid value for SERVICENOW_PAGE_SIZE: {e}"))
            })?;
            builder = builder.page_size(page_size);
        }
        if let Some(timeout) = optional("SERVICENOW_TIMEOUT_SECS") {
            let timeout = timeout.parse::<u64>().map_err(|e| {
                ServiceNowError::Config(format!("invalid value for SERVICENOW_TIMEOUT_SECS: {e}"))
            })?;
            builder = builder.timeout_secs(timeout);
        }

        builder.build()
    }

    /// Returns the instance root URL without a trailing slash.
    #[must_use]
    pub fn instance_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.service-now.com", self.deployment),
        }
    }
}

/// Builder for [`ServiceNowConfig`].
#[derive(Debug, Default)]
pub struct ServiceNowConfigBuilder {
    deployment: Option<String>,
    username: Option<String>,
    password: Option<SecretString>,
    base_url: Option<String>,
    catalog_id: Option<String>,
    category_id: Option<String>,
    allowed_domains: Vec<String>,
    custom_user_fields: Vec<String>,
    page_size: Option<u32>,
    timeout_secs: Option<u64>,
}

impl ServiceNowConfigBuilder {
    /// Sets the instance name.
    #[must_use]
    pub fn deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = Some(deployment.into());
        self
    }

    /// Sets the basic-auth user name.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the basic-auth password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Overrides the instance URL.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn catalog_id(mut self, catalog_id: impl Into<String>) -> Self {
        self.catalog_id = Some(catalog_id.into());
        self
    }

    #[must_use]
    pub fn category_id(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    /// Restricts user listings to these email domains.
    #[must_use]
    pub fn allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Requests these custom user columns. Each must start with `u_`.
    #[must_use]
    pub fn custom_user_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_user_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceNowError::Config`] when credentials are missing, when
    /// neither a deployment nor a base URL is set, or when the page size is
    /// outside `1..=10000`, or when a custom user field is not a `u_`
    /// column.
    pub fn build(self) -> ServiceNowResult<ServiceNowConfig> {
        let deployment = self.deployment.unwrap_or_default();
        if deployment.trim().is_empty() && self.base_url.is_none() {
            return Err(ServiceNowError::Config(
                "deployment is required when base_url is not set".into(),
            ));
        }
        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url)?;
        }

        let username = self
            .username
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ServiceNowError::Config("username is required".into()))?;
        let password = self
            .password
            .filter(|p| !p.expose_secret().is_empty())
            .ok_or_else(|| ServiceNowError::Config("password is required".into()))?;

        if let Some(field) = self
            .custom_user_fields
            .iter()
            .find(|f| !f.starts_with("u_") || f.len() == 2)
        {
            return Err(ServiceNowError::Config(format!(
                "custom user field {field:?} must be a u_ column"
            )));
        }

        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ServiceNowError::Config(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }

        let timeout_secs = self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ServiceNowError::Config(
                "timeout_secs must be greater than zero".into(),
            ));
        }

        Ok(ServiceNowConfig {
            deployment,
            username,
            password,
            base_url: self.base_url,
            catalog_id: self.catalog_id.filter(|c| !c.is_empty()),
            category_id: self.category_id.filter(|c| !c.is_empty()),
            allowed_domains: self.allowed_domains,
            custom_user_fields: self.custom_user_fields,
            page_size,
            timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_reader(vars: HashMap<&str, &str>) -> impl Fn(&str) -> Result<String, VarError> {
        let owned: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| owned.get(key).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn test_builder_defaults() {
        let config = ServiceNowConfig::builder()
            .deployment("dev12345")
            .username("admin")
            .password("secret")
            .build()
            .unwrap();

        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.instance_url(), "https://dev12345.service-now.com");
        assert!(config.allowed_domains.is_empty());
    }

    #[test]
    fn test_base_url_override() {
        let config = ServiceNowConfig::builder()
            .base_url("http://127.0.0.1:8080/")
            .username("admin")
            .password("secret")
            .build()
            .unwrap();

        assert_eq!(config.instance_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_missing_deployment() {
        let err = ServiceNowConfig::builder()
            .username("admin")
            .password("secret")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("deployment is required"));
    }

    #[test]
    fn test_page_size_bounds() {
        for page_size in [0, MAX_PAGE_SIZE + 1] {
            let result = ServiceNowConfig::builder()
                .deployment("dev")
                .username("admin")
                .password("secret")
                .page_size(page_size)
                .build();
            assert!(matches!(result, Err(ServiceNowError::Config(_))));
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ServiceNowConfig::builder()
            .deployment("dev")
            .username("admin")
            .password("hunter2")
            .build()
            .unwrap();
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_from_reader() {
        let reader = make_reader(HashMap::from([
            ("SERVICENOW_DEPLOYMENT", "acme"),
            ("SERVICENOW_USERNAME", "svc"),
            ("SERVICENOW_PASSWORD", "pw"),
            ("SERVICENOW_ALLOWED_DOMAINS", "acme.com, example.org,"),
            ("SERVICENOW_PAGE_SIZE", "2"),
            ("SERVICENOW_CUSTOM_USER_FIELDS", "u_type,u_cost_center"),
        ]));

        let config = ServiceNowConfig::from_reader(reader).unwrap();
        assert_eq!(config.deployment, "acme");
        assert_eq!(config.allowed_domains, vec!["acme.com", "example.org"]);
        assert_eq!(config.custom_user_fields, vec!["u_type", "u_cost_center"]);
        assert_eq!(config.page_size, 2);
        assert_eq!(config.password.expose_secret(), "pw");
    }

    #[test]
    fn test_from_reader_missing_password() {
        let reader = make_reader(HashMap::from([
            ("SERVICENOW_DEPLOYMENT", "acme"),
            ("SERVICENOW_USERNAME", "svc"),
        ]));
        let err = ServiceNowConfig::from_reader(reader).unwrap_err();
        assert!(err.to_string().contains("password is required"));
    }

    #[test]
    fn test_from_reader_bad_page_size() {
        let reader = make_reader(HashMap::from([
            ("SERVICENOW_DEPLOYMENT", "acme"),
            ("SERVICENOW_USERNAME", "svc"),
            ("SERVICENOW_PASSWORD", "pw"),
            ("SERVICENOW_PAGE_SIZE", "lots"),
        ]));
        let err = ServiceNowConfig::from_reader(reader).unwrap_err();
        assert!(err.to_string().contains("SERVICENOW_PAGE_SIZE"));
    }

    #[test]
    fn test_custom_user_fields_must_be_custom_columns() {
        for field in ["email", "u_"] {
            let err = ServiceNowConfig::builder()
                .deployment("dev")
                .username("admin")
                .password("pw")
                .custom_user_fields([field])
                .build()
                .unwrap_err();
            assert!(err.to_string().contains("u_ column"), "{field}");
        }
    }
}
