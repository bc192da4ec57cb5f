//! Service catalog requests exposed as tickets.
//!
//! Catalog items become ticket schemas, their variables become typed custom
//! fields, and requested items (`sc_req_item`) become tickets.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::client::TableQuery;
use crate::filter::EncodedQuery;
use crate::model::{decode_record, is_truthy, lenient_bool, null_string, reference_id};
use crate::resource::Page;
use crate::{ServiceNowConnector, ServiceNowError, ServiceNowResult};

const REQUESTED_ITEMS_TABLE: &str = "sc_req_item";
const CHOICES_TABLE: &str = "sys_choice";
const VARIABLE_SET_LINKS_TABLE: &str = "io_set_item";
const VARIABLES_TABLE: &str = "item_option_new";
const QUESTION_CHOICES_TABLE: &str = "question_choice";

const REQUESTED_ITEM_FIELDS: &[&str] = &[
    "sys_id",
    "number",
    "state",
    "description",
    "short_description",
    "request",
    "cat_item",
    "sys_created_on",
    "sys_updated_on",
    "closed_at",
];

/// Schema field holding the catalog item being ordered.
pub const CATALOG_ITEM_FIELD: &str = "catalog_item";

/// `sys_id` of the built-in administrator, the default requester.
pub const SYSTEM_ADMIN_USER_ID: &str = "6816f79cc0a8016401c5a33be04be441";

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Catalog variable type, from the numeric code the instance reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "i64")]
pub enum VariableType {
    Unspecified,
    YesNo,
    MultiLineText,
    MultipleChoice,
    NumericScale,
    SelectBox,
    SingleLineText,
    CheckBox,
    Reference,
    Date,
    DateTime,
    Label,
    Break,
    Macro,
    UiPage,
    WideSingleLineText,
    MacroWithLabel,
    LookupSelectBox,
    ContainerStart,
    ContainerEnd,
    ListCollector,
    LookupMultipleChoice,
    Html,
    Split,
    Masked,
    Email,
    Url,
    IpAddress,
    Duration,
    RequestedFor,
    RichTextLabel,
    Attachment,
    /// A code this connector does not know.
    Unsupported(i64),
}

impl VariableType {
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => VariableType::Unspecified,
            1 => VariableType::YesNo,
            2 => VariableType::MultiLineText,
            3 => VariableType::MultipleChoice,
            4 => VariableType::NumericScale,
            5 => VariableType::SelectBox,
            6 => VariableType::SingleLineText,
            7 => VariableType::CheckBox,
            8 => VariableType::Reference,
            9 => VariableType::Date,
            10 => VariableType::DateTime,
            11 => VariableType::Label,
            12 => VariableType::Break,
            14 => VariableType::Macro,
            15 => VariableType::UiPage,
            16 => VariableType::WideSingleLineText,
            17 => VariableType::MacroWithLabel,
            18 => VariableType::LookupSelectBox,
            19 => VariableType::ContainerStart,
            20 => VariableType::ContainerEnd,
            21 => VariableType::ListCollector,
            22 => VariableType::LookupMultipleChoice,
            23 => VariableType::Html,
            24 => VariableType::Split,
            25 => VariableType::Masked,
            26 => VariableType::Email,
            27 => VariableType::Url,
            28 => VariableType::IpAddress,
            29 => VariableType::Duration,
            31 => VariableType::RequestedFor,
            32 => VariableType::RichTextLabel,
            33 => VariableType::Attachment,
            other => VariableType::Unsupported(other),
        }
    }

    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            VariableType::Unspecified => 0,
            VariableType::YesNo => 1,
            VariableType::MultiLineText => 2,
            VariableType::MultipleChoice => 3,
            VariableType::NumericScale => 4,
            VariableType::SelectBox => 5,
            VariableType::SingleLineText => 6,
            VariableType::CheckBox => 7,
            VariableType::Reference => 8,
            VariableType::Date => 9,
            VariableType::DateTime => 10,
            VariableType::Label => 11,
            VariableType::Break => 12,
            VariableType::Macro => 14,
            VariableType::UiPage => 15,
            VariableType::WideSingleLineText => 16,
            VariableType::MacroWithLabel => 17,
            VariableType::LookupSelectBox => 18,
            VariableType::ContainerStart => 19,
            VariableType::ContainerEnd => 20,
            VariableType::ListCollector => 21,
            VariableType::LookupMultipleChoice => 22,
            VariableType::Html => 23,
            VariableType::Split => 24,
            VariableType::Masked => 25,
            VariableType::Email => 26,
            VariableType::Url => 27,
            VariableType::IpAddress => 28,
            VariableType::Duration => 29,
            VariableType::RequestedFor => 31,
            VariableType::RichTextLabel => 32,
            VariableType::Attachment => 33,
            VariableType::Unsupported(code) => *code,
        }
    }

    /// Parses a code sent as a string. Anything that is not a plain number
    /// is unspecified.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return VariableType::Unspecified;
        }
        raw.parse::<i64>()
            .map_or(VariableType::Unspecified, Self::from_code)
    }
}

impl From<VariableType> for i64 {
    fn from(value: VariableType) -> Self {
        value.code()
    }
}

impl<'de> Deserialize<'de> for VariableType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map_or(VariableType::Unspecified, VariableType::from_code),
            Some(Value::String(s)) => VariableType::parse(&s),
            _ => VariableType::Unspecified,
        })
    }
}

/// One option of a choice variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default, deserialize_with = "null_string")]
    pub label: String,
    #[serde(default, deserialize_with = "null_string")]
    pub value: String,
}

/// A catalog item variable (question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItemVariable {
    #[serde(default, deserialize_with = "null_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_string")]
    pub name: String,
    #[serde(default, deserialize_with = "null_string")]
    pub label: String,
    #[serde(rename = "type", default = "unspecified")]
    pub variable_type: VariableType,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub active: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub mandatory: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub read_only: bool,
    /// Default value.
    #[serde(default, deserialize_with = "null_string")]
    pub value: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, deserialize_with = "null_string")]
    pub reference: String,
    #[serde(default, deserialize_with = "null_string")]
    pub ref_qualifier: String,
}

fn unspecified() -> VariableType {
    VariableType::Unspecified
}

/// Row of `item_option_new`, a variable that belongs to a variable set.
#[derive(Debug, Deserialize)]
struct SetVariableRecord {
    #[serde(default)]
    sys_id: String,
    #[serde(default, deserialize_with = "null_string")]
    name: String,
    #[serde(default, deserialize_with = "null_string")]
    question_text: String,
    #[serde(rename = "type", default, deserialize_with = "null_string")]
    variable_type: String,
    #[serde(default, deserialize_with = "null_string")]
    mandatory: String,
    #[serde(default, deserialize_with = "null_string")]
    default_value: String,
    #[serde(default, deserialize_with = "null_string")]
    reference: String,
    #[serde(default, deserialize_with = "null_string")]
    active: String,
    #[serde(default, deserialize_with = "null_string")]
    reference_qual: String,
}

impl SetVariableRecord {
    fn into_variable(self, choices: Vec<Choice>) -> CatalogItemVariable {
        CatalogItemVariable {
            id: self.sys_id,
            name: self.name,
            label: self.question_text,
            variable_type: VariableType::parse(&self.variable_type),
            active: is_truthy(&self.active),
            mandatory: is_truthy(&self.mandatory),
            read_only: false,
            value: self.default_value,
            choices,
            reference: self.reference,
            ref_qualifier: self.reference_qual,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VariableSetLink {
    #[serde(default, deserialize_with = "reference_id")]
    variable_set: String,
}

#[derive(Debug, Deserialize)]
struct QuestionChoiceRecord {
    #[serde(default, deserialize_with = "null_string")]
    label: String,
    #[serde(default, deserialize_with = "null_string")]
    value: String,
    #[serde(default, deserialize_with = "reference_id")]
    question: String,
}

/// A catalog item as returned by the Service Catalog API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub sys_id: String,
    #[serde(default, deserialize_with = "null_string")]
    pub name: String,
    #[serde(default, deserialize_with = "null_string")]
    pub short_description: String,
    #[serde(default)]
    pub variables: Vec<CatalogItemVariable>,
}

/// Value shape of a ticket field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    PickOne {
        choices: Vec<Choice>,
    },
    PickMany {
        choices: Vec<Choice>,
    },
    Timestamp,
}

/// A typed custom field on a ticket schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketField {
    /// Variable name, the key used when ordering.
    pub id: String,
    pub display_name: String,
    pub required: bool,
    pub kind: FieldKind,
    pub variable_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_qualifier: Option<String>,
}

/// Maps a catalog variable to a ticket field.
///
/// Inactive and read-only variables, layout-only types and types without a
/// field representation yield `None`.
#[must_use]
pub fn field_from_variable(variable: &CatalogItemVariable) -> Option<TicketField> {
    if !variable.active || variable.read_only {
        return None;
    }

    let text_default = || {
        Some(variable.value.clone()).filter(|v| !v.is_empty())
    };
    let choices = || {
        variable
            .choices
            .iter()
            .map(|c| Choice {
                label: c.value.clone(),
                value: c.value.clone(),
            })
            .collect::<Vec<_>>()
    };

    let mut reference = None;
    let mut ref_qualifier = None;

    let kind = match variable.variable_type {
        VariableType::YesNo | VariableType::CheckBox => FieldKind::Bool,
        VariableType::MultiLineText
        | VariableType::SingleLineText
        | VariableType::WideSingleLineText
        | VariableType::Html
        | VariableType::Email
        | VariableType::Url
        | VariableType::IpAddress => FieldKind::Text {
            default: text_default(),
        },
        VariableType::MultipleChoice | VariableType::LookupMultipleChoice => FieldKind::PickMany {
            choices: choices(),
        },
        VariableType::Date | VariableType::DateTime => FieldKind::Timestamp,
        VariableType::SelectBox | VariableType::LookupSelectBox => FieldKind::PickOne {
            choices: choices(),
        },
        VariableType::Reference => {
            reference = Some(variable.reference.clone()).filter(|r| !r.is_empty());
            ref_qualifier = Some(variable.ref_qualifier.clone()).filter(|r| !r.is_empty());
            FieldKind::Text {
                default: text_default(),
            }
        }
        VariableType::RequestedFor => FieldKind::Text {
            default: Some(SYSTEM_ADMIN_USER_ID.to_string()),
        },
        VariableType::ListCollector | VariableType::Duration => FieldKind::Text { default: None },
        other => {
            if variable.mandatory {
                warn!(
                    variable = %variable.name,
                    code = other.code(),
                    "Unsupported mandatory catalog variable"
                );
            }
            return None;
        }
    };

    Some(TicketField {
        id: variable.name.clone(),
        display_name: variable.label.clone(),
        required: variable.mandatory,
        kind,
        variable_type: variable.variable_type,
        reference,
        ref_qualifier,
    })
}

/// A requested-item state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketStatus {
    pub id: String,
    pub display_name: String,
}

/// A catalog item described as a ticket form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketSchema {
    pub id: String,
    pub display_name: String,
    pub fields: BTreeMap<String, TicketField>,
    pub statuses: Vec<TicketStatus>,
}

/// A requested item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    /// The requested item number, e.g. `RITM0010001`.
    pub display_name: String,
    pub description: String,
    pub status: TicketStatus,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A value supplied for a ticket field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Bool(bool),
    Text(String),
    PickOne(String),
    PickMany(Vec<String>),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    fn matches(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (FieldValue::Bool(_), FieldKind::Bool)
                | (FieldValue::Text(_), FieldKind::Text { .. })
                | (FieldValue::PickOne(_), FieldKind::PickOne { .. })
                | (FieldValue::PickMany(_), FieldKind::PickMany { .. })
                | (FieldValue::Timestamp(_), FieldKind::Timestamp)
        )
    }

    fn to_variable(&self) -> Value {
        match self {
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Text(s) | FieldValue::PickOne(s) => Value::String(s.clone()),
            FieldValue::PickMany(values) => Value::String(values.join(",")),
            FieldValue::Timestamp(ts) => Value::String(ts.format(DATE_TIME_FORMAT).to_string()),
        }
    }
}

/// A ticket to open against a schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketRequest {
    pub description: String,
    /// `sys_id` of the user the item is ordered for.
    pub requested_for: String,
    /// Values keyed by field id. Must include `catalog_item`.
    pub fields: BTreeMap<String, FieldValue>,
}

/// Checks a request against its schema.
fn validate_ticket(schema: &TicketSchema, request: &TicketRequest) -> ServiceNowResult<String> {
    let catalog_item = match request.fields.get(CATALOG_ITEM_FIELD) {
        Some(FieldValue::PickOne(id)) if !id.is_empty() => id.clone(),
        _ => {
            return Err(ServiceNowError::InvalidTicket(
                "catalog item is required".into(),
            ))
        }
    };
    if catalog_item != schema.id {
        return Err(ServiceNowError::InvalidTicket(format!(
            "catalog item {catalog_item} does not belong to schema {}",
            schema.id
        )));
    }
    if request.requested_for.trim().is_empty() {
        return Err(ServiceNowError::InvalidTicket(
            "requested_for is required".into(),
        ));
    }

    for (id, field) in &schema.fields {
        match request.fields.get(id) {
            None if field.required => {
                return Err(ServiceNowError::InvalidTicket(format!(
                    "field '{id}' is required"
                )))
            }
            None => {}
            Some(value) => {
                if !value.matches(&field.kind) {
                    return Err(ServiceNowError::InvalidTicket(format!(
                        "field '{id}' has the wrong type"
                    )));
                }
                check_choices(id, value, &field.kind)?;
            }
        }
    }

    if let Some(unknown) = request.fields.keys().find(|k| !schema.fields.contains_key(*k)) {
        return Err(ServiceNowError::InvalidTicket(format!(
            "field '{unknown}' is not part of schema {}",
            schema.id
        )));
    }

    Ok(catalog_item)
}

fn check_choices(id: &str, value: &FieldValue, kind: &FieldKind) -> ServiceNowResult<()> {
    let (picked, choices): (Vec<&String>, &[Choice]) = match (value, kind) {
        (FieldValue::PickOne(v), FieldKind::PickOne { choices }) => {
            (vec![v], choices.as_slice())
        }
        (FieldValue::PickMany(vs), FieldKind::PickMany { choices }) => {
            (vs.iter().collect(), choices.as_slice())
        }
        _ => return Ok(()),
    };
    if choices.is_empty() {
        return Ok(());
    }
    match picked
        .into_iter()
        .find(|v| !choices.iter().any(|c| &c.value == *v))
    {
        Some(bad) => Err(ServiceNowError::InvalidTicket(format!(
            "'{bad}' is not an allowed value for field '{id}'"
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
struct RequestedItemRecord {
    sys_id: String,
    #[serde(default, deserialize_with = "null_string")]
    number: String,
    #[serde(default, deserialize_with = "null_string")]
    state: String,
    #[serde(default, deserialize_with = "null_string")]
    description: String,
    #[serde(default, deserialize_with = "null_string")]
    sys_created_on: String,
    #[serde(default, deserialize_with = "null_string")]
    sys_updated_on: String,
    #[serde(default, deserialize_with = "null_string")]
    closed_at: String,
}

#[derive(Debug, Deserialize)]
struct OrderResult {
    request_id: String,
    #[serde(default)]
    request_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceRecord {
    #[serde(default, deserialize_with = "null_string")]
    label: String,
    #[serde(default, deserialize_with = "null_string")]
    value: String,
}

/// Parses the instance's `YYYY-MM-DD HH:MM:SS` UTC timestamps.
fn parse_timestamp(field: &str, raw: &str) -> ServiceNowResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, DATE_TIME_FORMAT)
        .map(|dt| dt.and_utc())
        .map_err(|e| ServiceNowError::Decode(format!("invalid {field} '{raw}': {e}")))
}

fn parse_schema_offset(token: &str) -> ServiceNowResult<u64> {
    if token.is_empty() {
        return Ok(0);
    }
    token
        .parse::<u64>()
        .map_err(|e| ServiceNowError::InvalidCursor(format!("invalid schema page token: {e}")))
}

impl ServiceNowConnector {
    /// URL of a requested item in the instance UI.
    #[must_use]
    pub fn ticket_url(&self, ticket_id: &str) -> String {
        format!(
            "{}/sc_req_item.do?sys_id={}",
            self.config().instance_url(),
            urlencoding::encode(ticket_id)
        )
    }

    /// Params restricting catalog listings to the configured catalog and
    /// category.
    fn catalog_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(catalog) = &self.config().catalog_id {
            params.push(("sysparm_catalog", catalog.clone()));
        }
        if let Some(category) = &self.config().category_id {
            params.push(("sysparm_category", category.clone()));
        }
        params
    }

    /// Possible requested-item states.
    #[instrument(skip(self))]
    pub async fn ticket_statuses(&self) -> ServiceNowResult<Vec<TicketStatus>> {
        let query = EncodedQuery::eq("name", REQUESTED_ITEMS_TABLE)
            .and_eq("element", "state")
            .and_eq("inactive", "false");
        let choices: Vec<ChoiceRecord> = self
            .query_all(CHOICES_TABLE, query, &["label", "value"])
            .await?;

        Ok(choices
            .into_iter()
            .map(|c| TicketStatus {
                id: c.value,
                display_name: c.label,
            })
            .collect())
    }

    /// Lists catalog items as ticket schemas. The token is a plain offset.
    #[instrument(skip(self))]
    pub async fn list_ticket_schemas(&self, token: &str) -> ServiceNowResult<Page<TicketSchema>> {
        let offset = parse_schema_offset(token)?;
        let mut params = self.catalog_params();
        params.push(("sysparm_limit", self.page_size().to_string()));
        params.push(("sysparm_offset", offset.to_string()));

        let page = self.api().catalog_get("items", &params).await?;
        let last = page.is_last(offset);
        let items: Vec<CatalogItem> = page.decode()?;
        let statuses = self.ticket_statuses().await?;

        let mut schemas = Vec::with_capacity(items.len());
        for item in items {
            schemas.push(self.schema_for_item(item, statuses.clone()).await?);
        }

        Ok(Page {
            items: schemas,
            next_token: (!last).then(|| (offset + u64::from(self.page_size())).to_string()),
        })
    }

    /// Fetches one catalog item as a ticket schema.
    #[instrument(skip(self))]
    pub async fn get_ticket_schema(&self, schema_id: &str) -> ServiceNowResult<TicketSchema> {
        if schema_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("schema"));
        }
        let page = self
            .api()
            .catalog_get(
                &format!("items/{}", urlencoding::encode(schema_id)),
                &self.catalog_params(),
            )
            .await?;
        let item = page
            .decode::<CatalogItem>()?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceNowError::NotFound(format!("catalog item {schema_id}")))?;
        let statuses = self.ticket_statuses().await?;
        self.schema_for_item(item, statuses).await
    }

    async fn schema_for_item(
        &self,
        item: CatalogItem,
        statuses: Vec<TicketStatus>,
    ) -> ServiceNowResult<TicketSchema> {
        let variables = if item.variables.is_empty() {
            self.item_variables(&item.sys_id).await?
        } else {
            item.variables
        };

        let mut fields = BTreeMap::new();
        fields.insert(
            CATALOG_ITEM_FIELD.to_string(),
            TicketField {
                id: CATALOG_ITEM_FIELD.to_string(),
                display_name: "Catalog Item".to_string(),
                required: true,
                kind: FieldKind::PickOne {
                    choices: vec![Choice {
                        label: item.name.clone(),
                        value: item.sys_id.clone(),
                    }],
                },
                variable_type: VariableType::Unspecified,
                reference: None,
                ref_qualifier: None,
            },
        );
        for variable in &variables {
            if let Some(field) = field_from_variable(variable) {
                fields.insert(field.id.clone(), field);
            }
        }

        Ok(TicketSchema {
            id: item.sys_id,
            display_name: item.name,
            fields,
            statuses,
        })
    }

    /// Direct variables of an item plus those of its variable sets.
    ///
    /// Direct variables win when both define the same id.
    #[instrument(skip(self))]
    pub async fn item_variables(&self, item_id: &str) -> ServiceNowResult<Vec<CatalogItemVariable>> {
        let direct: Vec<CatalogItemVariable> = self
            .api()
            .catalog_get(
                &format!("items/{}/variables", urlencoding::encode(item_id)),
                &self.catalog_params(),
            )
            .await?
            .decode()?;

        let set_variables = self.variable_set_variables(item_id).await?;
        debug!(
            item_id,
            direct = direct.len(),
            from_sets = set_variables.len(),
            "Collected catalog variables"
        );

        let seen: HashSet<String> = direct.iter().map(|v| v.id.clone()).collect();
        let mut merged = direct;
        merged.extend(
            set_variables
                .into_iter()
                .filter(|v| !seen.contains(&v.id)),
        );
        Ok(merged)
    }

    async fn variable_set_variables(
        &self,
        item_id: &str,
    ) -> ServiceNowResult<Vec<CatalogItemVariable>> {
        let links: Vec<VariableSetLink> = self
            .query_all(
                VARIABLE_SET_LINKS_TABLE,
                EncodedQuery::eq("sc_cat_item", item_id),
                &["sys_id", "variable_set"],
            )
            .await?;
        let set_ids: Vec<String> = links
            .into_iter()
            .map(|l| l.variable_set)
            .filter(|id| !id.is_empty())
            .collect();
        if set_ids.is_empty() {
            return Ok(Vec::new());
        }

        let records: Vec<SetVariableRecord> = self
            .query_all(
                VARIABLES_TABLE,
                EncodedQuery::new().and_in("variable_set", &set_ids),
                &[
                    "sys_id",
                    "name",
                    "question_text",
                    "type",
                    "mandatory",
                    "default_value",
                    "reference",
                    "reference_qual",
                    "active",
                    "variable_set",
                ],
            )
            .await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let variable_ids: Vec<String> = records.iter().map(|r| r.sys_id.clone()).collect();
        let choice_records: Vec<QuestionChoiceRecord> = self
            .query_all(
                QUESTION_CHOICES_TABLE,
                EncodedQuery::new().and_in("question", &variable_ids),
                &["sys_id", "label", "value", "question"],
            )
            .await?;

        let mut choices: HashMap<String, Vec<Choice>> = HashMap::new();
        for choice in choice_records {
            choices.entry(choice.question).or_default().push(Choice {
                label: choice.label,
                value: choice.value,
            });
        }

        Ok(records
            .into_iter()
            .map(|record| {
                let options = choices.remove(&record.sys_id).unwrap_or_default();
                record.into_variable(options)
            })
            .collect())
    }

    /// Reads a requested item as a ticket.
    #[instrument(skip(self))]
    pub async fn get_ticket(&self, ticket_id: &str) -> ServiceNowResult<Ticket> {
        if ticket_id.trim().is_empty() {
            return Err(ServiceNowError::MissingId("ticket"));
        }
        let record = self
            .api()
            .get(REQUESTED_ITEMS_TABLE, ticket_id, REQUESTED_ITEM_FIELDS)
            .await?;
        self.to_ticket(decode_record(record)?)
    }

    /// Orders the schema's catalog item and returns the requested item.
    ///
    /// The request is validated against `schema` before anything is sent.
    #[instrument(skip(self, schema, request), fields(schema_id = %schema.id))]
    pub async fn create_ticket(
        &self,
        schema: &TicketSchema,
        request: &TicketRequest,
    ) -> ServiceNowResult<Ticket> {
        let catalog_item = validate_ticket(schema, request)?;

        let variables: serde_json::Map<String, Value> = request
            .fields
            .iter()
            .filter(|(id, _)| id.as_str() != CATALOG_ITEM_FIELD)
            .map(|(id, value)| (id.clone(), value.to_variable()))
            .collect();

        let ordered = self
            .api()
            .catalog_post(
                &format!("items/{}/order_now", urlencoding::encode(&catalog_item)),
                json!({
                    "sysparm_quantity": 1,
                    "sysparm_requested_for": request.requested_for,
                    "variables": variables,
                }),
            )
            .await?;
        let order: OrderResult = decode_record(ordered)?;
        debug!(request_id = %order.request_id, number = ?order.request_number, "Ordered catalog item");

        let page = self
            .api()
            .query(
                REQUESTED_ITEMS_TABLE,
                &TableQuery::new(EncodedQuery::eq("request", &order.request_id))
                    .fields(REQUESTED_ITEM_FIELDS)
                    .limit(1),
            )
            .await?;
        let item = page
            .decode::<RequestedItemRecord>()?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ServiceNowError::NotFound(format!(
                    "requested item for request {}",
                    order.request_id
                ))
            })?;

        let updated = self
            .api()
            .update(
                REQUESTED_ITEMS_TABLE,
                &item.sys_id,
                json!({ "description": request.description }),
            )
            .await?;
        let ticket = self.to_ticket(decode_record(updated)?)?;

        info!(ticket_id = %ticket.id, number = %ticket.display_name, "Created ticket");
        Ok(ticket)
    }

    fn to_ticket(&self, item: RequestedItemRecord) -> ServiceNowResult<Ticket> {
        let completed_at = if item.closed_at.is_empty() {
            None
        } else {
            Some(parse_timestamp("closed_at", &item.closed_at)?)
        };

        Ok(Ticket {
            url: self.ticket_url(&item.sys_id),
            created_at: parse_timestamp("sys_created_on", &item.sys_created_on)?,
            updated_at: parse_timestamp("sys_updated_on", &item.sys_updated_on)?,
            completed_at,
            status: TicketStatus {
                id: item.state,
                display_name: String::new(),
            },
            id: item.sys_id,
            display_name: item.number,
            description: item.description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn variable(variable_type: VariableType) -> CatalogItemVariable {
        CatalogItemVariable {
            id: "v1".into(),
            name: "justification".into(),
            label: "Justification".into(),
            variable_type,
            active: true,
            mandatory: true,
            read_only: false,
            value: "n/a".into(),
            choices: vec![
                Choice {
                    label: "Low".into(),
                    value: "low".into(),
                },
                Choice {
                    label: "High".into(),
                    value: "high".into(),
                },
            ],
            reference: "sys_user".into(),
            ref_qualifier: "active=true".into(),
        }
    }

    fn schema() -> TicketSchema {
        let mut fields = BTreeMap::new();
        fields.insert(
            CATALOG_ITEM_FIELD.to_string(),
            TicketField {
                id: CATALOG_ITEM_FIELD.into(),
                display_name: "Catalog Item".into(),
                required: true,
                kind: FieldKind::PickOne {
                    choices: vec![Choice {
                        label: "Laptop".into(),
                        value: "item1".into(),
                    }],
                },
                variable_type: VariableType::Unspecified,
                reference: None,
                ref_qualifier: None,
            },
        );
        let priority = field_from_variable(&CatalogItemVariable {
            name: "priority".into(),
            ..variable(VariableType::SelectBox)
        })
        .unwrap();
        fields.insert(priority.id.clone(), priority);
        TicketSchema {
            id: "item1".into(),
            display_name: "Laptop".into(),
            fields,
            statuses: Vec::new(),
        }
    }

    #[test]
    fn test_variable_type_codes() {
        assert_eq!(VariableType::from_code(13), VariableType::Unsupported(13));
        assert_eq!(VariableType::from_code(31), VariableType::RequestedFor);
        assert_eq!(VariableType::parse("6"), VariableType::SingleLineText);
        assert_eq!(VariableType::parse("6a"), VariableType::Unspecified);
        assert_eq!(VariableType::parse(""), VariableType::Unspecified);
        assert_eq!(VariableType::Attachment.code(), 33);
    }

    #[test]
    fn test_variable_type_decoding() {
        let variable: CatalogItemVariable = serde_json::from_value(json!({
            "id": "v1",
            "name": "laptop_model",
            "label": "Model",
            "type": 5,
            "active": true,
            "mandatory": false,
            "read_only": false,
            "choices": [{"index": 0, "label": "Mac", "value": "mac"}]
        }))
        .unwrap();
        assert_eq!(variable.variable_type, VariableType::SelectBox);
        assert_eq!(variable.choices[0].value, "mac");

        let variable: CatalogItemVariable =
            serde_json::from_value(json!({"id": "v2", "type": 99, "active": true})).unwrap();
        assert_eq!(variable.variable_type, VariableType::Unsupported(99));
    }

    #[test]
    fn test_field_mapping() {
        assert_eq!(
            field_from_variable(&variable(VariableType::CheckBox))
                .unwrap()
                .kind,
            FieldKind::Bool
        );
        assert_eq!(
            field_from_variable(&variable(VariableType::Email))
                .unwrap()
                .kind,
            FieldKind::Text {
                default: Some("n/a".into())
            }
        );
        assert!(matches!(
            field_from_variable(&variable(VariableType::LookupMultipleChoice))
                .unwrap()
                .kind,
            FieldKind::PickMany { .. }
        ));
        assert_eq!(
            field_from_variable(&variable(VariableType::DateTime))
                .unwrap()
                .kind,
            FieldKind::Timestamp
        );

        let reference = field_from_variable(&variable(VariableType::Reference)).unwrap();
        assert_eq!(reference.reference.as_deref(), Some("sys_user"));
        assert_eq!(reference.ref_qualifier.as_deref(), Some("active=true"));

        let requested_for = field_from_variable(&variable(VariableType::RequestedFor)).unwrap();
        assert_eq!(
            requested_for.kind,
            FieldKind::Text {
                default: Some(SYSTEM_ADMIN_USER_ID.into())
            }
        );

        assert_eq!(
            field_from_variable(&variable(VariableType::Duration))
                .unwrap()
                .kind,
            FieldKind::Text { default: None }
        );
    }

    #[test]
    fn test_skipped_variables() {
        for skipped in [
            VariableType::Unspecified,
            VariableType::Label,
            VariableType::Macro,
            VariableType::NumericScale,
            VariableType::Attachment,
            VariableType::Unsupported(99),
        ] {
            assert!(field_from_variable(&variable(skipped)).is_none(), "{skipped:?}");
        }

        let inactive = CatalogItemVariable {
            active: false,
            ..variable(VariableType::SingleLineText)
        };
        assert!(field_from_variable(&inactive).is_none());

        let read_only = CatalogItemVariable {
            read_only: true,
            ..variable(VariableType::SingleLineText)
        };
        assert!(field_from_variable(&read_only).is_none());
    }

    #[test]
    fn test_pick_choices_use_values() {
        let field = field_from_variable(&variable(VariableType::SelectBox)).unwrap();
        match field.kind {
            FieldKind::PickOne { choices } => {
                assert_eq!(choices[1].label, "high");
                assert_eq!(choices[1].value, "high");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_set_variable_mapping() {
        let record: SetVariableRecord = serde_json::from_value(json!({
            "sys_id": "sv1",
            "name": "cost_center",
            "question_text": "Cost center",
            "type": "6",
            "mandatory": "true",
            "default_value": "CC-1",
            "active": "1",
            "reference_qual": ""
        }))
        .unwrap();
        let variable = record.into_variable(Vec::new());
        assert_eq!(variable.variable_type, VariableType::SingleLineText);
        assert!(variable.mandatory);
        assert!(variable.active);
        assert_eq!(variable.label, "Cost center");
        assert_eq!(variable.value, "CC-1");
    }

    #[test]
    fn test_validate_ticket() {
        let schema = schema();
        let mut request = TicketRequest {
            description: "Need a laptop".into(),
            requested_for: "u1".into(),
            fields: BTreeMap::new(),
        };

        let err = validate_ticket(&schema, &request).unwrap_err();
        assert!(err.to_string().contains("catalog item is required"));

        request.fields.insert(
            CATALOG_ITEM_FIELD.into(),
            FieldValue::PickOne("item1".into()),
        );
        let err = validate_ticket(&schema, &request).unwrap_err();
        assert!(err.to_string().contains("'priority' is required"));

        request
            .fields
            .insert("priority".into(), FieldValue::PickOne("urgent".into()));
        let err = validate_ticket(&schema, &request).unwrap_err();
        assert!(err.to_string().contains("not an allowed value"));

        request
            .fields
            .insert("priority".into(), FieldValue::Text("high".into()));
        let err = validate_ticket(&schema, &request).unwrap_err();
        assert!(err.to_string().contains("wrong type"));

        request
            .fields
            .insert("priority".into(), FieldValue::PickOne("high".into()));
        assert_eq!(validate_ticket(&schema, &request).unwrap(), "item1");

        request
            .fields
            .insert("extra".into(), FieldValue::Bool(true));
        let err = validate_ticket(&schema, &request).unwrap_err();
        assert!(err.to_string().contains("'extra' is not part of schema"));
    }

    #[test]
    fn test_field_value_to_variable() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        assert_eq!(
            FieldValue::Timestamp(ts).to_variable(),
            json!("2024-03-01 09:30:00")
        );
        assert_eq!(
            FieldValue::PickMany(vec!["a".into(), "b".into()]).to_variable(),
            json!("a,b")
        );
        assert_eq!(FieldValue::Bool(true).to_variable(), json!(true));
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp("sys_created_on", "2024-01-15 08:00:05").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 5).unwrap());
        assert!(parse_timestamp("closed_at", "15/01/2024").is_err());
    }

    #[test]
    fn test_schema_offset_token() {
        assert_eq!(parse_schema_offset("").unwrap(), 0);
        assert_eq!(parse_schema_offset("100").unwrap(), 100);
        assert!(matches!(
            parse_schema_offset("abc"),
            Err(ServiceNowError::InvalidCursor(_))
        ));
    }
}
