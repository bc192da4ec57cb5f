//! Common test utilities for xavyo-connector-servicenow integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use xavyo_connector_servicenow::{
    PageSignal, ServiceNowConfig, ServiceNowConnector, ServiceNowError, ServiceNowResult,
    TableApi, TablePage, TableQuery,
};

pub const ROLE_ID: &str = "r1";

/// Config pointed at a fake instance.
pub fn test_config(page_size: u32) -> ServiceNowConfig {
    ServiceNowConfig::builder()
        .deployment("acme")
        .username("admin")
        .password("secret")
        .page_size(page_size)
        .build()
        .unwrap()
}

/// Test data factory for `sys_user` rows.
pub fn create_test_user(id: &str, user_name: &str) -> Value {
    json!({
        "sys_id": id,
        "name": format!("Test User {user_name}"),
        "user_name": user_name,
        "email": format!("{user_name}@acme.com"),
        "first_name": "Test",
        "last_name": user_name,
        "active": "true"
    })
}

/// Test data factory for `sys_user_group` rows.
pub fn create_test_group(id: &str, name: &str) -> Value {
    json!({
        "sys_id": id,
        "name": name,
        "description": format!("Test group: {name}")
    })
}

/// Test data factory for `sys_user_has_role` rows.
pub fn create_user_role(id: &str, user: &str, role: &str, inherited: bool) -> Value {
    json!({
        "sys_id": id,
        "user": user,
        "role": role,
        "inherited": inherited.to_string()
    })
}

/// Test data factory for `sys_group_has_role` rows.
pub fn create_group_role(id: &str, group: &str, role: &str, inherits: bool) -> Value {
    json!({
        "sys_id": id,
        "group": group,
        "role": role,
        "inherits": inherits.to_string()
    })
}

/// In-memory table store.
///
/// Supports `field=value` and `fieldINa,b` clauses joined by `^`, reports
/// `X-Total-Count` style totals and records every write. Queries against a
/// table and single deletes can be made to fail.
#[derive(Default)]
pub struct FakeInstance {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    catalog: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<String>>,
    fail_query_on: Mutex<Option<String>>,
    fail_delete_at: Mutex<Option<usize>>,
    deletes: Mutex<usize>,
    next_id: Mutex<u64>,
}

impl FakeInstance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, table: &str, record: Value) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(record);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Canned Service Catalog response for `path`.
    pub fn catalog_response(&self, path: &str, result: Value) {
        self.catalog
            .lock()
            .unwrap()
            .insert(path.to_string(), result);
    }

    /// Makes every query against `table` fail with a 503 until cleared.
    pub fn fail_query_on(&self, table: &str) {
        *self.fail_query_on.lock().unwrap() = Some(table.to_string());
    }

    /// Lets queries through again.
    pub fn clear_query_failure(&self) {
        *self.fail_query_on.lock().unwrap() = None;
    }

    /// Makes the delete with this zero-based index fail.
    pub fn fail_delete_at(&self, index: usize) {
        *self.fail_delete_at.lock().unwrap() = Some(index);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that changed the store.
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("query ") && !c.starts_with("get "))
            .collect()
    }

    pub fn connector(self: &Arc<Self>, page_size: u32) -> ServiceNowConnector {
        ServiceNowConnector::with_api(test_config(page_size), self.clone())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn field_str(record: &Value, field: &str) -> String {
    match record.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn matches(record: &Value, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }
    query.split('^').all(|clause| {
        if let Some((field, values)) = clause.split_once("IN") {
            let actual = field_str(record, field);
            values.split(',').any(|v| v == actual)
        } else if let Some((field, value)) = clause.split_once('=') {
            field_str(record, field) == value
        } else {
            true
        }
    })
}

fn not_found(table: &str, id: &str) -> ServiceNowError {
    ServiceNowError::Status {
        status: 404,
        message: format!("No Record found: {table}/{id}"),
    }
}

fn unavailable() -> ServiceNowError {
    ServiceNowError::Status {
        status: 503,
        message: "Service Unavailable".into(),
    }
}

#[async_trait]
impl TableApi for FakeInstance {
    async fn query(&self, table: &str, query: &TableQuery) -> ServiceNowResult<TablePage> {
        self.record(format!(
            "query {table} {} offset={}",
            query.query, query.offset
        ));
        if self.fail_query_on.lock().unwrap().as_deref() == Some(table) {
            return Err(unavailable());
        }
        let matching: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|r| matches(r, query.query.as_str()))
            .collect();
        let total = matching.len() as u64;
        let limit = if query.limit == 0 {
            usize::MAX
        } else {
            query.limit as usize
        };
        let records = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(limit)
            .collect();
        Ok(TablePage::new(records, PageSignal::Total(total)))
    }

    async fn get(&self, table: &str, id: &str, _fields: &[&str]) -> ServiceNowResult<Value> {
        self.record(format!("get {table}/{id}"));
        self.rows(table)
            .into_iter()
            .find(|r| field_str(r, "sys_id") == id)
            .ok_or_else(|| not_found(table, id))
    }

    async fn create(&self, table: &str, mut payload: Value) -> ServiceNowResult<Value> {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("{table}-{next}")
        };
        payload["sys_id"] = json!(id);
        self.record(format!("create {table} {payload}"));
        self.insert(table, payload.clone());
        Ok(payload)
    }

    async fn update(&self, table: &str, id: &str, payload: Value) -> ServiceNowResult<Value> {
        self.record(format!("update {table}/{id} {payload}"));
        let mut tables = self.tables.lock().unwrap();
        let record = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| field_str(r, "sys_id") == id))
            .ok_or_else(|| not_found(table, id))?;
        if let (Some(target), Value::Object(changes)) = (record.as_object_mut(), payload) {
            target.extend(changes);
        }
        Ok(record.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> ServiceNowResult<()> {
        let index = {
            let mut deletes = self.deletes.lock().unwrap();
            let index = *deletes;
            *deletes += 1;
            index
        };
        if *self.fail_delete_at.lock().unwrap() == Some(index) {
            return Err(unavailable());
        }
        self.record(format!("delete {table}/{id}"));
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.get_mut(table).ok_or_else(|| not_found(table, id))?;
        let before = rows.len();
        rows.retain(|r| field_str(r, "sys_id") != id);
        if rows.len() == before {
            return Err(not_found(table, id));
        }
        Ok(())
    }

    async fn catalog_get(
        &self,
        path: &str,
        _params: &[(&str, String)],
    ) -> ServiceNowResult<TablePage> {
        self.record(format!("get catalog/{path}"));
        let records = match self.catalog.lock().unwrap().get(path).cloned() {
            Some(Value::Array(records)) => records,
            Some(Value::Null) | None => Vec::new(),
            Some(record) => vec![record],
        };
        Ok(TablePage::new(records, PageSignal::HasMore(false)))
    }

    async fn catalog_post(&self, path: &str, body: Value) -> ServiceNowResult<Value> {
        self.record(format!("post catalog/{path} {body}"));
        self.catalog
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("catalog", path))
    }
}
