//! Portal capability contracts, the ArcGIS REST implementation, and an
//! in-memory portal used by tests and offline runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wfsync_core::{Attributes, Record, GLOBAL_ID_FIELD, OBJECT_ID_FIELD};
use wfsync_storage::{PortalHttp, TransportError};

pub const CRATE_NAME: &str = "wfsync-adapters";

/// Server-maintained fields an update cannot change.
const SYSTEM_FIELDS: [&str; 2] = [OBJECT_ID_FIELD, GLOBAL_ID_FIELD];

/// Upper bound on query pages for one layer read.
pub const MAX_QUERY_PAGES: usize = 1_000;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("authentication failed for {username}: {message}")]
    Authentication { username: String, message: String },
    #[error("unexpected response from {url}: {message}")]
    UnexpectedResponse { url: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Message(String),
}

/// Outcome of a single add or update in an edit call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EditResult {
    pub object_id: Option<i64>,
    pub global_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-record results of an edit call, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditReport {
    pub add_results: Vec<EditResult>,
    pub update_results: Vec<EditResult>,
}

impl EditReport {
    pub fn failures(&self) -> impl Iterator<Item = &EditResult> {
        self.add_results
            .iter()
            .chain(self.update_results.iter())
            .filter(|r| !r.success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupReport {
    pub not_added: Vec<String>,
}

#[async_trait]
pub trait CollectionReader: Send + Sync {
    /// Every record of the layer, attributes and geometry verbatim.
    async fn query_all(&self, layer_url: &str) -> Result<Vec<Record>, AdapterError>;
}

#[async_trait]
pub trait CollectionWriter: Send + Sync {
    /// Apply adds and updates (updates matched by `OBJECTID`). Per-record
    /// failures are reported in the returned [`EditReport`], not as `Err`.
    async fn apply_edits(
        &self,
        layer_url: &str,
        adds: &[Record],
        updates: &[Record],
    ) -> Result<EditReport, AdapterError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// True only when an account with exactly this username exists.
    async fn user_exists(&self, username: &str) -> Result<bool, AdapterError>;
}

#[async_trait]
pub trait GroupMembership: Send + Sync {
    async fn add_users(
        &self,
        group_id: &str,
        usernames: &[String],
    ) -> Result<GroupReport, AdapterError>;
}

#[async_trait]
pub trait SchemaEditor: Send + Sync {
    async fn layer_fields(&self, layer_url: &str) -> Result<Vec<JsonValue>, AdapterError>;

    /// Replace the definition of the field named in `field["name"]`.
    async fn update_field_definition(
        &self,
        layer_url: &str,
        field: &JsonValue,
    ) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn item_data(&self, item_id: &str) -> Result<JsonValue, AdapterError>;

    async fn update_item_data(&self, item_id: &str, data: &JsonValue)
        -> Result<(), AdapterError>;
}

/// Everything the sync pipeline needs from a portal.
pub trait Portal:
    CollectionReader + CollectionWriter + UserDirectory + GroupMembership + SchemaEditor + ProjectStore
{
}

impl<T> Portal for T where
    T: CollectionReader
        + CollectionWriter
        + UserDirectory
        + GroupMembership
        + SchemaEditor
        + ProjectStore
{
}

/// Portal backed by the ArcGIS sharing and feature service REST APIs.
#[derive(Debug)]
pub struct ArcGisPortal {
    http: PortalHttp,
    rest_base: String,
    token: String,
    token_expires: Option<DateTime<Utc>>,
}

impl ArcGisPortal {
    /// Authenticate with a named user and keep the token for later calls.
    pub async fn connect(
        http: PortalHttp,
        org_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, AdapterError> {
        let rest_base = portal_rest_base(org_url);
        let url = format!("{rest_base}/generateToken");
        let referer = org_url.trim_end_matches('/');
        let response = http
            .post_form(
                &url,
                &[
                    ("username", username),
                    ("password", password),
                    ("client", "referer"),
                    ("referer", referer),
                    ("expiration", "120"),
                ],
            )
            .await
            .map_err(|err| match err {
                TransportError::Remote { message, .. } => AdapterError::Authentication {
                    username: username.to_string(),
                    message,
                },
                other => AdapterError::Transport(other),
            })?;

        let token = response
            .get("token")
            .and_then(JsonValue::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::Authentication {
                username: username.to_string(),
                message: "no token in response".to_string(),
            })?
            .to_string();
        let token_expires = response
            .get("expires")
            .and_then(JsonValue::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        info!(username, expires = ?token_expires, "authenticated");

        Ok(Self {
            http,
            rest_base,
            token,
            token_expires,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_expires(&self) -> Option<DateTime<Utc>> {
        self.token_expires
    }

    async fn item_owner(&self, item_id: &str) -> Result<String, AdapterError> {
        let url = format!("{}/content/items/{item_id}", self.rest_base);
        let info = self.http.get_json(&url, &[("token", self.token.as_str())]).await?;
        info.get("owner")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::UnexpectedResponse {
                url,
                message: "item has no owner".to_string(),
            })
    }
}

#[async_trait]
impl CollectionReader for ArcGisPortal {
    async fn query_all(&self, layer_url: &str) -> Result<Vec<Record>, AdapterError> {
        let url = format!("{}/query", layer_url.trim_end_matches('/'));
        let mut records = Vec::new();
        let mut seen = BTreeSet::new();
        let mut offset = 0usize;
        for _ in 0..MAX_QUERY_PAGES {
            let offset_param = offset.to_string();
            let page = self
                .http
                .get_json(
                    &url,
                    &[
                        ("where", "1=1"),
                        ("outFields", "*"),
                        ("returnGeometry", "true"),
                        ("orderByFields", OBJECT_ID_FIELD),
                        ("resultOffset", offset_param.as_str()),
                        ("token", self.token.as_str()),
                    ],
                )
                .await?;
            let (mut batch, exceeded) = decode_features(&url, &page)?;
            let fetched = batch.len();
            offset += fetched;
            batch.retain(|r| r.object_id().map_or(true, |id| seen.insert(id)));
            let fresh = batch.len();
            records.append(&mut batch);
            debug!(url = %url, fetched, fresh, total = records.len(), exceeded, "query page");
            if fetched > 0 && fresh == 0 {
                warn!(url = %url, offset, "server returned an already seen page; stopping");
                return Ok(records);
            }
            if !exceeded || fetched == 0 {
                return Ok(records);
            }
        }
        Err(AdapterError::UnexpectedResponse {
            url,
            message: format!("still paging after {MAX_QUERY_PAGES} pages"),
        })
    }
}

#[async_trait]
impl CollectionWriter for ArcGisPortal {
    async fn apply_edits(
        &self,
        layer_url: &str,
        adds: &[Record],
        updates: &[Record],
    ) -> Result<EditReport, AdapterError> {
        let url = format!("{}/applyEdits", layer_url.trim_end_matches('/'));
        let adds_json = encode_features(adds, true);
        let updates_json = encode_features(updates, false);
        // Caller-supplied GlobalIDs are only honoured when every add has one.
        let use_global_ids = !adds.is_empty() && adds.iter().all(|r| r.global_id().is_some());

        let mut params: Vec<(&str, &str)> = vec![
            ("rollbackOnFailure", "false"),
            ("token", self.token.as_str()),
        ];
        if !adds.is_empty() {
            params.push(("adds", adds_json.as_str()));
        }
        if !updates.is_empty() {
            params.push(("updates", updates_json.as_str()));
        }
        if use_global_ids {
            params.push(("useGlobalIds", "true"));
        }

        let response = self.http.post_form(&url, &params).await?;
        Ok(EditReport {
            add_results: decode_edit_results(&response, "addResults"),
            update_results: decode_edit_results(&response, "updateResults"),
        })
    }
}

#[async_trait]
impl UserDirectory for ArcGisPortal {
    async fn user_exists(&self, username: &str) -> Result<bool, AdapterError> {
        let url = format!("{}/community/users", self.rest_base);
        let response = self
            .http
            .get_json(
                &url,
                &[("q", username), ("num", "100"), ("token", self.token.as_str())],
            )
            .await?;
        Ok(search_has_exact_user(&response, username))
    }
}

#[async_trait]
impl GroupMembership for ArcGisPortal {
    async fn add_users(
        &self,
        group_id: &str,
        usernames: &[String],
    ) -> Result<GroupReport, AdapterError> {
        let url = format!("{}/community/groups/{group_id}/addUsers", self.rest_base);
        let users = usernames.join(",");
        let response = self
            .http
            .post_form(&url, &[("users", users.as_str()), ("token", self.token.as_str())])
            .await?;
        Ok(GroupReport {
            not_added: decode_not_added(&response),
        })
    }
}

#[async_trait]
impl SchemaEditor for ArcGisPortal {
    async fn layer_fields(&self, layer_url: &str) -> Result<Vec<JsonValue>, AdapterError> {
        let response = self
            .http
            .get_json(layer_url, &[("token", self.token.as_str())])
            .await?;
        Ok(response
            .get("fields")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_field_definition(
        &self,
        layer_url: &str,
        field: &JsonValue,
    ) -> Result<(), AdapterError> {
        let admin = admin_layer_url(layer_url).ok_or_else(|| {
            AdapterError::Message(format!("{layer_url} is not a feature service layer url"))
        })?;
        let url = format!("{admin}/updateDefinition");
        let definition = json!({ "fields": [field] }).to_string();
        let response = self
            .http
            .post_form(
                &url,
                &[("updateDefinition", definition.as_str()), ("token", self.token.as_str())],
            )
            .await?;
        if response.get("success").and_then(JsonValue::as_bool) == Some(false) {
            return Err(AdapterError::UnexpectedResponse {
                url,
                message: "updateDefinition reported success=false".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for ArcGisPortal {
    async fn item_data(&self, item_id: &str) -> Result<JsonValue, AdapterError> {
        let url = format!("{}/content/items/{item_id}/data", self.rest_base);
        let data = self.http.get_json(&url, &[("token", self.token.as_str())]).await?;
        if data.is_null() {
            return Err(AdapterError::NotFound(format!("item data for {item_id}")));
        }
        Ok(data)
    }

    async fn update_item_data(
        &self,
        item_id: &str,
        data: &JsonValue,
    ) -> Result<(), AdapterError> {
        let owner = self.item_owner(item_id).await?;
        let url = format!(
            "{}/content/users/{owner}/items/{item_id}/update",
            self.rest_base
        );
        let text = data.to_string();
        let response = self
            .http
            .post_form(&url, &[("text", text.as_str()), ("token", self.token.as_str())])
            .await?;
        if response.get("success").and_then(JsonValue::as_bool) != Some(true) {
            return Err(AdapterError::UnexpectedResponse {
                url,
                message: "item update was not acknowledged".to_string(),
            });
        }
        Ok(())
    }
}

/// `https://org.maps.arcgis.com/` → `https://org.maps.arcgis.com/sharing/rest`.
pub fn portal_rest_base(org_url: &str) -> String {
    let trimmed = org_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/sharing/rest") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/sharing/rest")
    }
}

/// Admin endpoint of a hosted layer, used for schema changes.
pub fn admin_layer_url(layer_url: &str) -> Option<String> {
    let trimmed = layer_url.trim_end_matches('/');
    trimmed
        .contains("/rest/services/")
        .then(|| trimmed.replacen("/rest/services/", "/rest/admin/services/", 1))
}

pub fn decode_features(url: &str, page: &JsonValue) -> Result<(Vec<Record>, bool), AdapterError> {
    let features = page
        .get("features")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::UnexpectedResponse {
            url: url.to_string(),
            message: "missing features array".to_string(),
        })?;
    let records = features
        .iter()
        .map(|feature| {
            let attributes: Attributes = feature
                .get("attributes")
                .and_then(JsonValue::as_object)
                .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            Record {
                attributes,
                geometry: feature.get("geometry").filter(|g| !g.is_null()).cloned(),
            }
        })
        .collect();
    let exceeded = page
        .get("exceededTransferLimit")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    Ok((records, exceeded))
}

/// Feature JSON for an edit payload. Adds go out without `OBJECTID`.
pub fn encode_features(records: &[Record], strip_object_id: bool) -> String {
    let features: Vec<JsonValue> = records
        .iter()
        .map(|record| {
            let attributes: serde_json::Map<String, JsonValue> = record
                .attributes
                .iter()
                .filter(|(k, _)| !(strip_object_id && k.as_str() == OBJECT_ID_FIELD))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let mut feature = json!({ "attributes": attributes });
            if let Some(geometry) = &record.geometry {
                feature["geometry"] = geometry.clone();
            }
            feature
        })
        .collect();
    JsonValue::Array(features).to_string()
}

pub fn decode_edit_results(response: &JsonValue, key: &str) -> Vec<EditResult> {
    response
        .get(key)
        .and_then(JsonValue::as_array)
        .map(|results| {
            results
                .iter()
                .map(|r| EditResult {
                    object_id: r.get("objectId").and_then(JsonValue::as_i64),
                    global_id: r
                        .get("globalId")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                    success: r.get("success").and_then(JsonValue::as_bool).unwrap_or(false),
                    error: r.get("error").map(|e| {
                        e.get("description")
                            .and_then(JsonValue::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| e.to_string())
                    }),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn search_has_exact_user(response: &JsonValue, username: &str) -> bool {
    response
        .get("results")
        .and_then(JsonValue::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|u| u.get("username").and_then(JsonValue::as_str))
                .any(|u| u == username)
        })
        .unwrap_or(false)
}

pub fn decode_not_added(response: &JsonValue) -> Vec<String> {
    response
        .get("notAdded")
        .and_then(JsonValue::as_array)
        .map(|users| {
            users
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryLayer {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub fields: Vec<JsonValue>,
    /// Every edit against a read-only layer fails per record.
    #[serde(default)]
    pub read_only: bool,
}

/// Complete state of a [`MemoryPortal`]; also the fixture file format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPortalState {
    #[serde(default)]
    pub layers: BTreeMap<String, MemoryLayer>,
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub items: BTreeMap<String, JsonValue>,
    /// Accounts the group endpoint refuses to add.
    #[serde(default)]
    pub group_refusals: BTreeSet<String>,
}

/// Portal that keeps every collection in memory, with the same per-record
/// edit semantics as the hosted service (server-assigned `OBJECTID`,
/// caller-supplied `GlobalID` preserved on adds, updates merge attributes
/// but never touch `OBJECTID` or `GlobalID`).
#[derive(Debug, Default)]
pub struct MemoryPortal {
    state: Mutex<MemoryPortalState>,
    calls: Mutex<Vec<String>>,
}

impl MemoryPortal {
    pub fn new(state: MemoryPortalState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_fixture(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let state: MemoryPortalState =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(state))
    }

    pub async fn snapshot(&self) -> MemoryPortalState {
        self.state.lock().await.clone()
    }

    pub async fn records(&self, layer_url: &str) -> Vec<Record> {
        self.state
            .lock()
            .await
            .layers
            .get(layer_url)
            .map(|l| l.records.clone())
            .unwrap_or_default()
    }

    /// Mutating calls in the order they were made, e.g. `updates <url> 2`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn log_call(&self, entry: String) {
        self.calls.lock().await.push(entry);
    }
}

fn mint_global_id() -> String {
    format!("{{{}}}", Uuid::new_v4().to_string().to_ascii_uppercase())
}

fn rejected(message: &str) -> EditResult {
    EditResult {
        success: false,
        error: Some(message.to_string()),
        ..EditResult::default()
    }
}

#[async_trait]
impl CollectionReader for MemoryPortal {
    async fn query_all(&self, layer_url: &str) -> Result<Vec<Record>, AdapterError> {
        let state = self.state.lock().await;
        state
            .layers
            .get(layer_url)
            .map(|layer| layer.records.clone())
            .ok_or_else(|| AdapterError::NotFound(format!("layer {layer_url}")))
    }
}

#[async_trait]
impl CollectionWriter for MemoryPortal {
    async fn apply_edits(
        &self,
        layer_url: &str,
        adds: &[Record],
        updates: &[Record],
    ) -> Result<EditReport, AdapterError> {
        if !updates.is_empty() {
            self.log_call(format!("updates {layer_url} {}", updates.len())).await;
        }
        if !adds.is_empty() {
            self.log_call(format!("adds {layer_url} {}", adds.len())).await;
        }

        let mut state = self.state.lock().await;
        let layer = state
            .layers
            .get_mut(layer_url)
            .ok_or_else(|| AdapterError::NotFound(format!("layer {layer_url}")))?;

        let mut report = EditReport::default();
        for update in updates {
            if layer.read_only {
                report.update_results.push(rejected("layer is read only"));
                continue;
            }
            let Some(object_id) = update.object_id() else {
                report.update_results.push(rejected("update without OBJECTID"));
                continue;
            };
            match layer
                .records
                .iter_mut()
                .find(|r| r.object_id() == Some(object_id))
            {
                Some(existing) => {
                    for (k, v) in &update.attributes {
                        if SYSTEM_FIELDS.contains(&k.as_str()) {
                            continue;
                        }
                        existing.attributes.insert(k.clone(), v.clone());
                    }
                    if update.geometry.is_some() {
                        existing.geometry = update.geometry.clone();
                    }
                    report.update_results.push(EditResult {
                        object_id: Some(object_id),
                        global_id: existing.global_id(),
                        success: true,
                        error: None,
                    });
                }
                None => report.update_results.push(rejected("no feature with OBJECTID")),
            }
        }

        for add in adds {
            if layer.read_only {
                report.add_results.push(rejected("layer is read only"));
                continue;
            }
            let object_id = layer
                .records
                .iter()
                .filter_map(Record::object_id)
                .max()
                .unwrap_or(0)
                + 1;
            let mut record = add.clone();
            record.set_object_id(object_id);
            let global_id = match record.global_id() {
                Some(existing) => existing,
                None => {
                    let minted = mint_global_id();
                    record.set(GLOBAL_ID_FIELD, minted.clone());
                    minted
                }
            };
            layer.records.push(record);
            report.add_results.push(EditResult {
                object_id: Some(object_id),
                global_id: Some(global_id),
                success: true,
                error: None,
            });
        }
        Ok(report)
    }
}

#[async_trait]
impl UserDirectory for MemoryPortal {
    async fn user_exists(&self, username: &str) -> Result<bool, AdapterError> {
        Ok(self.state.lock().await.users.contains(username))
    }
}

#[async_trait]
impl GroupMembership for MemoryPortal {
    async fn add_users(
        &self,
        group_id: &str,
        usernames: &[String],
    ) -> Result<GroupReport, AdapterError> {
        self.log_call(format!("addUsers {group_id} {}", usernames.len())).await;
        let mut state = self.state.lock().await;
        let mut report = GroupReport::default();
        let mut accepted = Vec::new();
        for username in usernames {
            if state.group_refusals.contains(username) || !state.users.contains(username) {
                report.not_added.push(username.clone());
            } else {
                accepted.push(username.clone());
            }
        }
        let members = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| AdapterError::NotFound(format!("group {group_id}")))?;
        members.extend(accepted);
        Ok(report)
    }
}

#[async_trait]
impl SchemaEditor for MemoryPortal {
    async fn layer_fields(&self, layer_url: &str) -> Result<Vec<JsonValue>, AdapterError> {
        let state = self.state.lock().await;
        state
            .layers
            .get(layer_url)
            .map(|layer| layer.fields.clone())
            .ok_or_else(|| AdapterError::NotFound(format!("layer {layer_url}")))
    }

    async fn update_field_definition(
        &self,
        layer_url: &str,
        field: &JsonValue,
    ) -> Result<(), AdapterError> {
        self.log_call(format!("updateDefinition {layer_url}")).await;
        let name = field
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| AdapterError::Message("field definition has no name".to_string()))?
            .to_string();
        let mut state = self.state.lock().await;
        let layer = state
            .layers
            .get_mut(layer_url)
            .ok_or_else(|| AdapterError::NotFound(format!("layer {layer_url}")))?;
        match layer
            .fields
            .iter_mut()
            .find(|f| f.get("name").and_then(JsonValue::as_str) == Some(name.as_str()))
        {
            Some(existing) => *existing = field.clone(),
            None => layer.fields.push(field.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for MemoryPortal {
    async fn item_data(&self, item_id: &str) -> Result<JsonValue, AdapterError> {
        self.state
            .lock()
            .await
            .items
            .get(item_id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("item {item_id}")))
    }

    async fn update_item_data(
        &self,
        item_id: &str,
        data: &JsonValue,
    ) -> Result<(), AdapterError> {
        self.log_call(format!("updateItem {item_id}")).await;
        self.state
            .lock()
            .await
            .items
            .insert(item_id.to_string(), data.clone());
        Ok(())
    }
}
