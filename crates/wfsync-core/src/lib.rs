//! Core record model and project definition types for wfsync.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "wfsync-core";

pub const OBJECT_ID_FIELD: &str = "OBJECTID";
pub const GLOBAL_ID_FIELD: &str = "GlobalID";
pub const USER_ID_FIELD: &str = "userId";
pub const WORKER_ID_FIELD: &str = "workerId";
pub const DISPATCHER_ID_FIELD: &str = "dispatcherId";
pub const ASSIGNMENT_TYPE_FIELD: &str = "assignmentType";

/// Field name → scalar value. Null is a legal value and means "no value".
pub type Attributes = BTreeMap<String, JsonValue>;

/// Record categories of a workforce project.
///
/// Serialized with the plural names used as keys in the project definition
/// document (`workers`, `dispatchers`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "workers")]
    Worker,
    #[serde(rename = "dispatchers")]
    Dispatcher,
    #[serde(rename = "assignments")]
    Assignment,
    #[serde(rename = "tracks")]
    Track,
}

impl Category {
    /// Order in which categories must be written. Assignments reference
    /// workers and dispatchers by surrogate key, so they come last.
    pub const SYNC_ORDER: [Category; 4] = [
        Category::Worker,
        Category::Dispatcher,
        Category::Track,
        Category::Assignment,
    ];

    /// Field used to decide identity across source and destination.
    pub fn business_key(self) -> &'static str {
        match self {
            Category::Worker | Category::Dispatcher => USER_ID_FIELD,
            Category::Assignment | Category::Track => GLOBAL_ID_FIELD,
        }
    }

    pub fn project_key(self) -> &'static str {
        match self {
            Category::Worker => "workers",
            Category::Dispatcher => "dispatchers",
            Category::Assignment => "assignments",
            Category::Track => "tracks",
        }
    }

    /// Worker and dispatcher records stand for named user accounts.
    pub fn is_user_backed(self) -> bool {
        matches!(self, Category::Worker | Category::Dispatcher)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.project_key())
    }
}

/// A feature: attributes plus an optional, opaque geometry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<JsonValue>,
}

impl Record {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            geometry: None,
        }
    }

    pub fn with_geometry(mut self, geometry: JsonValue) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.attributes.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<JsonValue>) {
        self.attributes.insert(field.to_string(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<JsonValue> {
        self.attributes.remove(field)
    }

    /// Comparable form of a key field. `None` when the field is absent,
    /// null, or blank, which makes the record unmatchable.
    pub fn key_value(&self, field: &str) -> Option<String> {
        self.get(field).and_then(key_string)
    }

    pub fn object_id(&self) -> Option<i64> {
        self.get(OBJECT_ID_FIELD).and_then(as_i64)
    }

    pub fn set_object_id(&mut self, object_id: i64) {
        self.set(OBJECT_ID_FIELD, object_id);
    }

    pub fn global_id(&self) -> Option<String> {
        self.key_value(GLOBAL_ID_FIELD)
    }

    /// Integer foreign key held in `field`; null or absent yields `None`.
    pub fn reference(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(as_i64)
    }
}

fn key_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Attribute allowlist applied to source records before reconciliation.
///
/// An empty filter keeps every attribute. Identity fields (the category's
/// business key, `OBJECTID`, `GlobalID`) always survive filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldFilter {
    fields: BTreeSet<String>,
}

impl FieldFilter {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn apply(&self, category: Category, mut record: Record) -> Record {
        if self.fields.is_empty() {
            return record;
        }
        let business_key = category.business_key();
        record.attributes.retain(|name, _| {
            name == business_key
                || name == OBJECT_ID_FIELD
                || name == GLOBAL_ID_FIELD
                || self.fields.contains(name)
        });
        record
    }
}

/// Tracking settings copied between projects.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackingSettings {
    pub enabled: Option<bool>,
    pub update_interval: Option<JsonValue>,
}

/// The project definition document (item data of the project item).
///
/// Kept as raw JSON so that keys this crate does not know about round-trip
/// untouched when the destination document is written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectDefinition(JsonValue);

impl ProjectDefinition {
    pub fn from_value(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        self.0
    }

    pub fn layer_url(&self, category: Category) -> Option<&str> {
        self.0
            .get(category.project_key())
            .and_then(|section| section.get("url"))
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn layer_urls(&self) -> Vec<(Category, &str)> {
        Category::SYNC_ORDER
            .iter()
            .filter_map(|c| self.layer_url(*c).map(|url| (*c, url)))
            .collect()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.str_field("groupId")
    }

    pub fn dispatcher_web_map_id(&self) -> Option<&str> {
        self.str_field("dispatcherWebMapId")
    }

    pub fn worker_web_map_id(&self) -> Option<&str> {
        self.str_field("workerWebMapId")
    }

    pub fn tracking(&self) -> TrackingSettings {
        let tracks = self.0.get(Category::Track.project_key());
        TrackingSettings {
            enabled: tracks
                .and_then(|t| t.get("enabled"))
                .and_then(JsonValue::as_bool),
            update_interval: tracks
                .and_then(|t| t.get("updateInterval"))
                .filter(|v| !v.is_null())
                .cloned(),
        }
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking().enabled.unwrap_or(false)
    }

    pub fn integrations(&self) -> Option<&JsonValue> {
        self.0.get("integrations").filter(|v| !v.is_null())
    }

    /// Copy tracking flags and the integration list from `source`.
    /// Returns the names of the keys that were written.
    pub fn apply_settings_from(&mut self, source: &ProjectDefinition) -> Vec<&'static str> {
        let mut copied = Vec::new();
        let tracking = source.tracking();
        let integrations = source.integrations().cloned();

        let root = self.object_mut();
        if tracking.enabled.is_some() || tracking.update_interval.is_some() {
            let tracks = root
                .entry(Category::Track.project_key())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if !tracks.is_object() {
                *tracks = JsonValue::Object(Map::new());
            }
            if let Some(section) = tracks.as_object_mut() {
                if let Some(enabled) = tracking.enabled {
                    section.insert("enabled".to_string(), JsonValue::Bool(enabled));
                    copied.push("tracks.enabled");
                }
                if let Some(interval) = tracking.update_interval {
                    section.insert("updateInterval".to_string(), interval);
                    copied.push("tracks.updateInterval");
                }
            }
        }
        if let Some(integrations) = integrations {
            root.insert("integrations".to_string(), integrations);
            copied.push("integrations");
        }
        copied
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    fn object_mut(&mut self) -> &mut Map<String, JsonValue> {
        if !self.0.is_object() {
            self.0 = JsonValue::Object(Map::new());
        }
        match &mut self.0 {
            JsonValue::Object(map) => map,
            _ => unreachable!("document was just coerced to an object"),
        }
    }
}
