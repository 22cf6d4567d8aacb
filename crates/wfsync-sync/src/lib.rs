//! Project copy pipeline: reconciliation, foreign-key remapping, destination
//! writes, and the schema/config/web-map copy that follows them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Layer};
use uuid::Uuid;
use wfsync_adapters::{
    AdapterError, ArcGisPortal, CollectionWriter, EditReport, GroupMembership, Portal,
    ProjectStore, SchemaEditor, UserDirectory,
};
use wfsync_core::{
    Category, FieldFilter, ProjectDefinition, Record, ASSIGNMENT_TYPE_FIELD,
    DISPATCHER_ID_FIELD, GLOBAL_ID_FIELD, OBJECT_ID_FIELD, USER_ID_FIELD, WORKER_ID_FIELD,
};
use wfsync_storage::{HttpClientConfig, PortalHttp};

pub const CRATE_NAME: &str = "wfsync-sync";

/// Connection settings for one run. HTTP knobs come from the environment.
#[derive(Clone)]
pub struct SyncConfig {
    pub org_url: String,
    pub username: String,
    pub password: String,
    pub source_project_id: String,
    pub destination_project_id: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub options: SyncOptions,
}

impl SyncConfig {
    pub fn new(
        org_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        source_project_id: impl Into<String>,
        destination_project_id: impl Into<String>,
    ) -> Self {
        Self {
            org_url: org_url.into(),
            username: username.into(),
            password: password.into(),
            source_project_id: source_project_id.into(),
            destination_project_id: destination_project_id.into(),
            user_agent: std::env::var("WFSYNC_USER_AGENT")
                .unwrap_or_else(|_| format!("wfsync/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("WFSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("org_url", &self.org_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("source_project_id", &self.source_project_id)
            .field("destination_project_id", &self.destination_project_id)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("options", &self.options)
            .finish()
    }
}

/// Optional steps and per-category attribute filters, loadable from YAML:
///
/// ```yaml
/// copy_tracks: false
/// field_filters:
///   workers: [name, status, title, contactNumber]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub copy_tracks: bool,
    pub copy_schema: bool,
    pub copy_project_settings: bool,
    pub copy_web_maps: bool,
    pub field_filters: BTreeMap<Category, FieldFilter>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            copy_tracks: true,
            copy_schema: true,
            copy_project_settings: true,
            copy_web_maps: true,
            field_filters: BTreeMap::new(),
        }
    }
}

impl SyncOptions {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply_filter(&self, category: Category, records: Vec<Record>) -> Vec<Record> {
        match self.field_filters.get(&category) {
            Some(filter) if !filter.is_empty() => records
                .into_iter()
                .map(|r| filter.apply(category, r))
                .collect(),
            _ => records,
        }
    }
}

/// Where and how verbosely to log. Built by the caller and handed to
/// [`init_logging`]; the pipeline itself reads no logging state.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_file: PathBuf,
    pub console_filter: String,
    pub file_filter: String,
}

impl LoggingConfig {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            console_filter: std::env::var("WFSYNC_LOG").unwrap_or_else(|_| "info".to_string()),
            file_filter: "debug".to_string(),
        }
    }
}

/// Install console (INFO+) and file (DEBUG+) layers. The file layer appends
/// to exactly `log_file`. Keep the
/// returned guard alive until exit so buffered file output is flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    let file_name = config
        .log_file
        .file_name()
        .with_context(|| format!("log file {} has no file name", config.log_file.display()))?;
    let dir = config
        .log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));

    let console_filter = EnvFilter::try_new(&config.console_filter)
        .with_context(|| format!("parsing console filter {:?}", config.console_filter))?;
    let file_filter = EnvFilter::try_new(&config.file_filter)
        .with_context(|| format!("parsing file filter {:?}", config.file_filter))?;

    let console = tracing_fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout)
        .with_filter(console_filter);
    let file = tracing_fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(guard)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("assignment {assignment} references {field}={source_id}, which has no destination counterpart")]
    UnresolvedReference {
        field: &'static str,
        assignment: String,
        source_id: i64,
    },
    #[error("assignment {assignment} has {field}={value}, which is not an integer id")]
    InvalidReference {
        field: &'static str,
        assignment: String,
        value: String,
    },
    #[error("{project} project has no {category} layer")]
    MissingLayer { project: String, category: Category },
}

/// Source records split by whether the destination already holds them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_add: Vec<Record>,
    pub to_update: Vec<Record>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_update.len()
    }
}

/// Partition `source` into adds and updates by `key_field`.
///
/// A source record whose key equals a destination record's key takes that
/// destination record's `OBJECTID` and becomes an update; the first matching
/// destination record wins. When the key is not `GlobalID`, the source
/// `GlobalID` is dropped from the update so the destination keeps its own.
/// Anything else, including records without a usable key, is added
/// unchanged. Linear scan per source record.
pub fn reconcile(source: Vec<Record>, destination: &[Record], key_field: &str) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for mut record in source {
        let matched = record.key_value(key_field).and_then(|key| {
            destination
                .iter()
                .find(|d| d.key_value(key_field).as_deref() == Some(key.as_str()))
        });
        match matched {
            Some(existing) => {
                match existing.object_id() {
                    Some(object_id) => record.set_object_id(object_id),
                    None => {
                        record.remove(OBJECT_ID_FIELD);
                    }
                }
                if key_field != GLOBAL_ID_FIELD {
                    record.remove(GLOBAL_ID_FIELD);
                }
                plan.to_update.push(record);
            }
            None => plan.to_add.push(record),
        }
    }
    plan
}

/// Drop worker/dispatcher records whose `userId` is missing or unknown to
/// the organization. Each dropped record is logged with a warning.
pub async fn gate_known_users<D>(
    directory: &D,
    category: Category,
    records: Vec<Record>,
) -> Result<Vec<Record>, AdapterError>
where
    D: UserDirectory + ?Sized,
{
    let mut known: BTreeMap<String, bool> = BTreeMap::new();
    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        let Some(username) = record.key_value(USER_ID_FIELD) else {
            warn!(
                %category,
                object_id = ?record.object_id(),
                "record has no userId and will not be copied"
            );
            continue;
        };
        let exists = match known.get(&username) {
            Some(exists) => *exists,
            None => {
                let exists = directory.user_exists(&username).await?;
                known.insert(username.clone(), exists);
                exists
            }
        };
        if exists {
            kept.push(record);
        } else {
            warn!(%category, username = %username, "User '{username}' does not exist in your org and will not be added");
        }
    }
    Ok(kept)
}

/// Source `OBJECTID` → destination `OBJECTID` for records paired by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    entries: BTreeMap<i64, i64>,
}

impl IdentityMap {
    pub fn build(source: &[Record], destination: &[Record], key_field: &str) -> Self {
        let mut entries = BTreeMap::new();
        for record in source {
            let (Some(source_id), Some(key)) = (record.object_id(), record.key_value(key_field))
            else {
                continue;
            };
            let target = destination
                .iter()
                .find(|d| d.key_value(key_field).as_deref() == Some(key.as_str()))
                .and_then(Record::object_id);
            if let Some(destination_id) = target {
                entries.insert(source_id, destination_id);
            }
        }
        Self { entries }
    }

    pub fn get(&self, source_id: i64) -> Option<i64> {
        self.entries.get(&source_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rewrite `workerId` and `dispatcherId` from source to destination surrogate
/// keys. Null or absent references stay as they are. Any other value must be
/// an integer with a map entry, otherwise the whole remap fails.
pub fn remap_assignments(
    assignments: Vec<Record>,
    workers: &IdentityMap,
    dispatchers: &IdentityMap,
) -> Result<Vec<Record>, SyncError> {
    assignments
        .into_iter()
        .map(|mut record| -> Result<Record, SyncError> {
            for (field, map) in [(WORKER_ID_FIELD, workers), (DISPATCHER_ID_FIELD, dispatchers)] {
                match record.get(field) {
                    None | Some(JsonValue::Null) => continue,
                    Some(_) => {}
                }
                let assignment = || {
                    record
                        .global_id()
                        .unwrap_or_else(|| "<no GlobalID>".to_string())
                };
                let Some(source_id) = record.reference(field) else {
                    return Err(SyncError::InvalidReference {
                        field,
                        assignment: assignment(),
                        value: record.get(field).map(JsonValue::to_string).unwrap_or_default(),
                    });
                };
                let destination_id =
                    map.get(source_id)
                        .ok_or_else(|| SyncError::UnresolvedReference {
                            field,
                            assignment: assignment(),
                            source_id,
                        })?;
                record.set(field, destination_id);
            }
            Ok(record)
        })
        .collect()
}

/// Build both identity maps from worker/dispatcher sets and remap.
pub fn remap(
    assignments: Vec<Record>,
    source_workers: &[Record],
    destination_workers: &[Record],
    source_dispatchers: &[Record],
    destination_dispatchers: &[Record],
) -> Result<Vec<Record>, SyncError> {
    let workers = IdentityMap::build(source_workers, destination_workers, USER_ID_FIELD);
    let dispatchers =
        IdentityMap::build(source_dispatchers, destination_dispatchers, USER_ID_FIELD);
    remap_assignments(assignments, &workers, &dispatchers)
}

/// What happened to one category at the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryOutcome {
    pub category: Category,
    pub rejected: usize,
    pub added: usize,
    pub updated: usize,
    pub failed: usize,
    pub group_added: usize,
    pub group_not_added: Vec<String>,
}

impl CategoryOutcome {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            rejected: 0,
            added: 0,
            updated: 0,
            failed: 0,
            group_added: 0,
            group_not_added: Vec::new(),
        }
    }
}

/// Apply a plan: updates first, then adds, then (user-backed categories)
/// group membership for every account written successfully.
///
/// Nothing here aborts the run. Failed edit calls and per-record failures
/// are logged and counted; earlier writes are never rolled back.
pub async fn write_category<P>(
    portal: &P,
    layer_url: &str,
    category: Category,
    plan: &ReconcilePlan,
    group_id: Option<&str>,
) -> CategoryOutcome
where
    P: CollectionWriter + GroupMembership + ?Sized,
{
    let mut outcome = CategoryOutcome::new(category);
    if plan.is_empty() {
        info!(%category, "There are no new or changed {category} to write");
        return outcome;
    }

    let mut written_users = Vec::new();

    if !plan.to_update.is_empty() {
        info!(%category, count = plan.to_update.len(), "Updating {category}...");
        let report = apply_logged(portal, layer_url, category, &[], &plan.to_update).await;
        let results = report.map(|r| r.update_results).unwrap_or_default();
        outcome.updated = tally(&plan.to_update, &results, &mut written_users);
        outcome.failed += plan.to_update.len() - outcome.updated;
    }

    if !plan.to_add.is_empty() {
        info!(%category, count = plan.to_add.len(), "Adding {category}...");
        let report = apply_logged(portal, layer_url, category, &plan.to_add, &[]).await;
        let results = report.map(|r| r.add_results).unwrap_or_default();
        outcome.added = tally(&plan.to_add, &results, &mut written_users);
        outcome.failed += plan.to_add.len() - outcome.added;
    }

    if category.is_user_backed() && !written_users.is_empty() {
        match group_id {
            Some(group_id) => {
                info!(%category, group_id, "Adding {category} to project group...");
                match portal.add_users(group_id, &written_users).await {
                    Ok(report) => {
                        for username in &report.not_added {
                            warn!(%category, username = %username, group_id, "user was not added to the project group");
                        }
                        outcome.group_added = written_users.len() - report.not_added.len().min(written_users.len());
                        outcome.group_not_added = report.not_added;
                    }
                    Err(err) => {
                        error!(%category, group_id, error = %err, "adding users to the project group failed");
                        outcome.group_not_added = written_users;
                    }
                }
            }
            None => {
                warn!(%category, "destination project has no groupId; group membership not updated");
                outcome.group_not_added = written_users;
            }
        }
    }

    info!(
        %category,
        added = outcome.added,
        updated = outcome.updated,
        failed = outcome.failed,
        "Completed"
    );
    outcome
}

async fn apply_logged<P>(
    portal: &P,
    layer_url: &str,
    category: Category,
    adds: &[Record],
    updates: &[Record],
) -> Option<EditReport>
where
    P: CollectionWriter + ?Sized,
{
    match portal.apply_edits(layer_url, adds, updates).await {
        Ok(report) => {
            for failure in report.failures() {
                warn!(
                    %category,
                    object_id = ?failure.object_id,
                    global_id = ?failure.global_id,
                    error = failure.error.as_deref().unwrap_or("unknown"),
                    "edit rejected by destination"
                );
            }
            Some(report)
        }
        Err(err) => {
            error!(%category, layer_url, error = %err, "edit request failed");
            None
        }
    }
}

/// Count successes, collecting the usernames of successfully written records.
fn tally(
    records: &[Record],
    results: &[wfsync_adapters::EditResult],
    written_users: &mut Vec<String>,
) -> usize {
    let mut succeeded = 0;
    for (record, result) in records.iter().zip(results) {
        if !result.success {
            continue;
        }
        succeeded += 1;
        if let Some(username) = record.key_value(USER_ID_FIELD) {
            written_users.push(username);
        }
    }
    succeeded
}

/// Copy the `assignmentType` field definition when the source has one.
/// Returns whether a definition was written.
pub async fn copy_assignment_type_field<P>(
    portal: &P,
    source_layer: &str,
    destination_layer: &str,
) -> Result<bool, AdapterError>
where
    P: SchemaEditor + ?Sized,
{
    let fields = portal.layer_fields(source_layer).await?;
    let Some(field) = fields
        .iter()
        .find(|f| f.get("name").and_then(JsonValue::as_str) == Some(ASSIGNMENT_TYPE_FIELD))
    else {
        info!("source assignments have no {ASSIGNMENT_TYPE_FIELD} field; schema left unchanged");
        return Ok(false);
    };
    portal
        .update_field_definition(destination_layer, field)
        .await?;
    info!("copied {ASSIGNMENT_TYPE_FIELD} field definition");
    Ok(true)
}

/// Copy tracking flags and integrations into the destination project item.
pub async fn copy_project_settings<P>(
    portal: &P,
    source: &ProjectDefinition,
    destination_id: &str,
    destination: &mut ProjectDefinition,
) -> Result<Vec<&'static str>, AdapterError>
where
    P: ProjectStore + ?Sized,
{
    let copied = destination.apply_settings_from(source);
    if copied.is_empty() {
        info!("source project has no tracking or integration settings to copy");
        return Ok(copied);
    }
    portal
        .update_item_data(destination_id, destination.as_value())
        .await?;
    info!(keys = ?copied, "copied project settings");
    Ok(copied)
}

/// Comparable form of a layer URL: no scheme, no trailing slash, lowercase.
pub fn normalize_layer_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_ascii_lowercase()
}

/// Source → destination URL pairs for every layer both projects define,
/// plus the parent feature service URLs.
pub fn layer_url_replacements(
    source: &ProjectDefinition,
    destination: &ProjectDefinition,
) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut seen = BTreeSet::new();
    for category in Category::SYNC_ORDER {
        let (Some(from), Some(to)) = (source.layer_url(category), destination.layer_url(category))
        else {
            continue;
        };
        for (from, to) in [
            (from.to_string(), to.to_string()),
            (service_url(from), service_url(to)),
        ] {
            if seen.insert(normalize_layer_url(&from)) {
                pairs.push((from, to));
            }
        }
    }
    pairs
}

fn service_url(layer_url: &str) -> String {
    let trimmed = layer_url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((service, layer)) if !layer.is_empty() && layer.bytes().all(|b| b.is_ascii_digit()) => {
            service.to_string()
        }
        _ => trimmed.to_string(),
    }
}

/// Point operational layers (and nested group layers and tables) at the
/// destination. Returns how many URLs changed.
pub fn rewrite_web_map_urls(map: &mut JsonValue, replacements: &[(String, String)]) -> usize {
    let lookup: BTreeMap<String, &str> = replacements
        .iter()
        .map(|(from, to)| (normalize_layer_url(from), to.as_str()))
        .collect();
    let mut rewritten = 0;
    for key in ["operationalLayers", "tables"] {
        if let Some(layers) = map.get_mut(key).and_then(JsonValue::as_array_mut) {
            for layer in layers {
                rewritten += rewrite_layer(layer, &lookup);
            }
        }
    }
    rewritten
}

fn rewrite_layer(layer: &mut JsonValue, lookup: &BTreeMap<String, &str>) -> usize {
    let mut rewritten = 0;
    let target = layer
        .get("url")
        .and_then(JsonValue::as_str)
        .and_then(|url| lookup.get(&normalize_layer_url(url)).copied());
    if let Some(target) = target {
        layer["url"] = JsonValue::String(target.to_string());
        rewritten += 1;
    }
    if let Some(children) = layer.get_mut("layers").and_then(JsonValue::as_array_mut) {
        for child in children {
            rewritten += rewrite_layer(child, lookup);
        }
    }
    rewritten
}

/// Rewrite the destination project's dispatcher and worker web maps.
pub async fn rewrite_web_maps<P>(
    portal: &P,
    destination: &ProjectDefinition,
    replacements: &[(String, String)],
) -> Result<usize, AdapterError>
where
    P: ProjectStore + ?Sized,
{
    let mut total = 0;
    let map_ids = [
        ("dispatcher", destination.dispatcher_web_map_id()),
        ("worker", destination.worker_web_map_id()),
    ];
    for (role, map_id) in map_ids {
        let Some(map_id) = map_id else {
            warn!(role, "destination project has no {role} web map");
            continue;
        };
        let mut data = portal.item_data(map_id).await?;
        let rewritten = rewrite_web_map_urls(&mut data, replacements);
        if rewritten == 0 {
            info!(role, map_id, "web map already points at the destination");
            continue;
        }
        portal.update_item_data(map_id, &data).await?;
        info!(role, map_id, rewritten, "rewrote web map layer urls");
        total += rewritten;
    }
    Ok(total)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories: Vec<CategoryOutcome>,
    pub assignment_type_copied: bool,
    pub settings_copied: Vec<String>,
    pub web_map_layers_rewritten: usize,
    pub config_errors: Vec<String>,
}

impl SyncRunSummary {
    pub fn outcome(&self, category: Category) -> Option<&CategoryOutcome> {
        self.categories.iter().find(|o| o.category == category)
    }
}

/// Copies one project into another through any [`Portal`].
pub struct SyncPipeline<P> {
    portal: P,
    source_project_id: String,
    destination_project_id: String,
    options: SyncOptions,
}

impl<P: Portal> SyncPipeline<P> {
    pub fn new(
        portal: P,
        source_project_id: impl Into<String>,
        destination_project_id: impl Into<String>,
        options: SyncOptions,
    ) -> Self {
        Self {
            portal,
            source_project_id: source_project_id.into(),
            destination_project_id: destination_project_id.into(),
            options,
        }
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            source = %self.source_project_id,
            destination = %self.destination_project_id
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        info!("Reading source project");
        let source = self.load_project(&self.source_project_id).await?;
        info!("Reading destination project");
        let mut destination = self.load_project(&self.destination_project_id).await?;

        let source_workers = self.read_source(&source, Category::Worker).await?;
        let source_dispatchers = self.read_source(&source, Category::Dispatcher).await?;
        let source_assignments = self.read_source(&source, Category::Assignment).await?;
        let source_tracks = if self.tracks_enabled(&source, &destination) {
            Some(self.read_source(&source, Category::Track).await?)
        } else {
            None
        };

        let group_id = destination.group_id().map(str::to_string);
        let mut categories = Vec::new();

        for (category, records) in [
            (Category::Worker, &source_workers),
            (Category::Dispatcher, &source_dispatchers),
        ] {
            let url = self.layer(&destination, category, &self.destination_project_id)?;
            categories.push(
                self.sync_category(category, records.clone(), &url, group_id.as_deref())
                    .await?,
            );
        }

        if let Some(tracks) = source_tracks {
            let url = self.layer(&destination, Category::Track, &self.destination_project_id)?;
            categories.push(self.sync_category(Category::Track, tracks, &url, None).await?);
        }

        let worker_url = self.layer(&destination, Category::Worker, &self.destination_project_id)?;
        let dispatcher_url =
            self.layer(&destination, Category::Dispatcher, &self.destination_project_id)?;
        let destination_workers = self.query(&worker_url, Category::Worker).await?;
        let destination_dispatchers = self.query(&dispatcher_url, Category::Dispatcher).await?;
        let remapped = remap(
            source_assignments,
            &source_workers,
            &destination_workers,
            &source_dispatchers,
            &destination_dispatchers,
        )
        .context("remapping assignment worker/dispatcher references")?;
        let assignment_url =
            self.layer(&destination, Category::Assignment, &self.destination_project_id)?;
        categories.push(
            self.sync_category(Category::Assignment, remapped, &assignment_url, None)
                .await?,
        );

        let mut config_errors = Vec::new();

        let mut assignment_type_copied = false;
        if self.options.copy_schema {
            let source_url = self.layer(&source, Category::Assignment, &self.source_project_id)?;
            match copy_assignment_type_field(&self.portal, &source_url, &assignment_url).await {
                Ok(copied) => assignment_type_copied = copied,
                Err(err) => {
                    error!(error = %err, "copying the assignment type field failed");
                    config_errors.push(format!("assignment type field: {err}"));
                }
            }
        }

        let mut settings_copied = Vec::new();
        if self.options.copy_project_settings {
            match copy_project_settings(
                &self.portal,
                &source,
                &self.destination_project_id,
                &mut destination,
            )
            .await
            {
                Ok(keys) => settings_copied = keys.into_iter().map(str::to_string).collect(),
                Err(err) => {
                    error!(error = %err, "copying project settings failed");
                    config_errors.push(format!("project settings: {err}"));
                }
            }
        }

        let mut web_map_layers_rewritten = 0;
        if self.options.copy_web_maps {
            let replacements = layer_url_replacements(&source, &destination);
            match rewrite_web_maps(&self.portal, &destination, &replacements).await {
                Ok(count) => web_map_layers_rewritten = count,
                Err(err) => {
                    error!(error = %err, "rewriting web maps failed");
                    config_errors.push(format!("web maps: {err}"));
                }
            }
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            categories,
            assignment_type_copied,
            settings_copied,
            web_map_layers_rewritten,
            config_errors,
        };
        info!(
            elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_category(
        &self,
        category: Category,
        records: Vec<Record>,
        destination_url: &str,
        group_id: Option<&str>,
    ) -> Result<CategoryOutcome> {
        let span = info_span!("sync_category", %category);
        async {
            info!("Validating {category}...");
            let read = records.len();
            let candidates = if category.is_user_backed() {
                gate_known_users(&self.portal, category, records)
                    .await
                    .with_context(|| format!("checking {category} accounts"))?
            } else {
                records
            };
            let rejected = read - candidates.len();

            let existing = self.query(destination_url, category).await?;
            let plan = reconcile(candidates, &existing, category.business_key());
            info!(
                to_add = plan.to_add.len(),
                to_update = plan.to_update.len(),
                rejected,
                "reconciled {category}"
            );

            let mut outcome =
                write_category(&self.portal, destination_url, category, &plan, group_id).await;
            outcome.rejected = rejected;
            Ok::<_, anyhow::Error>(outcome)
        }
        .instrument(span)
        .await
    }

    async fn load_project(&self, item_id: &str) -> Result<ProjectDefinition> {
        let data = self
            .portal
            .item_data(item_id)
            .await
            .with_context(|| format!("reading project {item_id}"))?;
        Ok(ProjectDefinition::from_value(data))
    }

    async fn read_source(
        &self,
        project: &ProjectDefinition,
        category: Category,
    ) -> Result<Vec<Record>> {
        info!("Extracting {category} from source");
        let url = self.layer(project, category, &self.source_project_id)?;
        let records = self.query(&url, category).await?;
        Ok(self.options.apply_filter(category, records))
    }

    async fn query(&self, url: &str, category: Category) -> Result<Vec<Record>> {
        self.portal
            .query_all(url)
            .await
            .with_context(|| format!("querying {category} at {url}"))
    }

    fn layer(
        &self,
        project: &ProjectDefinition,
        category: Category,
        project_id: &str,
    ) -> Result<String, SyncError> {
        project
            .layer_url(category)
            .map(str::to_string)
            .ok_or_else(|| SyncError::MissingLayer {
                project: project_id.to_string(),
                category,
            })
    }

    fn tracks_enabled(&self, source: &ProjectDefinition, destination: &ProjectDefinition) -> bool {
        if !self.options.copy_tracks {
            return false;
        }
        let available = source.layer_url(Category::Track).is_some()
            && destination.layer_url(Category::Track).is_some();
        if !available {
            info!("tracks layer missing in one of the projects; tracks not copied");
        }
        available
    }
}

/// Authenticate against the organization and run one copy.
pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    let http = PortalHttp::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    info!("Authenticating...");
    let portal = ArcGisPortal::connect(http, &config.org_url, &config.username, &config.password)
        .await
        .context("authenticating")?;
    let pipeline = SyncPipeline::new(
        portal,
        config.source_project_id.clone(),
        config.destination_project_id.clone(),
        config.options.clone(),
    );
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wfsync_adapters::{MemoryLayer, MemoryPortal, MemoryPortalState};

    fn rec(value: JsonValue) -> Record {
        serde_json::from_value(json!({ "attributes": value })).expect("record")
    }

    fn user_ids(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| r.key_value(USER_ID_FIELD))
            .collect()
    }

    #[test]
    fn new_worker_is_added_unchanged() {
        let alice = rec(json!({ "userId": "alice", "OBJECTID": 1 }));
        let plan = reconcile(vec![alice.clone()], &[], USER_ID_FIELD);
        assert_eq!(plan.to_add, vec![alice]);
        assert!(plan.to_update.is_empty());
    }

    #[test]
    fn matched_worker_takes_destination_object_id() {
        let source = vec![rec(json!({ "userId": "bob", "OBJECTID": 2, "name": "Bob" }))];
        let destination = vec![rec(json!({ "userId": "bob", "OBJECTID": 9 }))];
        let plan = reconcile(source, &destination, USER_ID_FIELD);
        assert!(plan.to_add.is_empty());
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].object_id(), Some(9));
        assert_eq!(plan.to_update[0].key_value("name").as_deref(), Some("Bob"));
    }

    #[test]
    fn worker_update_leaves_destination_global_id_alone() {
        let source = vec![rec(json!({ "userId": "bob", "OBJECTID": 2, "GlobalID": "{W-BOB}" }))];
        let destination = vec![rec(json!({ "userId": "bob", "OBJECTID": 9, "GlobalID": "{W-BOB-DST}" }))];
        let plan = reconcile(source, &destination, USER_ID_FIELD);
        assert_eq!(plan.to_update[0].get(GLOBAL_ID_FIELD), None);

        let source = vec![rec(json!({ "GlobalID": "{G1}", "OBJECTID": 1 }))];
        let destination = vec![rec(json!({ "GlobalID": "{G1}", "OBJECTID": 40 }))];
        let plan = reconcile(source, &destination, GLOBAL_ID_FIELD);
        assert_eq!(plan.to_update[0].global_id().as_deref(), Some("{G1}"));
    }

    #[test]
    fn reconcile_partitions_every_source_record() {
        let source: Vec<Record> = (0..20)
            .map(|i| rec(json!({ "GlobalID": format!("{{G{i}}}"), "OBJECTID": i })))
            .chain([rec(json!({ "OBJECTID": 99 }))])
            .collect();
        let destination: Vec<Record> = (0..20)
            .filter(|i| i % 3 == 0)
            .map(|i| rec(json!({ "GlobalID": format!("{{G{i}}}"), "OBJECTID": 1000 + i })))
            .collect();
        let total = source.len();
        let plan = reconcile(source, &destination, GLOBAL_ID_FIELD);

        assert_eq!(plan.len(), total);
        assert_eq!(plan.to_update.len(), destination.len());
        let added: BTreeSet<_> = plan.to_add.iter().filter_map(Record::global_id).collect();
        let updated: BTreeSet<_> = plan.to_update.iter().filter_map(Record::global_id).collect();
        assert!(added.is_disjoint(&updated));
        for record in &plan.to_update {
            assert!(record.object_id().unwrap() >= 1000);
        }
        // Keyless records can never match.
        assert!(plan.to_add.iter().any(|r| r.object_id() == Some(99)));
    }

    #[test]
    fn first_destination_match_wins() {
        let source = vec![rec(json!({ "userId": "bob", "OBJECTID": 1 }))];
        let destination = vec![
            rec(json!({ "userId": "bob", "OBJECTID": 5 })),
            rec(json!({ "userId": "bob", "OBJECTID": 6 })),
        ];
        let plan = reconcile(source, &destination, USER_ID_FIELD);
        assert_eq!(plan.to_update[0].object_id(), Some(5));
    }

    #[test]
    fn reconciling_against_own_output_updates_everything() {
        let source = vec![
            rec(json!({ "GlobalID": "{A}", "OBJECTID": 1 })),
            rec(json!({ "GlobalID": "{B}", "OBJECTID": 2 })),
        ];
        let first = reconcile(source.clone(), &[], GLOBAL_ID_FIELD);
        let destination: Vec<Record> = first
            .to_add
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let mut copy = r.clone();
                copy.set_object_id(50 + i as i64);
                copy
            })
            .collect();
        let second = reconcile(source, &destination, GLOBAL_ID_FIELD);
        assert!(second.to_add.is_empty());
        assert_eq!(second.to_update.len(), 2);
    }

    #[test]
    fn remap_points_assignment_at_destination_worker() {
        let assignments = vec![rec(json!({ "GlobalID": "{G1}", "workerId": 1, "dispatcherId": null }))];
        let source_workers = vec![rec(json!({ "userId": "bob", "OBJECTID": 1 }))];
        let destination_workers = vec![rec(json!({ "userId": "bob", "OBJECTID": 9 }))];
        let remapped = remap(assignments, &source_workers, &destination_workers, &[], &[])
            .expect("remap");
        assert_eq!(remapped[0].reference(WORKER_ID_FIELD), Some(9));
        assert_eq!(remapped[0].get(DISPATCHER_ID_FIELD), Some(&JsonValue::Null));
    }

    #[test]
    fn remap_leaves_absent_references_absent() {
        let assignments = vec![rec(json!({ "GlobalID": "{G2}" }))];
        let remapped =
            remap_assignments(assignments, &IdentityMap::default(), &IdentityMap::default())
                .expect("remap");
        assert_eq!(remapped[0].get(WORKER_ID_FIELD), None);
        assert_eq!(remapped[0].get(DISPATCHER_ID_FIELD), None);
    }

    #[test]
    fn unresolved_reference_is_fatal() {
        let assignments = vec![rec(json!({ "GlobalID": "{G9}", "dispatcherId": 4 }))];
        let err = remap_assignments(assignments, &IdentityMap::default(), &IdentityMap::default())
            .expect_err("orphaned dispatcher");
        match err {
            SyncError::UnresolvedReference {
                field,
                assignment,
                source_id,
            } => {
                assert_eq!(field, DISPATCHER_ID_FIELD);
                assert_eq!(assignment, "{G9}");
                assert_eq!(source_id, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_integer_reference_is_fatal() {
        let mut workers = IdentityMap::default();
        workers.entries.insert(1, 9);
        for value in [json!("abc"), json!(2.5), json!(true)] {
            let assignments = vec![rec(json!({ "GlobalID": "{G}", "workerId": value.clone() }))];
            let err = remap_assignments(assignments, &workers, &IdentityMap::default())
                .expect_err("non-integer worker reference");
            match err {
                SyncError::InvalidReference {
                    field,
                    assignment,
                    value: shown,
                } => {
                    assert_eq!(field, WORKER_ID_FIELD);
                    assert_eq!(assignment, "{G}");
                    assert_eq!(shown, value.to_string());
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        // Integral values in other encodings still map.
        let assignments = vec![rec(json!({ "GlobalID": "{G}", "workerId": "1" }))];
        let remapped = remap_assignments(assignments, &workers, &IdentityMap::default())
            .expect("string id");
        assert_eq!(remapped[0].reference(WORKER_ID_FIELD), Some(9));
    }

    #[test]
    fn identity_map_skips_unmatched_and_keyless_records() {
        let source = vec![
            rec(json!({ "userId": "alice", "OBJECTID": 1 })),
            rec(json!({ "userId": "carol", "OBJECTID": 3 })),
            rec(json!({ "OBJECTID": 4 })),
        ];
        let destination = vec![rec(json!({ "userId": "alice", "OBJECTID": 11 }))];
        let map = IdentityMap::build(&source, &destination, USER_ID_FIELD);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(1), Some(11));
        assert_eq!(map.get(3), None);
    }

    fn directory(users: &[&str]) -> MemoryPortal {
        let mut state = MemoryPortalState::default();
        state.users = users.iter().map(|u| u.to_string()).collect();
        MemoryPortal::new(state)
    }

    #[tokio::test]
    async fn unknown_user_is_dropped_from_both_sets() {
        let portal = directory(&["alice"]);
        let source = vec![
            rec(json!({ "userId": "alice", "OBJECTID": 1 })),
            rec(json!({ "userId": "carol", "OBJECTID": 2 })),
            rec(json!({ "OBJECTID": 3 })),
        ];
        let kept = gate_known_users(&portal, Category::Worker, source)
            .await
            .expect("gate");
        assert_eq!(user_ids(&kept), vec!["alice".to_string()]);

        let plan = reconcile(kept, &[], USER_ID_FIELD);
        assert!(!user_ids(&plan.to_add).contains(&"carol".to_string()));
        assert!(!user_ids(&plan.to_update).contains(&"carol".to_string()));
    }

    const LAYER: &str = "https://svc/rest/services/dst/FeatureServer/2";

    fn writer_portal(records: Vec<Record>, read_only: bool) -> MemoryPortal {
        let mut state = MemoryPortalState::default();
        state.layers.insert(
            LAYER.to_string(),
            MemoryLayer {
                records,
                read_only,
                ..MemoryLayer::default()
            },
        );
        state.users = ["alice", "bob"].iter().map(|u| u.to_string()).collect();
        state.groups.insert("grp".to_string(), BTreeSet::new());
        MemoryPortal::new(state)
    }

    #[tokio::test]
    async fn writer_applies_updates_before_adds_and_joins_group() {
        let portal = writer_portal(vec![rec(json!({ "userId": "bob", "OBJECTID": 9 }))], false);
        let plan = ReconcilePlan {
            to_add: vec![rec(json!({ "userId": "alice", "OBJECTID": 1 }))],
            to_update: vec![rec(json!({ "userId": "bob", "OBJECTID": 9, "name": "Bob" }))],
        };
        let outcome = write_category(&portal, LAYER, Category::Worker, &plan, Some("grp")).await;
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.group_added, 2);

        let calls = portal.calls().await;
        assert_eq!(
            calls,
            vec![
                format!("updates {LAYER} 1"),
                format!("adds {LAYER} 1"),
                "addUsers grp 2".to_string(),
            ]
        );
        let snapshot = portal.snapshot().await;
        let members = &snapshot.groups["grp"];
        assert!(members.contains("alice") && members.contains("bob"));
    }

    #[tokio::test]
    async fn writer_is_a_no_op_for_empty_plans() {
        let portal = writer_portal(vec![], false);
        let outcome =
            write_category(&portal, LAYER, Category::Worker, &ReconcilePlan::default(), Some("grp"))
                .await;
        assert_eq!(outcome, CategoryOutcome::new(Category::Worker));
        assert!(portal.calls().await.is_empty());
    }

    #[tokio::test]
    async fn writer_reports_rejected_edits_without_group_changes() {
        let portal = writer_portal(vec![], true);
        let plan = ReconcilePlan {
            to_add: vec![rec(json!({ "userId": "alice" }))],
            to_update: vec![],
        };
        let outcome = write_category(&portal, LAYER, Category::Worker, &plan, Some("grp")).await;
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.group_added, 0);
        assert!(!portal.calls().await.iter().any(|c| c.starts_with("addUsers")));
    }

    #[tokio::test]
    async fn writer_keeps_inserted_records_when_group_add_fails() {
        // No "grp" group exists, so membership fails after the insert.
        let mut state = MemoryPortalState::default();
        state.layers.insert(LAYER.to_string(), MemoryLayer::default());
        state.users.insert("alice".to_string());
        let portal = MemoryPortal::new(state);
        let plan = ReconcilePlan {
            to_add: vec![rec(json!({ "userId": "alice" }))],
            to_update: vec![],
        };
        let outcome = write_category(&portal, LAYER, Category::Worker, &plan, Some("grp")).await;
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.group_not_added, vec!["alice".to_string()]);
        assert_eq!(portal.records(LAYER).await.len(), 1);
    }

    #[test]
    fn layer_urls_normalize_scheme_case_and_slash() {
        assert_eq!(
            normalize_layer_url("http://Host/arcgis/rest/services/P/FeatureServer/0/"),
            normalize_layer_url("https://host/arcgis/rest/services/P/FeatureServer/0")
        );
        assert_eq!(normalize_layer_url("//host/x/"), "//host/x");
    }

    #[test]
    fn web_map_rewrite_touches_only_matching_layers() {
        let replacements = vec![
            (
                "https://h/rest/services/src/FeatureServer/0".to_string(),
                "https://h/rest/services/dst/FeatureServer/0".to_string(),
            ),
            (
                "https://h/rest/services/src/FeatureServer".to_string(),
                "https://h/rest/services/dst/FeatureServer".to_string(),
            ),
        ];
        let mut map = json!({
            "operationalLayers": [
                { "url": "http://h/rest/services/src/FeatureServer/0/" },
                { "url": "https://other/rest/services/src/FeatureServer/0" },
                { "layers": [{ "url": "https://h/rest/services/src/FeatureServer" }] },
                { "id": "no-url" }
            ],
            "tables": [{ "url": "https://h/rest/services/src/FeatureServer/0" }]
        });
        assert_eq!(rewrite_web_map_urls(&mut map, &replacements), 3);
        assert_eq!(
            map["operationalLayers"][0]["url"],
            json!("https://h/rest/services/dst/FeatureServer/0")
        );
        assert_eq!(
            map["operationalLayers"][1]["url"],
            json!("https://other/rest/services/src/FeatureServer/0")
        );
        assert_eq!(
            map["operationalLayers"][2]["layers"][0]["url"],
            json!("https://h/rest/services/dst/FeatureServer")
        );
    }

    #[test]
    fn replacements_include_service_roots_once() {
        let source = ProjectDefinition::from_value(json!({
            "workers": { "url": "https://h/rest/services/src/FeatureServer/2" },
            "assignments": { "url": "https://h/rest/services/src/FeatureServer/0" }
        }));
        let destination = ProjectDefinition::from_value(json!({
            "workers": { "url": "https://h/rest/services/dst/FeatureServer/2" },
            "assignments": { "url": "https://h/rest/services/dst/FeatureServer/0" }
        }));
        let pairs = layer_url_replacements(&source, &destination);
        assert_eq!(pairs.len(), 3);
        assert!(pairs.contains(&(
            "https://h/rest/services/src/FeatureServer".to_string(),
            "https://h/rest/services/dst/FeatureServer".to_string()
        )));
    }

    #[tokio::test]
    async fn sync_options_load_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sync.yaml");
        std::fs::write(
            &path,
            "copy_tracks: false\nfield_filters:\n  workers: [name, status]\n",
        )
        .expect("write");
        let options = SyncOptions::load(&path).await.expect("load");
        assert!(!options.copy_tracks);
        assert!(options.copy_web_maps);
        assert!(!options.field_filters[&Category::Worker].is_empty());

        let filtered = options.apply_filter(
            Category::Worker,
            vec![rec(json!({ "userId": "a", "name": "A", "notes": "x" }))],
        );
        assert_eq!(filtered[0].get("notes"), None);
        assert!(filtered[0].get("name").is_some());
    }

    #[test]
    fn log_file_is_written_at_the_given_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("run.log");
        let guard = init_logging(&LoggingConfig::new(&path)).expect("init logging");
        info!("log file check");
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("log file at configured path");
        assert!(text.contains("log file check"));
        let entries: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|e| e.ok().map(|e| e.file_name()))
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("run.log")]);
    }

    #[test]
    fn config_debug_hides_password() {
        let config = SyncConfig::new("https://org", "admin", "hunter2", "s", "d");
        let text = format!("{config:?}");
        assert!(!text.contains("hunter2"));
        assert!(text.contains("admin"));
    }
}
