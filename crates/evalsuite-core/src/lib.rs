//! Suite configuration versioning and step-pipeline execution.
//!
//! A *suite* is a named evaluation workflow bound to a dataset. Its
//! configuration (one workflow document plus the step scripts it
//! references) lives in a blob store under a `production` namespace,
//! with numbered immutable snapshots under `draft/<version>`. The
//! pipeline drives a sample row through
//! `load_data → preprocessing → invocation → postprocessing → evaluation`,
//! resolving each step's script to a named entry point.
//!
//! Persistence lives behind two traits: [`BlobVersionStore`] for the
//! configuration files and [`SuiteLedger`] for the per-suite version
//! counters and the evaluation-existence check that drives the freeze
//! policy. `evalsuite-store-fs` and `evalsuite-store-sqlite` provide the
//! production implementations; [`MemoryBlobStore`] backs tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// Canonical filename of the workflow document inside a namespace.
pub const WORKFLOW_TEMPLATE_FILENAME: &str = "workflow-template.json";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SuiteId(pub Ulid);

impl SuiteId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`SuiteError::Validation`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, SuiteError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| SuiteError::Validation(format!("invalid suite id '{value}': {err}")))
    }
}

impl Default for SuiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SuiteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub Ulid);

impl DatasetId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`SuiteError::Validation`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, SuiteError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| SuiteError::Validation(format!("invalid dataset id '{value}': {err}")))
    }
}

impl Default for DatasetId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DatasetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvalId(pub Ulid);

impl EvalId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`SuiteError::Validation`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, SuiteError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| SuiteError::Validation(format!("invalid eval id '{value}': {err}")))
    }
}

impl Default for EvalId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EvalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A path component that could not be applied to the data it addressed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FieldAccessError {
    #[error("field '{0}' not found")]
    MissingKey(String),
    #[error("index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("cannot access '{component}' on {found}")]
    WrongType {
        component: String,
        found: &'static str,
    },
}

/// Script loading, binding, and execution failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script load error: {0}")]
    Load(String),
    #[error("entry point '{0}' not defined by script")]
    EntryPointNotFound(String),
    #[error("script runtime error in '{entry_point}': {kind}: {message}")]
    Runtime {
        entry_point: String,
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SuiteError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration frozen: {0}")]
    Frozen(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    FieldAccess(#[from] FieldAccessError),
}

/// Error raised inside a script callable, carrying the original kind
/// and message so [`ScriptError::Runtime`] can wrap both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub kind: String,
    pub message: String,
}

impl CallError {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl Display for CallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<FieldAccessError> for CallError {
    fn from(err: FieldAccessError) -> Self {
        Self::new("FieldAccessError", err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Step names and the workflow document
// ---------------------------------------------------------------------------

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    LoadData,
    Preprocessing,
    Invocation,
    Postprocessing,
    Evaluation,
}

impl StepName {
    /// The four steps carrying a configurable entry in the workflow
    /// document; `load_data` is synthesized by the pipeline.
    pub const CONFIGURABLE: [Self; 4] = [
        Self::Preprocessing,
        Self::Invocation,
        Self::Postprocessing,
        Self::Evaluation,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadData => "load_data",
            Self::Preprocessing => "preprocessing",
            Self::Invocation => "invocation",
            Self::Postprocessing => "postprocessing",
            Self::Evaluation => "evaluation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "load_data" => Some(Self::LoadData),
            "preprocessing" => Some(Self::Preprocessing),
            "invocation" => Some(Self::Invocation),
            "postprocessing" => Some(Self::Postprocessing),
            "evaluation" => Some(Self::Evaluation),
            _ => None,
        }
    }

    /// The callable a step script must define to satisfy this step.
    #[must_use]
    pub fn entry_point(self) -> Option<&'static str> {
        match self {
            Self::LoadData => None,
            Self::Preprocessing => Some("preprocess_data"),
            Self::Invocation => Some("request_invocation"),
            Self::Postprocessing => Some("postprocess_data"),
            Self::Evaluation => Some("evaluate_data"),
        }
    }
}

impl Display for StepName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configurable step entry of the workflow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSteps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<StepConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<StepConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postprocessing: Option<StepConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<StepConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: WorkflowSteps,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The suite's workflow definition, stored as
/// [`WORKFLOW_TEMPLATE_FILENAME`] in the blob store. Known step kinds
/// are typed; unrecognized fields survive round-trips through the
/// flattened `extra` bags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub workflow: Workflow,
}

impl WorkflowDocument {
    /// # Errors
    /// Returns [`SuiteError::Validation`] when the bytes are not a valid
    /// workflow document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SuiteError> {
        serde_json::from_slice(bytes)
            .map_err(|err| SuiteError::Validation(format!("invalid workflow document: {err}")))
    }

    /// # Errors
    /// Returns [`SuiteError::Validation`] when serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SuiteError> {
        serde_json::to_vec_pretty(self)
            .map_err(|err| SuiteError::Validation(format!("unserializable workflow document: {err}")))
    }

    #[must_use]
    pub fn step(&self, name: StepName) -> Option<&StepConfig> {
        match name {
            StepName::LoadData => None,
            StepName::Preprocessing => self.workflow.steps.preprocessing.as_ref(),
            StepName::Invocation => self.workflow.steps.invocation.as_ref(),
            StepName::Postprocessing => self.workflow.steps.postprocessing.as_ref(),
            StepName::Evaluation => self.workflow.steps.evaluation.as_ref(),
        }
    }

    /// Replaces the named step's sub-object wholesale. `load_data` has
    /// no entry and is ignored; callers validate step names upfront.
    pub fn set_step(&mut self, name: StepName, config: StepConfig) {
        match name {
            StepName::LoadData => {}
            StepName::Preprocessing => self.workflow.steps.preprocessing = Some(config),
            StepName::Invocation => self.workflow.steps.invocation = Some(config),
            StepName::Postprocessing => self.workflow.steps.postprocessing = Some(config),
            StepName::Evaluation => self.workflow.steps.evaluation = Some(config),
        }
    }
}

// ---------------------------------------------------------------------------
// Builtin templates
// ---------------------------------------------------------------------------

/// A configuration file materialized into `production` when a suite is
/// initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateFile {
    pub filename: &'static str,
    pub body: &'static str,
}

/// The builtin template set: the workflow document plus the four step
/// script manifests it references.
#[must_use]
pub fn builtin_templates() -> Vec<TemplateFile> {
    vec![
        TemplateFile {
            filename: WORKFLOW_TEMPLATE_FILENAME,
            body: include_str!("../templates/workflow-template.json"),
        },
        TemplateFile {
            filename: "preprocessing-script.json",
            body: include_str!("../templates/preprocessing-script.json"),
        },
        TemplateFile {
            filename: "invocation-script.json",
            body: include_str!("../templates/invocation-script.json"),
        },
        TemplateFile {
            filename: "postprocessing-script.json",
            body: include_str!("../templates/postprocessing-script.json"),
        },
        TemplateFile {
            filename: "evaluation-script.json",
            body: include_str!("../templates/evaluation-script.json"),
        },
    ]
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// A logical namespace inside a suite's configuration prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// The live, currently-executing configuration.
    Production,
    /// An immutable numbered snapshot.
    Draft(u32),
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => f.write_str("production"),
            Self::Draft(version) => write!(f, "draft/{version}"),
        }
    }
}

impl Namespace {
    /// Slash-terminated object-key prefix for this namespace:
    /// `{suite_id}/configs/{namespace}/`.
    #[must_use]
    pub fn key_prefix(&self, suite: &SuiteId) -> String {
        format!("{suite}/configs/{self}/")
    }
}

/// Key-prefix copy/list/get/put over a content-addressed-by-path object
/// store. No business logic; per-suite namespaces only.
pub trait BlobVersionStore {
    /// # Errors
    /// [`SuiteError::NotFound`] when the object is absent, distinct from
    /// [`SuiteError::Storage`] for I/O failures.
    fn get(&self, suite: &SuiteId, namespace: Namespace, filename: &str)
        -> Result<Vec<u8>, SuiteError>;

    /// # Errors
    /// [`SuiteError::Storage`] on write failure.
    fn put(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), SuiteError>;

    /// Filenames under the namespace; an absent prefix lists empty.
    ///
    /// # Errors
    /// [`SuiteError::Storage`] on enumeration failure.
    fn list(&self, suite: &SuiteId, namespace: Namespace) -> Result<BTreeSet<String>, SuiteError>;

    /// Copies every object under `from` to the matching key under `to`.
    /// Copying is not atomic across files: failed files are reported
    /// `false`, already-copied files stay copied.
    ///
    /// # Errors
    /// [`SuiteError::Storage`] only when the source cannot be listed.
    fn copy_tree(
        &self,
        suite: &SuiteId,
        from: Namespace,
        to: Namespace,
    ) -> Result<BTreeMap<String, bool>, SuiteError> {
        let mut results = BTreeMap::new();
        for filename in self.list(suite, from)? {
            let copied = self
                .get(suite, from, &filename)
                .and_then(|bytes| self.put(suite, to, &filename, &bytes));
            results.insert(filename, copied.is_ok());
        }
        Ok(results)
    }
}

impl<T: BlobVersionStore + ?Sized> BlobVersionStore for &T {
    fn get(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
    ) -> Result<Vec<u8>, SuiteError> {
        (**self).get(suite, namespace, filename)
    }

    fn put(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), SuiteError> {
        (**self).put(suite, namespace, filename, bytes)
    }

    fn list(&self, suite: &SuiteId, namespace: Namespace) -> Result<BTreeSet<String>, SuiteError> {
        (**self).list(suite, namespace)
    }

    fn copy_tree(
        &self,
        suite: &SuiteId,
        from: Namespace,
        to: Namespace,
    ) -> Result<BTreeMap<String, bool>, SuiteError> {
        (**self).copy_tree(suite, from, to)
    }
}

/// In-memory [`BlobVersionStore`] used by tests and examples.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>, SuiteError> {
        self.objects
            .read()
            .map_err(|_| SuiteError::Storage("blob store lock poisoned".to_string()))
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>, SuiteError> {
        self.objects
            .write()
            .map_err(|_| SuiteError::Storage("blob store lock poisoned".to_string()))
    }

    fn validate_filename(filename: &str) -> Result<(), SuiteError> {
        if filename.is_empty() || filename.contains('/') {
            return Err(SuiteError::Validation(format!(
                "invalid config filename '{filename}'"
            )));
        }
        Ok(())
    }
}

impl BlobVersionStore for MemoryBlobStore {
    fn get(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
    ) -> Result<Vec<u8>, SuiteError> {
        Self::validate_filename(filename)?;
        let key = format!("{}{filename}", namespace.key_prefix(suite));
        self.read_guard()?.get(&key).cloned().ok_or_else(|| {
            SuiteError::NotFound(format!(
                "no config file '{filename}' under {namespace} for suite {suite}"
            ))
        })
    }

    fn put(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), SuiteError> {
        Self::validate_filename(filename)?;
        let key = format!("{}{filename}", namespace.key_prefix(suite));
        self.write_guard()?.insert(key, bytes.to_vec());
        Ok(())
    }

    fn list(&self, suite: &SuiteId, namespace: Namespace) -> Result<BTreeSet<String>, SuiteError> {
        let prefix = namespace.key_prefix(suite);
        Ok(self
            .read_guard()?
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(ToString::to_string)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Ledger and collaborators
// ---------------------------------------------------------------------------

/// The per-suite version counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPair {
    /// The version a rollback last pointed production to.
    pub current: u32,
    /// The highest version ever created.
    pub latest: u32,
}

/// Metadata-store collaborator: suite records, the two version counters,
/// the dataset binding, and the evaluation-existence check behind the
/// freeze policy.
pub trait SuiteLedger {
    /// # Errors
    /// [`SuiteError::Storage`] on lookup failure.
    fn suite_exists(&self, suite: &SuiteId) -> Result<bool, SuiteError>;

    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent.
    fn dataset_id(&self, suite: &SuiteId) -> Result<Option<DatasetId>, SuiteError>;

    /// # Errors
    /// [`SuiteError::Storage`] on lookup failure.
    fn has_evaluations(&self, suite: &SuiteId) -> Result<bool, SuiteError>;

    /// Atomically increments and returns `latest_config_version`.
    /// Race-free per suite: two concurrent callers never observe the
    /// same value.
    ///
    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent.
    fn increment_latest(&self, suite: &SuiteId) -> Result<u32, SuiteError>;

    /// # Errors
    /// [`SuiteError::Validation`] when `version` exceeds
    /// `latest_config_version`; [`SuiteError::NotFound`] when the suite
    /// is absent.
    fn set_current(&self, suite: &SuiteId, version: u32) -> Result<(), SuiteError>;

    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent.
    fn get_versions(&self, suite: &SuiteId) -> Result<VersionPair, SuiteError>;

    /// Pins both counters to 0 at first materialization. Explicitly not
    /// an increment: version 0 is the initialization snapshot.
    ///
    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent.
    fn pin_initial(&self, suite: &SuiteId) -> Result<(), SuiteError>;
}

impl<T: SuiteLedger + ?Sized> SuiteLedger for &T {
    fn suite_exists(&self, suite: &SuiteId) -> Result<bool, SuiteError> {
        (**self).suite_exists(suite)
    }

    fn dataset_id(&self, suite: &SuiteId) -> Result<Option<DatasetId>, SuiteError> {
        (**self).dataset_id(suite)
    }

    fn has_evaluations(&self, suite: &SuiteId) -> Result<bool, SuiteError> {
        (**self).has_evaluations(suite)
    }

    fn increment_latest(&self, suite: &SuiteId) -> Result<u32, SuiteError> {
        (**self).increment_latest(suite)
    }

    fn set_current(&self, suite: &SuiteId, version: u32) -> Result<(), SuiteError> {
        (**self).set_current(suite, version)
    }

    fn get_versions(&self, suite: &SuiteId) -> Result<VersionPair, SuiteError> {
        (**self).get_versions(suite)
    }

    fn pin_initial(&self, suite: &SuiteId) -> Result<(), SuiteError> {
        (**self).pin_initial(suite)
    }
}

/// Dataset-preview collaborator consumed by `load_data`.
pub trait DatasetPreview {
    /// Returns up to `limit` sample rows.
    ///
    /// # Errors
    /// [`SuiteError::NotFound`] when the dataset is absent.
    fn preview(&self, dataset: &DatasetId, limit: usize)
        -> Result<Vec<Map<String, Value>>, SuiteError>;
}

impl<T: DatasetPreview + ?Sized> DatasetPreview for &T {
    fn preview(
        &self,
        dataset: &DatasetId,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>, SuiteError> {
        (**self).preview(dataset, limit)
    }
}

/// Outbound transport for the invocation step. The single
/// network-capable callable goes through this seam, so tests substitute
/// a stub and scripts never gain ambient network access.
pub trait InvocationClient: Send + Sync {
    /// # Errors
    /// Any transport or decode failure; the caller wraps it into a
    /// [`ScriptError::Runtime`].
    fn send(&self, method: &str, url: &str, body: &Value) -> Result<Value, SuiteError>;
}

/// Synchronous HTTP [`InvocationClient`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpInvocationClient;

impl InvocationClient for HttpInvocationClient {
    fn send(&self, method: &str, url: &str, body: &Value) -> Result<Value, SuiteError> {
        let response = ureq::request(method, url)
            .send_json(body.clone())
            .map_err(|err| SuiteError::Storage(format!("invocation request failed: {err}")))?;
        response
            .into_json::<Value>()
            .map_err(|err| SuiteError::Storage(format!("invalid invocation response: {err}")))
    }
}

// ---------------------------------------------------------------------------
// Field resolution
// ---------------------------------------------------------------------------

/// One applied component of a data-addressing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
    Key(String),
    Index(usize),
}

fn index_component(raw: &str) -> Option<usize> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Tokenizes a dotted/bracket path string such as `messages.[0].text`.
/// `[n]` is a standalone array-index token, an all-digit component is an
/// index too, and empty tokens (consecutive dots) are skipped.
#[must_use]
pub fn parse_path(path: &str) -> Vec<PathToken> {
    path.split('.')
        .filter(|token| !token.is_empty())
        .map(|token| {
            let inner = token
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .unwrap_or(token);
            index_component(inner)
                .map_or_else(|| PathToken::Key(token.to_string()), PathToken::Index)
        })
        .collect()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Applies tokens left to right: keys index objects, indices index
/// arrays.
///
/// # Errors
/// Returns a [`FieldAccessError`] naming the failing component.
pub fn resolve_path<'a>(
    value: &'a Value,
    tokens: &[PathToken],
) -> Result<&'a Value, FieldAccessError> {
    let mut current = value;
    for token in tokens {
        current = match token {
            PathToken::Key(key) => match current {
                Value::Object(map) => map
                    .get(key)
                    .ok_or_else(|| FieldAccessError::MissingKey(key.clone()))?,
                other => {
                    return Err(FieldAccessError::WrongType {
                        component: key.clone(),
                        found: json_type_name(other),
                    })
                }
            },
            PathToken::Index(index) => match current {
                Value::Array(items) => {
                    items.get(*index).ok_or(FieldAccessError::IndexOutOfRange {
                        index: *index,
                        len: items.len(),
                    })?
                }
                other => {
                    return Err(FieldAccessError::WrongType {
                        component: index.to_string(),
                        found: json_type_name(other),
                    })
                }
            },
        };
    }
    Ok(current)
}

/// Resolves a component-array path: a component that is entirely digits
/// is applied as a list index, otherwise as a mapping key.
///
/// # Errors
/// Returns a [`FieldAccessError`] naming the failing component.
pub fn resolve_components<'a>(
    value: &'a Value,
    components: &[String],
) -> Result<&'a Value, FieldAccessError> {
    let tokens: Vec<PathToken> = components
        .iter()
        .map(|component| {
            index_component(component)
                .map_or_else(|| PathToken::Key(component.clone()), PathToken::Index)
        })
        .collect();
    resolve_path(value, &tokens)
}

fn placeholder_name(value: &str) -> Option<&str> {
    value.strip_prefix("@[").and_then(|rest| rest.strip_suffix(']'))
}

fn lookup_placeholder<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    payload
        .get("input")
        .and_then(|input| input.get(name))
        .or_else(|| payload.get(name))
}

/// `@[name]` substitution: any entry value that is exactly `@[name]` is
/// replaced by `payload.input[name]` if present, else `payload[name]`.
/// Unmatched placeholders pass through literally.
#[must_use]
pub fn substitute_placeholders(
    payload: &Value,
    entries: &Map<String, Value>,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for (key, value) in entries {
        let replacement = value
            .as_str()
            .and_then(placeholder_name)
            .and_then(|name| lookup_placeholder(payload, name))
            .cloned();
        resolved.insert(key.clone(), replacement.unwrap_or_else(|| value.clone()));
    }
    resolved
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// A scoring function comparing an extracted output against the
/// groundtruth. The statistical/ML implementations themselves are out of
/// scope; deployments register their own.
pub type MetricFn = Arc<dyn Fn(&str, &str) -> Result<f64, CallError> + Send + Sync>;

/// Named metric functions available to the evaluation step.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, MetricFn>,
}

impl MetricRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `exact_match`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            "exact_match",
            Arc::new(|output, groundtruth| Ok(if output == groundtruth { 1.0 } else { 0.0 })),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, metric: MetricFn) {
        self.metrics.insert(name.into(), metric);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricFn> {
        self.metrics.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Script execution
// ---------------------------------------------------------------------------

/// A callable a script manifest may bind an entry point to. Callables
/// only see their kwargs; the registry is the execution allow-list.
pub trait ScriptFn: Send + Sync {
    /// # Errors
    /// A [`CallError`] carrying the original error kind and message.
    fn call(&self, kwargs: &Map<String, Value>) -> Result<Value, CallError>;
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptManifest {
    exports: BTreeMap<String, ExportSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExportSpec {
    Name(String),
    Detailed {
        function: String,
        #[serde(default)]
        defaults: Map<String, Value>,
    },
}

impl ExportSpec {
    fn function(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { function, .. } => function,
        }
    }

    fn defaults(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Name(_) => None,
            Self::Detailed { defaults, .. } => Some(defaults),
        }
    }
}

/// Loads a script body, binds the requested entry point against the
/// function registry, and invokes it.
///
/// A script body is a JSON manifest mapping entry-point names to
/// registered functions, optionally with captured defaults:
///
/// ```json
/// {"exports": {"preprocess_data": {"function": "select_columns"}}}
/// ```
#[derive(Default)]
pub struct ScriptExecutor {
    functions: BTreeMap<String, Arc<dyn ScriptFn>>,
}

impl ScriptExecutor {
    /// Executor with an empty registry; every script load will fail to
    /// bind until functions are registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor with the builtin step functions: `select_columns`,
    /// `http_request`, `select_field`, `score_metrics`.
    #[must_use]
    pub fn with_builtins(invoker: Arc<dyn InvocationClient>, metrics: MetricRegistry) -> Self {
        let mut executor = Self::new();
        executor.register("select_columns", Arc::new(SelectColumnsFn));
        executor.register("http_request", Arc::new(HttpRequestFn { client: invoker }));
        executor.register("select_field", Arc::new(SelectFieldFn));
        executor.register("score_metrics", Arc::new(ScoreMetricsFn { metrics }));
        executor
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn ScriptFn>) {
        self.functions.insert(name.into(), function);
    }

    /// # Errors
    /// [`ScriptError::Load`] when the body fails to parse or binds to an
    /// unregistered function; [`ScriptError::EntryPointNotFound`] when
    /// the script does not define `entry_point`;
    /// [`ScriptError::Runtime`] wrapping any failure raised by the
    /// callable.
    pub fn run(
        &self,
        script_body: &str,
        entry_point: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<Value, ScriptError> {
        let manifest: ScriptManifest = serde_json::from_str(script_body)
            .map_err(|err| ScriptError::Load(format!("invalid script manifest: {err}")))?;
        let export = manifest
            .exports
            .get(entry_point)
            .ok_or_else(|| ScriptError::EntryPointNotFound(entry_point.to_string()))?;
        let function = self.functions.get(export.function()).ok_or_else(|| {
            ScriptError::Load(format!(
                "script binds '{entry_point}' to unknown function '{}'",
                export.function()
            ))
        })?;

        let merged = match export.defaults() {
            None => kwargs.clone(),
            Some(defaults) => {
                let mut merged = defaults.clone();
                for (key, value) in kwargs {
                    merged.insert(key.clone(), value.clone());
                }
                merged
            }
        };

        function.call(&merged).map_err(|err| ScriptError::Runtime {
            entry_point: entry_point.to_string(),
            kind: err.kind,
            message: err.message,
        })
    }
}

struct SelectColumnsFn;

impl ScriptFn for SelectColumnsFn {
    fn call(&self, kwargs: &Map<String, Value>) -> Result<Value, CallError> {
        let data = kwargs
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| CallError::new("TypeError", "preprocess_data requires an object 'data' argument"))?;

        let mut input_columns = Vec::new();
        if let Some(configured) = kwargs.get("input_columns") {
            let items = configured.as_array().ok_or_else(|| {
                CallError::new("TypeError", "input_columns must be an array of column names")
            })?;
            for item in items {
                let column = item.as_str().ok_or_else(|| {
                    CallError::new("TypeError", "input_columns entries must be strings")
                })?;
                input_columns.push(column.to_string());
            }
        }
        let groundtruth_column = kwargs
            .get("groundtruth_column")
            .and_then(Value::as_str)
            .unwrap_or("");

        for column in &input_columns {
            if !data.contains_key(column) {
                return Err(CallError::new(
                    "ValueError",
                    format!("input column '{column}' is not present in the data"),
                ));
            }
        }

        let groundtruth = if groundtruth_column.is_empty() {
            Value::String(String::new())
        } else {
            data.get(groundtruth_column).cloned().ok_or_else(|| {
                CallError::new(
                    "ValueError",
                    format!("groundtruth column '{groundtruth_column}' is not present in the data"),
                )
            })?
        };

        let mut input = Map::new();
        for (column, value) in data {
            if input_columns.iter().any(|wanted| wanted == column) {
                input.insert(column.clone(), value.clone());
            }
        }

        let mut output = Map::new();
        output.insert("input".to_string(), Value::Object(input));
        output.insert("groundtruth".to_string(), groundtruth);
        Ok(Value::Object(output))
    }
}

struct HttpRequestFn {
    client: Arc<dyn InvocationClient>,
}

impl ScriptFn for HttpRequestFn {
    fn call(&self, kwargs: &Map<String, Value>) -> Result<Value, CallError> {
        let data = kwargs.get("data").cloned().unwrap_or(Value::Null);
        let url = kwargs
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| CallError::new("ValueError", "request_invocation requires a 'url' argument"))?;
        let method = kwargs
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST");

        let body_entries = kwargs
            .get("input_type")
            .and_then(|input_type| input_type.get("body"))
            .and_then(|body| body.get("json"))
            .and_then(Value::as_array);

        let payload = match body_entries {
            Some(items) => {
                let mut entries = Map::new();
                for item in items {
                    if item.get("enabled").and_then(Value::as_bool) == Some(false) {
                        continue;
                    }
                    let key = item.get("key").and_then(Value::as_str).ok_or_else(|| {
                        CallError::new("ValueError", "request body entries require a string 'key'")
                    })?;
                    let value = item.get("value").cloned().unwrap_or(Value::Null);
                    entries.insert(key.to_string(), value);
                }
                Value::Object(substitute_placeholders(&data, &entries))
            }
            // No body mapping configured: forward data.input, else data.
            None => data.get("input").cloned().unwrap_or_else(|| data.clone()),
        };

        let response = self
            .client
            .send(method, url, &payload)
            .map_err(|err| CallError::new("InvocationError", err.to_string()))?;

        let mut output = Map::new();
        output.insert("response".to_string(), response);
        Ok(Value::Object(output))
    }
}

struct SelectFieldFn;

impl ScriptFn for SelectFieldFn {
    fn call(&self, kwargs: &Map<String, Value>) -> Result<Value, CallError> {
        let data = kwargs.get("data").cloned().unwrap_or(Value::Null);
        let field = kwargs
            .get("field")
            .ok_or_else(|| CallError::new("ValueError", "postprocess_data requires a 'field' argument"))?;

        let selected = match field {
            Value::String(path) => resolve_path(&data, &parse_path(path)),
            Value::Array(items) => {
                let mut components = Vec::new();
                for item in items {
                    let component = item.as_str().ok_or_else(|| {
                        CallError::new("TypeError", "field components must be strings")
                    })?;
                    components.push(component.to_string());
                }
                resolve_components(&data, &components)
            }
            other => {
                return Err(CallError::new(
                    "TypeError",
                    format!(
                        "field must be a path string or an array of components, got {}",
                        json_type_name(other)
                    ),
                ))
            }
        }
        .map_err(CallError::from)?;

        let mut output = Map::new();
        output.insert("output".to_string(), selected.clone());
        Ok(Value::Object(output))
    }
}

struct ScoreMetricsFn {
    metrics: MetricRegistry,
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl ScriptFn for ScoreMetricsFn {
    fn call(&self, kwargs: &Map<String, Value>) -> Result<Value, CallError> {
        let results = kwargs.get("results").cloned().unwrap_or(Value::Null);
        let output = resolve_path(&results, &parse_path("postprocessing.output"))
            .map_err(CallError::from)?;
        let groundtruth = resolve_path(&results, &parse_path("preprocessing.groundtruth"))
            .map_err(CallError::from)?;
        let output = value_as_text(output);
        let groundtruth = value_as_text(groundtruth);

        let mut scores = Map::new();
        if let Some(requested) = kwargs.get("metrics") {
            let names = requested.as_array().ok_or_else(|| {
                CallError::new("TypeError", "metrics must be an array of metric names")
            })?;
            for name in names {
                let name = name
                    .as_str()
                    .ok_or_else(|| CallError::new("TypeError", "metric names must be strings"))?;
                let metric = self
                    .metrics
                    .get(name)
                    .ok_or_else(|| CallError::new("ValueError", format!("unknown metric '{name}'")))?;
                let score = metric(&output, &groundtruth)?;
                scores.insert(name.to_string(), Value::from(score));
            }
        }
        Ok(Value::Object(scores))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered, append-only step-name → raw-output mapping accumulated as
/// the pipeline advances.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineRunResult {
    steps: Map<String, Value>,
}

impl PipelineRunResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`SuiteError::Validation`] when the step was already
    /// recorded; completed step outputs are never mutated.
    pub fn record(&mut self, step: StepName, output: Value) -> Result<(), SuiteError> {
        if self.steps.contains_key(step.as_str()) {
            return Err(SuiteError::Validation(format!(
                "step '{step}' already recorded"
            )));
        }
        self.steps.insert(step.as_str().to_string(), output);
        Ok(())
    }

    #[must_use]
    pub fn output(&self, step: StepName) -> Option<&Value> {
        self.steps.get(step.as_str())
    }

    #[must_use]
    pub fn last_output(&self) -> Option<&Value> {
        self.steps.values().last()
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.steps
    }

    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.steps
    }
}

/// Reads a suite's workflow document out of `production`.
///
/// # Errors
/// [`SuiteError::NotFound`] when the suite has no configuration yet
/// (distinct from storage outages).
pub fn load_workflow_document<S: BlobVersionStore>(
    store: &S,
    suite: &SuiteId,
) -> Result<WorkflowDocument, SuiteError> {
    let bytes = store
        .get(suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME)
        .map_err(|err| match err {
            SuiteError::NotFound(_) => {
                SuiteError::NotFound(format!("suite {suite} has no configuration"))
            }
            other => other,
        })?;
    WorkflowDocument::from_bytes(&bytes)
}

/// Executes the five-stage workflow for one sample row.
pub struct StepPipeline<S, D> {
    store: S,
    datasets: D,
    executor: ScriptExecutor,
}

impl<S: BlobVersionStore, D: DatasetPreview> StepPipeline<S, D> {
    pub fn new(store: S, datasets: D, executor: ScriptExecutor) -> Self {
        Self {
            store,
            datasets,
            executor,
        }
    }

    /// Runs `load_data → preprocessing → invocation → postprocessing →
    /// evaluation`, threading each step's output into the next step's
    /// input. A failing step aborts the run; downstream steps do not
    /// execute.
    ///
    /// # Errors
    /// Any [`SuiteError`] raised while loading configuration, fetching
    /// the sample row, or executing a step script.
    pub fn run(&self, suite: &SuiteId, dataset: &DatasetId) -> Result<PipelineRunResult, SuiteError> {
        let document = load_workflow_document(&self.store, suite)?;
        let mut results = PipelineRunResult::new();

        let rows = self.datasets.preview(dataset, 1)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SuiteError::NotFound(format!("dataset {dataset} has no rows")))?;
        results.record(StepName::LoadData, Value::Object(row))?;
        tracing::debug!(%suite, step = %StepName::LoadData, "step finished");

        for step in StepName::CONFIGURABLE {
            let output = self.run_step(suite, &document, step, &results)?;
            results.record(step, output)?;
            tracing::debug!(%suite, step = %step, "step finished");
        }

        Ok(results)
    }

    fn run_step(
        &self,
        suite: &SuiteId,
        document: &WorkflowDocument,
        step: StepName,
        results: &PipelineRunResult,
    ) -> Result<Value, SuiteError> {
        let config = document.step(step);
        let previous = results
            .last_output()
            .cloned()
            .ok_or_else(|| SuiteError::Validation("pipeline has no load_data output".to_string()))?;

        // Identity fallback: a step without a script passes the previous
        // output through unchanged.
        let Some(script_name) = config.and_then(|config| config.script.as_deref()) else {
            return Ok(previous);
        };

        let body_bytes = self.store.get(suite, Namespace::Production, script_name)?;
        let body = String::from_utf8(body_bytes).map_err(|err| {
            SuiteError::Script(ScriptError::Load(format!(
                "script '{script_name}' is not valid UTF-8: {err}"
            )))
        })?;

        let entry_point = step.entry_point().ok_or_else(|| {
            SuiteError::Validation(format!("step '{step}' has no entry point"))
        })?;

        let kwargs = Self::step_kwargs(step, config, &previous, results);
        let output = self.executor.run(&body, entry_point, &kwargs)?;
        Ok(output)
    }

    fn step_kwargs(
        step: StepName,
        config: Option<&StepConfig>,
        previous: &Value,
        results: &PipelineRunResult,
    ) -> Map<String, Value> {
        let mut kwargs = Map::new();
        match step {
            StepName::LoadData => {}
            StepName::Preprocessing | StepName::Invocation => {
                kwargs.insert("data".to_string(), previous.clone());
            }
            StepName::Postprocessing => {
                // The invocation step's output carries the server reply
                // under `response`; an identity invocation step does not.
                let data = previous
                    .get("response")
                    .cloned()
                    .unwrap_or_else(|| previous.clone());
                kwargs.insert("data".to_string(), data);
            }
            StepName::Evaluation => {
                kwargs.insert("results".to_string(), Value::Object(results.as_map().clone()));
            }
        }
        if let Some(config) = config {
            for (key, value) in &config.input {
                kwargs.insert(key.clone(), value.clone());
            }
        }
        kwargs
    }
}

// ---------------------------------------------------------------------------
// Suite configuration service
// ---------------------------------------------------------------------------

/// Outcome of a save-as-version: the reserved version number and the
/// per-file copy results. The number stays reserved even when copies
/// fail; callers detect incomplete snapshots from the file map and
/// retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedVersion {
    pub version: u32,
    pub files: BTreeMap<String, bool>,
}

/// Orchestrates the blob store and the ledger: initialization,
/// save-as-version, rollback, and the freeze policy gating full vs.
/// partial configuration edits.
pub struct SuiteConfigService<S, L> {
    store: S,
    ledger: L,
}

impl<S: BlobVersionStore, L: SuiteLedger> SuiteConfigService<S, L> {
    pub fn new(store: S, ledger: L) -> Self {
        Self { store, ledger }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    fn ensure_suite(&self, suite: &SuiteId) -> Result<(), SuiteError> {
        if self.ledger.suite_exists(suite)? {
            Ok(())
        } else {
            Err(SuiteError::NotFound(format!("suite {suite} does not exist")))
        }
    }

    fn ensure_configured(&self, suite: &SuiteId) -> Result<(), SuiteError> {
        let files = self.store.list(suite, Namespace::Production)?;
        if files.contains(WORKFLOW_TEMPLATE_FILENAME) {
            Ok(())
        } else {
            Err(SuiteError::NotFound(format!(
                "suite {suite} has no configuration"
            )))
        }
    }

    /// First workflow materialization: copies the builtin templates into
    /// `production`, snapshots `production → draft/0`, and pins the
    /// ledger counters to 0. Template files already present are skipped,
    /// and an already-configured suite is left untouched, so the
    /// `UNCONFIGURED → CONFIGURED` transition happens exactly once.
    ///
    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent;
    /// [`SuiteError::Storage`] on store failures.
    pub fn initialize(&self, suite: &SuiteId) -> Result<BTreeMap<String, bool>, SuiteError> {
        self.ensure_suite(suite)?;

        let existing = self.store.list(suite, Namespace::Production)?;
        let configured = existing.contains(WORKFLOW_TEMPLATE_FILENAME);

        let mut uploaded = BTreeMap::new();
        for template in builtin_templates() {
            if existing.contains(template.filename) {
                uploaded.insert(template.filename.to_string(), true);
                continue;
            }
            let stored = self
                .store
                .put(suite, Namespace::Production, template.filename, template.body.as_bytes());
            uploaded.insert(template.filename.to_string(), stored.is_ok());
        }

        if !configured {
            self.store.copy_tree(suite, Namespace::Production, Namespace::Draft(0))?;
            self.ledger.pin_initial(suite)?;
            tracing::info!(%suite, "suite configuration initialized at version 0");
        }

        Ok(uploaded)
    }

    /// Reserves the next version number and snapshots `production` into
    /// `draft/<version>`. The counter, once incremented, is never rolled
    /// back even if every file copy fails.
    ///
    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent or has no
    /// configuration; [`SuiteError::Storage`] when the source tree
    /// cannot be listed.
    pub fn save_as_version(&self, suite: &SuiteId) -> Result<SavedVersion, SuiteError> {
        self.ensure_suite(suite)?;
        self.ensure_configured(suite)?;

        let version = self.ledger.increment_latest(suite)?;
        let files = self
            .store
            .copy_tree(suite, Namespace::Production, Namespace::Draft(version))?;
        tracing::info!(%suite, version, "saved configuration version");
        Ok(SavedVersion { version, files })
    }

    /// Copies `draft/<version>` back over `production` and repoints the
    /// rollback pointer.
    ///
    /// # Errors
    /// [`SuiteError::Validation`] when `version` exceeds the latest;
    /// [`SuiteError::NotFound`] when the suite is absent or has no
    /// configuration.
    pub fn rollback_to_version(
        &self,
        suite: &SuiteId,
        version: u32,
    ) -> Result<BTreeMap<String, bool>, SuiteError> {
        self.ensure_suite(suite)?;
        self.ensure_configured(suite)?;

        let versions = self.ledger.get_versions(suite)?;
        if version > versions.latest {
            return Err(SuiteError::Validation(format!(
                "version {version} outside [0, {}]",
                versions.latest
            )));
        }

        let files = self
            .store
            .copy_tree(suite, Namespace::Draft(version), Namespace::Production)?;
        self.ledger.set_current(suite, version)?;
        tracing::info!(%suite, version, "rolled back configuration");
        Ok(files)
    }

    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent or has no
    /// configuration.
    pub fn get_workflow_document(&self, suite: &SuiteId) -> Result<WorkflowDocument, SuiteError> {
        self.ensure_suite(suite)?;
        load_workflow_document(&self.store, suite)
    }

    /// # Errors
    /// [`SuiteError::NotFound`] when the suite or the file is absent.
    pub fn get_config_file(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
    ) -> Result<Vec<u8>, SuiteError> {
        self.ensure_suite(suite)?;
        self.store.get(suite, namespace, filename)
    }

    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent.
    pub fn list_config_files(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
    ) -> Result<BTreeSet<String>, SuiteError> {
        self.ensure_suite(suite)?;
        self.store.list(suite, namespace)
    }

    /// # Errors
    /// [`SuiteError::NotFound`] when the suite is absent.
    pub fn versions(&self, suite: &SuiteId) -> Result<VersionPair, SuiteError> {
        self.ensure_suite(suite)?;
        self.ledger.get_versions(suite)
    }

    /// Replaces the workflow document wholesale, then saves a new
    /// version. Rejected while the suite has recorded evaluations.
    ///
    /// # Errors
    /// [`SuiteError::Frozen`] when evaluations exist;
    /// [`SuiteError::NotFound`] when the suite is absent or has no
    /// configuration.
    pub fn update_configuration(
        &self,
        suite: &SuiteId,
        document: &WorkflowDocument,
    ) -> Result<SavedVersion, SuiteError> {
        self.ensure_suite(suite)?;
        self.ensure_configured(suite)?;

        if self.ledger.has_evaluations(suite)? {
            return Err(SuiteError::Frozen(format!(
                "suite {suite} has recorded evaluations; full configuration updates are not allowed"
            )));
        }

        let bytes = document.to_bytes()?;
        self.store
            .put(suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME, &bytes)?;
        self.save_as_version(suite)
    }

    /// Merges the provided step sections into the current document (each
    /// named step's sub-object is replaced wholesale, not field-merged),
    /// then saves a new version. Once the suite has evaluations only the
    /// `invocation` section may be supplied: re-pointing the invocation
    /// target does not invalidate prior evaluation semantics, while the
    /// other step definitions must not change underneath recorded
    /// results.
    ///
    /// # Errors
    /// [`SuiteError::Validation`] for an empty patch or unknown section
    /// names; [`SuiteError::Frozen`] for a non-invocation section while
    /// evaluations exist; [`SuiteError::NotFound`] when the suite is
    /// absent or has no configuration.
    pub fn patch_configuration(
        &self,
        suite: &SuiteId,
        sections: &BTreeMap<String, StepConfig>,
    ) -> Result<SavedVersion, SuiteError> {
        self.ensure_suite(suite)?;
        self.ensure_configured(suite)?;

        if sections.is_empty() {
            return Err(SuiteError::Validation(
                "patch must supply at least one step section".to_string(),
            ));
        }

        let mut parsed = Vec::new();
        for (name, config) in sections {
            let step = StepName::parse(name).ok_or_else(|| {
                SuiteError::Validation(format!("unknown step section '{name}'"))
            })?;
            if step == StepName::LoadData {
                return Err(SuiteError::Validation(
                    "load_data has no configurable step entry".to_string(),
                ));
            }
            parsed.push((step, config));
        }

        if self.ledger.has_evaluations(suite)?
            && parsed.iter().any(|(step, _)| *step != StepName::Invocation)
        {
            return Err(SuiteError::Frozen(format!(
                "suite {suite} has recorded evaluations; only the invocation section may change"
            )));
        }

        let mut document = load_workflow_document(&self.store, suite)?;
        for (step, config) in parsed {
            document.set_step(step, config.clone());
        }

        let bytes = document.to_bytes()?;
        self.store
            .put(suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME, &bytes)?;
        self.save_as_version(suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::sync::Mutex;

    fn must_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("unexpected None"),
        }
    }

    fn must_object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[derive(Debug)]
    struct LedgerRow {
        dataset: Option<DatasetId>,
        has_evals: bool,
        current: u32,
        latest: u32,
    }

    #[derive(Debug, Default)]
    struct StubLedger {
        rows: RefCell<BTreeMap<SuiteId, LedgerRow>>,
    }

    impl StubLedger {
        fn with_suite(suite: SuiteId) -> Self {
            let ledger = Self::default();
            ledger.rows.borrow_mut().insert(
                suite,
                LedgerRow {
                    dataset: Some(DatasetId::new()),
                    has_evals: false,
                    current: 0,
                    latest: 0,
                },
            );
            ledger
        }

        fn freeze(&self, suite: &SuiteId) {
            if let Some(row) = self.rows.borrow_mut().get_mut(suite) {
                row.has_evals = true;
            }
        }
    }

    impl SuiteLedger for StubLedger {
        fn suite_exists(&self, suite: &SuiteId) -> Result<bool, SuiteError> {
            Ok(self.rows.borrow().contains_key(suite))
        }

        fn dataset_id(&self, suite: &SuiteId) -> Result<Option<DatasetId>, SuiteError> {
            self.rows
                .borrow()
                .get(suite)
                .map(|row| row.dataset)
                .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))
        }

        fn has_evaluations(&self, suite: &SuiteId) -> Result<bool, SuiteError> {
            Ok(self.rows.borrow().get(suite).is_some_and(|row| row.has_evals))
        }

        fn increment_latest(&self, suite: &SuiteId) -> Result<u32, SuiteError> {
            let mut rows = self.rows.borrow_mut();
            let row = rows
                .get_mut(suite)
                .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))?;
            row.latest += 1;
            Ok(row.latest)
        }

        fn set_current(&self, suite: &SuiteId, version: u32) -> Result<(), SuiteError> {
            let mut rows = self.rows.borrow_mut();
            let row = rows
                .get_mut(suite)
                .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))?;
            if version > row.latest {
                return Err(SuiteError::Validation(format!(
                    "version {version} outside [0, {}]",
                    row.latest
                )));
            }
            row.current = version;
            Ok(())
        }

        fn get_versions(&self, suite: &SuiteId) -> Result<VersionPair, SuiteError> {
            self.rows
                .borrow()
                .get(suite)
                .map(|row| VersionPair {
                    current: row.current,
                    latest: row.latest,
                })
                .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))
        }

        fn pin_initial(&self, suite: &SuiteId) -> Result<(), SuiteError> {
            let mut rows = self.rows.borrow_mut();
            let row = rows
                .get_mut(suite)
                .ok_or_else(|| SuiteError::NotFound(format!("suite {suite} does not exist")))?;
            row.current = 0;
            row.latest = 0;
            Ok(())
        }
    }

    struct StubInvoker {
        response: Value,
        calls: Mutex<Vec<(String, String, Value)>>,
    }

    impl StubInvoker {
        fn returning(response: Value) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn recorded(&self) -> Vec<(String, String, Value)> {
            match self.calls.lock() {
                Ok(calls) => calls.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }
    }

    impl InvocationClient for StubInvoker {
        fn send(&self, method: &str, url: &str, body: &Value) -> Result<Value, SuiteError> {
            match self.calls.lock() {
                Ok(mut calls) => calls.push((method.to_string(), url.to_string(), body.clone())),
                Err(poisoned) => {
                    poisoned
                        .into_inner()
                        .push((method.to_string(), url.to_string(), body.clone()));
                }
            }
            Ok(self.response.clone())
        }
    }

    struct FlakyStore {
        inner: MemoryBlobStore,
        fail_puts: std::cell::Cell<bool>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryBlobStore::new(),
                fail_puts: std::cell::Cell::new(false),
            }
        }
    }

    impl BlobVersionStore for FlakyStore {
        fn get(
            &self,
            suite: &SuiteId,
            namespace: Namespace,
            filename: &str,
        ) -> Result<Vec<u8>, SuiteError> {
            self.inner.get(suite, namespace, filename)
        }

        fn put(
            &self,
            suite: &SuiteId,
            namespace: Namespace,
            filename: &str,
            bytes: &[u8],
        ) -> Result<(), SuiteError> {
            if self.fail_puts.get() {
                return Err(SuiteError::Storage("disk full".to_string()));
            }
            self.inner.put(suite, namespace, filename, bytes)
        }

        fn list(
            &self,
            suite: &SuiteId,
            namespace: Namespace,
        ) -> Result<BTreeSet<String>, SuiteError> {
            self.inner.list(suite, namespace)
        }
    }

    struct StubPreview {
        rows: Vec<Map<String, Value>>,
    }

    impl DatasetPreview for StubPreview {
        fn preview(
            &self,
            _dataset: &DatasetId,
            limit: usize,
        ) -> Result<Vec<Map<String, Value>>, SuiteError> {
            Ok(self.rows.iter().take(limit).cloned().collect())
        }
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        must_object(value)
    }

    // --- field resolution ---

    #[test]
    fn dotted_path_with_bracket_index() {
        let data = json!({"messages": [{"text": "hi"}]});
        let found = must_ok(resolve_path(&data, &parse_path("messages.[0].text")));
        assert_eq!(found, &json!("hi"));
    }

    #[test]
    fn bare_digit_component_indexes_arrays() {
        let data = json!({"items": ["a", "b"]});
        let found = must_ok(resolve_path(&data, &parse_path("items.1")));
        assert_eq!(found, &json!("b"));
    }

    #[test]
    fn consecutive_dots_are_skipped() {
        let data = json!({"a": {"b": 1}});
        let found = must_ok(resolve_path(&data, &parse_path("a..b")));
        assert_eq!(found, &json!(1));
    }

    #[test]
    fn index_out_of_range_reports_length() {
        let data = json!(["a", "b"]);
        let err = resolve_path(&data, &parse_path("[5]"));
        assert_eq!(err, Err(FieldAccessError::IndexOutOfRange { index: 5, len: 2 }));
    }

    #[test]
    fn missing_key_and_wrong_type() {
        let data = json!({"a": "text"});
        assert_eq!(
            resolve_path(&data, &parse_path("b")),
            Err(FieldAccessError::MissingKey("b".to_string()))
        );
        assert_eq!(
            resolve_path(&data, &parse_path("a.inner")),
            Err(FieldAccessError::WrongType {
                component: "inner".to_string(),
                found: "string",
            })
        );
    }

    #[test]
    fn component_array_treats_digit_strings_as_indices() {
        let data = json!({"rows": [{"v": 7}]});
        let components = vec!["rows".to_string(), "0".to_string(), "v".to_string()];
        let found = must_ok(resolve_components(&data, &components));
        assert_eq!(found, &json!(7));
    }

    #[test]
    fn placeholders_prefer_input_then_top_level() {
        let payload = json!({"input": {"email": "a@b.com"}, "name": "suite"});
        let entries = kwargs(json!({
            "email": "@[email]",
            "name": "@[name]",
            "missing": "@[nope]",
            "plain": "literal",
        }));
        let resolved = substitute_placeholders(&payload, &entries);
        assert_eq!(resolved.get("email"), Some(&json!("a@b.com")));
        assert_eq!(resolved.get("name"), Some(&json!("suite")));
        assert_eq!(resolved.get("missing"), Some(&json!("@[nope]")));
        assert_eq!(resolved.get("plain"), Some(&json!("literal")));
    }

    // --- script execution ---

    struct EchoFn;

    impl ScriptFn for EchoFn {
        fn call(&self, kwargs: &Map<String, Value>) -> Result<Value, CallError> {
            Ok(Value::Object(kwargs.clone()))
        }
    }

    #[test]
    fn unparseable_script_is_a_load_error() {
        let executor = ScriptExecutor::new();
        let err = executor.run("not json", "preprocess_data", &Map::new());
        assert!(matches!(err, Err(ScriptError::Load(_))));
    }

    #[test]
    fn missing_export_is_entry_point_not_found() {
        let executor = ScriptExecutor::new();
        let body = r#"{"exports": {"other": "echo"}}"#;
        let err = executor.run(body, "preprocess_data", &Map::new());
        assert_eq!(
            err,
            Err(ScriptError::EntryPointNotFound("preprocess_data".to_string()))
        );
    }

    #[test]
    fn binding_to_unregistered_function_is_a_load_error() {
        let executor = ScriptExecutor::new();
        let body = r#"{"exports": {"run": "nope"}}"#;
        let err = executor.run(body, "run", &Map::new());
        assert!(matches!(err, Err(ScriptError::Load(_))));
    }

    #[test]
    fn defaults_merge_under_kwargs() {
        let mut executor = ScriptExecutor::new();
        executor.register("echo", Arc::new(EchoFn));
        let body = r#"{"exports": {"run": {"function": "echo", "defaults": {"a": 1, "b": 2}}}}"#;
        let output = must_ok(executor.run(body, "run", &kwargs(json!({"b": 3}))));
        assert_eq!(output, json!({"a": 1, "b": 3}));
    }

    #[test]
    fn callable_failure_becomes_runtime_error() {
        let invoker = StubInvoker::returning(json!({}));
        let executor = ScriptExecutor::with_builtins(invoker, MetricRegistry::with_builtins());
        let body = r#"{"exports": {"postprocess_data": "select_field"}}"#;
        let err = executor.run(
            body,
            "postprocess_data",
            &kwargs(json!({"data": {"other": 1}, "field": "message"})),
        );
        match err {
            Err(ScriptError::Runtime { entry_point, kind, .. }) => {
                assert_eq!(entry_point, "postprocess_data");
                assert_eq!(kind, "FieldAccessError");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn select_columns_splits_input_and_groundtruth() {
        let output = must_ok(SelectColumnsFn.call(&kwargs(json!({
            "data": {"q": "2+2?", "a": "4", "noise": true},
            "input_columns": ["q"],
            "groundtruth_column": "a",
        }))));
        assert_eq!(output, json!({"input": {"q": "2+2?"}, "groundtruth": "4"}));
    }

    #[test]
    fn select_columns_rejects_missing_input_column() {
        let err = SelectColumnsFn.call(&kwargs(json!({
            "data": {"q": "2+2?"},
            "input_columns": ["missing"],
        })));
        match err {
            Err(call) => assert_eq!(call.kind, "ValueError"),
            Ok(other) => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn select_columns_empty_groundtruth_column_yields_empty_string() {
        let output = must_ok(SelectColumnsFn.call(&kwargs(json!({
            "data": {"q": "2+2?"},
            "input_columns": ["q"],
            "groundtruth_column": "",
        }))));
        assert_eq!(must_some(output.get("groundtruth")), &json!(""));
    }

    #[test]
    fn http_request_substitutes_body_placeholders_and_skips_disabled() {
        let invoker = StubInvoker::returning(json!({"message": "pong"}));
        let function = HttpRequestFn {
            client: Arc::clone(&invoker) as Arc<dyn InvocationClient>,
        };
        let output = must_ok(function.call(&kwargs(json!({
            "data": {"input": {"q": "ping"}},
            "url": "http://eval.test/run",
            "method": "POST",
            "input_type": {"body": {"json": [
                {"key": "question", "value": "@[q]", "enabled": true},
                {"key": "debug", "value": true, "enabled": false},
            ]}},
        }))));
        assert_eq!(output, json!({"response": {"message": "pong"}}));
        let calls = invoker.recorded();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "POST");
        assert_eq!(calls[0].1, "http://eval.test/run");
        assert_eq!(calls[0].2, json!({"question": "ping"}));
    }

    #[test]
    fn http_request_without_body_mapping_forwards_input() {
        let invoker = StubInvoker::returning(json!({}));
        let function = HttpRequestFn {
            client: Arc::clone(&invoker) as Arc<dyn InvocationClient>,
        };
        must_ok(function.call(&kwargs(json!({
            "data": {"input": {"q": "ping"}, "groundtruth": "pong"},
            "url": "http://eval.test/run",
        }))));
        assert_eq!(invoker.recorded()[0].2, json!({"q": "ping"}));
    }

    #[test]
    fn score_metrics_reads_step_outputs() {
        let function = ScoreMetricsFn {
            metrics: MetricRegistry::with_builtins(),
        };
        let output = must_ok(function.call(&kwargs(json!({
            "results": {
                "preprocessing": {"groundtruth": "4"},
                "postprocessing": {"output": "4"},
            },
            "metrics": ["exact_match"],
        }))));
        assert_eq!(output, json!({"exact_match": 1.0}));
    }

    #[test]
    fn score_metrics_rejects_unknown_metric() {
        let function = ScoreMetricsFn {
            metrics: MetricRegistry::with_builtins(),
        };
        let err = function.call(&kwargs(json!({
            "results": {
                "preprocessing": {"groundtruth": "4"},
                "postprocessing": {"output": "4"},
            },
            "metrics": ["bleu"],
        })));
        match err {
            Err(call) => assert_eq!(call.kind, "ValueError"),
            Ok(other) => panic!("expected error, got {other:?}"),
        }
    }

    // --- blob store ---

    #[test]
    fn memory_store_rejects_nested_filenames() {
        let store = MemoryBlobStore::new();
        let suite = SuiteId::new();
        let err = store.put(&suite, Namespace::Production, "a/b.json", b"{}");
        assert!(matches!(err, Err(SuiteError::Validation(_))));
    }

    #[test]
    fn memory_store_get_missing_is_not_found() {
        let store = MemoryBlobStore::new();
        let suite = SuiteId::new();
        let err = store.get(&suite, Namespace::Production, "missing.json");
        assert!(matches!(err, Err(SuiteError::NotFound(_))));
    }

    #[test]
    fn copy_tree_reports_every_file() {
        let store = MemoryBlobStore::new();
        let suite = SuiteId::new();
        must_ok(store.put(&suite, Namespace::Production, "a.json", b"1"));
        must_ok(store.put(&suite, Namespace::Production, "b.json", b"2"));
        let copied = must_ok(store.copy_tree(&suite, Namespace::Production, Namespace::Draft(3)));
        assert_eq!(copied.len(), 2);
        assert!(copied.values().all(|ok| *ok));
        assert_eq!(
            must_ok(store.get(&suite, Namespace::Draft(3), "b.json")),
            b"2".to_vec()
        );
    }

    // --- pipeline run results ---

    #[test]
    fn run_result_rejects_duplicate_steps() {
        let mut results = PipelineRunResult::new();
        must_ok(results.record(StepName::LoadData, json!({})));
        let err = results.record(StepName::LoadData, json!({}));
        assert!(matches!(err, Err(SuiteError::Validation(_))));
    }

    // --- configuration service ---

    fn configured_service(
        suite: SuiteId,
    ) -> (MemoryBlobStore, StubLedger) {
        let store = MemoryBlobStore::new();
        let ledger = StubLedger::with_suite(suite);
        let service = SuiteConfigService::new(&store, &ledger);
        must_ok(service.initialize(&suite));
        (store, ledger)
    }

    #[test]
    fn initialize_materializes_templates_and_pins_version_zero() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let production = must_ok(service.list_config_files(&suite, Namespace::Production));
        assert_eq!(production.len(), builtin_templates().len());
        assert!(production.contains(WORKFLOW_TEMPLATE_FILENAME));

        let snapshot = must_ok(service.list_config_files(&suite, Namespace::Draft(0)));
        assert_eq!(snapshot, production);

        let versions = must_ok(service.versions(&suite));
        assert_eq!(versions, VersionPair { current: 0, latest: 0 });
    }

    #[test]
    fn initialize_is_idempotent_and_preserves_edits() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        must_ok(service.save_as_version(&suite));
        must_ok(store.put(&suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME, b"{\"workflow\": {}}"));

        let uploaded = must_ok(service.initialize(&suite));
        assert!(uploaded.values().all(|ok| *ok));
        assert_eq!(
            must_ok(store.get(&suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME)),
            b"{\"workflow\": {}}".to_vec()
        );
        let versions = must_ok(service.versions(&suite));
        assert_eq!(versions.latest, 1);
    }

    #[test]
    fn initialize_unknown_suite_is_not_found() {
        let store = MemoryBlobStore::new();
        let ledger = StubLedger::default();
        let service = SuiteConfigService::new(&store, &ledger);
        let err = service.initialize(&SuiteId::new());
        assert!(matches!(err, Err(SuiteError::NotFound(_))));
    }

    #[test]
    fn save_as_version_numbers_are_dense() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let first = must_ok(service.save_as_version(&suite));
        let second = must_ok(service.save_as_version(&suite));
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(second.files.values().all(|ok| *ok));

        let versions = must_ok(service.versions(&suite));
        assert_eq!(versions, VersionPair { current: 0, latest: 2 });
    }

    #[test]
    fn save_on_unconfigured_suite_is_not_found() {
        let suite = SuiteId::new();
        let store = MemoryBlobStore::new();
        let ledger = StubLedger::with_suite(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let err = service.save_as_version(&suite);
        assert!(matches!(err, Err(SuiteError::NotFound(_))));
    }

    #[test]
    fn failed_copies_never_roll_back_the_version_counter() {
        let suite = SuiteId::new();
        let store = FlakyStore::new();
        let ledger = StubLedger::with_suite(suite);
        let service = SuiteConfigService::new(&store, &ledger);
        must_ok(service.initialize(&suite));

        store.fail_puts.set(true);
        let saved = must_ok(service.save_as_version(&suite));
        assert_eq!(saved.version, 1);
        assert!(!saved.files.is_empty());
        assert!(saved.files.values().all(|ok| !*ok));
        let missing = store.get(&suite, Namespace::Draft(1), WORKFLOW_TEMPLATE_FILENAME);
        assert!(matches!(missing, Err(SuiteError::NotFound(_))));

        // The reserved number stays consumed: the retry gets the next one.
        store.fail_puts.set(false);
        let retried = must_ok(service.save_as_version(&suite));
        assert_eq!(retried.version, 2);
        assert!(retried.files.values().all(|ok| *ok));
        assert_eq!(
            must_ok(ledger.get_versions(&suite)),
            VersionPair { current: 0, latest: 2 }
        );
    }

    #[test]
    fn rollback_restores_snapshot_bytes_and_moves_current() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);
        let original =
            must_ok(store.get(&suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME));

        let mut document = must_ok(service.get_workflow_document(&suite));
        document.workflow.description = "edited".to_string();
        let saved = must_ok(service.update_configuration(&suite, &document));
        assert_eq!(saved.version, 1);
        assert_ne!(
            must_ok(store.get(&suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME)),
            original
        );

        must_ok(service.rollback_to_version(&suite, 0));
        assert_eq!(
            must_ok(store.get(&suite, Namespace::Production, WORKFLOW_TEMPLATE_FILENAME)),
            original
        );
        let versions = must_ok(service.versions(&suite));
        assert_eq!(versions, VersionPair { current: 0, latest: 1 });
    }

    #[test]
    fn rollback_beyond_latest_is_rejected() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);
        let err = service.rollback_to_version(&suite, 3);
        assert!(matches!(err, Err(SuiteError::Validation(_))));
    }

    #[test]
    fn full_update_is_frozen_once_evaluations_exist() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);
        ledger.freeze(&suite);

        let document = must_ok(service.get_workflow_document(&suite));
        let err = service.update_configuration(&suite, &document);
        assert!(matches!(err, Err(SuiteError::Frozen(_))));
    }

    #[test]
    fn patch_validates_sections() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let err = service.patch_configuration(&suite, &BTreeMap::new());
        assert!(matches!(err, Err(SuiteError::Validation(_))));

        let mut bogus = BTreeMap::new();
        bogus.insert("bogus".to_string(), StepConfig::default());
        let err = service.patch_configuration(&suite, &bogus);
        assert!(matches!(err, Err(SuiteError::Validation(_))));

        let mut load_data = BTreeMap::new();
        load_data.insert("load_data".to_string(), StepConfig::default());
        let err = service.patch_configuration(&suite, &load_data);
        assert!(matches!(err, Err(SuiteError::Validation(_))));
    }

    #[test]
    fn frozen_patch_allows_only_invocation() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);
        ledger.freeze(&suite);

        let mut preprocessing = BTreeMap::new();
        preprocessing.insert("preprocessing".to_string(), StepConfig::default());
        let err = service.patch_configuration(&suite, &preprocessing);
        assert!(matches!(err, Err(SuiteError::Frozen(_))));

        let mut invocation = BTreeMap::new();
        invocation.insert(
            "invocation".to_string(),
            StepConfig {
                script: Some("invocation-script.json".to_string()),
                input: kwargs(json!({"url": "http://other.test/run"})),
                ..StepConfig::default()
            },
        );
        let saved = must_ok(service.patch_configuration(&suite, &invocation));
        assert_eq!(saved.version, 1);

        let document = must_ok(service.get_workflow_document(&suite));
        let step = must_some(document.step(StepName::Invocation)).clone();
        assert_eq!(step.input.get("url"), Some(&json!("http://other.test/run")));
    }

    #[test]
    fn patch_replaces_step_sections_wholesale() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let mut sections = BTreeMap::new();
        sections.insert(
            "postprocessing".to_string(),
            StepConfig {
                input: kwargs(json!({"field": "answer"})),
                ..StepConfig::default()
            },
        );
        must_ok(service.patch_configuration(&suite, &sections));

        let document = must_ok(service.get_workflow_document(&suite));
        let step = must_some(document.step(StepName::Postprocessing)).clone();
        // The old script binding is gone: sections replace, not merge.
        assert_eq!(step.script, None);
        assert_eq!(step.input.get("field"), Some(&json!("answer")));
    }

    // --- end-to-end pipeline ---

    #[test]
    fn pipeline_runs_all_five_steps() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let mut document = must_ok(service.get_workflow_document(&suite));
        if let Some(step) = document.workflow.steps.preprocessing.as_mut() {
            step.input = kwargs(json!({"input_columns": ["q"], "groundtruth_column": "a"}));
        }
        if let Some(step) = document.workflow.steps.invocation.as_mut() {
            step.input = kwargs(json!({
                "url": "http://eval.test/run",
                "method": "POST",
                "input_type": {"body": {"json": [
                    {"key": "question", "value": "@[q]", "enabled": true},
                ]}},
            }));
        }
        must_ok(service.update_configuration(&suite, &document));

        let invoker = StubInvoker::returning(json!({"message": "4"}));
        let executor = ScriptExecutor::with_builtins(
            Arc::clone(&invoker) as Arc<dyn InvocationClient>,
            MetricRegistry::with_builtins(),
        );
        let preview = StubPreview {
            rows: vec![kwargs(json!({"q": "2+2?", "a": "4"}))],
        };
        let pipeline = StepPipeline::new(&store, &preview, executor);

        let results = must_ok(pipeline.run(&suite, &DatasetId::new()));
        assert_eq!(
            must_some(results.output(StepName::LoadData)),
            &json!({"q": "2+2?", "a": "4"})
        );
        assert_eq!(
            must_some(results.output(StepName::Preprocessing)),
            &json!({"input": {"q": "2+2?"}, "groundtruth": "4"})
        );
        assert_eq!(
            must_some(results.output(StepName::Invocation)),
            &json!({"response": {"message": "4"}})
        );
        assert_eq!(
            must_some(results.output(StepName::Postprocessing)),
            &json!({"output": "4"})
        );
        assert_eq!(
            must_some(results.output(StepName::Evaluation)),
            &json!({"exact_match": 1.0})
        );
        assert_eq!(invoker.recorded()[0].2, json!({"question": "2+2?"}));
    }

    #[test]
    fn failing_step_aborts_downstream_steps() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let mut document = must_ok(service.get_workflow_document(&suite));
        if let Some(step) = document.workflow.steps.preprocessing.as_mut() {
            step.input = kwargs(json!({"input_columns": ["q"], "groundtruth_column": "a"}));
        }
        if let Some(step) = document.workflow.steps.invocation.as_mut() {
            step.input = kwargs(json!({"url": "http://eval.test/run"}));
        }
        if let Some(step) = document.workflow.steps.postprocessing.as_mut() {
            // The stub reply carries "message", not "answer".
            step.input = kwargs(json!({"field": "answer"}));
        }
        must_ok(service.update_configuration(&suite, &document));

        let invoker = StubInvoker::returning(json!({"message": "4"}));
        let evaluated = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&evaluated);
        let mut metrics = MetricRegistry::new();
        metrics.register(
            "exact_match",
            Arc::new(move |_, _| {
                seen.store(true, Ordering::SeqCst);
                Ok(1.0)
            }),
        );
        let executor = ScriptExecutor::with_builtins(
            Arc::clone(&invoker) as Arc<dyn InvocationClient>,
            metrics,
        );
        let preview = StubPreview {
            rows: vec![kwargs(json!({"q": "2+2?", "a": "4"}))],
        };
        let pipeline = StepPipeline::new(&store, &preview, executor);

        let outcome = pipeline.run(&suite, &DatasetId::new());
        match outcome {
            Err(SuiteError::Script(ScriptError::Runtime { entry_point, kind, .. })) => {
                assert_eq!(entry_point, "postprocess_data");
                assert_eq!(kind, "FieldAccessError");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
        // Upstream steps ran; the evaluation step never did.
        assert_eq!(invoker.recorded().len(), 1);
        assert!(!evaluated.load(Ordering::SeqCst));
    }

    #[test]
    fn scriptless_steps_pass_data_through_unchanged() {
        let suite = SuiteId::new();
        let (store, ledger) = configured_service(suite);
        let service = SuiteConfigService::new(&store, &ledger);

        let mut document = must_ok(service.get_workflow_document(&suite));
        for step in StepName::CONFIGURABLE {
            document.set_step(step, StepConfig::default());
        }
        must_ok(service.update_configuration(&suite, &document));

        let invoker = StubInvoker::returning(json!({}));
        let executor = ScriptExecutor::with_builtins(
            invoker as Arc<dyn InvocationClient>,
            MetricRegistry::with_builtins(),
        );
        let preview = StubPreview {
            rows: vec![kwargs(json!({"q": "2+2?"}))],
        };
        let pipeline = StepPipeline::new(&store, &preview, executor);

        let results = must_ok(pipeline.run(&suite, &DatasetId::new()));
        for step in StepName::CONFIGURABLE {
            assert_eq!(must_some(results.output(step)), &json!({"q": "2+2?"}));
        }
    }

    #[test]
    fn pipeline_without_configuration_is_not_found() {
        let store = MemoryBlobStore::new();
        let invoker = StubInvoker::returning(json!({}));
        let executor = ScriptExecutor::with_builtins(
            invoker as Arc<dyn InvocationClient>,
            MetricRegistry::with_builtins(),
        );
        let preview = StubPreview { rows: Vec::new() };
        let pipeline = StepPipeline::new(&store, &preview, executor);
        let err = pipeline.run(&SuiteId::new(), &DatasetId::new());
        assert!(matches!(err, Err(SuiteError::NotFound(_))));
    }

    #[test]
    fn pipeline_with_empty_dataset_is_not_found() {
        let suite = SuiteId::new();
        let (store, _ledger) = configured_service(suite);
        let invoker = StubInvoker::returning(json!({}));
        let executor = ScriptExecutor::with_builtins(
            invoker as Arc<dyn InvocationClient>,
            MetricRegistry::with_builtins(),
        );
        let preview = StubPreview { rows: Vec::new() };
        let pipeline = StepPipeline::new(&store, &preview, executor);
        let err = pipeline.run(&suite, &DatasetId::new());
        assert!(matches!(err, Err(SuiteError::NotFound(_))));
    }

    #[test]
    fn step_names_round_trip() {
        for step in [
            StepName::LoadData,
            StepName::Preprocessing,
            StepName::Invocation,
            StepName::Postprocessing,
            StepName::Evaluation,
        ] {
            assert_eq!(StepName::parse(step.as_str()), Some(step));
        }
        assert_eq!(StepName::parse("bogus"), None);
    }
}
