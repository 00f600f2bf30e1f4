// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Document store seam.
//!
//! Every entity both daemons manage lives in a document store shaped like a
//! set of MongoDB collections with unique compound indexes. The driver
//! itself is an external collaborator, so this module only pins down the
//! [`Backend`] contract plus the serde documents, and ships an in-process
//! [`MemoryBackend`] the daemons and the test suite run on. The document
//! store is the sole shared mutable state across process restarts; entities
//! reference each other by id only.

use crate::{Error, Result};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::Mutex;

/// An application: a source tree plus creation and execution scripts,
/// versioned as a git repository by the storage daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Server-generated time-ordered id.
    pub id: String,

    /// Unique human name.
    pub name: String,

    /// Free-form description.
    #[serde(default)]
    pub desc: String,

    /// Path of the compile script, relative to the application root.
    pub creation_script: String,

    /// Path of the run script, relative to the application root.
    pub execution_script: String,

    /// Labels discovered in the source at creation time, sorted.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Desired execution environment of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEnvironment {
    /// Cores per node.
    pub cpus: u32,

    /// Node count.
    pub nodes: u32,

    /// Input staging path on the cluster.
    #[serde(default)]
    pub inputpath: String,

    /// Library path on the cluster.
    #[serde(default)]
    pub libpath: String,

    /// Scratch path on the cluster.
    #[serde(default)]
    pub tmppath: String,
}

/// Lifecycle status of an experiment document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Branch exists, nothing prepared yet.
    Created,

    /// A parameterised execution branch has been committed.
    Prepared,

    /// Cloned on a cluster, compile job submitted.
    Deployed,

    /// Run job submitted.
    Running,

    /// Run finished cleanly.
    Done,

    /// Compile job failed.
    FailedCompilation,

    /// Run job failed.
    FailedExecution,
}

impl ExperimentStatus {
    /// Monotone rank used to keep the document-store mirror from moving
    /// backwards behind the on-cluster status file.
    pub fn rank(self) -> u8 {
        match self {
            ExperimentStatus::Created => 0,
            ExperimentStatus::Prepared => 1,
            ExperimentStatus::Deployed => 2,
            ExperimentStatus::Running => 3,
            ExperimentStatus::Done
            | ExperimentStatus::FailedCompilation
            | ExperimentStatus::FailedExecution => 4,
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExperimentStatus::Created => "created",
            ExperimentStatus::Prepared => "prepared",
            ExperimentStatus::Deployed => "deployed",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Done => "done",
            ExperimentStatus::FailedCompilation => "failed_compilation",
            ExperimentStatus::FailedExecution => "failed_execution",
        };
        write!(f, "{name}")
    }
}

/// A named parameterisation of an application, stored as branch `id` of the
/// application repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    /// Server-generated time-ordered id; also the branch name.
    pub id: String,

    /// Owning application id.
    pub app_id: String,

    /// Human name.
    pub name: String,

    /// Free-form description.
    #[serde(default)]
    pub desc: String,

    /// Desired execution environment.
    #[serde(default)]
    pub exec_env: ExecEnvironment,

    /// Chosen label values.
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,

    /// Lifecycle status mirror.
    pub status: ExperimentStatus,

    /// Latest execution launched from this experiment, if any.
    #[serde(default)]
    pub execution_id: Option<String>,

    /// Public clone URL clients and minions use to reach the repository.
    #[serde(default)]
    pub public_url: String,
}

/// A concrete launch of an experiment on a system; branch `id` of the
/// application repository carries its substituted sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Server-generated time-ordered id; also the branch name.
    pub id: String,

    /// Parent experiment id.
    pub experiment_id: String,

    /// Label map applied at preparation time.
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,

    /// Batch job id returned by the submission command.
    #[serde(default)]
    pub job_id: Option<String>,

    /// Status mirrored from the on-cluster status file.
    #[serde(default)]
    pub status: String,
}

/// The set of cluster instances designated for one execution. The master is
/// the front-end node where batch jobs are submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSpec {
    /// Ordered instance ids taking part in the execution.
    pub instances: Vec<String>,

    /// Master instance id.
    pub master: String,
}

/// Catalog image entry scoped to one minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Catalog id.
    pub id: String,

    /// Image name from `cloud.json`.
    pub name: String,

    /// Owning minion tag.
    pub minion: String,

    /// Working directory root for experiment checkouts.
    pub workpath: String,

    /// Input staging root.
    pub inputpath: String,

    /// Library root.
    pub libpath: String,

    /// Scratch root.
    pub tmppath: String,
}

/// Catalog size entry scoped to one minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    /// Catalog id.
    pub id: String,

    /// Size name from `cloud.json`.
    pub name: String,

    /// Owning minion tag.
    pub minion: String,

    /// Cores per node.
    pub cpus: u32,

    /// Memory per node in megabytes.
    pub ram: u64,
}

/// A reserved slot on the cluster, created by `createInstance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Catalog id.
    pub id: String,

    /// Human name.
    pub name: String,

    /// Owning minion tag.
    pub minion: String,

    /// Image this instance was reserved against.
    pub image_id: String,

    /// Size this instance was reserved against.
    pub size_id: String,

    /// Whether an experiment has been deployed on this instance.
    #[serde(default)]
    pub deployed: bool,

    /// Whether the deployed experiment has been launched.
    #[serde(default)]
    pub executed: bool,

    /// Batch job currently recorded against this instance.
    #[serde(default)]
    pub job_id: Option<String>,

    /// Experiment currently occupying this instance.
    #[serde(default)]
    pub experiment_id: Option<String>,
}

/// Document-store driver contract.
///
/// Collections hold JSON documents; filters are top-level field equality
/// matches, which is all the daemons ever need. Unique compound indexes are
/// declared up front and enforced on insert.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Declare a unique compound index over `keys` of `collection`.
    async fn create_unique_index(&self, collection: &str, keys: &[&str]) -> Result<()>;

    /// Insert one document.
    async fn insert(&self, collection: &str, doc: Value) -> Result<()>;

    /// Find the first document matching `filter`.
    async fn find_one(&self, collection: &str, filter: Value) -> Result<Option<Value>>;

    /// Find every document matching `filter`.
    async fn find(&self, collection: &str, filter: Value) -> Result<Vec<Value>>;

    /// Replace the first document matching `filter`, returning whether a
    /// document was replaced.
    async fn replace_one(&self, collection: &str, filter: Value, doc: Value) -> Result<bool>;

    /// Delete the first document matching `filter`, returning whether a
    /// document was deleted.
    async fn delete_one(&self, collection: &str, filter: Value) -> Result<bool>;
}

/// Typed facade over a [`Backend`].
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    /// Wrap an existing backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Open an in-process store with all indexes declared.
    ///
    /// # Errors
    ///
    /// - Will fail if an index declaration fails, which the memory backend
    ///   never does.
    pub async fn open_in_memory() -> Result<Self> {
        let backend = Arc::new(MemoryBackend::default());
        for (collection, keys) in [
            ("applications", vec!["id"]),
            ("applications", vec!["name"]),
            ("experiments", vec!["id"]),
            ("executions", vec!["id"]),
            ("images", vec!["id", "name", "minion"]),
            ("sizes", vec!["id", "name", "minion"]),
            ("instances", vec!["id", "name", "minion"]),
        ] {
            backend.create_unique_index(collection, &keys).await?;
        }

        Ok(Self::new(backend))
    }

    async fn insert_doc<T: Serialize>(&self, collection: &str, doc: &T) -> Result<()> {
        self.backend.insert(collection, serde_json::to_value(doc)?).await
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let found = self.backend.find_one(collection, json!({ "id": id })).await?;
        found.map(serde_json::from_value).transpose().map_err(Error::from)
    }

    async fn list_docs<T: DeserializeOwned>(&self, collection: &str, filter: Value) -> Result<Vec<T>> {
        let found = self.backend.find(collection, filter).await?;
        found
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::from))
            .collect()
    }

    async fn replace_doc<T: Serialize>(&self, collection: &str, id: &str, doc: &T) -> Result<bool> {
        self.backend
            .replace_one(collection, json!({ "id": id }), serde_json::to_value(doc)?)
            .await
    }

    /// Insert an application document.
    ///
    /// # Errors
    ///
    /// - Return [`Error::StateViolation`] if the unique name or id index
    ///   rejects the document.
    pub async fn insert_application(&self, app: &Application) -> Result<()> {
        self.insert_doc("applications", app).await
    }

    /// Fetch an application by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn get_application(&self, id: &str) -> Result<Option<Application>> {
        self.get_doc("applications", id).await
    }

    /// Fetch an application by unique name.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn get_application_by_name(&self, name: &str) -> Result<Option<Application>> {
        let found = self.backend.find_one("applications", json!({ "name": name })).await?;
        found.map(serde_json::from_value).transpose().map_err(Error::from)
    }

    /// List every application document.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn list_applications(&self) -> Result<Vec<Application>> {
        self.list_docs("applications", json!({})).await
    }

    /// Delete an application document by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn delete_application(&self, id: &str) -> Result<bool> {
        self.backend.delete_one("applications", json!({ "id": id })).await
    }

    /// Insert an experiment document.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.insert_doc("experiments", experiment).await
    }

    /// Fetch an experiment by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        self.get_doc("experiments", id).await
    }

    /// List experiments, all of them or scoped to one application.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn list_experiments(&self, app_id: Option<&str>) -> Result<Vec<Experiment>> {
        let filter = match app_id {
            Some(app_id) => json!({ "app_id": app_id }),
            None => json!({}),
        };
        self.list_docs("experiments", filter).await
    }

    /// Replace an experiment document.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn replace_experiment(&self, experiment: &Experiment) -> Result<bool> {
        self.replace_doc("experiments", &experiment.id, experiment).await
    }

    /// Delete an experiment document by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn delete_experiment(&self, id: &str) -> Result<bool> {
        self.backend.delete_one("experiments", json!({ "id": id })).await
    }

    /// Insert an execution document.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.insert_doc("executions", execution).await
    }

    /// Fetch an execution by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        self.get_doc("executions", id).await
    }

    /// Replace an execution document.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn replace_execution(&self, execution: &Execution) -> Result<bool> {
        self.replace_doc("executions", &execution.id, execution).await
    }

    /// List executions launched from one experiment.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn list_executions(&self, experiment_id: &str) -> Result<Vec<Execution>> {
        self.list_docs("executions", json!({ "experiment_id": experiment_id })).await
    }

    /// Delete an execution document by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn delete_execution(&self, id: &str) -> Result<bool> {
        self.backend.delete_one("executions", json!({ "id": id })).await
    }

    /// Insert a catalog image.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn insert_image(&self, image: &Image) -> Result<()> {
        self.insert_doc("images", image).await
    }

    /// List catalog images of one minion.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn list_images(&self, minion: &str) -> Result<Vec<Image>> {
        self.list_docs("images", json!({ "minion": minion })).await
    }

    /// Insert a catalog size.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn insert_size(&self, size: &Size) -> Result<()> {
        self.insert_doc("sizes", size).await
    }

    /// List catalog sizes of one minion.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn list_sizes(&self, minion: &str) -> Result<Vec<Size>> {
        self.list_docs("sizes", json!({ "minion": minion })).await
    }

    /// Insert an instance document.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        self.insert_doc("instances", instance).await
    }

    /// Fetch an instance by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        self.get_doc("instances", id).await
    }

    /// List instances of one minion.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn list_instances(&self, minion: &str) -> Result<Vec<Instance>> {
        self.list_docs("instances", json!({ "minion": minion })).await
    }

    /// Replace an instance document.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn replace_instance(&self, instance: &Instance) -> Result<bool> {
        self.replace_doc("instances", &instance.id, instance).await
    }

    /// Delete an instance document by id.
    ///
    /// # Errors
    ///
    /// - Will fail if the backend round-trip fails.
    pub async fn delete_instance(&self, id: &str) -> Result<bool> {
        self.backend.delete_one("instances", json!({ "id": id })).await
    }
}

/// In-process [`Backend`] holding collections as plain vectors.
///
/// One async mutex guards the whole dataset, which keeps insert-plus-index
/// checks atomic without further ceremony.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    collections: HashMap<String, Vec<Value>>,
    indexes: HashMap<String, Vec<Vec<String>>>,
}

fn matches(doc: &Value, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, want)| doc.get(key) == Some(want))
}

fn as_filter(filter: Value) -> Result<Map<String, Value>> {
    match filter {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidInput(format!("bad filter: {other}"))),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_unique_index(&self, collection: &str, keys: &[&str]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .indexes
            .entry(collection.into())
            .or_default()
            .push(keys.iter().map(ToString::to_string).collect());

        Ok(())
    }

    async fn insert(&self, collection: &str, doc: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Some(indexes) = inner.indexes.get(collection) {
            let existing = inner.collections.get(collection);
            for keys in indexes {
                let clash = existing.into_iter().flatten().any(|other| {
                    keys.iter().all(|key| other.get(key) == doc.get(key))
                });
                if clash {
                    return Err(Error::StateViolation(format!(
                        "duplicate key {keys:?} in collection {collection:?}"
                    )));
                }
            }
        }

        inner.collections.entry(collection.into()).or_default().push(doc);

        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: Value) -> Result<Option<Value>> {
        let filter = as_filter(filter)?;
        let inner = self.inner.lock().await;
        let found = inner
            .collections
            .get(collection)
            .into_iter()
            .flatten()
            .find(|doc| matches(doc, &filter))
            .cloned();

        Ok(found)
    }

    async fn find(&self, collection: &str, filter: Value) -> Result<Vec<Value>> {
        let filter = as_filter(filter)?;
        let inner = self.inner.lock().await;
        let found = inner
            .collections
            .get(collection)
            .into_iter()
            .flatten()
            .filter(|doc| matches(doc, &filter))
            .cloned()
            .collect();

        Ok(found)
    }

    async fn replace_one(&self, collection: &str, filter: Value, doc: Value) -> Result<bool> {
        let filter = as_filter(filter)?;
        let mut inner = self.inner.lock().await;
        let Some(docs) = inner.collections.get_mut(collection) else {
            return Ok(false);
        };

        match docs.iter_mut().find(|existing| matches(existing, &filter)) {
            Some(slot) => {
                *slot = doc;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_one(&self, collection: &str, filter: Value) -> Result<bool> {
        let filter = as_filter(filter)?;
        let mut inner = self.inner.lock().await;
        let Some(docs) = inner.collections.get_mut(collection) else {
            return Ok(false);
        };

        match docs.iter().position(|doc| matches(doc, &filter)) {
            Some(index) => {
                docs.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Generate a fresh time-ordered entity id.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn application(id: &str, name: &str) -> Application {
        Application {
            id: id.into(),
            name: name.into(),
            desc: String::new(),
            creation_script: "compile.sh".into(),
            execution_script: "run.sh".into(),
            labels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unique_indexes_reject_duplicates() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_application(&application("a1", "wrf")).await.unwrap();

        let same_id = store.insert_application(&application("a1", "other")).await;
        assert!(matches!(same_id, Err(Error::StateViolation(..))));

        let same_name = store.insert_application(&application("a2", "wrf")).await;
        assert!(matches!(same_name, Err(Error::StateViolation(..))));
    }

    #[tokio::test]
    async fn compound_index_allows_same_name_on_other_minion() {
        let store = Store::open_in_memory().await.unwrap();
        let image = Image {
            id: "i1".into(),
            name: "standard".into(),
            minion: "galgo".into(),
            workpath: "/work".into(),
            inputpath: "/input".into(),
            libpath: "/lib".into(),
            tmppath: "/tmp".into(),
        };
        store.insert_image(&image).await.unwrap();

        let other = Image { id: "i2".into(), minion: "tirant".into(), ..image.clone() };
        store.insert_image(&other).await.unwrap();

        assert_eq!(store.list_images("galgo").await.unwrap().len(), 1);
        assert_eq!(store.list_images("tirant").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_and_delete_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_application(&application("a1", "wrf")).await.unwrap();

        let mut app = store.get_application("a1").await.unwrap().unwrap();
        app.desc = "weather model".into();
        assert!(store.replace_doc("applications", "a1", &app).await.unwrap());

        let found = store.get_application_by_name("wrf").await.unwrap().unwrap();
        assert_eq!(found.desc, "weather model");

        assert!(store.delete_application("a1").await.unwrap());
        assert!(store.get_application("a1").await.unwrap().is_none());
        assert!(!store.delete_application("a1").await.unwrap());
    }
}
