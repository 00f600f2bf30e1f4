// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Storage core.
//!
//! Persists application source trees, versions each experiment and each
//! execution as a branch of the owning application repository, discovers and
//! substitutes labels, and stages input/output data per experiment. All
//! repository work funnels through one working tree per application, so
//! every mutating operation runs under the single FIFO storage lock and
//! restores the default branch before the lock is released.

pub mod labels;
pub mod repo;
pub mod tree;

use crate::{
    config::StorageConfig,
    rpc::{params, Service},
    storage::{
        repo::{AppRepo, DEFAULT_BRANCH},
        tree::FolderNode,
    },
    store::{
        new_id, Application, ExecEnvironment, Execution, Experiment, ExperimentStatus, Store,
    },
    utils::syscall,
    Error, Result,
};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// The storage daemon's service object.
///
/// Tests construct this directly on a temp directory layout and an
/// in-memory store; the daemon builds it from its JSON config.
pub struct StorageService {
    config: StorageConfig,
    store: Store,
    lock: Mutex<()>,
}

/// Payload for `createApplication`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApplication {
    /// Unique human name.
    pub name: String,

    /// Free-form description.
    #[serde(default)]
    pub desc: String,

    /// Existing directory to upload.
    pub path: PathBuf,

    /// Compile script, relative to the application root.
    pub creation_script: String,

    /// Run script, relative to the application root.
    pub execution_script: String,
}

/// Payload for `createExperiment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExperiment {
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
    pub labels: BTreeMap<String, String>,
}

impl StorageService {
    /// Build the service, create missing storage directories, and reconcile
    /// the document store against disk.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Io`] if a storage directory cannot be created.
    /// - Will fail if the reconciliation pass cannot reach the store.
    pub async fn open(config: StorageConfig, store: Store) -> Result<Self> {
        config.ensure_directories()?;
        let service = Self { config, store, lock: Mutex::new(()) };
        service.reconcile().await?;

        Ok(service)
    }

    /// Drop every application document whose on-disk directory is missing.
    ///
    /// Directories with a sibling metadata file but no document are left
    /// alone; those only appear through manual operation.
    async fn reconcile(&self) -> Result<()> {
        let dangling: Vec<_> = self
            .store
            .list_applications()
            .await?
            .into_iter()
            .filter(|app| !self.app_dir(&app.id).is_dir())
            .collect();

        stream::iter(dangling)
            .for_each_concurrent(None, |app| {
                let store = self.store.clone();
                async move {
                    warn!("Application {:?} has no directory on disk, dropping document", app.id);
                    if let Err(error) = store.delete_application(&app.id).await {
                        warn!("Could not drop document for {:?}: {error}", app.id);
                    }
                }
            })
            .await;

        Ok(())
    }

    fn app_dir(&self, app_id: &str) -> PathBuf {
        self.config.appstorage.join(app_id)
    }

    fn app_meta_path(&self, app_id: &str) -> PathBuf {
        self.config.appstorage.join(format!("{app_id}.json"))
    }

    fn input_dir(&self, exp_id: &str) -> PathBuf {
        self.config.inputstorage.join(exp_id)
    }

    fn output_dir(&self, id: &str) -> PathBuf {
        self.config.outputstorage.join(id)
    }

    async fn application(&self, app_id: &str) -> Result<Application> {
        self.store
            .get_application(app_id)
            .await?
            .ok_or(Error::NotFound { entity: "application", id: app_id.into() })
    }

    async fn experiment(&self, exp_id: &str) -> Result<Experiment> {
        self.store
            .get_experiment(exp_id)
            .await?
            .ok_or(Error::NotFound { entity: "experiment", id: exp_id.into() })
    }

    /// Copy a source tree into the application slot and initialise its
    /// repository with a single root revision.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] if `src` is not a directory.
    /// - Will fail if the copy or the repository initialisation fails.
    #[instrument(skip(self, src), level = "debug")]
    pub async fn copy_application(&self, app_id: &str, src: &Path) -> Result<()> {
        if !src.is_dir() {
            return Err(Error::InvalidInput(format!(
                "source path {} does not exist or is not a directory",
                src.display()
            )));
        }

        let _guard = self.lock.lock().await;
        let src = src.to_path_buf();
        let dst = self.app_dir(app_id);
        info!("Copying application tree {} -> {}", src.display(), dst.display());

        blocking(move || {
            std::fs::create_dir_all(&dst)?;
            let mut options = fs_extra::dir::CopyOptions::new();
            options.content_only = true;
            fs_extra::dir::copy(&src, &dst, &options)
                .map_err(|error| Error::InvalidInput(format!("copy failed: {error}")))?;
            AppRepo::init(&dst)?;

            Ok(())
        })
        .await
    }

    /// Upload a new application: copy its tree, initialise the repository,
    /// discover labels, and persist the document plus a sibling metadata
    /// file.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] if the source path is not a
    ///   directory.
    /// - Return [`Error::StateViolation`] if the name is already taken.
    #[instrument(skip(self, request), level = "debug")]
    pub async fn create_application(&self, request: CreateApplication) -> Result<Application> {
        if self.store.get_application_by_name(&request.name).await?.is_some() {
            return Err(Error::StateViolation(format!(
                "application name {:?} already in use",
                request.name
            )));
        }

        let app_id = new_id();
        self.copy_application(&app_id, &request.path).await?;

        let labels = self.discover_labels(&app_id).await?;
        let app = Application {
            id: app_id,
            name: request.name,
            desc: request.desc,
            creation_script: request.creation_script,
            execution_script: request.execution_script,
            labels,
        };

        std::fs::write(self.app_meta_path(&app.id), serde_json::to_vec_pretty(&app)?)?;
        self.store.insert_application(&app).await?;
        info!("Created application {:?} ({:?})", app.name, app.id);

        Ok(app)
    }

    /// Every application document in the store.
    ///
    /// # Errors
    ///
    /// - Will fail if the store round-trip fails.
    pub async fn get_applications(&self) -> Result<Vec<Application>> {
        self.store.list_applications().await
    }

    /// One application document by id.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if no such application exists.
    pub async fn get_application(&self, app_id: &str) -> Result<Application> {
        self.application(app_id).await
    }

    /// Delete an application: repository directory, sibling metadata, and
    /// document.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if no such application exists.
    pub async fn remove_application(&self, app_id: &str) -> Result<()> {
        let app = self.application(app_id).await?;
        let _guard = self.lock.lock().await;

        let dir = self.app_dir(&app.id);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
        }
        let meta = self.app_meta_path(&app.id);
        if meta.is_file() {
            std::fs::remove_file(&meta)?;
        }
        self.store.delete_application(&app.id).await?;
        info!("Removed application {:?}", app.id);

        Ok(())
    }

    /// Sorted set of label names found in the application's regular files at
    /// the current revision.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the application directory is missing.
    pub async fn discover_labels(&self, app_id: &str) -> Result<Vec<String>> {
        let dir = self.app_dir(app_id);
        if !dir.is_dir() {
            return Err(Error::NotFound { entity: "application", id: app_id.into() });
        }

        let _guard = self.lock.lock().await;
        let recursive = self.config.recursive_substitution;
        let found = blocking(move || labels::discover(&dir, recursive)).await?;

        Ok(found.into_iter().collect())
    }

    /// Create branch `exp_id` from the default branch and hard-link the
    /// default input tree into the experiment's input slot.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the application repository is
    ///   missing.
    /// - Return [`Error::StateViolation`] if the branch already exists.
    #[instrument(skip(self), level = "debug")]
    pub async fn copy_experiment(&self, exp_id: &str, app_id: &str) -> Result<()> {
        let dir = self.app_dir(app_id);
        if !dir.is_dir() {
            return Err(Error::NotFound { entity: "application", id: app_id.into() });
        }

        let _guard = self.lock.lock().await;
        let branch = exp_id.to_string();
        blocking(move || {
            let repo = AppRepo::open(&dir)?;
            repo.create_branch(&branch, DEFAULT_BRANCH)
        })
        .await?;

        let input = self.input_dir(exp_id);
        let default_input = self.config.inputstorage.join("default");
        if default_input.is_dir() {
            let args = [OsStr::new("-al"), default_input.as_os_str(), input.as_os_str()];
            syscall("cp", args).await?;
        } else {
            std::fs::create_dir_all(&input)?;
        }

        Ok(())
    }

    /// Create an experiment: branch, staged input, and document.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the application does not exist.
    pub async fn create_experiment(&self, request: CreateExperiment) -> Result<Experiment> {
        let app = self.application(&request.app_id).await?;
        let exp_id = new_id();
        self.copy_experiment(&exp_id, &app.id).await?;

        let experiment = Experiment {
            id: exp_id,
            app_id: app.id.clone(),
            name: request.name,
            desc: request.desc,
            exec_env: request.exec_env,
            labels: request.labels,
            status: ExperimentStatus::Created,
            execution_id: None,
            public_url: self.get_application_url(&app.id),
        };
        self.store.insert_experiment(&experiment).await?;
        info!("Created experiment {:?} of application {:?}", experiment.id, app.id);

        Ok(experiment)
    }

    /// Experiments in the store, optionally scoped to one application.
    ///
    /// # Errors
    ///
    /// - Will fail if the store round-trip fails.
    pub async fn get_experiments(&self, app_id: Option<&str>) -> Result<Vec<Experiment>> {
        self.store.list_experiments(app_id).await
    }

    /// One experiment document by id.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if no such experiment exists.
    pub async fn get_experiment(&self, exp_id: &str) -> Result<Experiment> {
        self.experiment(exp_id).await
    }

    /// Move the experiment status mirror forward.
    ///
    /// The on-cluster status file is the ground truth; this mirror never
    /// travels backwards.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if no such experiment exists.
    pub async fn update_experiment_status(
        &self,
        exp_id: &str,
        status: ExperimentStatus,
    ) -> Result<Experiment> {
        let mut experiment = self.experiment(exp_id).await?;
        if status.rank() >= experiment.status.rank() {
            experiment.status = status;
            self.store.replace_experiment(&experiment).await?;
        }

        Ok(experiment)
    }

    /// Prepare an execution: branch `exec_id` from `exp_id`, substitute the
    /// composed label map into the checkout, and commit.
    ///
    /// # Errors
    ///
    /// - Return [`Error::StateViolation`] if branch `exec_id` already
    ///   exists.
    /// - Return [`Error::NotFound`] if application or experiment is
    ///   missing.
    #[instrument(skip(self, user_labels), level = "debug")]
    pub async fn prepare_execution(
        &self,
        app_id: &str,
        exp_id: &str,
        exec_id: &str,
        user_labels: BTreeMap<String, String>,
    ) -> Result<Execution> {
        let app = self.application(app_id).await?;
        let mut experiment = self.experiment(exp_id).await?;

        let mut chosen = experiment.labels.clone();
        chosen.extend(user_labels);
        let system = labels::system_labels(&app, &experiment);
        let composed = labels::compose(&app.labels, &chosen, &system);

        let _guard = self.lock.lock().await;
        let dir = self.app_dir(app_id);
        let parent = exp_id.to_string();
        let branch = exec_id.to_string();
        let recursive = self.config.recursive_substitution;
        let map = composed.clone();
        blocking(move || {
            let repo = AppRepo::open(&dir)?;
            repo.create_branch(&branch, &parent)?;
            repo.on_branch(&branch, |repo| {
                labels::substitute_dir(repo.path(), &map, recursive)?;
                repo.commit_all(&format!("Prepared execution {branch}"))?;
                Ok(())
            })
        })
        .await?;
        drop(_guard);

        let execution = Execution {
            id: exec_id.to_string(),
            experiment_id: exp_id.to_string(),
            labels: composed,
            job_id: None,
            status: "prepared".into(),
        };
        self.store.insert_execution(&execution).await?;

        experiment.execution_id = Some(exec_id.to_string());
        if ExperimentStatus::Prepared.rank() >= experiment.status.rank() {
            experiment.status = ExperimentStatus::Prepared;
        }
        self.store.replace_experiment(&experiment).await?;
        info!("Prepared execution {:?} of experiment {:?}", exec_id, exp_id);

        Ok(execution)
    }

    /// Delete the experiment branch, its execution branches, its staged
    /// input, and its documents.
    ///
    /// # Errors
    ///
    /// - Will fail if the repository cannot be opened or a branch refuses
    ///   deletion.
    #[instrument(skip(self), level = "debug")]
    pub async fn remove_experiment(&self, app_id: &str, exp_id: &str) -> Result<()> {
        let executions = self.store.list_executions(exp_id).await?;

        let _guard = self.lock.lock().await;
        let dir = self.app_dir(app_id);
        let branch = exp_id.to_string();
        let exec_branches: Vec<String> =
            executions.iter().map(|execution| execution.id.clone()).collect();
        blocking(move || {
            let repo = AppRepo::open(&dir)?;
            for exec_branch in &exec_branches {
                if repo.has_branch(exec_branch) {
                    repo.delete_branch(exec_branch)?;
                }
            }
            if repo.has_branch(&branch) {
                repo.delete_branch(&branch)?;
            }

            Ok(())
        })
        .await?;

        let input = self.input_dir(exp_id);
        if input.is_dir() {
            std::fs::remove_dir_all(&input)?;
        }

        for execution in &executions {
            self.store.delete_execution(&execution.id).await?;
        }
        self.store.delete_experiment(exp_id).await?;
        info!("Removed experiment {exp_id:?}");

        Ok(())
    }

    /// Raw bytes of `fpath` on branch `exp_id`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] for absolute paths or paths that
    ///   resolve to a directory.
    /// - Return [`Error::NotFound`] if branch or file is missing.
    pub async fn get_experiment_code(
        &self,
        exp_id: &str,
        app_id: &str,
        fpath: &Path,
    ) -> Result<Vec<u8>> {
        let fpath = relative(fpath)?.to_path_buf();
        let _guard = self.lock.lock().await;
        let dir = self.app_dir(app_id);
        let branch = exp_id.to_string();

        blocking(move || {
            let repo = AppRepo::open(&dir)?;
            repo.read_file(&branch, &fpath)
        })
        .await
    }

    /// Write `content` to `fpath` on branch `exp_id` and commit. A nil
    /// content commits a placeholder marker file so the directory named by
    /// `fpath` survives.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] for absolute paths.
    /// - Will fail if the checkout or the commit fails.
    #[instrument(skip(self, content), level = "debug")]
    pub async fn put_experiment_code(
        &self,
        exp_id: &str,
        app_id: &str,
        fpath: &Path,
        content: Option<Vec<u8>>,
    ) -> Result<()> {
        let fpath = relative(fpath)?.to_path_buf();
        let _guard = self.lock.lock().await;
        let dir = self.app_dir(app_id);
        let branch = exp_id.to_string();

        blocking(move || {
            let repo = AppRepo::open(&dir)?;
            repo.on_branch(&branch, |repo| {
                let target = repo.path().join(&fpath);
                match &content {
                    Some(bytes) => {
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&target, bytes)?;
                    }
                    None => {
                        std::fs::create_dir_all(&target)?;
                        std::fs::write(target.join(".gitkeep"), b"")?;
                    }
                }
                repo.commit_all(&format!("Update {}", fpath.display()))?;

                Ok(())
            })
        })
        .await
    }

    /// Remove `fpath` (file or subtree) from branch `exp_id` and commit.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] for absolute paths.
    /// - Return [`Error::NotFound`] if the path does not exist on the
    ///   branch.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_experiment_code(
        &self,
        exp_id: &str,
        app_id: &str,
        fpath: &Path,
    ) -> Result<()> {
        let fpath = relative(fpath)?.to_path_buf();
        let _guard = self.lock.lock().await;
        let dir = self.app_dir(app_id);
        let branch = exp_id.to_string();

        blocking(move || {
            let repo = AppRepo::open(&dir)?;
            repo.on_branch(&branch, |repo| {
                let target = repo.path().join(&fpath);
                if target.is_dir() {
                    std::fs::remove_dir_all(&target)?;
                } else if target.is_file() {
                    std::fs::remove_file(&target)?;
                } else {
                    return Err(Error::NotFound {
                        entity: "file",
                        id: fpath.display().to_string(),
                    });
                }
                repo.commit_all(&format!("Delete {}", fpath.display()))?;

                Ok(())
            })
        })
        .await
    }

    /// Copy a staged input file under `inputstorage/<exp_id>/<fpath>`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] for absolute paths.
    /// - Return [`Error::Io`] if the copy fails.
    pub async fn put_experiment_input(
        &self,
        exp_id: &str,
        fpath: &Path,
        src: &Path,
    ) -> Result<()> {
        let fpath = relative(fpath)?;
        let target = self.input_dir(exp_id).join(fpath);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, &target)?;

        Ok(())
    }

    /// Remove one staged input file, or the whole input folder when `fpath`
    /// is nil.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] for absolute paths.
    pub async fn delete_experiment_input(
        &self,
        exp_id: &str,
        fpath: Option<&Path>,
    ) -> Result<()> {
        match fpath {
            Some(fpath) => {
                let target = self.input_dir(exp_id).join(relative(fpath)?);
                if target.is_file() {
                    std::fs::remove_file(&target)?;
                }
            }
            None => {
                let dir = self.input_dir(exp_id);
                if dir.is_dir() {
                    std::fs::remove_dir_all(&dir)?;
                }
            }
        }

        Ok(())
    }

    /// Copy experiment output from the cluster front-end into
    /// `outputstorage/<exp_id>/`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::RemoteTool`] if `scp` exits non-zero.
    #[instrument(skip(self), level = "debug")]
    pub async fn retrieve_experiment_output(&self, exp_id: &str, src: &str) -> Result<()> {
        let target = self.output_dir(exp_id);
        std::fs::create_dir_all(&target)?;
        let args = [OsStr::new("-r"), OsStr::new(src), target.as_os_str()];
        syscall("scp", args).await?;

        Ok(())
    }

    /// Absolute server path of one retrieved output file. Defaults to
    /// `output.tar.gz`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] for absolute paths.
    /// - Return [`Error::NotFound`] if the file does not exist.
    pub async fn get_execution_output_file(
        &self,
        exp_id: &str,
        fpath: Option<&Path>,
    ) -> Result<PathBuf> {
        let fpath = match fpath {
            Some(fpath) => relative(fpath)?.to_path_buf(),
            None => PathBuf::from("output.tar.gz"),
        };

        let target = self.output_dir(exp_id).join(&fpath);
        if !target.is_file() {
            return Err(Error::NotFound { entity: "file", id: target.display().to_string() });
        }

        Ok(target)
    }

    /// Folder tree of the staged input of one experiment.
    ///
    /// # Errors
    ///
    /// - Will fail if the directory walk fails.
    pub async fn get_input_folder_tree(&self, id: &str) -> Result<Vec<FolderNode>> {
        tree::from_dir(&self.input_dir(id))
    }

    /// Folder tree of the retrieved output of one experiment.
    ///
    /// # Errors
    ///
    /// - Will fail if the directory walk fails.
    pub async fn get_output_folder_tree(&self, id: &str) -> Result<Vec<FolderNode>> {
        tree::from_dir(&self.output_dir(id))
    }

    /// Folder tree of the sources on branch `exp_id`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the branch is missing.
    pub async fn get_experiment_src_folder_tree(
        &self,
        exp_id: &str,
        app_id: &str,
    ) -> Result<Vec<FolderNode>> {
        let _guard = self.lock.lock().await;
        let dir = self.app_dir(app_id);
        let branch = exp_id.to_string();
        let entries = blocking(move || {
            let repo = AppRepo::open(&dir)?;
            repo.list_entries(&branch)
        })
        .await?;

        Ok(tree::from_entries(&entries))
    }

    /// Clone URL of one application repository.
    pub fn get_application_url(&self, app_id: &str) -> String {
        format!("git://{}/{}", self.config.public_url, app_id)
    }

    /// scp-style URL of one experiment's staged input.
    pub fn get_experiment_input_url(&self, exp_id: &str) -> String {
        format!(
            "{}@{}:{}",
            self.config.username,
            self.config.public_url,
            self.input_dir(exp_id).display()
        )
    }

    /// scp-style URL of one execution's retrieved output.
    pub fn get_execution_output_url(&self, exec_id: &str) -> String {
        format!(
            "{}@{}:{}",
            self.config.username,
            self.config.public_url,
            self.output_dir(exec_id).display()
        )
    }
}

fn relative(path: &Path) -> Result<&Path> {
    if path.is_absolute() {
        return Err(Error::InvalidInput(format!(
            "absolute path {} where a relative one is required",
            path.display()
        )));
    }
    if path.components().any(|component| component == Component::ParentDir) {
        return Err(Error::InvalidInput(format!(
            "path {} escapes its root",
            path.display()
        )));
    }

    Ok(path)
}

async fn blocking<T, F>(operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|error| Error::Transport(format!("blocking task failed: {error}")))?
}

#[derive(Debug, Deserialize)]
struct ApplicationRef {
    app_id: String,
}

#[derive(Debug, Deserialize)]
struct CopyApplication {
    app_id: String,
    src: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ExperimentRef {
    exp_id: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentBranchRef {
    exp_id: String,
    app_id: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentsQuery {
    #[serde(default)]
    app_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    exp_id: String,
    status: ExperimentStatus,
}

#[derive(Debug, Deserialize)]
struct PrepareExecution {
    app_id: String,
    exp_id: String,
    exec_id: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CodeRef {
    exp_id: String,
    app_id: String,
    fpath: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PutCode {
    exp_id: String,
    app_id: String,
    fpath: PathBuf,
    #[serde(default)]
    content: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct PutInput {
    exp_id: String,
    fpath: PathBuf,
    src: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DeleteInput {
    exp_id: String,
    #[serde(default)]
    fpath: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RetrieveOutput {
    exp_id: String,
    src: String,
}

#[derive(Debug, Deserialize)]
struct OutputFileRef {
    exp_id: String,
    #[serde(default)]
    fpath: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[async_trait]
impl Service for StorageService {
    async fn dispatch(&self, method: &str, payload: Value) -> Result<Value> {
        match method {
            "createApplication" => {
                reply(self.create_application(params(payload)?).await?)
            }
            "copyApplication" => {
                let request: CopyApplication = params(payload)?;
                reply(self.copy_application(&request.app_id, &request.src).await?)
            }
            "getApplications" => reply(self.get_applications().await?),
            "getApplication" => {
                let request: ApplicationRef = params(payload)?;
                reply(self.get_application(&request.app_id).await?)
            }
            "removeApplication" => {
                let request: ApplicationRef = params(payload)?;
                reply(self.remove_application(&request.app_id).await?)
            }
            "discoverLabels" => {
                let request: ApplicationRef = params(payload)?;
                reply(self.discover_labels(&request.app_id).await?)
            }
            "createExperiment" => reply(self.create_experiment(params(payload)?).await?),
            "copyExperiment" => {
                let request: ExperimentBranchRef = params(payload)?;
                reply(self.copy_experiment(&request.exp_id, &request.app_id).await?)
            }
            "getExperiments" => {
                let request: ExperimentsQuery = params(payload)?;
                reply(self.get_experiments(request.app_id.as_deref()).await?)
            }
            "getExperiment" => {
                let request: ExperimentRef = params(payload)?;
                reply(self.get_experiment(&request.exp_id).await?)
            }
            "updateExperimentStatus" => {
                let request: StatusUpdate = params(payload)?;
                reply(self.update_experiment_status(&request.exp_id, request.status).await?)
            }
            "removeExperiment" => {
                let request: ExperimentBranchRef = params(payload)?;
                reply(self.remove_experiment(&request.app_id, &request.exp_id).await?)
            }
            "prepareExecution" => {
                let request: PrepareExecution = params(payload)?;
                reply(
                    self.prepare_execution(
                        &request.app_id,
                        &request.exp_id,
                        &request.exec_id,
                        request.labels,
                    )
                    .await?,
                )
            }
            "getExperimentCode" => {
                let request: CodeRef = params(payload)?;
                reply(
                    self.get_experiment_code(&request.exp_id, &request.app_id, &request.fpath)
                        .await?,
                )
            }
            "putExperimentCode" => {
                let request: PutCode = params(payload)?;
                reply(
                    self.put_experiment_code(
                        &request.exp_id,
                        &request.app_id,
                        &request.fpath,
                        request.content,
                    )
                    .await?,
                )
            }
            "deleteExperimentCode" => {
                let request: CodeRef = params(payload)?;
                reply(
                    self.delete_experiment_code(&request.exp_id, &request.app_id, &request.fpath)
                        .await?,
                )
            }
            "putExperimentInput" => {
                let request: PutInput = params(payload)?;
                reply(
                    self.put_experiment_input(&request.exp_id, &request.fpath, &request.src)
                        .await?,
                )
            }
            "deleteExperimentInput" => {
                let request: DeleteInput = params(payload)?;
                reply(
                    self.delete_experiment_input(&request.exp_id, request.fpath.as_deref())
                        .await?,
                )
            }
            "retrieveExperimentOutput" => {
                let request: RetrieveOutput = params(payload)?;
                reply(self.retrieve_experiment_output(&request.exp_id, &request.src).await?)
            }
            "getExecutionOutputFile" => {
                let request: OutputFileRef = params(payload)?;
                reply(
                    self.get_execution_output_file(&request.exp_id, request.fpath.as_deref())
                        .await?,
                )
            }
            "getInputFolderTree" => {
                let request: IdRef = params(payload)?;
                reply(self.get_input_folder_tree(&request.id).await?)
            }
            "getOutputFolderTree" => {
                let request: IdRef = params(payload)?;
                reply(self.get_output_folder_tree(&request.id).await?)
            }
            "getExperimentSrcFolderTree" => {
                let request: ExperimentBranchRef = params(payload)?;
                reply(
                    self.get_experiment_src_folder_tree(&request.exp_id, &request.app_id)
                        .await?,
                )
            }
            "getApplicationURL" => {
                let request: ApplicationRef = params(payload)?;
                reply(self.get_application_url(&request.app_id))
            }
            "getExperimentInputURL" => {
                let request: ExperimentRef = params(payload)?;
                reply(self.get_experiment_input_url(&request.exp_id))
            }
            "getExecutionOutputURL" => {
                let request: IdRef = params(payload)?;
                reply(self.get_execution_output_url(&request.id))
            }
            _ => Err(Error::NotFound { entity: "method", id: method.into() }),
        }
    }
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}
