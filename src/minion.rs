// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Cluster minion core.
//!
//! A minion owns a single SSH session to one cluster front-end. It loads the
//! front-end's `cloud.json` catalogue at login, reserves instances, and
//! translates experiment lifecycle calls into batch-queue submissions. At
//! most one mutating operation is in flight against any instance: every
//! cluster-side operation runs under that instance's lock, and requests to
//! the same instance complete in arrival order.

pub mod batch;
pub mod ssh;

use crate::{
    config::{MinionConfig, SshEndpoint},
    minion::ssh::{RemoteShell, ShellOutput},
    rpc::{params, Service},
    store::{new_id, Application, Experiment, Image, Instance, Size, Store, SystemSpec},
    Error, Result,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};

/// Registry of per-instance locks.
///
/// Entries are created at `createInstance` and removed at
/// `destroyInstance`; acquiring a lock whose entry is gone fails instead of
/// silently serialising against nothing.
#[derive(Default)]
struct LockRegistry {
    entries: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    fn register(&self, id: &str) {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        entries.entry(id.into()).or_insert_with(|| Arc::new(Mutex::new(())));
    }

    fn remove(&self, id: &str) {
        let mut entries = self.entries.lock().expect("lock registry poisoned");
        entries.remove(id);
    }

    async fn acquire(&self, id: &str) -> Result<OwnedMutexGuard<()>> {
        let slot = {
            let entries = self.entries.lock().expect("lock registry poisoned");
            entries.get(id).cloned()
        };
        let slot = slot.ok_or_else(|| Error::InstanceGone(id.into()))?;

        Ok(slot.lock_owned().await)
    }
}

/// The minion daemon's service object.
///
/// Generic over its transport so tests drive it with a scripted shell;
/// production uses [`ssh::SshSession`].
pub struct ClusterMinion<S: RemoteShell> {
    endpoint: SshEndpoint,
    tag: String,
    store: Store,
    shell: S,
    login_lock: Mutex<()>,
    connected: AtomicBool,
    locks: LockRegistry,
}

/// Payload for `createSize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSize {
    /// Human name.
    pub name: String,

    /// Cores per node.
    pub cpus: u32,

    /// Memory per node in megabytes.
    pub ram: u64,
}

/// Payload for `createInstance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstance {
    /// Human name.
    pub name: String,

    /// Image to reserve against.
    pub image_id: String,

    /// Size to reserve against.
    pub size_id: String,
}

/// Payload shared by `deployExperiment` and `executeExperiment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentJob {
    /// Owning application document.
    pub app: Application,

    /// Experiment document, carrying the public clone URL.
    pub experiment: Experiment,

    /// Chosen system of instances.
    pub system: SystemSpec,

    /// Execution branch to clone; defaults to the experiment branch.
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// Payload shared by `pollExperiment` and `cleanExperiment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentTarget {
    /// Experiment document.
    pub experiment: Experiment,

    /// Chosen system of instances.
    pub system: SystemSpec,
}

#[derive(Debug, Deserialize)]
struct CloudImage {
    name: String,
    workpath: String,
    inputpath: String,
    libpath: String,
    tmppath: String,
}

#[derive(Debug, Deserialize)]
struct CloudSize {
    name: String,
    cpus: u32,
    ram: u64,
}

#[derive(Debug, Deserialize)]
struct CloudCatalog {
    #[serde(default)]
    images: Vec<CloudImage>,
    #[serde(default)]
    sizes: Vec<CloudSize>,
}

impl<S: RemoteShell> ClusterMinion<S> {
    /// Build the minion and re-register a lock for every instance already in
    /// the store, so a restarted daemon serialises exactly like the one it
    /// replaced.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidInput`] if the configured URL is unusable.
    /// - Will fail if the store cannot be listed.
    pub async fn open(config: MinionConfig, store: Store, shell: S) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let tag = endpoint.host.clone();

        let minion = Self {
            endpoint,
            tag,
            store,
            shell,
            login_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            locks: LockRegistry::default(),
        };

        for instance in minion.store.list_instances(&minion.tag).await? {
            minion.locks.register(&instance.id);
        }

        Ok(minion)
    }

    /// The minion tag scoping this minion's catalog entries.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Open the SSH session and load the front-end catalogue.
    ///
    /// Idempotent: concurrent and repeated calls observe one connection
    /// attempt, and an already-open session returns success immediately.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Transport`] if the session cannot be established.
    /// - Return [`Error::InvalidInput`] if `cloud.json` is malformed.
    #[instrument(skip(self), level = "debug")]
    pub async fn login(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            info!("Already connected to {}", self.endpoint.host);
            return Ok(());
        }

        self.shell.connect(&self.endpoint).await?;
        self.load_catalog().await?;
        self.connected.store(true, Ordering::SeqCst);

        Ok(())
    }

    async fn load_catalog(&self) -> Result<()> {
        let output = self.shell.exec("cat cloud.json").await?.expect_success("cat")?;
        let catalog: CloudCatalog = serde_json::from_str(&output.stdout)
            .map_err(|error| Error::InvalidInput(format!("malformed cloud.json: {error}")))?;

        let known_images = self.store.list_images(&self.tag).await?;
        for image in catalog.images {
            if known_images.iter().any(|known| known.name == image.name) {
                continue;
            }

            let image = Image {
                id: new_id(),
                name: image.name,
                minion: self.tag.clone(),
                workpath: image.workpath,
                inputpath: image.inputpath,
                libpath: image.libpath,
                tmppath: image.tmppath,
            };
            info!("Catalog image {:?} ({:?})", image.name, image.id);
            self.store.insert_image(&image).await?;
        }

        let known_sizes = self.store.list_sizes(&self.tag).await?;
        for size in catalog.sizes {
            let present = known_sizes.iter().any(|known| {
                known.name == size.name && known.cpus == size.cpus && known.ram == size.ram
            });
            if present {
                continue;
            }

            let size = Size {
                id: new_id(),
                name: size.name,
                minion: self.tag.clone(),
                cpus: size.cpus,
                ram: size.ram,
            };
            info!("Catalog size {:?} ({:?}, cpus {}, ram {})", size.name, size.id, size.cpus, size.ram);
            self.store.insert_size(&size).await?;
        }

        Ok(())
    }

    /// Register a new size in the catalog.
    ///
    /// # Errors
    ///
    /// - Will fail if the store rejects the document.
    pub async fn create_size(&self, request: CreateSize) -> Result<Size> {
        let size = Size {
            id: new_id(),
            name: request.name,
            minion: self.tag.clone(),
            cpus: request.cpus,
            ram: request.ram,
        };
        self.store.insert_size(&size).await?;
        info!("Created size {:?} ({:?})", size.name, size.id);

        Ok(size)
    }

    /// Reserve an instance against an image and a size.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the image or size does not exist.
    pub async fn create_instance(&self, request: CreateInstance) -> Result<Instance> {
        self.image(&request.image_id).await?;
        self.size(&request.size_id).await?;

        let instance = Instance {
            id: new_id(),
            name: request.name,
            minion: self.tag.clone(),
            image_id: request.image_id,
            size_id: request.size_id,
            deployed: false,
            executed: false,
            job_id: None,
            experiment_id: None,
        };
        self.store.insert_instance(&instance).await?;
        self.locks.register(&instance.id);
        info!("Reserved instance {:?} ({:?})", instance.name, instance.id);

        Ok(instance)
    }

    /// Cancel the instance's recorded job, then delete it from the catalog
    /// and drop its lock entry.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InstanceGone`] if the lock entry is already gone.
    /// - Return [`Error::NotFound`] if the document is already gone.
    #[instrument(skip(self), level = "debug")]
    pub async fn destroy_instance(&self, instance_id: &str) -> Result<()> {
        let guard = self.locks.acquire(instance_id).await?;
        let instance = self.instance(instance_id).await?;

        if let Some(job_id) = &instance.job_id {
            batch::clean_job(&self.shell, job_id).await?;
        }

        self.store.delete_instance(instance_id).await?;
        self.locks.remove(instance_id);
        drop(guard);
        info!("Destroyed instance {instance_id:?}");

        Ok(())
    }

    /// Catalog images: exact-id lookup first, then case-preserving substring
    /// match on name.
    ///
    /// # Errors
    ///
    /// - Will fail if the store round-trip fails.
    pub async fn get_images(&self, filter: &str) -> Result<Vec<Image>> {
        let images = self.store.list_images(&self.tag).await?;
        Ok(filter_catalog(images, filter))
    }

    /// Catalog sizes, filtered like images.
    ///
    /// # Errors
    ///
    /// - Will fail if the store round-trip fails.
    pub async fn get_sizes(&self, filter: &str) -> Result<Vec<Size>> {
        let sizes = self.store.list_sizes(&self.tag).await?;
        Ok(filter_catalog(sizes, filter))
    }

    /// Instances, filtered like images.
    ///
    /// # Errors
    ///
    /// - Will fail if the store round-trip fails.
    pub async fn get_instances(&self, filter: &str) -> Result<Vec<Instance>> {
        let instances = self.store.list_instances(&self.tag).await?;
        Ok(filter_catalog(instances, filter))
    }

    /// Hostname a client should use to reach the instance: the login
    /// endpoint recorded when the session opened.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the instance does not exist.
    pub async fn get_instance_hostname(&self, instance_id: &str) -> Result<String> {
        self.instance(instance_id).await?;

        Ok(self.endpoint.host.clone())
    }

    /// Run one command on the front-end under the instance's lock.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InstanceGone`] if the lock entry is gone.
    /// - Return [`Error::Transport`] if the channel fails.
    pub async fn execute_command(&self, instance_id: &str, command: &str) -> Result<ShellOutput> {
        let _guard = self.locks.acquire(instance_id).await?;
        self.instance(instance_id).await?;

        self.shell.exec(command).await
    }

    /// Pipe a script into a shell on the front-end under the instance's
    /// lock, optionally inside a working directory.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InstanceGone`] if the lock entry is gone.
    /// - Return [`Error::Transport`] if the channel fails.
    pub async fn execute_script(
        &self,
        instance_id: &str,
        script: &str,
        workdir: Option<&str>,
    ) -> Result<ShellOutput> {
        let _guard = self.locks.acquire(instance_id).await?;
        self.instance(instance_id).await?;

        let command = match workdir {
            Some(dir) => format!("cd {dir} && sh -s"),
            None => "sh -s".to_string(),
        };

        self.shell.exec_with_stdin(&command, script.as_bytes()).await
    }

    /// Clone the experiment branch into the image's work path and submit the
    /// compile job on one node.
    ///
    /// Returns the batch job id.
    ///
    /// # Errors
    ///
    /// - Return [`Error::StateViolation`] if the master instance already has
    ///   a deployment.
    /// - Return [`Error::RemoteTool`] if the clone or `qsub` fails.
    #[instrument(skip(self, request), level = "debug")]
    pub async fn deploy_experiment(&self, request: ExperimentJob) -> Result<String> {
        let ExperimentJob { app, experiment, system, execution_id } = request;
        let _guard = self.locks.acquire(&system.master).await?;
        let mut instance = self.instance(&system.master).await?;

        if instance.deployed {
            return Err(Error::StateViolation(format!(
                "instance {:?} already has a deployed experiment",
                instance.id
            )));
        }

        let image = self.image(&instance.image_id).await?;
        let size = self.size(&instance.size_id).await?;
        let workdir = format!("{}/{}", image.workpath, experiment.id);
        let branch = execution_id.as_deref().unwrap_or(&experiment.id);

        info!("Deploying experiment {:?} into {workdir}", experiment.id);
        self.shell
            .exec(&format!("git clone -b {branch} {} {workdir}", experiment.public_url))
            .await?
            .expect_success("git")?;

        let script = batch::compile_script(&workdir, &app.creation_script);
        let qsub = batch::qsub_command(
            &format!("compile-{}", experiment.id),
            1,
            size.cpus,
            size.ram,
            &workdir,
        );
        let job_id = batch::submit(&self.shell, &script, &qsub).await?;

        instance.deployed = true;
        instance.job_id = Some(job_id.clone());
        instance.experiment_id = Some(experiment.id.clone());
        self.store.replace_instance(&instance).await?;
        info!("Experiment {:?} compiling under job {job_id:?}", experiment.id);

        Ok(job_id)
    }

    /// Submit the run job across every instance of the system.
    ///
    /// Returns the batch job id.
    ///
    /// # Errors
    ///
    /// - Return [`Error::StateViolation`] without a prior successful deploy,
    ///   or when the instance already executed.
    /// - Return [`Error::RemoteTool`] if `qsub` fails.
    #[instrument(skip(self, request), level = "debug")]
    pub async fn execute_experiment(&self, request: ExperimentJob) -> Result<String> {
        let ExperimentJob { app, experiment, system, .. } = request;
        let _guard = self.locks.acquire(&system.master).await?;
        let mut instance = self.instance(&system.master).await?;

        if !instance.deployed {
            return Err(Error::StateViolation(format!(
                "instance {:?} has no deployed experiment to execute",
                instance.id
            )));
        }
        if instance.executed {
            return Err(Error::StateViolation(format!(
                "instance {:?} already executed its experiment",
                instance.id
            )));
        }

        let image = self.image(&instance.image_id).await?;
        let size = self.size(&instance.size_id).await?;
        let workdir = format!("{}/{}", image.workpath, experiment.id);
        let nodes = u32::try_from(system.instances.len().max(1))
            .map_err(|_| Error::InvalidInput("system too large".into()))?;

        let script = batch::execute_script(&workdir, &app.execution_script);
        let qsub = batch::qsub_command(
            &format!("exec-{}", experiment.id),
            nodes,
            size.cpus,
            size.ram,
            &workdir,
        );
        let job_id = batch::submit(&self.shell, &script, &qsub).await?;

        instance.executed = true;
        instance.job_id = Some(job_id.clone());
        self.store.replace_instance(&instance).await?;
        info!("Experiment {:?} executing under job {job_id:?}", experiment.id);

        Ok(job_id)
    }

    /// Read the experiment's ground-truth status file. Empty reads report
    /// `unknown`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InstanceGone`] if the master's lock entry is gone.
    pub async fn poll_experiment(&self, request: ExperimentTarget) -> Result<String> {
        let ExperimentTarget { experiment, system } = request;
        let _guard = self.locks.acquire(&system.master).await?;
        let instance = self.instance(&system.master).await?;
        let image = self.image(&instance.image_id).await?;
        let workdir = format!("{}/{}", image.workpath, experiment.id);

        batch::read_status(&self.shell, &workdir).await
    }

    /// Remove the experiment's working directory tree and free the master
    /// instance for a fresh deployment.
    ///
    /// # Errors
    ///
    /// - Return [`Error::RemoteTool`] if the removal fails.
    #[instrument(skip(self, request), level = "debug")]
    pub async fn clean_experiment(&self, request: ExperimentTarget) -> Result<()> {
        let ExperimentTarget { experiment, system } = request;
        let _guard = self.locks.acquire(&system.master).await?;
        let mut instance = self.instance(&system.master).await?;
        let image = self.image(&instance.image_id).await?;
        let workdir = format!("{}/{}", image.workpath, experiment.id);

        self.shell.exec(&format!("rm -rf {workdir}")).await?.expect_success("rm")?;

        instance.deployed = false;
        instance.executed = false;
        instance.job_id = None;
        instance.experiment_id = None;
        self.store.replace_instance(&instance).await?;
        info!("Cleaned experiment {:?} from {workdir}", experiment.id);

        Ok(())
    }

    /// Force-delete one batch job, retrying until the queue forgets it.
    ///
    /// # Errors
    ///
    /// - Will fail if the channel itself fails.
    pub async fn clean_job(&self, job_id: &str) -> Result<()> {
        batch::clean_job(&self.shell, job_id).await
    }

    /// `finished` once `qstat` no longer knows the job, `running` before.
    ///
    /// # Errors
    ///
    /// - Will fail if the channel itself fails.
    pub async fn get_job_status(&self, job_id: &str) -> Result<String> {
        let status = batch::job_status(&self.shell, job_id).await?;

        Ok(status.to_string())
    }

    /// Tear the SSH session down.
    ///
    /// # Errors
    ///
    /// - Will fail if the control channel refuses the exit request.
    pub async fn logout(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        self.shell.disconnect().await?;
        self.connected.store(false, Ordering::SeqCst);

        Ok(())
    }

    async fn instance(&self, id: &str) -> Result<Instance> {
        self.store
            .get_instance(id)
            .await?
            .filter(|instance| instance.minion == self.tag)
            .ok_or(Error::NotFound { entity: "instance", id: id.into() })
    }

    async fn image(&self, id: &str) -> Result<Image> {
        let images = self.store.list_images(&self.tag).await?;
        images
            .into_iter()
            .find(|image| image.id == id)
            .ok_or(Error::NotFound { entity: "image", id: id.into() })
    }

    async fn size(&self, id: &str) -> Result<Size> {
        let sizes = self.store.list_sizes(&self.tag).await?;
        sizes
            .into_iter()
            .find(|size| size.id == id)
            .ok_or(Error::NotFound { entity: "size", id: id.into() })
    }
}

trait CatalogEntry {
    fn entry_id(&self) -> &str;
    fn entry_name(&self) -> &str;
}

impl CatalogEntry for Image {
    fn entry_id(&self) -> &str {
        &self.id
    }
    fn entry_name(&self) -> &str {
        &self.name
    }
}

impl CatalogEntry for Size {
    fn entry_id(&self) -> &str {
        &self.id
    }
    fn entry_name(&self) -> &str {
        &self.name
    }
}

impl CatalogEntry for Instance {
    fn entry_id(&self) -> &str {
        &self.id
    }
    fn entry_name(&self) -> &str {
        &self.name
    }
}

fn filter_catalog<T: CatalogEntry>(entries: Vec<T>, filter: &str) -> Vec<T> {
    if filter.is_empty() {
        return entries;
    }

    if let Some(index) = entries.iter().position(|entry| entry.entry_id() == filter) {
        let mut entries = entries;
        return vec![entries.swap_remove(index)];
    }

    entries.into_iter().filter(|entry| entry.entry_name().contains(filter)).collect()
}

#[derive(Debug, Deserialize)]
struct Filter {
    #[serde(default)]
    filter: String,
}

#[derive(Debug, Deserialize)]
struct InstanceRef {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
struct JobRef {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct RunCommand {
    instance_id: String,
    command: String,
}

#[derive(Debug, Deserialize)]
struct RunScript {
    instance_id: String,
    script: String,
    #[serde(default)]
    workdir: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommandReply {
    stdout: String,
    stderr: String,
    status: i32,
}

impl From<ShellOutput> for CommandReply {
    fn from(output: ShellOutput) -> Self {
        Self { stdout: output.stdout, stderr: output.stderr, status: output.status }
    }
}

#[async_trait]
impl<S: RemoteShell> Service for ClusterMinion<S> {
    async fn dispatch(&self, method: &str, payload: Value) -> Result<Value> {
        match method {
            "login" => reply(self.login().await?),
            "createSize" => reply(self.create_size(params(payload)?).await?),
            "createInstance" => reply(self.create_instance(params(payload)?).await?),
            "destroyInstance" => {
                let request: InstanceRef = params(payload)?;
                reply(self.destroy_instance(&request.instance_id).await?)
            }
            "getImages" => {
                let request: Filter = params(payload)?;
                reply(self.get_images(&request.filter).await?)
            }
            "getSizes" => {
                let request: Filter = params(payload)?;
                reply(self.get_sizes(&request.filter).await?)
            }
            "getInstances" => {
                let request: Filter = params(payload)?;
                reply(self.get_instances(&request.filter).await?)
            }
            "getInstanceHostname" => {
                let request: InstanceRef = params(payload)?;
                reply(self.get_instance_hostname(&request.instance_id).await?)
            }
            "executeCommand" => {
                let request: RunCommand = params(payload)?;
                let output = self.execute_command(&request.instance_id, &request.command).await?;
                reply(CommandReply::from(output))
            }
            "executeScript" => {
                let request: RunScript = params(payload)?;
                let output = self
                    .execute_script(&request.instance_id, &request.script, request.workdir.as_deref())
                    .await?;
                reply(CommandReply::from(output))
            }
            "deployExperiment" => reply(self.deploy_experiment(params(payload)?).await?),
            "executeExperiment" => reply(self.execute_experiment(params(payload)?).await?),
            "pollExperiment" => reply(self.poll_experiment(params(payload)?).await?),
            "cleanExperiment" => reply(self.clean_experiment(params(payload)?).await?),
            "cleanJob" => {
                let request: JobRef = params(payload)?;
                reply(self.clean_job(&request.job_id).await?)
            }
            "getJobStatus" => {
                let request: JobRef = params(payload)?;
                reply(self.get_job_status(&request.job_id).await?)
            }
            _ => Err(Error::NotFound { entity: "method", id: method.into() }),
        }
    }
}

fn reply<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}
