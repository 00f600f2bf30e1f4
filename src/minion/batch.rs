// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Batch queue plumbing.
//!
//! Fixed script templates plus thin wrappers over the PBS toolchain. Every
//! submitted script reports into the on-cluster `EXPERIMENT_STATUS` file,
//! which is the ground truth for experiment progress; the compile and run
//! variants differ only in their log/exit-code file names and the states
//! they write.

use crate::{
    minion::ssh::{RemoteShell, ShellOutput},
    Result,
};

use std::{fmt, time::Duration};
use tracing::{debug, info};

/// Shell prefix loading the login environment before any queue command.
pub const ENV_PREFIX: &str = ". /etc/profile; . ~/.bash_profile; ";

/// Ground-truth status file inside an experiment's working directory.
pub const STATUS_FILE: &str = "EXPERIMENT_STATUS";

/// Batch script compiling an experiment in `workdir`.
pub fn compile_script(workdir: &str, creation_script: &str) -> String {
    format!(
        r#"#!/bin/sh
cd {workdir}
echo -n "compiling" > EXPERIMENT_STATUS
./{creation_script} &> COMPILATION_LOG
R=$?
if [ $R -eq 0 ]; then
    echo -n "compiled" > EXPERIMENT_STATUS
else
    echo -n "failed_compilation" > EXPERIMENT_STATUS
fi
echo -n $R > COMPILATION_EXIT_CODE
"#
    )
}

/// Batch script running an experiment in `workdir`.
pub fn execute_script(workdir: &str, execution_script: &str) -> String {
    format!(
        r#"#!/bin/sh
cd {workdir}
echo -n "executing" > EXPERIMENT_STATUS
./{execution_script} &> EXECUTION_LOG
R=$?
if [ $R -eq 0 ]; then
    echo -n "done" > EXPERIMENT_STATUS
else
    echo -n "failed_execution" > EXPERIMENT_STATUS
fi
echo -n $R > EXECUTION_EXIT_CODE
"#
    )
}

/// The `qsub` submission line for one job.
///
/// `nodes` is 1 for compilation and the system's instance count for
/// execution; memory is per node in megabytes.
pub fn qsub_command(tag: &str, nodes: u32, cpus: u32, mem_mb: u64, workdir: &str) -> String {
    format!("qsub -N {tag} -l select={nodes}:ncpus={cpus}:mem={mem_mb}MB -o {workdir} -e {workdir}")
}

/// Status of a batch job as reported by `qstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The queue still knows the job.
    Running,

    /// The queue no longer knows the job.
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Pipe a batch script into `qsub` through the login environment and return
/// the job id `qsub` printed.
///
/// # Errors
///
/// - Return [`Error::RemoteTool`] if `qsub` exits non-zero.
///
/// [`Error::RemoteTool`]: crate::Error::RemoteTool
pub async fn submit<S>(shell: &S, script: &str, qsub: &str) -> Result<String>
where
    S: RemoteShell + ?Sized,
{
    info!("Submitting batch job: {qsub}");
    let output = shell
        .exec_with_stdin(&format!("{ENV_PREFIX}{qsub}"), script.as_bytes())
        .await?
        .expect_success("qsub")?;

    Ok(output.stdout.trim().to_string())
}

/// Ask `qstat` about one job.
///
/// PBS reports forgotten jobs on stderr with an "Unknown" diagnostic, which
/// is the only signal that a job has left the queue.
///
/// # Errors
///
/// - Will fail if the channel itself fails.
pub async fn job_status<S>(shell: &S, job_id: &str) -> Result<JobStatus>
where
    S: RemoteShell + ?Sized,
{
    let output = shell.exec(&format!("qstat {job_id}")).await?;
    if output.stderr.contains("Unknown") {
        return Ok(JobStatus::Finished);
    }

    Ok(JobStatus::Running)
}

/// Force-delete one job and keep at it until the queue stops recognising
/// it: `qdel` answers on stderr once the job is no longer known.
///
/// # Errors
///
/// - Will fail if the channel itself fails.
pub async fn clean_job<S>(shell: &S, job_id: &str) -> Result<()>
where
    S: RemoteShell + ?Sized,
{
    loop {
        let output: ShellOutput = shell.exec(&format!("qdel -W force {job_id}")).await?;
        if !output.stderr.is_empty() {
            debug!("Job {job_id} is gone: {}", output.stderr.trim());
            return Ok(());
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Read the ground-truth status file of one experiment working directory.
/// An empty read normalises to `unknown`.
///
/// # Errors
///
/// - Will fail if the channel itself fails.
pub async fn read_status<S>(shell: &S, workdir: &str) -> Result<String>
where
    S: RemoteShell + ?Sized,
{
    let output = shell.exec(&format!("cat {workdir}/{STATUS_FILE}")).await?;
    let status = output.stdout.trim();
    if status.is_empty() {
        return Ok("unknown".into());
    }

    Ok(status.to_string())
}
