// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::FakeShell;

use expd::{
    config::MinionConfig,
    minion::{ClusterMinion, CreateInstance, CreateSize, ExperimentJob, ExperimentTarget},
    store::{
        Application, ExecEnvironment, Experiment, ExperimentStatus, Instance, Store, SystemSpec,
    },
};

use anyhow::Result;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

const CLOUD_JSON: &str = r#"{
    "images": [
        {"name": "standard", "workpath": "/work", "inputpath": "/input",
         "libpath": "/lib", "tmppath": "/tmp"}
    ],
    "sizes": [
        {"name": "small", "cpus": 4, "ram": 4096}
    ]
}"#;

fn minion_config() -> MinionConfig {
    MinionConfig {
        url: "ssh://front.example".into(),
        username: "galgo".into(),
        password: None,
        mongo: "mongodb://localhost".into(),
        db: "expd-test".into(),
        listen: "127.0.0.1:0".into(),
        op_timeout_secs: None,
        heartbeat_secs: 30,
    }
}

async fn logged_in_minion() -> expd::Result<(ClusterMinion<FakeShell>, FakeShell, Store)> {
    let store = Store::open_in_memory().await?;
    let shell = FakeShell::new();
    shell.push(CLOUD_JSON, "", 0);

    let minion = ClusterMinion::open(minion_config(), store.clone(), shell.clone()).await?;
    minion.login().await?;

    Ok((minion, shell, store))
}

fn application() -> Application {
    Application {
        id: "a1".into(),
        name: "wrf".into(),
        desc: String::new(),
        creation_script: "compile.sh".into(),
        execution_script: "run.sh".into(),
        labels: Vec::new(),
    }
}

fn experiment() -> Experiment {
    Experiment {
        id: "e1".into(),
        app_id: "a1".into(),
        name: "run-summer".into(),
        desc: String::new(),
        exec_env: ExecEnvironment::default(),
        labels: BTreeMap::new(),
        status: ExperimentStatus::Prepared,
        execution_id: Some("exec-1".into()),
        public_url: "git://storage.example:8237/a1".into(),
    }
}

async fn reserve_instance(minion: &ClusterMinion<FakeShell>) -> expd::Result<Instance> {
    let images = minion.get_images("").await?;
    let sizes = minion.get_sizes("").await?;

    minion
        .create_instance(CreateInstance {
            name: "master-node".into(),
            image_id: images[0].id.clone(),
            size_id: sizes[0].id.clone(),
        })
        .await
}

fn system_of(instance: &Instance) -> SystemSpec {
    SystemSpec { instances: vec![instance.id.clone(), "worker".into()], master: instance.id.clone() }
}

#[tokio::test]
async fn login_loads_catalog_and_is_idempotent() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;

    let images = minion.get_images("").await?;
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "standard");
    assert_eq!(images[0].minion, "front.example");

    let sizes = minion.get_sizes("").await?;
    assert_eq!(sizes.len(), 1);
    assert_eq!(sizes[0].cpus, 4);
    assert_eq!(sizes[0].ram, 4096);

    // A second login observes the open session and loads nothing again.
    minion.login().await?;
    assert_eq!(shell.commands(), vec!["cat cloud.json".to_string()]);

    Ok(())
}

#[tokio::test]
async fn create_size_and_catalog_filters() -> Result<()> {
    let (minion, _shell, _store) = logged_in_minion().await?;

    let size = minion
        .create_size(CreateSize { name: "hefty".into(), cpus: 16, ram: 65536 })
        .await?;

    let by_id = minion.get_sizes(&size.id).await?;
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].name, "hefty");

    let by_substring = minion.get_sizes("eft").await?;
    assert_eq!(by_substring.len(), 1);

    let nothing = minion.get_sizes("EFT").await?;
    assert!(nothing.is_empty());

    Ok(())
}

#[tokio::test]
async fn deploy_then_poll_tracks_status_file() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;
    let system = system_of(&instance);

    shell.push("", "", 0); // git clone
    shell.push("12077.front\n", "", 0); // qsub
    let job_id = minion
        .deploy_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system: system.clone(),
            execution_id: Some("exec-1".into()),
        })
        .await?;
    assert_eq!(job_id, "12077.front");

    let commands = shell.commands();
    assert_eq!(commands[1], "git clone -b exec-1 git://storage.example:8237/a1 /work/e1");
    assert!(commands[2].starts_with(". /etc/profile; . ~/.bash_profile; qsub -N compile-e1"));
    assert!(commands[2].contains("select=1:ncpus=4:mem=4096MB"));
    let script = shell.stdin_of(2).unwrap();
    assert!(script.contains(r#"echo -n "compiling" > EXPERIMENT_STATUS"#));
    assert!(script.contains("./compile.sh &> COMPILATION_LOG"));

    shell.push("compiling", "", 0);
    let status = minion
        .poll_experiment(ExperimentTarget { experiment: experiment(), system: system.clone() })
        .await?;
    assert_eq!(status, "compiling");

    shell.push("compiled", "", 0);
    let status = minion
        .poll_experiment(ExperimentTarget { experiment: experiment(), system: system.clone() })
        .await?;
    assert_eq!(status, "compiled");

    // An empty read normalises to unknown.
    shell.push("", "cat: /work/e1/EXPERIMENT_STATUS: No such file or directory", 1);
    let status = minion
        .poll_experiment(ExperimentTarget { experiment: experiment(), system })
        .await?;
    assert_eq!(status, "unknown");

    Ok(())
}

#[tokio::test]
async fn double_deploy_is_a_state_violation() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;
    let system = system_of(&instance);

    shell.push("", "", 0);
    shell.push("1.front\n", "", 0);
    minion
        .deploy_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system: system.clone(),
            execution_id: None,
        })
        .await?;
    let issued = shell.commands().len();

    let error = minion
        .deploy_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system,
            execution_id: None,
        })
        .await
        .unwrap_err();
    assert_eq!(error.kind(), "state-violation");

    // The rejected deploy never reached the cluster.
    assert_eq!(shell.commands().len(), issued);

    Ok(())
}

#[tokio::test]
async fn execute_requires_deploy_and_spans_the_system() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;
    let system = system_of(&instance);

    let premature = minion
        .execute_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system: system.clone(),
            execution_id: None,
        })
        .await;
    assert_eq!(premature.unwrap_err().kind(), "state-violation");

    shell.push("", "", 0);
    shell.push("1.front\n", "", 0);
    minion
        .deploy_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system: system.clone(),
            execution_id: None,
        })
        .await?;

    shell.push("2.front\n", "", 0);
    let job_id = minion
        .execute_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system: system.clone(),
            execution_id: None,
        })
        .await?;
    assert_eq!(job_id, "2.front");

    let commands = shell.commands();
    let submit = commands.last().unwrap();
    assert!(submit.contains("qsub -N exec-e1"));
    assert!(submit.contains("select=2:ncpus=4:mem=4096MB"));
    let script = shell.stdin_of(commands.len() - 1).unwrap();
    assert!(script.contains(r#"echo -n "executing" > EXPERIMENT_STATUS"#));
    assert!(script.contains("./run.sh &> EXECUTION_LOG"));

    let again = minion
        .execute_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system,
            execution_id: None,
        })
        .await;
    assert_eq!(again.unwrap_err().kind(), "state-violation");

    Ok(())
}

#[tokio::test]
async fn clean_experiment_frees_the_instance() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;
    let system = system_of(&instance);

    shell.push("", "", 0);
    shell.push("1.front\n", "", 0);
    minion
        .deploy_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system: system.clone(),
            execution_id: None,
        })
        .await?;

    shell.push("", "", 0); // rm -rf
    minion
        .clean_experiment(ExperimentTarget { experiment: experiment(), system: system.clone() })
        .await?;
    assert_eq!(shell.commands().last().unwrap(), "rm -rf /work/e1");

    // The instance accepts a fresh deployment afterwards.
    shell.push("", "", 0);
    shell.push("3.front\n", "", 0);
    let job_id = minion
        .deploy_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system,
            execution_id: None,
        })
        .await?;
    assert_eq!(job_id, "3.front");

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn clean_job_retries_until_the_queue_forgets() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;

    shell.push("", "", 0);
    shell.push("", "", 0);
    shell.push("", "qdel: Unknown Job Id 77.front", 1);
    minion.clean_job("77.front").await?;

    let qdels: Vec<String> = shell
        .commands()
        .into_iter()
        .filter(|command| command.starts_with("qdel"))
        .collect();
    assert_eq!(qdels, vec!["qdel -W force 77.front".to_string(); 3]);

    Ok(())
}

#[tokio::test]
async fn job_status_follows_qstat_stderr() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;

    shell.push("Job id: 77.front R", "", 0);
    assert_eq!(minion.get_job_status("77.front").await?, "running");

    shell.push("", "qstat: Unknown Job Id 77.front", 153);
    assert_eq!(minion.get_job_status("77.front").await?, "finished");

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn destroy_instance_cancels_its_job_and_drops_the_lock() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;
    let system = system_of(&instance);

    shell.push("", "", 0);
    shell.push("9.front\n", "", 0);
    minion
        .deploy_experiment(ExperimentJob {
            app: application(),
            experiment: experiment(),
            system,
            execution_id: None,
        })
        .await?;

    shell.push("", "qdel: Unknown Job Id 9.front", 1);
    minion.destroy_instance(&instance.id).await?;
    assert!(shell.commands().iter().any(|command| command == "qdel -W force 9.front"));

    assert!(minion.get_instances("").await?.is_empty());
    let gone = minion.execute_command(&instance.id, "hostname").await;
    assert_eq!(gone.unwrap_err().kind(), "state-violation");

    Ok(())
}

#[tokio::test]
async fn hostname_is_the_login_endpoint() -> Result<()> {
    let (minion, _shell, _store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;

    assert_eq!(minion.get_instance_hostname(&instance.id).await?, "front.example");

    Ok(())
}

#[tokio::test]
async fn restart_rehydrates_instance_locks() -> Result<()> {
    let (minion, shell, store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;
    drop(minion);

    // A fresh minion over the same store serialises against the same
    // instances without any re-registration step.
    let replacement = ClusterMinion::open(minion_config(), store, shell.clone()).await?;
    let output = replacement.execute_command(&instance.id, "hostname").await?;
    assert_eq!(output.status, 0);
    assert_eq!(shell.commands().last().unwrap(), "hostname");

    Ok(())
}

#[tokio::test]
async fn execute_script_pipes_through_a_shell() -> Result<()> {
    let (minion, shell, _store) = logged_in_minion().await?;
    let instance = reserve_instance(&minion).await?;

    shell.push("staged\n", "", 0);
    let output = minion
        .execute_script(&instance.id, "echo staged", Some("/work"))
        .await?;
    assert_eq!(output.stdout, "staged\n");
    assert_eq!(shell.commands().last().unwrap(), "cd /work && sh -s");
    assert_eq!(shell.stdin_of(shell.commands().len() - 1).unwrap(), "echo staged");

    Ok(())
}
