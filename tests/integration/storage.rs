// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{write_source_tree, StorageFixture};

use expd::{
    storage::{
        repo::{AppRepo, DEFAULT_BRANCH},
        CreateApplication, CreateExperiment,
    },
    store::{Application, ExecEnvironment, ExperimentStatus},
};

use anyhow::Result;
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, path::Path, path::PathBuf};
use tempfile::TempDir;

async fn upload_application(fixture: &StorageFixture) -> expd::Result<Application> {
    let src = TempDir::new()?;
    write_source_tree(src.path())?;

    fixture
        .service
        .create_application(CreateApplication {
            name: "wrf".into(),
            desc: "weather model".into(),
            path: src.path().to_path_buf(),
            creation_script: "compile.sh".into(),
            execution_script: "run.sh".into(),
        })
        .await
}

fn experiment_request(app_id: &str) -> CreateExperiment {
    CreateExperiment {
        app_id: app_id.into(),
        name: "run-summer".into(),
        desc: String::new(),
        exec_env: ExecEnvironment {
            cpus: 4,
            nodes: 2,
            inputpath: "/data/input".into(),
            libpath: "/data/lib".into(),
            tmppath: "/scratch".into(),
        },
        labels: BTreeMap::new(),
    }
}

#[tokio::test]
async fn create_application_initialises_repository_and_discovers_labels() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let app = upload_application(&fixture).await?;

    assert_eq!(app.labels, vec!["X".to_string()]);
    assert!(fixture.app_dir(&app.id).join(".git").is_dir());
    assert!(fixture.root.path().join("apps").join(format!("{}.json", app.id)).is_file());

    let repo = AppRepo::open(fixture.app_dir(&app.id))?;
    assert_eq!(repo.current_branch()?, DEFAULT_BRANCH);

    let stored = fixture.service.get_application(&app.id).await?;
    assert_eq!(stored, app);

    Ok(())
}

#[tokio::test]
async fn create_application_rejects_missing_source_and_duplicate_name() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let _ = upload_application(&fixture).await?;

    let missing = fixture
        .service
        .create_application(CreateApplication {
            name: "other".into(),
            desc: String::new(),
            path: PathBuf::from("/definitely/not/here"),
            creation_script: "compile.sh".into(),
            execution_script: "run.sh".into(),
        })
        .await;
    assert_eq!(missing.unwrap_err().kind(), "input-invalid");

    let duplicate = upload_application(&fixture).await;
    assert_eq!(duplicate.unwrap_err().kind(), "state-violation");

    Ok(())
}

#[tokio::test]
async fn prepare_execution_substitutes_empty_label() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let app = upload_application(&fixture).await?;
    let experiment = fixture.service.create_experiment(experiment_request(&app.id)).await?;

    let execution = fixture
        .service
        .prepare_execution(&app.id, &experiment.id, "exec-1", BTreeMap::new())
        .await?;
    assert_eq!(execution.experiment_id, experiment.id);

    let bytes = fixture
        .service
        .get_experiment_code("exec-1", &app.id, Path::new("f.txt"))
        .await?;
    assert_eq!(String::from_utf8_lossy(&bytes), "hello !\n");

    // The working tree must be back on the default branch.
    let repo = AppRepo::open(fixture.app_dir(&app.id))?;
    assert_eq!(repo.current_branch()?, DEFAULT_BRANCH);

    // The document mirror moved forward.
    let stored = fixture.service.get_experiment(&experiment.id).await?;
    assert_eq!(stored.status, ExperimentStatus::Prepared);
    assert_eq!(stored.execution_id.as_deref(), Some("exec-1"));

    Ok(())
}

#[tokio::test]
async fn prepare_execution_resolves_system_labels() -> Result<()> {
    let fixture = StorageFixture::new().await?;

    let src = TempDir::new()?;
    std::fs::write(src.path().join("cpus.txt"), "cpus=[[[#CPUS]]]")?;
    std::fs::write(src.path().join("total.txt"), "n=[[[#TOTALCPUS]]]")?;
    std::fs::write(src.path().join("compile.sh"), "#!/bin/sh\nexit 0\n")?;
    std::fs::write(src.path().join("run.sh"), "#!/bin/sh\nexit 0\n")?;

    let app = fixture
        .service
        .create_application(CreateApplication {
            name: "mpi-bench".into(),
            desc: String::new(),
            path: src.path().to_path_buf(),
            creation_script: "compile.sh".into(),
            execution_script: "run.sh".into(),
        })
        .await?;
    let experiment = fixture.service.create_experiment(experiment_request(&app.id)).await?;

    fixture
        .service
        .prepare_execution(&app.id, &experiment.id, "exec-1", BTreeMap::new())
        .await?;

    let cpus = fixture
        .service
        .get_experiment_code("exec-1", &app.id, Path::new("cpus.txt"))
        .await?;
    assert_eq!(String::from_utf8_lossy(&cpus), "cpus=4");

    let total = fixture
        .service
        .get_experiment_code("exec-1", &app.id, Path::new("total.txt"))
        .await?;
    assert_eq!(String::from_utf8_lossy(&total), "n=8");

    Ok(())
}

#[tokio::test]
async fn prepare_execution_is_deterministic_and_rejects_existing_branch() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let app = upload_application(&fixture).await?;
    let experiment = fixture.service.create_experiment(experiment_request(&app.id)).await?;

    let mut labels = BTreeMap::new();
    labels.insert("X".to_string(), "world".to_string());

    fixture
        .service
        .prepare_execution(&app.id, &experiment.id, "exec-a", labels.clone())
        .await?;
    fixture
        .service
        .prepare_execution(&app.id, &experiment.id, "exec-b", labels.clone())
        .await?;

    let first =
        fixture.service.get_experiment_code("exec-a", &app.id, Path::new("f.txt")).await?;
    let second =
        fixture.service.get_experiment_code("exec-b", &app.id, Path::new("f.txt")).await?;
    assert_eq!(first, second);
    assert_eq!(String::from_utf8_lossy(&first), "hello world!\n");

    let replay = fixture
        .service
        .prepare_execution(&app.id, &experiment.id, "exec-a", labels)
        .await;
    assert_eq!(replay.unwrap_err().kind(), "state-violation");

    // Even the failure path leaves the working tree on the default branch.
    let repo = AppRepo::open(fixture.app_dir(&app.id))?;
    assert_eq!(repo.current_branch()?, DEFAULT_BRANCH);

    Ok(())
}

#[tokio::test]
async fn experiment_code_round_trip() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let app = upload_application(&fixture).await?;
    let experiment = fixture.service.create_experiment(experiment_request(&app.id)).await?;

    let payload = b"pi = 3.14\n".to_vec();
    fixture
        .service
        .put_experiment_code(&experiment.id, &app.id, Path::new("cfg/params.ini"), Some(payload.clone()))
        .await?;
    let bytes = fixture
        .service
        .get_experiment_code(&experiment.id, &app.id, Path::new("cfg/params.ini"))
        .await?;
    assert_eq!(bytes, payload);

    // Nil content keeps the directory alive through a marker file.
    fixture
        .service
        .put_experiment_code(&experiment.id, &app.id, Path::new("results"), None)
        .await?;
    let marker = fixture
        .service
        .get_experiment_code(&experiment.id, &app.id, Path::new("results/.gitkeep"))
        .await?;
    assert!(marker.is_empty());

    fixture
        .service
        .delete_experiment_code(&experiment.id, &app.id, Path::new("cfg"))
        .await?;
    let gone = fixture
        .service
        .get_experiment_code(&experiment.id, &app.id, Path::new("cfg/params.ini"))
        .await;
    assert_eq!(gone.unwrap_err().kind(), "not-found");

    let absolute = fixture
        .service
        .delete_experiment_code(&experiment.id, &app.id, Path::new("/etc/passwd"))
        .await;
    assert_eq!(absolute.unwrap_err().kind(), "input-invalid");

    Ok(())
}

#[tokio::test]
async fn experiment_input_round_trip_leaves_folder_unchanged() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let app = upload_application(&fixture).await?;
    let experiment = fixture.service.create_experiment(experiment_request(&app.id)).await?;

    let before = fixture.service.get_input_folder_tree(&experiment.id).await?;

    let staged = TempDir::new()?;
    let src = staged.path().join("grid.nc");
    std::fs::write(&src, b"netcdf")?;

    fixture
        .service
        .put_experiment_input(&experiment.id, Path::new("mesh/grid.nc"), &src)
        .await?;
    let tree = fixture.service.get_input_folder_tree(&experiment.id).await?;
    assert_eq!(tree[0].id, "mesh/");
    assert_eq!(tree[0].children[0].id, "mesh/grid.nc");

    fixture
        .service
        .delete_experiment_input(&experiment.id, Some(Path::new("mesh/grid.nc")))
        .await?;
    std::fs::remove_dir(fixture.root.path().join("input").join(&experiment.id).join("mesh"))?;

    let after = fixture.service.get_input_folder_tree(&experiment.id).await?;
    assert_eq!(before, after);

    // Nil path removes the whole staging folder.
    fixture.service.delete_experiment_input(&experiment.id, None).await?;
    assert!(!fixture.root.path().join("input").join(&experiment.id).exists());

    Ok(())
}

#[tokio::test]
async fn remove_experiment_restores_default_branch_state() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let app = upload_application(&fixture).await?;

    let repo = AppRepo::open(fixture.app_dir(&app.id))?;
    let before_entries = repo.list_entries(DEFAULT_BRANCH)?;
    let before_file = repo.read_file(DEFAULT_BRANCH, Path::new("f.txt"))?;
    drop(repo);

    let experiment = fixture.service.create_experiment(experiment_request(&app.id)).await?;
    fixture
        .service
        .prepare_execution(&app.id, &experiment.id, "exec-1", BTreeMap::new())
        .await?;
    fixture.service.remove_experiment(&app.id, &experiment.id).await?;

    let repo = AppRepo::open(fixture.app_dir(&app.id))?;
    assert_eq!(repo.current_branch()?, DEFAULT_BRANCH);
    assert!(!repo.has_branch(&experiment.id));
    assert!(!repo.has_branch("exec-1"));
    assert_eq!(repo.list_entries(DEFAULT_BRANCH)?, before_entries);
    assert_eq!(repo.read_file(DEFAULT_BRANCH, Path::new("f.txt"))?, before_file);

    assert!(!fixture.root.path().join("input").join(&experiment.id).exists());
    let gone = fixture.service.get_experiment(&experiment.id).await;
    assert_eq!(gone.unwrap_err().kind(), "not-found");

    Ok(())
}

#[tokio::test]
async fn startup_reconciliation_drops_dangling_documents() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let kept = upload_application(&fixture).await?;

    let dangling = Application {
        id: "app-without-directory".into(),
        name: "ghost".into(),
        desc: String::new(),
        creation_script: "compile.sh".into(),
        execution_script: "run.sh".into(),
        labels: Vec::new(),
    };
    fixture.store.insert_application(&dangling).await?;

    let service = fixture.reopen().await?;
    let apps = service.get_applications().await?;
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].id, kept.id);

    Ok(())
}

#[tokio::test]
async fn folder_trees_and_urls() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let app = upload_application(&fixture).await?;
    let experiment = fixture.service.create_experiment(experiment_request(&app.id)).await?;

    let tree = fixture
        .service
        .get_experiment_src_folder_tree(&experiment.id, &app.id)
        .await?;
    let labels: Vec<&str> = tree.iter().map(|node| node.label.as_str()).collect();
    assert_eq!(labels, vec!["compile.sh", "data", "f.txt", "run.sh"]);
    let data = tree.iter().find(|node| node.label == "data").unwrap();
    assert_eq!(data.id, "data/");
    assert_eq!(data.children[0].id, "data/grid.csv");

    assert_eq!(
        fixture.service.get_application_url(&app.id),
        format!("git://storage.example:8237/{}", app.id)
    );
    let input_url = fixture.service.get_experiment_input_url(&experiment.id);
    assert!(input_url.starts_with("galgo@storage.example:8237:/"));
    assert!(input_url.ends_with(&experiment.id));

    Ok(())
}

#[tokio::test]
async fn execution_output_file_defaults_and_errors() -> Result<()> {
    let fixture = StorageFixture::new().await?;

    let missing = fixture.service.get_execution_output_file("exec-1", None).await;
    assert_eq!(missing.unwrap_err().kind(), "not-found");

    let outdir = fixture.root.path().join("output").join("exec-1");
    std::fs::create_dir_all(&outdir)?;
    std::fs::write(outdir.join("output.tar.gz"), b"tarball")?;

    let found = fixture.service.get_execution_output_file("exec-1", None).await?;
    assert_eq!(found, outdir.join("output.tar.gz"));

    let absolute = fixture
        .service
        .get_execution_output_file("exec-1", Some(Path::new("/abs.tar.gz")))
        .await;
    assert_eq!(absolute.unwrap_err().kind(), "input-invalid");

    Ok(())
}
