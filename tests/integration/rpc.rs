// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{write_source_tree, StorageFixture};

use expd::rpc::{read_frame, serve, write_frame, Frame};

use anyhow::Result;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};

async fn call(socket: &mut TcpStream, id: u64, method: &str, params: Value) -> Result<Frame> {
    write_frame(socket, &Frame::Request { id, method: method.into(), params }).await?;

    loop {
        let frame = read_frame(socket).await?.expect("connection closed");
        if !matches!(frame, Frame::Heartbeat) {
            return Ok(frame);
        }
    }
}

#[tokio::test]
async fn storage_core_speaks_the_wire_protocol() -> Result<()> {
    let fixture = StorageFixture::new().await?;
    let service = Arc::new(fixture.reopen().await?);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, service, Duration::from_secs(30)));

    let src = TempDir::new()?;
    write_source_tree(src.path())?;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    let response = call(
        &mut socket,
        1,
        "createApplication",
        json!({
            "name": "wrf",
            "desc": "weather model",
            "path": src.path(),
            "creation_script": "compile.sh",
            "execution_script": "run.sh",
        }),
    )
    .await?;

    let app_id = match response {
        Frame::Response { id: 1, result: Some(app), error: None } => {
            assert_eq!(app["name"], "wrf");
            assert_eq!(app["labels"], json!(["X"]));
            app["id"].as_str().unwrap().to_string()
        }
        other => panic!("unexpected response: {other:?}"),
    };

    let response = call(&mut socket, 2, "discoverLabels", json!({ "app_id": app_id })).await?;
    assert_eq!(
        response,
        Frame::Response { id: 2, result: Some(json!(["X"])), error: None }
    );

    let response = call(&mut socket, 3, "getApplication", json!({ "app_id": "nope" })).await?;
    match response {
        Frame::Response { id: 3, result: None, error: Some(error) } => {
            assert_eq!(error.kind, "not-found");
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let response =
        call(&mut socket, 4, "getApplicationURL", json!({ "app_id": app_id })).await?;
    assert_eq!(
        response,
        Frame::Response {
            id: 4,
            result: Some(json!(format!("git://storage.example:8237/{app_id}"))),
            error: None,
        }
    );

    Ok(())
}
