// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Length-prefixed message RPC.
//!
//! Both daemons speak the same wire protocol: a 4-byte big-endian length
//! prefix followed by one JSON frame. A frame is a request, a response, or a
//! heartbeat; the server emits a heartbeat on idle connections so clients
//! can tell a slow operation from a dead peer. Errors cross the wire as
//! `{kind, message}` with the stable taxonomy kinds of [`Error::kind`].

use crate::{Error, Result};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
};
use tracing::{debug, info, warn};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Method invocation.
    Request {
        /// Caller-chosen correlation id.
        id: u64,

        /// Operation name, camelCase on the wire.
        method: String,

        /// Operation payload.
        #[serde(default)]
        params: Value,
    },

    /// Invocation outcome.
    Response {
        /// Correlation id of the request this answers.
        id: u64,

        /// Successful result, when there is one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,

        /// Failure, when there is one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },

    /// Keep-alive emitted by the server while a connection is idle.
    Heartbeat,
}

/// Tagged error payload crossing the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Stable taxonomy kind.
    pub kind: String,

    /// Human-readable message.
    pub message: String,
}

impl From<&Error> for RpcError {
    fn from(error: &Error) -> Self {
        Self { kind: error.kind().into(), message: error.to_string() }
    }
}

/// Read one frame, or [`None`] on clean end of stream.
///
/// # Errors
///
/// - Return [`Error::Transport`] for oversized frames or a stream cut mid
///   frame.
/// - Return [`Error::Json`] for an undecodable payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(Error::Transport(format!("read failed: {error}"))),
    };

    if len > MAX_FRAME_LEN {
        return Err(Error::Transport(format!("frame of {len} bytes exceeds limit")));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|error| Error::Transport(format!("stream cut mid frame: {error}")))?;

    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Write one frame.
///
/// # Errors
///
/// - Return [`Error::Transport`] if the write fails.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Transport("frame too large to encode".into()))?;

    writer
        .write_u32(len)
        .await
        .map_err(|error| Error::Transport(format!("write failed: {error}")))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|error| Error::Transport(format!("write failed: {error}")))?;
    writer
        .flush()
        .await
        .map_err(|error| Error::Transport(format!("write failed: {error}")))?;

    Ok(())
}

/// Method dispatch implemented by each core.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handle one method invocation.
    ///
    /// # Errors
    ///
    /// - Errors are reported to the caller with their taxonomy kind; the
    ///   connection survives.
    async fn dispatch(&self, method: &str, payload: Value) -> Result<Value>;
}

/// Deserialize an operation payload. An omitted payload counts as an empty
/// parameter object.
///
/// # Errors
///
/// - Return [`Error::InvalidInput`] if the payload does not match the
///   operation's parameter shape.
pub fn params<T: DeserializeOwned>(payload: Value) -> Result<T> {
    let payload = match payload {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };

    serde_json::from_value(payload)
        .map_err(|error| Error::InvalidInput(format!("bad parameters: {error}")))
}

/// Accept connections forever, spawning one task per connection.
///
/// # Errors
///
/// - Return [`Error::Transport`] if accepting fails outright.
pub async fn serve<S: Service>(
    listener: TcpListener,
    service: Arc<S>,
    heartbeat: Duration,
) -> Result<()> {
    info!("Serving on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener
            .accept()
            .await
            .map_err(|error| Error::Transport(format!("accept failed: {error}")))?;
        debug!("Connection from {peer}");

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(error) = handle_connection(socket, service, heartbeat).await {
                warn!("Connection from {peer} dropped: {error}");
            }
        });
    }
}

async fn handle_connection<S: Service>(
    socket: tokio::net::TcpStream,
    service: Arc<S>,
    heartbeat: Duration,
) -> Result<()> {
    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    // The heartbeat runs beside the read loop so a half-received frame is
    // never abandoned mid-read.
    let beat_writer = Arc::clone(&writer);
    let beat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut writer = beat_writer.lock().await;
            if write_frame(&mut *writer, &Frame::Heartbeat).await.is_err() {
                return;
            }
        }
    });

    let outcome = async {
        loop {
            let Some(frame) = read_frame(&mut reader).await? else {
                return Ok(());
            };

            if let Frame::Request { id, method, params } = frame {
                debug!("Request {id}: {method}");
                let response = match service.dispatch(&method, params).await {
                    Ok(result) => Frame::Response { id, result: Some(result), error: None },
                    Err(error) => {
                        warn!("Request {id} ({method}) failed: {error}");
                        Frame::Response { id, result: None, error: Some((&error).into()) }
                    }
                };
                let mut writer = writer.lock().await;
                write_frame(&mut *writer, &response).await?;
            }
        }
    }
    .await;

    beat.abort();

    outcome
}
