// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! General utilities.
//!
//! Provides the shared wrapper for calling external programs. Both daemons
//! shell out: the storage daemon for `cp -al` input staging and `scp` output
//! retrieval, the minion daemon for every `ssh` channel it opens.

use crate::{Error, Result};

use std::ffi::OsStr;
use std::process::Output;
use tracing::debug;

/// Call an external program non-interactively and collect both streams.
///
/// The combined output of stdout and stderr is labeled "stdout: {stdout}"
/// and "stderr: {stderr}" in the returned string respectively, which makes
/// it easy to extract either stream for further processing. Trailing
/// newlines are chomped.
///
/// # Errors
///
/// - Return [`Error::Io`] if the program cannot be spawned at all.
/// - Return [`Error::RemoteTool`] if the program exits non-zero; the error
///   carries the combined output.
pub async fn syscall(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let args: Vec<_> = args.into_iter().map(|arg| arg.as_ref().to_os_string()).collect();
    debug!("Syscall: {:?} {args:?}", cmd.as_ref());

    let output = tokio::process::Command::new(cmd.as_ref())
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?;
    let message = format_output(&output);

    if !output.status.success() {
        return Err(Error::RemoteTool {
            program: cmd.as_ref().to_string_lossy().into_owned(),
            message,
        });
    }

    Ok(message)
}

/// Combine both streams of a finished process into one labeled string.
pub(crate) fn format_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message);

    message
}
