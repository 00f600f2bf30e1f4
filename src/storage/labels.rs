// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Label discovery and substitution.
//!
//! A label occurrence is the literal sequence `[[[NAME]]]` where `NAME` is
//! drawn from `[A-Za-z0-9_]+`. Discovery scans the regular files of a
//! checkout; substitution rewrites them with a composed label map at
//! execution preparation time. System labels are prefixed with `#`, which
//! keeps them out of the discoverable alphabet while still matching the
//! replacement syntax.

use crate::{
    store::{Application, Experiment},
    Result,
};

use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::LazyLock,
};
use tracing::debug;

static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[\[([A-Za-z0-9_]+)\]\]\]").unwrap());

/// Every label name occurring in `text`, deduplicated and sorted.
pub fn labels_in(text: &str) -> BTreeSet<String> {
    LABEL.captures_iter(text).map(|captures| captures[1].to_string()).collect()
}

/// Discover every label in the regular files of `dir`.
///
/// Only top-level regular files are scanned unless `recursive` is set, which
/// preserves the substitution scope the substitution pass uses. Files that
/// are not valid UTF-8 are skipped; labels live in text.
///
/// # Errors
///
/// - Return [`Error::Io`] if the directory cannot be read.
///
/// [`Error::Io`]: crate::Error::Io
pub fn discover(dir: &Path, recursive: bool) -> Result<BTreeSet<String>> {
    let mut labels = BTreeSet::new();
    for_each_regular_file(dir, recursive, &mut |path| {
        if let Ok(text) = std::fs::read_to_string(path) {
            let found = labels_in(&text);
            debug!("Labels in {}: {found:?}", path.display());
            labels.extend(found);
        }

        Ok(())
    })?;

    Ok(labels)
}

/// Replace every `[[[NAME]]]` with its mapped value, one left-to-right
/// textual replacement per label, no recursive expansion.
///
/// Labels absent from the map remain untouched.
pub fn substitute(text: &str, labels: &BTreeMap<String, String>) -> String {
    let mut output = text.to_string();
    for (label, value) in labels {
        let token = format!("[[[{label}]]]");
        output = output.replace(&token, value);
    }

    output
}

/// Substitute labels into the regular files of `dir`, rewriting each file
/// whose contents change.
///
/// # Errors
///
/// - Return [`Error::Io`] if a file cannot be read or rewritten.
///
/// [`Error::Io`]: crate::Error::Io
pub fn substitute_dir(
    dir: &Path,
    labels: &BTreeMap<String, String>,
    recursive: bool,
) -> Result<()> {
    for_each_regular_file(dir, recursive, &mut |path| {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Ok(());
        };

        let replaced = substitute(&text, labels);
        if replaced != text {
            debug!("Substituted labels in {}", path.display());
            std::fs::write(path, replaced)?;
        }

        Ok(())
    })
}

/// System labels resolved by the storage core for one execution.
///
/// The numeric labels render decimal, with `#TOTALCPUS` the product of nodes
/// and cpus.
pub fn system_labels(app: &Application, experiment: &Experiment) -> BTreeMap<String, String> {
    let env = &experiment.exec_env;
    let mut labels = BTreeMap::new();
    labels.insert("#EXPERIMENT_ID".into(), experiment.id.clone());
    labels.insert("#EXPERIMENT_NAME".into(), experiment.name.clone());
    labels.insert("#APPLICATION_ID".into(), app.id.clone());
    labels.insert("#APPLICATION_NAME".into(), app.name.clone());
    labels.insert("#INPUTPATH".into(), env.inputpath.clone());
    labels.insert("#LIBPATH".into(), env.libpath.clone());
    labels.insert("#TMPPATH".into(), env.tmppath.clone());
    labels.insert("#CPUS".into(), env.cpus.to_string());
    labels.insert("#NODES".into(), env.nodes.to_string());
    labels.insert("#TOTALCPUS".into(), (u64::from(env.nodes) * u64::from(env.cpus)).to_string());

    labels
}

/// Compose the label map applied at preparation time.
///
/// Declared application labels default to the empty string, user-supplied
/// values overlay them, and system labels always win over user labels with
/// the same key.
pub fn compose(
    declared: &[String],
    user: &BTreeMap<String, String>,
    system: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> =
        declared.iter().map(|label| (label.clone(), String::new())).collect();
    labels.extend(user.clone());
    labels.extend(system.clone());

    labels
}

fn for_each_regular_file(
    dir: &Path,
    recursive: bool,
    visit: &mut impl FnMut(&Path) -> Result<()>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_file() {
            visit(&path)?;
        } else if recursive && file_type.is_dir() && entry.file_name() != ".git" {
            for_each_regular_file(&path, recursive, visit)?;
        }
    }

    Ok(())
}
