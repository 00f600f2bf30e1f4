// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Folder tree listings.
//!
//! Clients browse staged inputs, retrieved outputs, and experiment sources
//! as nested `{label, id, children}` nodes, where `id` is the path relative
//! to the listed root with a trailing `/` marking directories. Dotfiles are
//! hidden.

use crate::Result;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One node of a folder tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderNode {
    /// Entry name shown to the client.
    pub label: String,

    /// Path relative to the listed root; directories carry a trailing `/`.
    pub id: String,

    /// Child nodes, sorted by label.
    #[serde(default)]
    pub children: Vec<FolderNode>,
}

impl FolderNode {
    fn new(label: String, relative: &Path, is_dir: bool) -> Self {
        let mut id = relative.to_string_lossy().into_owned();
        if is_dir {
            id.push('/');
        }

        Self { label, id, children: Vec::new() }
    }
}

/// List a directory on disk as a folder tree.
///
/// Missing roots list as empty, which is what a client browsing a fresh
/// experiment expects to see.
///
/// # Errors
///
/// - Return [`Error::Io`] if a directory cannot be read.
///
/// [`Error::Io`]: crate::Error::Io
pub fn from_dir(root: &Path) -> Result<Vec<FolderNode>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    walk_dir(root, Path::new(""))
}

fn walk_dir(dir: &Path, relative: &Path) -> Result<Vec<FolderNode>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        let child_rel = relative.join(&name);
        let is_dir = entry.file_type()?.is_dir();
        let mut node = FolderNode::new(name, &child_rel, is_dir);
        if is_dir {
            node.children = walk_dir(&entry.path(), &child_rel)?;
        }

        nodes.push(node);
    }

    nodes.sort_by(|a, b| a.label.cmp(&b.label));

    Ok(nodes)
}

/// Build a folder tree out of a flat, sorted entry listing of relative paths
/// with directory flags, as produced by a repository tree walk.
pub fn from_entries(entries: &[(PathBuf, bool)]) -> Vec<FolderNode> {
    let mut roots: Vec<FolderNode> = Vec::new();

    for (path, is_dir) in entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        let name = name.to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        let node = FolderNode::new(name, path, *is_dir);
        let parents: Vec<String> = path
            .parent()
            .into_iter()
            .flat_map(|parent| parent.components())
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();

        insert_node(&mut roots, &parents, node);
    }

    sort_nodes(&mut roots);

    roots
}

fn insert_node(nodes: &mut Vec<FolderNode>, parents: &[String], node: FolderNode) {
    match parents.split_first() {
        None => nodes.push(node),
        Some((first, rest)) => {
            // A parent directory always precedes its contents in the sorted
            // entry listing, so the slot is already there unless the parent
            // itself was hidden.
            let Some(parent) = nodes.iter_mut().find(|child| &child.label == first) else {
                return;
            };
            insert_node(&mut parent.children, rest, node);
        }
    }
}

fn sort_nodes(nodes: &mut [FolderNode]) {
    nodes.sort_by(|a, b| a.label.cmp(&b.label));
    for node in nodes {
        sort_nodes(&mut node.children);
    }
}
