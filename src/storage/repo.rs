// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Working-tree repository wrapper.
//!
//! Every application owns exactly one on-disk git repository whose working
//! tree all branch operations funnel through. The wrapper keeps the
//! repository protocol honest: callers mutate through [`AppRepo::on_branch`],
//! which checks the target branch out, runs the mutation, and restores the
//! default branch on every exit path before the storage lock is released.

use crate::{Error, Result};

use git2::{
    build::CheckoutBuilder, BranchType, IndexAddOption, ObjectType, Repository,
    RepositoryInitOptions,
};
use std::{
    collections::VecDeque,
    ffi::OsStr,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Name of the default branch every application repository is born with.
pub const DEFAULT_BRANCH: &str = "master";

/// One application repository plus its working tree.
pub struct AppRepo {
    repository: Repository,
    path: PathBuf,
}

impl AppRepo {
    /// Initialize a repository in `path` and commit everything already in it
    /// as the root revision.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if initialization or the root commit fails.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(DEFAULT_BRANCH);
        let repository = Repository::init_opts(&path, &opts)?;

        let mut config = repository.config()?;
        config.set_str("user.name", "expd storage")?;
        config.set_str("user.email", "storage@expd.invalid")?;
        drop(config);

        let repo = Self { repository, path };
        repo.commit_all("Application created")?;

        Ok(repo)
    }

    /// Open the repository housed in `path`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the path holds no repository.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let repository = Repository::open(&path)?;

        Ok(Self { repository, path })
    }

    /// Absolute path of the working tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the branch HEAD points at, lossy UTF-8.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if HEAD cannot be resolved.
    pub fn current_branch(&self) -> Result<String> {
        let shorthand = self.repository.head()?.shorthand_bytes().to_vec();

        Ok(String::from_utf8_lossy(shorthand.as_slice()).into_owned())
    }

    /// Check `branch` out, discarding untracked leftovers from the previous
    /// checkout.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the branch does not exist.
    /// - Return [`Error::Git2`] if the checkout itself fails.
    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.find_branch(branch)?;
        debug!("Checkout branch {branch:?} in {}", self.path.display());

        self.repository.set_head(&format!("refs/heads/{branch}"))?;
        let mut opts = CheckoutBuilder::new();
        opts.force().remove_untracked(true);
        self.repository.checkout_head(Some(&mut opts))?;

        Ok(())
    }

    /// Create branch `name` from the tip of branch `from`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::StateViolation`] if the branch already exists.
    /// - Return [`Error::NotFound`] if the parent branch does not exist.
    pub fn create_branch(&self, name: &str, from: &str) -> Result<()> {
        if self.repository.find_branch(name, BranchType::Local).is_ok() {
            return Err(Error::StateViolation(format!("branch {name:?} already exists")));
        }

        let parent = self.find_branch(from)?.get().peel_to_commit()?;
        self.repository.branch(name, &parent, false)?;

        Ok(())
    }

    /// Delete branch `name`.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the branch does not exist.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self.find_branch(name)?;
        branch.delete()?;

        Ok(())
    }

    /// Whether branch `name` exists.
    pub fn has_branch(&self, name: &str) -> bool {
        self.repository.find_branch(name, BranchType::Local).is_ok()
    }

    /// Stage every change in the working tree and commit it onto HEAD.
    ///
    /// Returns false without committing when the staged tree is identical to
    /// the parent commit's tree, which keeps replayed preparations from
    /// stacking empty commits.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] for any staging or commit failure.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        let mut index = self.repository.index()?;
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"], None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repository.find_tree(tree_id)?;

        let parent = match self.repository.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };

        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                debug!("Nothing to commit in {}", self.path.display());
                return Ok(false);
            }
        }

        let signature = self.repository.signature()?;
        let parents: Vec<_> = parent.iter().collect();
        self.repository.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;

        Ok(true)
    }

    /// Raw bytes of the file at `relpath` on the tip of `branch`, read
    /// straight out of the object database without touching the checkout.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the branch or the file is missing.
    /// - Return [`Error::InvalidInput`] if `relpath` resolves to a
    ///   directory.
    pub fn read_file(&self, branch: &str, relpath: &Path) -> Result<Vec<u8>> {
        let tree = self.find_branch(branch)?.get().peel_to_commit()?.tree()?;
        let entry = tree.get_path(relpath).map_err(|_| Error::NotFound {
            entity: "file",
            id: relpath.display().to_string(),
        })?;

        let object = entry.to_object(&self.repository)?;
        let blob = object
            .peel_to_blob()
            .map_err(|_| Error::InvalidInput(format!("{} is not a file", relpath.display())))?;

        Ok(blob.content().to_vec())
    }

    /// Every entry reachable from the tip of `branch` as a relative path and
    /// a directory flag.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if the branch is missing.
    /// - Return [`Error::Git2`] if the tree walk fails.
    pub fn list_entries(&self, branch: &str) -> Result<Vec<(PathBuf, bool)>> {
        let tree = self.find_branch(branch)?.get().peel_to_commit()?.tree()?;
        let mut entries = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_front((tree, PathBuf::new()));

        // Walk every subtree, recording directories ahead of their contents.
        while let Some((tree, path)) = queue.pop_front() {
            for entry in tree.iter() {
                let entry_path = path.join(bytes_to_path(entry.name_bytes()));
                match entry.kind() {
                    Some(ObjectType::Tree) => {
                        let subtree = self.repository.find_tree(entry.id())?;
                        entries.push((entry_path.clone(), true));
                        queue.push_front((subtree, entry_path));
                    }
                    Some(ObjectType::Blob) => entries.push((entry_path, false)),
                    _ => continue,
                }
            }
        }

        entries.sort();

        Ok(entries)
    }

    /// Run `operation` with `branch` checked out, then restore the default
    /// branch no matter how the operation went.
    ///
    /// # Errors
    ///
    /// - Will fail if the checkout, the operation, or the restore fails; the
    ///   restore is attempted even when the operation errors.
    pub fn on_branch<T>(
        &self,
        branch: &str,
        operation: impl FnOnce(&AppRepo) -> Result<T>,
    ) -> Result<T> {
        self.checkout(branch)?;
        let result = operation(self);
        let restored = self.checkout(DEFAULT_BRANCH);

        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(error), _) => Err(error),
            (Ok(_), Err(error)) => Err(error),
        }
    }

    fn find_branch(&self, name: &str) -> Result<git2::Branch<'_>> {
        self.repository.find_branch(name, BranchType::Local).map_err(|_| Error::NotFound {
            entity: "branch",
            id: name.into(),
        })
    }
}

impl std::fmt::Debug for AppRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AppRepo {{ path: {:?} }}", self.path)
    }
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> &Path {
    use std::os::unix::prelude::*;
    Path::new(OsStr::from_bytes(bytes))
}
#[cfg(windows)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::str;
    Path::new(str::from_utf8(bytes).unwrap())
}
