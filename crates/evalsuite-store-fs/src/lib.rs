#![allow(clippy::missing_errors_doc)]

//! Filesystem-backed blob store for suite configurations.
//!
//! Objects live under `{root}/{suite_id}/configs/{namespace}/{filename}`,
//! where the namespace is either `production` or `draft/<version>`. The
//! layout mirrors the object keys one to one, so a namespace can be
//! inspected with plain directory tools.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use evalsuite_core::{BlobVersionStore, Namespace, SuiteError, SuiteId};

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Opens the store rooted at `root`, creating the directory when it
    /// does not exist yet.
    pub fn open(root: &Path) -> Result<Self, SuiteError> {
        fs::create_dir_all(root).map_err(|err| {
            SuiteError::Storage(format!(
                "failed to create blob root {}: {err}",
                root.display()
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, suite: &SuiteId, namespace: Namespace) -> PathBuf {
        let mut dir = self.root.join(suite.to_string()).join("configs");
        match namespace {
            Namespace::Production => dir.push("production"),
            Namespace::Draft(version) => {
                dir.push("draft");
                dir.push(version.to_string());
            }
        }
        dir
    }

    fn validate_filename(filename: &str) -> Result<(), SuiteError> {
        let flat = !filename.is_empty()
            && !filename.contains('/')
            && !filename.contains('\\')
            && filename != "."
            && filename != "..";
        if flat {
            Ok(())
        } else {
            Err(SuiteError::Validation(format!(
                "invalid config filename '{filename}'"
            )))
        }
    }
}

impl BlobVersionStore for FsBlobStore {
    fn get(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
    ) -> Result<Vec<u8>, SuiteError> {
        Self::validate_filename(filename)?;
        let path = self.namespace_dir(suite, namespace).join(filename);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(SuiteError::NotFound(format!(
                "no config file '{filename}' under {namespace} for suite {suite}"
            ))),
            Err(err) => Err(SuiteError::Storage(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    fn put(
        &self,
        suite: &SuiteId,
        namespace: Namespace,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), SuiteError> {
        Self::validate_filename(filename)?;
        let dir = self.namespace_dir(suite, namespace);
        fs::create_dir_all(&dir).map_err(|err| {
            SuiteError::Storage(format!("failed to create {}: {err}", dir.display()))
        })?;
        let path = dir.join(filename);
        fs::write(&path, bytes).map_err(|err| {
            SuiteError::Storage(format!("failed to write {}: {err}", path.display()))
        })?;
        tracing::debug!(suite = %suite, %namespace, filename, "stored config file");
        Ok(())
    }

    fn list(&self, suite: &SuiteId, namespace: Namespace) -> Result<BTreeSet<String>, SuiteError> {
        let dir = self.namespace_dir(suite, namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // A namespace that was never written lists empty.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(SuiteError::Storage(format!(
                    "failed to list {}: {err}",
                    dir.display()
                )))
            }
        };

        let mut filenames = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                SuiteError::Storage(format!("failed to list {}: {err}", dir.display()))
            })?;
            let file_type = entry.file_type().map_err(|err| {
                SuiteError::Storage(format!("failed to list {}: {err}", dir.display()))
            })?;
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                filenames.insert(name.to_string());
            }
        }
        Ok(filenames)
    }
}
