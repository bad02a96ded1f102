//! Content-addressed package reconciliation.
//!
//! A package is (re)installed only when the SHA-256 of the artifact differs from the
//! fingerprint recorded at the last successful install. Version strings are never
//! consulted, so an identical rebuild is a no-op and a changed rebuild under the same
//! version is still picked up.

use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub mod dpkg;

pub use dpkg::{DebInspector, DpkgManager, FileRecordStore};

/// The system package database, as far as reconciliation needs it.
pub trait PackageManager {
    fn is_installed(&self, name: &str) -> Result<bool>;
    fn install(&self, artifact: &Path) -> Result<()>;
    /// Remove `name` even if other installed packages depend on it.
    fn purge(&self, name: &str) -> Result<()>;
}

/// Persisted fingerprints of the last successful install, keyed by package name.
pub trait RecordStore {
    fn read(&self, name: &str) -> Result<Option<String>>;
    fn write(&self, name: &str, fingerprint: &str) -> Result<()>;
}

/// Reads the declared package name out of an artifact.
pub trait ArtifactInspector {
    fn package_name(&self, artifact: &Path) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The package was absent and has been installed.
    Installed,
    /// Installed and recorded with the same fingerprint; nothing was done.
    UpToDate,
    /// Installed but unrecorded or recorded with another fingerprint; purged and reinstalled.
    Reinstalled { previous: Option<String> },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Installed => "installed",
            Outcome::UpToDate => "up-to-date",
            Outcome::Reinstalled { .. } => "reinstalled",
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, Outcome::UpToDate)
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub name: String,
    pub fingerprint: String,
    pub outcome: Outcome,
}

pub struct Reconciler<'a> {
    packages: &'a dyn PackageManager,
    records: &'a dyn RecordStore,
    inspector: &'a dyn ArtifactInspector,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        packages: &'a dyn PackageManager,
        records: &'a dyn RecordStore,
        inspector: &'a dyn ArtifactInspector,
    ) -> Self {
        Self {
            packages,
            records,
            inspector,
        }
    }

    pub fn reconcile(&self, artifact: &Path) -> Result<Report> {
        let name = self.inspector.package_name(artifact)?;
        let fingerprint = fingerprint_file(artifact)?;

        let outcome = if !self.packages.is_installed(&name)? {
            if self.records.read(&name)?.as_deref() == Some(fingerprint.as_str()) {
                tracing::warn!(
                    package = %name,
                    "record matches artifact but package is not installed; installing"
                );
            }
            self.packages.install(artifact)?;
            self.records.write(&name, &fingerprint)?;
            Outcome::Installed
        } else {
            let previous = self.records.read(&name)?;
            if previous.as_deref().unwrap_or("") == fingerprint {
                tracing::debug!(package = %name, "fingerprint unchanged");
                Outcome::UpToDate
            } else {
                match &previous {
                    None => tracing::info!(package = %name, "installed without a record; reinstalling"),
                    Some(old) => tracing::info!(
                        package = %name,
                        old = %short(old),
                        new = %short(&fingerprint),
                        "fingerprint changed; reinstalling"
                    ),
                }
                self.packages.purge(&name)?;
                self.packages.install(artifact)?;
                self.records.write(&name, &fingerprint)?;
                Outcome::Reinstalled { previous }
            }
        };

        tracing::info!(
            package = %name,
            outcome = %outcome.as_str(),
            fingerprint = %short(&fingerprint),
            "reconciled"
        );
        Ok(Report {
            name,
            fingerprint,
            outcome,
        })
    }
}

/// Lower-case hex SHA-256 of the whole file.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn short(fp: &str) -> &str {
    fp.get(..12).unwrap_or(fp)
}
