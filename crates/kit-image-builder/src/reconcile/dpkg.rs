use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::{CmdOutput, ExecCtx};
use crate::image::chroot::Target;
use crate::reconcile::{ArtifactInspector, PackageManager, RecordStore};

/// Directory, relative to a root filesystem, holding one `<name>.sha256` per package.
pub const IMAGE_RECORDS_DIR: &str = "var/lib/kit-image/packages";
/// Where artifacts are staged inside an image root so `dpkg` in the chroot can see them.
const IMAGE_STAGING_DIR: &str = "tmp/kit-image";

/// `dpkg` on the host or inside a chrooted image root.
pub struct DpkgManager<'a> {
    ctx: &'a ExecCtx,
    target: Target,
}

impl<'a> DpkgManager<'a> {
    pub fn new(ctx: &'a ExecCtx, target: Target) -> Self {
        Self { ctx, target }
    }

    fn cmd(&self, tool: &str, args: &[&str]) -> Result<Command> {
        let program = self.target.tool(tool);
        let mut argv = vec![program.as_str()];
        argv.extend_from_slice(args);
        self.target.command(&argv)
    }

    fn installed_from_query(&self, out: &CmdOutput) -> Result<bool> {
        if out.success() {
            return Ok(status_is_installed(&out.stdout));
        }
        // dpkg-query exits 1 for names it has never seen; anything else means the
        // database (or the chroot around it) could not be read.
        if out.status.code() == Some(1) {
            return Ok(false);
        }
        self.ctx.log_stderr(&out.stderr);
        Err(Error::command("dpkg-query", out.status))
    }
}

impl PackageManager for DpkgManager<'_> {
    fn is_installed(&self, name: &str) -> Result<bool> {
        let out = self
            .ctx
            .capture_cmd(self.cmd("dpkg-query", &["-W", "-f=${Status}", name])?)?;
        self.installed_from_query(&out)
    }

    fn install(&self, artifact: &Path) -> Result<()> {
        let Some(root) = self.target.root() else {
            let path = artifact.to_string_lossy();
            return self.ctx.run_cmd(self.cmd("dpkg", &["-i", &path])?);
        };

        let file_name = artifact
            .file_name()
            .ok_or_else(|| Error::msg(format!("artifact has no file name: {}", artifact.display())))?;
        let staging = root.join(IMAGE_STAGING_DIR);
        fs::create_dir_all(&staging)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", staging.display())))?;
        let staged = staging.join(file_name);
        fs::copy(artifact, &staged).map_err(|e| {
            Error::msg(format!(
                "failed to stage {} into image: {e}",
                artifact.display()
            ))
        })?;

        let in_image = format!("/{IMAGE_STAGING_DIR}/{}", file_name.to_string_lossy());
        let res = self.ctx.run_cmd(self.cmd("dpkg", &["-i", &in_image])?);
        if let Err(e) = fs::remove_file(&staged) {
            tracing::warn!("failed to remove staged {}: {e}", staged.display());
        }
        res
    }

    fn purge(&self, name: &str) -> Result<()> {
        self.ctx
            .run_cmd(self.cmd("dpkg", &["--purge", "--force-depends", name])?)
    }
}

fn status_is_installed(status: &str) -> bool {
    // "${Status}" is "<want> <error> <state>", e.g. "install ok installed";
    // "deinstall ok config-files" means only conffiles remain.
    status.split_whitespace().last() == Some("installed")
}

/// Reads the `Package` field with `dpkg-deb`, always on the host.
pub struct DebInspector<'a> {
    ctx: &'a ExecCtx,
}

impl<'a> DebInspector<'a> {
    pub fn new(ctx: &'a ExecCtx) -> Self {
        Self { ctx }
    }
}

impl ArtifactInspector for DebInspector<'_> {
    fn package_name(&self, artifact: &Path) -> Result<String> {
        let mut cmd = Command::new("dpkg-deb");
        cmd.arg("-f").arg(artifact).arg("Package");
        let name = self.ctx.capture_ok(cmd)?.trim().to_string();
        validate_package_name(&name)
            .map_err(|e| e.context(format!("reading {}", artifact.display())))?;
        Ok(name)
    }
}

pub fn validate_package_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.')
    });
    if !first_ok || !rest_ok {
        return Err(Error::msg(format!("invalid package name '{name}'")));
    }
    Ok(())
}

/// Plain-text records: `<dir>/<name>.sha256` containing just the fingerprint.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    dir: PathBuf,
}

impl FileRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The record directory inside an image root.
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(IMAGE_RECORDS_DIR))
    }

    pub fn record_path(&self, name: &str) -> Result<PathBuf> {
        validate_package_name(name)?;
        Ok(self.dir.join(format!("{name}.sha256")))
    }
}

impl RecordStore for FileRecordStore {
    fn read(&self, name: &str) -> Result<Option<String>> {
        let p = self.record_path(name)?;
        match fs::read_to_string(&p) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::msg(format!("failed to read {}: {e}", p.display()))),
        }
    }

    fn write(&self, name: &str, fingerprint: &str) -> Result<()> {
        let p = self.record_path(name)?;
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", self.dir.display())))?;
        // Write-then-rename so an interrupted run never leaves a truncated fingerprint.
        let tmp = p.with_extension("sha256.tmp");
        fs::write(&tmp, fingerprint)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &p)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
    }
}
