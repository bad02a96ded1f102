use std::path::{Path, PathBuf};
use std::process::Command;

use kit_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::base::{RootSource, root_source};
use crate::modules::util::{self, default_true};
use crate::reconcile::fingerprint_file;
use crate::workspace::safe_remove_dir_all;

pub const DEFAULT_XZ_LEVEL: u32 = 3;

#[Task(
    id = "output.compress",
    module = "output",
    phase = "output",
    provides = ["output:image"],
    after = ["image:done"],
    label = "Publish image"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// File stem of the published image; `{build}` and `{version}` expand.
    pub name: String,
    #[serde(default = "default_true")]
    pub compress: bool,
    pub level: u32,
    /// Remove the build's scratch directory once the image is published.
    pub cleanup: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            name: "{build}".into(),
            compress: true,
            level: DEFAULT_XZ_LEVEL,
            cleanup: false,
        }
    }
}

#[Module(id = "output", tasks = [OutputConfig])]
pub struct OutputModule;

pub fn xz_command(path: &Path, level: u32) -> Command {
    let mut cmd = Command::new("xz");
    cmd.arg(format!("-{level}")).arg("--force").arg("-T0").arg(path);
    cmd
}

impl OutputConfig {
    fn validate(&self) -> Result<()> {
        if self.level > 9 {
            return Err(Error::msg(format!(
                "output.level {} is out of range (0-9)",
                self.level
            )));
        }
        let name = self.name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(Error::msg(format!(
                "output.name '{}' must be a plain file stem",
                self.name
            )));
        }
        Ok(())
    }

    fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let work_img = match root_source(doc, ctx)? {
            RootSource::Image(img) => img,
            RootSource::Dir(dir) => {
                ctx.log(&format!(
                    "root_dir mode ({}); no image to publish",
                    dir.display()
                ));
                return Ok(());
            }
        };
        if !work_img.is_file() {
            return Err(Error::msg(format!(
                "work image {} not found",
                work_img.display()
            )));
        }

        let out_dir = util::output_dir(doc, ctx)?;
        let stem = util::expand_build_template(doc, cfg.name.trim())?;
        let img = out_dir.join(format!("{stem}.img"));
        util::copy_file(&work_img, &img)?;

        let artifact: PathBuf = if cfg.compress {
            ctx.log(&format!("compressing {} (xz -{})", img.display(), cfg.level));
            ctx.run_cmd(xz_command(&img, cfg.level))?;
            img.with_extension("img.xz")
        } else {
            img
        };

        let sha256 = fingerprint_file(&artifact)?;
        let bytes = std::fs::metadata(&artifact)
            .map(|m| m.len())
            .map_err(|e| Error::msg(format!("failed to stat {}: {e}", artifact.display())))?;
        ctx.log(&format!("published {} ({sha256})", artifact.display()));

        util::write_json_pretty(
            &util::kit_run_dir(doc, ctx)?.join("manifest.json"),
            &serde_json::json!({
                "build": util::build_name(doc)?,
                "version": util::build_version(doc)?,
                "created_at": chrono::Utc::now().to_rfc3339(),
                "artifacts": [{
                    "path": artifact.display().to_string(),
                    "sha256": sha256,
                    "bytes": bytes,
                    "compressed": cfg.compress,
                }],
            }),
        )?;

        if cfg.cleanup {
            let ws = ctx.workspace_paths_or_init(doc)?;
            let work_dir = util::work_dir(doc, ctx)?;
            safe_remove_dir_all(&ws.build_dir, &work_dir)?;
            ctx.log(&format!("removed {}", work_dir.display()));
        }
        Ok(())
    }
}
