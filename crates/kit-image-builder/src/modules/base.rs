use std::path::PathBuf;
use std::process::Command;

use kit_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::image::MountOptions;
use crate::modules::util::{self, default_true};
use crate::reconcile::fingerprint_file;

/// Where the image's root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSource {
    /// The work image produced by `base.verify`.
    Image(PathBuf),
    /// An already unpacked root filesystem; nothing gets mounted.
    Dir(PathBuf),
}

#[Task(
    id = "base.verify",
    module = "base",
    phase = "base",
    provides = ["image:base"],
    after = ["core.init"],
    label = "Verify base image",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Raspberry Pi OS image, `.img` or `.img.xz`.
    pub image: Option<String>,
    /// Expected SHA-256 of `image` as downloaded.
    pub sha256: Option<String>,
    /// Use this directory as the image root instead of mounting an image.
    pub root_dir: Option<String>,
    pub boot_partition: u32,
    pub root_partition: u32,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            image: None,
            sha256: None,
            root_dir: None,
            boot_partition: 1,
            root_partition: 2,
        }
    }
}

#[Module(id = "base", tasks = [BaseConfig])]
pub struct BaseModule;

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl BaseConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("base")?.unwrap_or_default())
    }

    fn validate(&self) -> Result<()> {
        match (non_empty(&self.image), non_empty(&self.root_dir)) {
            (Some(_), Some(_)) => {
                return Err(Error::msg("[base] set either image or root_dir, not both"));
            }
            (None, None) => return Err(Error::msg("[base] needs image or root_dir")),
            _ => {}
        }
        if let Some(sum) = non_empty(&self.sha256) {
            if non_empty(&self.image).is_none() {
                return Err(Error::msg("[base].sha256 requires [base].image"));
            }
            if sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::msg(format!(
                    "[base].sha256 '{sum}' is not a SHA-256 hex digest"
                )));
            }
        }
        if self.boot_partition == self.root_partition {
            return Err(Error::msg(
                "[base] boot_partition and root_partition must differ",
            ));
        }
        Ok(())
    }

    pub fn mount_options(&self, sudo: bool) -> MountOptions {
        MountOptions {
            boot_partition: self.boot_partition,
            root_partition: self.root_partition,
            sudo,
            ..MountOptions::default()
        }
    }

    fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let module_dir = util::module_dir(doc, ctx, "base")?;

        if let Some(dir) = non_empty(&cfg.root_dir) {
            let dir = ws.resolve_config_path(dir)?;
            if !dir.is_dir() {
                return Err(Error::msg(format!(
                    "[base].root_dir {} is not a directory",
                    dir.display()
                )));
            }
            ctx.log(&format!("using root directory {}", dir.display()));
            return util::write_json_pretty(
                &module_dir.join("manifest.json"),
                &serde_json::json!({ "root_dir": dir.display().to_string() }),
            );
        }

        let raw = non_empty(&cfg.image).ok_or_else(|| Error::msg("[base].image is empty"))?;
        let src = ws.resolve_config_path(raw)?;
        if !src.is_file() {
            return Err(Error::msg(format!(
                "base image {} not found (downloads are not supported; fetch it first)",
                src.display()
            )));
        }

        ctx.log(&format!("hashing {}", src.display()));
        let actual = fingerprint_file(&src)?;
        if let Some(expected) = non_empty(&cfg.sha256) {
            let expected = expected.to_ascii_lowercase();
            if expected != actual {
                return Err(Error::integrity(&src, &expected, &actual));
            }
            ctx.log("checksum ok");
        }

        let work_dir = util::work_dir(doc, ctx)?;
        util::ensure_dir(&work_dir)?;
        let work_img = util::work_image_path(doc, ctx)?;
        let is_xz = src.extension().is_some_and(|e| e == "xz");
        if is_xz {
            // xz -d names its output after the input minus `.xz`.
            let staged = work_img.with_extension("img.xz");
            util::copy_file(&src, &staged)?;
            let mut cmd = Command::new("xz");
            cmd.arg("-d").arg("--force").arg("-T0").arg(&staged);
            ctx.run_cmd(cmd)?;
        } else {
            util::copy_file(&src, &work_img)?;
        }
        ctx.log(&format!("work image: {}", work_img.display()));

        util::write_json_pretty(
            &module_dir.join("manifest.json"),
            &serde_json::json!({
                "source": src.display().to_string(),
                "source_sha256": actual,
                "decompressed": is_xz,
                "work_image": work_img.display().to_string(),
            }),
        )
    }
}

pub fn root_source(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<RootSource> {
    let cfg = BaseConfig::load(doc)?;
    match non_empty(&cfg.root_dir) {
        Some(dir) => {
            let ws = ctx.workspace_paths_or_init(doc)?;
            Ok(RootSource::Dir(ws.resolve_config_path(dir)?))
        }
        None => Ok(RootSource::Image(util::work_image_path(doc, ctx)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(src: &str) -> BaseConfig {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn needs_exactly_one_source() {
        assert!(cfg("").validate().is_err());
        assert!(cfg("image = \"a.img\"\nroot_dir = \"r\"\n").validate().is_err());
        cfg("image = \"a.img\"\n").validate().unwrap();
        cfg("root_dir = \"rootfs\"\n").validate().unwrap();
    }

    #[test]
    fn checksum_must_be_hex_and_needs_an_image() {
        let good = "a".repeat(64);
        cfg(&format!("image = \"a.img\"\nsha256 = \"{good}\"\n"))
            .validate()
            .unwrap();
        assert!(cfg("image = \"a.img\"\nsha256 = \"xyz\"\n").validate().is_err());
        assert!(
            cfg(&format!("root_dir = \"r\"\nsha256 = \"{good}\"\n"))
                .validate()
                .is_err()
        );
    }
}
