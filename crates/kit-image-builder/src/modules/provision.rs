use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kit_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::image::chroot::{Target, chroot_command};
use crate::image::{ImageRoot, MountedImage, require_root};
use crate::modules::base::{BaseConfig, RootSource, root_source};
use crate::modules::packages::PackagesConfig;
use crate::modules::util::{self, default_true};
use crate::reconcile::{DebInspector, DpkgManager, FileRecordStore, Reconciler, Report};
use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileItem {
    /// Host file or directory; mutually exclusive with `content`.
    pub src: Option<String>,
    pub content: Option<String>,
    /// Absolute path inside the image.
    pub dst: String,
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptItem {
    pub name: Option<String>,
    pub run: String,
    pub env: BTreeMap<String, String>,
}

#[Task(
    id = "provision.run",
    module = "provision",
    phase = "provision",
    provides = ["image:provisioned"],
    after = ["image:base"],
    after_if = ["enabled:packages=packages:built"],
    label = "Provision image"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    /// Reconcile everything `[packages]` builds before `debs`.
    #[serde(default = "default_true")]
    pub include_built: bool,
    pub debs: Vec<String>,
    pub files: Vec<FileItem>,
    pub scripts: Vec<ScriptItem>,
    /// Environment for every script.
    pub env: BTreeMap<String, String>,
    /// Extra bind mounts, `host_path:/image/path`.
    pub mounts: Vec<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            include_built: true,
            debs: Vec::new(),
            files: Vec::new(),
            scripts: Vec::new(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
        }
    }
}

#[Module(id = "provision", tasks = [ProvisionConfig])]
pub struct ProvisionModule;

/// Parse `host:/image/path`.
pub fn parse_mount_spec(raw: &str) -> Result<(PathBuf, String)> {
    let (host, image) = raw
        .split_once(':')
        .ok_or_else(|| Error::msg(format!("mount '{raw}' must be HOST_PATH:IMAGE_PATH")))?;
    let (host, image) = (host.trim(), image.trim());
    if host.is_empty() || !image.starts_with('/') {
        return Err(Error::msg(format!(
            "mount '{raw}' must be HOST_PATH:IMAGE_PATH with an absolute image path"
        )));
    }
    Ok((PathBuf::from(host), image.to_string()))
}

impl ProvisionConfig {
    fn validate(&self) -> Result<()> {
        for f in &self.files {
            if !f.dst.trim().starts_with('/') {
                return Err(Error::msg(format!(
                    "provision.files[].dst must be an absolute image path, got '{}'",
                    f.dst
                )));
            }
            if f.src.is_some() == f.content.is_some() {
                return Err(Error::msg(format!(
                    "provision.files[] for '{}' needs exactly one of src or content",
                    f.dst
                )));
            }
        }
        for s in &self.scripts {
            if s.run.trim().is_empty() {
                return Err(Error::msg("provision.scripts[].run is empty"));
            }
        }
        for m in &self.mounts {
            parse_mount_spec(m)?;
        }
        Ok(())
    }

    fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let sudo = util::host_config(doc)?.sudo;
        let root = match root_source(doc, ctx)? {
            RootSource::Dir(dir) => ImageRoot::Dir(dir),
            RootSource::Image(img) => {
                require_root("mounting the work image")?;
                let ws = ctx.workspace_paths_or_init(doc)?;
                let mut opts = BaseConfig::load(doc)?.mount_options(sudo);
                for m in &cfg.mounts {
                    let (host, image) = parse_mount_spec(m)?;
                    opts.binds
                        .push((ws.resolve_config_path(&host.to_string_lossy())?, image));
                }
                ImageRoot::Mounted(MountedImage::open(ctx, &img, &opts)?)
            }
        };

        let res = provision_root(cfg, doc, ctx, root.path(), sudo);
        let closed = root.close();
        let reports = res?;
        closed?;

        let reports: Vec<serde_json::Value> = reports
            .iter()
            .map(|r| {
                serde_json::json!({
                    "package": r.name,
                    "sha256": r.fingerprint,
                    "outcome": r.outcome.as_str(),
                })
            })
            .collect();
        util::write_json_pretty(
            &util::module_dir(doc, ctx, "provision")?.join("manifest.json"),
            &serde_json::json!({
                "packages": reports,
                "files": cfg.files.iter().map(|f| f.dst.clone()).collect::<Vec<_>>(),
                "scripts": cfg.scripts.len(),
            }),
        )
    }
}

/// Reconcile packages, install files, then run scripts, all against `root`.
pub fn provision_root(
    cfg: &ProvisionConfig,
    doc: &ConfigDoc,
    ctx: &ExecCtx,
    root: &Path,
    sudo: bool,
) -> Result<Vec<Report>> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let mut debs = Vec::new();
    if cfg.include_built {
        let packages = PackagesConfig::load(doc)?;
        if packages.enabled {
            debs.extend(packages.artifact_paths(&util::debs_dir(doc, ctx)?));
        }
    }
    for raw in &cfg.debs {
        debs.push(ws.resolve_config_path(raw)?);
    }

    let mut reports = Vec::with_capacity(debs.len());
    if !debs.is_empty() {
        let dpkg = DpkgManager::new(
            ctx,
            Target::Chroot {
                root: root.to_path_buf(),
                sudo,
            },
        );
        let records = FileRecordStore::in_root(root);
        let inspector = DebInspector::new(ctx);
        let reconciler = Reconciler::new(&dpkg, &records, &inspector);
        for deb in &debs {
            let report = reconciler
                .reconcile(deb)
                .map_err(|e| e.context(format!("reconciling {}", deb.display())))?;
            ctx.log(&format!("{}: {}", report.name, report.outcome.as_str()));
            reports.push(report);
        }
    }

    for f in &cfg.files {
        install_file(ctx, &ws, f, root)?;
    }

    for (i, s) in cfg.scripts.iter().enumerate() {
        let name = s.name.clone().unwrap_or_else(|| format!("script #{}", i + 1));
        ctx.log(&format!("running {name}"));
        let env: Vec<(String, String)> = cfg
            .env
            .iter()
            .chain(s.env.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let cmd = chroot_command(root, &["bin/bash", "-c", s.run.as_str()], &env, sudo)?;
        ctx.run_cmd(cmd).map_err(|e| e.context(format!("running {name}")))?;
    }
    Ok(reports)
}

fn install_file(ctx: &ExecCtx, ws: &WorkspacePaths, f: &FileItem, root: &Path) -> Result<()> {
    let dst = util::image_path(root, &f.dst)?;
    match (&f.src, &f.content) {
        (Some(src), None) => {
            let src = ws.resolve_config_path(src)?;
            if src.is_dir() {
                let n = util::copy_dir_all(&src, &dst)?;
                ctx.log(&format!("{} -> {} ({n} files)", src.display(), f.dst));
            } else {
                util::copy_file(&src, &dst)?;
                ctx.log(&format!("{} -> {}", src.display(), f.dst));
            }
        }
        (None, Some(content)) => {
            util::write_text(&dst, content)?;
            ctx.log(&format!("wrote {}", f.dst));
        }
        _ => {
            return Err(Error::msg(format!(
                "file entry for '{}' needs exactly one of src or content",
                f.dst
            )));
        }
    }
    if let Some(mode) = f.mode {
        util::set_mode(&dst, mode)?;
    }
    Ok(())
}
