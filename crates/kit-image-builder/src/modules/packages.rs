use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use kit_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util::{self, default_true};
use crate::reconcile::dpkg::validate_package_name;
use crate::reconcile::fingerprint_file;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Direct,
    Docker,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Direct => "direct",
            Engine::Docker => "docker",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackageItem {
    /// Output file stem: the build produces `<debs>/<name>.deb`.
    pub name: String,
    /// Package tree containing `DEBIAN/control`.
    pub dir: String,
}

#[Task(
    id = "packages.build",
    module = "packages",
    phase = "packages",
    provides = ["packages:built"],
    after = ["core.init"],
    label = "Build packages"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub engine: Engine,
    pub docker_image: String,
    pub parallel: bool,
    pub items: Vec<PackageItem>,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            engine: Engine::Direct,
            docker_image: "debian:bookworm-slim".into(),
            parallel: false,
            items: Vec::new(),
        }
    }
}

#[Module(id = "packages", tasks = [PackagesConfig])]
pub struct PackagesModule;

impl PackagesConfig {
    pub fn load(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("packages")?.unwrap_or_default())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for item in &self.items {
            validate_package_name(item.name.trim())
                .map_err(|e| e.context("packages.items[].name"))?;
            if item.dir.trim().is_empty() {
                return Err(Error::msg(format!(
                    "packages.items[{}].dir is empty",
                    item.name
                )));
            }
            if !seen.insert(item.name.trim()) {
                return Err(Error::msg(format!(
                    "packages.items: duplicate name '{}'",
                    item.name
                )));
            }
        }
        if self.engine == Engine::Docker && self.docker_image.trim().is_empty() {
            return Err(Error::msg("packages.docker_image is empty"));
        }
        Ok(())
    }

    /// Artifacts this config produces, in declaration order.
    pub fn artifact_paths(&self, debs_dir: &Path) -> Vec<PathBuf> {
        self.items
            .iter()
            .map(|i| debs_dir.join(format!("{}.deb", i.name.trim())))
            .collect()
    }

    fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let debs = util::debs_dir(doc, ctx)?;
        util::ensure_dir(&debs)?;

        let mut jobs = Vec::with_capacity(cfg.items.len());
        for (item, out) in cfg.items.iter().zip(cfg.artifact_paths(&debs)) {
            let src = ws.resolve_config_path(&item.dir)?;
            if !src.join("DEBIAN/control").is_file() {
                return Err(Error::msg(format!(
                    "package '{}': {} has no DEBIAN/control",
                    item.name,
                    src.display()
                )));
            }
            jobs.push((item.name.trim().to_string(), build_command(cfg, &src, &out)?, out));
        }

        run_builds(ctx, &jobs, cfg.parallel)?;

        let mut built = Vec::new();
        for (name, _, out) in &jobs {
            built.push(serde_json::json!({
                "name": name,
                "path": out.display().to_string(),
                "sha256": fingerprint_file(out)?,
            }));
        }
        util::write_json_pretty(
            &util::module_dir(doc, ctx, "packages")?.join("manifest.json"),
            &serde_json::json!({
                "engine": cfg.engine.as_str(),
                "packages": built,
            }),
        )
    }
}

type BuildJob = (String, Command, PathBuf);

fn run_builds(ctx: &ExecCtx, jobs: &[BuildJob], parallel: bool) -> Result<()> {
    if parallel && jobs.len() > 1 {
        ctx.log(&format!("building {} packages in parallel", jobs.len()));
        // Every job runs to completion; the first failure is reported afterwards.
        let results: Vec<Result<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|(name, cmd, _)| {
                    let mut local = ctx.clone();
                    local.set_task(format!("{}:{name}", ctx_task(ctx)));
                    let cmd = clone_command(cmd);
                    s.spawn(move || local.run_cmd(cmd))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::msg("package build thread panicked")))
                })
                .collect()
        });
        for ((name, _, _), res) in jobs.iter().zip(results) {
            res.map_err(|e| e.context(format!("building package '{name}'")))?;
        }
        return Ok(());
    }
    for (name, cmd, _) in jobs {
        ctx.log(&format!("building {name}"));
        ctx.run_cmd(clone_command(cmd))
            .map_err(|e| e.context(format!("building package '{name}'")))?;
    }
    Ok(())
}

fn ctx_task(ctx: &ExecCtx) -> String {
    ctx.current_task_id
        .clone()
        .unwrap_or_else(|| PackagesConfig::ID.to_string())
}

fn build_command(cfg: &PackagesConfig, src: &Path, out: &Path) -> Result<Command> {
    match cfg.engine {
        Engine::Direct => {
            let mut cmd = Command::new("dpkg-deb");
            cmd.arg("--build").arg("--root-owner-group").arg(src).arg(out);
            Ok(cmd)
        }
        Engine::Docker => {
            let file_name = out
                .file_name()
                .ok_or_else(|| Error::msg(format!("bad output path {}", out.display())))?
                .to_string_lossy()
                .into_owned();
            let out_dir = out
                .parent()
                .ok_or_else(|| Error::msg(format!("bad output path {}", out.display())))?;
            let mut cmd = Command::new("docker");
            cmd.args(["run", "--rm", "-v"])
                .arg(format!("{}:/src:ro", src.display()))
                .arg("-v")
                .arg(format!("{}:/out", out_dir.display()))
                .arg(cfg.docker_image.trim())
                .args(["dpkg-deb", "--build", "--root-owner-group", "/src"])
                .arg(format!("/out/{file_name}"));
            Ok(cmd)
        }
    }
}

fn clone_command(cmd: &Command) -> Command {
    let mut out = Command::new(cmd.get_program());
    out.args(cmd.get_args());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::render_cmd;

    fn cfg(src: &str) -> PackagesConfig {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn rejects_duplicate_and_invalid_names() {
        let dup = cfg("[[items]]\nname = \"foo\"\ndir = \"a\"\n[[items]]\nname = \"foo\"\ndir = \"b\"\n");
        assert!(dup.validate().is_err());
        assert!(cfg("[[items]]\nname = \"Foo\"\ndir = \"a\"\n").validate().is_err());
        assert!(cfg("[[items]]\nname = \"foo\"\n").validate().is_err());
    }

    #[test]
    fn engines_build_the_same_artifact_path() {
        let mut c = cfg("[[items]]\nname = \"aiy-board-info\"\ndir = \"pkgs/board\"\n");
        let out = Path::new("/w/build/debs/aiy-board-info.deb");
        assert_eq!(c.artifact_paths(Path::new("/w/build/debs")), vec![out.to_path_buf()]);

        let direct = build_command(&c, Path::new("/w/pkgs/board"), out).unwrap();
        assert_eq!(
            render_cmd(&direct),
            "dpkg-deb --build --root-owner-group /w/pkgs/board /w/build/debs/aiy-board-info.deb"
        );

        c.engine = Engine::Docker;
        let docker = render_cmd(&build_command(&c, Path::new("/w/pkgs/board"), out).unwrap());
        assert!(docker.starts_with("docker run --rm -v /w/pkgs/board:/src:ro -v /w/build/debs:/out debian:bookworm-slim"), "{docker}");
        assert!(docker.ends_with("/src /out/aiy-board-info.deb"), "{docker}");
    }

    fn sh_job(name: &str, script: &str) -> BuildJob {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        (name.to_string(), cmd, PathBuf::from(format!("{name}.deb")))
    }

    #[test]
    fn parallel_builds_all_finish_before_the_first_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("slow-done");
        let jobs = vec![
            sh_job("slow", &format!("sleep 0.3; touch '{}'", marker.display())),
            sh_job("broken", "echo 'control file missing Package' >&2; exit 3"),
            sh_job("quick", "true"),
        ];
        let sink = std::sync::Arc::new(crate::executor::MemorySink::default());
        let ctx = ExecCtx::new(false, sink.clone());

        let err = run_builds(&ctx, &jobs, true).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("building package 'broken'"), "{err}");
        assert!(marker.is_file(), "slow job was not joined");
        assert!(
            sink.log_lines()
                .iter()
                .any(|l| l == "control file missing Package")
        );
    }

    #[test]
    fn sequential_builds_stop_at_the_first_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("never");
        let jobs = vec![
            sh_job("broken", "exit 4"),
            sh_job("later", &format!("touch '{}'", marker.display())),
        ];
        let ctx = ExecCtx::new(false, std::sync::Arc::new(crate::executor::MemorySink::default()));
        let err = run_builds(&ctx, &jobs, false).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(!marker.exists());
    }
}
