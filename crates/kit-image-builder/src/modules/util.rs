use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct BuildMetaConfig {
    name: Option<String>,
    version: Option<String>,
}

fn build_meta(doc: &ConfigDoc) -> Result<BuildMetaConfig> {
    Ok(doc.deserialize_path("build")?.unwrap_or_default())
}

/// `[build].name`, falling back to the config file stem.
pub fn build_name(doc: &ConfigDoc) -> Result<String> {
    let name = build_meta(doc)?
        .name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            doc.path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("build")
                .to_string()
        });
    Ok(name)
}

pub fn build_version(doc: &ConfigDoc) -> Result<Option<String>> {
    Ok(build_meta(doc)?
        .version
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned))
}

/// Expand `{build}` and `{version}` in user-provided names.
pub fn expand_build_template(doc: &ConfigDoc, raw: &str) -> Result<String> {
    let mut out = raw.replace("{build}", &build_name(doc)?);
    if out.contains("{version}") {
        let Some(version) = build_version(doc)? else {
            return Err(Error::msg(
                "name template uses '{version}' but [build].version is not set",
            ));
        };
        out = out.replace("{version}", &version);
    }
    Ok(out)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub sudo: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { sudo: true }
    }
}

pub fn host_config(doc: &ConfigDoc) -> Result<HostConfig> {
    Ok(doc.deserialize_path("host")?.unwrap_or_default())
}

/// `<out>/<build>/kit`: manifests and per-module records of this build.
pub fn kit_run_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    Ok(output_dir(doc, ctx)?.join("kit"))
}

/// `<out>/<build>`: where final artifacts land.
pub fn output_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    Ok(ws.out_dir.join(build_name(doc)?))
}

/// `<build>/<build-name>`: scratch space including the work image.
pub fn work_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    Ok(ws.build_dir.join(build_name(doc)?))
}

pub fn work_image_path(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    Ok(work_dir(doc, ctx)?.join("work.img"))
}

pub fn debs_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    Ok(ws.build_dir.join("debs"))
}

pub fn module_dir(doc: &ConfigDoc, ctx: &ExecCtx, module_id: &str) -> Result<PathBuf> {
    // Nested folders read nicer than dotted ids.
    let mut out = kit_run_dir(doc, ctx)?.join("modules");
    for seg in module_id.split('.').filter(|s| !s.is_empty()) {
        out = out.join(seg);
    }
    Ok(out)
}

pub fn validate_rel_like_path(p: &str) -> Result<()> {
    let path = p.trim();
    if path.is_empty() {
        return Err(Error::msg("path is empty"));
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!("path '{path}' contains '..'")));
    }
    Ok(())
}

/// Map an absolute in-image path (`/home/pi/.bashrc`) onto an image root on the host.
pub fn image_path(root: &Path, image_abs_path: &str) -> Result<PathBuf> {
    let abs = image_abs_path.trim();
    let Some(rel) = abs.strip_prefix('/') else {
        return Err(Error::msg(format!(
            "expected absolute image path, got '{image_abs_path}'"
        )));
    };
    let rel = rel.trim_start_matches('/');
    validate_rel_like_path(rel)?;
    Ok(root.join(rel))
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn read_text(p: &Path) -> Result<String> {
    fs::read_to_string(p).map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })
}

pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<usize> {
    if !src.is_dir() {
        return Err(Error::msg(format!(
            "source is not a directory: {}",
            src.display()
        )));
    }
    ensure_dir(dst)?;

    let mut files = 0;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&out)?;
        } else {
            copy_file(entry.path(), &out)?;
            files += 1;
        }
    }
    Ok(files)
}

pub fn set_mode(p: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(p, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::msg(format!("failed to chmod {}: {e}", p.display())))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (p, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, toml_src: &str) -> ConfigDoc {
        ConfigDoc {
            path: PathBuf::from(path),
            value: toml::from_str(toml_src).unwrap(),
        }
    }

    #[test]
    fn build_name_prefers_table_over_file_stem() {
        assert_eq!(
            build_name(&doc("/x/robot-kit.toml", "")).unwrap(),
            "robot-kit"
        );
        assert_eq!(
            build_name(&doc("/x/robot-kit.toml", "[build]\nname = \"aiy\"\n")).unwrap(),
            "aiy"
        );
    }

    #[test]
    fn malformed_build_table_is_an_error() {
        let d = doc("/x/robot-kit.toml", "[build]\nname = 5\n");
        let err = build_name(&d).unwrap_err().to_string();
        assert!(err.contains("'build'"), "{err}");
        assert!(build_version(&d).is_err());
    }

    #[test]
    fn templates_need_version_when_used() {
        let d = doc("/x/kit.toml", "[build]\nversion = \"1.2\"\n");
        assert_eq!(
            expand_build_template(&d, "{build}-{version}").unwrap(),
            "kit-1.2"
        );
        assert!(expand_build_template(&doc("/x/kit.toml", ""), "{version}").is_err());
    }

    #[test]
    fn image_paths_must_be_absolute_and_stay_inside_root() {
        let root = Path::new("/mnt/img");
        assert_eq!(
            image_path(root, "/home/pi/.bashrc").unwrap(),
            root.join("home/pi/.bashrc")
        );
        assert!(image_path(root, "home/pi").is_err());
        assert!(image_path(root, "/../etc/shadow").is_err());
    }
}
