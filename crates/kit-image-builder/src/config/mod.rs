use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub const ENV_BUILD_ENGINE: &str = "KIT_BUILD_ENGINE";
pub const ENV_CLEANUP: &str = "KIT_CLEANUP";
pub const ENV_PARALLEL_PACKAGES: &str = "KIT_PARALLEL_PACKAGES";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    /// Set `dotted.path = value`, creating intermediate tables.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        set_value_path(&mut self.value, path, value)
    }
}

fn set_value_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segs: Vec<&str> = path.split('.').map(str::trim).collect();
    if segs.iter().any(|s| s.is_empty()) {
        return Err(Error::msg(format!("invalid config path '{path}'")));
    }
    let mut cur = root;
    for seg in &segs[..segs.len() - 1] {
        let tbl = cur
            .as_table_mut()
            .ok_or_else(|| Error::msg(format!("config path '{path}' crosses a non-table value")))?;
        cur = tbl
            .entry(seg.to_string())
            .or_insert_with(|| Value::Table(Default::default()));
    }
    let tbl = cur
        .as_table_mut()
        .ok_or_else(|| Error::msg(format!("config path '{path}' crosses a non-table value")))?;
    tbl.insert(segs[segs.len() - 1].to_string(), value);
    Ok(())
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, table: &mut toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = table.remove("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::msg(format!(
            "imports in {} must be an array of strings",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    // Imports sit underneath the table that names them; local keys win.
    let imports = take_imports(file_path, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value_inner(&resolve_ref_path(file_path, &imp), stack)?;
            merge_values(&mut acc, loaded);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(tbl) = value.as_table_mut()
        && let Some(ext) = tbl.remove("extends")
    {
        let Some(ext) = ext.as_str() else {
            return Err(Error::msg(format!(
                "extends in {} must be a string",
                path.display()
            )));
        };
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }

    inline_imports(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

/// Load a build definition and apply `KIT_*` overrides from the process environment.
pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut doc = load_file(path)?;
    apply_env_overrides(&mut doc, |k| std::env::var(k).ok())?;
    Ok(doc)
}

/// Load a build definition without consulting the environment.
pub fn load_file(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Environment toggles tune modules the build file already enables; they never add one.
pub fn apply_env_overrides<F>(doc: &mut ConfigDoc, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(ENV_BUILD_ENGINE).filter(|s| !s.trim().is_empty()) {
        let engine = raw.trim().to_ascii_lowercase();
        if engine != "docker" && engine != "direct" {
            return Err(Error::msg(format!(
                "{ENV_BUILD_ENGINE}='{raw}' is invalid (expected 'docker' or 'direct')"
            )));
        }
        set_if_table(doc, ENV_BUILD_ENGINE, "packages", "engine", Value::String(engine))?;
    }
    if let Some(raw) = lookup(ENV_CLEANUP).filter(|s| !s.trim().is_empty()) {
        let v = parse_env_bool(ENV_CLEANUP, &raw)?;
        set_if_table(doc, ENV_CLEANUP, "output", "cleanup", Value::Boolean(v))?;
    }
    if let Some(raw) = lookup(ENV_PARALLEL_PACKAGES).filter(|s| !s.trim().is_empty()) {
        let v = parse_env_bool(ENV_PARALLEL_PACKAGES, &raw)?;
        set_if_table(doc, ENV_PARALLEL_PACKAGES, "packages", "parallel", Value::Boolean(v))?;
    }
    Ok(())
}

fn set_if_table(
    doc: &mut ConfigDoc,
    env_key: &str,
    table: &str,
    key: &str,
    value: Value,
) -> Result<()> {
    if !doc.has_table_path(table) {
        tracing::info!("{env_key} ignored: config has no [{table}] table");
        return Ok(());
    }
    doc.set_path(&format!("{table}.{key}"), value)
}

fn parse_env_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::msg(format!("{key}='{raw}' is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn doc_from(raw: &str) -> ConfigDoc {
        ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::from_str(raw).unwrap(),
        }
    }

    #[test]
    fn env_overrides_set_engine_cleanup_and_parallel() {
        let mut doc = doc_from("[packages]\nengine = \"direct\"\n[output]\n");
        let env: HashMap<&str, &str> = [
            (ENV_BUILD_ENGINE, "Docker"),
            (ENV_CLEANUP, "no"),
            (ENV_PARALLEL_PACKAGES, "1"),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut doc, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(
            doc.value_path("packages.engine").and_then(Value::as_str),
            Some("docker")
        );
        assert_eq!(
            doc.value_path("output.cleanup").and_then(Value::as_bool),
            Some(false)
        );
        assert_eq!(
            doc.value_path("packages.parallel").and_then(Value::as_bool),
            Some(true)
        );
    }

    #[test]
    fn env_overrides_never_create_module_tables() {
        let mut doc = doc_from("[base]\nimage = \"a.img\"\n");
        apply_env_overrides(&mut doc, |k| match k {
            ENV_BUILD_ENGINE => Some("docker".into()),
            ENV_CLEANUP | ENV_PARALLEL_PACKAGES => Some("1".into()),
            _ => None,
        })
        .unwrap();
        assert!(!doc.has_table_path("packages"));
        assert!(!doc.has_table_path("output"));
    }

    #[test]
    fn env_override_rejects_unknown_engine() {
        let mut doc = doc_from("");
        let err = apply_env_overrides(&mut doc, |k| {
            (k == ENV_BUILD_ENGINE).then(|| "podman".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(ENV_BUILD_ENGINE), "{err}");
    }

    #[test]
    fn extends_and_imports_merge_with_local_precedence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::write(
            root.join("base.toml"),
            "[output]\ncompress = true\nlevel = 6\n",
        )
        .unwrap();
        fs::write(root.join("boot.toml"), "set = { dtparam = \"audio=on\" }\n").unwrap();
        fs::write(
            root.join("kit.toml"),
            "extends = \"base.toml\"\n[output]\nlevel = 1\n[boot]\nimports = [\"boot.toml\"]\n",
        )
        .unwrap();

        let doc = load_file(&root.join("kit.toml")).unwrap();
        assert_eq!(
            doc.value_path("output.compress").and_then(Value::as_bool),
            Some(true)
        );
        assert_eq!(
            doc.value_path("output.level").and_then(Value::as_integer),
            Some(1)
        );
        assert_eq!(
            doc.value_path("boot.set.dtparam").and_then(Value::as_str),
            Some("audio=on")
        );
        assert!(doc.value_path("boot.imports").is_none());
    }

    #[test]
    fn import_cycles_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::write(root.join("a.toml"), "imports = [\"b.toml\"]\n").unwrap();
        fs::write(root.join("b.toml"), "imports = [\"a.toml\"]\n").unwrap();
        let err = load_file(&root.join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }
}
