use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::Module;
use crate::planner::{IMAGE_BARRIER_ID, Plan, Task};
use crate::workspace::{CleanMode, WorkspaceConfig};

pub const INIT_ID: &str = "core.init";

/// Top-level tables a build definition may contain.
pub const SUPPORTED_TABLES: [&str; 9] = [
    "core",
    "workspace",
    "build",
    "host",
    "base",
    "packages",
    "provision",
    "boot",
    "output",
];

// Keys the loader consumes; they never reach the planner as tables but may linger as values.
const LOADER_KEYS: [&str; 2] = ["extends", "imports"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        check_schema(doc)?;
        // Paths derive from the build name; a malformed [build] must fail before anything runs.
        crate::modules::util::build_name(doc)?;
        plan.add(Task {
            id: INIT_ID.into(),
            label: "Init workspace".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

impl ModuleExec for CoreModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(INIT_ID, core_init)?;
        reg.add(IMAGE_BARRIER_ID, core_barrier_image)
    }
}

pub fn check_schema(doc: &ConfigDoc) -> Result<()> {
    let Some(root) = doc.value.as_table() else {
        return Err(Error::msg("config root must be a table"));
    };
    for (key, value) in root {
        if LOADER_KEYS.contains(&key.as_str()) {
            continue;
        }
        if !value.is_table() {
            return Err(Error::msg(format!(
                "top-level key '{key}' must be a table"
            )));
        }
        if !SUPPORTED_TABLES.contains(&key.as_str()) {
            return Err(Error::msg(format!(
                "config table '{key}' is not supported; allowed tables: {}",
                SUPPORTED_TABLES.join(", ")
            )));
        }
    }
    Ok(())
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    ctx.set_task(INIT_ID);
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
    ctx.log(&format!("workspace.out_dir = {}", ws.out_dir));
    ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));
    if ctx.dry_run && ws.clean != CleanMode::None {
        ctx.log("DRY-RUN: skipping workspace clean");
        ws.clean = CleanMode::None;
    }

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.set_workspace_paths(paths.clone());
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    for (name, path) in &paths.named_dirs {
        ctx.log(&format!("workspace.paths.{name} = {}", path.display()));
    }
    Ok(())
}

fn core_barrier_image(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(IMAGE_BARRIER_ID);
    ctx.log("image barrier reached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn doc(src: &str) -> ConfigDoc {
        ConfigDoc {
            path: PathBuf::from("kit.toml"),
            value: toml::from_str(src).unwrap(),
        }
    }

    #[test]
    fn accepts_supported_tables() {
        check_schema(&doc("[base]\nimage = \"x.img\"\n[boot]\n[output]\n")).unwrap();
    }

    #[test]
    fn rejects_unknown_tables_and_stray_values() {
        let err = check_schema(&doc("[buildroot]\n")).unwrap_err().to_string();
        assert!(err.contains("'buildroot' is not supported"), "{err}");
        assert!(check_schema(&doc("name = \"x\"\n")).is_err());
    }
}
