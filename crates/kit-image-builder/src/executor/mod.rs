use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::planner::{Graph, Plan};
use crate::workspace::{CleanMode, WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Default)]
struct SharedExecState {
    // core.init sets this; parallel task threads read it.
    workspace_paths: Mutex<Option<WorkspacePaths>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskSpawned {
        id: String,
    },
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Prints progress lines and a final summary; failed tasks get an error log file.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskSpawned { .. } => {}
            ExecEvent::TaskStarted { id } => {
                s.tasks_started += 1;
                s.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                s.log_lines += 1;
                append_task_log_line(&mut s.task_logs, &id, &line);
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok: true,
                elapsed_ms,
                ..
            } => {
                s.tasks_ok += 1;
                s.task_logs.remove(&id);
                println!("DONE: {id} ({elapsed_ms}ms)");
            }
            ExecEvent::TaskFinished {
                id,
                ok: false,
                error,
                elapsed_ms,
            } => {
                s.tasks_failed += 1;
                s.failed_tasks.push(id.clone());
                let err_text = error.unwrap_or_default();
                println!("FAIL: {id} ({elapsed_ms}ms) {err_text}");
                match write_task_error_log(&mut s, &id, &err_text, elapsed_ms) {
                    Ok(path) => println!("ERROR_LOG: {id} => {}", path.display()),
                    Err(e) => tracing::warn!("failed to write task error log for {id}: {e}"),
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: started={} ok={} failed={}",
                    s.tasks_started, s.tasks_ok, s.tasks_failed
                );
                println!("  logs: {}", s.log_lines);
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

/// Collects events in memory; used by tests and by callers that render their own output.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskLog { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for MemorySink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

/// Exit status plus captured output of a query-style command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    // Tasks may run without core.init (tests, single-task tools); never clean here.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }
        let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        ws.clean = CleanMode::None;
        let paths = crate::workspace::init_dirs(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    fn task_label(&self) -> String {
        self.current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::TaskLog {
            id: self.task_label(),
            line: msg.to_string(),
        });
    }

    /// Copy a failed tool's stderr into the task log.
    pub fn log_stderr(&self, stderr: &str) {
        for line in stderr.lines() {
            let line = sanitize_log_line(line);
            if !line.is_empty() {
                self.log(&line);
            }
        }
    }

    /// Run a command to completion, streaming its sanitised output into the task log.
    /// A non-zero exit becomes `Error::Command` carrying the tool's exit code.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {}", render_cmd(&cmd)));
            return Ok(());
        }
        let program = program_name(&cmd);
        tracing::debug!(task = %self.task_label(), "exec: {}", render_cmd(&cmd));

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn '{program}': {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if line.is_empty() {
                continue;
            }
            self.log(&line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for '{program}' failed: {e}")))?;
        if !status.success() {
            return Err(Error::command(program, status));
        }
        Ok(())
    }

    /// Run a command and capture its output without failing on a non-zero exit.
    /// Ignores dry-run: callers use it for queries whose answer drives later steps.
    pub fn capture_cmd(&self, mut cmd: Command) -> Result<CmdOutput> {
        let program = program_name(&cmd);
        tracing::debug!(task = %self.task_label(), "query: {}", render_cmd(&cmd));
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("failed to spawn '{program}': {e}")))?;
        Ok(CmdOutput {
            status: out.status,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    /// `capture_cmd`, but a non-zero exit is a failure that surfaces the tool's stderr.
    pub fn capture_ok(&self, cmd: Command) -> Result<String> {
        let program = program_name(&cmd);
        let out = self.capture_cmd(cmd)?;
        if !out.success() {
            self.log_stderr(&out.stderr);
            return Err(Error::command(program, out.status));
        }
        Ok(out.stdout)
    }
}

pub fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

pub fn render_cmd(cmd: &Command) -> String {
    let mut out = program_name(cmd);
    for a in cmd.get_args() {
        out.push(' ');
        out.push_str(&a.to_string_lossy());
    }
    out
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskSpawned {
            id: task.id.clone(),
        });
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn execute_plan_parallel(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx_template: &ExecCtx,
    max_parallel: usize,
) -> Result<()> {
    if max_parallel <= 1 || ctx_template.dry_run {
        let mut ctx = ctx_template.clone();
        return execute_plan(doc, plan, reg, &mut ctx);
    }

    // Fail before spawning anything if an executor is missing.
    for task in plan.tasks() {
        if reg.get(&task.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    let doc = Arc::new(doc.clone());
    let Graph {
        mut incoming,
        outgoing,
    } = plan.graph()?;
    let total = incoming.len();
    let mut completed: BTreeSet<String> = BTreeSet::new();
    let mut ready: VecDeque<String> = incoming
        .iter()
        .filter_map(|(k, v)| (*v == 0).then(|| k.clone()))
        .collect();

    let (tx, rx) = mpsc::channel::<(String, Result<()>, u128)>();
    let mut running: HashMap<String, std::thread::JoinHandle<()>> = HashMap::new();
    let mut first_err: Option<Error> = None;

    while completed.len() < total {
        if first_err.is_some() && running.is_empty() {
            break;
        }

        while first_err.is_none() && running.len() < max_parallel {
            let Some(task_id) = ready.pop_front() else {
                break;
            };
            let Some(exec) = reg.get(&task_id) else {
                continue;
            };
            let tx = tx.clone();
            let doc = Arc::clone(&doc);
            let mut local_ctx = ctx_template.clone();
            local_ctx.sink.emit(ExecEvent::TaskSpawned {
                id: task_id.clone(),
            });
            let id = task_id.clone();
            let handle = std::thread::spawn(move || {
                local_ctx.sink.emit(ExecEvent::TaskStarted { id: id.clone() });
                local_ctx.set_task(id.clone());
                let start = Instant::now();
                let r = exec(&doc, &mut local_ctx);
                let _ = tx.send((id, r, start.elapsed().as_millis()));
            });
            running.insert(task_id, handle);
        }

        if running.is_empty() {
            if first_err.is_some() {
                break;
            }
            let remaining: Vec<String> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then(|| k.clone()))
                .collect();
            return Err(Error::msg(format!(
                "cannot make progress (cycle or unresolved deps); remaining: {}",
                remaining.join(", ")
            )));
        }

        let (done_id, res, elapsed_ms) = rx
            .recv()
            .map_err(|e| Error::msg(format!("executor recv failed: {e}")))?;
        if let Some(h) = running.remove(&done_id)
            && h.join().is_err()
            && first_err.is_none()
        {
            first_err = Some(Error::msg(format!("task '{done_id}' panicked")));
        }

        match res {
            Ok(()) => {
                ctx_template.sink.emit(ExecEvent::TaskFinished {
                    id: done_id.clone(),
                    ok: true,
                    error: None,
                    elapsed_ms,
                });
                for child in outgoing.get(&done_id).into_iter().flatten() {
                    if let Some(slot) = incoming.get_mut(child) {
                        *slot -= 1;
                        if *slot == 0 {
                            ready.push_back(child.clone());
                        }
                    }
                }
                completed.insert(done_id);
            }
            Err(e) => {
                ctx_template.sink.emit(ExecEvent::TaskFinished {
                    id: done_id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                if first_err.is_none() {
                    first_err = Some(e.context(format!("task '{done_id}' failed")));
                }
            }
        }
    }

    for (_, h) in running.drain() {
        let _ = h.join();
    }

    let outcome = match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    };
    ctx_template.sink.emit(ExecEvent::ExecutorDone {
        ok: outcome.is_ok(),
        error: outcome.as_ref().err().map(|e| e.to_string()),
    });
    outcome
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    use crate::modules;

    let mut reg = TaskRegistry::default();
    modules::core::CoreModule::register_tasks(&mut reg)?;
    modules::base::BaseModule::register_tasks(&mut reg)?;
    modules::packages::PackagesModule::register_tasks(&mut reg)?;
    modules::provision::ProvisionModule::register_tasks(&mut reg)?;
    modules::boot::BootModule::register_tasks(&mut reg)?;
    modules::output::OutputModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            // `\r` splits progress redraws (xz -v, docker pull) into separate lines.
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

fn append_task_log_line(
    task_logs: &mut BTreeMap<String, VecDeque<String>>,
    task_id: &str,
    line: &str,
) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_log_line(line));
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match state.error_logs_dir.clone() {
        Some(dir) => dir,
        None => {
            let dir = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("build")
                .join("error-logs")
                .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!(
                    "failed to create error logs dir {}: {e}",
                    dir.display()
                ))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in state.task_logs.get(task_id).into_iter().flatten() {
        body.push_str(line);
        body.push('\n');
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Task;

    fn doc() -> ConfigDoc {
        ConfigDoc {
            path: PathBuf::from("<mem>"),
            value: toml::Value::Table(Default::default()),
        }
    }

    fn task(id: &str, after: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: vec![],
        }
    }

    fn ok_task(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        ctx.log("ran");
        Ok(())
    }

    fn failing_task(_doc: &ConfigDoc, _ctx: &mut ExecCtx) -> Result<()> {
        Err(Error::Command {
            program: "dpkg".into(),
            code: Some(4),
            detail: "exit status: 4".into(),
        })
    }

    #[test]
    fn sequential_run_stops_at_first_failure_and_keeps_exit_code() {
        let mut plan = Plan::default();
        plan.add(task("a", &[])).unwrap();
        plan.add(task("b", &["a"])).unwrap();
        plan.add(task("c", &["b"])).unwrap();
        let mut reg = TaskRegistry::default();
        reg.add("a", ok_task).unwrap();
        reg.add("b", failing_task).unwrap();
        reg.add("c", ok_task).unwrap();

        let sink = Arc::new(MemorySink::default());
        let mut ctx = ExecCtx::new(false, sink.clone());
        let err = execute_plan(&doc(), &plan, &reg, &mut ctx).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(err.to_string().contains("task 'b' failed"), "{err}");
        assert_eq!(sink.log_lines(), vec!["ran".to_string()]);
    }

    #[test]
    fn parallel_run_completes_independent_tasks() {
        let mut plan = Plan::default();
        for id in ["a", "b", "c"] {
            plan.add(task(id, &[])).unwrap();
        }
        plan.add(task("d", &["a", "b", "c"])).unwrap();
        let mut reg = TaskRegistry::default();
        for id in ["a", "b", "c", "d"] {
            reg.add(id, ok_task).unwrap();
        }
        let sink = Arc::new(MemorySink::default());
        let ctx = ExecCtx::new(false, sink.clone());
        execute_plan_parallel(&doc(), &plan, &reg, &ctx, 3).unwrap();
        assert_eq!(sink.log_lines().len(), 4);
    }

    #[test]
    fn run_cmd_failure_reports_program_and_code() {
        let ctx = ExecCtx::new(false, Arc::new(MemorySink::default()));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 5");
        let err = ctx.run_cmd(cmd).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("'sh'"), "{err}");
    }

    #[test]
    fn dry_run_logs_instead_of_running() {
        let sink = Arc::new(MemorySink::default());
        let ctx = ExecCtx::new(true, sink.clone());
        let mut cmd = Command::new("false");
        cmd.arg("--nope");
        ctx.run_cmd(cmd).unwrap();
        assert_eq!(sink.log_lines(), vec!["DRY-RUN: false --nope".to_string()]);
    }
}
