use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use kit_image_builder::config::{self, ConfigDoc};
use kit_image_builder::executor::{self, ExecCtx, StdoutSink};
use kit_image_builder::image::chroot::{Target, chroot_command};
use kit_image_builder::image::{MountOptions, MountedImage, require_root};
use kit_image_builder::modules::{self, provision::parse_mount_spec};
use kit_image_builder::reconcile::{DebInspector, DpkgManager, FileRecordStore, Reconciler};
use kit_image_builder::{Error, Result, workspace};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the image described by a kit definition into OUT_DIR
    Build {
        out_dir: PathBuf,
        /// Path to a build definition TOML
        #[arg(long, default_value = "kit.toml")]
        config: PathBuf,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
        /// Max number of tasks to execute concurrently (0 = use CPU count)
        #[arg(long, default_value_t = 1)]
        max_parallel: usize,
    },
    /// Load config and print the computed task plan
    Plan {
        #[arg(long, default_value = "kit.toml")]
        config: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends/env)
    Resolve {
        #[arg(long, default_value = "kit.toml")]
        config: PathBuf,
    },
    /// Install a .deb only if its content changed since the last install
    Reconcile {
        deb: PathBuf,
        /// Reconcile inside this root filesystem (via chroot) instead of the host
        #[arg(long)]
        root: Option<PathBuf>,
        /// Directory holding installation records
        #[arg(long)]
        records: Option<PathBuf>,
        /// Don't prefix privileged commands with sudo
        #[arg(long)]
        no_sudo: bool,
    },
    /// Open a shell (or run COMMAND) inside an image under the ARM emulator
    Shell {
        image: PathBuf,
        command: Option<String>,
        /// Extra bind mount, HOST_PATH:IMAGE_PATH
        #[arg(long = "mount")]
        mounts: Vec<String>,
        /// Script argument; the script is read from stdin
        #[arg(long = "arg")]
        args: Vec<String>,
        #[arg(long, default_value_t = 1)]
        boot_partition: u32,
        #[arg(long, default_value_t = 2)]
        root_partition: u32,
        #[arg(long)]
        no_sudo: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let res = match args.cmd {
        Command::Build {
            out_dir,
            config,
            dry_run,
            max_parallel,
        } => cmd_build(&config, &out_dir, dry_run, max_parallel),
        Command::Plan { config, dot } => cmd_plan(&config, dot),
        Command::Resolve { config } => cmd_resolve(&config),
        Command::Reconcile {
            deb,
            root,
            records,
            no_sudo,
        } => cmd_reconcile(&deb, root, records, !no_sudo),
        Command::Shell {
            image,
            command,
            mounts,
            args,
            boot_partition,
            root_partition,
            no_sudo,
        } => cmd_shell(
            &image,
            command.as_deref(),
            &mounts,
            &args,
            boot_partition,
            root_partition,
            !no_sudo,
        ),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            let code = e.exit_code().clamp(1, 255);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = config::load(path)?;
    let plan = modules::build_plan(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }
    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render config: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_build(path: &Path, out_dir: &Path, dry_run: bool, max_parallel: usize) -> Result<()> {
    let mut doc: ConfigDoc = config::load(path)?;
    let out_dir = workspace::cli_dir(out_dir)?;
    doc.set_path(
        "workspace.out_dir",
        toml::Value::String(out_dir.to_string_lossy().into_owned()),
    )?;
    let plan = modules::build_plan(&doc)?;

    let reg = executor::builtin_registry()?;
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(dry_run, sink);

    let max_parallel = if max_parallel == 0 {
        num_cpus::get().max(1)
    } else {
        max_parallel
    };
    let build = modules::util::build_name(&doc)?;
    tracing::info!(
        build = %build,
        tasks = plan.len(),
        max_parallel,
        dry_run,
        "starting build"
    );

    if max_parallel <= 1 || dry_run {
        executor::execute_plan(&doc, &plan, &reg, &mut ctx)
    } else {
        executor::execute_plan_parallel(&doc, &plan, &reg, &ctx, max_parallel)
    }
}

fn cmd_reconcile(
    deb: &Path,
    root: Option<PathBuf>,
    records: Option<PathBuf>,
    sudo: bool,
) -> Result<()> {
    let mut ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
    ctx.set_task("reconcile");

    let records = match (&records, &root) {
        (Some(dir), _) => FileRecordStore::new(dir),
        (None, Some(root)) => FileRecordStore::in_root(root),
        (None, None) => FileRecordStore::in_root(Path::new("/")),
    };
    let target = match root {
        Some(root) => Target::Chroot { root, sudo },
        None => Target::Host { sudo },
    };
    let dpkg = DpkgManager::new(&ctx, target);
    let inspector = DebInspector::new(&ctx);
    let report = Reconciler::new(&dpkg, &records, &inspector).reconcile(deb)?;
    println!(
        "{}: {} ({})",
        report.name,
        report.outcome.as_str(),
        report.fingerprint
    );
    Ok(())
}

fn cmd_shell(
    image: &Path,
    command: Option<&str>,
    mounts: &[String],
    script_args: &[String],
    boot_partition: u32,
    root_partition: u32,
    sudo: bool,
) -> Result<()> {
    require_root("kitimg shell")?;
    let mut opts = MountOptions {
        boot_partition,
        root_partition,
        sudo,
        ..MountOptions::default()
    };
    for m in mounts {
        opts.binds.push(parse_mount_spec(m)?);
    }

    let mut argv: Vec<&str> = vec!["bin/bash"];
    if let Some(c) = command {
        argv.extend(["-c", c]);
    }
    if !script_args.is_empty() {
        argv.push("/dev/stdin");
        argv.extend(script_args.iter().map(String::as_str));
    }

    let mut ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
    ctx.set_task("shell");
    let mounted = MountedImage::open(&ctx, image, &opts)?;
    eprintln!("Starting emulator at {}...", mounted.root().display());

    // Interactive: the shell inherits our terminal instead of going through the sink.
    let status = chroot_command(mounted.root(), &argv, &[], sudo)?
        .status()
        .map_err(|e| Error::msg(format!("failed to start chroot: {e}")));
    let closed = mounted.close();
    let status = status?;
    closed?;
    if !status.success() {
        return Err(Error::command("bin/bash", status));
    }
    Ok(())
}
