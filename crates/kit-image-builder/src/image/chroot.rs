use std::path::{Component, Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// Raspberry Pi OS ships without en_US; QEMU_CPU pins armv6l so binaries stay Pi Zero safe.
pub const CHROOT_BASE_ENV: [(&str, &str); 4] = [
    ("LANG", "C.UTF-8"),
    ("LANGUAGE", "C:"),
    ("LC_CTYPE", "C.UTF-8"),
    ("QEMU_CPU", "arm1176"),
];

/// Where commands run: directly on the build host, or chrooted into an image root.
#[derive(Debug, Clone)]
pub enum Target {
    Host { sudo: bool },
    Chroot { root: PathBuf, sudo: bool },
}

impl Target {
    pub fn root(&self) -> Option<&Path> {
        match self {
            Target::Host { .. } => None,
            Target::Chroot { root, .. } => Some(root),
        }
    }

    /// Path of a system tool as the target sees it. Inside a chroot the program must be
    /// named relative to the image root so it can be checked before `chroot` runs.
    pub fn tool(&self, name: &str) -> String {
        match self {
            Target::Host { .. } => name.to_string(),
            Target::Chroot { .. } => format!("usr/bin/{name}"),
        }
    }

    pub fn command(&self, argv: &[&str]) -> Result<Command> {
        match self {
            Target::Host { sudo } => host_command(argv, *sudo),
            Target::Chroot { root, sudo } => chroot_command(root, argv, &[], *sudo),
        }
    }
}

pub fn host_command(argv: &[&str], sudo: bool) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::msg("command must not be empty"));
    };
    let mut cmd = if sudo {
        let mut c = Command::new("sudo");
        c.arg(program);
        c
    } else {
        Command::new(program)
    };
    cmd.args(args);
    Ok(cmd)
}

/// Build `[sudo] env <locale env> <extra env> chroot <root> argv...`.
///
/// `argv[0]` must be a relative path to an existing file inside `root`
/// (e.g. `bin/bash`), which catches a missing emulator or a wrong image early.
pub fn chroot_command(
    root: &Path,
    argv: &[&str],
    env: &[(String, String)],
    sudo: bool,
) -> Result<Command> {
    let Some(program) = argv.first() else {
        return Err(Error::msg("chroot command must not be empty"));
    };
    let rel = Path::new(program);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "chroot program '{program}' must be a path relative to the image root"
        )));
    }
    if !root.join(rel).is_file() {
        return Err(Error::msg(format!(
            "chroot program '{program}' not found under {}",
            root.display()
        )));
    }

    let mut cmd = if sudo {
        let mut c = Command::new("sudo");
        c.arg("env");
        c
    } else {
        Command::new("env")
    };
    for (k, v) in env {
        cmd.arg(format!("{k}={v}"));
    }
    for (k, v) in CHROOT_BASE_ENV {
        cmd.arg(format!("{k}={v}"));
    }
    cmd.arg("chroot").arg(root).args(argv);
    cmd.current_dir(root);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn chroot_command_sets_locale_and_runs_relative_program() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/bash"), "").unwrap();

        let cmd = chroot_command(
            root,
            &["bin/bash", "-c", "true"],
            &[("DEBIAN_FRONTEND".into(), "noninteractive".into())],
            true,
        )
        .unwrap();
        assert_eq!(cmd.get_program(), "sudo");
        let a = args(&cmd);
        assert_eq!(a[0], "env");
        assert_eq!(a[1], "DEBIAN_FRONTEND=noninteractive");
        assert!(a.contains(&"QEMU_CPU=arm1176".to_string()));
        let chroot_at = a.iter().position(|s| s == "chroot").unwrap();
        assert_eq!(a[chroot_at + 1], root.display().to_string());
        assert_eq!(&a[chroot_at + 2..], ["bin/bash", "-c", "true"]);
    }

    #[test]
    fn chroot_command_rejects_absolute_missing_and_empty_programs() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(chroot_command(tmp.path(), &["/bin/bash"], &[], false).is_err());
        assert!(chroot_command(tmp.path(), &["bin/bash"], &[], false).is_err());
        assert!(chroot_command(tmp.path(), &["../bin/bash"], &[], false).is_err());
        assert!(chroot_command(tmp.path(), &[], &[], false).is_err());
    }

    #[test]
    fn host_command_prefixes_sudo_when_asked() {
        let cmd = host_command(&["dpkg", "-i", "foo.deb"], true).unwrap();
        assert_eq!(cmd.get_program(), "sudo");
        assert_eq!(args(&cmd), ["dpkg", "-i", "foo.deb"]);
        let cmd = Target::Host { sudo: false }.command(&["dpkg-query", "-W"]).unwrap();
        assert_eq!(cmd.get_program(), "dpkg-query");
    }
}
