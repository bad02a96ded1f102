use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kit_image_builder::config::{self, ConfigDoc};
use kit_image_builder::executor::{self, ExecCtx, MemorySink};
use kit_image_builder::modules::build_plan;

fn write(p: &Path, body: &str) {
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, body).unwrap();
}

fn load(dir: &Path, body: &str) -> ConfigDoc {
    let kit = dir.join("kit.toml");
    let head = format!("[workspace]\nroot_dir = '{}'\n", dir.display());
    fs::write(&kit, format!("{head}{body}")).unwrap();
    config::load_file(&kit).unwrap()
}

fn run(doc: &ConfigDoc) -> (kit_image_builder::Result<()>, Arc<MemorySink>) {
    let plan = build_plan(doc).unwrap();
    let reg = executor::builtin_registry().unwrap();
    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(false, sink.clone());
    (executor::execute_plan(doc, &plan, &reg, &mut ctx), sink)
}

#[test]
fn dotfiles_and_boot_edits_land_in_an_unpacked_root() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path();
    let rootfs = ws.join("rootfs");
    write(
        &rootfs.join("boot/cmdline.txt"),
        "console=tty1 root=PARTUUID=abc-02 rootwait\n",
    );
    write(&rootfs.join("boot/config.txt"), "dtparam=audio=on\n");
    write(&ws.join("dotfiles/.vimrc"), "set nu\n");
    write(&ws.join("dotfiles/.config/kit/env"), "KIT=1\n");

    let doc = load(
        ws,
        r#"
[base]
root_dir = "rootfs"

[provision]
[[provision.files]]
dst = "/home/pi/.bashrc"
content = "alias ll='ls -l'\n"
mode = 0o600

[[provision.files]]
src = "dotfiles"
dst = "/home/pi"

[boot.config]
set = { enable_uart = "1", "dtparam" = "audio=off" }
append = ["dtoverlay=googlevoicehat-soundcard"]

[boot.cmdline]
expand_on_boot = true
append = ["modules-load=dwc2"]
"#,
    );

    let (res, sink) = run(&doc);
    res.unwrap();

    let home = rootfs.join("home/pi");
    assert_eq!(
        fs::read_to_string(home.join(".bashrc")).unwrap(),
        "alias ll='ls -l'\n"
    );
    assert_eq!(fs::read_to_string(home.join(".vimrc")).unwrap(), "set nu\n");
    assert!(home.join(".config/kit/env").is_file());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(home.join(".bashrc")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    assert_eq!(
        fs::read_to_string(rootfs.join("boot/config.txt")).unwrap(),
        "dtparam=audio=off\nenable_uart=1\ndtoverlay=googlevoicehat-soundcard\n"
    );
    assert_eq!(
        fs::read_to_string(rootfs.join("boot/cmdline.txt")).unwrap(),
        "console=tty1 root=PARTUUID=abc-02 rootwait modules-load=dwc2 quiet init=/usr/lib/raspi-config/init_resize.sh\n"
    );

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(ws.join("out/kit/kit/modules/provision/manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["files"].as_array().map(Vec::len), Some(2));
    assert!(
        sink.log_lines().iter().any(|l| l.contains("image barrier reached")),
        "{:?}",
        sink.log_lines()
    );
}

#[test]
fn second_run_leaves_boot_files_unchanged() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path();
    let cmdline = ws.join("rootfs/boot/cmdline.txt");
    write(&cmdline, "console=tty1 rootwait\n");
    let doc = load(
        ws,
        "[base]\nroot_dir = \"rootfs\"\n[boot.cmdline]\nexpand_on_boot = true\n",
    );

    run(&doc).0.unwrap();
    let first = fs::read_to_string(&cmdline).unwrap();
    run(&doc).0.unwrap();
    assert_eq!(fs::read_to_string(&cmdline).unwrap(), first);
}

#[test]
fn base_image_checksum_mismatch_is_an_integrity_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path();
    write(&ws.join("images/raspios.img"), "not really an image");
    let doc = load(
        ws,
        &format!(
            "[base]\nimage = \"images/raspios.img\"\nsha256 = \"{}\"\n",
            "0".repeat(64)
        ),
    );

    let (res, _) = run(&doc);
    let err = res.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(!ws.join("build/kit/work.img").exists());
}

#[test]
fn verified_base_image_becomes_the_work_image() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path();
    let img: PathBuf = ws.join("images/raspios.img");
    write(&img, "pretend partition table");
    let sum = kit_image_builder::reconcile::fingerprint_file(&img).unwrap();
    let doc = load(
        ws,
        &format!("[base]\nimage = \"images/raspios.img\"\nsha256 = \"{sum}\"\n"),
    );

    run(&doc).0.unwrap();
    assert_eq!(
        fs::read_to_string(ws.join("build/kit/work.img")).unwrap(),
        "pretend partition table"
    );
    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(ws.join("out/kit/kit/modules/base/manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["source_sha256"], sum.as_str());
}

#[test]
fn published_image_is_named_from_the_build_and_scratch_is_cleaned() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path();
    let img = ws.join("images/raspios.img");
    write(&img, "pretend partition table");
    write(&ws.join("build/debs/keep.deb"), "other build output");
    let sum = kit_image_builder::reconcile::fingerprint_file(&img).unwrap();
    let doc = load(
        ws,
        r#"
[build]
name = "aiy"
version = "1.2"

[base]
image = "images/raspios.img"

[output]
name = "{build}-{version}"
compress = false
cleanup = true
"#,
    );

    let (res, sink) = run(&doc);
    res.unwrap();

    let published = ws.join("out/aiy/aiy-1.2.img");
    assert_eq!(
        fs::read_to_string(&published).unwrap(),
        "pretend partition table"
    );
    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(ws.join("out/aiy/kit/manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["build"], "aiy");
    assert_eq!(manifest["version"], "1.2");
    let artifact = &manifest["artifacts"][0];
    assert_eq!(artifact["path"], published.display().to_string().as_str());
    assert_eq!(artifact["sha256"], sum.as_str());
    assert_eq!(artifact["bytes"], 23);
    assert_eq!(artifact["compressed"], false);

    assert!(!ws.join("build/aiy").exists());
    assert!(ws.join("build/debs/keep.deb").is_file());
    assert!(
        sink.log_lines().iter().any(|l| l.starts_with("removed ")),
        "{:?}",
        sink.log_lines()
    );
}
