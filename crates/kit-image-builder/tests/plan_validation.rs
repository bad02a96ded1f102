use std::fs;
use std::path::Path;

use kit_image_builder::config;
use kit_image_builder::modules::build_plan;

fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let p = dir.join(name);
    fs::write(&p, body).unwrap();
    p
}

fn ids(doc: &config::ConfigDoc) -> Vec<String> {
    build_plan(doc)
        .unwrap()
        .ordered()
        .unwrap()
        .iter()
        .map(|t| t.id.clone())
        .collect()
}

#[test]
fn full_pipeline_orders_around_the_image_barrier() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "base.toml",
        r#"
[base]
image = "images/raspios.img.xz"

[output]
level = 6
"#,
    );
    write(
        tmp.path(),
        "packages.toml",
        r#"
[[items]]
name = "aiy-board-info"
dir = "packages/aiy-board-info"
"#,
    );
    let kit = write(
        tmp.path(),
        "kit.toml",
        r#"
extends = "base.toml"

[packages]
imports = ["packages.toml"]
parallel = true

[provision]
debs = ["vendor/extra.deb"]

[boot.cmdline]
expand_on_boot = true
"#,
    );

    let doc = config::load_file(&kit).unwrap();
    assert_eq!(
        doc.value_path("output.level").and_then(|v| v.as_integer()),
        Some(6)
    );
    assert_eq!(
        doc.value_path("packages.items")
            .and_then(|v| v.as_array())
            .map(Vec::len),
        Some(1)
    );
    assert_eq!(
        ids(&doc),
        vec![
            "core.init",
            "base.verify",
            "packages.build",
            "provision.run",
            "boot.configure",
            "core.barrier.image",
            "output.compress",
        ]
    );
}

#[test]
fn disabled_packages_drop_out_of_the_provision_dependencies() {
    let tmp = tempfile::tempdir().unwrap();
    let kit = write(
        tmp.path(),
        "kit.toml",
        "[base]\nroot_dir = \"rootfs\"\n[packages]\nenabled = false\n[provision]\n",
    );
    let doc = config::load_file(&kit).unwrap();
    let plan = build_plan(&doc).unwrap();
    assert!(plan.get("packages.build").is_none());
    assert_eq!(plan.get("provision.run").unwrap().after, vec!["image:base"]);
    assert!(plan.get("output.compress").is_none());
}

#[test]
fn rejects_unknown_tables_and_disabled_base() {
    let tmp = tempfile::tempdir().unwrap();
    let kit = write(tmp.path(), "kit.toml", "[base]\nimage = \"a.img\"\n[frontend]\n");
    let err = build_plan(&config::load_file(&kit).unwrap())
        .unwrap_err()
        .to_string();
    assert!(err.contains("'frontend' is not supported"), "{err}");

    let kit = write(tmp.path(), "kit.toml", "[base]\nenabled = false\nimage = \"a.img\"\n");
    let err = build_plan(&config::load_file(&kit).unwrap())
        .unwrap_err()
        .to_string();
    assert!(err.contains("enabled=false is not allowed"), "{err}");
}

#[test]
fn provision_without_a_base_is_an_unknown_dependency() {
    let tmp = tempfile::tempdir().unwrap();
    let kit = write(tmp.path(), "kit.toml", "[provision]\n");
    let plan = build_plan(&config::load_file(&kit).unwrap()).unwrap();
    let err = plan.ordered().unwrap_err().to_string();
    assert!(err.contains("image:base"), "{err}");
}

#[test]
fn import_cycles_are_reported() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "a.toml", "extends = \"b.toml\"\n");
    let b = write(tmp.path(), "b.toml", "extends = \"a.toml\"\n");
    let err = config::load_file(&b).unwrap_err().to_string();
    assert!(err.contains("cycle"), "{err}");
}

#[test]
fn env_overrides_beat_the_file() {
    let tmp = tempfile::tempdir().unwrap();
    let kit = write(
        tmp.path(),
        "kit.toml",
        "[packages]\nengine = \"direct\"\n[output]\ncleanup = false\n",
    );
    let mut doc = config::load_file(&kit).unwrap();
    config::apply_env_overrides(&mut doc, |k| match k {
        config::ENV_BUILD_ENGINE => Some("docker".into()),
        config::ENV_CLEANUP => Some("on".into()),
        _ => None,
    })
    .unwrap();
    assert_eq!(
        doc.value_path("packages.engine").and_then(|v| v.as_str()),
        Some("docker")
    );
    assert_eq!(
        doc.value_path("output.cleanup").and_then(|v| v.as_bool()),
        Some(true)
    );

    let err = config::apply_env_overrides(&mut doc, |k| {
        (k == config::ENV_PARALLEL_PACKAGES).then(|| "maybe".to_string())
    });
    assert!(err.is_err());
}

#[test]
fn cleanup_toggle_does_not_enable_output() {
    let tmp = tempfile::tempdir().unwrap();
    let kit = write(
        tmp.path(),
        "kit.toml",
        "[base]\nroot_dir = \"rootfs\"\n[packages]\n",
    );
    let mut doc = config::load_file(&kit).unwrap();
    config::apply_env_overrides(&mut doc, |k| {
        (k == config::ENV_CLEANUP).then(|| "1".to_string())
    })
    .unwrap();

    let plan = ids(&doc);
    assert!(!plan.iter().any(|id| id == "output.compress"), "{plan:?}");
    assert!(plan.iter().any(|id| id == "packages.build"), "{plan:?}");
}

#[test]
fn malformed_build_table_fails_planning() {
    let tmp = tempfile::tempdir().unwrap();
    let kit = write(tmp.path(), "kit.toml", "[build]\nname = 5\n");
    let err = build_plan(&config::load_file(&kit).unwrap())
        .unwrap_err()
        .to_string();
    assert!(err.contains("'build'"), "{err}");
}
