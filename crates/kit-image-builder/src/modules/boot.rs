use std::collections::BTreeMap;
use std::path::Path;

use kit_image_builder_macros::{Module, Task};
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::image::{MountedImage, require_root};
use crate::modules::base::{BaseConfig, RootSource, root_source};
use crate::modules::util::{self, default_true};

/// Appended to `cmdline.txt` so Raspberry Pi OS grows the root partition on first boot.
pub const EXPAND_ON_BOOT_ARGS: &str = " quiet init=/usr/lib/raspi-config/init_resize.sh";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigTxt {
    /// `key=value` lines; existing lines for `key` are replaced.
    pub set: BTreeMap<String, String>,
    /// Keys whose lines are dropped.
    pub remove: Vec<String>,
    /// Verbatim lines added once (e.g. `dtoverlay=...`).
    pub append: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Cmdline {
    pub expand_on_boot: Option<bool>,
    pub append: Vec<String>,
}

#[Task(
    id = "boot.configure",
    module = "boot",
    phase = "boot",
    provides = ["image:boot"],
    after = ["image:base", "image:provisioned?"],
    label = "Configure boot partition"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
    pub config: ConfigTxt,
    pub cmdline: Cmdline,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
            config: ConfigTxt::default(),
            cmdline: Cmdline::default(),
        }
    }
}

#[Module(id = "boot", tasks = [BootConfig])]
pub struct BootModule;

fn line_key(line: &str) -> Option<&str> {
    let t = line.trim();
    if t.starts_with('#') || t.starts_with('[') {
        return None;
    }
    t.split_once('=').map(|(k, _)| k.trim())
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Apply `set`, `remove` and `append` to the text of `config.txt`.
pub fn edit_config_txt(text: &str, edits: &ConfigTxt) -> String {
    let mut pending: BTreeMap<&str, &str> = edits
        .set
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let mut out: Vec<String> = Vec::new();

    for line in text.lines() {
        let Some(key) = line_key(line) else {
            out.push(line.to_string());
            continue;
        };
        if edits.remove.iter().any(|r| r == key) {
            continue;
        }
        if edits.set.contains_key(key) {
            // First occurrence takes the new value; later duplicates go.
            if let Some(v) = pending.remove(key) {
                out.push(format!("{key}={v}"));
            }
            continue;
        }
        out.push(line.to_string());
    }

    for (k, v) in pending {
        out.push(format!("{k}={v}"));
    }
    for line in &edits.append {
        let line = line.trim();
        if !line.is_empty() && !out.iter().any(|l| l.trim() == line) {
            out.push(line.to_string());
        }
    }

    let mut s = out.join("\n");
    s.push('\n');
    s
}

/// Add or remove the first-boot resize hook.
pub fn set_expand_on_boot(cmdline: &str, expand: bool) -> String {
    if expand {
        if cmdline.contains(EXPAND_ON_BOOT_ARGS) {
            cmdline.to_string()
        } else {
            format!("{}{EXPAND_ON_BOOT_ARGS}\n", cmdline.trim_end())
        }
    } else {
        cmdline.replace(EXPAND_ON_BOOT_ARGS, "")
    }
}

/// Append kernel arguments not already present.
pub fn append_cmdline_args(cmdline: &str, args: &[String]) -> String {
    let mut line = cmdline.trim_end().to_string();
    for arg in args.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        if !line.split_whitespace().any(|t| t == arg) {
            line.push(' ');
            line.push_str(arg);
        }
    }
    line.push('\n');
    line
}

impl BootConfig {
    fn validate(&self) -> Result<()> {
        for key in self.config.set.keys().chain(self.config.remove.iter()) {
            if !valid_key(key) {
                return Err(Error::msg(format!("boot.config: invalid key '{key}'")));
            }
        }
        for line in &self.config.append {
            if line.contains('\n') {
                return Err(Error::msg("boot.config.append entries must be single lines"));
            }
        }
        if self.cmdline.append.iter().any(|a| a.contains(char::is_whitespace)) {
            return Err(Error::msg(
                "boot.cmdline.append entries must be single arguments without spaces",
            ));
        }
        Ok(())
    }

    fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        match root_source(doc, ctx)? {
            RootSource::Dir(dir) => apply(cfg, ctx, &dir.join("boot")),
            RootSource::Image(img) => {
                require_root("mounting the boot partition")?;
                let sudo = util::host_config(doc)?.sudo;
                let part = BaseConfig::load(doc)?.boot_partition;
                let mounted = MountedImage::open_partition(ctx, &img, part, sudo)?;
                let res = apply(cfg, ctx, mounted.root());
                let closed = mounted.close();
                res?;
                closed
            }
        }
    }
}

/// Edit `config.txt` and `cmdline.txt` in a boot directory.
pub fn apply(cfg: &BootConfig, ctx: &ExecCtx, boot_dir: &Path) -> Result<()> {
    let c = &cfg.config;
    if !c.set.is_empty() || !c.remove.is_empty() || !c.append.is_empty() {
        let p = boot_dir.join("config.txt");
        let before = if p.exists() { util::read_text(&p)? } else { String::new() };
        let after = edit_config_txt(&before, c);
        if after != before {
            util::write_text(&p, &after)?;
            ctx.log(&format!("updated {}", p.display()));
        }
    }

    let k = &cfg.cmdline;
    if k.expand_on_boot.is_some() || !k.append.is_empty() {
        let p = boot_dir.join("cmdline.txt");
        if !p.is_file() {
            return Err(Error::msg(format!("{} not found", p.display())));
        }
        let before = util::read_text(&p)?;
        let mut after = append_cmdline_args(&before, &k.append);
        if let Some(expand) = k.expand_on_boot {
            after = set_expand_on_boot(&after, expand);
        }
        if after != before {
            util::write_text(&p, &after)?;
            ctx.log(&format!("updated {}", p.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CMDLINE: &str = "console=serial0,115200 console=tty1 root=PARTUUID=abc-02 rootfstype=ext4 fsck.repair=yes rootwait\n";

    #[test]
    fn expand_on_boot_is_added_once_and_removable() {
        let on = set_expand_on_boot(CMDLINE, true);
        assert!(on.ends_with("rootwait quiet init=/usr/lib/raspi-config/init_resize.sh\n"));
        assert_eq!(set_expand_on_boot(&on, true), on);
        assert_eq!(set_expand_on_boot(&on, false), CMDLINE);
        assert_eq!(set_expand_on_boot(CMDLINE, false), CMDLINE);
    }

    #[test]
    fn cmdline_args_are_not_duplicated() {
        let args = vec!["modules-load=dwc2".to_string(), "rootwait".to_string()];
        let out = append_cmdline_args(CMDLINE, &args);
        assert!(out.ends_with("rootwait modules-load=dwc2\n"), "{out}");
        assert_eq!(append_cmdline_args(&out, &args), out);
    }

    #[test]
    fn config_txt_set_remove_append() {
        let text = "# comment\ndtparam=audio=on\ncamera_auto_detect=1\n[pi4]\narm_boost=1\ncamera_auto_detect=0\n";
        let mut edits = ConfigTxt::default();
        edits.set.insert("camera_auto_detect".into(), "0".into());
        edits.set.insert("enable_uart".into(), "1".into());
        edits.remove.push("arm_boost".into());
        edits.append.push("dtoverlay=googlevoicehat-soundcard".into());

        let out = edit_config_txt(text, &edits);
        assert_eq!(
            out,
            "# comment\ndtparam=audio=on\ncamera_auto_detect=0\n[pi4]\nenable_uart=1\ndtoverlay=googlevoicehat-soundcard\n"
        );
        assert_eq!(edit_config_txt(&out, &edits), out);
    }
}
