//! k3s private registry configuration (`registries.yaml`)

use crate::config::{AppConfig, RegistryConf};
use crate::utils::exec::{CommandRunner, LocalCmd, is_root};
use anyhow::{Context, Result};
use std::path::Path;
use yaml_rust::yaml::Hash;
use yaml_rust::{Yaml, YamlEmitter};

pub const REGISTRIES_PATH: &str = "/etc/rancher/k3s/registries.yaml";

fn key(s: &str) -> Yaml {
    Yaml::String(s.to_string())
}

/// Render a mirror plus auth entry for the configured image registry.
/// Plain `http://` registries also get `tls.insecure_skip_verify`.
pub fn render(registry: &RegistryConf, app: &AppConfig) -> Result<String> {
    let img_repo = app.img_repo.as_str();
    let host = app.img_repo_no_prefix();

    let mut mirror = Hash::new();
    mirror.insert(key("endpoint"), Yaml::Array(vec![key(img_repo)]));
    let mut mirrors = Hash::new();
    mirrors.insert(key(&host), Yaml::Hash(mirror));

    let mut auth = Hash::new();
    auth.insert(key("username"), key(&registry.user));
    auth.insert(key("password"), key(&registry.password));
    let mut host_conf = Hash::new();
    host_conf.insert(key("auth"), Yaml::Hash(auth));
    if img_repo.starts_with("http://") {
        let mut tls = Hash::new();
        tls.insert(key("insecure_skip_verify"), Yaml::Boolean(true));
        host_conf.insert(key("tls"), Yaml::Hash(tls));
    }
    let mut configs = Hash::new();
    configs.insert(key(&host), Yaml::Hash(host_conf));

    let mut root = Hash::new();
    root.insert(key("mirrors"), Yaml::Hash(mirrors));
    root.insert(key("configs"), Yaml::Hash(configs));

    let mut out = String::new();
    YamlEmitter::new(&mut out)
        .dump(&Yaml::Hash(root))
        .context("Failed to serialize registries.yaml")?;
    out.push('\n');
    Ok(out)
}

/// Replace `target` with `content` via a sibling temp file and rename
pub fn replace_file(target: &Path, content: &str) -> Result<()> {
    let dir = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let tmp = target.with_extension("yaml.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, target)
        .with_context(|| format!("Failed to move {} into place", target.display()))
}

/// Install `content` as the system registries.yaml, through sudo if needed
pub fn install(runner: &dyn CommandRunner, content: &str) -> Result<()> {
    let target = Path::new(REGISTRIES_PATH);
    if is_root() {
        return replace_file(target, content);
    }

    let staged = std::env::temp_dir().join("kfleet_registries.yaml");
    std::fs::write(&staged, content)
        .with_context(|| format!("Failed to write {}", staged.display()))?;

    let tmp = format!("{}.tmp", REGISTRIES_PATH);
    runner.run(
        &LocalCmd::new("mkdir")
            .args(["-p", "/etc/rancher/k3s"])
            .with_root(),
    )?;
    runner.run(
        &LocalCmd::new("cp")
            .arg(staged.to_string_lossy())
            .arg(&tmp)
            .with_root(),
    )?;
    runner.run(&LocalCmd::new("chmod").args(["600", tmp.as_str()]).with_root())?;
    runner
        .run(
            &LocalCmd::new("mv")
                .args([tmp.as_str(), REGISTRIES_PATH])
                .with_root(),
        )
        .context("Failed to replace registries.yaml")?;
    std::fs::remove_file(&staged).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yaml_rust::YamlLoader;

    fn app(img_repo: &str) -> AppConfig {
        let img_repo = img_repo.to_string();
        AppConfig::from_lookup(move |key| match key {
            "HOME" => Some("/home/ops".to_string()),
            "KFLEET_IMG_REPO" => Some(img_repo.clone()),
            _ => None,
        })
        .unwrap()
    }

    fn registry() -> RegistryConf {
        RegistryConf {
            user: "admin".to_string(),
            password: "s3cret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_http_registry() {
        let text = render(&registry(), &app("http://10.0.0.9:5000")).unwrap();
        let doc = &YamlLoader::load_from_str(&text).unwrap()[0];

        assert_eq!(
            doc["mirrors"]["10.0.0.9:5000"]["endpoint"][0].as_str(),
            Some("http://10.0.0.9:5000")
        );
        let conf = &doc["configs"]["10.0.0.9:5000"];
        assert_eq!(conf["auth"]["username"].as_str(), Some("admin"));
        assert_eq!(conf["auth"]["password"].as_str(), Some("s3cret"));
        assert_eq!(conf["tls"]["insecure_skip_verify"].as_bool(), Some(true));
    }

    #[test]
    fn test_render_https_registry_keeps_tls() {
        let text = render(&registry(), &app("https://registry.lan")).unwrap();
        let doc = &YamlLoader::load_from_str(&text).unwrap()[0];
        assert!(doc["configs"]["registry.lan"]["tls"].is_badvalue());
        assert!(!doc["mirrors"]["registry.lan"].is_badvalue());
    }

    #[test]
    fn test_replace_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rancher/k3s/registries.yaml");
        replace_file(&target, "old: 1\n").unwrap();
        replace_file(&target, "new: 2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new: 2\n");
        assert!(!target.with_extension("yaml.tmp").exists());
    }
}
