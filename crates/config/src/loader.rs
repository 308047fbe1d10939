use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{env_subst::substitute_env, schema::WagateConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["wagate.toml", "wagate.yaml", "wagate.yml", "wagate.json"];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, config discovery only looks in
/// this directory (project-local and user-global paths are skipped).
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<WagateConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./wagate.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/wagate/wagate.{toml,yaml,yml,json}` (user-global)
///
/// Writes and returns the default config when nothing is found. A file that
/// fails to parse is reported and replaced by defaults in memory only.
pub fn discover_and_load() -> WagateConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, writing default config");
        let config = WagateConfig::default();
        if let Err(e) = write_default_config(&config) {
            warn!(error = %e, "failed to write default config file");
        }
        return config;
    };

    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        WagateConfig::default()
    })
}

/// Apply environment overrides on top of a loaded config.
///
/// `WAGATE_API_TOKEN` (or the legacy `API_TOKEN`), `PORT` and
/// `WAGATE_COUNTRY_CODE` are honored so container deployments can skip the
/// config file entirely.
pub fn apply_env_overrides(config: &mut WagateConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

fn apply_overrides_from(config: &mut WagateConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup("WAGATE_API_TOKEN").or_else(|| lookup("API_TOKEN")) {
        config.server.api_token = Some(Secret::new(token));
    }
    if let Some(port) = lookup("PORT") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => warn!(value = %port, "ignoring unparsable PORT"),
        }
    }
    if let Some(code) = lookup("WAGATE_COUNTRY_CODE") {
        config.whatsapp.country_code = code;
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return CONFIG_FILENAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists());
    }

    let local = CONFIG_FILENAMES.iter().map(PathBuf::from).find(|p| p.exists());
    if local.is_some() {
        return local;
    }

    let dir = home_dir()?.join(".config").join("wagate");
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/wagate/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("wagate"))
}

/// Returns the data directory: `~/.wagate/`.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".wagate"))
        .unwrap_or_else(|| PathBuf::from(".wagate"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wagate.toml")
}

/// Write the default config file. Only called when no config file exists yet.
fn write_default_config(config: &WagateConfig) -> anyhow::Result<()> {
    let path = find_or_default_config_path();
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, &toml_str)?;
    debug!(path = %path.display(), "wrote default config file");
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<WagateConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("wagate.toml");
        std::fs::write(&toml_path, "[server]\nport = 8080\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().server.port, 8080);

        let yaml_path = dir.path().join("wagate.yaml");
        std::fs::write(&yaml_path, "whatsapp:\n  country_code: \"44\"\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().whatsapp.country_code, "44");

        let json_path = dir.path().join("wagate.json");
        std::fs::write(&json_path, r#"{"reconnect":{"jitter":false}}"#).unwrap();
        assert!(!load_config(&json_path).unwrap().reconnect.jitter);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagate.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn placeholder_fallback_applies_while_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagate.toml");
        std::fs::write(
            &path,
            "[server]\nport = ${WAGATE_LOADER_TEST_UNSET_PORT:-4100}\n",
        )
        .unwrap();
        assert_eq!(load_config(&path).unwrap().server.port, 4100);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = WagateConfig::default();
        apply_overrides_from(&mut cfg, |name| match name {
            "API_TOKEN" => Some("legacy".into()),
            "PORT" => Some("9001".into()),
            "WAGATE_COUNTRY_CODE" => Some("1".into()),
            _ => None,
        });
        assert_eq!(
            cfg.server.api_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("legacy")
        );
        assert_eq!(cfg.server.port, 9001);
        assert_eq!(cfg.whatsapp.country_code, "1");
    }

    #[test]
    fn prefixed_token_beats_legacy_name() {
        let mut cfg = WagateConfig::default();
        apply_overrides_from(&mut cfg, |name| match name {
            "WAGATE_API_TOKEN" => Some("new".into()),
            "API_TOKEN" => Some("old".into()),
            "PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(
            cfg.server.api_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("new")
        );
        assert_eq!(cfg.server.port, 3000);
    }

    #[test]
    fn override_dir_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wagate.toml"), "[server]\nport = 7777\n").unwrap();
        set_config_dir(dir.path().to_path_buf());
        let found = find_config_file();
        let loaded = discover_and_load();
        clear_config_dir();

        assert_eq!(found, Some(dir.path().join("wagate.toml")));
        assert_eq!(loaded.server.port, 7777);
    }
}
