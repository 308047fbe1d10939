//! Configuration loading, validation, and env substitution.
//!
//! Config files are discovered as `wagate.{toml,yaml,yml,json}` in the
//! working directory, then in `~/.config/wagate/`. String values may contain
//! `${VAR}` or `${VAR:-default}` placeholders.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        apply_env_overrides, clear_config_dir, config_dir, data_dir, discover_and_load,
        find_or_default_config_path, load_config, set_config_dir,
    },
    schema::{
        BridgeConfig, ConfigError, ReconnectConfig, ServerConfig, WagateConfig, WhatsAppConfig,
    },
};
