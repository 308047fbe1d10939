use {
    anyhow::Result,
    clap::Subcommand,
    secrecy::Secret,
    wagate_config::WagateConfig,
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (secrets redacted).
    Show,
    /// Print the path of the config file in use.
    Path,
}

pub fn handle_config(action: ConfigAction, config: &WagateConfig) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", render(config)?);
            Ok(())
        },
        ConfigAction::Path => {
            println!(
                "{}",
                wagate_config::find_or_default_config_path().display()
            );
            Ok(())
        },
    }
}

fn render(config: &WagateConfig) -> Result<String> {
    let mut shown = config.clone();
    if shown.server.api_token.is_some() {
        shown.server.api_token = Some(Secret::new("[REDACTED]".into()));
    }
    Ok(toml::to_string_pretty(&shown)?)
}
