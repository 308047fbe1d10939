use {anyhow::Result, clap::Subcommand, wagate_config::WagateConfig, wagate_whatsapp::CredentialStore};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Show whether a linked device identity is stored.
    Status,
    /// Erase stored credentials so the next start pairs from scratch.
    Clear,
}

pub async fn handle_auth(action: AuthAction, config: &WagateConfig) -> Result<()> {
    let dir = config
        .whatsapp
        .data_dir_or(wagate_config::data_dir())
        .join("auth");
    let store = CredentialStore::open(&dir)?;
    match action {
        AuthAction::Status => status(&store),
        AuthAction::Clear => clear(&store).await,
    }
}

fn status(store: &CredentialStore) -> Result<()> {
    println!("Credential store: {}", store.path().display());
    if store.has_identity()? {
        println!("  linked device identity: present");
    } else if store.has_pending()? {
        println!("  pairing in progress (unconfirmed credentials)");
    } else {
        println!("  not paired");
    }
    Ok(())
}

async fn clear(store: &CredentialStore) -> Result<()> {
    if store.is_empty()? {
        println!("No stored credentials.");
        return Ok(());
    }
    store.clear().await?;
    println!("Credentials erased. A new QR code will be issued on next start.");
    Ok(())
}
