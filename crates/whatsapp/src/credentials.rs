//! Durable storage for session pairing material.
//!
//! Two records live in a sled tree: `pending` holds credentials rotated while
//! pairing (before the first successful open) and `identity` holds the
//! confirmed device identity. Every write is flushed before returning.

use std::path::{Path, PathBuf};

use {
    chrono::Utc,
    serde::{Deserialize, Serialize},
    tracing::debug,
    wagate_channels::Credentials,
};

use crate::error::Result;

const IDENTITY_KEY: &[u8] = b"identity";
const PENDING_KEY: &[u8] = b"pending";

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    blob: Vec<u8>,
    saved_at_ms: i64,
}

/// sled-backed credential store. Cheap to clone.
#[derive(Clone)]
pub struct CredentialStore {
    db: sled::Db,
    path: PathBuf,
}

impl CredentialStore {
    /// Open (creating if needed) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::open(dir)?;
        debug!(path = %dir.display(), "opened credential store");
        Ok(Self {
            db,
            path: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Credentials to resume with: the confirmed identity, else pending ones.
    pub fn load(&self) -> Result<Option<Credentials>> {
        match self.read(IDENTITY_KEY)? {
            Some(creds) => Ok(Some(creds)),
            None => self.read(PENDING_KEY),
        }
    }

    pub fn has_identity(&self) -> Result<bool> {
        Ok(self.db.contains_key(IDENTITY_KEY)?)
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(self.db.contains_key(PENDING_KEY)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(!self.has_identity()? && !self.has_pending()?)
    }

    /// Persist rotated credentials. `confirmed` writes the identity record
    /// directly (the session is already open); otherwise they are pending.
    pub async fn save(&self, credentials: &Credentials, confirmed: bool) -> Result<()> {
        let record = StoredCredentials {
            blob: credentials.as_bytes().to_vec(),
            saved_at_ms: Utc::now().timestamp_millis(),
        };
        let key = if confirmed {
            IDENTITY_KEY
        } else {
            PENDING_KEY
        };
        self.db.insert(key, postcard::to_allocvec(&record)?)?;
        if confirmed {
            self.db.remove(PENDING_KEY)?;
        }
        self.db.flush_async().await?;
        debug!(
            record = if confirmed { "identity" } else { "pending" },
            bytes = record.blob.len(),
            "credentials persisted"
        );
        Ok(())
    }

    /// Promote pending credentials to the identity record. No-op without any.
    pub async fn promote_pending(&self) -> Result<bool> {
        let Some(raw) = self.db.get(PENDING_KEY)? else {
            return Ok(false);
        };
        self.db.insert(IDENTITY_KEY, raw)?;
        self.db.remove(PENDING_KEY)?;
        self.db.flush_async().await?;
        debug!("pending credentials promoted to identity");
        Ok(true)
    }

    /// Drop credentials left over from an unfinished pairing.
    pub async fn clear_pending(&self) -> Result<()> {
        self.db.remove(PENDING_KEY)?;
        self.db.flush_async().await?;
        Ok(())
    }

    /// Erase everything.
    pub async fn clear(&self) -> Result<()> {
        self.db.clear()?;
        self.db.flush_async().await?;
        debug!("credential store cleared");
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Result<Option<Credentials>> {
        let Some(raw) = self.db.get(key)? else {
            return Ok(None);
        };
        let record: StoredCredentials = postcard::from_bytes(&raw)?;
        Ok(Some(Credentials::new(record.blob)))
    }
}
