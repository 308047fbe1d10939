//! Pairing QR artifact: the current raw code plus its rendered PNG.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use {
    anyhow::Context,
    chrono::{DateTime, Utc},
    image::{ImageFormat, Luma},
    qrcode::{QrCode, render::unicode},
    serde::Serialize,
    tracing::{debug, info, warn},
};

/// A pairing code currently offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingArtifact {
    pub raw_code: String,
    /// `None` when rendering the image failed.
    pub rendered_image_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Holds the current [`PairingArtifact`] and its image at a fixed path.
pub struct QrArtifactManager {
    image_path: PathBuf,
    print_to_terminal: bool,
    current: Mutex<Option<PairingArtifact>>,
}

impl QrArtifactManager {
    pub fn new(image_path: PathBuf) -> Self {
        Self {
            image_path,
            print_to_terminal: false,
            current: Mutex::new(None),
        }
    }

    /// Also draw each new code on the terminal.
    pub fn with_terminal_output(mut self, enabled: bool) -> Self {
        self.print_to_terminal = enabled;
        self
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn current(&self) -> Option<PairingArtifact> {
        self.lock().clone()
    }

    /// The rendered image exists on disk.
    pub fn has_image(&self) -> bool {
        self.lock()
            .as_ref()
            .and_then(|a| a.rendered_image_path.as_deref())
            .is_some_and(Path::exists)
    }

    /// Replace the current artifact with one for `code`, rendering its image.
    pub async fn issue(&self, code: &str) -> PairingArtifact {
        let path = self.image_path.clone();
        let owned = code.to_string();
        let rendered = tokio::task::spawn_blocking(move || render_png(&owned, &path))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

        let rendered_image_path = match rendered {
            Ok(()) => Some(self.image_path.clone()),
            Err(e) => {
                warn!(error = %e, path = %self.image_path.display(), "failed to render pairing QR image");
                None
            },
        };

        if self.print_to_terminal {
            match render_terminal(code) {
                Ok(art) => println!("\n{art}\n"),
                Err(e) => warn!(error = %e, "failed to draw pairing QR on terminal"),
            }
        }

        let artifact = PairingArtifact {
            raw_code: code.to_string(),
            rendered_image_path,
            created_at: Utc::now(),
        };
        *self.lock() = Some(artifact.clone());
        info!("pairing QR code issued, scan it to link the device");
        artifact
    }

    /// Forget the current artifact and delete its image.
    pub async fn discard(&self) {
        let had = self.lock().take().is_some();
        match tokio::fs::remove_file(&self.image_path).await {
            Ok(()) => debug!(path = %self.image_path.display(), "pairing QR image deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(error = %e, "failed to delete pairing QR image"),
        }
        if had {
            debug!("pairing artifact discarded");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PairingArtifact>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn render_png(code: &str, path: &Path) -> anyhow::Result<()> {
    let qr = QrCode::new(code.as_bytes()).context("encode pairing code")?;
    let img = qr
        .render::<Luma<u8>>()
        .min_dimensions(300, 300)
        .quiet_zone(true)
        .build();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Write beside the target and rename so readers never see a partial PNG.
    let tmp = path.with_extension("png.tmp");
    img.save_with_format(&tmp, ImageFormat::Png)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn render_terminal(code: &str) -> anyhow::Result<String> {
    let qr = QrCode::new(code.as_bytes())?;
    Ok(qr
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let qr = QrArtifactManager::new(dir.path().join("qr.png"));

        let artifact = qr.issue("2@abc,def,ghi").await;
        assert_eq!(artifact.raw_code, "2@abc,def,ghi");
        assert_eq!(
            artifact.rendered_image_path.as_deref(),
            Some(dir.path().join("qr.png").as_path())
        );
        assert!(qr.has_image());

        let bytes = std::fs::read(dir.path().join("qr.png")).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        assert!(!dir.path().join("qr.png.tmp").exists());
    }

    #[tokio::test]
    async fn reissue_replaces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let qr = QrArtifactManager::new(dir.path().join("qr.png"));

        qr.issue("first").await;
        qr.issue("second").await;
        assert_eq!(qr.current().map(|a| a.raw_code), Some("second".into()));
    }

    #[tokio::test]
    async fn discard_removes_image() {
        let dir = tempfile::tempdir().unwrap();
        let qr = QrArtifactManager::new(dir.path().join("qr.png"));

        qr.issue("code").await;
        qr.discard().await;
        assert!(qr.current().is_none());
        assert!(!qr.has_image());
        assert!(!dir.path().join("qr.png").exists());

        // Discarding twice is fine.
        qr.discard().await;
    }

    #[tokio::test]
    async fn render_failure_still_records_code() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let qr = QrArtifactManager::new(blocker.join("qr.png"));

        let artifact = qr.issue("code").await;
        assert_eq!(artifact.raw_code, "code");
        assert!(artifact.rendered_image_path.is_none());
        assert!(!qr.has_image());
    }
}
