use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, ImageReader};
use parking_lot::Mutex;
use rand::RngCore;

const SNIFF_BYTES: usize = 512;

/// A file picked from local disk for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

impl LocalAsset {
    /// Opens a file and sniffs its MIME type from the leading bytes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file =
            File::open(path).with_context(|| format!("media: open {}", path.display()))?;
        let mut buffer = [0u8; SNIFF_BYTES];
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("media: read {}", path.display()))?;
        let content_type = detect_mime(&buffer[..read]);
        Self::with_content_type(path, content_type)
    }

    pub fn with_content_type(path: impl AsRef<Path>, content_type: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let meta =
            fs::metadata(path).with_context(|| format!("media: stat {}", path.display()))?;
        if !meta.is_file() {
            return Err(anyhow!("media: {} is not a file", path.display()));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: meta.len(),
            content_type: content_type.into(),
        })
    }

    pub fn size_label(&self) -> String {
        format!("{:.2} MB", self.size as f64 / (1024.0 * 1024.0))
    }
}

pub fn detect_mime(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg".into(),
        Ok(ImageFormat::Png) => "image/png".into(),
        Ok(ImageFormat::Gif) => "image/gif".into(),
        Ok(ImageFormat::WebP) => "image/webp".into(),
        _ => {
            let len = bytes.len().min(SNIFF_BYTES);
            tree_magic_mini::from_u8(&bytes[..len]).to_string()
        }
    }
}

/// Decodes just enough of an image to report its pixel dimensions.
pub fn image_dimensions(path: &Path) -> Result<(u32, u32)> {
    ImageReader::open(path)
        .with_context(|| format!("media: open {}", path.display()))?
        .with_guessed_format()
        .context("media: guess image format")?
        .into_dimensions()
        .context("media: decode image dimensions")
}

/// Opaque handle to a local preview of a selected asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewRef(String);

impl PreviewRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Registry of live preview references.
///
/// Every `create` must be paired with a `revoke`; `live()` exposes the count
/// so owners can prove they released everything.
#[derive(Debug, Clone, Default)]
pub struct Previews {
    inner: Arc<Mutex<HashMap<PreviewRef, PathBuf>>>,
}

impl Previews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, asset: &LocalAsset) -> PreviewRef {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        let preview = PreviewRef(format!("preview:{}", hex::encode(bytes)));
        self.inner.lock().insert(preview.clone(), asset.path.clone());
        preview
    }

    pub fn resolve(&self, preview: &PreviewRef) -> Option<PathBuf> {
        self.inner.lock().get(preview).cloned()
    }

    pub fn revoke(&self, preview: &PreviewRef) -> bool {
        self.inner.lock().remove(preview).is_some()
    }

    pub fn live(&self) -> usize {
        self.inner.lock().len()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sniffs_png_and_reads_dimensions() {
        let dir = tempdir().unwrap();
        let path = write_png(dir.path(), "thumb.png", 800, 450);
        let asset = LocalAsset::open(&path).unwrap();
        assert_eq!(asset.content_type, "image/png");
        assert_eq!(asset.name, "thumb.png");
        assert_eq!(image_dimensions(&path).unwrap(), (800, 450));
    }

    #[test]
    fn garbage_is_not_an_image() {
        let dir = tempdir().unwrap();
        let path = write_bytes(dir.path(), "notes.txt", b"just some text");
        assert!(image_dimensions(&path).is_err());
        let asset = LocalAsset::open(&path).unwrap();
        assert!(!asset.content_type.starts_with("image/"));
    }

    #[test]
    fn previews_track_live_references() {
        let dir = tempdir().unwrap();
        let path = write_bytes(dir.path(), "clip.mp4", b"\0\0\0\x18ftypmp42");
        let asset = LocalAsset::with_content_type(&path, "video/mp4").unwrap();
        let previews = Previews::new();
        let first = previews.create(&asset);
        let second = previews.create(&asset);
        assert_ne!(first, second);
        assert_eq!(previews.live(), 2);
        assert_eq!(previews.resolve(&first), Some(path.clone()));
        assert!(previews.revoke(&first));
        assert!(!previews.revoke(&first));
        assert_eq!(previews.live(), 1);
    }
}
