// 🔌 External collaborators - blob upload and document extraction
//
// The pipeline only sees the two traits. The local implementations keep the
// whole flow runnable without cloud services: images go to a directory, and
// extraction results are JSON files the document service produced offline.

use crate::normalizer::RawExtraction;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub trait BlobUploader: Send + Sync {
    /// Store the bytes and return a URL the extractor can read, or None
    fn upload(&self, bytes: &[u8], filename: &str) -> Option<String>;
}

pub trait CardExtractor: Send + Sync {
    /// Raw field candidates for the image at `image_url`, or None when the
    /// document could not be analyzed
    fn extract(&self, image_url: &str) -> Option<RawExtraction>;
}

const HASH_PREFIX_LEN: usize = 16;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

fn is_image_name(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Keep only the final path component, with anything unusual replaced
fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Strip the content-hash prefix LocalBlobStore adds to stored names
pub fn original_name(blob_name: &str) -> &str {
    match blob_name.split_once('-') {
        Some((prefix, rest))
            if prefix.len() == HASH_PREFIX_LEN && prefix.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            rest
        }
        _ => blob_name,
    }
}

fn url_to_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

// ============================================================================
// LOCAL BLOB STORE
// ============================================================================

/// Content-addressed directory: `<dir>/<sha256 prefix>-<filename>`
pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        LocalBlobStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, bytes: &[u8], name: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        fs::write(&path, bytes)?;
        fs::canonicalize(&path)
    }
}

impl BlobUploader for LocalBlobStore {
    fn upload(&self, bytes: &[u8], filename: &str) -> Option<String> {
        let filename = sanitize_filename(filename);
        if bytes.is_empty() || filename.is_empty() {
            warn!(filename = %filename, "refusing to upload empty blob");
            return None;
        }
        if !is_image_name(&filename) {
            warn!(filename = %filename, "only jpg, jpeg and png images are accepted");
            return None;
        }

        let digest = format!("{:x}", Sha256::digest(bytes));
        let name = format!("{}-{}", &digest[..HASH_PREFIX_LEN], filename);

        match self.write(bytes, &name) {
            Ok(path) => {
                let url = format!("file://{}", path.display());
                debug!(url = %url, size = bytes.len(), "blob stored");
                Some(url)
            }
            Err(e) => {
                warn!(error = %e, dir = %self.dir.display(), "blob upload failed");
                None
            }
        }
    }
}

// ============================================================================
// SIDECAR EXTRACTOR
// ============================================================================

/// Reads extraction results from `<name>.json` files. Looks in `fields_dir`
/// under the image's original name first, then next to the blob itself.
pub struct SidecarExtractor {
    fields_dir: Option<PathBuf>,
}

impl SidecarExtractor {
    pub fn new() -> Self {
        SidecarExtractor { fields_dir: None }
    }

    pub fn with_fields_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.fields_dir = Some(dir.into());
        self
    }

    fn candidates(&self, blob_path: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let (Some(dir), Some(blob_name)) = (&self.fields_dir, blob_path.file_name()) {
            let blob_name = blob_name.to_string_lossy();
            paths.push(dir.join(format!("{}.json", original_name(&blob_name))));
        }

        let mut beside = blob_path.as_os_str().to_owned();
        beside.push(".json");
        paths.push(PathBuf::from(beside));

        paths
    }
}

impl Default for SidecarExtractor {
    fn default() -> Self {
        SidecarExtractor::new()
    }
}

impl CardExtractor for SidecarExtractor {
    fn extract(&self, image_url: &str) -> Option<RawExtraction> {
        let Some(blob_path) = url_to_path(image_url) else {
            warn!(url = %image_url, "only file:// URLs can be analyzed locally");
            return None;
        };

        let sidecar = self
            .candidates(&blob_path)
            .into_iter()
            .find(|path| path.is_file())?;

        let content = match fs::read_to_string(&sidecar) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, path = %sidecar.display(), "cannot read extraction");
                return None;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, path = %sidecar.display(), "extraction is not valid JSON");
                return None;
            }
        };

        RawExtraction::from_json(&value).filter(|raw| !raw.is_empty())
    }
}
