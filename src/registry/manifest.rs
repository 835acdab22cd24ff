//! Manifest and blob metadata
//!
//! Manifest bytes are always carried verbatim because the digest covers
//! the bytes; parsing only ever reads them. The one sanctioned mutation is
//! [`patch_manifest`], which substitutes a drifted digest and size inside
//! the innermost JSON object enclosing the original digest.

use crate::error::{Result, TransmitError};
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Accept header value for manifest requests.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Size threshold below which a gzip layer is stored raw: tiny layers are
/// the well-known empty gzip blobs and cannot survive tar-split.
pub const GZIP_LAYER_MIN_SIZE: i64 = 32;

pub fn is_manifest_list(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_LIST || media_type == MEDIA_TYPE_OCI_INDEX
}

/// A content-addressed blob reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
}

impl BlobInfo {
    /// The digest without its `sha256:` prefix.
    pub fn hex(&self) -> &str {
        self.digest.split_once(':').map(|(_, h)| h).unwrap_or(&self.digest)
    }

    /// On-disk filename for this blob: `.tar.gz` for a gzipped tar layer
    /// of non-trivial size, `.tar` for an uncompressed tar layer, `.json`
    /// for configs, `.raw` otherwise.
    pub fn blob_filename(&self) -> String {
        format!("{}{}", self.hex(), self.suffix())
    }

    pub fn suffix(&self) -> &'static str {
        if self.is_gzip_layer() {
            ".tar.gz"
        } else if self.media_type.ends_with(".tar") {
            ".tar"
        } else if self.media_type.contains("json") {
            ".json"
        } else {
            ".raw"
        }
    }

    /// True for gzip tar layers large enough to disassemble.
    pub fn is_gzip_layer(&self) -> bool {
        (self.media_type.ends_with("tar.gzip") || self.media_type.ends_with("tar+gzip"))
            && self.size > GZIP_LAYER_MIN_SIZE
    }
}

/// A single-image manifest: one config blob plus ordered layers.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub config: BlobInfo,
    #[serde(default)]
    pub layers: Vec<BlobInfo>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Manifest> {
        serde_json::from_slice(bytes).map_err(|e| {
            TransmitError::Parse(format!(
                "manifest format error: {}, manifest: {}",
                e,
                String::from_utf8_lossy(bytes)
            ))
        })
    }

    /// Config first, then layers in manifest order.
    pub fn blob_infos(&self) -> Vec<BlobInfo> {
        let mut blobs = Vec::with_capacity(self.layers.len() + 1);
        blobs.push(self.config.clone());
        blobs.extend(self.layers.iter().cloned());
        blobs
    }
}

/// One entry of a fat manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDescriptor {
    pub digest: String,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
}

/// A manifest list / OCI index referencing per-platform sub-manifests.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestList {
    pub manifests: Vec<ManifestDescriptor>,
}

impl ManifestList {
    pub fn parse(bytes: &[u8]) -> Result<ManifestList> {
        serde_json::from_slice(bytes)
            .map_err(|e| TransmitError::Parse(format!("manifest list format error: {}", e)))
    }
}

/// Media type to send back when pushing manifest bytes: the embedded
/// `mediaType` field when present, the Docker v2 type otherwise.
pub fn manifest_media_type(bytes: &[u8]) -> String {
    #[derive(Deserialize)]
    struct MediaTypeOnly {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    }
    serde_json::from_slice::<MediaTypeOnly>(bytes)
        .ok()
        .and_then(|m| m.media_type)
        .unwrap_or_else(|| MEDIA_TYPE_DOCKER_MANIFEST.to_string())
}

/// Substitute a drifted digest and size in-place. Locates the original
/// digest, takes the innermost `{...}` window enclosing it, replaces the
/// digest and the size value inside that window only, then splices the
/// window back. All other bytes stay untouched.
pub fn patch_manifest(
    manifest: &str,
    old: &BlobInfo,
    new_digest: &str,
    new_size: i64,
) -> Result<String> {
    let start = manifest.find(&old.digest).ok_or_else(|| {
        TransmitError::Parse(format!("digest {} not found in manifest", old.digest))
    })?;
    let beg = manifest[..start].rfind('{').ok_or_else(|| {
        TransmitError::Parse("no enclosing object before digest".to_string())
    })?;
    let end = manifest[start..].find('}').ok_or_else(|| {
        TransmitError::Parse("no enclosing object after digest".to_string())
    })? + start;

    let old_window = &manifest[beg..end];
    let mut new_window = old_window.replace(&old.digest, new_digest);
    for pattern in [format!("\"size\": {}", old.size), format!("\"size\":{}", old.size)] {
        if new_window.contains(&pattern) {
            let replacement = pattern.replace(&old.size.to_string(), &new_size.to_string());
            new_window = new_window.replace(&pattern, &replacement);
            break;
        }
    }

    Ok(manifest.replace(old_window, &new_window))
}
