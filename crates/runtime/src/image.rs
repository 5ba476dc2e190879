//! Local policy images stored in an OCI image layout.
//!
//! The file store keeps one layout under `<root>/policies-root`. An image
//! is found through `index.json` by its `org.opencontainers.image.ref.name`
//! annotation; its single gzip layer is the bundle tarball.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, RuntimeError};

pub const POLICIES_ROOT: &str = "policies-root";
pub const INDEX_FILE: &str = "index.json";

const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl Descriptor {
    fn matches(&self, reference: &str) -> bool {
        self.annotations
            .get(ANNOTATION_REF_NAME)
            .is_some_and(|name| name.contains(reference))
    }

    fn hex(&self) -> Result<&str> {
        match self.digest.split_once(':') {
            Some(("sha256", hex)) if !hex.is_empty() => Ok(hex),
            _ => Err(RuntimeError::Image(format!("unsupported digest {:?}", self.digest))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Index {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// `~/.policy`, or `.policy` when no home directory is known.
pub fn default_file_store_root() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".policy")
}

/// The layout directory holding `index.json` and `blobs/`.
pub fn layout_dir(file_store_root: &Path) -> PathBuf {
    file_store_root.join(POLICIES_ROOT)
}

fn blob_path(layout: &Path, hex: &str) -> PathBuf {
    layout.join("blobs").join("sha256").join(hex)
}

/// Path of the bundle tarball for the image named `reference`.
pub fn resolve_policy_image(file_store_root: &Path, reference: &str) -> Result<PathBuf> {
    let layout = layout_dir(file_store_root);
    let index_path = layout.join(INDEX_FILE);
    let raw = fs::read(&index_path)?;
    if raw.is_empty() {
        return Err(RuntimeError::Image(format!("{} is empty", index_path.display())));
    }
    let index: Index = serde_json::from_slice(&raw)
        .map_err(|e| RuntimeError::Image(format!("{}: {e}", index_path.display())))?;

    let mut manifest = None;
    for descriptor in index.manifests.iter().filter(|d| d.matches(reference)) {
        match descriptor.media_type.as_str() {
            MEDIA_TYPE_LAYER_GZIP => return Ok(blob_path(&layout, descriptor.hex()?)),
            MEDIA_TYPE_MANIFEST => {
                manifest = Some(descriptor);
                break;
            }
            _ => {}
        }
    }
    let Some(descriptor) = manifest else {
        return Err(RuntimeError::Image(format!(
            "could not find policy image {reference} with a supported media type \
             ('{MEDIA_TYPE_MANIFEST}' or '{MEDIA_TYPE_LAYER_GZIP}')"
        )));
    };

    let manifest_path = blob_path(&layout, descriptor.hex()?);
    let manifest: Manifest = serde_json::from_slice(&fs::read(&manifest_path)?)
        .map_err(|e| RuntimeError::Image(format!("{}: {e}", manifest_path.display())))?;
    let [layer] = manifest.layers.as_slice() else {
        return Err(RuntimeError::Image(format!(
            "unknown image type: expected 1 layer, found {}",
            manifest.layers.len()
        )));
    };
    let tarball = blob_path(&layout, layer.hex()?);
    debug!(reference, path = %tarball.display(), "resolved policy image");
    Ok(tarball)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_json(path: &Path, value: serde_json::Value) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[test]
    fn resolves_through_image_manifest() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout_dir(root.path());
        write_json(
            &layout.join(INDEX_FILE),
            json!({"schemaVersion": 2, "manifests": [
                {"mediaType": MEDIA_TYPE_MANIFEST, "digest": "sha256:aaa",
                 "annotations": {ANNOTATION_REF_NAME: "ghcr.io/acme/policy:1.0"}}
            ]}),
        );
        write_json(
            &blob_path(&layout, "aaa"),
            json!({"layers": [{"mediaType": MEDIA_TYPE_LAYER_GZIP, "digest": "sha256:bbb"}]}),
        );
        let path = resolve_policy_image(root.path(), "acme/policy:1.0").unwrap();
        assert_eq!(path, blob_path(&layout, "bbb"));
    }

    #[test]
    fn gzip_layer_descriptor_resolves_directly() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout_dir(root.path());
        write_json(
            &layout.join(INDEX_FILE),
            json!({"manifests": [
                {"mediaType": MEDIA_TYPE_LAYER_GZIP, "digest": "sha256:ccc",
                 "annotations": {ANNOTATION_REF_NAME: "acme/policy:2"}}
            ]}),
        );
        assert_eq!(
            resolve_policy_image(root.path(), "acme/policy:2").unwrap(),
            blob_path(&layout, "ccc")
        );
    }

    #[test]
    fn missing_reference_and_multi_layer_images_fail() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout_dir(root.path());
        write_json(
            &layout.join(INDEX_FILE),
            json!({"manifests": [
                {"mediaType": MEDIA_TYPE_MANIFEST, "digest": "sha256:ddd",
                 "annotations": {ANNOTATION_REF_NAME: "acme/multi:1"}}
            ]}),
        );
        write_json(
            &blob_path(&layout, "ddd"),
            json!({"layers": [{"digest": "sha256:1"}, {"digest": "sha256:2"}]}),
        );
        assert!(matches!(
            resolve_policy_image(root.path(), "acme/other"),
            Err(RuntimeError::Image(_))
        ));
        assert!(matches!(
            resolve_policy_image(root.path(), "acme/multi:1"),
            Err(RuntimeError::Image(_))
        ));
    }
}
