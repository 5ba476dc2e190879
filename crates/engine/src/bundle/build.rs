use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use tracing::info;

use super::load::signatures_for;
use super::{BundleError, BundleLoader, Manifest, MANIFEST_FILE, SIGNATURES_FILE};
use crate::ast::parse_module;
use crate::builtins::BuiltinRegistry;
use crate::compile::Compiler;

#[derive(Debug, Clone, Default)]
pub struct BuildParams {
    /// Overrides the revision found in source manifests.
    pub revision: Option<String>,
    /// Overrides the roots found in source manifests.
    pub roots: Option<Vec<String>>,
    /// Merged over source manifest metadata.
    pub metadata: Map<String, Value>,
    pub ignore: Vec<String>,
    /// Write `.signatures.json` with SHA-256 digests of every file.
    pub digests: bool,
}

/// Compile the sources under `paths` and write them as a gzipped tarball
/// bundle to `out`. Later paths win when two sources carry the same file.
pub fn build<W: Write>(
    paths: &[PathBuf],
    params: &BuildParams,
    builtins: &BuiltinRegistry,
    out: W,
) -> Result<Manifest, BundleError> {
    let loader = BundleLoader::new().with_ignore(params.ignore.clone());

    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut manifest = Manifest::default();
    for path in paths {
        let mut source = loader.read_files(path)?;
        source.remove(SIGNATURES_FILE);
        if let Some(raw) = source.remove(MANIFEST_FILE) {
            let found: Manifest = serde_json::from_slice(&raw).map_err(|source| BundleError::Json {
                path: path.join(MANIFEST_FILE).display().to_string(),
                source,
            })?;
            merge_manifest(&mut manifest, found);
        }
        files.extend(source);
    }

    if let Some(revision) = &params.revision {
        manifest.revision = revision.clone();
    }
    if let Some(roots) = &params.roots {
        manifest.roots = Some(roots.clone());
    }
    for (k, v) in &params.metadata {
        manifest.metadata.insert(k.clone(), v.clone());
    }

    // Builtins the bundle expects its host to provide only need to resolve.
    let mut registry = builtins.clone();
    for name in manifest.required_builtins() {
        if !registry.register_placeholder(&name) {
            info!(builtin = %name, "builtin already declared, skipping placeholder");
        }
    }
    let mut modules = BTreeMap::new();
    for (rel, raw) in files.iter().filter(|(rel, _)| rel.ends_with(".rego")) {
        modules.insert(rel.clone(), parse_module(rel, &String::from_utf8_lossy(raw))?);
    }
    Compiler::new(Arc::new(registry)).compile(modules)?;

    let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(|source| BundleError::Json {
        path: MANIFEST_FILE.to_string(),
        source,
    })?;
    files.insert(MANIFEST_FILE.to_string(), manifest_json);
    if params.digests {
        let signatures = serde_json::to_vec_pretty(&signatures_for(&files)).map_err(|source| BundleError::Json {
            path: SIGNATURES_FILE.to_string(),
            source,
        })?;
        files.insert(SIGNATURES_FILE.to_string(), signatures);
    }

    let mut archive = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    for (rel, content) in &files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive.append_data(&mut header, rel, content.as_slice())?;
    }
    archive.into_inner()?.finish()?;

    Ok(manifest)
}

/// Build into a file at `output`.
pub fn build_to_file(
    paths: &[PathBuf],
    params: &BuildParams,
    builtins: &BuiltinRegistry,
    output: &Path,
) -> Result<Manifest, BundleError> {
    let file = File::create(output)?;
    let manifest = build(paths, params, builtins, file)?;
    info!(output = %output.display(), revision = %manifest.revision, "bundle built");
    Ok(manifest)
}

fn merge_manifest(into: &mut Manifest, found: Manifest) {
    if !found.revision.is_empty() {
        into.revision = found.revision;
    }
    if let Some(roots) = found.roots {
        into.roots.get_or_insert_with(Vec::new).extend(roots);
    }
    into.metadata.extend(found.metadata);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn built_tarball_loads_like_the_directory() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("app")).unwrap();
        fs::write(src.path().join("app/p.rego"), "package app\nallow = true\n").unwrap();
        fs::write(src.path().join("app/data.json"), r#"{"k": 1}"#).unwrap();

        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("bundle.tar.gz");
        let params = BuildParams {
            revision: Some("v1".to_string()),
            digests: true,
            ..BuildParams::default()
        };
        build_to_file(&[src.path().to_path_buf()], &params, &BuiltinRegistry::with_defaults(), &target).unwrap();

        let from_dir = BundleLoader::new().load(src.path()).unwrap();
        let from_tar = BundleLoader::new()
            .with_verification(Some(Default::default()))
            .load(&target)
            .unwrap();
        assert_eq!(from_tar.manifest.revision, "v1");
        assert_eq!(from_tar.data, from_dir.data);
        assert_eq!(from_tar.data, json!({"app": {"k": 1}}));
        assert_eq!(from_tar.modules.len(), 1);
        assert_eq!(from_tar.modules[0].path, "app/p.rego");
    }

    #[test]
    fn required_builtins_become_placeholders() {
        let src = tempfile::tempdir().unwrap();
        fs::write(
            src.path().join(".manifest"),
            r#"{"metadata": {"required_builtins": {"builtin1": [{"name": "acme.check"}]}}}"#,
        )
        .unwrap();
        fs::write(src.path().join("p.rego"), "package p\nok = acme.check(1)\n").unwrap();

        let mut buf = Vec::new();
        build(
            &[src.path().to_path_buf()],
            &BuildParams::default(),
            &BuiltinRegistry::with_defaults(),
            &mut buf,
        )
        .unwrap();
        assert!(!buf.is_empty());

        fs::write(src.path().join(".manifest"), "{}").unwrap();
        let err = build(
            &[src.path().to_path_buf()],
            &BuildParams::default(),
            &BuiltinRegistry::with_defaults(),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BundleError::Compile(_)));
    }
}
