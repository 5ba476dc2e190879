use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{root_segments, within_roots, Bundle, BundleError, Manifest, ModuleFile, MANIFEST_FILE};
use crate::ast::parse_module;

/// Digest file carried by verified bundles.
pub const SIGNATURES_FILE: &str = ".signatures.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Files that need not appear in the digest list.
    pub exclude_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Signatures {
    files: Vec<FileDigest>,
}

#[derive(Debug, Deserialize)]
struct FileDigest {
    name: String,
    hash: String,
    #[serde(default)]
    algorithm: Option<String>,
}

/// Reads bundles from directories or gzipped tarballs.
#[derive(Debug, Clone, Default)]
pub struct BundleLoader {
    skip_verification: bool,
    verification: Option<VerificationConfig>,
    ignore: Vec<Pattern>,
}

impl BundleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip_verification(mut self, skip: bool) -> Self {
        self.skip_verification = skip;
        self
    }

    pub fn with_verification(mut self, config: Option<VerificationConfig>) -> Self {
        self.verification = config;
        self
    }

    /// Glob patterns matched against file names and relative paths.
    /// Matching files are skipped.
    pub fn with_ignore(mut self, patterns: Vec<String>) -> Self {
        self.ignore = patterns.iter().map(|p| compile_pattern(p)).collect();
        self
    }

    /// Load the bundle at `path`. Module ids are prefixed with `path`.
    pub fn load(&self, path: &Path) -> Result<Bundle, BundleError> {
        let name = path.to_string_lossy().to_string();
        let files = self.read_files(path)?;
        self.assemble(&name, files)
    }

    /// Load a gzipped tarball already in memory, e.g. a downloaded bundle.
    pub fn load_tarball_bytes(&self, name: &str, bytes: &[u8]) -> Result<Bundle, BundleError> {
        let files = self.untar(bytes)?;
        self.assemble(name, files)
    }

    /// Raw files of a directory or tarball, keyed by `/`-separated relative path.
    pub(crate) fn read_files(&self, path: &Path) -> Result<BTreeMap<String, Vec<u8>>, BundleError> {
        if path.is_dir() {
            return self.walk_dir(path);
        }
        // Content-addressed blobs carry no extension; sniff the gzip magic.
        let bytes = fs::read(path)?;
        if is_tarball(path) || bytes.starts_with(&[0x1f, 0x8b]) {
            self.untar(&bytes)
        } else {
            Err(BundleError::Unsupported(path.display().to_string()))
        }
    }

    fn walk_dir(&self, root: &Path) -> Result<BTreeMap<String, Vec<u8>>, BundleError> {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if self.ignored(&rel) {
                continue;
            }
            files.insert(rel, fs::read(entry.path())?);
        }
        Ok(files)
    }

    fn untar(&self, bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, BundleError> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut files = BTreeMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let rel = entry
                .path()?
                .to_string_lossy()
                .trim_start_matches("./")
                .trim_start_matches('/')
                .to_string();
            if rel.is_empty() || self.ignored(&rel) {
                continue;
            }
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            files.insert(rel, buf);
        }
        Ok(files)
    }

    fn ignored(&self, rel: &str) -> bool {
        let file_name = rel.rsplit('/').next().unwrap_or(rel);
        self.ignore
            .iter()
            .any(|p| p.matches(file_name) || p.matches(rel))
    }

    fn assemble(&self, name: &str, files: BTreeMap<String, Vec<u8>>) -> Result<Bundle, BundleError> {
        if !self.skip_verification {
            if let Some(config) = &self.verification {
                verify(&files, config)?;
            }
        }

        let manifest = match files.get(MANIFEST_FILE) {
            Some(raw) => serde_json::from_slice::<Manifest>(raw).map_err(|source| BundleError::Json {
                path: format!("{name}/{MANIFEST_FILE}"),
                source,
            })?,
            None => Manifest::default(),
        };
        let roots = manifest.effective_roots();
        let prefix = name.trim_end_matches('/');

        let mut bundle = Bundle {
            manifest,
            ..Bundle::empty()
        };

        for (rel, raw) in files {
            let (dir, file_name) = match rel.rsplit_once('/') {
                Some((dir, file)) => (dir.to_string(), file.to_string()),
                None => (String::new(), rel.clone()),
            };
            let location = format!("{prefix}/{rel}");

            if rel.ends_with(".rego") {
                let text = String::from_utf8_lossy(&raw);
                let parsed = parse_module(&location, &text)?;
                if !within_roots(&parsed.package, &roots) {
                    return Err(BundleError::OutsideRoots {
                        path: parsed.package_ref(),
                        roots,
                    });
                }
                bundle.modules.push(ModuleFile {
                    path: rel,
                    url: location,
                    raw,
                    parsed,
                });
                continue;
            }

            let value: Value = match file_name.as_str() {
                "data.json" => serde_json::from_slice(&raw).map_err(|source| BundleError::Json {
                    path: location.clone(),
                    source,
                })?,
                "data.yaml" | "data.yml" => {
                    serde_yaml::from_slice(&raw).map_err(|source| BundleError::Yaml {
                        path: location.clone(),
                        source,
                    })?
                }
                _ => continue,
            };

            let dir_path: Vec<String> = dir
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            check_data_roots(&dir_path, &value, &roots)?;
            insert_data(&mut bundle.data, &dir_path, value);
        }

        debug!(
            bundle = name,
            modules = bundle.modules.len(),
            revision = %bundle.manifest.revision,
            "loaded bundle"
        );
        Ok(bundle)
    }
}

fn is_tarball(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Data under `dir` must live inside the manifest roots. Objects above a
/// root are checked key by key so one data file may carry several roots.
fn check_data_roots(dir: &[String], value: &Value, roots: &[String]) -> Result<(), BundleError> {
    if roots.iter().any(|r| dir.starts_with(&root_segments(r))) {
        return Ok(());
    }
    let outside = || BundleError::OutsideRoots {
        path: dir.join("/"),
        roots: roots.to_vec(),
    };
    if !within_roots(dir, roots) {
        return Err(outside());
    }
    let Value::Object(map) = value else {
        return Err(outside());
    };
    for (key, child) in map {
        let mut path = dir.to_vec();
        path.push(key.clone());
        check_data_roots(&path, child, roots)?;
    }
    Ok(())
}

/// Merge `value` into `doc` at `path`, creating objects along the way.
fn insert_data(doc: &mut Value, path: &[String], value: Value) {
    let mut node = doc;
    for seg in path {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };
        node = map
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    merge(node, value);
}

fn merge(target: &mut Value, value: Value) {
    match (target, value) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (k, v) in incoming {
                match existing.get_mut(&k) {
                    Some(slot) => merge(slot, v),
                    None => {
                        existing.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn verify(files: &BTreeMap<String, Vec<u8>>, config: &VerificationConfig) -> Result<(), BundleError> {
    let raw = files
        .get(SIGNATURES_FILE)
        .ok_or_else(|| BundleError::Verification(format!("{SIGNATURES_FILE} not found")))?;
    let signatures: Signatures = serde_json::from_slice(raw).map_err(|source| BundleError::Json {
        path: SIGNATURES_FILE.to_string(),
        source,
    })?;

    let mut listed = BTreeSet::new();
    for digest in &signatures.files {
        if let Some(alg) = &digest.algorithm {
            if !alg.eq_ignore_ascii_case("sha-256") && !alg.eq_ignore_ascii_case("sha256") {
                return Err(BundleError::Verification(format!(
                    "{}: unsupported digest algorithm {alg}",
                    digest.name
                )));
            }
        }
        let name = digest.name.trim_start_matches('/');
        let content = files.get(name).ok_or_else(|| {
            BundleError::Verification(format!("{name}: listed in {SIGNATURES_FILE} but missing"))
        })?;
        let actual = hex::encode(Sha256::digest(content));
        if !actual.eq_ignore_ascii_case(&digest.hash) {
            return Err(BundleError::Verification(format!("{name}: digest mismatch")));
        }
        listed.insert(name.to_string());
    }

    for name in files.keys() {
        if name == SIGNATURES_FILE || listed.contains(name) {
            continue;
        }
        let excluded = config
            .exclude_files
            .iter()
            .any(|p| compile_pattern(p.trim_start_matches('/')).matches(name));
        if !excluded {
            return Err(BundleError::Verification(format!(
                "{name}: not listed in {SIGNATURES_FILE}"
            )));
        }
    }
    Ok(())
}

/// Digest list in the `.signatures.json` format.
pub(crate) fn signatures_for(files: &BTreeMap<String, Vec<u8>>) -> Value {
    let entries: Vec<Value> = files
        .iter()
        .filter(|(name, _)| name.as_str() != SIGNATURES_FILE)
        .map(|(name, content)| {
            serde_json::json!({
                "name": name,
                "hash": hex::encode(Sha256::digest(content)),
                "algorithm": "SHA-256",
            })
        })
        .collect();
    serde_json::json!({ "files": entries })
}

/// Compile a glob pattern; an invalid one only matches itself.
fn compile_pattern(raw: &str) -> Pattern {
    Pattern::new(raw).unwrap_or_else(|e| {
        warn!(pattern = raw, error = %e, "invalid glob pattern, matching literally");
        Pattern::new(&Pattern::escape(raw)).unwrap_or_default()
    })
}
