//! ST-032: Module sources and the on-disk module cache.
//!
//! Cache layout: `<cache_dir>/<key>/module.yaml` plus `meta.json` recording
//! the module identity and content hash. The key is always the hex digest of
//! the content. A pinned module is looked up by its checksum before any fetch;
//! an unpinned one is re-read on every run and only its store is skipped when
//! the content is unchanged. Requests for the same module share a single
//! in-flight fetch.

use super::module::{parse_module, ModuleFile};
use crate::audit::hasher;
use crate::error::ModuleFetchError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};

/// Where module source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModuleSource {
    Git {
        git: String,
        #[serde(default, rename = "ref")]
        reference: Option<String>,
        /// File inside the repository (default `module.yaml`)
        #[serde(default)]
        path: Option<String>,
    },
    Local {
        path: String,
    },
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(f, "{}", path),
            Self::Git {
                git,
                reference,
                path,
            } => {
                write!(f, "git+{}", git)?;
                if let Some(p) = path {
                    write!(f, "//{}", p)?;
                }
                if let Some(r) = reference {
                    write!(f, "?ref={}", r)?;
                }
                Ok(())
            }
        }
    }
}

/// Pinned module identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleDescriptor {
    pub source: ModuleSource,
    pub version: String,
    /// Expected content fingerprint (`blake3:<hex>`)
    pub checksum: Option<String>,
}

impl ModuleDescriptor {
    /// `source@version`
    pub fn identity(&self) -> String {
        format!("{}@{}", self.source, self.version)
    }

    /// Single-flight key: the pinned digest, else the BLAKE3 of the identity.
    pub fn fetch_key(&self) -> String {
        if let Some(key) = self.checksum.as_deref().and_then(content_key) {
            return key;
        }
        content_key(&hasher::hash_string(&self.identity())).unwrap_or_default()
    }
}

/// Cache directory name for a `blake3:<hex>` fingerprint.
fn content_key(fingerprint: &str) -> Option<String> {
    hasher::digest_hex(fingerprint).map(str::to_ascii_lowercase)
}

/// Retrieves raw module source.
pub trait ModuleFetcher: Send + Sync {
    fn fetch(&self, descriptor: &ModuleDescriptor) -> Result<String, String>;
}

/// Reads local paths (relative to `base_dir`) and shallow-clones git sources.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    base_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl SourceFetcher {
    pub fn new(base_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn fetch_git(
        &self,
        descriptor: &ModuleDescriptor,
        url: &str,
        reference: Option<&str>,
        path: Option<&str>,
    ) -> Result<String, String> {
        let checkout = self
            .scratch_dir
            .join(format!("checkout-{}", descriptor.fetch_key()));
        let _ = std::fs::remove_dir_all(&checkout);
        std::fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| format!("cannot create {}: {}", self.scratch_dir.display(), e))?;

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--quiet", "--depth", "1"]);
        if let Some(r) = reference {
            cmd.args(["--branch", r]);
        }
        cmd.arg(url).arg(&checkout);
        tracing::info!(url, reference, "cloning module source");
        let output = cmd
            .output()
            .map_err(|e| format!("failed to spawn git: {}", e))?;
        let result = if output.status.success() {
            let file = checkout.join(path.unwrap_or("module.yaml"));
            std::fs::read_to_string(&file)
                .map_err(|e| format!("cannot read {} in {}: {}", file.display(), url, e))
        } else {
            Err(format!(
                "git clone exited {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        };
        let _ = std::fs::remove_dir_all(&checkout);
        result
    }
}

impl ModuleFetcher for SourceFetcher {
    fn fetch(&self, descriptor: &ModuleDescriptor) -> Result<String, String> {
        match &descriptor.source {
            ModuleSource::Local { path } => {
                let file = self.base_dir.join(path);
                std::fs::read_to_string(&file)
                    .map_err(|e| format!("cannot read {}: {}", file.display(), e))
            }
            ModuleSource::Git {
                git,
                reference,
                path,
            } => self.fetch_git(descriptor, git, reference.as_deref(), path.as_deref()),
        }
    }
}

/// A verified, parsed module.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedModule {
    pub key: String,
    pub identity: String,
    pub content_hash: String,
    pub file: ModuleFile,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    identity: String,
    content_hash: String,
}

type Slot = Arc<OnceLock<Result<Arc<CachedModule>, ModuleFetchError>>>;

/// Disk cache with per-key single-flight fetching.
pub struct ModuleCache {
    dir: PathBuf,
    fetcher: Box<dyn ModuleFetcher>,
    inflight: Mutex<HashMap<String, Slot>>,
}

impl ModuleCache {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Box<dyn ModuleFetcher>) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch (or load) a module. Concurrent callers for the same module
    /// block on one fetch and share its result.
    pub fn get(&self, descriptor: &ModuleDescriptor) -> Result<Arc<CachedModule>, ModuleFetchError> {
        let slot = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(inflight.entry(descriptor.fetch_key()).or_default())
        };
        slot.get_or_init(|| self.load(descriptor).map(Arc::new))
            .clone()
    }

    /// Fetch distinct modules in parallel.
    pub fn prefetch(&self, descriptors: &[ModuleDescriptor]) -> Vec<Result<Arc<CachedModule>, ModuleFetchError>> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = descriptors
                .iter()
                .map(|d| scope.spawn(move || self.get(d)))
                .collect();
            handles
                .into_iter()
                .zip(descriptors)
                .map(|(h, d)| {
                    h.join().unwrap_or_else(|_| {
                        Err(ModuleFetchError {
                            module: d.identity(),
                            reason: "fetch thread panicked".to_string(),
                        })
                    })
                })
                .collect()
        })
    }

    fn load(&self, descriptor: &ModuleDescriptor) -> Result<CachedModule, ModuleFetchError> {
        let identity = descriptor.identity();
        let fail = |reason: String| ModuleFetchError {
            module: identity.clone(),
            reason,
        };

        if let Some(pin) = descriptor.checksum.as_deref() {
            if let Some(key) = content_key(pin) {
                if let Some(content) = self.read_verified(&self.dir.join(&key), pin) {
                    tracing::debug!(module = %identity, key, "module cache hit");
                    return self.finish(&key, &identity, &content).map_err(fail);
                }
            }
        }

        let content = self.fetcher.fetch(descriptor).map_err(&fail)?;
        let content_hash = hasher::hash_string(&content);
        if let Some(expected) = &descriptor.checksum {
            if !expected.eq_ignore_ascii_case(&content_hash) {
                return Err(fail(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, content_hash
                )));
            }
        }
        let key = content_key(&content_hash).unwrap_or_default();
        let module = self.finish(&key, &identity, &content).map_err(&fail)?;
        let entry = self.dir.join(&key);
        if self.read_verified(&entry, &content_hash).is_some() {
            tracing::debug!(module = %identity, key, "module content unchanged");
        } else {
            self.store(&entry, &identity, &content, &content_hash)
                .map_err(&fail)?;
            tracing::info!(module = %identity, key, hash = %content_hash, "module fetched");
        }
        Ok(module)
    }

    fn finish(&self, key: &str, identity: &str, content: &str) -> Result<CachedModule, String> {
        Ok(CachedModule {
            key: key.to_string(),
            identity: identity.to_string(),
            content_hash: hasher::hash_string(content),
            file: parse_module(content)?,
        })
    }

    /// Cached content whose hash matches both its metadata and `expected`.
    fn read_verified(&self, entry: &Path, expected: &str) -> Option<String> {
        let meta: CacheMeta = serde_json::from_slice(&std::fs::read(entry.join("meta.json")).ok()?).ok()?;
        let content = std::fs::read_to_string(entry.join("module.yaml")).ok()?;
        let actual = hasher::hash_string(&content);
        if actual != meta.content_hash || !expected.eq_ignore_ascii_case(&actual) {
            tracing::warn!(entry = %entry.display(), "cached module failed verification; refetching");
            return None;
        }
        Some(content)
    }

    fn store(&self, entry: &Path, identity: &str, content: &str, content_hash: &str) -> Result<(), String> {
        let write = |name: &str, bytes: &[u8]| -> Result<(), String> {
            let path = entry.join(name);
            crate::state::write_atomic(&path, bytes).map_err(|e| e.to_string())
        };
        write("module.yaml", content.as_bytes())?;
        let meta = CacheMeta {
            identity: identity.to_string(),
            content_hash: content_hash.to_string(),
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| e.to_string())?;
        write("meta.json", &json)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sandbox::module::tests::NFS;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves fixed content, counting calls.
    pub(crate) struct CountingFetcher {
        pub content: String,
        pub calls: Arc<AtomicUsize>,
        pub delay: Duration,
    }

    impl ModuleFetcher for CountingFetcher {
        fn fetch(&self, _descriptor: &ModuleDescriptor) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(self.content.clone())
        }
    }

    fn local(path: &str) -> ModuleDescriptor {
        ModuleDescriptor {
            source: ModuleSource::Local { path: path.into() },
            version: "1.0".into(),
            checksum: None,
        }
    }

    fn pinned(path: &str, content: &str) -> ModuleDescriptor {
        ModuleDescriptor {
            checksum: Some(hasher::hash_string(content)),
            ..local(path)
        }
    }

    fn counting(delay_ms: u64) -> (Box<CountingFetcher>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountingFetcher {
                content: NFS.to_string(),
                calls: Arc::clone(&calls),
                delay: Duration::from_millis(delay_ms),
            }),
            calls,
        )
    }

    #[test]
    fn test_st032_source_yaml_shapes() {
        let l: ModuleSource = serde_yaml_ng::from_str("path: ./modules/nfs.yaml").unwrap();
        assert_eq!(l, ModuleSource::Local { path: "./modules/nfs.yaml".into() });
        let g: ModuleSource =
            serde_yaml_ng::from_str("git: https://example.com/m.git\nref: v1\npath: nfs.yaml").unwrap();
        assert_eq!(g.to_string(), "git+https://example.com/m.git//nfs.yaml?ref=v1");
    }

    #[test]
    fn test_st032_fetch_key() {
        let d = local("a.yaml");
        assert_eq!(d.identity(), "a.yaml@1.0");
        assert_eq!(d.fetch_key().len(), 64);
        assert_ne!(d.fetch_key(), local("b.yaml").fetch_key());
        assert_eq!(
            pinned("a.yaml", NFS).fetch_key(),
            hasher::digest_hex(&hasher::hash_string(NFS)).unwrap()
        );
    }

    #[test]
    fn test_st032_concurrent_requests_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, calls) = counting(100);
        let cache = ModuleCache::new(dir.path(), fetcher);
        let d = local("nfs.yaml");
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..6).map(|_| s.spawn(|| cache.get(&d))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().file.module.name == "nfs"));
    }

    #[test]
    fn test_st032_pinned_disk_hit_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let d = pinned("nfs.yaml", NFS);
        let (fetcher, calls) = counting(0);
        ModuleCache::new(dir.path(), fetcher).get(&d).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (fetcher, calls) = counting(0);
        let cached = ModuleCache::new(dir.path(), fetcher).get(&d).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cached.content_hash, hasher::hash_string(NFS));
        assert_eq!(cached.key, d.fetch_key());
    }

    #[test]
    fn test_st032_unpinned_source_reread_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let d = local("nfs.yaml");
        let (fetcher, _) = counting(0);
        let first = ModuleCache::new(dir.path(), fetcher).get(&d).unwrap();

        let (fetcher, calls) = counting(0);
        let second = ModuleCache::new(dir.path(), fetcher).get(&d).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.key, second.key);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_st032_edited_local_module_served_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let cache_dir = dir.path().join("cache");
        let cache = || {
            let fetcher = SourceFetcher::new(&src, dir.path().join("scratch"));
            ModuleCache::new(&cache_dir, Box::new(fetcher))
        };
        let d = local("nfs.yaml");

        std::fs::write(src.join("nfs.yaml"), NFS).unwrap();
        let first = cache().get(&d).unwrap();
        assert_eq!(first.content_hash, hasher::hash_string(NFS));

        let edited = NFS.replace("t3.small", "t3.large");
        std::fs::write(src.join("nfs.yaml"), &edited).unwrap();
        let second = cache().get(&d).unwrap();
        assert_eq!(second.content_hash, hasher::hash_string(&edited));
        assert_ne!(first.key, second.key);
        assert_eq!(
            second.file.resources[1].attributes["instance_type"],
            crate::core::types::Value::from("t3.large")
        );
    }

    #[test]
    fn test_st032_tampered_cache_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let d = pinned("nfs.yaml", NFS);
        let (fetcher, _) = counting(0);
        ModuleCache::new(dir.path(), fetcher).get(&d).unwrap();
        let entry = dir.path().join(d.fetch_key());
        std::fs::write(entry.join("module.yaml"), "module: { name: evil }\n").unwrap();

        let (fetcher, calls) = counting(0);
        let cached = ModuleCache::new(dir.path(), fetcher).get(&d).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.file.module.name, "nfs");
    }

    #[test]
    fn test_st032_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, _) = counting(0);
        let cache = ModuleCache::new(dir.path(), fetcher);
        let d = pinned("nfs.yaml", "something else");
        let err = cache.get(&d).unwrap_err();
        assert!(err.reason.contains("checksum mismatch"));
        assert_eq!(err.module, "nfs.yaml@1.0");
        assert_eq!(std::fs::read_dir(dir.path()).map(Iterator::count).unwrap_or(0), 0);
    }

    #[test]
    fn test_st032_prefetch_distinct_in_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, calls) = counting(50);
        let cache = ModuleCache::new(dir.path(), fetcher);
        let results = cache.prefetch(&[local("a.yaml"), local("b.yaml"), local("a.yaml")]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_st032_source_fetcher_local() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nfs.yaml"), NFS).unwrap();
        let fetcher = SourceFetcher::new(dir.path(), dir.path().join("scratch"));
        assert_eq!(fetcher.fetch(&local("nfs.yaml")).unwrap(), NFS);
        assert!(fetcher.fetch(&local("missing.yaml")).unwrap_err().contains("cannot read"));
    }
}
