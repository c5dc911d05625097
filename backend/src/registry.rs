//! Maps a spec prefix to a backend factory.
//!
//! A remote spec is `<name>:<path>`; the part before the first colon picks
//! the backend, the rest is the backend-specific root. A spec without a
//! colon is a local filesystem path. A spec ending in `:` addresses the
//! backend root.

use crate::{BackendError, DirEntry, Features, HashSet, ObjectInfo, Precision, Remote};

/// A configurable option a backend understands. The engine never sources
/// values itself; the config layer passes them through the factory.
#[derive(Debug, Clone, Copy)]
pub struct OptionDef {
    pub name: &'static str,
    pub help: &'static str,
}

/// Construct a remote rooted at the given backend-specific path.
pub type Factory = fn(&str) -> Result<std::sync::Arc<dyn Remote>, BackendError>;

#[derive(Clone)]
pub struct BackendInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub options: &'static [OptionDef],
    pub factory: Factory,
}

lazy_static! {
    static ref REGISTRY: std::sync::Mutex<Vec<BackendInfo>> = std::sync::Mutex::new(vec![
        crate::local::backend_info(),
        crate::mem::backend_info(),
    ]);
}

/// Register an additional backend. Later registrations win on name clashes.
pub fn register(info: BackendInfo) {
    REGISTRY.lock().unwrap().insert(0, info);
}

/// Names and descriptions of every registered backend.
pub fn registered_backends() -> Vec<(&'static str, &'static str)> {
    REGISTRY
        .lock()
        .unwrap()
        .iter()
        .map(|info| (info.name, info.description))
        .collect()
}

fn lookup(name: &str) -> Result<BackendInfo, BackendError> {
    REGISTRY
        .lock()
        .unwrap()
        .iter()
        .find(|info| info.name == name)
        .cloned()
        .ok_or_else(|| BackendError::fatal(format!("unknown backend {:?}", name)))
}

fn split_spec(spec: &str) -> (&str, &str) {
    match spec.split_once(':') {
        Some((name, path)) if !name.is_empty() && !name.contains('/') => (name, path),
        _ => ("local", spec),
    }
}

/// Resolve a `name:path` spec to a remote.
///
/// If the path names an existing object rather than a directory, the
/// returned handle is a restricted view whose listing contains only that
/// object, so operations on single-file specs work unchanged.
pub async fn new_remote(spec: &str) -> Result<std::sync::Arc<dyn Remote>, BackendError> {
    let (name, path) = split_spec(spec);
    let info = lookup(name)?;
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    let probe = match path.rsplit_once('/') {
        Some(("", leaf)) if !leaf.is_empty() => Some(("/", leaf)),
        Some((parent, leaf)) if !leaf.is_empty() => Some((parent, leaf)),
        None if !path.is_empty() => Some(("", path)),
        _ => None,
    };
    if let Some((parent, leaf)) = probe {
        let parent_remote = (info.factory)(parent)?;
        match parent_remote.new_object(leaf).await {
            Ok(_) => {
                tracing::debug!("{:?} points at a single object", spec);
                return Ok(std::sync::Arc::new(SingleObjectRemote {
                    inner: parent_remote,
                    leaf: leaf.to_string(),
                }));
            }
            Err(BackendError::ObjectNotFound) | Err(BackendError::DirNotFound) => {}
            Err(err) => return Err(err),
        }
    }
    (info.factory)(path)
}

/// A remote restricted to a single object inside its parent directory.
struct SingleObjectRemote {
    inner: std::sync::Arc<dyn Remote>,
    leaf: String,
}

#[async_trait::async_trait]
impl Remote for SingleObjectRemote {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn root(&self) -> &str {
        self.inner.root()
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.inner.describe(), self.leaf)
    }

    fn precision(&self) -> Precision {
        self.inner.precision()
    }

    fn hashes(&self) -> HashSet {
        self.inner.hashes()
    }

    fn features(&self) -> Features {
        self.inner.features()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, BackendError> {
        if !dir.is_empty() {
            return Err(BackendError::DirNotFound);
        }
        match self.inner.new_object(&self.leaf).await {
            Ok(obj) => Ok(vec![DirEntry::File(obj)]),
            Err(BackendError::ObjectNotFound) => Ok(vec![]),
            Err(err) => Err(err),
        }
    }

    async fn new_object(
        &self,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn crate::Object>, BackendError> {
        if remote != self.leaf {
            return Err(BackendError::ObjectNotFound);
        }
        self.inner.new_object(remote).await
    }

    async fn put(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &ObjectInfo,
    ) -> Result<std::sync::Arc<dyn crate::Object>, BackendError> {
        self.inner.put(reader, info).await
    }

    async fn mkdir(&self, dir: &str) -> Result<(), BackendError> {
        self.inner.mkdir(dir).await
    }

    async fn rmdir(&self, dir: &str) -> Result<(), BackendError> {
        self.inner.rmdir(dir).await
    }

    async fn copy_object(
        &self,
        src: &dyn crate::Object,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn crate::Object>, BackendError> {
        self.inner.copy_object(src, remote).await
    }

    async fn move_object(
        &self,
        src: &dyn crate::Object,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn crate::Object>, BackendError> {
        self.inner.move_object(src, remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_splitting() {
        assert_eq!(split_spec("mem:bucket/dir"), ("mem", "bucket/dir"));
        assert_eq!(split_spec("mem:"), ("mem", ""));
        assert_eq!(split_spec("/tmp/dir"), ("local", "/tmp/dir"));
        assert_eq!(split_spec("plain"), ("local", "plain"));
        // a colon later in a path-like spec is not a backend prefix
        assert_eq!(split_spec("dir/odd:name"), ("local", "dir/odd:name"));
    }

    #[tokio::test]
    async fn unknown_backend_is_fatal() {
        let err = match new_remote("nosuch:path").await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn resolves_mem_spec() {
        let remote = new_remote("mem:registry-test/sub").await.unwrap();
        assert_eq!(remote.name(), "mem");
        assert_eq!(remote.root(), "registry-test/sub");
    }

    #[tokio::test]
    async fn single_file_spec_lists_only_that_object() {
        let parent = new_remote("mem:registry-single").await.unwrap();
        let data: &[u8] = b"payload";
        let mut reader: &[u8] = data;
        parent
            .put(
                &mut reader,
                &ObjectInfo {
                    remote: "dir/one".to_string(),
                    size: data.len() as u64,
                    mod_time: Some(std::time::SystemTime::UNIX_EPOCH),
                },
            )
            .await
            .unwrap();

        let single = new_remote("mem:registry-single/dir/one").await.unwrap();
        let listing = single.list("").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].remote(), "one");
        assert!(matches!(
            single.new_object("other").await,
            Err(BackendError::ObjectNotFound)
        ));
    }
}
