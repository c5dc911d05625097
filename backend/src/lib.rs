//! Storage backend abstraction.
//!
//! Every storage system ferry can talk to implements the [`Remote`] and
//! [`Object`] traits. Optional capabilities (server-side move/copy, purge,
//! setting modification times) are advertised through [`Features`] so the
//! engine can pick fallback paths without downcasting. Backends register a
//! factory in the registry and are resolved from `name:path` specs via
//! [`new_remote`].

#[macro_use]
extern crate lazy_static;

pub mod local;
pub mod mem;
pub mod readers;
mod registry;

pub use registry::{new_remote, register, registered_backends, BackendInfo, Factory, OptionDef};

/// A hash algorithm a backend may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    Md5,
    Sha1,
}

impl HashType {
    fn bit(self) -> u32 {
        match self {
            HashType::Md5 => 1 << 0,
            HashType::Sha1 => 1 << 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashType::Md5 => "md5",
            HashType::Sha1 => "sha1",
        }
    }
}

/// The set of hash algorithms a backend supports, as a bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashSet(u32);

impl HashSet {
    pub const NONE: HashSet = HashSet(0);

    pub fn of(types: &[HashType]) -> Self {
        Self(types.iter().fold(0, |acc, t| acc | t.bit()))
    }

    pub fn contains(self, hash_type: HashType) -> bool {
        self.0 & hash_type.bit() != 0
    }

    pub fn overlap(self, other: HashSet) -> HashSet {
        HashSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The canonical member of the set (lowest bit), used when a single
    /// hash must be agreed on between two remotes.
    pub fn get_one(self) -> Option<HashType> {
        for t in [HashType::Md5, HashType::Sha1] {
            if self.contains(t) {
                return Some(t);
            }
        }
        None
    }
}

/// Modification time granularity of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Mod times are stored with this granularity.
    Of(std::time::Duration),
    /// The backend cannot store mod times at all.
    Unsupported,
}

/// Optional capabilities of a [`Remote`]. Absence of a capability is a
/// value, not an error: the engine consults this before calling the
/// corresponding method and falls back when the flag is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub server_side_copy: bool,
    pub server_side_move: bool,
    pub dir_move: bool,
    pub set_mod_time: bool,
    pub purge: bool,
}

/// Errors a backend may surface. Anything not covered by a named variant is
/// retryable at the pacer level unless tagged fatal.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found")]
    ObjectNotFound,
    #[error("directory not found")]
    DirNotFound,
    #[error("directory already exists")]
    DirExists,
    #[error("backend can't set modification time")]
    CantSetModTime,
    #[error("backend can't server-side move")]
    CantMove,
    #[error("backend can't server-side copy")]
    CantCopy,
    #[error("backend doesn't support {} hashes", .0.name())]
    HashUnsupported(HashType),
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("fatal error: {message}")]
    Fatal { message: String },
    #[error("upload must be restarted: {message}")]
    NoRetry { message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn fatal(message: impl Into<String>) -> Self {
        BackendError::Fatal {
            message: message.into(),
        }
    }

    pub fn no_retry(message: impl Into<String>) -> Self {
        BackendError::NoRetry {
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            BackendError::Fatal { .. } => true,
            BackendError::Http { status, .. } => *status == 403,
            _ => false,
        }
    }

    pub fn is_no_retry(&self) -> bool {
        matches!(self, BackendError::NoRetry { .. })
    }

    /// Whether the pacer should retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Http { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            BackendError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl pacer::Classify for BackendError {
    fn retry_class(&self) -> pacer::RetryClass {
        match self {
            BackendError::Http { status: 401, .. } => pacer::RetryClass::RefreshAuth,
            err if err.is_retryable() => pacer::RetryClass::Retry,
            _ => pacer::RetryClass::NoRetry,
        }
    }
}

/// Classify an error that has travelled through `anyhow` context layers.
pub fn is_fatal_err(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BackendError>()
        .map(BackendError::is_fatal)
        .unwrap_or(false)
}

pub fn is_no_retry_err(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BackendError>()
        .map(BackendError::is_no_retry)
        .unwrap_or(false)
}

/// Byte stream returned by [`Object::open`].
pub type Reader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Metadata accompanying an upload.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Backend-normalized path relative to the remote root.
    pub remote: String,
    pub size: u64,
    /// `None` means the source had no usable modification time.
    pub mod_time: Option<std::time::SystemTime>,
}

/// One file on a remote.
#[async_trait::async_trait]
pub trait Object: Send + Sync + std::fmt::Debug {
    /// Path relative to the remote root: forward slashes, no leading slash.
    fn remote(&self) -> &str;
    fn size(&self) -> u64;
    /// `None` is the explicit "mod time not supported" sentinel.
    fn mod_time(&self) -> Option<std::time::SystemTime>;
    /// Objects the backend declares opaque are skipped by the engine.
    fn storable(&self) -> bool {
        true
    }
    fn as_any(&self) -> &dyn std::any::Any;

    async fn hash(&self, hash_type: HashType) -> Result<String, BackendError>;
    async fn open(
        &self,
        range: Option<std::ops::Range<u64>>,
    ) -> Result<Reader, BackendError>;
    /// Overwrite the object in place, returning the fresh handle.
    async fn update(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &ObjectInfo,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError>;
    async fn remove(&self) -> Result<(), BackendError>;
    async fn set_mod_time(&self, mod_time: std::time::SystemTime) -> Result<(), BackendError>;
}

/// One entry of a single-level directory listing.
#[derive(Debug, Clone)]
pub enum DirEntry {
    File(std::sync::Arc<dyn Object>),
    Dir {
        remote: String,
        size: Option<u64>,
        count: Option<u64>,
    },
}

impl DirEntry {
    pub fn remote(&self) -> &str {
        match self {
            DirEntry::File(obj) => obj.remote(),
            DirEntry::Dir { remote, .. } => remote,
        }
    }
}

/// The root handle for one configured endpoint.
#[async_trait::async_trait]
pub trait Remote: Send + Sync {
    /// Backend type name, e.g. "local" or "mem".
    fn name(&self) -> &str;
    /// Normalized root path within the backend.
    fn root(&self) -> &str;
    fn describe(&self) -> String {
        format!("{}:{}", self.name(), self.root())
    }
    fn precision(&self) -> Precision;
    fn hashes(&self) -> HashSet;
    fn features(&self) -> Features;
    fn as_any(&self) -> &dyn std::any::Any;

    /// List one directory level, in no particular order. `dir` is relative
    /// to the root, "" for the root itself.
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, BackendError>;
    async fn new_object(&self, remote: &str) -> Result<std::sync::Arc<dyn Object>, BackendError>;
    async fn put(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &ObjectInfo,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError>;
    async fn mkdir(&self, dir: &str) -> Result<(), BackendError>;
    async fn rmdir(&self, dir: &str) -> Result<(), BackendError>;

    /// Server-side copy of `src` (an object of a compatible remote) to
    /// `remote` on this remote. Backends advertise this via
    /// [`Features::server_side_copy`].
    async fn copy_object(
        &self,
        _src: &dyn Object,
        _remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        Err(BackendError::CantCopy)
    }

    /// Server-side move; see [`Remote::copy_object`].
    async fn move_object(
        &self,
        _src: &dyn Object,
        _remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        Err(BackendError::CantMove)
    }

    /// Server-side bulk rename of the whole of `src` into this remote's
    /// root, which must not exist yet.
    async fn dir_move(&self, _src: &dyn Remote) -> Result<(), BackendError> {
        Err(BackendError::CantMove)
    }

    /// Recursively delete everything under `dir`.
    async fn purge(&self, _dir: &str) -> Result<(), BackendError> {
        Err(BackendError::NotSupported("purge"))
    }
}

/// Two remotes read and write the same configured storage.
pub fn same_config(a: &dyn Remote, b: &dyn Remote) -> bool {
    a.name() == b.name()
}

/// Two remotes address exactly the same tree.
pub fn same(a: &dyn Remote, b: &dyn Remote) -> bool {
    same_config(a, b) && a.root() == b.root()
}

/// Whether one remote's tree contains the other's.
pub fn overlapping(a: &dyn Remote, b: &dyn Remote) -> bool {
    if !same_config(a, b) {
        return false;
    }
    fn is_prefix(shorter: &str, longer: &str) -> bool {
        shorter.is_empty()
            || longer == shorter
            || longer.starts_with(&format!("{}/", shorter))
    }
    is_prefix(a.root(), b.root()) || is_prefix(b.root(), a.root())
}

/// Normalize a backend-relative path: forward slashes, no leading or
/// trailing slash.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    parts.retain(|p| *p != ".");
    parts.join("/")
}

/// Join two backend-relative paths, either of which may be empty.
pub fn join_remote(dir: &str, leaf: &str) -> String {
    if dir.is_empty() {
        leaf.to_string()
    } else if leaf.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir, leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_set_overlap_picks_canonical_member() {
        let a = HashSet::of(&[HashType::Md5, HashType::Sha1]);
        let b = HashSet::of(&[HashType::Sha1]);
        assert_eq!(a.overlap(b).get_one(), Some(HashType::Sha1));
        assert_eq!(a.overlap(HashSet::NONE).get_one(), None);
        assert_eq!(a.get_one(), Some(HashType::Md5));
    }

    #[test]
    fn normalize_strips_slashes() {
        assert_eq!(normalize_path("/a/b/"), "a/b");
        assert_eq!(normalize_path("a//b"), "a/b");
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(normalize_path("./a/./b"), "a/b");
    }

    #[test]
    fn join_remote_handles_empty_sides() {
        assert_eq!(join_remote("", "x"), "x");
        assert_eq!(join_remote("a", ""), "a");
        assert_eq!(join_remote("a", "b"), "a/b");
    }

    #[test]
    fn http_status_classification() {
        let err = BackendError::Http {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        let err = BackendError::Http {
            status: 403,
            message: "denied".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn classification_survives_context_layers() {
        let err = anyhow::Error::new(BackendError::fatal("account suspended"))
            .context("failed to upload");
        assert!(is_fatal_err(&err));
        assert!(!is_no_retry_err(&err));
    }
}
