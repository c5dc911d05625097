//! In-memory object store backend.
//!
//! Buckets live for the whole process and are shared by name, so two specs
//! addressing the same bucket see the same data (which is what lets
//! `--backup-dir` target a sibling path on the same remote). The store is
//! bucket-style: directories are synthesized from key prefixes and `mkdir`
//! is a no-op. Every operation goes through the remote's pacer, the same
//! way a wire-protocol backend would pace its RPCs.

use crate::{
    join_remote, normalize_path, BackendError, BackendInfo, DirEntry, Features, HashSet,
    HashType, Object, ObjectInfo, OptionDef, Precision, Remote,
};

const OPTIONS: &[OptionDef] = &[OptionDef {
    name: "bucket",
    help: "Bucket the remote is rooted at (first path component)",
}];

pub fn backend_info() -> BackendInfo {
    BackendInfo {
        name: "mem",
        description: "In-memory object store",
        options: OPTIONS,
        factory: |path| Ok(std::sync::Arc::new(MemRemote::new(path))),
    }
}

#[derive(Clone)]
struct Entry {
    data: bytes::Bytes,
    mod_time: std::time::SystemTime,
}

type Store = std::sync::Arc<std::sync::Mutex<std::collections::BTreeMap<String, Entry>>>;

lazy_static! {
    static ref BUCKETS: std::sync::Mutex<std::collections::HashMap<String, Store>> =
        std::sync::Mutex::new(std::collections::HashMap::new());
}

fn bucket_store(bucket: &str) -> Store {
    BUCKETS
        .lock()
        .unwrap()
        .entry(bucket.to_string())
        .or_default()
        .clone()
}

pub struct MemRemote {
    bucket: String,
    /// Key prefix within the bucket, "" for the bucket root.
    prefix: String,
    root_str: String,
    store: Store,
    pacer: pacer::Pacer,
}

impl MemRemote {
    fn new(path: &str) -> Self {
        let path = normalize_path(path);
        let (bucket, prefix) = match path.split_once('/') {
            Some((bucket, prefix)) => (bucket.to_string(), prefix.to_string()),
            None => (path.clone(), String::new()),
        };
        let store = bucket_store(&bucket);
        Self {
            bucket,
            prefix,
            root_str: path,
            store,
            pacer: pacer::Pacer::new().min_sleep(std::time::Duration::ZERO),
        }
    }

    fn key(&self, remote: &str) -> String {
        join_remote(&self.prefix, remote)
    }

    fn object_from(&self, remote: String, key: String, entry: &Entry) -> MemObject {
        MemObject {
            store: self.store.clone(),
            key,
            remote,
            data: entry.data.clone(),
            mod_time: entry.mod_time,
        }
    }
}

#[async_trait::async_trait]
impl Remote for MemRemote {
    fn name(&self) -> &str {
        "mem"
    }

    fn root(&self) -> &str {
        &self.root_str
    }

    fn precision(&self) -> Precision {
        Precision::Of(std::time::Duration::from_nanos(1))
    }

    fn hashes(&self) -> HashSet {
        HashSet::of(&[HashType::Md5])
    }

    fn features(&self) -> Features {
        Features {
            server_side_copy: true,
            server_side_move: true,
            dir_move: true,
            set_mod_time: true,
            purge: true,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, BackendError> {
        if self.bucket.is_empty() {
            // account level: buckets list as directories
            let buckets = BUCKETS.lock().unwrap();
            return Ok(buckets
                .keys()
                .filter(|name| !name.is_empty())
                .map(|name| DirEntry::Dir {
                    remote: name.clone(),
                    size: None,
                    count: None,
                })
                .collect());
        }
        self.pacer
            .call(|| async move {
                let full = self.key(dir);
                let want = if full.is_empty() {
                    String::new()
                } else {
                    format!("{}/", full)
                };
                let store = self.store.lock().unwrap();
                let mut entries = Vec::new();
                let mut seen_dirs = std::collections::BTreeSet::new();
                for (key, entry) in store.iter() {
                    let rest = match key.strip_prefix(&want) {
                        Some(rest) if !rest.is_empty() => rest,
                        _ => continue,
                    };
                    match rest.split_once('/') {
                        None => {
                            let remote = join_remote(dir, rest);
                            entries.push(DirEntry::File(std::sync::Arc::new(
                                self.object_from(remote, key.clone(), entry),
                            )));
                        }
                        Some((first, _)) => {
                            if seen_dirs.insert(first.to_string()) {
                                entries.push(DirEntry::Dir {
                                    remote: join_remote(dir, first),
                                    size: None,
                                    count: None,
                                });
                            }
                        }
                    }
                }
                Ok(entries)
            })
            .await
    }

    async fn new_object(
        &self,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        self.pacer
            .call(|| async move {
                let key = self.key(remote);
                let store = self.store.lock().unwrap();
                match store.get(&key) {
                    Some(entry) => Ok(std::sync::Arc::new(self.object_from(
                        remote.to_string(),
                        key.clone(),
                        entry,
                    )) as std::sync::Arc<dyn Object>),
                    None => Err(BackendError::ObjectNotFound),
                }
            })
            .await
    }

    async fn put(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &ObjectInfo,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        use tokio::io::AsyncReadExt;
        let mut data = Vec::with_capacity(info.size as usize);
        reader.read_to_end(&mut data).await?;
        let entry = Entry {
            data: bytes::Bytes::from(data),
            mod_time: info.mod_time.unwrap_or_else(std::time::SystemTime::now),
        };
        let key = self.key(&info.remote);
        self.pacer
            .call(|| {
                let key = key.clone();
                let entry = entry.clone();
                async move {
                    self.store.lock().unwrap().insert(key.clone(), entry.clone());
                    Ok(std::sync::Arc::new(self.object_from(info.remote.clone(), key, &entry))
                        as std::sync::Arc<dyn Object>)
                }
            })
            .await
    }

    async fn mkdir(&self, _dir: &str) -> Result<(), BackendError> {
        // bucket-style store: directories don't exist
        Ok(())
    }

    async fn rmdir(&self, _dir: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn copy_object(
        &self,
        src: &dyn Object,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        let src = src
            .as_any()
            .downcast_ref::<MemObject>()
            .ok_or(BackendError::CantCopy)?;
        self.pacer
            .call(|| async move {
                let entry = {
                    let store = src.store.lock().unwrap();
                    store.get(&src.key).cloned()
                }
                .ok_or(BackendError::ObjectNotFound)?;
                let key = self.key(remote);
                self.store.lock().unwrap().insert(key.clone(), entry.clone());
                Ok(std::sync::Arc::new(self.object_from(
                    remote.to_string(),
                    key,
                    &entry,
                )) as std::sync::Arc<dyn Object>)
            })
            .await
    }

    async fn move_object(
        &self,
        src: &dyn Object,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        let src = src
            .as_any()
            .downcast_ref::<MemObject>()
            .ok_or(BackendError::CantMove)?;
        self.pacer
            .call(|| async move {
                let entry = {
                    let mut store = src.store.lock().unwrap();
                    store.remove(&src.key)
                }
                .ok_or(BackendError::ObjectNotFound)?;
                let key = self.key(remote);
                self.store.lock().unwrap().insert(key.clone(), entry.clone());
                Ok(std::sync::Arc::new(self.object_from(
                    remote.to_string(),
                    key,
                    &entry,
                )) as std::sync::Arc<dyn Object>)
            })
            .await
    }

    async fn dir_move(&self, src: &dyn Remote) -> Result<(), BackendError> {
        let src = src
            .as_any()
            .downcast_ref::<MemRemote>()
            .ok_or(BackendError::CantMove)?;
        self.pacer
            .call(|| async move {
                let moved: Vec<(String, Entry)> = {
                    let store = src.store.lock().unwrap();
                    store
                        .iter()
                        .filter(|(key, _)| under_prefix(key, &src.prefix))
                        .map(|(key, entry)| (key.clone(), entry.clone()))
                        .collect()
                };
                {
                    let store = self.store.lock().unwrap();
                    if store.keys().any(|key| under_prefix(key, &self.prefix)) {
                        return Err(BackendError::DirExists);
                    }
                }
                for (key, entry) in moved {
                    let rest = strip_prefix(&key, &src.prefix);
                    let new_key = join_remote(&self.prefix, rest);
                    src.store.lock().unwrap().remove(&key);
                    self.store.lock().unwrap().insert(new_key, entry);
                }
                Ok(())
            })
            .await
    }

    async fn purge(&self, dir: &str) -> Result<(), BackendError> {
        self.pacer
            .call(|| async move {
                let full = self.key(dir);
                let mut store = self.store.lock().unwrap();
                store.retain(|key, _| !under_prefix(key, &full));
                Ok(())
            })
            .await
    }
}

fn under_prefix(key: &str, prefix: &str) -> bool {
    prefix.is_empty() || key == prefix || key.starts_with(&format!("{}/", prefix))
}

fn strip_prefix<'a>(key: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key)
    }
}

#[derive(Debug)]
pub struct MemObject {
    store: Store,
    key: String,
    remote: String,
    data: bytes::Bytes,
    mod_time: std::time::SystemTime,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("size", &self.data.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Object for MemObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mod_time(&self) -> Option<std::time::SystemTime> {
        Some(self.mod_time)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn hash(&self, hash_type: HashType) -> Result<String, BackendError> {
        if hash_type != HashType::Md5 {
            return Err(BackendError::HashUnsupported(hash_type));
        }
        Ok(format!("{:x}", md5::compute(&self.data)))
    }

    async fn open(
        &self,
        range: Option<std::ops::Range<u64>>,
    ) -> Result<crate::Reader, BackendError> {
        let data = match range {
            Some(range) => {
                let start = (range.start as usize).min(self.data.len());
                let end = (range.end as usize).min(self.data.len());
                self.data.slice(start..end)
            }
            None => self.data.clone(),
        };
        Ok(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    async fn update(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &ObjectInfo,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        use tokio::io::AsyncReadExt;
        let mut data = Vec::with_capacity(info.size as usize);
        reader.read_to_end(&mut data).await?;
        let entry = Entry {
            data: bytes::Bytes::from(data),
            mod_time: info.mod_time.unwrap_or_else(std::time::SystemTime::now),
        };
        self.store
            .lock()
            .unwrap()
            .insert(self.key.clone(), entry.clone());
        Ok(std::sync::Arc::new(MemObject {
            store: self.store.clone(),
            key: self.key.clone(),
            remote: self.remote.clone(),
            data: entry.data,
            mod_time: entry.mod_time,
        }))
    }

    async fn remove(&self) -> Result<(), BackendError> {
        self.store
            .lock()
            .unwrap()
            .remove(&self.key)
            .map(|_| ())
            .ok_or(BackendError::ObjectNotFound)
    }

    async fn set_mod_time(&self, mod_time: std::time::SystemTime) -> Result<(), BackendError> {
        let mut store = self.store.lock().unwrap();
        match store.get_mut(&self.key) {
            Some(entry) => {
                entry.mod_time = mod_time;
                Ok(())
            }
            None => Err(BackendError::ObjectNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    async fn remote(bucket: &str) -> std::sync::Arc<dyn Remote> {
        crate::new_remote(&format!("mem:{}", bucket)).await.unwrap()
    }

    async fn put_str(
        remote: &std::sync::Arc<dyn Remote>,
        path: &str,
        data: &str,
    ) -> std::sync::Arc<dyn Object> {
        let mut reader: &[u8] = data.as_bytes();
        remote
            .put(
                &mut reader,
                &ObjectInfo {
                    remote: path.to_string(),
                    size: data.len() as u64,
                    mod_time: Some(std::time::SystemTime::UNIX_EPOCH),
                },
            )
            .await
            .unwrap()
    }

    #[test(tokio::test)]
    async fn listing_synthesizes_directories() {
        let remote = remote("mem-list").await;
        put_str(&remote, "top", "1").await;
        put_str(&remote, "sub/inner", "2").await;
        put_str(&remote, "sub/deeper/leaf", "3").await;

        let mut names: Vec<String> = remote
            .list("")
            .await
            .unwrap()
            .iter()
            .map(|e| e.remote().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["sub", "top"]);

        let mut names: Vec<String> = remote
            .list("sub")
            .await
            .unwrap()
            .iter()
            .map(|e| e.remote().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["sub/deeper", "sub/inner"]);
    }

    #[test(tokio::test)]
    async fn buckets_are_shared_by_name() {
        let a = remote("mem-shared").await;
        put_str(&a, "f", "data").await;
        let b = crate::new_remote("mem:mem-shared").await.unwrap();
        let obj = b.new_object("f").await.unwrap();
        assert_eq!(obj.size(), 4);
    }

    #[test(tokio::test)]
    async fn move_between_prefixes() {
        let root = remote("mem-move").await;
        let obj = put_str(&root, "a/x", "content").await;
        let moved = root.move_object(obj.as_ref(), "b/x").await.unwrap();
        assert_eq!(moved.remote(), "b/x");
        assert!(matches!(
            root.new_object("a/x").await,
            Err(BackendError::ObjectNotFound)
        ));
        assert_eq!(
            root.new_object("b/x").await.unwrap().hash(HashType::Md5).await.unwrap(),
            format!("{:x}", md5::compute("content"))
        );
    }

    #[test(tokio::test)]
    async fn empty_file_has_the_well_known_md5() {
        let remote = remote("mem-empty").await;
        let obj = put_str(&remote, "empty", "").await;
        assert_eq!(
            obj.hash(HashType::Md5).await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test(tokio::test)]
    async fn purge_removes_subtree_only() {
        let remote = remote("mem-purge").await;
        put_str(&remote, "keep", "1").await;
        put_str(&remote, "gone/a", "2").await;
        put_str(&remote, "gone/b/c", "3").await;
        remote.purge("gone").await.unwrap();
        assert!(remote.new_object("keep").await.is_ok());
        assert!(remote.new_object("gone/a").await.is_err());
        assert!(remote.new_object("gone/b/c").await.is_err());
    }
}
