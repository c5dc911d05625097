//! Local filesystem backend.

use crate::{
    join_remote, BackendError, BackendInfo, DirEntry, Features, HashSet, HashType, Object,
    ObjectInfo, OptionDef, Precision, Remote,
};

const OPTIONS: &[OptionDef] = &[OptionDef {
    name: "root",
    help: "Directory the remote is rooted at",
}];

pub fn backend_info() -> BackendInfo {
    BackendInfo {
        name: "local",
        description: "Local filesystem",
        options: OPTIONS,
        factory: |path| Ok(std::sync::Arc::new(LocalRemote::new(path))),
    }
}

pub struct LocalRemote {
    root: std::path::PathBuf,
    root_str: String,
}

impl LocalRemote {
    fn new(path: &str) -> Self {
        let path = if path.is_empty() { "." } else { path };
        Self {
            root: std::path::PathBuf::from(path),
            root_str: path.to_string(),
        }
    }

    fn abs(&self, remote: &str) -> std::path::PathBuf {
        if remote.is_empty() {
            self.root.clone()
        } else {
            self.root.join(remote)
        }
    }
}

async fn stat_object(
    abs: std::path::PathBuf,
    remote: String,
) -> Result<std::sync::Arc<dyn Object>, BackendError> {
    let metadata = match tokio::fs::metadata(&abs).await {
        Ok(m) => m,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackendError::ObjectNotFound)
        }
        Err(err) => return Err(err.into()),
    };
    if metadata.is_dir() {
        return Err(BackendError::ObjectNotFound);
    }
    Ok(std::sync::Arc::new(LocalObject {
        abs,
        remote,
        size: metadata.len(),
        mod_time: metadata.modified().ok(),
        hash_cache: tokio::sync::Mutex::new(None),
    }))
}

async fn write_file(
    abs: &std::path::Path,
    reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    mod_time: Option<std::time::SystemTime>,
) -> Result<(), BackendError> {
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(abs).await?;
    tokio::io::copy(reader, &mut file).await?;
    file.sync_all().await?;
    drop(file);
    if let Some(mod_time) = mod_time {
        set_file_mod_time(abs.to_path_buf(), mod_time).await?;
    }
    Ok(())
}

async fn set_file_mod_time(
    abs: std::path::PathBuf,
    mod_time: std::time::SystemTime,
) -> Result<(), BackendError> {
    tokio::task::spawn_blocking(move || {
        filetime::set_file_mtime(&abs, filetime::FileTime::from_system_time(mod_time))
    })
    .await
    .map_err(|err| BackendError::Other(format!("set_file_mtime task failed: {}", err)))??;
    Ok(())
}

#[async_trait::async_trait]
impl Remote for LocalRemote {
    fn name(&self) -> &str {
        "local"
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
        let abs = self.abs(dir);
        let mut read_dir = match tokio::fs::read_dir(&abs).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::DirNotFound)
            }
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    tracing::warn!("skipping file with non-unicode name {:?}", name);
                    continue;
                }
            };
            let remote = join_remote(dir, &name);
            // follows symlinks so a link to a file lists as that file
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!("skipping {:?}: {}", entry.path(), err);
                    continue;
                }
            };
            if metadata.is_dir() {
                entries.push(DirEntry::Dir {
                    remote,
                    size: None,
                    count: None,
                });
            } else {
                entries.push(DirEntry::File(std::sync::Arc::new(LocalObject {
                    abs: entry.path(),
                    remote,
                    size: metadata.len(),
                    mod_time: metadata.modified().ok(),
                    hash_cache: tokio::sync::Mutex::new(None),
                })));
            }
        }
        Ok(entries)
    }

    async fn new_object(
        &self,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        stat_object(self.abs(remote), remote.to_string()).await
    }

    async fn put(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &ObjectInfo,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        let abs = self.abs(&info.remote);
        write_file(&abs, reader, info.mod_time).await?;
        stat_object(abs, info.remote.clone()).await
    }

    async fn mkdir(&self, dir: &str) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(self.abs(dir)).await?;
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> Result<(), BackendError> {
        match tokio::fs::remove_dir(self.abs(dir)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::DirNotFound)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn copy_object(
        &self,
        src: &dyn Object,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        let src = src
            .as_any()
            .downcast_ref::<LocalObject>()
            .ok_or(BackendError::CantCopy)?;
        let abs = self.abs(remote);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src.abs, &abs).await?;
        if let Some(mod_time) = src.mod_time {
            set_file_mod_time(abs.clone(), mod_time).await?;
        }
        stat_object(abs, remote.to_string()).await
    }

    async fn move_object(
        &self,
        src: &dyn Object,
        remote: &str,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        let src = src
            .as_any()
            .downcast_ref::<LocalObject>()
            .ok_or(BackendError::CantMove)?;
        let abs = self.abs(remote);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src.abs, &abs).await?;
        stat_object(abs, remote.to_string()).await
    }

    async fn dir_move(&self, src: &dyn Remote) -> Result<(), BackendError> {
        let src = src
            .as_any()
            .downcast_ref::<LocalRemote>()
            .ok_or(BackendError::CantMove)?;
        if tokio::fs::metadata(&self.root).await.is_ok() {
            return Err(BackendError::DirExists);
        }
        if let Some(parent) = self.root.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src.root, &self.root).await?;
        Ok(())
    }

    async fn purge(&self, dir: &str) -> Result<(), BackendError> {
        match tokio::fs::remove_dir_all(self.abs(dir)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::DirNotFound)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug)]
pub struct LocalObject {
    abs: std::path::PathBuf,
    remote: String,
    size: u64,
    mod_time: Option<std::time::SystemTime>,
    hash_cache: tokio::sync::Mutex<Option<String>>,
}

#[async_trait::async_trait]
impl Object for LocalObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mod_time(&self) -> Option<std::time::SystemTime> {
        self.mod_time
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn hash(&self, hash_type: HashType) -> Result<String, BackendError> {
        if hash_type != HashType::Md5 {
            return Err(BackendError::HashUnsupported(hash_type));
        }
        let mut cache = self.hash_cache.lock().await;
        if let Some(hash) = cache.as_ref() {
            return Ok(hash.clone());
        }
        use tokio::io::AsyncReadExt;
        let mut file = tokio::fs::File::open(&self.abs).await?;
        let mut context = md5::Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
        }
        let hash = format!("{:x}", context.compute());
        *cache = Some(hash.clone());
        Ok(hash)
    }

    async fn open(
        &self,
        range: Option<std::ops::Range<u64>>,
    ) -> Result<crate::Reader, BackendError> {
        let mut file = tokio::fs::File::open(&self.abs).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BackendError::ObjectNotFound
            } else {
                err.into()
            }
        })?;
        match range {
            Some(range) => {
                use tokio::io::{AsyncReadExt, AsyncSeekExt};
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                Ok(Box::new(file.take(range.end - range.start)))
            }
            None => Ok(Box::new(file)),
        }
    }

    async fn update(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        info: &ObjectInfo,
    ) -> Result<std::sync::Arc<dyn Object>, BackendError> {
        write_file(&self.abs, reader, info.mod_time).await?;
        stat_object(self.abs.clone(), self.remote.clone()).await
    }

    async fn remove(&self) -> Result<(), BackendError> {
        match tokio::fs::remove_file(&self.abs).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::ObjectNotFound)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn set_mod_time(&self, mod_time: std::time::SystemTime) -> Result<(), BackendError> {
        set_file_mod_time(self.abs.clone(), mod_time).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    async fn remote_in(dir: &std::path::Path) -> std::sync::Arc<dyn Remote> {
        crate::new_remote(dir.to_str().unwrap()).await.unwrap()
    }

    async fn put_str(
        remote: &std::sync::Arc<dyn Remote>,
        path: &str,
        data: &str,
        mod_time: std::time::SystemTime,
    ) -> std::sync::Arc<dyn Object> {
        let mut reader: &[u8] = data.as_bytes();
        remote
            .put(
                &mut reader,
                &ObjectInfo {
                    remote: path.to_string(),
                    size: data.len() as u64,
                    mod_time: Some(mod_time),
                },
            )
            .await
            .unwrap()
    }

    #[test(tokio::test)]
    async fn put_list_and_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = remote_in(tmp.path()).await;
        let mod_time =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(981_173_106);
        put_str(&remote, "dir/hello", "hello", mod_time).await;

        let top = remote.list("").await.unwrap();
        assert_eq!(top.len(), 1);
        assert!(matches!(&top[0], DirEntry::Dir { remote, .. } if remote == "dir"));

        let inner = remote.list("dir").await.unwrap();
        assert_eq!(inner.len(), 1);
        let obj = match &inner[0] {
            DirEntry::File(obj) => obj.clone(),
            other => panic!("expected file, got {:?}", other),
        };
        assert_eq!(obj.remote(), "dir/hello");
        assert_eq!(obj.size(), 5);
        assert_eq!(obj.mod_time().unwrap(), mod_time);
        assert_eq!(
            obj.hash(HashType::Md5).await.unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test(tokio::test)]
    async fn missing_objects_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = remote_in(tmp.path()).await;
        assert!(matches!(
            remote.new_object("nope").await,
            Err(BackendError::ObjectNotFound)
        ));
        assert!(matches!(
            remote.list("nope").await,
            Err(BackendError::DirNotFound)
        ));
        // a directory is not an object
        remote.mkdir("sub").await.unwrap();
        assert!(matches!(
            remote.new_object("sub").await,
            Err(BackendError::ObjectNotFound)
        ));
    }

    #[test(tokio::test)]
    async fn server_side_move_preserves_content() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = remote_in(tmp.path()).await;
        let mod_time =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(981_173_106);
        let obj = put_str(&remote, "a/x", "payload", mod_time).await;
        let moved = remote.move_object(obj.as_ref(), "b/x").await.unwrap();
        assert_eq!(moved.remote(), "b/x");
        assert_eq!(moved.size(), 7);
        assert!(matches!(
            remote.new_object("a/x").await,
            Err(BackendError::ObjectNotFound)
        ));
    }

    #[test(tokio::test)]
    async fn set_mod_time_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = remote_in(tmp.path()).await;
        let obj = put_str(&remote, "f", "x", std::time::SystemTime::now()).await;
        let new_time =
            std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_324_817_999);
        obj.set_mod_time(new_time).await.unwrap();
        let fresh = remote.new_object("f").await.unwrap();
        assert_eq!(fresh.mod_time().unwrap(), new_time);
    }

    #[test(tokio::test)]
    async fn open_with_range() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = remote_in(tmp.path()).await;
        let obj = put_str(&remote, "f", "abcdef", std::time::SystemTime::now()).await;
        let mut reader = obj.open(Some(1..4)).await.unwrap();
        let mut out = Vec::new();
        use tokio::io::AsyncReadExt;
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bcd");
    }
}
