//! Listing helpers shared by the flat traversal, purge and check.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use backend::{BackendError, DirEntry, Object, Remote};

/// Depth value meaning "no limit".
pub const MAX_DEPTH: u32 = u32::MAX;

/// One directory level, lexicographically sorted by name. The merge in the
/// directory-at-a-time traversal depends on this ordering.
pub async fn list_dir_sorted(
    remote: &std::sync::Arc<dyn Remote>,
    dir: &str,
) -> Result<Vec<DirEntry>, BackendError> {
    let mut entries = remote.list(dir).await?;
    entries.sort_by(|a, b| a.remote().cmp(b.remote()));
    Ok(entries)
}

/// Read a whole subtree into a map keyed by remote path.
pub async fn read_files_map(
    remote: std::sync::Arc<dyn Remote>,
    dir: &str,
    max_depth: u32,
) -> Result<std::collections::HashMap<String, std::sync::Arc<dyn Object>>> {
    let files = std::sync::Arc::new(std::sync::Mutex::new(std::collections::HashMap::new()));
    gather(remote.clone(), dir.to_string(), max_depth, files.clone())
        .await
        .with_context(|| format!("error listing {}", remote.describe()))?;
    let files = std::sync::Arc::try_unwrap(files)
        .expect("listing tasks still hold the map")
        .into_inner()
        .unwrap();
    Ok(files)
}

#[async_recursion]
async fn gather(
    remote: std::sync::Arc<dyn Remote>,
    dir: String,
    depth: u32,
    files: std::sync::Arc<
        std::sync::Mutex<std::collections::HashMap<String, std::sync::Arc<dyn Object>>>,
    >,
) -> Result<()> {
    let entries = match list_dir_sorted(&remote, &dir).await {
        Ok(entries) => entries,
        Err(BackendError::DirNotFound) => return Ok(()),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to list directory {:?}", dir)))
        }
    };
    let mut join_set = tokio::task::JoinSet::new();
    for entry in entries {
        match entry {
            DirEntry::File(obj) => {
                files.lock().unwrap().insert(obj.remote().to_string(), obj);
            }
            DirEntry::Dir { remote: sub, .. } => {
                if depth > 1 {
                    join_set.spawn(gather(
                        remote.clone(),
                        sub,
                        depth - 1,
                        files.clone(),
                    ));
                }
            }
        }
    }
    let mut first_err: Option<anyhow::Error> = None;
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!("listing failed: {:#}", err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(anyhow::Error::new(err));
                }
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Stream every file of a subtree into `tx`, stopping early when the
/// receiver goes away or `abort` fires.
#[async_recursion]
pub async fn files_to_chan(
    remote: std::sync::Arc<dyn Remote>,
    dir: String,
    depth: u32,
    tx: async_channel::Sender<std::sync::Arc<dyn Object>>,
    abort: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let entries = match list_dir_sorted(&remote, &dir).await {
        Ok(entries) => entries,
        Err(BackendError::DirNotFound) => return Ok(()),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to list directory {:?}", dir)))
        }
    };
    for entry in entries {
        if abort.is_cancelled() {
            return Ok(());
        }
        match entry {
            DirEntry::File(obj) => {
                tokio::select! {
                    _ = abort.cancelled() => return Ok(()),
                    res = tx.send(obj) => {
                        if res.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            DirEntry::Dir { remote: sub, .. } => {
                if depth > 1 {
                    files_to_chan(remote.clone(), sub, depth - 1, tx.clone(), abort.clone())
                        .await?;
                }
            }
        }
    }
    Ok(())
}

/// Every directory of a subtree, parents before children.
pub async fn list_dirs(
    remote: &std::sync::Arc<dyn Remote>,
    dir: &str,
    max_depth: u32,
) -> Result<Vec<String>> {
    let mut dirs = Vec::new();
    let mut pending = std::collections::VecDeque::new();
    pending.push_back((dir.to_string(), max_depth));
    while let Some((dir, depth)) = pending.pop_front() {
        let entries = match list_dir_sorted(remote, &dir).await {
            Ok(entries) => entries,
            Err(BackendError::DirNotFound) => continue,
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to list directory {:?}", dir)))
            }
        };
        for entry in entries {
            if let DirEntry::Dir { remote: sub, .. } = entry {
                if depth > 1 {
                    pending.push_back((sub.clone(), depth - 1));
                }
                dirs.push(sub);
            }
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::ObjectInfo;
    use test_log::test;

    async fn seeded_remote(bucket: &str) -> std::sync::Arc<dyn Remote> {
        let remote = backend::new_remote(&format!("mem:{}", bucket)).await.unwrap();
        for path in ["b", "a/one", "a/two", "a/deep/three"] {
            let mut reader: &[u8] = b"x";
            remote
                .put(
                    &mut reader,
                    &ObjectInfo {
                        remote: path.to_string(),
                        size: 1,
                        mod_time: Some(std::time::SystemTime::UNIX_EPOCH),
                    },
                )
                .await
                .unwrap();
        }
        remote
    }

    #[test(tokio::test)]
    async fn read_files_map_is_recursive() {
        let remote = seeded_remote("walk-map").await;
        let files = read_files_map(remote, "", MAX_DEPTH).await.unwrap();
        let mut paths: Vec<&String> = files.keys().collect();
        paths.sort();
        assert_eq!(paths, vec!["a/deep/three", "a/one", "a/two", "b"]);
    }

    #[test(tokio::test)]
    async fn max_depth_caps_recursion() {
        let remote = seeded_remote("walk-depth").await;
        let files = read_files_map(remote, "", 2).await.unwrap();
        let mut paths: Vec<&String> = files.keys().collect();
        paths.sort();
        assert_eq!(paths, vec!["a/one", "a/two", "b"]);
    }

    #[test(tokio::test)]
    async fn files_stream_through_channel() {
        let remote = seeded_remote("walk-chan").await;
        let (tx, rx) = async_channel::bounded(2);
        let abort = tokio_util::sync::CancellationToken::new();
        let walker = tokio::spawn(files_to_chan(remote, String::new(), MAX_DEPTH, tx, abort));
        let mut seen = Vec::new();
        while let Ok(obj) = rx.recv().await {
            seen.push(obj.remote().to_string());
        }
        walker.await.unwrap().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a/deep/three", "a/one", "a/two", "b"]);
    }

    #[test(tokio::test)]
    async fn dirs_list_parents_first() {
        let remote = seeded_remote("walk-dirs").await;
        let dirs = list_dirs(&remote, "", MAX_DEPTH).await.unwrap();
        assert_eq!(dirs, vec!["a", "a/deep"]);
    }
}
