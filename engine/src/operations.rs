//! Per-object operations: equality, copy, move, delete, purge, check.
//!
//! Everything here honors `--dry-run` and reports through [`Stats`]; policy
//! decisions (which objects to touch) belong to the sync machine, not to
//! this module.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use backend::readers::RepeatableReader;
use backend::{BackendError, HashType, Object, ObjectInfo, Precision, Remote};

use crate::config::SyncOptions;
use crate::stats::Stats;
use crate::walk;

/// The tolerance within which two mod times compare equal: the coarser of
/// the two remotes' precisions, unless overridden.
pub fn modify_window(
    opts: &SyncOptions,
    a: &dyn Remote,
    b: &dyn Remote,
) -> Precision {
    if let Some(window) = opts.modify_window {
        return Precision::Of(window);
    }
    match (a.precision(), b.precision()) {
        (Precision::Of(x), Precision::Of(y)) => Precision::Of(x.max(y)),
        _ => Precision::Unsupported,
    }
}

pub fn mod_times_equal(
    a: std::time::SystemTime,
    b: std::time::SystemTime,
    window: std::time::Duration,
) -> bool {
    let diff = match a.duration_since(b) {
        Ok(diff) => diff,
        Err(err) => err.duration(),
    };
    diff < window
}

/// Round `t` down to the destination's mod time granularity. Times are
/// always truncated to the precision of the remote being written so a
/// follow-up comparison sees exactly what the backend stored.
pub fn truncate_time(t: std::time::SystemTime, precision: Precision) -> std::time::SystemTime {
    let Precision::Of(gran) = precision else {
        return t;
    };
    if gran <= std::time::Duration::from_nanos(1) {
        return t;
    }
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(since) => {
            let gran_nanos = gran.as_nanos().max(1);
            let truncated = (since.as_nanos() / gran_nanos) * gran_nanos;
            std::time::UNIX_EPOCH + std::time::Duration::from_nanos(truncated as u64)
        }
        Err(_) => t,
    }
}

/// Whether `src` and `dst` hold the same content, by size and the common
/// hash alone. Used by check, where mod times are not consulted.
pub async fn check_identical(
    src: &dyn Object,
    dst: &dyn Object,
    common_hash: Option<HashType>,
) -> bool {
    if src.size() != dst.size() {
        return false;
    }
    if let Some(hash_type) = common_hash {
        match (src.hash(hash_type).await, dst.hash(hash_type).await) {
            (Ok(src_hash), Ok(dst_hash))
                if !src_hash.is_empty() && !dst_hash.is_empty() =>
            {
                return src_hash == dst_hash;
            }
            (Err(err), _) | (_, Err(err)) => {
                tracing::debug!("{}: hash unavailable: {}", src.remote(), err);
            }
            _ => {}
        }
    }
    true
}

/// Whether `src` and `dst` are the same for sync purposes: sizes match AND
/// (common hash matches if there is one, else mod times match within the
/// window, else the pair must be transferred).
///
/// When the content is provably identical but the mod times disagree, the
/// destination's mod time is corrected in place instead of re-uploading;
/// backends that can't set mod times force the transfer.
pub async fn equal(
    src: &dyn Object,
    dst: &dyn Object,
    common_hash: Option<HashType>,
    window: Precision,
    fdst: &dyn Remote,
    opts: &SyncOptions,
) -> bool {
    if src.size() != dst.size() {
        tracing::debug!("{}: sizes differ", src.remote());
        return false;
    }
    if opts.size_only {
        tracing::debug!("{}: sizes identical", src.remote());
        return true;
    }
    let mut hash_matched = false;
    if let Some(hash_type) = common_hash {
        match (src.hash(hash_type).await, dst.hash(hash_type).await) {
            (Ok(src_hash), Ok(dst_hash))
                if !src_hash.is_empty() && !dst_hash.is_empty() =>
            {
                if src_hash != dst_hash {
                    tracing::debug!(
                        "{}: {} differ ({} vs {})",
                        src.remote(),
                        hash_type.name(),
                        src_hash,
                        dst_hash
                    );
                    return false;
                }
                hash_matched = true;
            }
            (Err(err), _) | (_, Err(err)) => {
                tracing::debug!("{}: hash unavailable: {}", src.remote(), err);
            }
            _ => {}
        }
    }
    let window = match window {
        Precision::Of(window) => Some(window),
        Precision::Unsupported => None,
    };
    match (src.mod_time(), dst.mod_time(), window) {
        (Some(src_time), Some(dst_time), Some(window)) => {
            if mod_times_equal(src_time, dst_time, window) {
                tracing::debug!("{}: unchanged", src.remote());
                return true;
            }
            if !hash_matched {
                tracing::debug!("{}: mod times differ", src.remote());
                return false;
            }
            // content is identical, only the mod time is stale
            if opts.dry_run {
                tracing::info!("{}: not updating mod time as --dry-run", src.remote());
                return true;
            }
            if !fdst.features().set_mod_time {
                tracing::debug!(
                    "{}: destination can't set mod time - transferring",
                    src.remote()
                );
                return false;
            }
            match dst
                .set_mod_time(truncate_time(src_time, fdst.precision()))
                .await
            {
                Ok(()) => {
                    tracing::info!("{}: updated mod time in destination", src.remote());
                    true
                }
                Err(BackendError::CantSetModTime) => {
                    tracing::debug!("{}: can't set mod time - transferring", src.remote());
                    false
                }
                Err(err) => {
                    tracing::error!("{}: failed to set mod time: {}", src.remote(), err);
                    false
                }
            }
        }
        // mod times are not comparable: the hash alone decides, and with no
        // hash either the pair must be transferred
        _ => hash_matched,
    }
}

async fn remove_failed(obj: &dyn Object) {
    if let Err(err) = obj.remove().await {
        tracing::error!(
            "{}: failed to remove partially transferred object: {}",
            obj.remote(),
            err
        );
    }
}

/// Copy `src` to `remote` on `fdst`, overwriting `dst` if given.
///
/// Prefers a server-side copy when the destination advertises one, else
/// streams through a [`RepeatableReader`] so transient upload failures can
/// rewind and retry up to `low-level-retries` times. The transfer is
/// verified by size and common hash, and a corrupt destination object is
/// removed rather than left in place.
pub async fn copy_file(
    fdst: &std::sync::Arc<dyn Remote>,
    dst: Option<std::sync::Arc<dyn Object>>,
    remote: &str,
    src: std::sync::Arc<dyn Object>,
    common_hash: Option<HashType>,
    opts: &SyncOptions,
    stats: &Stats,
) -> Result<()> {
    if opts.dry_run {
        tracing::info!("{}: not copying as --dry-run", remote);
        return Ok(());
    }
    let mut new_dst = None;
    if fdst.features().server_side_copy {
        match fdst.copy_object(src.as_ref(), remote).await {
            Ok(obj) => new_dst = Some(obj),
            Err(BackendError::CantCopy) => {}
            Err(err) => {
                tracing::debug!(
                    "{}: server-side copy failed, falling back to streaming: {}",
                    remote,
                    err
                );
            }
        }
    }
    let new_dst = match new_dst {
        Some(obj) => obj,
        None => {
            let reader = src
                .open(None)
                .await
                .with_context(|| format!("failed to open {:?} for reading", src.remote()))?;
            let mut reader = RepeatableReader::new(reader);
            let info = ObjectInfo {
                remote: remote.to_string(),
                size: src.size(),
                mod_time: src.mod_time().map(|t| truncate_time(t, fdst.precision())),
            };
            let mut tries = 0;
            let obj = loop {
                tries += 1;
                let attempt = match &dst {
                    Some(dst) => dst.update(&mut reader, &info).await,
                    None => fdst.put(&mut reader, &info).await,
                };
                match attempt {
                    Ok(obj) => break obj,
                    Err(err) => {
                        if err.is_fatal()
                            || err.is_no_retry()
                            || tries >= opts.low_level_retries
                        {
                            return Err(anyhow::Error::new(err)
                                .context(format!("failed to copy to {:?}", remote)));
                        }
                        tracing::debug!(
                            "{}: received error: {} - low level retry {}/{}",
                            remote,
                            err,
                            tries,
                            opts.low_level_retries
                        );
                        stats.retries.inc();
                        reader.rewind(0)?;
                    }
                }
            };
            stats.bytes.add(src.size());
            obj
        }
    };
    if new_dst.size() != src.size() {
        let err = anyhow::anyhow!(
            "{}: corrupted on transfer: sizes differ {} vs {}",
            remote,
            src.size(),
            new_dst.size()
        );
        remove_failed(new_dst.as_ref()).await;
        return Err(err);
    }
    if let Some(hash_type) = common_hash {
        if let (Ok(src_hash), Ok(dst_hash)) =
            (src.hash(hash_type).await, new_dst.hash(hash_type).await)
        {
            if !src_hash.is_empty() && !dst_hash.is_empty() && src_hash != dst_hash {
                let err = anyhow::anyhow!(
                    "{}: corrupted on transfer: {} hashes differ ({} vs {})",
                    remote,
                    hash_type.name(),
                    src_hash,
                    dst_hash
                );
                remove_failed(new_dst.as_ref()).await;
                return Err(err);
            }
        }
    }
    tracing::info!("{}: copied", remote);
    Ok(())
}

/// Move `src` to `remote` on `fdst`: a server-side move when advertised,
/// else copy then delete the source.
#[async_recursion]
pub async fn move_file(
    fdst: &std::sync::Arc<dyn Remote>,
    dst: Option<std::sync::Arc<dyn Object>>,
    remote: &str,
    src: std::sync::Arc<dyn Object>,
    common_hash: Option<HashType>,
    opts: &SyncOptions,
    stats: &Stats,
) -> Result<()> {
    if opts.dry_run {
        tracing::info!("{}: not moving as --dry-run", remote);
        return Ok(());
    }
    if fdst.features().server_side_move {
        // the target must not be occupied when the backend renames
        if let Some(dst) = &dst {
            delete_file(dst.clone(), None, opts, stats)
                .await
                .with_context(|| {
                    format!("failed to delete {:?} before moving over it", dst.remote())
                })?;
        }
        match fdst.move_object(src.as_ref(), remote).await {
            Ok(_) => {
                tracing::info!("{}: moved", remote);
                return Ok(());
            }
            Err(BackendError::CantMove) => {
                tracing::debug!("{}: can't move, switching to copy", remote);
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to move to {:?}", remote)))
            }
        }
        // dst was deleted above, don't pass it to the copy fallback
        copy_file(fdst, None, remote, src.clone(), common_hash, opts, stats).await?;
    } else {
        copy_file(fdst, dst, remote, src.clone(), common_hash, opts, stats).await?;
    }
    delete_file(src, None, opts, stats).await
}

/// Delete one object, or reroute it into the backup dir when one is
/// configured.
#[async_recursion]
pub async fn delete_file(
    obj: std::sync::Arc<dyn Object>,
    backup: Option<(&std::sync::Arc<dyn Remote>, &str)>,
    opts: &SyncOptions,
    stats: &Stats,
) -> Result<()> {
    if opts.dry_run {
        tracing::info!("{}: not deleting as --dry-run", obj.remote());
        return Ok(());
    }
    match backup {
        Some((backup_dir, suffix)) => {
            let target = format!("{}{}", obj.remote(), suffix);
            let overwritten = backup_dir.new_object(&target).await.ok();
            move_file(backup_dir, overwritten, &target, obj, None, opts, stats)
                .await
                .context("failed to move into backup dir")?;
        }
        None => {
            let remote = obj.remote().to_string();
            obj.remove()
                .await
                .with_context(|| format!("failed to delete {:?}", remote))?;
            tracing::info!("{}: deleted", remote);
        }
    }
    stats.deletes.inc();
    Ok(())
}

/// Make a directory, tolerating one that already exists.
pub async fn mkdir(
    remote: &std::sync::Arc<dyn Remote>,
    dir: &str,
    opts: &SyncOptions,
) -> Result<()> {
    if opts.dry_run {
        tracing::info!("{}: not making directory as --dry-run", remote.describe());
        return Ok(());
    }
    match remote.mkdir(dir).await {
        Ok(()) | Err(BackendError::DirExists) => Ok(()),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("failed to make directory {:?}", dir))),
    }
}

/// Recursively delete everything under `dir`, using the backend's purge
/// when it has one, else fanning the listing out to `transfers` deleters
/// and removing the emptied directories deepest first.
pub async fn purge(
    remote: &std::sync::Arc<dyn Remote>,
    dir: &str,
    opts: &SyncOptions,
    stats: &std::sync::Arc<Stats>,
) -> Result<()> {
    if remote.features().purge {
        if opts.dry_run {
            tracing::info!("{}: not purging as --dry-run", remote.describe());
            return Ok(());
        }
        match remote.purge(dir).await {
            Ok(()) => return Ok(()),
            Err(BackendError::NotSupported(_)) => {}
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to purge {}", remote.describe())))
            }
        }
    }
    let transfers = opts.transfers.max(1);
    let (tx, rx) = async_channel::bounded(transfers);
    let abort = tokio_util::sync::CancellationToken::new();
    let walker = tokio::spawn(walk::files_to_chan(
        remote.clone(),
        dir.to_string(),
        walk::MAX_DEPTH,
        tx,
        abort.clone(),
    ));
    let mut join_set = tokio::task::JoinSet::new();
    for _ in 0..transfers {
        let rx = rx.clone();
        let opts = opts.clone();
        let stats = stats.clone();
        join_set.spawn(async move {
            let mut failed = 0u64;
            while let Ok(obj) = rx.recv().await {
                if let Err(err) = delete_file(obj, None, &opts, &stats).await {
                    tracing::error!("{:#}", err);
                    stats.error();
                    failed += 1;
                }
            }
            failed
        });
    }
    drop(rx);
    let mut failed = 0u64;
    while let Some(res) = join_set.join_next().await {
        failed += res.unwrap_or(0);
    }
    walker
        .await
        .map_err(anyhow::Error::new)?
        .with_context(|| format!("error listing {}", remote.describe()))?;
    // directories empty out children before parents
    let mut dirs = walk::list_dirs(remote, dir, walk::MAX_DEPTH).await?;
    dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
    if !dir.is_empty() {
        dirs.push(dir.to_string());
    }
    for dir in dirs {
        if opts.dry_run {
            tracing::info!("{}: not removing directory as --dry-run", dir);
            continue;
        }
        if let Err(err) = remote.rmdir(&dir).await {
            tracing::warn!("failed to remove directory {:?}: {}", dir, err);
        }
    }
    if failed > 0 {
        return Err(anyhow::anyhow!("failed to purge: {} deletes failed", failed));
    }
    Ok(())
}

/// Outcome of comparing two trees without transferring anything.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckSummary {
    pub same: u64,
    pub differ: u64,
    pub src_only: u64,
    pub dst_only: u64,
}

impl CheckSummary {
    pub fn clean(&self) -> bool {
        self.differ == 0 && self.src_only == 0 && self.dst_only == 0
    }
}

impl std::fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "same: {}\ndiffer: {}\nonly in source: {}\nonly in destination: {}",
            self.same, self.differ, self.src_only, self.dst_only
        )
    }
}

/// Compare the two trees by size and common hash.
pub async fn check(
    fdst: &std::sync::Arc<dyn Remote>,
    fsrc: &std::sync::Arc<dyn Remote>,
    opts: &SyncOptions,
    stats: &std::sync::Arc<Stats>,
) -> Result<CheckSummary> {
    let common_hash = fsrc.hashes().overlap(fdst.hashes()).get_one();
    let max_depth = opts.max_depth.unwrap_or(walk::MAX_DEPTH);
    let (src_files, dst_files) = tokio::join!(
        walk::read_files_map(fsrc.clone(), "", max_depth),
        walk::read_files_map(fdst.clone(), "", max_depth),
    );
    let src_files = src_files?;
    let mut dst_files = dst_files?;
    let mut summary = CheckSummary::default();
    for (remote, src) in &src_files {
        let _guard = stats.checking(remote);
        match dst_files.remove(remote) {
            Some(dst) => {
                if check_identical(src.as_ref(), dst.as_ref(), common_hash).await {
                    summary.same += 1;
                } else {
                    tracing::error!("{}: differs", remote);
                    summary.differ += 1;
                }
            }
            None => {
                tracing::error!("{}: missing in destination", remote);
                summary.src_only += 1;
            }
        }
        stats.checks.inc();
    }
    for remote in dst_files.keys() {
        tracing::error!("{}: missing in source", remote);
        summary.dst_only += 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeleteMode;
    use test_log::test;

    fn t(secs: u64, nanos: u32) -> std::time::SystemTime {
        std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::new(secs, nanos)
    }

    #[test]
    fn mod_time_window_is_strict() {
        let window = std::time::Duration::from_secs(1);
        assert!(mod_times_equal(t(100, 0), t(100, 999_999_999), window));
        assert!(!mod_times_equal(t(100, 0), t(101, 0), window));
        assert!(mod_times_equal(t(100, 5), t(100, 5), window));
    }

    #[test]
    fn truncation_rounds_down_to_granularity() {
        let precise = t(981_173_106, 999_999_999);
        assert_eq!(
            truncate_time(precise, Precision::Of(std::time::Duration::from_secs(1))),
            t(981_173_106, 0)
        );
        assert_eq!(
            truncate_time(precise, Precision::Of(std::time::Duration::from_nanos(1))),
            precise
        );
        assert_eq!(truncate_time(precise, Precision::Unsupported), precise);
    }

    async fn mem_pair(
        bucket: &str,
    ) -> (
        std::sync::Arc<dyn Remote>,
        std::sync::Arc<dyn Remote>,
    ) {
        let src = backend::new_remote(&format!("mem:{}-src", bucket)).await.unwrap();
        let dst = backend::new_remote(&format!("mem:{}-dst", bucket)).await.unwrap();
        (src, dst)
    }

    async fn put(
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
    async fn equal_fixes_mod_time_when_content_matches() {
        let (src_remote, dst_remote) = mem_pair("ops-equal").await;
        let src = put(&src_remote, "f", "same", t(2000, 0)).await;
        let dst = put(&dst_remote, "f", "same", t(1000, 0)).await;
        let opts = SyncOptions::default();
        let window = modify_window(&opts, src_remote.as_ref(), dst_remote.as_ref());
        assert!(
            equal(
                src.as_ref(),
                dst.as_ref(),
                Some(HashType::Md5),
                window,
                dst_remote.as_ref(),
                &opts
            )
            .await
        );
        let fresh = dst_remote.new_object("f").await.unwrap();
        assert_eq!(fresh.mod_time().unwrap(), t(2000, 0));
    }

    #[test(tokio::test)]
    async fn equal_rejects_different_content_with_same_mtime() {
        let (src_remote, dst_remote) = mem_pair("ops-differ").await;
        let src = put(&src_remote, "f", "left", t(2000, 0)).await;
        let dst = put(&dst_remote, "f", "....", t(2000, 0)).await;
        let opts = SyncOptions::default();
        let window = modify_window(&opts, src_remote.as_ref(), dst_remote.as_ref());
        // same size, same mtime, hashes differ
        assert!(
            !equal(
                src.as_ref(),
                dst.as_ref(),
                Some(HashType::Md5),
                window,
                dst_remote.as_ref(),
                &opts
            )
            .await
        );
    }

    #[test(tokio::test)]
    async fn copy_verifies_and_counts_bytes() {
        let (src_remote, dst_remote) = mem_pair("ops-copy").await;
        let src = put(&src_remote, "f", "payload", t(2000, 0)).await;
        let opts = SyncOptions::default();
        let stats = Stats::new();
        // mem to mem is server-side copyable, force the streaming path by
        // copying from local instead
        let tmp = tempfile::tempdir().unwrap();
        let local = backend::new_remote(tmp.path().to_str().unwrap()).await.unwrap();
        let src_local = {
            let mut reader: &[u8] = b"payload";
            local
                .put(
                    &mut reader,
                    &ObjectInfo {
                        remote: "f".to_string(),
                        size: 7,
                        mod_time: Some(t(2000, 0)),
                    },
                )
                .await
                .unwrap()
        };
        copy_file(
            &dst_remote,
            None,
            "f",
            src_local,
            Some(HashType::Md5),
            &opts,
            &stats,
        )
        .await
        .unwrap();
        assert_eq!(stats.bytes.get(), 7);
        let obj = dst_remote.new_object("f").await.unwrap();
        assert_eq!(obj.size(), 7);
        assert_eq!(obj.mod_time().unwrap(), t(2000, 0));
        drop(src);
    }

    #[test(tokio::test)]
    async fn dry_run_copies_nothing() {
        let (src_remote, dst_remote) = mem_pair("ops-dry").await;
        let src = put(&src_remote, "f", "payload", t(2000, 0)).await;
        let opts = SyncOptions {
            dry_run: true,
            ..Default::default()
        };
        let stats = Stats::new();
        copy_file(&dst_remote, None, "f", src, Some(HashType::Md5), &opts, &stats)
            .await
            .unwrap();
        assert!(dst_remote.new_object("f").await.is_err());
        assert_eq!(stats.bytes.get(), 0);
    }

    #[test(tokio::test)]
    async fn move_falls_back_to_copy_and_delete() {
        // a local object can't be renamed server-side by a mem remote, so
        // the move must degrade to copy + delete source
        let tmp = tempfile::tempdir().unwrap();
        let local = backend::new_remote(tmp.path().to_str().unwrap()).await.unwrap();
        let dst_remote = backend::new_remote("mem:ops-move-dst").await.unwrap();
        let src = put(&local, "f", "content", t(2000, 0)).await;
        let opts = SyncOptions::default();
        let stats = Stats::new();
        move_file(
            &dst_remote,
            None,
            "f",
            src,
            Some(HashType::Md5),
            &opts,
            &stats,
        )
        .await
        .unwrap();
        assert!(local.new_object("f").await.is_err());
        let moved = dst_remote.new_object("f").await.unwrap();
        assert_eq!(moved.size(), 7);
        assert_eq!(stats.deletes.get(), 1);
        assert_eq!(stats.bytes.get(), 7);
    }

    #[test(tokio::test)]
    async fn purge_fans_out_deletes() {
        let remote = backend::new_remote("mem:ops-purge").await.unwrap();
        for path in ["a", "d/b", "d/e/c"] {
            put(&remote, path, "x", t(2000, 0)).await;
        }
        let opts = SyncOptions {
            delete_mode: DeleteMode::Off,
            ..Default::default()
        };
        let stats = Stats::new();
        purge(&remote, "d", &opts, &stats).await.unwrap();
        assert!(remote.new_object("a").await.is_ok());
        assert!(remote.new_object("d/b").await.is_err());
        assert!(remote.new_object("d/e/c").await.is_err());
    }

    #[test(tokio::test)]
    async fn check_reports_differences() {
        let (src_remote, dst_remote) = mem_pair("ops-check").await;
        put(&src_remote, "same", "aa", t(2000, 0)).await;
        put(&dst_remote, "same", "aa", t(2000, 0)).await;
        put(&src_remote, "differ", "aa", t(2000, 0)).await;
        put(&dst_remote, "differ", "bb", t(2000, 0)).await;
        put(&src_remote, "src-only", "aa", t(2000, 0)).await;
        put(&dst_remote, "dst-only", "aa", t(2000, 0)).await;
        let opts = SyncOptions::default();
        let stats = Stats::new();
        let summary = check(&dst_remote, &src_remote, &opts, &stats).await.unwrap();
        assert_eq!(
            summary,
            CheckSummary {
                same: 1,
                differ: 1,
                src_only: 1,
                dst_only: 1,
            }
        );
        assert!(!summary.clean());
    }
}
