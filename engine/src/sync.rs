//! The sync/copy/move pipeline.
//!
//! A run wires bounded channels between groups of long-lived workers:
//! traversal emits (src, dst?) pairs into `to_be_checked`, checkers decide
//! which pairs actually need bytes moved and feed `to_be_uploaded`,
//! transferers call copy or move, and optional renamers and a deleter
//! handle rename tracking and the delete policy. A fatal error cancels the
//! abort token; every worker selects on it next to its input channel, so
//! the run winds down within one in-flight operation.
//!
//! Shutdown is ordered through channel closure: dropping the last sender of
//! a stage closes it, the stage's workers drain and exit, and their own
//! sender clones for the next stage drop with them.

use anyhow::{anyhow, Context, Result};
use backend::{BackendError, HashType, Object, Precision, Remote};

use crate::config::{DeleteMode, SyncOptions};
use crate::operations;
use crate::stats::Stats;
use crate::walk;

/// Sync `fsrc` into `fdst`, deleting destination-only files according to
/// the configured delete mode.
pub async fn sync(
    fdst: &std::sync::Arc<dyn Remote>,
    fsrc: &std::sync::Arc<dyn Remote>,
    opts: &SyncOptions,
    stats: &std::sync::Arc<Stats>,
) -> Result<()> {
    run_sync_copy_move(fdst, fsrc, opts.delete_mode, false, opts, stats).await
}

/// Copy `fsrc` into `fdst` without ever deleting.
pub async fn copy_dir(
    fdst: &std::sync::Arc<dyn Remote>,
    fsrc: &std::sync::Arc<dyn Remote>,
    opts: &SyncOptions,
    stats: &std::sync::Arc<Stats>,
) -> Result<()> {
    run_sync_copy_move(fdst, fsrc, DeleteMode::Off, false, opts, stats).await
}

/// Move the contents of `fsrc` into `fdst`, using a server-side directory
/// move when the destination offers one.
pub async fn move_dir(
    fdst: &std::sync::Arc<dyn Remote>,
    fsrc: &std::sync::Arc<dyn Remote>,
    opts: &SyncOptions,
    stats: &std::sync::Arc<Stats>,
) -> Result<()> {
    if backend::same(fdst.as_ref(), fsrc.as_ref()) {
        tracing::error!("nothing to do as source and destination are the same");
        return Ok(());
    }
    if fdst.features().dir_move && backend::same_config(fdst.as_ref(), fsrc.as_ref()) {
        if opts.dry_run {
            tracing::info!("not doing server-side directory move as --dry-run");
            return Ok(());
        }
        tracing::debug!("using server-side directory move");
        match fdst.dir_move(fsrc.as_ref()).await {
            Ok(()) => {
                tracing::debug!("server-side directory move succeeded");
                return Ok(());
            }
            Err(BackendError::CantMove) | Err(BackendError::DirExists) => {
                tracing::debug!("server-side directory move failed - fallback to file moves");
            }
            Err(err) => {
                stats.error();
                return Err(anyhow::Error::new(err)
                    .context("server-side directory move failed"));
            }
        }
    }
    if backend::overlapping(fdst.as_ref(), fsrc.as_ref()) {
        return Err(anyhow::Error::new(BackendError::fatal(
            "can't move files on overlapping remotes",
        )));
    }
    run_sync_copy_move(fdst, fsrc, DeleteMode::Off, true, opts, stats).await
}

async fn run_sync_copy_move(
    fdst: &std::sync::Arc<dyn Remote>,
    fsrc: &std::sync::Arc<dyn Remote>,
    mut delete_mode: DeleteMode,
    do_move: bool,
    opts: &SyncOptions,
    stats: &std::sync::Arc<Stats>,
) -> Result<()> {
    if delete_mode != DeleteMode::Off && do_move {
        return Err(anyhow!("can't delete and move at the same time"));
    }
    // delete-before in directory-at-a-time mode runs as a leading
    // delete-only pass; the flat traversal deletes against the full source
    // map instead
    if delete_mode == DeleteMode::Before {
        if opts.track_renames {
            return Err(anyhow!("can't use --delete-before with --track-renames"));
        }
        if !opts.flat {
            let machine = SyncMachine::new(
                fdst.clone(),
                fsrc.clone(),
                DeleteMode::Only,
                false,
                opts.clone(),
                stats.clone(),
            )
            .await?;
            machine.run().await?;
            delete_mode = DeleteMode::Off;
        }
    }
    let machine = SyncMachine::new(
        fdst.clone(),
        fsrc.clone(),
        delete_mode,
        do_move,
        opts.clone(),
        stats.clone(),
    )
    .await?;
    machine.run().await
}

#[derive(Clone)]
struct ObjectPair {
    src: std::sync::Arc<dyn Object>,
    dst: Option<std::sync::Arc<dyn Object>>,
}

/// A directory listing that still needs doing.
#[derive(Debug, Clone)]
struct ListDirJob {
    remote: String,
    src_depth: u32,
    dst_depth: u32,
    no_src: bool,
    no_dst: bool,
}

/// Go-style wait group: counts outstanding traversal jobs so the main task
/// knows when the whole tree has been walked.
struct WaitGroup {
    count: std::sync::atomic::AtomicUsize,
    zero: tokio::sync::Notify,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            count: std::sync::atomic::AtomicUsize::new(0),
            zero: tokio::sync::Notify::new(),
        }
    }

    fn add(&self, n: usize) {
        self.count
            .fetch_add(n, std::sync::atomic::Ordering::AcqRel);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) == 1 {
            self.zero.notify_waiters();
        }
    }

    async fn wait(&self) {
        let mut notified = std::pin::pin!(self.zero.notified());
        loop {
            // enroll as a waiter before reading the count: a bare
            // `Notified` only registers on first poll, so a
            // `notify_waiters` landing between the load and the await
            // would otherwise be lost for good
            notified.as_mut().enable();
            if self.count.load(std::sync::atomic::Ordering::Acquire) == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.zero.notified());
        }
    }
}

#[derive(Default)]
struct ErrorSlots {
    fatal: Option<anyhow::Error>,
    err: Option<anyhow::Error>,
    no_retry: Option<anyhow::Error>,
}

/// Senders feeding the worker stages; traversal workers hold a clone each
/// so the stages close naturally once traversal and the main task are done
/// with them.
#[derive(Clone)]
struct PipeTx {
    checked: async_channel::Sender<ObjectPair>,
    upload: async_channel::Sender<ObjectPair>,
    delete: async_channel::Sender<std::sync::Arc<dyn Object>>,
    candidates: async_channel::Sender<std::sync::Arc<dyn Object>>,
}

struct Pipeline {
    tx: PipeTx,
    rename_tx: async_channel::Sender<ObjectPair>,
    checkers: tokio::task::JoinSet<()>,
    renamers: tokio::task::JoinSet<()>,
    transferers: tokio::task::JoinSet<()>,
    deleters: tokio::task::JoinSet<()>,
    collector: Option<tokio::task::JoinHandle<Vec<std::sync::Arc<dyn Object>>>>,
}

struct SyncMachine {
    fdst: std::sync::Arc<dyn Remote>,
    fsrc: std::sync::Arc<dyn Remote>,
    opts: SyncOptions,
    delete_mode: DeleteMode,
    do_move: bool,
    track_renames: bool,
    no_traverse: bool,
    flat: bool,
    common_hash: Option<HashType>,
    window: Precision,
    backup_dir: Option<std::sync::Arc<dyn Remote>>,
    abort: tokio_util::sync::CancellationToken,
    errors: std::sync::Mutex<ErrorSlots>,
    dst_files: std::sync::Mutex<
        std::collections::HashMap<String, std::sync::Arc<dyn Object>>,
    >,
    src_files: std::sync::Mutex<
        std::collections::HashMap<String, std::sync::Arc<dyn Object>>,
    >,
    rename_map: std::sync::Mutex<
        std::collections::HashMap<String, Vec<std::sync::Arc<dyn Object>>>,
    >,
    stats: std::sync::Arc<Stats>,
}

impl SyncMachine {
    async fn new(
        fdst: std::sync::Arc<dyn Remote>,
        fsrc: std::sync::Arc<dyn Remote>,
        mut delete_mode: DeleteMode,
        do_move: bool,
        opts: SyncOptions,
        stats: std::sync::Arc<Stats>,
    ) -> Result<std::sync::Arc<Self>> {
        let common_hash = fsrc.hashes().overlap(fdst.hashes()).get_one();
        let window = operations::modify_window(&opts, fsrc.as_ref(), fdst.as_ref());
        let mut no_traverse = opts.no_traverse;
        if no_traverse && delete_mode != DeleteMode::Off {
            tracing::error!("ignoring --no-traverse with sync");
            no_traverse = false;
        }
        let mut track_renames = opts.track_renames;
        if track_renames {
            let features = fdst.features();
            if !features.server_side_move && !features.server_side_copy {
                tracing::error!(
                    "ignoring --track-renames as the destination does not support \
                     server-side move or copy"
                );
                track_renames = false;
            } else if common_hash.is_none() {
                tracing::error!(
                    "ignoring --track-renames as the source and destination do not \
                     have a common hash"
                );
                track_renames = false;
            }
        }
        if track_renames {
            // a same-hash file must not be deleted before it is recognized
            // as a rename target
            if delete_mode != DeleteMode::Off {
                delete_mode = DeleteMode::After;
            }
            if no_traverse {
                tracing::error!("ignoring --no-traverse with --track-renames");
                no_traverse = false;
            }
        }
        let backup_dir = match &opts.backup_dir {
            Some(spec) => {
                let backup_dir = backend::new_remote(spec)
                    .await
                    .map_err(anyhow::Error::new)
                    .with_context(|| format!("failed to make remote for --backup-dir {:?}", spec))?;
                let features = backup_dir.features();
                if !features.server_side_move && !features.server_side_copy {
                    return Err(anyhow::Error::new(BackendError::fatal(
                        "can't use --backup-dir on a remote which doesn't support \
                         server-side move or copy",
                    )));
                }
                if !backend::same_config(fdst.as_ref(), backup_dir.as_ref()) {
                    return Err(anyhow::Error::new(BackendError::fatal(
                        "--backup-dir must be on the same remote as the destination",
                    )));
                }
                if backend::overlapping(fdst.as_ref(), backup_dir.as_ref()) {
                    return Err(anyhow::Error::new(BackendError::fatal(
                        "destination and --backup-dir mustn't overlap",
                    )));
                }
                if backend::overlapping(fsrc.as_ref(), backup_dir.as_ref()) {
                    return Err(anyhow::Error::new(BackendError::fatal(
                        "source and --backup-dir mustn't overlap",
                    )));
                }
                Some(backup_dir)
            }
            None => None,
        };
        let flat = opts.flat || no_traverse;
        Ok(std::sync::Arc::new(Self {
            fdst,
            fsrc,
            delete_mode,
            do_move,
            track_renames,
            no_traverse,
            flat,
            common_hash,
            window,
            backup_dir,
            abort: tokio_util::sync::CancellationToken::new(),
            errors: std::sync::Mutex::new(ErrorSlots::default()),
            dst_files: std::sync::Mutex::new(std::collections::HashMap::new()),
            src_files: std::sync::Mutex::new(std::collections::HashMap::new()),
            rename_map: std::sync::Mutex::new(std::collections::HashMap::new()),
            stats,
            opts,
        }))
    }

    fn aborting(&self) -> bool {
        self.abort.is_cancelled()
    }

    fn backup(&self) -> Option<(&std::sync::Arc<dyn Remote>, &str)> {
        self.backup_dir
            .as_ref()
            .map(|backup_dir| (backup_dir, self.opts.suffix.as_str()))
    }

    /// Record a worker error. The first fatal error broadcasts the abort;
    /// ordinary and no-retry errors keep the run going but decide the final
    /// result.
    fn process_error(&self, err: anyhow::Error) {
        tracing::error!("{:#}", err);
        self.stats.error();
        let mut slots = self.errors.lock().unwrap();
        if backend::is_fatal_err(&err) {
            if !self.aborting() {
                self.abort.cancel();
            }
            if slots.fatal.is_none() {
                slots.fatal = Some(err);
            }
        } else if backend::is_no_retry_err(&err) {
            slots.no_retry = Some(err);
        } else {
            slots.err = Some(err);
        }
    }

    fn has_error(&self) -> bool {
        let slots = self.errors.lock().unwrap();
        slots.fatal.is_some() || slots.err.is_some() || slots.no_retry.is_some()
    }

    /// The final result, in precedence order fatal > ordinary > no-retry.
    fn take_error(&self) -> Result<()> {
        let mut slots = self.errors.lock().unwrap();
        if let Some(err) = slots.fatal.take() {
            return Err(err);
        }
        if let Some(err) = slots.err.take() {
            return Err(err);
        }
        if let Some(err) = slots.no_retry.take() {
            return Err(err);
        }
        Ok(())
    }

    async fn send_pair(
        &self,
        tx: &async_channel::Sender<ObjectPair>,
        pair: ObjectPair,
    ) -> bool {
        tokio::select! {
            _ = self.abort.cancelled() => false,
            res = tx.send(pair) => res.is_ok(),
        }
    }

    async fn send_obj(
        &self,
        tx: &async_channel::Sender<std::sync::Arc<dyn Object>>,
        obj: std::sync::Arc<dyn Object>,
    ) -> bool {
        tokio::select! {
            _ = self.abort.cancelled() => false,
            res = tx.send(obj) => res.is_ok(),
        }
    }

    // ---- match/decide ----

    /// Whether `src` must be copied over `dst` under the configured policy.
    async fn need_transfer(
        &self,
        dst: Option<&std::sync::Arc<dyn Object>>,
        src: &std::sync::Arc<dyn Object>,
    ) -> bool {
        let Some(dst) = dst else {
            tracing::debug!("{}: couldn't find file - need to transfer", src.remote());
            return true;
        };
        if self.opts.ignore_existing {
            tracing::debug!("{}: destination exists, skipping", src.remote());
            return false;
        }
        if self.opts.ignore_times {
            tracing::debug!(
                "{}: transferring unconditionally as --ignore-times is in use",
                src.remote()
            );
            return true;
        }
        if self.opts.update_older {
            // without a mutually agreed precision, fall back to one second,
            // the usual resolution of upload times
            let window = match self.window {
                Precision::Of(window) => window,
                Precision::Unsupported => std::time::Duration::from_secs(1),
            };
            if let (Some(src_time), Some(dst_time)) = (src.mod_time(), dst.mod_time()) {
                if let Ok(newer_by) = dst_time.duration_since(src_time) {
                    if newer_by >= window {
                        tracing::debug!(
                            "{}: destination is newer than source, skipping",
                            src.remote()
                        );
                        return false;
                    }
                }
                if let Ok(older_by) = src_time.duration_since(dst_time) {
                    if older_by >= window {
                        tracing::debug!(
                            "{}: destination is older than source, transferring",
                            src.remote()
                        );
                        return true;
                    }
                }
                if src.size() == dst.size() {
                    tracing::debug!(
                        "{}: destination mod time is within the window and sizes \
                         are identical, skipping",
                        src.remote()
                    );
                    return false;
                }
                tracing::debug!(
                    "{}: destination mod time is within the window but sizes \
                     differ, transferring",
                    src.remote()
                );
                return true;
            }
        }
        !operations::equal(
            src.as_ref(),
            dst.as_ref(),
            self.common_hash,
            self.window,
            self.fdst.as_ref(),
            &self.opts,
        )
        .await
    }

    // ---- worker loops ----

    async fn pair_checker(
        self: std::sync::Arc<Self>,
        rx: async_channel::Receiver<ObjectPair>,
        tx: async_channel::Sender<ObjectPair>,
    ) {
        loop {
            let pair = tokio::select! {
                _ = self.abort.cancelled() => return,
                pair = rx.recv() => match pair {
                    Ok(pair) => pair,
                    Err(_) => return,
                },
            };
            let ObjectPair { src, mut dst } = pair;
            let _guard = self.stats.checking(src.remote());
            if src.storable() {
                if self.need_transfer(dst.as_ref(), &src).await {
                    // an existing destination object is moved aside first
                    // when a backup dir is configured
                    if dst.is_some() && self.backup_dir.is_some() {
                        let old = dst.take().unwrap();
                        let (backup_dir, suffix) = self.backup().unwrap();
                        let target = format!("{}{}", old.remote(), suffix);
                        let overwritten = backup_dir.new_object(&target).await.ok();
                        match operations::move_file(
                            backup_dir,
                            overwritten,
                            &target,
                            old.clone(),
                            None,
                            &self.opts,
                            &self.stats,
                        )
                        .await
                        {
                            Ok(()) => {
                                if !self.send_pair(&tx, ObjectPair { src, dst: None }).await {
                                    return;
                                }
                            }
                            Err(err) => {
                                self.process_error(
                                    err.context("failed to move into backup dir"),
                                );
                            }
                        }
                    } else if !self.send_pair(&tx, ObjectPair { src, dst }).await {
                        return;
                    }
                } else if self.do_move {
                    // moving and the destination is already up to date, so
                    // only the source copy remains to be removed
                    if let Err(err) = operations::delete_file(
                        src.clone(),
                        None,
                        &self.opts,
                        &self.stats,
                    )
                    .await
                    {
                        self.process_error(err);
                    }
                }
            }
            self.stats.checks.inc();
        }
    }

    async fn pair_renamer(
        self: std::sync::Arc<Self>,
        rx: async_channel::Receiver<ObjectPair>,
        tx: async_channel::Sender<ObjectPair>,
    ) {
        loop {
            let pair = tokio::select! {
                _ = self.abort.cancelled() => return,
                pair = rx.recv() => match pair {
                    Ok(pair) => pair,
                    Err(_) => return,
                },
            };
            if !self.try_rename(&pair.src).await {
                // not renamed, pass on for upload
                if !self.send_pair(&tx, pair).await {
                    return;
                }
            }
        }
    }

    async fn pair_transfer(
        self: std::sync::Arc<Self>,
        rx: async_channel::Receiver<ObjectPair>,
    ) {
        loop {
            let pair = tokio::select! {
                _ = self.abort.cancelled() => return,
                pair = rx.recv() => match pair {
                    Ok(pair) => pair,
                    Err(_) => return,
                },
            };
            let ObjectPair { src, dst } = pair;
            let _guard = self.stats.transferring(src.remote());
            let remote = src.remote().to_string();
            let result = if self.do_move {
                operations::move_file(
                    &self.fdst,
                    dst,
                    &remote,
                    src,
                    self.common_hash,
                    &self.opts,
                    &self.stats,
                )
                .await
            } else {
                operations::copy_file(
                    &self.fdst,
                    dst,
                    &remote,
                    src,
                    self.common_hash,
                    &self.opts,
                    &self.stats,
                )
                .await
            };
            match result {
                Ok(()) => self.stats.transfers.inc(),
                Err(err) => self.process_error(err),
            }
        }
    }

    async fn deleter(
        self: std::sync::Arc<Self>,
        rx: async_channel::Receiver<std::sync::Arc<dyn Object>>,
    ) {
        loop {
            let obj = tokio::select! {
                _ = self.abort.cancelled() => return,
                obj = rx.recv() => match obj {
                    Ok(obj) => obj,
                    Err(_) => return,
                },
            };
            if let Err(err) =
                operations::delete_file(obj, self.backup(), &self.opts, &self.stats).await
            {
                self.process_error(err);
            }
        }
    }

    // ---- rename detection ----

    /// The rename index key: size and common hash, or `None` when the hash
    /// can't be computed.
    async fn rename_key(&self, obj: &std::sync::Arc<dyn Object>) -> Option<String> {
        let hash_type = self.common_hash?;
        match obj.hash(hash_type).await {
            Ok(hash) if !hash.is_empty() => Some(format!("{},{}", obj.size(), hash)),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!("{}: hash failed: {}", obj.remote(), err);
                None
            }
        }
    }

    /// Build the `size,hash` index of still-present destination files,
    /// hashing only sizes that appear among the rename candidates.
    async fn make_rename_map(
        self: &std::sync::Arc<Self>,
        candidates: &[std::sync::Arc<dyn Object>],
    ) {
        tracing::debug!("making map for --track-renames");
        let possible_sizes: std::collections::HashSet<u64> =
            candidates.iter().map(|obj| obj.size()).collect();
        let dst_objs: Vec<std::sync::Arc<dyn Object>> = self
            .dst_files
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        let (tx, rx) = async_channel::bounded(self.opts.checkers.max(1));
        let this = self.clone();
        let feeder = tokio::spawn(async move {
            for obj in dst_objs {
                if !this.send_obj(&tx, obj).await {
                    break;
                }
            }
        });
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..self.opts.transfers.max(1) {
            let this = self.clone();
            let rx = rx.clone();
            let possible_sizes = possible_sizes.clone();
            join_set.spawn(async move {
                while let Ok(obj) = rx.recv().await {
                    if !possible_sizes.contains(&obj.size()) {
                        continue;
                    }
                    let _guard = this.stats.checking(obj.remote());
                    if let Some(key) = this.rename_key(&obj).await {
                        this.rename_map
                            .lock()
                            .unwrap()
                            .entry(key)
                            .or_default()
                            .push(obj);
                    }
                }
            });
        }
        drop(rx);
        let _ = feeder.await;
        while join_set.join_next().await.is_some() {}
        tracing::debug!("finished making map for --track-renames");
    }

    fn pop_rename_map(&self, key: &str) -> Option<std::sync::Arc<dyn Object>> {
        let mut rename_map = self.rename_map.lock().unwrap();
        let dsts = rename_map.get_mut(key)?;
        let dst = dsts.remove(0);
        if dsts.is_empty() {
            rename_map.remove(key);
        }
        Some(dst)
    }

    /// Attempt to satisfy `src` by renaming a same-hash destination object
    /// into place. Returns true if the object was renamed.
    async fn try_rename(&self, src: &std::sync::Arc<dyn Object>) -> bool {
        let _guard = self.stats.checking(src.remote());
        let Some(key) = self.rename_key(src).await else {
            return false;
        };
        let Some(dst) = self.pop_rename_map(&key) else {
            return false;
        };
        if let Err(err) = operations::move_file(
            &self.fdst,
            None,
            src.remote(),
            dst.clone(),
            self.common_hash,
            &self.opts,
            &self.stats,
        )
        .await
        {
            tracing::debug!(
                "{}: failed to rename to {:?}: {:#}",
                src.remote(),
                dst.remote(),
                err
            );
            return false;
        }
        self.dst_files.lock().unwrap().remove(dst.remote());
        self.stats.renames.inc();
        tracing::debug!("{}: renamed from {:?}", src.remote(), dst.remote());
        true
    }

    // ---- pipeline plumbing ----

    fn start_pipeline(self: &std::sync::Arc<Self>) -> Pipeline {
        let transfers = self.opts.transfers.max(1);
        let checkers = self.opts.checkers.max(1);
        let (checked_tx, checked_rx) = async_channel::bounded::<ObjectPair>(transfers);
        let (upload_tx, upload_rx) = async_channel::bounded::<ObjectPair>(transfers);
        let (rename_tx, rename_rx) = async_channel::bounded::<ObjectPair>(transfers);
        let (delete_tx, delete_rx) =
            async_channel::bounded::<std::sync::Arc<dyn Object>>(checkers);
        let (cand_tx, cand_rx) =
            async_channel::bounded::<std::sync::Arc<dyn Object>>(checkers);

        let mut checker_set = tokio::task::JoinSet::new();
        for _ in 0..checkers {
            checker_set.spawn(
                self.clone()
                    .pair_checker(checked_rx.clone(), upload_tx.clone()),
            );
        }
        let mut renamer_set = tokio::task::JoinSet::new();
        if self.track_renames {
            for _ in 0..checkers {
                renamer_set.spawn(
                    self.clone()
                        .pair_renamer(rename_rx.clone(), upload_tx.clone()),
                );
            }
        }
        let mut transfer_set = tokio::task::JoinSet::new();
        for _ in 0..transfers {
            transfer_set.spawn(self.clone().pair_transfer(upload_rx.clone()));
        }
        let mut deleter_set = tokio::task::JoinSet::new();
        if matches!(self.delete_mode, DeleteMode::During | DeleteMode::Only) {
            deleter_set.spawn(self.clone().deleter(delete_rx.clone()));
        }
        let collector = if self.track_renames {
            Some(tokio::spawn(async move {
                let mut candidates = Vec::new();
                while let Ok(obj) = cand_rx.recv().await {
                    candidates.push(obj);
                }
                candidates
            }))
        } else {
            None
        };
        Pipeline {
            tx: PipeTx {
                checked: checked_tx,
                upload: upload_tx,
                delete: delete_tx,
                candidates: cand_tx,
            },
            rename_tx,
            checkers: checker_set,
            renamers: renamer_set,
            transferers: transfer_set,
            deleters: deleter_set,
            collector,
        }
    }

    async fn drain(&self, mut set: tokio::task::JoinSet<()>) {
        while let Some(res) = set.join_next().await {
            if let Err(err) = res {
                self.process_error(anyhow::Error::new(err).context("worker panicked"));
            }
        }
    }

    /// Rename phase plus the ordered stage shutdown: checkers drain before
    /// renamers, renamers before transferers, transferers before the
    /// deleter.
    async fn finish_pipeline(self: &std::sync::Arc<Self>, pipeline: Pipeline) {
        let Pipeline {
            tx,
            rename_tx,
            checkers,
            renamers,
            transferers,
            deleters,
            collector,
        } = pipeline;
        let PipeTx {
            checked: checked_tx,
            upload: upload_tx,
            delete: delete_tx,
            candidates: cand_tx,
        } = tx;
        drop(cand_tx);
        let candidates = match collector {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if self.track_renames {
            self.make_rename_map(&candidates).await;
            for src in candidates {
                if self.aborting() {
                    break;
                }
                if !self
                    .send_pair(&rename_tx, ObjectPair { src, dst: None })
                    .await
                {
                    break;
                }
            }
        }
        drop(checked_tx);
        tracing::debug!("waiting for checks to finish");
        self.drain(checkers).await;
        drop(rename_tx);
        if self.track_renames {
            tracing::debug!("waiting for renames to finish");
        }
        self.drain(renamers).await;
        drop(upload_tx);
        tracing::debug!("waiting for transfers to finish");
        self.drain(transferers).await;
        drop(delete_tx);
        self.drain(deleters).await;
    }

    /// Delete the files left in the destination map. With `check_src_map`
    /// the full source map filters them first; otherwise matched files have
    /// already been removed from the map.
    async fn delete_leftovers(&self, check_src_map: bool) {
        let src_keys: std::collections::HashSet<String> = if check_src_map {
            self.src_files.lock().unwrap().keys().cloned().collect()
        } else {
            std::collections::HashSet::new()
        };
        let leftovers: Vec<std::sync::Arc<dyn Object>> = {
            let dst_files = self.dst_files.lock().unwrap();
            dst_files
                .iter()
                .filter(|(remote, _)| !check_src_map || !src_keys.contains(*remote))
                .map(|(_, obj)| obj.clone())
                .collect()
        };
        for obj in leftovers {
            if self.aborting() {
                return;
            }
            if let Err(err) =
                operations::delete_file(obj, self.backup(), &self.opts, &self.stats).await
            {
                self.process_error(err);
            }
        }
    }

    fn src_depth(&self) -> u32 {
        self.opts.max_depth.unwrap_or(walk::MAX_DEPTH)
    }

    fn dst_depth(&self) -> u32 {
        if self.opts.delete_excluded {
            walk::MAX_DEPTH
        } else {
            self.src_depth()
        }
    }

    async fn run(self: &std::sync::Arc<Self>) -> Result<()> {
        if backend::same(self.fdst.as_ref(), self.fsrc.as_ref()) {
            tracing::error!("nothing to do as source and destination are the same");
            return Ok(());
        }
        operations::mkdir(&self.fdst, "", &self.opts).await?;
        if self.flat {
            self.run_flat().await
        } else {
            self.run_dir_at_a_time().await
        }
    }

    // ---- directory-at-a-time traversal (default) ----

    async fn run_dir_at_a_time(self: &std::sync::Arc<Self>) -> Result<()> {
        let checkers = self.opts.checkers.max(1);
        let pipeline = self.start_pipeline();
        let (job_tx, job_rx) = async_channel::bounded::<ListDirJob>(checkers);
        let traversing = std::sync::Arc::new(WaitGroup::new());
        let mut walker_set = tokio::task::JoinSet::new();
        for _ in 0..checkers {
            walker_set.spawn(self.clone().traverse_worker(
                job_tx.clone(),
                job_rx.clone(),
                traversing.clone(),
                pipeline.tx.clone(),
            ));
        }
        traversing.add(1);
        let root_job = ListDirJob {
            remote: String::new(),
            src_depth: self.src_depth().saturating_sub(1),
            dst_depth: self.dst_depth().saturating_sub(1),
            no_src: false,
            no_dst: false,
        };
        if job_tx.send(root_job).await.is_err() {
            traversing.done();
        }
        tokio::select! {
            _ = traversing.wait() => {}
            _ = self.abort.cancelled() => {}
        }
        job_tx.close();
        self.drain(walker_set).await;
        drop(job_tx);
        drop(job_rx);

        self.finish_pipeline(pipeline).await;

        if self.delete_mode == DeleteMode::After {
            if self.has_error() {
                tracing::error!("not deleting files as there were IO errors");
            } else {
                self.delete_leftovers(false).await;
            }
        }
        self.take_error()
    }

    async fn traverse_worker(
        self: std::sync::Arc<Self>,
        job_tx: async_channel::Sender<ListDirJob>,
        job_rx: async_channel::Receiver<ListDirJob>,
        traversing: std::sync::Arc<WaitGroup>,
        tx: PipeTx,
    ) {
        loop {
            let job = tokio::select! {
                _ = self.abort.cancelled() => return,
                job = job_rx.recv() => match job {
                    Ok(job) => job,
                    Err(_) => return,
                },
            };
            let new_jobs = self.process_dir_job(&job, &tx).await;
            if !new_jobs.is_empty() {
                traversing.add(new_jobs.len());
                // send from a separate task so a full queue can't deadlock
                // the workers against each other
                let job_tx = job_tx.clone();
                tokio::spawn(async move {
                    for job in new_jobs {
                        if job_tx.send(job).await.is_err() {
                            break;
                        }
                    }
                });
            }
            traversing.done();
        }
    }

    /// List one directory on both sides and merge the two sorted listings.
    async fn process_dir_job(&self, job: &ListDirJob, tx: &PipeTx) -> Vec<ListDirJob> {
        let (src_list, dst_list) = tokio::join!(
            async {
                if job.no_src {
                    Ok(Vec::new())
                } else {
                    walk::list_dir_sorted(&self.fsrc, &job.remote).await
                }
            },
            async {
                if job.no_dst {
                    Ok(Vec::new())
                } else {
                    match walk::list_dir_sorted(&self.fdst, &job.remote).await {
                        // nothing there yet, copy the stuff anyway
                        Err(BackendError::DirNotFound) => Ok(Vec::new()),
                        other => other,
                    }
                }
            },
        );
        let src_list = match src_list {
            Ok(list) => list,
            Err(err) => {
                self.process_error(anyhow::Error::new(err).context(format!(
                    "error reading source directory {:?}",
                    job.remote
                )));
                return Vec::new();
            }
        };
        let dst_list = match dst_list {
            Ok(list) => list,
            Err(err) => {
                self.process_error(anyhow::Error::new(err).context(format!(
                    "error reading destination directory {:?}",
                    job.remote
                )));
                return Vec::new();
            }
        };
        let mut jobs = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < src_list.len() || j < dst_list.len() {
            if self.aborting() {
                return Vec::new();
            }
            let src = src_list.get(i);
            let dst = dst_list.get(j);
            match (src, dst) {
                (Some(src), Some(dst)) if src.remote() == dst.remote() => {
                    self.matched(src.clone(), dst.clone(), job, &mut jobs, tx)
                        .await;
                    i += 1;
                    j += 1;
                }
                (Some(src), Some(dst)) if src.remote() < dst.remote() => {
                    self.src_only(src.clone(), job, &mut jobs, tx).await;
                    i += 1;
                }
                (Some(_), Some(dst)) => {
                    self.dst_only(dst.clone(), job, &mut jobs, tx).await;
                    j += 1;
                }
                (Some(src), None) => {
                    self.src_only(src.clone(), job, &mut jobs, tx).await;
                    i += 1;
                }
                (None, Some(dst)) => {
                    self.dst_only(dst.clone(), job, &mut jobs, tx).await;
                    j += 1;
                }
                (None, None) => break,
            }
        }
        jobs
    }

    /// The entry exists on both sides.
    async fn matched(
        &self,
        src: backend::DirEntry,
        dst: backend::DirEntry,
        job: &ListDirJob,
        jobs: &mut Vec<ListDirJob>,
        tx: &PipeTx,
    ) {
        match (src, dst) {
            (backend::DirEntry::File(src), backend::DirEntry::File(dst)) => {
                if self.delete_mode == DeleteMode::Only {
                    return;
                }
                self.send_pair(
                    &tx.checked,
                    ObjectPair {
                        src,
                        dst: Some(dst),
                    },
                )
                .await;
            }
            (backend::DirEntry::Dir { remote, .. }, backend::DirEntry::Dir { .. }) => {
                if job.src_depth > 0 && job.dst_depth > 0 {
                    jobs.push(ListDirJob {
                        remote,
                        src_depth: job.src_depth - 1,
                        dst_depth: job.dst_depth - 1,
                        no_src: false,
                        no_dst: false,
                    });
                }
            }
            (backend::DirEntry::File(src), backend::DirEntry::Dir { .. }) => {
                self.process_error(anyhow!(
                    "{}: can't overwrite directory with file",
                    src.remote()
                ));
            }
            (backend::DirEntry::Dir { remote, .. }, backend::DirEntry::File(_)) => {
                self.process_error(anyhow!(
                    "{}: can't overwrite file with directory",
                    remote
                ));
            }
        }
    }

    /// The entry exists in the source only.
    async fn src_only(
        &self,
        src: backend::DirEntry,
        job: &ListDirJob,
        jobs: &mut Vec<ListDirJob>,
        tx: &PipeTx,
    ) {
        if self.delete_mode == DeleteMode::Only {
            return;
        }
        match src {
            backend::DirEntry::File(obj) => {
                if self.track_renames {
                    // held back to check for a rename once the destination
                    // index is built
                    self.send_obj(&tx.candidates, obj).await;
                } else {
                    // no need to check since it doesn't exist in the
                    // destination
                    self.send_pair(&tx.upload, ObjectPair { src: obj, dst: None })
                        .await;
                }
            }
            backend::DirEntry::Dir { remote, .. } => {
                if job.src_depth > 0 {
                    jobs.push(ListDirJob {
                        remote,
                        src_depth: job.src_depth - 1,
                        dst_depth: 0,
                        no_src: false,
                        no_dst: true,
                    });
                }
            }
        }
    }

    /// The entry exists in the destination only.
    async fn dst_only(
        &self,
        dst: backend::DirEntry,
        job: &ListDirJob,
        jobs: &mut Vec<ListDirJob>,
        tx: &PipeTx,
    ) {
        if self.delete_mode == DeleteMode::Off && !self.track_renames {
            return;
        }
        match dst {
            backend::DirEntry::File(obj) => match self.delete_mode {
                DeleteMode::During | DeleteMode::Only => {
                    self.send_obj(&tx.delete, obj).await;
                }
                // delete-after and rename tracking both need the map of
                // destination-only files
                _ => {
                    self.dst_files
                        .lock()
                        .unwrap()
                        .insert(obj.remote().to_string(), obj);
                }
            },
            backend::DirEntry::Dir { remote, .. } => {
                if job.dst_depth > 0 {
                    jobs.push(ListDirJob {
                        remote,
                        src_depth: 0,
                        dst_depth: job.dst_depth - 1,
                        no_src: true,
                        no_dst: false,
                    });
                }
            }
        }
    }

    // ---- flat (list-then-match) traversal ----

    async fn run_flat(self: &std::sync::Arc<Self>) -> Result<()> {
        // read the whole destination concurrently with starting the source
        let dst_reader = if !self.no_traverse {
            let fdst = self.fdst.clone();
            let dst_depth = self.dst_depth();
            Some(tokio::spawn(async move {
                walk::read_files_map(fdst, "", dst_depth).await
            }))
        } else {
            None
        };
        // delete-before must see the full source map first
        let read_source_map = self.delete_mode == DeleteMode::Before;
        if read_source_map {
            let src_files =
                walk::read_files_map(self.fsrc.clone(), "", self.src_depth()).await?;
            *self.src_files.lock().unwrap() = src_files;
        }
        if let Some(dst_reader) = dst_reader {
            let dst_files = dst_reader
                .await
                .map_err(anyhow::Error::new)?
                .context("error listing destination")?;
            *self.dst_files.lock().unwrap() = dst_files;
        }
        if self.delete_mode == DeleteMode::Before {
            self.delete_leftovers(true).await;
            if self.has_error() {
                return self.take_error();
            }
        }

        let pipeline = self.start_pipeline();
        let (src_tx, src_rx) = async_channel::bounded::<std::sync::Arc<dyn Object>>(
            self.opts.checkers.max(1) + self.opts.transfers.max(1),
        );
        let feeder: tokio::task::JoinHandle<Result<()>> = if read_source_map {
            let snapshot: Vec<std::sync::Arc<dyn Object>> = self
                .src_files
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            let this = self.clone();
            tokio::spawn(async move {
                for obj in snapshot {
                    if !this.send_obj(&src_tx, obj).await {
                        break;
                    }
                }
                Ok(())
            })
        } else {
            let fsrc = self.fsrc.clone();
            let src_depth = self.src_depth();
            let abort = self.abort.clone();
            tokio::spawn(async move {
                walk::files_to_chan(fsrc, String::new(), src_depth, src_tx, abort).await
            })
        };

        loop {
            let src = tokio::select! {
                _ = self.abort.cancelled() => break,
                src = src_rx.recv() => match src {
                    Ok(src) => src,
                    Err(_) => break,
                },
            };
            let remote = src.remote().to_string();
            let dst = if self.no_traverse {
                match self.fdst.new_object(&remote).await {
                    Ok(obj) => Some(obj),
                    Err(BackendError::ObjectNotFound) => None,
                    Err(err) => {
                        tracing::debug!("{}: error looking up object: {}", remote, err);
                        None
                    }
                }
            } else {
                self.dst_files.lock().unwrap().remove(&remote)
            };
            if let Some(dst) = dst {
                if !self
                    .send_pair(&pipeline.tx.checked, ObjectPair { src, dst: Some(dst) })
                    .await
                {
                    break;
                }
            } else if self.track_renames {
                if !self.send_obj(&pipeline.tx.candidates, src).await {
                    break;
                }
            } else if !self
                .send_pair(&pipeline.tx.upload, ObjectPair { src, dst: None })
                .await
            {
                break;
            }
        }
        match feeder.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.process_error(err.context(format!(
                "error listing source {}",
                self.fsrc.describe()
            ))),
            Err(err) => {
                self.process_error(anyhow::Error::new(err).context("source listing panicked"))
            }
        }

        self.finish_pipeline(pipeline).await;

        if matches!(self.delete_mode, DeleteMode::During | DeleteMode::After) {
            if self.has_error() {
                tracing::error!("not deleting files as there were IO errors");
            } else {
                self.delete_leftovers(false).await;
            }
        }
        self.take_error()
    }
}
