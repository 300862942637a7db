use fs2::FileExt;
use log::{debug, error, info, warn};

use std::{
    collections::HashSet,
    fs,
    path,
    sync::{Mutex, MutexGuard},
};

use crate::{
    clock::REVISION_NULL,
    commit_log::{
        encode_block, to_fragment_path, CommitLogBase, Config, FileInfo, CommitLogReader,
        FRAGMENT_HEADER, LOCK_FILE, MAGIC_DATA, MAGIC_LINK,
    },
    compress::{create_block_codec, BlockCodec, CompressionType},
    util, write_file, Result,
};

/// Append only, block structured, commit log.
///
/// CommitLog can be shared across threads, appends are serialized
/// internally. Only one CommitLog instance can write into a log directory,
/// which is ensured by an exclusive lock on the directory's lock file.
pub struct CommitLog {
    log_dir: path::PathBuf,
    config: Config,
    inner: Mutex<Inner>,
}

struct Inner {
    lock_file: Option<fs::File>,
    file: Option<fs::File>,
    closed: bool,
    codec: Box<dyn BlockCodec>,

    cur_fragment_num: u32,
    cur_fragment_length: u64,
    // latest revision in current fragment, REVISION_NULL if nothing
    // written since the last roll.
    cur_revision: i64,
    latest_revision: i64,
    needs_roll: bool,

    fragments: Vec<FileInfo>,
    linked_logs: HashSet<path::PathBuf>,

    n_appends: u64,
    n_syncs: u64,
    #[cfg(test)]
    sync_faults: usize,
}

impl CommitLog {
    /// Create a commit log writer for `log_dir`. If `init` log is
    /// supplied, its fragments are adopted for purging and new fragments
    /// are numbered after them. Otherwise numbering starts after any
    /// fragment files already present.
    pub fn create(
        log_dir: &path::Path,
        config: Config,
        init: Option<&CommitLogReader>,
    ) -> Result<CommitLog> {
        err_at!(IOError, fs::create_dir_all(log_dir), "{:?}", log_dir)?;

        let lock_file = {
            let loc = log_dir.join(LOCK_FILE);
            let mut opts = fs::OpenOptions::new();
            let file = err_at!(IOError, opts.create(true).write(true).open(&loc))?;
            err_at!(IOError, file.try_lock_exclusive(), "locking {:?}", log_dir)?;
            file
        };

        let mut fragments = vec![];
        let mut latest_revision = REVISION_NULL;
        let mut linked_logs = HashSet::new();
        if let Some(init) = init {
            fragments = init.to_fragments();
            latest_revision = init.to_latest_revision();
            linked_logs = init.to_linked_logs();
        }

        let last_num = util::files::numbered_files(log_dir)?
            .last()
            .map(|(num, _)| *num);
        let cur_fragment_num = match last_num {
            Some(num) => num + 1,
            None => 0,
        };

        let mut inner = Inner {
            lock_file: Some(lock_file),
            file: None,
            closed: false,
            codec: create_block_codec(config.compressor),

            cur_fragment_num,
            cur_fragment_length: 0,
            cur_revision: REVISION_NULL,
            latest_revision,
            needs_roll: false,

            fragments,
            linked_logs,

            n_appends: 0,
            n_syncs: 0,
            #[cfg(test)]
            sync_faults: 0,
        };
        inner.open_fragment(log_dir)?;

        info!(
            target: "commitlog",
            "{:?}, opened fragment {} compressor:{}",
            log_dir, inner.cur_fragment_num, config.compressor
        );

        Ok(CommitLog {
            log_dir: log_dir.to_path_buf(),
            config,
            inner: Mutex::new(inner),
        })
    }

    fn lock_inner(&self) -> Result<MutexGuard<Inner>> {
        let inner = err_at!(Fatal, self.inner.lock())?;
        if inner.closed {
            err_at!(Closed, msg: "commit log {:?}", self.log_dir)
        } else {
            Ok(inner)
        }
    }

    /// Compress and append `payload` as a data block. When `sync` is
    /// true, the fragment is synced to disk before returning.
    pub fn append(&self, cluster_id: u64, payload: &[u8], revision: i64, sync: bool) -> Result<()> {
        let mut inner = self.lock_inner()?;

        if inner.needs_roll {
            inner.roll(&self.log_dir)?;
        }

        let block = encode_block(inner.codec.as_ref(), MAGIC_DATA, revision, cluster_id, payload)?;
        inner.write_block(&self.log_dir, &block, revision)?;
        if sync {
            inner.sync()?;
        }
        inner.n_appends += 1;

        if inner.cur_fragment_length > self.config.roll_limit {
            inner.roll(&self.log_dir)?;
        }

        Ok(())
    }

    /// Flush and sync the current fragment.
    pub fn sync(&self) -> Result<()> {
        self.lock_inner()?.sync()
    }

    /// Close the current fragment and start a new one. No-op if nothing
    /// was written since the last roll.
    pub fn roll(&self) -> Result<()> {
        self.lock_inner()?.roll(&self.log_dir)
    }

    /// Link commit log `other` into this log. Fragments of `other` are
    /// logically part of this log after linking, and shall be purged along
    /// with this log. Linking an already linked log or an empty log is a
    /// no-op.
    pub fn link_log(&self, cluster_id: u64, other: &dyn CommitLogBase) -> Result<()> {
        let other_dir = other.to_log_dir();
        if other_dir == self.log_dir {
            err_at!(InvalidInput, msg: "cannot link {:?} to itself", other_dir)?
        }

        let mut inner = self.lock_inner()?;
        if inner.linked_logs.contains(&other_dir) {
            info!(target: "commitlog", "{:?}, skipping link of {:?}", self.log_dir, other_dir);
            return Ok(());
        }

        let link_revision = other.to_latest_revision();
        if link_revision == REVISION_NULL {
            info!(target: "commitlog", "{:?}, skipping empty log {:?}", self.log_dir, other_dir);
            return Ok(());
        }

        let fragments = other.to_fragments();
        if fragments.is_empty() {
            err_at!(InvalidInput, msg: "log {:?} has no closed fragments", other_dir)?
        }

        let payload = match other_dir.to_str() {
            Some(s) => s.as_bytes().to_vec(),
            None => err_at!(InvalidInput, msg: "non utf8 log dir {:?}", other_dir)?,
        };

        if inner.needs_roll {
            inner.roll(&self.log_dir)?;
        }

        let codec = create_block_codec(CompressionType::None);
        let block = encode_block(codec.as_ref(), MAGIC_LINK, link_revision, cluster_id, &payload)?;
        inner.write_block(&self.log_dir, &block, link_revision)?;
        inner.sync()?;

        let parent = (self.log_dir.clone(), inner.cur_fragment_num);
        for mut fragment in fragments.into_iter() {
            if fragment.parent.is_none() {
                fragment.parent = Some(parent.clone());
            }
            inner.fragments.push(fragment);
        }
        inner.linked_logs.insert(other_dir.clone());

        info!(
            target: "commitlog",
            "{:?}, linked {:?} revision:{}", self.log_dir, other_dir, link_revision
        );

        inner.roll(&self.log_dir)
    }

    /// Remove fragments whose latest revision is older than `revision`.
    /// Fragments holding links are removed only after all fragments they
    /// link to are removed. Return the list of removed fragment files.
    pub fn purge(&self, revision: i64) -> Result<Vec<path::PathBuf>> {
        let mut inner = self.lock_inner()?;

        let mut removed = vec![];
        loop {
            let referenced: HashSet<(path::PathBuf, u32)> = inner
                .fragments
                .iter()
                .filter_map(|f| f.parent.clone())
                .collect();

            let (purge, keep): (Vec<FileInfo>, Vec<FileInfo>) =
                inner.fragments.drain(..).partition(|f| {
                    f.revision < revision
                        && !referenced.contains(&(f.log_dir.clone(), f.num))
                });
            inner.fragments = keep;

            if purge.is_empty() {
                break;
            }
            for fragment in purge.into_iter() {
                let loc = fragment.to_path();
                match fs::remove_file(&loc) {
                    Ok(_) => (),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                    Err(err) => err_at!(IOError, Err(err), "purging {:?}", loc)?,
                }
                debug!(target: "commitlog", "{:?}, purged {:?}", self.log_dir, loc);
                removed.push(loc);
            }
        }

        // remove linked logs that have no more fragments.
        let live: HashSet<path::PathBuf> =
            inner.fragments.iter().map(|f| f.log_dir.clone()).collect();
        let dead: Vec<path::PathBuf> = inner
            .linked_logs
            .iter()
            .filter(|dir| !live.contains(*dir))
            .cloned()
            .collect();
        for dir in dead.into_iter() {
            inner.linked_logs.remove(&dir);
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(target: "commitlog", "{:?}, removing linked log {:?}", dir, err);
            }
        }

        if !removed.is_empty() {
            info!(
                target: "commitlog",
                "{:?}, purged {} fragments below revision {}",
                self.log_dir, removed.len(), revision
            );
        }
        Ok(removed)
    }

    /// Sync and close the log. Current fragment, if not empty, is made
    /// available via [CommitLogBase::to_fragments]. Subsequent operations
    /// fail with [crate::Error::Closed].
    pub fn close(&self) -> Result<()> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        if inner.closed {
            return Ok(());
        }
        inner.sync()?;
        inner.close_fragment(&self.log_dir);
        inner.closed = true;
        if let Some(file) = inner.lock_file.take() {
            file.unlock().ok();
        }
        info!(
            target: "commitlog",
            "{:?}, closed appends:{} syncs:{}", self.log_dir, inner.n_appends, inner.n_syncs
        );
        Ok(())
    }

    /// Mark that the next append should start a new fragment.
    pub fn set_needs_roll(&self) -> Result<()> {
        self.lock_inner()?.needs_roll = true;
        Ok(())
    }

    pub fn to_current_fragment(&self) -> Result<u32> {
        Ok(self.lock_inner()?.cur_fragment_num)
    }

    /// Return the number of appends and the number of fsyncs on this log.
    pub fn to_stats(&self) -> Result<(u64, u64)> {
        let inner = self.lock_inner()?;
        Ok((inner.n_appends, inner.n_syncs))
    }

    /// Fail the next `n` syncs with IOError.
    #[cfg(test)]
    pub(crate) fn set_sync_faults(&self, n: usize) -> Result<()> {
        self.lock_inner()?.sync_faults = n;
        Ok(())
    }

    /// Return log directories linked into this log.
    pub fn to_linked_logs(&self) -> Result<HashSet<path::PathBuf>> {
        Ok(self.lock_inner()?.linked_logs.clone())
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.closed,
            Err(_) => true,
        }
    }

    pub fn to_config(&self) -> Config {
        self.config.clone()
    }
}

impl CommitLogBase for CommitLog {
    fn to_log_dir(&self) -> path::PathBuf {
        self.log_dir.clone()
    }

    fn to_latest_revision(&self) -> i64 {
        match self.inner.lock() {
            Ok(inner) => inner.latest_revision,
            Err(_) => REVISION_NULL,
        }
    }

    fn to_fragments(&self) -> Vec<FileInfo> {
        match self.inner.lock() {
            Ok(inner) => inner.fragments.clone(),
            Err(_) => vec![],
        }
    }
}

impl Inner {
    fn open_fragment(&mut self, log_dir: &path::Path) -> Result<()> {
        let loc = to_fragment_path(log_dir, self.cur_fragment_num);
        let mut file = util::files::create_file_a(loc.as_os_str())?;
        write_file!(file, FRAGMENT_HEADER, &loc, "fragment header")?;

        self.file = Some(file);
        self.cur_fragment_length = FRAGMENT_HEADER.len() as u64;
        self.cur_revision = REVISION_NULL;
        self.needs_roll = false;
        Ok(())
    }

    fn write_block(&mut self, log_dir: &path::Path, block: &[u8], revision: i64) -> Result<()> {
        if self.file.is_none() {
            self.open_fragment(log_dir)?;
        }
        let loc = to_fragment_path(log_dir, self.cur_fragment_num);
        let res = match self.file.as_mut() {
            Some(file) => write_fragment(file, block, &loc),
            None => err_at!(Fatal, msg: "no open fragment {:?}", loc),
        };
        if let Err(err) = res {
            self.discard_partial(log_dir);
            return Err(err);
        }

        self.cur_fragment_length += block.len() as u64;
        self.cur_revision = std::cmp::max(self.cur_revision, revision);
        self.latest_revision = std::cmp::max(self.latest_revision, revision);
        Ok(())
    }

    // Drop whatever a failed write left behind, truncating the fragment
    // back to its last block. Failing that, the fragment is closed and
    // appends move on to a new one.
    fn discard_partial(&mut self, log_dir: &path::Path) {
        let len = self.cur_fragment_length;
        let res = match self.file.as_ref() {
            Some(file) => err_at!(IOError, file.set_len(len)),
            None => Ok(()),
        };
        match res {
            Ok(_) => warn!(target: "commitlog", "{:?}, truncated fragment to {}", log_dir, len),
            Err(err) => {
                error!(target: "commitlog", "{:?}, truncate failed {}, rolling", log_dir, err);
                self.close_fragment(log_dir);
                self.cur_fragment_num += 1;
                if let Err(err) = self.open_fragment(log_dir) {
                    error!(target: "commitlog", "{:?}, open fragment {}", log_dir, err);
                }
            }
        }
    }

    fn sync(&mut self) -> Result<()> {
        #[cfg(test)]
        {
            if self.sync_faults > 0 {
                self.sync_faults -= 1;
                err_at!(IOError, msg: "induced sync fault")?
            }
        }
        if let Some(file) = self.file.as_ref() {
            err_at!(IOError, file.sync_data())?;
            self.n_syncs += 1;
        }
        Ok(())
    }

    fn close_fragment(&mut self, log_dir: &path::Path) {
        self.file.take();
        if self.cur_revision != REVISION_NULL {
            self.fragments.push(FileInfo {
                log_dir: log_dir.to_path_buf(),
                num: self.cur_fragment_num,
                size: self.cur_fragment_length,
                revision: self.cur_revision,
                parent: None,
            });
        }
    }

    fn roll(&mut self, log_dir: &path::Path) -> Result<()> {
        if self.cur_revision == REVISION_NULL {
            self.needs_roll = false;
            return Ok(());
        }

        self.sync()?;
        self.close_fragment(log_dir);
        self.cur_fragment_num += 1;
        self.open_fragment(log_dir)?;

        debug!(
            target: "commitlog",
            "{:?}, rolled to fragment {}", log_dir, self.cur_fragment_num
        );
        Ok(())
    }
}

fn write_fragment(file: &mut fs::File, block: &[u8], loc: &path::Path) -> Result<usize> {
    write_file!(file, block, loc, "commit log block")
}

#[cfg(test)]
#[path = "writer_test.rs"]
mod writer_test;
