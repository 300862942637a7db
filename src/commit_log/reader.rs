use log::{info, warn};

use std::{
    collections::{HashSet, VecDeque},
    path,
};

use crate::{
    clock::REVISION_NULL,
    commit_log::{
        inflate_block, BlockHeader, BlockStream, CommitLogBase, Config, FileInfo,
    },
    util, Error, Result,
};

/// Data block read from a commit log, payload is uncompressed and verified.
#[derive(Clone, Debug)]
pub struct Block {
    pub log_dir: path::PathBuf,
    pub fragment: u32,
    pub offset: u64,
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

/// Read data blocks from a commit log, in fragment order, following link
/// blocks into linked logs.
///
/// Truncated blocks at the tail of a fragment, typically left behind by a
/// crash in the middle of a write, are skipped with a warning. Other
/// corruptions fail the read, unless [Config::skip_errors] is set.
pub struct CommitLogReader {
    log_dir: path::PathBuf,
    config: Config,

    pending: VecDeque<FileInfo>,
    current: Option<(FileInfo, BlockStream)>,
    done: Vec<FileInfo>,
    linked_logs: HashSet<path::PathBuf>,
    latest_revision: i64,

    n_blocks: usize,
    n_truncated: usize,
    n_corrupt: usize,
}

impl CommitLogReader {
    /// Open all fragments under `log_dir`.
    pub fn open(log_dir: &path::Path, config: Config) -> Result<CommitLogReader> {
        let pending = load_fragments(log_dir, None, None)?;
        Ok(Self::new(log_dir, config, pending))
    }

    /// Open only the listed `fragments` under `log_dir`.
    pub fn open_fragments(
        log_dir: &path::Path,
        config: Config,
        fragments: &[u32],
    ) -> Result<CommitLogReader> {
        let filter: HashSet<u32> = fragments.iter().cloned().collect();
        let pending = load_fragments(log_dir, None, Some(&filter))?;
        if pending.len() != filter.len() {
            let found: HashSet<u32> = pending.iter().map(|f| f.num).collect();
            let missing: Vec<&u32> = filter.difference(&found).collect();
            err_at!(InvalidFile, msg: "{:?} missing fragments {:?}", log_dir, missing)?
        }
        Ok(Self::new(log_dir, config, pending))
    }

    fn new(log_dir: &path::Path, config: Config, pending: VecDeque<FileInfo>) -> Self {
        CommitLogReader {
            log_dir: log_dir.to_path_buf(),
            config,

            pending,
            current: None,
            done: vec![],
            linked_logs: HashSet::new(),
            latest_revision: REVISION_NULL,

            n_blocks: 0,
            n_truncated: 0,
            n_corrupt: 0,
        }
    }

    /// Return the next data block, None when all fragments are read.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        loop {
            if self.current.is_none() {
                match self.pending.pop_front() {
                    Some(fragment) => {
                        let stream = BlockStream::open(&fragment.to_path())?;
                        self.current = Some((fragment, stream));
                    }
                    None => return Ok(None),
                }
            }

            let res = match self.current.as_mut() {
                Some((_, stream)) => stream.next_block(),
                None => continue,
            };

            match res {
                Ok(Some(info)) => {
                    let payload = match inflate_block(&info.header, &info.zblock) {
                        Ok(payload) => payload,
                        Err(err) if self.config.skip_errors => {
                            warn!(target: "commitlog", "{:?}, skipping block {}", self.log_dir, err);
                            self.n_corrupt += 1;
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                    let revision = info.header.revision;
                    self.latest_revision = std::cmp::max(self.latest_revision, revision);
                    let (log_dir, num) = match self.current.as_mut() {
                        Some((fragment, _)) => {
                            fragment.revision = std::cmp::max(fragment.revision, revision);
                            (fragment.log_dir.clone(), fragment.num)
                        }
                        None => continue,
                    };

                    if info.header.is_link() {
                        self.follow_link(&log_dir, num, payload)?;
                        continue;
                    }

                    self.n_blocks += 1;
                    break Ok(Some(Block {
                        log_dir,
                        fragment: num,
                        offset: info.start_offset,
                        header: info.header,
                        payload,
                    }));
                }
                Ok(None) => self.finish_fragment(),
                Err(err @ Error::TruncatedCommitLog(_, _)) => {
                    warn!(target: "commitlog", "{:?}, truncated block {}", self.log_dir, err);
                    self.n_truncated += 1;
                    self.finish_fragment()
                }
                Err(err) if self.config.skip_errors => {
                    warn!(
                        target: "commitlog",
                        "{:?}, skipping rest of fragment {}", self.log_dir, err
                    );
                    self.n_corrupt += 1;
                    self.finish_fragment()
                }
                Err(err) => break Err(err),
            }
        }
    }

    fn finish_fragment(&mut self) {
        if let Some((mut fragment, stream)) = self.current.take() {
            fragment.size = stream.to_size();
            self.done.push(fragment)
        }
    }

    fn follow_link(&mut self, log_dir: &path::Path, num: u32, payload: Vec<u8>) -> Result<()> {
        let linked_dir = match String::from_utf8(payload) {
            Ok(s) => path::PathBuf::from(s),
            Err(err) => err_at!(CorruptCommitLog, msg: "link block in {:?} {}", log_dir, err)?,
        };

        if self.linked_logs.contains(&linked_dir) {
            return Ok(());
        }
        self.linked_logs.insert(linked_dir.clone());

        if !linked_dir.is_dir() {
            warn!(target: "commitlog", "{:?}, linked log {:?} missing", log_dir, linked_dir);
            return Ok(());
        }

        let parent = Some((log_dir.to_path_buf(), num));
        let fragments = load_fragments(&linked_dir, parent, None)?;
        info!(
            target: "commitlog",
            "{:?}, following link to {:?} with {} fragments",
            log_dir, linked_dir, fragments.len()
        );
        for fragment in fragments.into_iter().rev() {
            self.pending.push_front(fragment)
        }
        Ok(())
    }

    /// Read through remaining blocks, only to learn fragment revisions.
    pub fn scan(&mut self) -> Result<()> {
        while self.next_block()?.is_some() {}
        Ok(())
    }

    /// Return the set of log directories linked from this log.
    pub fn to_linked_logs(&self) -> HashSet<path::PathBuf> {
        self.linked_logs.clone()
    }

    /// Return (data-blocks, truncated-blocks, corrupt-blocks) seen so far.
    pub fn to_stats(&self) -> (usize, usize, usize) {
        (self.n_blocks, self.n_truncated, self.n_corrupt)
    }
}

impl CommitLogBase for CommitLogReader {
    fn to_log_dir(&self) -> path::PathBuf {
        self.log_dir.clone()
    }

    fn to_latest_revision(&self) -> i64 {
        self.latest_revision
    }

    /// Revisions are known only for fragments that are already read,
    /// use [CommitLogReader::scan] to learn all of them.
    fn to_fragments(&self) -> Vec<FileInfo> {
        let mut fragments = self.done.clone();
        if let Some((fragment, _)) = self.current.as_ref() {
            fragments.push(fragment.clone())
        }
        fragments.extend(self.pending.iter().cloned());
        fragments
    }
}

fn load_fragments(
    log_dir: &path::Path,
    parent: Option<(path::PathBuf, u32)>,
    filter: Option<&HashSet<u32>>,
) -> Result<VecDeque<FileInfo>> {
    let mut fragments = VecDeque::new();
    for (num, loc) in util::files::numbered_files(log_dir)?.into_iter() {
        if let Some(filter) = filter {
            if !filter.contains(&num) {
                continue;
            }
        }
        let size = err_at!(IOError, std::fs::metadata(&loc))?.len();
        fragments.push_back(FileInfo {
            log_dir: log_dir.to_path_buf(),
            num,
            size,
            revision: REVISION_NULL,
            parent: parent.clone(),
        });
    }

    Ok(fragments)
}
