//! The database façade: open/close, the public operations and the
//! background worker.
//!
//! One process-wide reader-writer lock guards the index and the datalog
//! together.  Writers always append to the datalog before touching the
//! index, so any slot a reader can observe refers to bytes that are already
//! readable from the segment files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{never, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::datalog::Datalog;
use crate::error::{Error, Result};
use crate::files;
use crate::flock::FileLock;
use crate::hash;
use crate::index::{Index, Slot};
use crate::iterator::ItemIterator;
use crate::metrics::Metrics;
use crate::options::{Options, SyncPolicy};
use crate::record::{self, RecordKind, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::recovery;

/// Database-wide meta persisted in `db.meta` on clean close.
#[derive(Debug, Serialize, Deserialize)]
struct DbMeta {
    hash_seed: u32,
}

/// The index and the datalog, guarded together by one RW-lock.
#[derive(Debug)]
pub(crate) struct State {
    pub index: Index,
    pub datalog: Datalog,
}

impl State {
    /// Install `sl` for `key`, treating an existing slot of the same key as
    /// an overwrite: the old record is tracked as deleted and the slot is
    /// replaced in place.  Shared by `put` and recovery replay; compaction
    /// re-homes records without changing their identity.
    pub fn put_slot(&mut self, sl: Slot, key: &[u8]) -> Result<()> {
        let State { index, datalog } = self;
        index.put(sl, |cur| {
            if cur.key_size as usize != key.len() {
                return Ok(false);
            }
            if datalog.read_key(cur)? != key {
                return Ok(false);
            }
            datalog.track_overwrite(cur);
            Ok(true)
        })
    }

    fn sync(&self) -> Result<()> {
        self.datalog.sync()?;
        self.index.sync()
    }
}

/// Everything shared between the handle, the iterators and the worker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) opts: Options,
    pub(crate) path: PathBuf,
    pub(crate) state: RwLock<State>,
    pub(crate) lock: Mutex<Option<FileLock>>,
    /// Serializes compaction against backup.
    pub(crate) maintenance: Mutex<()>,
    pub(crate) compaction_running: AtomicBool,
    pub(crate) metrics: Metrics,
    pub(crate) hash_seed: u32,
    sync_writes: bool,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn hash(&self, key: &[u8]) -> u32 {
        hash::sum32_with_seed(key, self.hash_seed)
    }
}

#[derive(Debug)]
struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// An open key-value store.
///
/// All methods are safe to call from multiple threads; reads run
/// concurrently, writes serialize on an internal lock.
///
/// # Example
///
/// ```no_run
/// use burrowdb::{Db, Options};
///
/// let db = Db::open("example-db", Options::default())?;
/// db.put(b"greeting", b"hello")?;
/// assert_eq!(db.get(b"greeting")?, Some(b"hello".to_vec()));
/// db.close()?;
/// # Ok::<(), burrowdb::Error>(())
/// ```
#[derive(Debug)]
pub struct Db {
    pub(crate) shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl Db {
    /// Open or create a database in the directory at `path`.
    ///
    /// A lock file scopes the directory to this process for the lifetime of
    /// the handle; a second open fails with [`Error::Locked`].  If the lock
    /// file was left behind by an unclean shutdown the index is discarded
    /// and rebuilt from the datalog before the handle is returned.
    pub fn open<P: AsRef<Path>>(path: P, opts: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let (lock, lock_existed) = FileLock::acquire(&files::db_path(&path, files::LOCK_NAME))?;

        let (state, hash_seed) = match Self::open_state(&path, &opts, lock_existed) {
            Ok(parts) => parts,
            Err(err) => {
                if lock_existed {
                    // Keep the lock file so the next open retries recovery;
                    // dropping the handle releases the OS lock.
                    drop(lock);
                } else {
                    let _ = lock.unlock();
                }
                return Err(err);
            }
        };

        let sync_writes = opts.sync_policy == SyncPolicy::Always;
        let shared = Arc::new(Shared {
            opts,
            path,
            state: RwLock::new(state),
            lock: Mutex::new(Some(lock)),
            maintenance: Mutex::new(()),
            compaction_running: AtomicBool::new(false),
            metrics: Metrics::default(),
            hash_seed,
            sync_writes,
            closed: AtomicBool::new(false),
        });

        let worker = Self::spawn_worker(&shared);
        Ok(Self { shared, worker })
    }

    fn open_state(path: &Path, opts: &Options, recovering: bool) -> Result<(State, u32)> {
        if recovering {
            recovery::quarantine_nonsegment_files(path)?;
        }
        let index = Index::open(path)?;
        let datalog = Datalog::open(path, opts.max_segment_size, !recovering)?;
        let mut state = State { index, datalog };

        let hash_seed = if state.index.count() == 0 {
            hash::random_seed()
        } else {
            let meta: DbMeta =
                crate::metafile::read_meta_file(&files::db_path(path, files::DB_META_NAME))?;
            meta.hash_seed
        };

        if recovering {
            recovery::recover(path, &mut state, hash_seed)?;
        }
        Ok((state, hash_seed))
    }

    fn spawn_worker(shared: &Arc<Shared>) -> Option<Worker> {
        let sync_interval = match shared.opts.sync_policy {
            SyncPolicy::Interval(interval) => Some(interval),
            _ => None,
        };
        let compaction_interval = shared.opts.background_compaction_interval;
        if sync_interval.is_none() && compaction_interval.is_none() {
            return None;
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::clone(shared);
        let handle = std::thread::Builder::new()
            .name("burrowdb-worker".to_string())
            .spawn(move || run_worker(shared, stop_rx, sync_interval, compaction_interval))
            .expect("failed to spawn worker thread");
        Some(Worker { stop_tx, handle })
    }

    /// Value stored for `key`, or `None` when the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let h = self.shared.hash(key);
        self.shared.metrics.gets.fetch_add(1, Ordering::Relaxed);
        let state = self.shared.state.read();
        let State { index, datalog } = &*state;
        let mut value = None;
        index.get(h, |sl| {
            let (sl_key, sl_value) = datalog.read_key_value(sl)?;
            if sl_key == key {
                // Copy out: the mmap view this borrows from may be remapped
                // by the next append.
                value = Some(sl_value.to_vec());
                return Ok(true);
            }
            self.shared
                .metrics
                .hash_collisions
                .fetch_add(1, Ordering::Relaxed);
            Ok(false)
        })?;
        Ok(value)
    }

    /// True if `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        let h = self.shared.hash(key);
        let state = self.shared.state.read();
        let State { index, datalog } = &*state;
        let mut found = false;
        index.get(h, |sl| {
            if sl.key_size as usize != key.len() {
                return Ok(false);
            }
            if datalog.read_key(sl)? == key {
                found = true;
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(found)
    }

    /// Store `value` under `key`, replacing any existing value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        let h = self.shared.hash(key);
        self.shared.metrics.puts.fetch_add(1, Ordering::Relaxed);

        let mut state = self.shared.state.write();
        let data = record::encode_put(key, value);
        if data.len() as u64 > state.datalog.max_record_size() {
            // Could never fit even an empty segment.
            return Err(Error::ValueTooLarge);
        }
        let (segment_id, offset) = state.datalog.write_record(&data, RecordKind::Put)?;
        let sl = Slot {
            hash: h,
            segment_id,
            key_size: key.len() as u16,
            value_size: value.len() as u32,
            offset,
        };
        state.put_slot(sl, key)?;

        if self.shared.sync_writes {
            state.sync()?;
        }
        Ok(())
    }

    /// Remove `key` if present.  Removing an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let h = self.shared.hash(key);
        self.shared.metrics.deletes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.shared.state.write();
        let State { index, datalog } = &mut *state;
        index.delete(h, |sl| {
            if sl.key_size as usize != key.len() {
                return Ok(false);
            }
            if datalog.read_key(sl)? != key {
                return Ok(false);
            }
            datalog.del(key, sl)?;
            Ok(true)
        })?;

        if self.shared.sync_writes {
            state.sync()?;
        }
        Ok(())
    }

    /// Number of live keys.
    pub fn count(&self) -> u32 {
        self.shared.state.read().index.count()
    }

    /// Flush datalog and index files to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.shared.state.write().sync()
    }

    /// Iterate over every live key-value pair, each exactly once, in an
    /// unspecified order.
    pub fn items(&self) -> ItemIterator<'_> {
        ItemIterator::new(self)
    }

    /// Operation counters for this handle.
    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Total size in bytes of the files in the database directory.
    pub fn file_size(&self) -> Result<u64> {
        let mut size = 0;
        for entry in std::fs::read_dir(&self.shared.path)? {
            size += entry?.metadata()?.len();
        }
        Ok(size)
    }

    /// Close the database: stop the background worker, persist the meta
    /// files and release the directory lock.
    ///
    /// Fails with [`Error::Busy`] while a compaction is running.  Dropping
    /// the handle closes best-effort, ignoring errors.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.handle.join();
        }
        // The worker is gone; a still-set flag means a foreground compaction.
        if self.shared.compaction_running.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }

        let state = self.shared.state.write();
        let meta = DbMeta {
            hash_seed: self.shared.hash_seed,
        };
        crate::metafile::write_meta_file(
            &files::db_path(&self.shared.path, files::DB_META_NAME),
            &meta,
        )?;
        state.datalog.write_meta()?;
        state.index.write_meta()?;
        drop(state);

        if let Some(lock) = self.shared.lock.lock().take() {
            lock.unlock()?;
        }
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

fn run_worker(
    shared: Arc<Shared>,
    stop_rx: Receiver<()>,
    sync_interval: Option<Duration>,
    compaction_interval: Option<Duration>,
) {
    let sync_tick = sync_interval.map(tick).unwrap_or_else(never);
    let compaction_tick = compaction_interval.map(tick).unwrap_or_else(never);
    let mut last_writes = 0;
    loop {
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => return,
            recv(sync_tick) -> _ => {
                let writes = shared.metrics.puts() + shared.metrics.deletes();
                if writes != last_writes {
                    if let Err(err) = shared.state.write().sync() {
                        log::error!("background sync failed: {}", err);
                    } else {
                        last_writes = writes;
                    }
                }
            }
            recv(compaction_tick) -> _ => {
                match shared.compact() {
                    Ok(_) | Err(Error::Busy) => {}
                    Err(err) => log::error!("background compaction failed: {}", err),
                }
            }
        }
    }
}
