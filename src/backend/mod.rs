pub(crate) mod queue;

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::config::CacheConfig;
use crate::entry::handle::{EntryHandle, EntryShared};
use crate::error::Result;
use crate::flock::DirLock;
use crate::hasher::{EntryHash, KeyHasher};
use crate::Error;
use queue::{spawn_queue, Op, OpQueue};

const LOCK_FILE: &str = "cinder.lock";

struct Slot {
    queue: OpQueue,
    live: Option<Arc<EntryShared>>,
}

/// The owned-by-index arena: one slot per hash holding the live entry (if
/// any) and the hash's serialized operation queue. The queue outlives entry
/// incarnations, which is what orders a doom's file deletion strictly
/// before the next create's first write.
pub(crate) struct Registry {
    config: Arc<CacheConfig>,
    hasher: KeyHasher,
    next_incarnation: AtomicU64,
    slots: Mutex<HashMap<EntryHash, Slot>>,
}

impl Registry {
    fn slot_entry<'a>(&self, slots: &'a mut HashMap<EntryHash, Slot>, hash: EntryHash) -> &'a mut Slot {
        slots.entry(hash).or_insert_with(|| Slot {
            queue: spawn_queue(self.config.clone(), hash),
            live: None,
        })
    }

    /// Forgets the live entry for `hash` if it is still this incarnation.
    pub(crate) fn detach_live(&self, hash: EntryHash, incarnation: u64) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&hash) {
            if slot
                .live
                .as_ref()
                .map_or(false, |live| live.incarnation == incarnation)
            {
                slot.live = None;
            }
        }
    }

    /// Drops an idle slot. A slot with queued work is kept so a later
    /// create for the same hash reuses its queue and stays ordered behind
    /// the pending operations.
    pub(crate) fn maybe_gc(&self, hash: EntryHash) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(&hash) {
            if slot.live.is_none() && slot.queue.is_idle() {
                slots.remove(&hash);
            }
        }
    }
}

/// The cache storage backend: maps keys to entries, enforces one live
/// entry store per hash, and owns the cache directory (exclusively, via a
/// directory lock). An external index drives it through `create`, `open`,
/// and `doom` and reads entry counts back for its own eviction policy.
pub struct Backend {
    registry: Arc<Registry>,
    _lock: DirLock,
}

impl Backend {
    /// Opens (creating if needed) a cache directory and takes its lock.
    pub fn open_cache(config: CacheConfig) -> Result<Backend> {
        fs::create_dir_all(&config.dir)?;
        let lock = DirLock::lock(config.dir.join(LOCK_FILE))?;
        let config = Arc::new(config);
        tracing::debug!(dir = %config.dir.display(), "Opened cache backend");
        Ok(Backend {
            registry: Arc::new(Registry {
                config,
                hasher: KeyHasher::new(),
                next_incarnation: AtomicU64::new(1),
                slots: Mutex::new(HashMap::new()),
            }),
            _lock: lock,
        })
    }

    /// Creates a fresh entry for `key` and returns its handle immediately;
    /// the backing files materialize behind the entry's queue (optimistic
    /// completion). Fails synchronously if an entry is already open under
    /// this hash.
    pub fn create(&self, key: &[u8]) -> Result<EntryHandle> {
        let hash = self.registry.hasher.hash(key);
        let mut slots = self.registry.slots.lock().unwrap();
        let incarnation = self.registry.next_incarnation.fetch_add(1, Ordering::SeqCst);
        let slot = self.registry.slot_entry(&mut slots, hash);
        if slot.live.is_some() {
            return Err(Error::InvalidArgument("entry already open"));
        }

        let shared = Arc::new(EntryShared::new(
            key.to_vec(),
            hash,
            incarnation,
            self.registry.config.clone(),
        ));
        slot.live = Some(shared.clone());

        let (tx, _rx) = oneshot::channel();
        slot.queue.submit(Op::Create {
            shared: shared.clone(),
            reply: tx,
        });
        Ok(EntryHandle::new(
            shared,
            slot.queue.clone(),
            self.registry.clone(),
        ))
    }

    /// Opens the entry stored under `key`, validating its backing files.
    /// An entry already open is shared by reference count.
    pub async fn open(&self, key: &[u8]) -> Result<EntryHandle> {
        self.open_with_hint(key, false).await
    }

    /// `open` with the index's "already warm" hint, which is recorded for
    /// bookkeeping only and never affects correctness.
    pub async fn open_with_hint(&self, key: &[u8], had_index_hint: bool) -> Result<EntryHandle> {
        let hash = self.registry.hasher.hash(key);
        let (handle, rx) = {
            let mut slots = self.registry.slots.lock().unwrap();
            let incarnation = self.registry.next_incarnation.fetch_add(1, Ordering::SeqCst);
            let slot = self.registry.slot_entry(&mut slots, hash);

            if let Some(live) = &slot.live {
                if live.key != key {
                    // Hash collision with an open entry; nothing is stored
                    // under the requested key.
                    return Err(Error::NotFound);
                }
                return Ok(EntryHandle::attach(
                    live.clone(),
                    slot.queue.clone(),
                    self.registry.clone(),
                ));
            }

            let shared = Arc::new(EntryShared::new(
                key.to_vec(),
                hash,
                incarnation,
                self.registry.config.clone(),
            ));
            slot.live = Some(shared.clone());

            let (tx, rx) = oneshot::channel();
            slot.queue.submit(Op::Open {
                shared: shared.clone(),
                had_index_hint,
                reply: tx,
            });
            (
                EntryHandle::new(shared, slot.queue.clone(), self.registry.clone()),
                rx,
            )
        };

        match rx.await {
            Ok(Ok(())) => Ok(handle),
            // Dropping the handle detaches the failed incarnation and its
            // queued close is a no-op.
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Opens `key`, creating it if absent.
    pub async fn open_or_create(&self, key: &[u8]) -> Result<EntryHandle> {
        match self.open(key).await {
            Err(Error::NotFound) => self.create(key),
            other => other,
        }
    }

    /// Removes the entry for `key` from the index synchronously — a
    /// subsequent open or create will not see it — and enqueues the file
    /// deletion on the hash's queue, strictly ahead of any later create
    /// for the same key. Outstanding handles keep working until closed.
    pub fn doom(&self, key: &[u8]) -> impl std::future::Future<Output = Result<()>> {
        let hash = self.registry.hasher.hash(key);
        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.registry.slots.lock().unwrap();
            let slot = self.registry.slot_entry(&mut slots, hash);
            match slot.live.take() {
                Some(live) if live.key == key => {
                    live.doomed.store(true, Ordering::SeqCst);
                    slot.queue.submit(Op::Doom {
                        shared: live,
                        reply: tx,
                    });
                }
                Some(live) => {
                    // A different key occupies this hash; nothing is stored
                    // under the requested one.
                    slot.live = Some(live);
                    let _ = tx.send(Ok(()));
                }
                None => {
                    slot.queue.submit(Op::DoomAbsent { reply: tx });
                }
            }
        }
        async move {
            match rx.await {
                Ok(res) => res,
                Err(_) => Err(Error::Cancelled),
            }
        }
    }

    /// Number of entries currently open.
    pub fn entry_count(&self) -> usize {
        self.registry
            .slots
            .lock()
            .unwrap()
            .values()
            .filter(|slot| slot.live.is_some())
            .count()
    }

    /// Number of entries persisted in the cache directory, counted from
    /// the primary files alone.
    pub fn scan_entry_count(&self) -> Result<usize> {
        let mut count = 0;
        for dirent in fs::read_dir(&self.registry.config.dir)? {
            let dirent = dirent?;
            if dirent
                .file_name()
                .to_str()
                .map_or(false, |name| name.len() == 18 && name.ends_with("_0"))
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Approximate bytes held by the cache directory: the sum of all
    /// backing file sizes, excluding the lock file. In-flight writes are
    /// not counted until they reach disk.
    pub fn total_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for dirent in fs::read_dir(&self.registry.config.dir)? {
            let dirent = dirent?;
            if dirent.file_name().to_str() == Some(LOCK_FILE) {
                continue;
            }
            total += dirent.metadata()?.len();
        }
        Ok(total)
    }

    /// Resolves once every operation submitted so far has run.
    pub async fn flush(&self) -> Result<()> {
        let receivers: Vec<_> = {
            let slots = self.registry.slots.lock().unwrap();
            slots
                .values()
                .map(|slot| {
                    let (tx, rx) = oneshot::channel();
                    slot.queue.submit(Op::Flush { reply: tx });
                    rx
                })
                .collect()
        };
        for rx in receivers {
            let _ = rx.await;
        }
        Ok(())
    }

    /// Drains every queue and releases the directory. Entries whose
    /// handles are still open are left to their handles and logged.
    pub async fn shutdown(self) -> Result<()> {
        let drained: Vec<(EntryHash, Slot)> = {
            let mut slots = self.registry.slots.lock().unwrap();
            slots.drain().collect()
        };

        let mut receivers = Vec::new();
        for (hash, mut slot) in drained {
            if let Some(live) = slot.live.take() {
                if live.handles.load(Ordering::SeqCst) > 0 {
                    tracing::warn!(
                        hash = %format_args!("{:016x}", hash),
                        "Entry handles still open at shutdown"
                    );
                } else {
                    slot.queue.submit(Op::Close { shared: live });
                }
            }
            let (tx, rx) = oneshot::channel();
            slot.queue.submit(Op::Flush { reply: tx });
            receivers.push(rx);
        }
        for rx in receivers {
            let _ = rx.await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("dir", &self.registry.config.dir)
            .field("open_entries", &self.entry_count())
            .finish()
    }
}
