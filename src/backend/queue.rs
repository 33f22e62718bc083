use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::CacheConfig;
use crate::entry::handle::EntryShared;
use crate::entry::sparse::SparseIndex;
use crate::entry::store::{doom_files, EntryStore};
use crate::entry::EntryMetadata;
use crate::error::Result;
use crate::hasher::EntryHash;
use crate::Error;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// One operation against an entry. Ops carry the incarnation's shared state
/// so the worker can record sizes, poisoning, and background failures.
pub(crate) enum Op {
    Create {
        shared: Arc<EntryShared>,
        reply: Reply<()>,
    },
    Open {
        shared: Arc<EntryShared>,
        had_index_hint: bool,
        reply: Reply<()>,
    },
    Read {
        shared: Arc<EntryShared>,
        stream: usize,
        offset: u64,
        len: usize,
        reply: Reply<Bytes>,
    },
    Write {
        shared: Arc<EntryShared>,
        stream: usize,
        offset: u64,
        data: Bytes,
        truncate: bool,
        reply: Reply<usize>,
    },
    ReadSparse {
        shared: Arc<EntryShared>,
        offset: u64,
        len: usize,
        generation: u64,
        reply: Reply<Bytes>,
    },
    WriteSparse {
        shared: Arc<EntryShared>,
        offset: u64,
        data: Bytes,
        generation: u64,
        reply: Reply<usize>,
    },
    AvailableRange {
        shared: Arc<EntryShared>,
        offset: u64,
        len: u64,
        generation: u64,
        reply: Reply<(u64, u64)>,
    },
    /// Drains behind every previously queued sparse operation, then lifts
    /// the post-cancellation block.
    SparseBarrier {
        shared: Arc<EntryShared>,
        reply: Reply<()>,
    },
    Metadata {
        shared: Arc<EntryShared>,
        reply: Reply<EntryMetadata>,
    },
    Doom {
        shared: Arc<EntryShared>,
        reply: Reply<()>,
    },
    /// Doom for an entry that is not open: unlink by hash alone.
    DoomAbsent { reply: Reply<()> },
    /// Last handle released: write trailers and drop the descriptors.
    Close { shared: Arc<EntryShared> },
    /// Completes once every previously queued op has run.
    Flush { reply: Reply<()> },
}

/// Submission side of a per-hash queue. All operations against one hash are
/// serialized through it, in submission order; the queue is the only
/// synchronization barrier an entry has.
#[derive(Clone)]
pub(crate) struct OpQueue {
    tx: mpsc::UnboundedSender<Op>,
    pending: Arc<AtomicUsize>,
}

impl OpQueue {
    pub fn submit(&self, op: Op) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(op).is_err() {
            // Worker already gone (shutdown); the dropped reply sender
            // surfaces as a cancellation to the caller.
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True when no submitted operation is still queued or running; the
    /// precondition for the optimistic fast path.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

/// Spawns the worker task for one hash. The task drains the channel in
/// submission order, running each batch's physical I/O on the blocking
/// pool, and exits when every sender is gone and the queue is drained.
pub(crate) fn spawn_queue(config: Arc<CacheConfig>, hash: EntryHash) -> OpQueue {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let queue = OpQueue {
        tx,
        pending: pending.clone(),
    };
    tokio::spawn(run_queue(config, hash, rx, pending));
    queue
}

const MAX_BATCH: usize = 16;

struct EntryIo {
    store: EntryStore,
    sparse: SparseIndex,
}

struct Worker {
    config: Arc<CacheConfig>,
    hash: EntryHash,
    /// Incarnation id -> open engine state. A doomed incarnation and its
    /// successor can be live at once; ops carry the incarnation they
    /// target.
    entries: HashMap<u64, EntryIo>,
}

async fn run_queue(
    config: Arc<CacheConfig>,
    hash: EntryHash,
    mut rx: mpsc::UnboundedReceiver<Op>,
    pending: Arc<AtomicUsize>,
) {
    let mut entries = HashMap::new();
    while let Some(op) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH);
        batch.push(op);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(op) => batch.push(op),
                Err(_) => break,
            }
        }

        let mut worker = Worker {
            config: config.clone(),
            hash,
            entries,
        };
        let counter = pending.clone();
        let joined = tokio::task::spawn_blocking(move || {
            for op in batch {
                execute(&mut worker, op);
                counter.fetch_sub(1, Ordering::SeqCst);
            }
            worker
        })
        .await;

        match joined {
            Ok(worker) => entries = worker.entries,
            Err(e) => {
                tracing::error!(
                    hash = %format_args!("{:016x}", hash),
                    error = %e,
                    "Entry worker batch failed"
                );
                return;
            }
        }
    }
}

impl Worker {
    /// The engine state for the op's incarnation, or the failure recorded
    /// for it (a create that failed in the background poisons everything
    /// queued behind it).
    fn entry(&mut self, shared: &EntryShared) -> Result<&mut EntryIo> {
        match self.entries.get_mut(&shared.incarnation) {
            Some(io) => Ok(io),
            None => {
                let state = shared.state.lock().unwrap();
                Err(match &state.fatal {
                    Some(e) => e.duplicate(),
                    None => Error::Cancelled,
                })
            }
        }
    }
}

fn sync_meta(shared: &EntryShared, store: &EntryStore) {
    shared.state.lock().unwrap().meta = store.metadata();
}

fn execute(worker: &mut Worker, op: Op) {
    match op {
        Op::Create { shared, reply } => {
            match EntryStore::create(worker.config.clone(), &shared.key, worker.hash) {
                Ok(store) => {
                    let sparse = SparseIndex::new(worker.config.clone(), worker.hash);
                    worker.entries.insert(shared.incarnation, EntryIo { store, sparse });
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    tracing::error!(
                        hash = %format_args!("{:016x}", worker.hash),
                        error = %e,
                        "Entry create failed"
                    );
                    shared.state.lock().unwrap().fatal = Some(e.duplicate());
                    let _ = reply.send(Err(e));
                }
            }
        }

        Op::Open {
            shared,
            had_index_hint,
            reply,
        } => {
            match EntryStore::open(worker.config.clone(), &shared.key, worker.hash, had_index_hint)
            {
                Ok((store, poison)) => {
                    {
                        let mut state = shared.state.lock().unwrap();
                        state.sizes = store.sizes();
                        state.stream_error = poison;
                        state.meta = store.metadata();
                    }
                    let sparse = SparseIndex::new(worker.config.clone(), worker.hash);
                    worker.entries.insert(shared.incarnation, EntryIo { store, sparse });
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }

        Op::Read {
            shared,
            stream,
            offset,
            len,
            reply,
        } => {
            let res = match worker.entry(&shared) {
                Ok(io) => match io.store.read(stream, offset, len) {
                    Ok(data) => {
                        sync_meta(&shared, &io.store);
                        Ok(Bytes::from(data))
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            let _ = reply.send(res);
        }

        Op::Write {
            shared,
            stream,
            offset,
            data,
            truncate,
            reply,
        } => {
            let res = match worker.entry(&shared) {
                Ok(io) => match io.store.write(stream, offset, &data, truncate) {
                    Ok(n) => {
                        sync_meta(&shared, &io.store);
                        Ok(n)
                    }
                    Err(e) => {
                        // The caller may already hold an optimistic success
                        // for this write; the failure must surface on the
                        // next operation instead of vanishing.
                        tracing::error!(
                            hash = %format_args!("{:016x}", worker.hash),
                            stream,
                            error = %e,
                            "Write failed; entry poisoned"
                        );
                        shared.state.lock().unwrap().fatal = Some(e.duplicate());
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            let _ = reply.send(res);
        }

        Op::ReadSparse {
            shared,
            offset,
            len,
            generation,
            reply,
        } => {
            if shared.sparse_generation() != generation {
                let _ = reply.send(Err(Error::Cancelled));
                return;
            }
            let res = match worker.entry(&shared) {
                Ok(io) => io.sparse.read(offset, len).map(Bytes::from),
                Err(e) => Err(e),
            };
            if res.is_ok() {
                shared.state.lock().unwrap().meta.touch_used();
            }
            let _ = reply.send(res);
        }

        Op::WriteSparse {
            shared,
            offset,
            data,
            generation,
            reply,
        } => {
            if shared.sparse_generation() != generation {
                let _ = reply.send(Err(Error::Cancelled));
                return;
            }
            let res = match worker.entry(&shared) {
                Ok(io) => io.sparse.write(offset, &data).and_then(|n| {
                    if !io.store.is_doomed() {
                        io.store.set_has_sparse()?;
                    }
                    Ok(n)
                }),
                Err(e) => Err(e),
            };
            if res.is_ok() {
                shared.state.lock().unwrap().meta.touch_modified();
            }
            let _ = reply.send(res);
        }

        Op::AvailableRange {
            shared,
            offset,
            len,
            generation,
            reply,
        } => {
            if shared.sparse_generation() != generation {
                let _ = reply.send(Err(Error::Cancelled));
                return;
            }
            let res = match worker.entry(&shared) {
                Ok(io) => io.sparse.available_range(offset, len),
                Err(e) => Err(e),
            };
            let _ = reply.send(res);
        }

        Op::SparseBarrier { shared, reply } => {
            shared.clear_sparse_block();
            let _ = reply.send(Ok(()));
        }

        Op::Metadata { shared, reply } => {
            let meta = match worker.entries.get(&shared.incarnation) {
                Some(io) => io.store.metadata(),
                None => shared.state.lock().unwrap().meta,
            };
            let _ = reply.send(Ok(meta));
        }

        Op::Doom { shared, reply } => {
            let res = match worker.entries.get_mut(&shared.incarnation) {
                Some(io) => {
                    io.sparse.set_doomed();
                    io.store.doom()
                }
                // Create failed or never ran; remove whatever is on disk.
                None => doom_files(&worker.config.dir, worker.hash),
            };
            let _ = reply.send(res);
        }

        Op::DoomAbsent { reply } => {
            let _ = reply.send(doom_files(&worker.config.dir, worker.hash));
        }

        Op::Close { shared } => {
            if let Some(EntryIo { store, mut sparse }) = worker.entries.remove(&shared.incarnation)
            {
                if store.is_doomed() {
                    // Files are already unlinked; dropping the descriptors
                    // frees them.
                    sparse.discard_all();
                } else {
                    if let Err(e) = sparse.close_all() {
                        tracing::error!(
                            hash = %format_args!("{:016x}", worker.hash),
                            error = %e,
                            "Failed to close sparse children"
                        );
                    }
                    if let Err(e) = store.close() {
                        tracing::error!(
                            hash = %format_args!("{:016x}", worker.hash),
                            error = %e,
                            "Failed to close entry"
                        );
                    }
                }
            }
        }

        Op::Flush { reply } => {
            let _ = reply.send(Ok(()));
        }
    }
}
