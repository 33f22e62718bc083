use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::backend::queue::{Op, OpQueue};
use crate::backend::Registry;
use crate::config::CacheConfig;
use crate::entry::{EntryMetadata, STREAM_COUNT};
use crate::error::Result;
use crate::hasher::EntryHash;
use crate::Error;

/// State shared between every handle of one entry incarnation and the
/// worker that executes its operations.
pub(crate) struct EntryShared {
    pub(crate) key: Vec<u8>,
    pub(crate) hash: EntryHash,
    pub(crate) incarnation: u64,
    pub(crate) config: Arc<CacheConfig>,
    pub(crate) handles: AtomicUsize,
    pub(crate) doomed: AtomicBool,
    pub(crate) state: Mutex<SharedState>,
    sparse_busy: AtomicBool,
    sparse_generation: AtomicU64,
    sparse_blocked: AtomicBool,
}

pub(crate) struct SharedState {
    /// Logical stream sizes as the caller observes them: updated when an
    /// operation logically completes, which for writes is at submission
    /// (the optimistic fast path), not when the disk catches up.
    pub sizes: [u64; STREAM_COUNT],
    /// A detected checksum mismatch pins the stream: every further read
    /// fails the same way until the entry is doomed.
    pub stream_error: [Option<Error>; STREAM_COUNT],
    /// A background failure from an optimistically completed operation;
    /// surfaces on the next operation instead of vanishing.
    pub fatal: Option<Error>,
    pub meta: EntryMetadata,
}

impl EntryShared {
    pub(crate) fn new(
        key: Vec<u8>,
        hash: EntryHash,
        incarnation: u64,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            key,
            hash,
            incarnation,
            config,
            handles: AtomicUsize::new(1),
            doomed: AtomicBool::new(false),
            state: Mutex::new(SharedState {
                sizes: [0; STREAM_COUNT],
                stream_error: [None, None, None],
                fatal: None,
                meta: EntryMetadata::now(),
            }),
            sparse_busy: AtomicBool::new(false),
            sparse_generation: AtomicU64::new(0),
            sparse_blocked: AtomicBool::new(false),
        }
    }

    pub(crate) fn sparse_generation(&self) -> u64 {
        self.sparse_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_sparse_block(&self) {
        self.sparse_blocked.store(false, Ordering::SeqCst);
    }
}

/// Clears the single-flight sparse marker when the operation settles,
/// whichever way it ends.
struct SparseGuard(Arc<EntryShared>);

impl Drop for SparseGuard {
    fn drop(&mut self) {
        self.0.sparse_busy.store(false, Ordering::SeqCst);
    }
}

/// Client-facing handle to one cache entry. Handles sharing an entry hold
/// the same underlying state by reference count; all operations funnel
/// through the entry's serialized queue, so no operation ever observes a
/// state inconsistent with submission order.
pub struct EntryHandle {
    shared: Arc<EntryShared>,
    queue: OpQueue,
    registry: Arc<Registry>,
}

impl EntryHandle {
    pub(crate) fn new(shared: Arc<EntryShared>, queue: OpQueue, registry: Arc<Registry>) -> Self {
        Self {
            shared,
            queue,
            registry,
        }
    }

    /// A further handle sharing an already-live incarnation.
    pub(crate) fn attach(
        shared: Arc<EntryShared>,
        queue: OpQueue,
        registry: Arc<Registry>,
    ) -> Self {
        shared.handles.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            queue,
            registry,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.shared.key
    }

    pub fn hash(&self) -> EntryHash {
        self.shared.hash
    }

    pub fn is_doomed(&self) -> bool {
        self.shared.doomed.load(Ordering::SeqCst)
    }

    fn check_stream(stream: usize) -> Result<()> {
        if stream >= STREAM_COUNT {
            return Err(Error::InvalidArgument("stream index out of range"));
        }
        Ok(())
    }

    /// Current logical size of a stream: the highest offset + length any
    /// write or truncate has established, including writes still in flight
    /// behind the optimistic fast path.
    pub fn get_size(&self, stream: usize) -> Result<u64> {
        Self::check_stream(stream)?;
        Ok(self.shared.state.lock().unwrap().sizes[stream])
    }

    /// Reads up to `len` bytes of a stream. Reads at or beyond the current
    /// size return no bytes; a stream with a detected checksum mismatch
    /// fails the same way on every attempt until the entry is doomed.
    pub async fn read(&self, stream: usize, offset: u64, len: usize) -> Result<Bytes> {
        Self::check_stream(stream)?;
        {
            let state = self.shared.state.lock().unwrap();
            if let Some(e) = &state.fatal {
                return Err(e.duplicate());
            }
            if let Some(e) = &state.stream_error[stream] {
                return Err(e.duplicate());
            }
        }
        let (tx, rx) = oneshot::channel();
        self.queue.submit(Op::Read {
            shared: self.shared.clone(),
            stream,
            offset,
            len,
            reply: tx,
        });
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Writes `data` at `offset`. With `truncate` the stream size becomes
    /// exactly `offset + data.len()`; without it the size only grows. When
    /// the entry's queue is idle the call completes optimistically: it
    /// returns at once while the physical write runs behind the queue, and
    /// a background failure surfaces on the next operation.
    pub async fn write(
        &self,
        stream: usize,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<usize> {
        Self::check_stream(stream)?;
        let len = data.len();
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::InvalidArgument("offset overflow"))?;
        if stream == 0 && end > self.shared.config.max_stream0_size {
            return Err(Error::InvalidArgument("stream 0 too large"));
        }

        let (tx, rx) = oneshot::channel();
        let optimistic;
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(e) = &state.fatal {
                return Err(e.duplicate());
            }
            state.sizes[stream] = if truncate {
                end
            } else {
                state.sizes[stream].max(end)
            };
            state.meta.touch_modified();
            optimistic = self.queue.is_idle();
            self.queue.submit(Op::Write {
                shared: self.shared.clone(),
                stream,
                offset,
                data,
                truncate,
                reply: tx,
            });
        }

        if optimistic {
            return Ok(len);
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Entry timestamps, updated as a side effect of reads and writes.
    pub async fn metadata(&self) -> Result<EntryMetadata> {
        let (tx, rx) = oneshot::channel();
        self.queue.submit(Op::Metadata {
            shared: self.shared.clone(),
            reply: tx,
        });
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Removes the entry from the index synchronously: a subsequent open or
    /// create for the same key will not see it. Physical deletion runs on
    /// the entry's queue, strictly before any later create for the same
    /// key. Existing handles keep operating until they close.
    pub fn doom(&self) -> impl std::future::Future<Output = Result<()>> {
        let (tx, rx) = oneshot::channel();
        if !self.shared.doomed.swap(true, Ordering::SeqCst) {
            self.registry
                .detach_live(self.shared.hash, self.shared.incarnation);
            self.queue.submit(Op::Doom {
                shared: self.shared.clone(),
                reply: tx,
            });
        } else {
            let _ = tx.send(Ok(()));
        }
        async move {
            match rx.await {
                Ok(res) => res,
                Err(_) => Err(Error::Cancelled),
            }
        }
    }

    /// Releases this handle's share of the entry. Physical resources are
    /// freed once the last handle is gone and the queue drains. Dropping
    /// the handle has the same effect.
    pub fn close(self) {}

    fn begin_sparse(&self) -> Result<SparseGuard> {
        if self.shared.sparse_blocked.load(Ordering::SeqCst) {
            return Err(Error::OperationNotSupported);
        }
        if self.shared.sparse_busy.swap(true, Ordering::SeqCst) {
            return Err(Error::OperationNotSupported);
        }
        Ok(SparseGuard(self.shared.clone()))
    }

    /// Reads populated sparse bytes starting at `offset`, stopping at the
    /// first gap. Only one sparse operation may be in flight per entry.
    pub async fn read_sparse(&self, offset: u64, len: usize) -> Result<Bytes> {
        offset
            .checked_add(len as u64)
            .ok_or(Error::InvalidArgument("offset overflow"))?;
        let _guard = self.begin_sparse()?;
        let (tx, rx) = oneshot::channel();
        self.queue.submit(Op::ReadSparse {
            shared: self.shared.clone(),
            offset,
            len,
            generation: self.shared.sparse_generation(),
            reply: tx,
        });
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Writes into the sparse address space, split across fixed-size child
    /// blocks. Only one sparse operation may be in flight per entry.
    pub async fn write_sparse(&self, offset: u64, data: Bytes) -> Result<usize> {
        offset
            .checked_add(data.len() as u64)
            .ok_or(Error::InvalidArgument("offset overflow"))?;
        let _guard = self.begin_sparse()?;
        let (tx, rx) = oneshot::channel();
        self.queue.submit(Op::WriteSparse {
            shared: self.shared.clone(),
            offset,
            data,
            generation: self.shared.sparse_generation(),
            reply: tx,
        });
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Longest contiguous populated run beginning at the first populated
    /// byte at or after `offset`, bounded by `len`: returns
    /// `(available_length, run_start)`.
    pub async fn get_available_range(&self, offset: u64, len: u64) -> Result<(u64, u64)> {
        offset
            .checked_add(len)
            .ok_or(Error::InvalidArgument("offset overflow"))?;
        let _guard = self.begin_sparse()?;
        let (tx, rx) = oneshot::channel();
        self.queue.submit(Op::AvailableRange {
            shared: self.shared.clone(),
            offset,
            len,
            generation: self.shared.sparse_generation(),
            reply: tx,
        });
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Discards sparse operations not yet dispatched to the worker; work
    /// already running completes normally. Until `ready_for_sparse_io`
    /// resolves, new sparse calls fail with `OperationNotSupported`.
    pub fn cancel_sparse_io(&self) {
        self.shared.sparse_generation.fetch_add(1, Ordering::SeqCst);
        self.shared.sparse_blocked.store(true, Ordering::SeqCst);
    }

    /// Resolves once every sparse operation queued before the cancellation
    /// has drained; sparse I/O is accepted again afterwards.
    pub async fn ready_for_sparse_io(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue.submit(Op::SparseBarrier {
            shared: self.shared.clone(),
            reply: tx,
        });
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.queue.submit(Op::Close {
                shared: self.shared.clone(),
            });
            self.registry
                .detach_live(self.shared.hash, self.shared.incarnation);
            self.registry.maybe_gc(self.shared.hash);
        }
    }
}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("hash", &format_args!("{:016x}", self.shared.hash))
            .field("doomed", &self.is_doomed())
            .finish()
    }
}
