//! The value store: write/read paths, the flusher, and lifecycle control.

use crate::block::{BlockId, BlockRegistry, ValueBlock};
use crate::bulk_set::BulkSetState;
use crate::bulk_set_ack::BulkSetAckState;
use crate::compaction::compaction_pass;
use crate::config::Config;
use crate::file::toc::{discover_pairs, read_records, trusted_values_payload};
use crate::file::writer::FilePairWriter;
use crate::file::{TailState, ValuesFile};
use crate::locmap::LocMap;
use crate::locmap::ValueLocMap;
use crate::mem::{MemBlock, TocEntry};
use crate::pull_replication::{out_pull_replication_pass, PullReplicationState};
use crate::push_replication::out_push_replication_pass;
use crate::ring::MsgRing;
use crate::scheduler::BackgroundLoop;
use crate::timestamp::{self, DELETION, LOCAL_REMOVAL};
use crate::tombstone_discard::tombstone_discard_pass;
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) enum FlushTask {
    Page(Arc<MemBlock>),
    Barrier(Sender<()>),
    Shutdown(Sender<()>),
}

struct Loops {
    tombstone_discard: BackgroundLoop,
    compaction: BackgroundLoop,
    out_pull_replication: BackgroundLoop,
    out_push_replication: BackgroundLoop,
    workers: Vec<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

/// A disk-resident, replicated value store
#[derive(Clone)]
pub struct ValueStore(pub(crate) Arc<StoreInner>);

impl std::ops::Deref for ValueStore {
    type Target = StoreInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Shared core handle; background work holds this through a weak reference
pub struct StoreInner {
    pub(crate) config: Config,
    pub(crate) loc_map: Arc<dyn LocMap>,
    pub(crate) ring: Option<Arc<dyn MsgRing>>,
    pub(crate) blocks: BlockRegistry,
    pub(crate) files: RwLock<Vec<Arc<ValuesFile>>>,

    active: Mutex<Arc<MemBlock>>,
    free_pages_tx: Sender<Arc<MemBlock>>,
    free_pages_rx: Receiver<Arc<MemBlock>>,
    flush_tx: Sender<FlushTask>,

    pub(crate) bulk_set: Option<BulkSetState>,
    pub(crate) bulk_set_ack: Option<BulkSetAckState>,
    pub(crate) pull_replication: Option<PullReplicationState>,

    writes_enabled: AtomicBool,
    closed: AtomicBool,
    loops: Mutex<Option<Loops>>,
}

impl ValueStore {
    /// Creates or recovers a store with the default location map and no
    /// ring (single-node operation: replication subsystems stay inert).
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, None, None)
    }

    /// Creates or recovers a store wired to a ring transport
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open_with_ring(config: Config, ring: Arc<dyn MsgRing>) -> Result<Self> {
        Self::open_with(config, None, Some(ring))
    }

    /// Creates or recovers a store, optionally overriding the location map
    /// and supplying a ring transport
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn open_with(
        config: Config,
        loc_map: Option<Arc<dyn LocMap>>,
        ring: Option<Arc<dyn MsgRing>>,
    ) -> Result<Self> {
        let config = config.resolve();
        std::fs::create_dir_all(&config.path)?;
        std::fs::create_dir_all(toc_dir(&config))?;
        log::info!("opening value store at {}", config.path.display());

        let loc_map = loc_map.unwrap_or_else(|| Arc::new(ValueLocMap::new()));
        let blocks = BlockRegistry::new();
        let files = RwLock::new(Vec::new());

        // Pages first: they take the low block IDs
        let page_count = config.workers * config.write_pages_per_worker;
        let (free_pages_tx, free_pages_rx) = bounded(page_count);
        for _ in 0..page_count {
            let id = blocks.reserve();
            let page = Arc::new(MemBlock::new(id, config.page_size));
            blocks.install(id, page.clone());
            free_pages_tx.send(page).expect("page pool cannot be full");
        }
        let active = free_pages_rx.recv().expect("page pool filled above");

        recover(&config, &blocks, &files, loc_map.as_ref())?;
        let pair = create_pair_raw(&config, &blocks, &files)?;

        let (flush_tx, flush_rx) = bounded(page_count);
        let (bulk_set, bulk_set_ack, pull_replication) = if ring.is_some() {
            (
                Some(BulkSetState::new(&config)),
                Some(BulkSetAckState::new(&config)),
                Some(PullReplicationState::new(&config)),
            )
        } else {
            (None, None, None)
        };

        let store = Self(Arc::new(StoreInner {
            config,
            loc_map,
            ring,
            blocks,
            files,
            active: Mutex::new(active),
            free_pages_tx,
            free_pages_rx,
            flush_tx,
            bulk_set,
            bulk_set_ack,
            pull_replication,
            writes_enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            loops: Mutex::new(None),
        }));

        let flusher = {
            let weak = Arc::downgrade(&store.0);
            std::thread::Builder::new()
                .name("flusher".to_string())
                .spawn(move || flusher_loop(&weak, &flush_rx, pair))
                .expect("failed to spawn flusher")
        };

        let mut workers = Vec::new();
        workers.extend(store.spawn_bulk_set_workers());
        workers.extend(store.spawn_bulk_set_ack_workers());
        workers.extend(store.spawn_pull_replication_workers());

        let loops = Loops {
            tombstone_discard: store.spawn_loop(
                "tombstone-discard",
                store.config.tombstone_discard_interval,
                tombstone_discard_pass,
            ),
            compaction: store.spawn_loop(
                "compaction",
                store.config.compaction_interval,
                compaction_pass,
            ),
            out_pull_replication: store.spawn_loop(
                "out-pull-replication",
                store.config.out_pull_replication_interval,
                out_pull_replication_pass,
            ),
            out_push_replication: store.spawn_loop(
                "out-push-replication",
                store.config.out_push_replication_interval,
                out_push_replication_pass,
            ),
            workers,
            flusher: Some(flusher),
        };
        *store.loops.lock().expect("lock is poisoned") = Some(loops);

        Ok(store)
    }

    fn spawn_loop(
        &self,
        name: &'static str,
        interval_secs: u32,
        pass: fn(&Arc<StoreInner>, &std::sync::atomic::AtomicU32),
    ) -> BackgroundLoop {
        let weak = Arc::downgrade(&self.0);
        BackgroundLoop::start(
            name,
            Duration::from_secs(u64::from(interval_secs)),
            Box::new(move |abort| {
                if let Some(inner) = weak.upgrade() {
                    pass(&inner, abort);
                }
            }),
        )
    }

    /// Writes a value at `timestamp_micro` microseconds; returns the prior
    /// timestamp in microseconds (0 = the key was new). Older timestamps are
    /// no-ops.
    ///
    /// # Errors
    ///
    /// `ErrDisabled` while writes are disabled; `ErrValueTooLarge` past
    /// `value_cap`; otherwise IO errors.
    pub fn write(&self, key_a: u64, key_b: u64, timestamp_micro: u64, value: &[u8]) -> Result<u64> {
        if !self.writes_enabled.load(Ordering::SeqCst) {
            return Err(Error::Disabled);
        }
        let old = self.write_raw(key_a, key_b, timestamp::from_micros(timestamp_micro), value)?;
        Ok(timestamp::to_micros(old))
    }

    /// Records a deletion at `timestamp_micro`; shadows any write with an
    /// older timestamp and returns the prior timestamp in microseconds
    ///
    /// # Errors
    ///
    /// Same contract as [`ValueStore::write`].
    pub fn delete(&self, key_a: u64, key_b: u64, timestamp_micro: u64) -> Result<u64> {
        if !self.writes_enabled.load(Ordering::SeqCst) {
            return Err(Error::Disabled);
        }
        let tsb = timestamp::from_micros(timestamp_micro) | DELETION;
        let old = self.write_raw(key_a, key_b, tsb, &[])?;
        Ok(timestamp::to_micros(old))
    }

    /// Appends the value for the key to `value` and returns its timestamp in
    /// microseconds
    ///
    /// # Errors
    ///
    /// `ErrNotFound` when no live entry exists (its `timestamp_bits`
    /// distinguishes "never existed" from "deleted"); `ErrCorrupt` when the
    /// stored bytes fail verification.
    pub fn read(&self, key_a: u64, key_b: u64, value: &mut Vec<u8>) -> Result<u64> {
        let tsb = self.read_raw(key_a, key_b, value)?;
        Ok(timestamp::to_micros(tsb))
    }

    /// Returns (timestamp micros, value length) without reading the value
    ///
    /// # Errors
    ///
    /// `ErrNotFound` when no live entry exists.
    pub fn lookup(&self, key_a: u64, key_b: u64) -> Result<(u64, u32)> {
        let (tsb, _block_id, _offset, length) = self.loc_map.get(key_a, key_b);
        if tsb == 0 || tsb & (DELETION | LOCAL_REMOVAL) != 0 {
            return Err(Error::NotFound {
                timestamp_bits: tsb,
            });
        }
        Ok((timestamp::to_micros(tsb), length))
    }

    /// Hands the active page to the flusher and blocks until everything
    /// queued before it is on disk
    ///
    /// # Errors
    ///
    /// Will return `Err` if the store is closed.
    pub fn flush(&self) -> Result<()> {
        self.flush_store()
    }

    /// Enables writes and every background subsystem
    pub fn enable_all(&self) {
        self.enable_writes();
        self.with_loops(|l| {
            l.tombstone_discard.enable();
            l.compaction.enable();
            l.out_pull_replication.enable();
            l.out_push_replication.enable();
        });
    }

    /// Disables writes and every background subsystem, aborting in-flight
    /// passes
    pub fn disable_all(&self) {
        self.disable_writes();
        self.with_loops(|l| {
            l.tombstone_discard.disable();
            l.compaction.disable();
            l.out_pull_replication.disable();
            l.out_push_replication.disable();
        });
    }

    /// Allows public writes and deletes
    pub fn enable_writes(&self) {
        self.writes_enabled.store(true, Ordering::SeqCst);
    }

    /// Rejects public writes and deletes with `ErrDisabled`; internal
    /// rewrites (inbound replication, compaction) are unaffected
    pub fn disable_writes(&self) {
        self.writes_enabled.store(false, Ordering::SeqCst);
    }

    /// Resumes scheduled tombstone discard passes
    pub fn enable_tombstone_discard(&self) {
        self.with_loops(|l| l.tombstone_discard.enable());
    }

    /// Stops scheduled tombstone discard passes
    pub fn disable_tombstone_discard(&self) {
        self.with_loops(|l| l.tombstone_discard.disable());
    }

    /// Runs one tombstone discard pass now, aborting any in-flight pass
    /// first; returns when the pass completes
    pub fn tombstone_discard_pass(&self) {
        self.with_loops(|l| l.tombstone_discard.run_now());
    }

    /// Resumes scheduled compaction passes
    pub fn enable_compaction(&self) {
        self.with_loops(|l| l.compaction.enable());
    }

    /// Stops scheduled compaction passes
    pub fn disable_compaction(&self) {
        self.with_loops(|l| l.compaction.disable());
    }

    /// Runs one compaction pass now, aborting any in-flight pass first;
    /// returns when the pass completes
    pub fn compaction_pass(&self) {
        self.with_loops(|l| l.compaction.run_now());
    }

    /// Resumes scheduled outgoing pull replication passes
    pub fn enable_out_pull_replication(&self) {
        self.with_loops(|l| l.out_pull_replication.enable());
    }

    /// Stops scheduled outgoing pull replication passes
    pub fn disable_out_pull_replication(&self) {
        self.with_loops(|l| l.out_pull_replication.disable());
    }

    /// Runs one outgoing pull replication pass now. The requests go out
    /// before this returns; the responses arrive whenever peers answer.
    pub fn out_pull_replication_pass(&self) {
        self.with_loops(|l| l.out_pull_replication.run_now());
    }

    /// Resumes scheduled outgoing push replication passes
    pub fn enable_out_push_replication(&self) {
        self.with_loops(|l| l.out_push_replication.enable());
    }

    /// Stops scheduled outgoing push replication passes
    pub fn disable_out_push_replication(&self) {
        self.with_loops(|l| l.out_push_replication.disable());
    }

    /// Runs one outgoing push replication pass now
    pub fn out_push_replication_pass(&self) {
        self.with_loops(|l| l.out_push_replication.run_now());
    }

    /// Stops all background work, flushes the active page, finalizes the
    /// open file pair and joins every thread. Idempotent.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the final flush fails; the store is closed
    /// regardless.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("closing value store at {}", self.config.path.display());
        self.disable_writes();

        let loops = self.loops.lock().expect("lock is poisoned").take();
        let Some(loops) = loops else {
            return Ok(());
        };
        loops.tombstone_discard.stop();
        loops.compaction.stop();
        loops.out_pull_replication.stop();
        loops.out_push_replication.stop();

        let flush_result = self.flush_store();

        let (done_tx, done_rx) = bounded(1);
        if self.flush_tx.send(FlushTask::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
        if let Some(handle) = loops.flusher {
            let _ = handle.join();
        }
        for handle in loops.workers {
            let _ = handle.join();
        }
        flush_result
    }

    fn with_loops(&self, f: impl FnOnce(&Loops)) {
        if let Some(loops) = self.loops.lock().expect("lock is poisoned").as_ref() {
            f(loops);
        }
    }
}

impl StoreInner {
    /// Whether `close` has been called; polled by the message workers
    pub(crate) fn is_store_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The write path: stage the value in the active page and offer the
    /// location to the index. Returns the prior timestamp bits.
    pub(crate) fn write_raw(
        &self,
        key_a: u64,
        key_b: u64,
        timestamp_bits: u64,
        value: &[u8],
    ) -> Result<u64> {
        if value.len() > self.config.value_cap as usize {
            return Err(Error::ValueTooLarge);
        }
        let mut active = self.active.lock().expect("lock is poisoned");
        if !active.fits(value.len()) {
            // Blocks when every page is in the flusher's hands: that is the
            // write path's back-pressure.
            let replacement = self.free_pages_rx.recv().map_err(|_| store_closed())?;
            let full = std::mem::replace(&mut *active, replacement);
            self.flush_tx
                .send(FlushTask::Page(full))
                .map_err(|_| store_closed())?;
        }
        let offset = active.append(key_a, key_b, timestamp_bits, value);
        let (old_tsb, _old_length) = self.loc_map.set(
            key_a,
            key_b,
            timestamp_bits,
            active.id(),
            offset,
            value.len() as u32,
            false,
        );
        // A no-op write (old_tsb >= timestamp_bits) leaves dead bytes in the
        // page; the monotonic index keeps them unreachable and compaction
        // reclaims them later.
        Ok(old_tsb)
    }

    /// The read path: look up, fetch from the block, re-verify against the
    /// index, retry once on staleness
    pub(crate) fn read_raw(&self, key_a: u64, key_b: u64, value: &mut Vec<u8>) -> Result<u64> {
        let mut retried = false;
        loop {
            let entry = self.loc_map.get(key_a, key_b);
            let (tsb, block_id, offset, length) = entry;
            if tsb == 0 || tsb & (DELETION | LOCAL_REMOVAL) != 0 {
                return Err(Error::NotFound {
                    timestamp_bits: tsb,
                });
            }
            let Some(block) = self.blocks.get(block_id) else {
                // The block vanished under us (compaction); go around again
                if retried {
                    return Err(Error::Corrupt);
                }
                retried = true;
                continue;
            };
            let mark = value.len();
            match block.read(offset, length, value) {
                Ok(()) => {
                    if self.loc_map.get(key_a, key_b) == entry {
                        return Ok(tsb);
                    }
                    value.truncate(mark);
                    if retried {
                        return Err(Error::Corrupt);
                    }
                    retried = true;
                }
                Err(e) => {
                    value.truncate(mark);
                    if self.loc_map.get(key_a, key_b) != entry {
                        // Stale index sent us to dead bytes; not corruption
                        if retried {
                            return Err(Error::Corrupt);
                        }
                        retried = true;
                        continue;
                    }
                    if matches!(e, Error::Corrupt) {
                        self.quarantine(block_id, key_a, key_b, tsb);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// A verified-corrupt read: flag the file and plant a local-removal
    /// marker so replication restores the key from its peers
    fn quarantine(&self, block_id: BlockId, key_a: u64, key_b: u64, timestamp_bits: u64) {
        let files = self.files.read().expect("lock is poisoned");
        if let Some(file) = files.iter().find(|f| f.id() == block_id) {
            file.mark_corrupt();
            log::error!(
                "checksum mismatch in {}, file quarantined for compaction",
                file.path().display()
            );
        }
        drop(files);
        self.loc_map.set(
            key_a,
            key_b,
            timestamp_bits | LOCAL_REMOVAL,
            0,
            0,
            0,
            false,
        );
    }

    pub(crate) fn flush_store(&self) -> Result<()> {
        {
            let mut active = self.active.lock().expect("lock is poisoned");
            if !active.is_empty() {
                let replacement = self.free_pages_rx.recv().map_err(|_| store_closed())?;
                let full = std::mem::replace(&mut *active, replacement);
                self.flush_tx
                    .send(FlushTask::Page(full))
                    .map_err(|_| store_closed())?;
            }
        }
        let (done_tx, done_rx) = bounded(1);
        self.flush_tx
            .send(FlushTask::Barrier(done_tx))
            .map_err(|_| store_closed())?;
        done_rx.recv().map_err(|_| store_closed())?;
        Ok(())
    }

    pub(crate) fn create_pair(&self) -> Result<FilePairWriter> {
        create_pair_raw(&self.config, &self.blocks, &self.files)
    }

    /// Unregisters and unlinks a fully compacted pair
    pub(crate) fn drop_file(&self, file: &Arc<ValuesFile>) -> Result<()> {
        self.blocks.unregister(file.id());
        self.files
            .write()
            .expect("lock is poisoned")
            .retain(|f| f.id() != file.id());
        file.unlink()?;
        Ok(())
    }
}

fn store_closed() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "store is closed",
    ))
}

fn toc_dir(config: &Config) -> &Path {
    config
        .path_toc
        .as_deref()
        .unwrap_or(config.path.as_path())
}

fn create_pair_raw(
    config: &Config,
    blocks: &BlockRegistry,
    files: &RwLock<Vec<Arc<ValuesFile>>>,
) -> Result<FilePairWriter> {
    let (pair, _id) = FilePairWriter::create(
        &config.path,
        toc_dir(config),
        config.checksum_interval,
        config.values_file_cap,
        config.values_file_readers,
        blocks,
    )?;
    files
        .write()
        .expect("lock is poisoned")
        .push(pair.file().clone());
    Ok(pair)
}

/// Startup recovery: the index is rebuilt from the TOC/values pairs alone,
/// oldest pair first
fn recover(
    config: &Config,
    blocks: &BlockRegistry,
    files: &RwLock<Vec<Arc<ValuesFile>>>,
    loc_map: &dyn LocMap,
) -> Result<()> {
    let pairs = discover_pairs(&config.path, toc_dir(config))?;
    if pairs.is_empty() {
        return Ok(());
    }
    log::info!("recovering {} values file pairs", pairs.len());

    let mut total_entries: u64 = 0;
    for pair in pairs {
        let trusted = match trusted_values_payload(&pair.values_path, config.checksum_interval) {
            Ok(trusted) => trusted,
            Err(e) => {
                log::error!(
                    "cannot recover {}: {e}",
                    pair.values_path.display()
                );
                continue;
            }
        };
        let tail = Arc::new(Mutex::new(TailState {
            durable: trusted,
            buf: Vec::new(),
        }));
        let id = blocks.reserve();
        let file = Arc::new(ValuesFile::open(
            id,
            pair.timestamp_nano,
            pair.values_path.clone(),
            pair.toc_path.clone(),
            config.checksum_interval,
            config.values_file_readers,
            tail,
            true,
        )?);
        blocks.install(id, file.clone());
        files.write().expect("lock is poisoned").push(file);

        let mut batch: Vec<TocEntry> = Vec::new();
        let mut dropped: u64 = 0;
        let summary = read_records(&pair.toc_path, config.checksum_interval, &mut |e| {
            if u64::from(e.offset) + u64::from(e.length) <= trusted {
                batch.push(e);
            } else {
                dropped += 1;
            }
            if batch.len() >= config.recovery_batch_size {
                for e in batch.drain(..) {
                    loc_map.set(e.key_a, e.key_b, e.timestamp_bits, id, e.offset, e.length, false);
                    total_entries += 1;
                }
            }
        });
        for e in batch.drain(..) {
            loc_map.set(e.key_a, e.key_b, e.timestamp_bits, id, e.offset, e.length, false);
            total_entries += 1;
        }
        match summary {
            Ok(s) if !s.clean => log::warn!(
                "salvaged {} (no clean trailer, kept {} records, dropped {dropped})",
                pair.toc_path.display(),
                s.entry_count
            ),
            Ok(_) => {}
            Err(e) => log::error!("error reading {}: {e}", pair.toc_path.display()),
        }
    }
    log::info!("recovery complete, {total_entries} index entries");
    Ok(())
}

fn flusher_loop(
    weak: &std::sync::Weak<StoreInner>,
    rx: &Receiver<FlushTask>,
    pair: FilePairWriter,
) {
    let mut pair = Some(pair);
    while let Ok(task) = rx.recv() {
        match task {
            FlushTask::Page(page) => {
                let Some(store) = weak.upgrade() else {
                    break;
                };
                match flush_page(&store, &mut pair, &page) {
                    Ok(()) => {
                        page.clear();
                        let _ = store.free_pages_tx.send(page);
                    }
                    Err(e) => {
                        // The pair is done for; the page keeps serving its
                        // entries from memory and is not recycled.
                        log::error!("page flush failed, keeping entries in memory: {e}");
                        if let Some(broken) = pair.take() {
                            if let Err(e2) = broken.close() {
                                log::error!("could not finalize broken pair: {e2}");
                            }
                        }
                    }
                }
            }
            FlushTask::Barrier(done) => {
                if let Some(p) = pair.as_mut() {
                    if let Err(e) = p.flush() {
                        log::error!("flush barrier failed: {e}");
                    }
                }
                let _ = done.send(());
            }
            FlushTask::Shutdown(done) => {
                if let Some(p) = pair.take() {
                    if let Err(e) = p.close() {
                        log::error!("closing values file pair failed: {e}");
                    }
                }
                let _ = done.send(());
                break;
            }
        }
    }
}

/// Serializes one page into the values/TOC pair, rolling files at the cap,
/// then relocates the index entries from the page to the file
fn flush_page(
    store: &Arc<StoreInner>,
    pair_slot: &mut Option<FilePairWriter>,
    page: &MemBlock,
) -> Result<()> {
    let located = page.with_contents(|entries, values| -> Result<Vec<(TocEntry, u32, BlockId)>> {
        let mut located = Vec::with_capacity(entries.len());
        for e in entries {
            let needs_roll = pair_slot.as_ref().map_or(true, |p| !p.has_room(e.length));
            if needs_roll {
                if let Some(old) = pair_slot.take() {
                    old.close()?;
                }
                *pair_slot = Some(store.create_pair()?);
            }
            let pair = pair_slot.as_mut().expect("pair was just ensured");
            let value = &values[e.offset as usize..(e.offset + e.length) as usize];
            let offset = pair.append(e.key_a, e.key_b, e.timestamp_bits, value);
            located.push((*e, offset, pair.block_id()));
        }
        Ok(located)
    })?;
    if let Some(p) = pair_slot.as_mut() {
        p.flush()?;
    }
    for (e, offset, block_id) in located {
        store.loc_map.set(
            e.key_a,
            e.key_b,
            e.timestamp_bits,
            block_id,
            offset,
            e.length,
            true,
        );
    }
    Ok(())
}
