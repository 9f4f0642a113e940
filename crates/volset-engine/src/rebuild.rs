//! Mirror resynchronization
//!
//! One member of a mirror can be rebuilt at a time. The copy runs in
//! fixed windows from an in-sync member to the target while host writes
//! continue:
//!
//! - writes behind the copy cursor go to the target directly
//! - writes ahead of it are remembered in a bounded pending queue and
//!   replayed once the copy pass is done
//! - during a quick rebuild, writes to regions the bitmap shows clean go
//!   to the target directly, since the copy pass will never visit them
//!
//! The dirty-region bitmap and the rebuild progress share one lock, which
//! every mirror write takes before touching the members. Lock order is
//! always: set update lock, then this lock, then the set state lock.
//!
//! Commands run on a per-set worker thread fed through a bounded
//! channel. Rebuild failures are reported, never retried.

use crate::member::Member;
use crate::set::{RaidSet, SetState};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use volset_common::{Error, MemberId, MemberState, RebuildConfig, Result};
use volset_storage::layout::MIN_QUICK_REBUILD_VERSION;
use volset_storage::{Extent, RebuildBitmap};

/// How a member is resynchronized
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RebuildMode {
    /// Quick when the bitmap allows it, full otherwise
    Auto,
    /// Copy the whole data region
    Full,
    /// Copy only the regions the bitmap marks dirty
    Quick,
}

/// Where a rebuild stands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum RebuildPhase {
    /// No rebuild has run
    #[default]
    NotStarted,
    /// Copying every window
    FullRebuild,
    /// Copying dirty windows
    QuickRebuild,
    /// Replaying writes that landed ahead of the copy
    Recovering,
    /// Target is in sync
    Complete,
    /// Stopped by an error or cancellation
    Failed,
}

impl RebuildPhase {
    /// True while the target is being written
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::FullRebuild | Self::QuickRebuild | Self::Recovering)
    }
}

/// Rebuild progress reported to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RebuildStatus {
    /// Member being rebuilt
    pub target: Option<MemberId>,
    /// Current phase
    pub phase: RebuildPhase,
    /// Copy mode in use
    pub mode: Option<RebuildMode>,
    /// Bytes of the data region behind the copy cursor
    pub cursor: u64,
    /// Size of the data region
    pub data_size: u64,
    /// Bytes copied so far
    pub copied: u64,
    /// Writes waiting to be replayed
    pub pending: usize,
    /// Commands waiting for the worker
    pub queued: usize,
    /// Why the rebuild failed
    pub error: Option<String>,
}

/// Progress of the current or last rebuild
#[derive(Debug, Default)]
pub(crate) struct RebuildProgress {
    pub target: Option<MemberId>,
    pub phase: RebuildPhase,
    pub mode: Option<RebuildMode>,
    pub cursor: u64,
    pub data_size: u64,
    pub copied: u64,
    pub pending: VecDeque<Extent>,
    pub error: Option<String>,
    /// Failed, but the target has not been marked Broken yet
    pub unsettled: bool,
}

/// How a host write treats the rebuild target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    /// Write the target along with the in-sync members
    Mirror,
    /// Replay the range after the copy pass
    Defer,
    /// Leave the target alone
    Skip,
}

/// State guarded by the mirror I/O lock
#[derive(Debug, Default)]
pub(crate) struct MirrorIo {
    pub bitmap: Option<RebuildBitmap>,
    pub progress: RebuildProgress,
    queued: usize,
}

impl MirrorIo {
    /// Decide a write's route before it marks the bitmap
    pub fn route(&self, offset: u64, len: u64, cancelled: bool) -> Route {
        let progress = &self.progress;
        if cancelled || progress.target.is_none() {
            return Route::Skip;
        }
        match progress.phase {
            RebuildPhase::Recovering => Route::Mirror,
            RebuildPhase::FullRebuild | RebuildPhase::QuickRebuild => {
                if offset + len <= progress.cursor {
                    return Route::Mirror;
                }
                let clean = progress.phase == RebuildPhase::QuickRebuild
                    && self.bitmap.as_ref().is_some_and(|b| b.is_clean(offset, len));
                if clean { Route::Mirror } else { Route::Defer }
            }
            RebuildPhase::NotStarted | RebuildPhase::Complete | RebuildPhase::Failed => Route::Skip,
        }
    }

    /// Stop the current rebuild
    pub fn fail(&mut self, reason: String) {
        if !self.progress.phase.is_active() {
            return;
        }
        warn!(target_member = ?self.progress.target, %reason, "rebuild failed");
        self.progress.phase = RebuildPhase::Failed;
        self.progress.error = Some(reason);
        self.progress.pending.clear();
        self.progress.unsettled = true;
    }

    /// Next window the copy pass should visit
    fn next_window(&self, io_size: u64) -> Option<Extent> {
        let progress = &self.progress;
        if progress.cursor >= progress.data_size {
            return None;
        }
        match progress.phase {
            RebuildPhase::FullRebuild => Some(Extent::new(
                progress.cursor,
                io_size.min(progress.data_size - progress.cursor),
            )),
            RebuildPhase::QuickRebuild => {
                let bitmap = self.bitmap.as_ref()?;
                let mut bit = progress.cursor / bitmap.bytes_per_bit();
                loop {
                    bit = bitmap.next_dirty(bit)?;
                    let range = bitmap.bit_range(bit, progress.data_size);
                    let start = range.offset.max(progress.cursor);
                    if start < range.end() {
                        return Some(Extent::new(start, io_size.min(range.end() - start)));
                    }
                    bit += 1;
                }
            }
            _ => None,
        }
    }

    fn status(&self) -> RebuildStatus {
        let progress = &self.progress;
        RebuildStatus {
            target: progress.target,
            phase: progress.phase,
            mode: progress.mode,
            cursor: progress.cursor,
            data_size: progress.data_size,
            copied: progress.copied,
            pending: progress.pending.len(),
            queued: self.queued,
            error: progress.error.clone(),
        }
    }
}

enum RebuildCommand {
    Rebuild { member: MemberId, mode: RebuildMode },
    Shutdown,
}

struct Worker {
    commands: Sender<RebuildCommand>,
    handle: JoinHandle<()>,
}

/// Rebuild bookkeeping of one mirror set
pub(crate) struct RebuildCoordinator {
    pub io: Mutex<MirrorIo>,
    done: Condvar,
    cancel: AtomicBool,
    closed: AtomicBool,
    worker: Mutex<Option<Worker>>,
    config: RebuildConfig,
}

impl RebuildCoordinator {
    pub fn new(config: &RebuildConfig) -> Self {
        Self {
            io: Mutex::new(MirrorIo::default()),
            done: Condvar::new(),
            cancel: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            worker: Mutex::new(None),
            config: config.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RebuildStatus {
        self.io.lock().status()
    }

    /// Fail the running rebuild if it targets `member`
    pub fn abort_if_target(&self, member: MemberId, reason: &str) {
        let mut io = self.io.lock();
        if io.progress.target == Some(member) && io.progress.phase.is_active() {
            io.fail(reason.to_string());
        }
    }

    fn submit(&self, set: Weak<RaidSet>, command: RebuildCommand) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::member_state("set is closing"));
        }
        let mut worker = self.worker.lock();
        if worker.is_none() {
            let (commands, receiver) = bounded(self.config.command_capacity);
            let handle = std::thread::Builder::new()
                .name("volset-rebuild".to_string())
                .spawn(move || worker_loop(&set, &receiver))
                .map_err(|e| Error::internal(format!("failed to spawn rebuild worker: {e}")))?;
            *worker = Some(Worker { commands, handle });
        }
        let Some(worker) = worker.as_ref() else {
            return Err(Error::internal("rebuild worker missing"));
        };

        self.io.lock().queued += 1;
        match worker.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.io.lock().queued -= 1;
                Err(match e {
                    TrySendError::Full(_) => Error::member_state("rebuild command queue is full"),
                    TrySendError::Disconnected(_) => Error::member_state("rebuild worker has stopped"),
                })
            }
        }
    }

    fn dequeued(&self) {
        let mut io = self.io.lock();
        io.queued = io.queued.saturating_sub(1);
        self.done.notify_all();
    }

    /// Stop the worker and fail any running rebuild
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        self.io.lock().fail("set closed".to_string());
        let Some(worker) = self.worker.lock().take() else { return };
        let _ = worker.commands.try_send(RebuildCommand::Shutdown);
        drop(worker.commands);
        if worker.handle.thread().id() != std::thread::current().id() {
            let _ = worker.handle.join();
        }
    }

    fn wait(&self, timeout: Duration) -> RebuildStatus {
        let deadline = Instant::now() + timeout;
        let mut io = self.io.lock();
        while io.progress.phase.is_active() || io.progress.unsettled || io.queued > 0 {
            if self.done.wait_until(&mut io, deadline).timed_out() {
                break;
            }
        }
        io.status()
    }
}

fn worker_loop(set: &Weak<RaidSet>, commands: &Receiver<RebuildCommand>) {
    while let Ok(command) = commands.recv() {
        let RebuildCommand::Rebuild { member, mode } = command else { break };
        let Some(set) = set.upgrade() else { break };
        set.run_rebuild(member, mode);
    }
    debug!("rebuild worker stopped");
}

impl RaidSet {
    fn coordinator(&self) -> Result<&RebuildCoordinator> {
        self.rebuild.as_ref().ok_or_else(|| {
            Error::member_state(format!("{} sets do not rebuild members", self.level))
        })
    }

    /// Check that `member` can be rebuilt and settle the copy mode
    fn rebuild_plan(&self, state: &SetState, io: &MirrorIo, member: MemberId, mode: RebuildMode) -> Result<RebuildMode> {
        let target: &Member = state
            .members
            .iter()
            .find(|m| m.id == member)
            .ok_or_else(|| Error::MemberNotFound(member.to_string()))?;
        if target.device.is_none() {
            return Err(Error::member_state(format!("member {member} is missing")));
        }
        if !matches!(target.state, MemberState::Broken | MemberState::Spare) {
            return Err(Error::member_state(format!(
                "member {member} is {:?}, only Broken or waiting members can be rebuilt",
                target.state
            )));
        }
        if !state.members.iter().any(|m| m.id != member && m.state == MemberState::Open) {
            return Err(Error::member_state("no in-sync member to rebuild from"));
        }

        let quick_ok = state.quick_rebuild
            && io.bitmap.is_some()
            && target.sequence > 0
            && target.sequence < state.sequence;
        match mode {
            RebuildMode::Full => Ok(RebuildMode::Full),
            RebuildMode::Quick if state.version < MIN_QUICK_REBUILD_VERSION => {
                Err(Error::VersionUnsupported {
                    found: state.version,
                    required: MIN_QUICK_REBUILD_VERSION,
                })
            }
            RebuildMode::Quick if !quick_ok => Err(Error::member_state(format!(
                "member {member} has no valid dirty-region bitmap to rebuild from"
            ))),
            RebuildMode::Quick => Ok(RebuildMode::Quick),
            RebuildMode::Auto if quick_ok && state.version >= MIN_QUICK_REBUILD_VERSION => {
                Ok(RebuildMode::Quick)
            }
            RebuildMode::Auto => Ok(RebuildMode::Full),
        }
    }

    /// Queue a rebuild of `member` on the set's worker
    pub fn start_rebuild(&self, member: MemberId, mode: RebuildMode) -> Result<()> {
        let coordinator = self.coordinator()?;
        {
            let io = coordinator.io.lock();
            let state = self.state.read();
            self.rebuild_plan(&state, &io, member, mode)?;
        }
        coordinator.submit(self.weak(), RebuildCommand::Rebuild { member, mode })?;
        debug!(set = %self.id, %member, ?mode, "queued rebuild");
        Ok(())
    }

    /// Mark `member` Rebuilding and reset the progress; returns the mode in use
    pub fn begin_rebuild(&self, member: MemberId, mode: RebuildMode) -> Result<RebuildMode> {
        let coordinator = self.coordinator()?;
        let _guard = self.update.lock();
        let mut io = coordinator.io.lock();
        if io.progress.phase.is_active() || io.progress.unsettled {
            return Err(Error::member_state("a rebuild is already running"));
        }
        let mut state = self.state.write();
        let mode = self.rebuild_plan(&state, &io, member, mode)?;
        let data_size = state.common_chunks() * self.chunk_size;
        if let Some(target) = state.member_mut(member) {
            target.state = MemberState::Rebuilding;
        }
        drop(state);

        io.progress = RebuildProgress {
            target: Some(member),
            phase: if mode == RebuildMode::Quick {
                RebuildPhase::QuickRebuild
            } else {
                RebuildPhase::FullRebuild
            },
            mode: Some(mode),
            data_size,
            ..RebuildProgress::default()
        };
        coordinator.cancel.store(false, Ordering::SeqCst);
        let dirty = io.bitmap.as_ref().map_or(0, RebuildBitmap::dirty_count);
        info!(set = %self.id, %member, ?mode, data_size, dirty, "rebuild started");
        Ok(mode)
    }

    /// Advance the rebuild by one window; false once it has finished or failed
    pub fn rebuild_step(&self) -> Result<bool> {
        let coordinator = self.coordinator()?;
        if coordinator.is_cancelled() {
            coordinator.io.lock().fail("rebuild cancelled".to_string());
            self.settle_failure();
            return Ok(false);
        }

        let mut io = coordinator.io.lock();
        let phase = io.progress.phase;
        match phase {
            RebuildPhase::NotStarted | RebuildPhase::Complete => Ok(false),
            RebuildPhase::Failed => {
                drop(io);
                self.settle_failure();
                Ok(false)
            }
            RebuildPhase::FullRebuild | RebuildPhase::QuickRebuild => {
                let Some(window) = io.next_window(self.config.rebuild.io_size) else {
                    io.progress.cursor = io.progress.data_size;
                    io.progress.phase = RebuildPhase::Recovering;
                    debug!(
                        set = %self.id,
                        copied = io.progress.copied,
                        pending = io.progress.pending.len(),
                        "copy pass finished"
                    );
                    return Ok(true);
                };
                self.copy_window(io, window, true)
            }
            RebuildPhase::Recovering => {
                let replay = io.progress.pending.pop_front();
                match replay {
                    Some(range) => self.copy_window(io, range, false),
                    None => {
                        drop(io);
                        self.finish_rebuild()?;
                        Ok(false)
                    }
                }
            }
        }
    }

    fn copy_window(&self, mut io: MutexGuard<'_, MirrorIo>, window: Extent, advance: bool) -> Result<bool> {
        match self.copy_to_target(io.progress.target, window) {
            Ok(()) => {
                io.progress.copied += window.length;
                if advance {
                    io.progress.cursor = window.end();
                    self.clear_copied_bits(&mut io);
                }
                Ok(true)
            }
            Err(e) => {
                io.fail(e.to_string());
                drop(io);
                self.settle_failure();
                Err(e)
            }
        }
    }

    /// Clear the dirty bits the copy pass has moved past and store the
    /// bitmap on the in-sync members.
    ///
    /// Bits stay set while any other member is out of sync, as they also
    /// describe what that member lacks.
    fn clear_copied_bits(&self, io: &mut MirrorIo) {
        let Some(target) = io.progress.target else { return };
        let cursor = io.progress.cursor;
        let data_size = io.progress.data_size;
        let pending = &io.progress.pending;
        let Some(bitmap) = io.bitmap.as_mut() else { return };

        let state = self.state.read();
        if state
            .members
            .iter()
            .any(|m| m.id != target && m.state != MemberState::Open)
        {
            return;
        }
        // deferred writes have not reached the target yet
        let mut cleared = 0u64;
        let mut from = 0;
        while let Some(bit) = bitmap.next_dirty(from) {
            let range = bitmap.bit_range(bit, data_size);
            if range.end() > cursor {
                break;
            }
            if !pending.iter().any(|p| p.overlaps(&range)) {
                bitmap.clear(bit);
                cleared += 1;
            }
            from = bit + 1;
        }
        if cleared == 0 {
            return;
        }
        let sequence = state.sequence;
        let destination = state.member(target).and_then(|m| m.device.clone());
        let stores: Vec<_> = state
            .members
            .iter()
            .filter(|m| m.state == MemberState::Open)
            .filter_map(|m| m.primary_store(self.chunk_size, state.primary_size).ok())
            .collect();
        drop(state);

        // the copied data must be durable before the bits go
        if let Some(device) = destination
            && let Err(e) = device.sync()
        {
            warn!(set = %self.id, error = %e, "target sync failed, bitmap kept on disk");
            return;
        }
        for store in stores {
            if let Err(e) = store.write_bitmap(sequence, bitmap) {
                warn!(set = %self.id, error = %e, "bitmap write failed");
            }
        }
        debug!(set = %self.id, cleared, cursor, "cleared copied bits");
    }

    /// Copy one range from an in-sync member to the target
    fn copy_to_target(&self, target: Option<MemberId>, window: Extent) -> Result<()> {
        let target = target.ok_or_else(|| Error::internal("rebuild without a target"))?;
        let (sources, destination) = {
            let state = self.state.read();
            let sources: Vec<_> = state
                .members
                .iter()
                .filter(|m| m.id != target && m.state == MemberState::Open)
                .filter_map(|m| m.device.clone())
                .collect();
            let destination = state
                .member(target)
                .ok_or_else(|| Error::MemberNotFound(target.to_string()))?
                .device()?
                .clone();
            (sources, destination)
        };

        let mut buf = vec![0u8; window.length as usize];
        let mut read = Err(Error::member_state("no in-sync member to copy from"));
        for source in &sources {
            read = source.read_at(window.offset, &mut buf);
            match &read {
                Ok(()) => break,
                Err(e) => warn!(set = %self.id, device = source.name(), error = %e, "rebuild read failed"),
            }
        }
        read?;
        destination.write_at(window.offset, &buf)
    }

    /// Bring the target into service and commit
    fn finish_rebuild(&self) -> Result<()> {
        let coordinator = self.coordinator()?;
        let _guard = self.update.lock();
        let mut io = coordinator.io.lock();
        if io.progress.phase != RebuildPhase::Recovering || !io.progress.pending.is_empty() {
            return Ok(());
        }
        let target = io
            .progress
            .target
            .ok_or_else(|| Error::internal("rebuild without a target"))?;

        let mut next = self.state.read().clone();
        let Some(member) = next.member_mut(target) else {
            io.fail("member left the set".to_string());
            io.progress.unsettled = false;
            coordinator.done.notify_all();
            return Ok(());
        };
        member.state = MemberState::Open;

        let mut bitmap = io.bitmap.clone();
        if !next.is_degraded()
            && let Some(bitmap) = bitmap.as_mut()
        {
            bitmap.clear_all();
        }

        match self.commit(&mut next, bitmap.as_ref()) {
            Ok(sequence) => {
                io.bitmap = bitmap;
                io.progress.phase = RebuildPhase::Complete;
                *self.state.write() = next;
                coordinator.done.notify_all();
                info!(
                    set = %self.id,
                    member = %target,
                    sequence,
                    copied = io.progress.copied,
                    "rebuild complete"
                );
                Ok(())
            }
            Err(e) => {
                io.fail(format!("commit failed: {e}"));
                io.progress.unsettled = false;
                if let Some(member) = self.state.write().member_mut(target) {
                    member.state = MemberState::Broken;
                }
                coordinator.done.notify_all();
                Err(e)
            }
        }
    }

    /// Mark a failed rebuild's target Broken
    fn settle_failure(&self) {
        let Some(coordinator) = &self.rebuild else { return };
        let _guard = self.update.lock();
        let mut io = coordinator.io.lock();
        if io.progress.phase == RebuildPhase::Failed && io.progress.unsettled {
            if let Some(target) = io.progress.target
                && let Some(member) = self.state.write().member_mut(target)
                && member.state == MemberState::Rebuilding
            {
                member.state = MemberState::Broken;
                warn!(
                    set = %self.id,
                    member = %target,
                    error = ?io.progress.error,
                    "rebuild target marked broken"
                );
            }
            io.progress.unsettled = false;
        }
        coordinator.done.notify_all();
    }

    /// Worker entry point: run one rebuild to the end
    pub(crate) fn run_rebuild(&self, member: MemberId, mode: RebuildMode) {
        let Some(coordinator) = &self.rebuild else { return };
        let started = if coordinator.closed.load(Ordering::SeqCst) {
            Err(Error::member_state("set is closing"))
        } else {
            self.begin_rebuild(member, mode)
        };
        coordinator.dequeued();
        if let Err(e) = started {
            warn!(set = %self.id, %member, error = %e, "rebuild did not start");
            return;
        }

        loop {
            match self.rebuild_step() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(set = %self.id, %member, error = %e, "rebuild stopped");
                    break;
                }
            }
        }
    }

    /// Stop the running rebuild and mark its target Broken
    pub fn cancel_rebuild(&self) -> Result<()> {
        let coordinator = self.coordinator()?;
        coordinator.cancel.store(true, Ordering::SeqCst);
        coordinator.io.lock().fail("rebuild cancelled".to_string());
        self.settle_failure();
        info!(set = %self.id, "rebuild cancelled");
        Ok(())
    }

    /// Wait until no rebuild is running or queued, or the timeout passes
    pub fn wait_for_rebuild(&self, timeout: Duration) -> Result<RebuildStatus> {
        Ok(self.coordinator()?.wait(timeout))
    }

    /// Progress of the current or last rebuild
    pub fn rebuild_status(&self) -> Result<RebuildStatus> {
        Ok(self.coordinator()?.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_with(phase: RebuildPhase, cursor: u64, bitmap: Option<RebuildBitmap>) -> MirrorIo {
        MirrorIo {
            bitmap,
            progress: RebuildProgress {
                target: Some(MemberId::new()),
                phase,
                cursor,
                data_size: 1 << 20,
                ..RebuildProgress::default()
            },
            queued: 0,
        }
    }

    #[test]
    fn test_route_full_rebuild() {
        let io = io_with(RebuildPhase::FullRebuild, 65536, None);
        assert_eq!(io.route(0, 4096, false), Route::Mirror);
        assert_eq!(io.route(61440, 4096, false), Route::Mirror);
        // straddles the cursor
        assert_eq!(io.route(63488, 4096, false), Route::Defer);
        assert_eq!(io.route(131072, 4096, false), Route::Defer);
        assert_eq!(io.route(0, 4096, true), Route::Skip);
    }

    #[test]
    fn test_route_quick_rebuild_clean_regions() {
        let mut bitmap = RebuildBitmap::new(1 << 20, 65536);
        bitmap.mark(262144, 4096);
        let io = io_with(RebuildPhase::QuickRebuild, 0, Some(bitmap));
        assert_eq!(io.route(524288, 4096, false), Route::Mirror);
        assert_eq!(io.route(262144, 4096, false), Route::Defer);
    }

    #[test]
    fn test_route_idle_and_recovering() {
        assert_eq!(io_with(RebuildPhase::Recovering, 1 << 20, None).route(0, 512, false), Route::Mirror);
        assert_eq!(io_with(RebuildPhase::Complete, 1 << 20, None).route(0, 512, false), Route::Skip);
        assert_eq!(MirrorIo::default().route(0, 512, false), Route::Skip);
    }

    #[test]
    fn test_next_window_full() {
        let mut io = io_with(RebuildPhase::FullRebuild, 0, None);
        assert_eq!(io.next_window(262144), Some(Extent::new(0, 262144)));
        io.progress.cursor = (1 << 20) - 4096;
        assert_eq!(io.next_window(262144), Some(Extent::new((1 << 20) - 4096, 4096)));
        io.progress.cursor = 1 << 20;
        assert_eq!(io.next_window(262144), None);
    }

    #[test]
    fn test_next_window_quick_walks_dirty_bits() {
        let mut bitmap = RebuildBitmap::new(1 << 20, 65536);
        bitmap.mark(131072, 1);
        bitmap.mark(655360, 1);
        let mut io = io_with(RebuildPhase::QuickRebuild, 0, Some(bitmap));

        assert_eq!(io.next_window(32768), Some(Extent::new(131072, 32768)));
        io.progress.cursor = 131072 + 32768;
        assert_eq!(io.next_window(32768), Some(Extent::new(163840, 32768)));
        io.progress.cursor = 196608;
        assert_eq!(io.next_window(1 << 20), Some(Extent::new(655360, 65536)));
        io.progress.cursor = 720896;
        assert_eq!(io.next_window(1 << 20), None);
    }

    #[test]
    fn test_fail_clears_pending() {
        let mut io = io_with(RebuildPhase::FullRebuild, 0, None);
        io.progress.pending.push_back(Extent::new(0, 512));
        io.fail("boom".to_string());
        assert_eq!(io.progress.phase, RebuildPhase::Failed);
        assert!(io.progress.pending.is_empty());
        assert!(io.progress.unsettled);
        assert_eq!(io.status().error.as_deref(), Some("boom"));

        // failing twice keeps the first reason
        io.fail("again".to_string());
        assert_eq!(io.progress.error.as_deref(), Some("boom"));
    }
}
