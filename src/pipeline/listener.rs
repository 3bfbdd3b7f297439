//! Synchronized multi-stream frame listener.
//!
//! Driver threads push frames in through [`FrameListener::on_new_frame`]; a
//! single consumer pulls complete [`FrameSet`]s out with
//! [`SyncMultiFrameListener::wait_for_new_frame`]. Frames are matched by
//! capture cycle (sequence number), not by arrival order.
//!
//! # Stale sets
//!
//! Producers never wait on the consumer. When a set completes while the
//! previous complete set is still unclaimed, the previous set is released
//! back to the driver and counted as dropped, so the consumer always sees the
//! freshest cycle.
//!
//! # Partial cycles
//!
//! Each driver stream delivers its cycles in increasing order. A partial
//! cycle that lacks a category whose stream has already moved past it can
//! never complete, so it is evicted as soon as that is known. At most
//! `max_pending_sets` partial cycles are open at once: a producer that would
//! open another waits, up to `max_pending_wait`, for the other streams to
//! complete one. Only when that wait runs out is the oldest partial cycle
//! evicted. Completing a cycle evicts every older partial cycle, since
//! delivery is in increasing cycle order.
//!
//! Every completed or evicted cycle raises a floor; frames for a cycle at or
//! below it that is no longer open are rejected instead of starting a set
//! that could never be delivered.
//!
//! # Release discipline
//!
//! Every set handed out must be given back with
//! [`SyncMultiFrameListener::release`] or by dropping a [`FrameSetGuard`].
//! Unreleased sets pin driver buffers; once the pool runs dry the driver
//! stops delivering and capture stalls.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::capture::driver::FrameListener;
use crate::capture::frame::{Frame, FrameType, FrameTypeMask};
use crate::error::{Error, Result};
use crate::pipeline::buffers::CaptureBuffers;
use crate::pipeline::convert::FrameConverter;
use crate::pipeline::frame_set::{FrameSet, FrameSetInfo};
use crate::{ListenerConfig, CONFIG};

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
    sets_completed: AtomicU64,
    sets_delivered: AtomicU64,
    sets_dropped: AtomicU64,
    sets_evicted: AtomicU64,
}

/// Snapshot of listener activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub frames_received: u64,
    /// Unsubscribed, late, duplicate, or arrived after stop
    pub frames_rejected: u64,
    pub sets_completed: u64,
    pub sets_delivered: u64,
    /// Complete sets overwritten before the consumer claimed them
    pub sets_dropped: u64,
    /// Partial sets released without ever completing
    pub sets_evicted: u64,
}

#[derive(Default)]
struct SyncState {
    pending: BTreeMap<u64, FrameSet>,
    ready: Option<FrameSet>,
    /// Highest cycle that was completed or evicted
    floor: Option<u64>,
    stopped: bool,
}

impl SyncState {
    fn raise_floor(&mut self, sequence: u64) {
        self.floor = Some(self.floor.map_or(sequence, |floor| floor.max(sequence)));
    }

    fn is_closed(&self, sequence: u64) -> bool {
        self.floor.is_some_and(|floor| sequence <= floor) && !self.pending.contains_key(&sequence)
    }

    fn drain(&mut self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = std::mem::take(&mut self.pending)
            .into_values()
            .flat_map(FrameSet::into_frames)
            .collect();
        if let Some(set) = self.ready.take() {
            frames.extend(set.into_frames());
        }
        frames
    }
}

pub struct SyncMultiFrameListener {
    mask: FrameTypeMask,
    max_pending: usize,
    pending_wait: Duration,
    state: Mutex<SyncState>,
    /// Consumer side: a set became ready
    ready: Condvar,
    /// Producer side: a partial cycle closed
    space: Condvar,
    counters: CachePadded<Counters>,
}

impl SyncMultiFrameListener {
    /// Listener for `mask`, bounded by the active global configuration.
    pub fn new(mask: FrameTypeMask) -> Self {
        Self::with_config(mask, &CONFIG.load().listener)
    }

    pub fn with_config(mask: FrameTypeMask, config: &ListenerConfig) -> Self {
        if mask.is_empty() {
            warn!("listener subscribed to no frame types; no set will ever complete");
        }
        Self {
            mask,
            max_pending: config.max_pending_sets.max(1),
            pending_wait: config.max_pending_wait(),
            state: Mutex::new(SyncState::default()),
            ready: Condvar::new(),
            space: Condvar::new(),
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn mask(&self) -> FrameTypeMask {
        self.mask
    }

    /// Whether a complete set is waiting to be claimed
    pub fn has_new_frame(&self) -> bool {
        self.state.lock().ready.is_some()
    }

    /// Block until a complete set is ready.
    ///
    /// Returns `Ok(None)` when `timeout` passes first and `Err(Error::Stopped)`
    /// once [`stop`](Self::stop) has been called. Only one thread may wait.
    pub fn wait_for_new_frame(&self, timeout: Duration) -> Result<Option<FrameSet>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(set) = state.ready.take() {
                self.counters.sets_delivered.fetch_add(1, Ordering::Relaxed);
                trace!(sequence = set.sequence(), "frame set delivered");
                return Ok(Some(set));
            }
            if state.stopped {
                return Err(Error::Stopped);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() && state.ready.is_none() {
                        if state.stopped {
                            return Err(Error::Stopped);
                        }
                        return Ok(None);
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Like [`wait_for_new_frame`](Self::wait_for_new_frame), but the set is
    /// released when the guard drops, on every exit path.
    pub fn wait_for_new_frame_scoped(&self, timeout: Duration) -> Result<Option<FrameSetGuard<'_>>> {
        Ok(self.wait_for_new_frame(timeout)?.map(|set| FrameSetGuard {
            listener: self,
            set: Some(set),
        }))
    }

    /// Wait for a set, convert it into `buffers`, and release it.
    ///
    /// The steady state performs no allocation. A timeout is reported as
    /// [`Error::Timeout`].
    pub fn wait_for_new_frame_into(
        &self,
        converter: &FrameConverter,
        buffers: &mut CaptureBuffers,
        timeout: Duration,
    ) -> Result<FrameSetInfo> {
        let guard = self
            .wait_for_new_frame_scoped(timeout)?
            .ok_or(Error::Timeout(timeout))?;
        buffers.fill(converter, &guard)?;
        Ok(guard.info())
    }

    /// Return every frame of `set` to the driver.
    pub fn release(&self, set: FrameSet) {
        let sequence = set.sequence();
        for frame in set.into_frames() {
            let kind = frame.kind();
            if !frame.release() {
                warn!(sequence, %kind, "frame was already released");
            }
        }
        trace!(sequence, "frame set released");
    }

    /// Wake the consumer with [`Error::Stopped`], turn away producers waiting
    /// for room, and release everything buffered.
    pub fn stop(&self) {
        let frames = {
            let mut state = self.state.lock();
            state.stopped = true;
            state.drain()
        };
        self.ready.notify_all();
        self.space.notify_all();
        let released = frames.len();
        release_all(frames);
        info!(released, "frame listener stopped");
    }

    /// Clear buffered sets and accept frames again after a stop.
    pub fn reset(&self) {
        let frames = {
            let mut state = self.state.lock();
            state.stopped = false;
            state.floor = None;
            state.drain()
        };
        self.space.notify_all();
        release_all(frames);
        debug!("frame listener reset");
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn stats(&self) -> ListenerStats {
        let counters = &self.counters;
        ListenerStats {
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_rejected: counters.frames_rejected.load(Ordering::Relaxed),
            sets_completed: counters.sets_completed.load(Ordering::Relaxed),
            sets_delivered: counters.sets_delivered.load(Ordering::Relaxed),
            sets_dropped: counters.sets_dropped.load(Ordering::Relaxed),
            sets_evicted: counters.sets_evicted.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, frame: Frame, stale: &mut Vec<Frame>) {
        self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kinect_sync_frames_rejected_total").increment(1);
        stale.push(frame);
    }

    fn evict(&self, state: &mut SyncState, sequence: u64, stale: &mut Vec<Frame>) {
        let Some(set) = state.pending.remove(&sequence) else {
            return;
        };
        state.raise_floor(sequence);
        self.counters.sets_evicted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kinect_sync_sets_evicted_total").increment(1);
        debug!(sequence, frames = set.len(), "evicting incomplete frame set");
        stale.extend(set.into_frames());
    }

    /// Evict partial cycles before `sequence` that still lack `kind`; its
    /// stream has moved past them.
    fn evict_stranded(&self, state: &mut SyncState, kind: FrameType, sequence: u64, stale: &mut Vec<Frame>) {
        let stranded: Vec<u64> = state
            .pending
            .range(..sequence)
            .filter(|(_, set)| set.get(kind).is_none())
            .map(|(pending, _)| *pending)
            .collect();
        for pending in stranded {
            trace!(sequence = pending, %kind, "stream skipped cycle");
            self.evict(state, pending, stale);
        }
    }

    /// Decide whether a frame for `sequence` may join the pending cycles,
    /// waiting for room while `max_pending_sets` are open. `false` means the
    /// frame must be rejected.
    fn admit(
        &self,
        state: &mut MutexGuard<'_, SyncState>,
        kind: FrameType,
        sequence: u64,
        stale: &mut Vec<Frame>,
    ) -> bool {
        let mut deadline = None;
        let mut waited_out = false;
        loop {
            if state.stopped || !self.mask.contains(kind) {
                return false;
            }
            self.evict_stranded(state, kind, sequence, stale);
            if state.pending.contains_key(&sequence) {
                return true;
            }
            if state.is_closed(sequence) {
                trace!(sequence, %kind, "frame for a closed cycle");
                return false;
            }
            if state.pending.len() < self.max_pending {
                return true;
            }
            if waited_out {
                return self.make_room(state, kind, sequence, stale);
            }

            let until = *deadline.get_or_insert_with(|| Instant::now().checked_add(self.pending_wait));
            waited_out = match until {
                Some(until) => self.space.wait_until(state, until).timed_out(),
                None => {
                    self.space.wait(state);
                    false
                }
            };
        }
    }

    /// Back-pressure ran out: give up the oldest partial cycle, or this
    /// frame's cycle if it would be the oldest.
    fn make_room(&self, state: &mut SyncState, kind: FrameType, sequence: u64, stale: &mut Vec<Frame>) -> bool {
        match state.pending.keys().next().copied() {
            Some(oldest) if oldest < sequence => {
                warn!(sequence = oldest, %kind, "streams out of step, evicting oldest partial cycle");
                self.evict(state, oldest, stale);
                true
            }
            _ => {
                state.raise_floor(sequence);
                false
            }
        }
    }
}

impl FrameListener for SyncMultiFrameListener {
    fn on_new_frame(&self, frame: Frame) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let kind = frame.kind();
        let sequence = frame.sequence();
        // Filled only on the drop paths; released after the lock is gone
        let mut stale = Vec::new();
        let mut completed = false;

        {
            let mut state = self.state.lock();
            if !self.admit(&mut state, kind, sequence, &mut stale) {
                self.reject(frame, &mut stale);
            } else {
                let set = state
                    .pending
                    .entry(sequence)
                    .or_insert_with(|| FrameSet::new(sequence));
                if let Some(duplicate) = set.insert(frame) {
                    self.reject(duplicate, &mut stale);
                }

                if set.is_complete(self.mask) {
                    if let Some(set) = state.pending.remove(&sequence) {
                        let older: Vec<u64> = state.pending.range(..sequence).map(|(pending, _)| *pending).collect();
                        for pending in older {
                            self.evict(&mut state, pending, &mut stale);
                        }
                        if let Some(unclaimed) = state.ready.replace(set) {
                            self.counters.sets_dropped.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("kinect_sync_sets_dropped_total").increment(1);
                            debug!(sequence = unclaimed.sequence(), "dropping unclaimed frame set");
                            stale.extend(unclaimed.into_frames());
                        }
                        state.raise_floor(sequence);
                        completed = true;
                    }
                }
            }
        }

        if completed {
            self.counters.sets_completed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("kinect_sync_sets_completed_total").increment(1);
            self.ready.notify_one();
        }
        if completed || !stale.is_empty() {
            self.space.notify_all();
        }
        release_all(stale);
    }
}

fn release_all(frames: Vec<Frame>) {
    for frame in frames {
        frame.release();
    }
}

/// A claimed frame set that goes back to the driver when dropped
pub struct FrameSetGuard<'a> {
    listener: &'a SyncMultiFrameListener,
    set: Option<FrameSet>,
}

impl FrameSetGuard<'_> {
    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        if let Some(set) = self.set.take() {
            self.listener.release(set);
        }
    }
}

impl Deref for FrameSetGuard<'_> {
    type Target = FrameSet;

    fn deref(&self) -> &FrameSet {
        // Only `release` and `drop` empty the option, and both consume the guard
        match &self.set {
            Some(set) => set,
            None => unreachable!("frame set guard used after release"),
        }
    }
}

impl Drop for FrameSetGuard<'_> {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            self.listener.release(set);
        }
    }
}
