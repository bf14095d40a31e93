//! Two-slot ring shared by one filler and N drainers.
//!
//! A slot cycles `Empty -> Full -> Empty` until the filler publishes it as
//! `Last`. It returns to `Empty` only once every sink that is still active
//! has drained it. Sinks that fail withdraw instead of draining; when the
//! last one withdraws the ring closes and the filler is told to stop.
//!
//! Lock order: a drain or fill guard never holds the payload lock while
//! taking the control mutex.

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::aligned_buffer::{AlignedBuffer, DEFAULT_ALIGNMENT};
use crate::digest::CheckDigest;
use crate::error::Result;

pub type SinkId = usize;

pub const SLOT_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Full,
    /// Full and terminal. Never refilled.
    Last,
}

#[derive(Debug, Clone, Copy)]
struct SinkFlags {
    active: bool,
    consumed: bool,
}

#[derive(Debug)]
struct Control {
    phase: Phase,
    filling: bool,
    length: usize,
    flags: Vec<SinkFlags>,
}

impl Control {
    fn all_active_consumed(&self) -> bool {
        self.flags.iter().all(|f| !f.active || f.consumed)
    }

    fn reset(&mut self) {
        self.phase = Phase::Empty;
        for flag in &mut self.flags {
            flag.consumed = false;
        }
    }
}

/// Contents of one slot.
#[derive(Debug)]
pub struct SlotPayload {
    pub buffer: AlignedBuffer,
    /// Valid bytes in `buffer`.
    pub length: usize,
    /// Source offset of `buffer[0]`.
    pub offset: u64,
    /// Output offset of `buffer[0]`, relative to the sinks' seek position.
    pub output_offset: u64,
    /// Fill cycle that produced these contents, counted from 0.
    pub cycle: u64,
    /// Index of the first input block in this slot.
    pub first_block: u64,
    pub is_last: bool,
    /// Digests sinks verify their re-read bytes against.
    pub checks: Vec<CheckDigest>,
}

impl SlotPayload {
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }
}

struct Slot {
    control: Mutex<Control>,
    filled: Condvar,
    emptied: Condvar,
    payload: RwLock<SlotPayload>,
}

pub struct RingCoordinator {
    slots: [Slot; SLOT_COUNT],
    active: Mutex<Vec<bool>>,
}

impl RingCoordinator {
    /// Allocates both slots with `capacity` usable bytes each.
    pub fn new(sinks: usize, capacity: usize) -> Result<Self> {
        let make_slot = || -> Result<Slot> {
            Ok(Slot {
                control: Mutex::new(Control {
                    phase: Phase::Empty,
                    filling: false,
                    length: 0,
                    flags: vec![
                        SinkFlags {
                            active: true,
                            consumed: false,
                        };
                        sinks
                    ],
                }),
                filled: Condvar::new(),
                emptied: Condvar::new(),
                payload: RwLock::new(SlotPayload {
                    buffer: AlignedBuffer::new(capacity, DEFAULT_ALIGNMENT)?,
                    length: 0,
                    offset: 0,
                    output_offset: 0,
                    cycle: 0,
                    first_block: 0,
                    is_last: false,
                    checks: Vec::new(),
                }),
            })
        };

        let ring = Self {
            slots: [make_slot()?, make_slot()?],
            active: Mutex::new(vec![true; sinks]),
        };
        if sinks == 0 {
            ring.shutdown();
        }
        Ok(ring)
    }

    #[inline]
    pub fn next(slot: usize) -> usize {
        (slot + 1) % SLOT_COUNT
    }

    pub fn active_sinks(&self) -> usize {
        self.active.lock().iter().filter(|a| **a).count()
    }

    pub fn is_active(&self, sink: SinkId) -> bool {
        self.active.lock().get(sink).copied().unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.active_sinks() == 0
    }

    /// Blocks until `slot` may be refilled. Returns `None` once the ring is
    /// closed or the slot already holds the terminal cycle.
    pub fn acquire_for_fill(&self, slot: usize) -> Option<FillGuard<'_>> {
        let s = &self.slots[slot];
        {
            let mut control = s.control.lock();
            while control.phase == Phase::Full {
                s.emptied.wait(&mut control);
            }
            if control.phase == Phase::Last {
                return None;
            }
            control.filling = true;
        }
        Some(FillGuard {
            slot: s,
            payload: Some(s.payload.write()),
        })
    }

    /// Blocks until `slot` holds a cycle `sink` has not drained yet.
    /// Returns `None` when there is nothing more for this sink: the slot is
    /// terminal and empty, or the sink has been withdrawn.
    pub fn acquire_for_drain(&self, slot: usize, sink: SinkId) -> Option<DrainGuard<'_>> {
        let s = &self.slots[slot];
        {
            let mut control = s.control.lock();
            loop {
                if !control.flags[sink].active {
                    return None;
                }
                if control.phase == Phase::Last && control.length == 0 {
                    return None;
                }
                if control.phase != Phase::Empty && !control.filling && !control.flags[sink].consumed {
                    break;
                }
                s.filled.wait(&mut control);
            }
        }
        Some(DrainGuard {
            ring: self,
            slot,
            sink,
            payload: Some(s.payload.read()),
            finished: false,
        })
    }

    /// Permanently withdraws `sink` from both slots.
    pub fn deactivate_sink(&self, sink: SinkId) {
        let remaining = {
            let mut active = self.active.lock();
            match active.get_mut(sink) {
                Some(flag) if *flag => *flag = false,
                _ => return,
            }
            active.iter().filter(|a| **a).count()
        };
        debug!(sink, remaining, "Sink withdrawn from ring");

        if remaining == 0 {
            warn!("No active sinks left, closing ring");
            self.shutdown();
            return;
        }

        for s in &self.slots {
            let mut control = s.control.lock();
            control.flags[sink].active = false;
            Self::release_if_drained(s, &mut control);
            s.filled.notify_all();
        }
    }

    fn mark_drained(&self, slot: usize, sink: SinkId) {
        let s = &self.slots[slot];
        let mut control = s.control.lock();
        control.flags[sink].consumed = true;
        Self::release_if_drained(s, &mut control);
    }

    fn release_if_drained(s: &Slot, control: &mut MutexGuard<'_, Control>) {
        if control.phase == Phase::Full && control.all_active_consumed() {
            control.reset();
            s.emptied.notify_all();
        }
    }

    /// Marks every slot terminal and wakes all waiters. Used when a
    /// participant disappears without publishing or draining.
    pub fn shutdown(&self) {
        self.active.lock().iter_mut().for_each(|a| *a = false);
        for s in &self.slots {
            let mut control = s.control.lock();
            for flag in &mut control.flags {
                flag.active = false;
            }
            control.phase = Phase::Last;
            s.emptied.notify_all();
            s.filled.notify_all();
        }
    }
}

/// Exclusive write access to a slot being filled.
///
/// Dropping it without [`FillGuard::publish`] publishes a zero-length
/// terminal slot so drainers never wait on a filler that went away.
pub struct FillGuard<'a> {
    slot: &'a Slot,
    payload: Option<RwLockWriteGuard<'a, SlotPayload>>,
}

impl FillGuard<'_> {
    /// Makes the slot visible to every active sink.
    pub fn publish(mut self, length: usize, is_last: bool) {
        self.finish(length, is_last);
    }

    fn finish(&mut self, length: usize, is_last: bool) {
        let Some(mut payload) = self.payload.take() else {
            return;
        };
        payload.length = length;
        payload.is_last = is_last;
        drop(payload);

        let mut control = self.slot.control.lock();
        control.filling = false;
        control.length = length;
        for flag in &mut control.flags {
            flag.consumed = false;
        }
        if control.phase != Phase::Last {
            control.phase = if is_last { Phase::Last } else { Phase::Full };
        }
        self.slot.filled.notify_all();
    }
}

impl Deref for FillGuard<'_> {
    type Target = SlotPayload;

    fn deref(&self) -> &SlotPayload {
        match &self.payload {
            Some(payload) => payload,
            None => unreachable!("fill guard used after publish"),
        }
    }
}

impl DerefMut for FillGuard<'_> {
    fn deref_mut(&mut self) -> &mut SlotPayload {
        match &mut self.payload {
            Some(payload) => payload,
            None => unreachable!("fill guard used after publish"),
        }
    }
}

impl Drop for FillGuard<'_> {
    fn drop(&mut self) {
        if self.payload.is_some() {
            self.finish(0, true);
        }
    }
}

/// Shared read access to a published slot for one sink.
///
/// Dropping it without [`DrainGuard::mark_drained`] withdraws the sink.
pub struct DrainGuard<'a> {
    ring: &'a RingCoordinator,
    slot: usize,
    sink: SinkId,
    payload: Option<RwLockReadGuard<'a, SlotPayload>>,
    finished: bool,
}

impl DrainGuard<'_> {
    pub fn mark_drained(mut self) {
        self.payload.take();
        self.finished = true;
        self.ring.mark_drained(self.slot, self.sink);
    }

    pub fn deactivate(mut self) {
        self.payload.take();
        self.finished = true;
        self.ring.deactivate_sink(self.sink);
    }
}

impl Deref for DrainGuard<'_> {
    type Target = SlotPayload;

    fn deref(&self) -> &SlotPayload {
        match &self.payload {
            Some(payload) => payload,
            None => unreachable!("drain guard used after release"),
        }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.payload.take();
            self.ring.deactivate_sink(self.sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn fill(ring: &RingCoordinator, slot: usize, cycle: u64, is_last: bool) {
        let mut guard = ring.acquire_for_fill(slot).unwrap();
        guard.buffer[..8].copy_from_slice(&cycle.to_le_bytes());
        guard.cycle = cycle;
        guard.publish(8, is_last);
    }

    fn drain_all(ring: &RingCoordinator, sink: SinkId) -> Vec<u64> {
        let mut seen = Vec::new();
        let mut slot = 0;
        while let Some(guard) = ring.acquire_for_drain(slot, sink) {
            let mut cycle = [0u8; 8];
            cycle.copy_from_slice(&guard.data()[..8]);
            seen.push(u64::from_le_bytes(cycle));
            let last = guard.is_last;
            guard.mark_drained();
            if last {
                break;
            }
            slot = RingCoordinator::next(slot);
        }
        seen
    }

    #[test]
    fn test_sequential_round_trip() {
        let ring = RingCoordinator::new(2, 4096).unwrap();

        fill(&ring, 0, 0, false);
        for sink in 0..2 {
            let guard = ring.acquire_for_drain(0, sink).unwrap();
            assert_eq!(guard.length, 8);
            guard.mark_drained();
        }

        // both sinks drained: the slot can be refilled without blocking
        fill(&ring, 0, 2, true);
        let guard = ring.acquire_for_drain(0, 1).unwrap();
        assert!(guard.is_last);
        guard.mark_drained();
        assert!(ring.acquire_for_fill(0).is_none());
    }

    #[test]
    fn test_every_sink_sees_every_cycle_in_order() {
        let ring = RingCoordinator::new(3, 4096).unwrap();
        let cycles = 200u64;

        thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|sink| {
                    let ring = &ring;
                    scope.spawn(move || {
                        if sink == 1 {
                            thread::sleep(Duration::from_millis(5));
                        }
                        drain_all(ring, sink)
                    })
                })
                .collect();

            let mut slot = 0;
            for cycle in 0..cycles {
                fill(&ring, slot, cycle, cycle + 1 == cycles);
                slot = RingCoordinator::next(slot);
            }

            for handle in handles {
                let seen = handle.join().unwrap();
                assert_eq!(seen, (0..cycles).collect::<Vec<_>>());
            }
        });
    }

    #[test]
    fn test_deactivation_releases_the_rendezvous() {
        let ring = RingCoordinator::new(2, 4096).unwrap();
        fill(&ring, 0, 0, false);
        fill(&ring, 1, 1, false);

        ring.acquire_for_drain(0, 0).unwrap().mark_drained();

        // slot 0 still waits for sink 1; withdrawing it must free the slot
        ring.deactivate_sink(1);
        assert!(ring.acquire_for_drain(0, 1).is_none());
        assert_eq!(ring.active_sinks(), 1);

        fill(&ring, 0, 2, true);
        let guard = ring.acquire_for_drain(1, 0).unwrap();
        assert_eq!(guard.cycle, 1);
        guard.mark_drained();
        let guard = ring.acquire_for_drain(0, 0).unwrap();
        assert_eq!(guard.cycle, 2);
        assert!(guard.is_last);
        guard.mark_drained();
    }

    #[test]
    fn test_filler_is_released_when_last_sink_withdraws() {
        let ring = RingCoordinator::new(1, 4096).unwrap();
        fill(&ring, 0, 0, false);
        fill(&ring, 1, 1, false);

        let blocked = AtomicBool::new(true);
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                let guard = ring.acquire_for_fill(0);
                blocked.store(false, Ordering::SeqCst);
                guard.is_none()
            });

            thread::sleep(Duration::from_millis(20));
            assert!(blocked.load(Ordering::SeqCst));

            ring.acquire_for_drain(0, 0).unwrap().deactivate();
            assert!(handle.join().unwrap());
        });
        assert!(ring.is_closed());
    }

    #[test]
    fn test_dropped_fill_guard_publishes_terminal_slot() {
        let ring = RingCoordinator::new(1, 4096).unwrap();
        drop(ring.acquire_for_fill(0).unwrap());
        assert!(ring.acquire_for_drain(0, 0).is_none());
        assert!(ring.acquire_for_fill(0).is_none());
    }

    #[test]
    fn test_dropped_drain_guard_withdraws_sink() {
        let ring = RingCoordinator::new(2, 4096).unwrap();
        fill(&ring, 0, 0, false);
        drop(ring.acquire_for_drain(0, 0).unwrap());
        assert!(!ring.is_active(0));
        assert!(ring.is_active(1));
    }

    #[test]
    fn test_slow_sink_blocks_only_itself() {
        let ring = RingCoordinator::new(2, 4096).unwrap();
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            let ring = &ring;
            scope.spawn(move || {
                let seen = drain_all(ring, 0);
                tx.send(seen).unwrap();
            });
            scope.spawn(move || {
                // sink 1 stalls on its first slot, then fails
                let guard = ring.acquire_for_drain(0, 1).unwrap();
                thread::sleep(Duration::from_millis(30));
                guard.deactivate();
            });

            let mut slot = 0;
            for cycle in 0..50 {
                fill(ring, slot, cycle, cycle == 49);
                slot = RingCoordinator::next(slot);
            }
            let seen = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(seen.len(), 50);
        });
    }

    #[test]
    fn test_zero_sinks_ring_is_closed() {
        let ring = RingCoordinator::new(0, 512).unwrap();
        assert!(ring.is_closed());
        assert!(ring.acquire_for_fill(0).is_none());
    }
}
