//! The publishing ring: N segment slots plus the listing endpoint.
//!
//! Segment pieces cut by the driver land in slots round-robin; every
//! slot and the listing carry a `{front, staging}` buffer pair so a
//! reader always drains one complete, immutable frame while newer data
//! is staged behind it. A single lock serializes slot updates, listing
//! rebuilds and buffer swaps; within one cut the listing is rewritten
//! after the slot, so a reader that refreshes the listing is never
//! directed at a slot that has not caught up yet.

pub mod frame;
#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub use frame::{FragmentEntry, ListingRow, MAX_FRAGMENTS_PER_SLOT, SEGMENT_COUNT_EMPTY};

/// Ring configuration.
pub struct PublisherConfig {
    pub seg_name: String,
    /// Number of segment slots (endpoints 1..=N).
    pub slot_count: usize,
    pub is_mp4: bool,
    /// Prepend the Unix name block / listing prefix to every frame.
    pub with_name_blocks: bool,
}

/// One published piece: a complete segment, or a partial extending the
/// current incomplete one.
pub struct Piece {
    pub complete: bool,
    pub duration_ms: u32,
    pub body: Vec<u8>,
    pub fragments: Vec<FragmentEntry>,
}

/// Front/staging buffer pair. Readers snapshot the front `Arc`; a swap
/// is a pointer move under the ring lock.
struct DoubleBuffer {
    front: Arc<Vec<u8>>,
    staging: Option<Arc<Vec<u8>>>,
    readers: u32,
}

impl DoubleBuffer {
    fn new(initial: Vec<u8>) -> Self {
        Self {
            front: Arc::new(initial),
            staging: None,
            readers: 0,
        }
    }

    fn write(&mut self, data: Vec<u8>) {
        if self.readers > 0 {
            self.staging = Some(Arc::new(data));
        } else {
            self.front = Arc::new(data);
            self.staging = None;
        }
    }

    fn begin_read(&mut self) -> Arc<Vec<u8>> {
        if self.readers == 0 {
            if let Some(staged) = self.staging.take() {
                self.front = staged;
            }
        }
        self.readers += 1;
        self.front.clone()
    }

    fn end_read(&mut self) {
        debug_assert!(self.readers > 0);
        self.readers -= 1;
    }
}

struct Slot {
    seg_count: u32,
    duration_ms: u32,
    cumulative_ms: u64,
    incomplete: bool,
    folded: bool,
    fragments: Vec<FragmentEntry>,
    content: Vec<u8>,
    buffer: DoubleBuffer,
}

impl Slot {
    /// Fragments shown in the listing. A folded trailing fragment keeps
    /// growing while the slot is incomplete, so it stays hidden until
    /// the segment is finalized.
    fn advertised_fragments(&self) -> usize {
        if self.incomplete && self.folded {
            self.fragments.len() - 1
        } else {
            self.fragments.len()
        }
    }
}

struct RingState {
    slots: Vec<Slot>,
    listing: DoubleBuffer,
    /// 0-based index of the next slot to overwrite (the oldest).
    next_slot: usize,
    incomplete_slot: Option<usize>,
    seg_counter: u32,
    cumulative_ms: u64,
    init_segment: Vec<u8>,
    end_list: bool,
}

/// Shared publisher state.
pub struct Ring {
    cfg: PublisherConfig,
    state: Mutex<RingState>,
    last_access_tick: AtomicU32,
    epoch: Instant,
}

impl Ring {
    pub fn new(cfg: PublisherConfig) -> Self {
        let name = cfg.with_name_blocks.then_some(cfg.seg_name.as_str());
        let slots = (0..cfg.slot_count)
            .map(|_| Slot {
                seg_count: SEGMENT_COUNT_EMPTY,
                duration_ms: 0,
                cumulative_ms: 0,
                incomplete: false,
                folded: false,
                fragments: Vec::new(),
                content: Vec::new(),
                buffer: DoubleBuffer::new(frame::segment_frame(
                    name,
                    SEGMENT_COUNT_EMPTY,
                    cfg.is_mp4,
                    &[],
                    &[],
                )),
            })
            .collect();
        let ring = Self {
            state: Mutex::new(RingState {
                slots,
                listing: DoubleBuffer::new(Vec::new()),
                next_slot: 0,
                incomplete_slot: None,
                seg_counter: 0,
                cumulative_ms: 0,
                init_segment: Vec::new(),
                end_list: false,
            }),
            last_access_tick: AtomicU32::new(0),
            epoch: Instant::now(),
            cfg,
        };
        let mut st = ring.state.lock();
        ring.rebuild_listing(&mut st);
        drop(st);
        ring
    }

    /// Listing plus slots.
    pub fn endpoint_count(&self) -> usize {
        self.cfg.slot_count + 1
    }

    pub fn seg_name(&self) -> &str {
        &self.cfg.seg_name
    }

    /// Publish one piece. A partial opens (or extends) an incomplete
    /// segment; a complete piece finalizes it or fills a fresh slot.
    pub fn publish(&self, piece: Piece) {
        let mut st = self.state.lock();
        let st = &mut *st;
        let idx = match st.incomplete_slot {
            Some(idx) => idx,
            None => {
                let idx = st.next_slot;
                st.next_slot = (st.next_slot + 1) % st.slots.len();
                st.seg_counter = st.seg_counter.wrapping_add(1);
                let slot = &mut st.slots[idx];
                slot.seg_count = st.seg_counter & 0xff_ffff;
                slot.duration_ms = 0;
                slot.incomplete = false;
                slot.folded = false;
                slot.fragments.clear();
                slot.content.clear();
                idx
            }
        };

        st.cumulative_ms += u64::from(piece.duration_ms);
        let slot = &mut st.slots[idx];
        slot.duration_ms += piece.duration_ms;
        slot.cumulative_ms = st.cumulative_ms;
        slot.content.extend_from_slice(&piece.body);
        slot.fragments.extend_from_slice(&piece.fragments);
        while slot.fragments.len() > MAX_FRAGMENTS_PER_SLOT {
            let extra = slot.fragments.remove(MAX_FRAGMENTS_PER_SLOT);
            let last = &mut slot.fragments[MAX_FRAGMENTS_PER_SLOT - 1];
            last.size += extra.size;
            last.duration_ms += extra.duration_ms;
            slot.folded = true;
        }
        slot.incomplete = !piece.complete;
        st.incomplete_slot = (!piece.complete).then_some(idx);

        let name = self.cfg.with_name_blocks.then_some(self.cfg.seg_name.as_str());
        let sizes: Vec<u32> = slot.fragments.iter().map(|f| f.size).collect();
        let data = frame::segment_frame(
            name,
            slot.seg_count,
            self.cfg.is_mp4,
            &sizes,
            &slot.content,
        );
        slot.buffer.write(data);
        tracing::debug!(
            slot = idx + 1,
            seg_count = slot.seg_count,
            complete = piece.complete,
            bytes = slot.content.len(),
            "published piece"
        );

        self.rebuild_listing(st);
    }

    /// Store the fMP4 init segment once and republish the listing.
    pub fn set_init_segment(&self, init: &[u8]) {
        if init.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        if st.init_segment.is_empty() {
            st.init_segment = init.to_vec();
            self.rebuild_listing(&mut st);
        }
    }

    /// Rewrite the listing with `end_list` set.
    pub fn finalize(&self) {
        let mut st = self.state.lock();
        st.end_list = true;
        self.rebuild_listing(&mut st);
    }

    pub fn all_slots_occupied(&self) -> bool {
        self.state
            .lock()
            .slots
            .iter()
            .all(|s| s.seg_count != SEGMENT_COUNT_EMPTY)
    }

    fn rebuild_listing(&self, st: &mut RingState) {
        let n = st.slots.len();
        let mut rows = Vec::with_capacity(n);
        let mut durations = Vec::new();
        for j in 0..n {
            let idx = (st.next_slot + j) % n;
            let slot = &st.slots[idx];
            let advertised = slot.advertised_fragments();
            rows.push(ListingRow {
                slot_index: (idx + 1) as u8,
                fragment_count: if self.cfg.is_mp4 { advertised as u16 } else { 0 },
                seg_count: slot.seg_count,
                duration_ms: slot.duration_ms,
                cumulative_centisec: (slot.cumulative_ms / 10) as u32,
            });
            if self.cfg.is_mp4 {
                durations.extend(slot.fragments[..advertised].iter().map(|f| f.duration_ms));
            }
        }
        let name = self.cfg.with_name_blocks.then_some(self.cfg.seg_name.as_str());
        let data = frame::listing_frame(
            name,
            unix_time_now(),
            st.end_list,
            st.incomplete_slot.is_some(),
            self.cfg.is_mp4,
            &rows,
            &durations,
            &st.init_segment,
        );
        st.listing.write(data);
    }

    /// Record reader activity for the access-timeout check.
    pub fn touch(&self) {
        self.last_access_tick.store(self.tick_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since a reader last touched any endpoint.
    pub fn millis_since_access(&self) -> u32 {
        self.tick_ms()
            .wrapping_sub(self.last_access_tick.load(Ordering::Relaxed))
    }

    fn tick_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Snapshot the front buffer of an endpoint (0 = listing) for a new
    /// reader, swapping in staged data when no other reader holds it.
    pub fn begin_read(&self, endpoint: usize) -> Arc<Vec<u8>> {
        let mut st = self.state.lock();
        if endpoint == 0 {
            st.listing.begin_read()
        } else {
            st.slots[endpoint - 1].buffer.begin_read()
        }
    }

    /// Release an endpoint's front buffer.
    pub fn end_read(&self, endpoint: usize) {
        let mut st = self.state.lock();
        if endpoint == 0 {
            st.listing.end_read()
        } else {
            st.slots[endpoint - 1].buffer.end_read()
        }
    }
}

fn unix_time_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
