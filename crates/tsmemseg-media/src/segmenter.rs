//! Keyframe-aligned TS segmentation.
//!
//! The segmenter accumulates 188-byte packets and decides where to cut
//! segments and partial segments (LL-HLS fragments) based on the PES
//! timestamps of the stream that governs keying: the first video stream
//! when present, the first ADTS audio stream otherwise.
//!
//! A cut does not emit the accumulated run verbatim. Packets are split
//! into a `front` (the emitted piece) and a `back` (carried forward) so
//! that every PES unit left open at the boundary travels whole into the
//! next segment, and so that one PAT and one PMT lead the emitted piece.

use std::collections::HashMap;
use std::mem;

use crate::ts::nal::NalScanner;
use crate::ts::psi::{Pat, Pmt};
use crate::ts::{self, pes, PACKET_SIZE};

const PTS_MOD: u64 = 1 << 33;

/// Wrap-safe 33-bit PTS difference `a - b`.
pub fn pts_diff(a: u64, b: u64) -> u64 {
    (a + PTS_MOD - b) & (PTS_MOD - 1)
}

/// Wrap-safe elapsed time from `b` to `a`; a backward jump reads as 0.
pub fn pts_elapsed(a: u64, b: u64) -> u64 {
    let d = pts_diff(a, b);
    if d >= 1 << 32 {
        0
    } else {
        d
    }
}

/// Segmentation targets and limits, all PTS values at 90 kHz.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Target duration of the first segment (short for fast startup).
    pub init_duration: u64,
    /// Target duration of every later segment.
    pub target_duration: u64,
    /// Partial-segment target duration; 0 disables partial cuts.
    pub partial_duration: u64,
    /// Ceiling on the accumulated unsegmented region.
    pub max_bytes: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            init_duration: 90_000,
            target_duration: 180_000,
            partial_duration: 45_000,
            max_bytes: 4096 * 1024,
        }
    }
}

/// How a cut was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutKind {
    /// A keyframe arrived past the segment target: the piece completes a
    /// segment.
    SegmentKey,
    /// The partial target elapsed past a mark: the piece extends the
    /// current (incomplete) segment.
    Partial,
    /// The size ceiling was hit without a usable keyframe.
    Forced,
}

/// One emitted piece.
#[derive(Debug)]
pub struct Cut {
    pub kind: CutKind,
    /// Reorganized packet run (whole 188-byte packets).
    pub packets: Vec<u8>,
    /// Piece duration in 90 kHz units (time since the previous cut).
    pub duration: u64,
}

#[derive(Debug, Clone, Copy)]
struct PidPositions {
    /// Offset in `packets` of this PID's most recent unit start.
    last_start: usize,
    /// `last_start` snapshot taken at each key-candidate unit start.
    before_key: usize,
    /// `last_start` snapshot taken when a partial mark is placed.
    before_marked: usize,
}

const UNSET: usize = usize::MAX;

/// Bring-to-front machine: 0 -> 1 on the first PAT, 1 -> 2 on the PMT
/// that follows it.
fn bring_state_advance(pid: u16, state: u8) -> u8 {
    match (pid, state) {
        (0, _) => 1,
        (_, 1) => 2,
        (_, s) => s,
    }
}

/// The segmentation state machine. Feed sync-checked 188-byte packets;
/// at most one [`Cut`] comes out per packet.
pub struct Segmenter {
    cfg: SegmenterConfig,
    pat: Pat,
    packets: Vec<u8>,
    positions: HashMap<u16, PidPositions>,
    key_pid: u16,
    nal: NalScanner,
    pts: u64,
    pts_primed: bool,
    last_seg_pts: u64,
    last_frag_pts: u64,
    marked_frag_pts: Option<u64>,
    target_duration: u64,
    first_key_seen: bool,
    first_audio_arrived: bool,
}

impl Segmenter {
    pub fn new(cfg: SegmenterConfig) -> Self {
        let target_duration = cfg.init_duration;
        Self {
            cfg,
            pat: Pat::default(),
            packets: Vec::new(),
            positions: HashMap::new(),
            key_pid: 0,
            nal: NalScanner::new(),
            pts: 0,
            pts_primed: false,
            last_seg_pts: 0,
            last_frag_pts: 0,
            marked_frag_pts: None,
            target_duration,
            first_key_seen: false,
            first_audio_arrived: false,
        }
    }

    /// Latest PAT (and through it the PMT) seen on the stream.
    pub fn pat(&self) -> &Pat {
        &self.pat
    }

    pub fn pmt(&self) -> &Pmt {
        &self.pat.first_pmt
    }

    /// Elapsed 90 kHz time between the newest seen PTS and the last cut.
    /// Used by the read-rate pacer.
    pub fn pending_duration(&self) -> u64 {
        if !self.pts_primed {
            return 0;
        }
        pts_elapsed(self.pts, self.last_frag_pts)
    }

    /// Bytes accumulated toward the next cut.
    pub fn buffered_bytes(&self) -> usize {
        self.packets.len()
    }

    /// Feed one 188-byte packet (sync byte already verified).
    pub fn push(&mut self, packet: &[u8]) -> Option<Cut> {
        debug_assert_eq!(packet.len(), PACKET_SIZE);
        let unit_start = ts::unit_start(packet);
        let pid = ts::pid(packet);
        let counter = ts::counter(packet);
        let payload = ts::payload(packet);

        if unit_start {
            let pos = self.packets.len();
            self.positions
                .entry(pid)
                .or_insert(PidPositions {
                    last_start: pos,
                    before_key: UNSET,
                    before_marked: UNSET,
                })
                .last_start = pos;
        }

        let mut is_key = false;
        let pmt_pid = self.pat.first_pmt.pmt_pid;
        let video = self.pat.first_pmt.first_video;
        let audio_pid = self.pat.first_pmt.first_adts_audio_pid;

        if pid == 0 {
            self.pat.feed(payload, unit_start, counter);
        } else if pmt_pid != 0 && pid == pmt_pid {
            self.pat.first_pmt.feed(payload, unit_start, counter);
        } else if let Some((video_pid, codec)) = video {
            if pid == video_pid {
                if unit_start {
                    self.on_key_unit_start(pid);
                    if let Some(header) = pes::parse_header(payload) {
                        if let Some(pts) = header.pts {
                            self.update_pts(pts);
                        }
                        if payload.len() > header.payload_offset
                            && self
                                .nal
                                .scan(&payload[header.payload_offset..], codec)
                        {
                            is_key = self.arm_key();
                        }
                    }
                } else if pid == self.key_pid && self.nal.scan(payload, codec) {
                    is_key = self.arm_key();
                }
            } else if Some(pid) == audio_pid && unit_start {
                self.first_audio_arrived = true;
            }
        } else if let Some(audio_pid) = audio_pid {
            // No video stream: the audio stream governs segmentation and
            // every PES start is a key candidate.
            if pid == audio_pid && unit_start {
                self.first_audio_arrived = true;
                self.on_key_unit_start(pid);
                if let Some(header) = pes::parse_header(payload) {
                    if let Some(pts) = header.pts {
                        self.update_pts(pts);
                    }
                }
                is_key = self.arm_key();
            }
        }

        let at_key_unit_start = unit_start && pid == self.key_pid && self.key_pid != 0;
        let force = self.packets.len() + PACKET_SIZE > self.cfg.max_bytes;
        let cut = self.classify(is_key, at_key_unit_start, force);

        self.packets.extend_from_slice(packet);
        cut
    }

    /// Shared unit-start bookkeeping for the keying PID: snapshot every
    /// PID's last start, rearm the NAL scanner, and place a partial mark
    /// when the partial target has elapsed.
    fn on_key_unit_start(&mut self, pid: u16) {
        for entry in self.positions.values_mut() {
            entry.before_key = entry.last_start;
        }
        self.key_pid = pid;
        self.nal.reset();
    }

    fn update_pts(&mut self, pts: u64) {
        self.pts = pts;
        if !self.pts_primed {
            self.last_seg_pts = pts;
            self.last_frag_pts = pts;
            self.pts_primed = true;
        }
        self.try_place_mark();
    }

    fn try_place_mark(&mut self) {
        if self.cfg.partial_duration == 0 || self.marked_frag_pts.is_some() {
            return;
        }
        // Never open a partial before audio has started, or the leading
        // partials of a program with audio would be silent.
        if self.pat.first_pmt.first_adts_audio_pid.is_some() && !self.first_audio_arrived {
            return;
        }
        if pts_elapsed(self.pts, self.last_frag_pts) >= self.cfg.partial_duration {
            self.marked_frag_pts = Some(self.pts);
            for entry in self.positions.values_mut() {
                entry.before_marked = entry.last_start;
            }
        }
    }

    /// The first IRAP of the stream only arms the machine; the stream
    /// start is already a boundary.
    fn arm_key(&mut self) -> bool {
        let is_key = self.first_key_seen;
        self.first_key_seen = true;
        is_key
    }

    fn classify(&mut self, is_key: bool, at_key_unit_start: bool, force: bool) -> Option<Cut> {
        if is_key && self.pts_primed
            && pts_elapsed(self.pts, self.last_seg_pts) >= self.target_duration
        {
            let duration = pts_elapsed(self.pts, self.last_frag_pts);
            let key_pos = self.key_position(false);
            let front = self.split_at_key(key_pos, false);
            self.last_seg_pts = self.pts;
            self.last_frag_pts = self.pts;
            self.target_duration = self.cfg.target_duration;
            self.marked_frag_pts = None;
            self.positions.clear();
            return Some(Cut {
                kind: CutKind::SegmentKey,
                packets: front,
                duration,
            });
        }
        if at_key_unit_start && self.cfg.partial_duration > 0 {
            if let Some(marked) = self.marked_frag_pts {
                // A quarter of the partial target keeps the trailing
                // fragment from being uselessly small.
                if pts_elapsed(self.pts, marked) >= self.cfg.partial_duration / 4 {
                    let duration = pts_elapsed(marked, self.last_frag_pts);
                    let key_pos = self.key_position(true);
                    let front = self.split_at_key(key_pos, true);
                    self.last_frag_pts = marked;
                    self.marked_frag_pts = None;
                    self.positions.clear();
                    return Some(Cut {
                        kind: CutKind::Partial,
                        packets: front,
                        duration,
                    });
                }
            }
        }
        if force {
            let duration = pts_elapsed(self.pts, self.last_frag_pts);
            let front = mem::take(&mut self.packets);
            self.last_seg_pts = self.pts;
            self.last_frag_pts = self.pts;
            self.target_duration = self.cfg.target_duration;
            self.marked_frag_pts = None;
            self.positions.clear();
            return Some(Cut {
                kind: CutKind::Forced,
                packets: front,
                duration,
            });
        }
        None
    }

    fn key_position(&self, use_marked: bool) -> usize {
        self.positions
            .get(&self.key_pid)
            .map(|e| if use_marked { e.before_marked } else { e.before_key })
            .unwrap_or(UNSET)
            .min(self.packets.len())
    }

    /// Walk the accumulated run once, splitting it at `key_pos` into the
    /// emitted front and the carried back. One PAT and then one PMT are
    /// brought to the very front; for every other PID, packets at or past
    /// its earliest relevant unit start travel to the back so no PES unit
    /// is split across the boundary.
    fn split_at_key(&mut self, key_pos: usize, use_marked: bool) -> Vec<u8> {
        let pmt_pid = self.pat.first_pmt.pmt_pid;
        let mut front = Vec::with_capacity(key_pos + 2 * PACKET_SIZE);
        let mut back = Vec::with_capacity(self.packets.len() - key_pos.min(self.packets.len()));

        let mut bring_state = 0u8;
        let mut i = 0;
        while i < self.packets.len() && i < key_pos && bring_state < 2 {
            let packet = &self.packets[i..i + PACKET_SIZE];
            let p = ts::pid(packet);
            if p == 0 || p == pmt_pid {
                bring_state = bring_state_advance(p, bring_state);
                front.extend_from_slice(packet);
            }
            i += PACKET_SIZE;
        }

        let mut bring_state = 0u8;
        let mut i = 0;
        while i < self.packets.len() {
            let packet = &self.packets[i..i + PACKET_SIZE];
            if i < key_pos {
                let p = ts::pid(packet);
                if (p == 0 || p == pmt_pid) && bring_state < 2 {
                    bring_state = bring_state_advance(p, bring_state);
                    // Already placed at the front.
                } else {
                    let earliest = self
                        .positions
                        .get(&p)
                        .map(|e| {
                            let snap = if use_marked { e.before_marked } else { e.before_key };
                            e.last_start.min(snap)
                        })
                        .unwrap_or(UNSET);
                    if i < earliest {
                        front.extend_from_slice(packet);
                    } else {
                        back.extend_from_slice(packet);
                    }
                }
            } else {
                back.extend_from_slice(packet);
            }
            i += PACKET_SIZE;
        }

        self.packets = back;
        front
    }

    /// Drain whatever is buffered as the final (complete) piece at end of
    /// stream. The tail is a real segment, so one PAT and then one PMT
    /// lead it exactly as a key cut's front does; nothing is carried.
    pub fn flush(&mut self) -> Option<Cut> {
        if self.packets.is_empty() {
            return None;
        }
        let duration = self.pending_duration();
        let pmt_pid = self.pat.first_pmt.pmt_pid;
        let packets = mem::take(&mut self.packets);

        let mut front = Vec::with_capacity(packets.len() + 2 * PACKET_SIZE);
        let mut bring_state = 0u8;
        let mut i = 0;
        while i < packets.len() && bring_state < 2 {
            let packet = &packets[i..i + PACKET_SIZE];
            let p = ts::pid(packet);
            if p == 0 || p == pmt_pid {
                bring_state = bring_state_advance(p, bring_state);
                front.extend_from_slice(packet);
            }
            i += PACKET_SIZE;
        }
        let mut bring_state = 0u8;
        let mut i = 0;
        while i < packets.len() {
            let packet = &packets[i..i + PACKET_SIZE];
            let p = ts::pid(packet);
            if (p == 0 || p == pmt_pid) && bring_state < 2 {
                bring_state = bring_state_advance(p, bring_state);
                // Already placed at the front.
            } else {
                front.extend_from_slice(packet);
            }
            i += PACKET_SIZE;
        }

        self.positions.clear();
        self.marked_frag_pts = None;
        self.last_seg_pts = self.pts;
        self.last_frag_pts = self.pts;
        Some(Cut {
            kind: CutKind::SegmentKey,
            packets: front,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{packetize_pes, pat_section, pes_packet, pmt_section, section_packet};
    use crate::ts::{STREAM_TYPE_ADTS, STREAM_TYPE_AVC};

    const PMT_PID: u16 = 0x1000;
    const VIDEO_PID: u16 = 0x100;
    const AUDIO_PID: u16 = 0x110;
    const FRAME: u64 = 3000; // 30 fps at 90 kHz

    /// Builds an interleaved synthetic stream and feeds it.
    struct Harness {
        seg: Segmenter,
        cuts: Vec<Cut>,
        fed_bytes: usize,
        counters: [u8; 4], // pat, pmt, video, audio
    }

    impl Harness {
        fn new(cfg: SegmenterConfig) -> Self {
            Self {
                seg: Segmenter::new(cfg),
                cuts: Vec::new(),
                fed_bytes: 0,
                counters: [0; 4],
            }
        }

        fn feed(&mut self, packet: &[u8; PACKET_SIZE]) {
            self.fed_bytes += PACKET_SIZE;
            if let Some(cut) = self.seg.push(packet) {
                self.cuts.push(cut);
            }
        }

        fn push_psi(&mut self, pmt_streams: &[(u8, u16)]) {
            self.push_psi_with_pmt_pid(PMT_PID, pmt_streams);
        }

        fn push_psi_with_pmt_pid(&mut self, pmt_pid: u16, pmt_streams: &[(u8, u16)]) {
            let pat = section_packet(0, self.counters[0], &pat_section(pmt_pid));
            self.counters[0] = (self.counters[0] + 1) & 0x0f;
            self.feed(&pat);
            let pmt = section_packet(pmt_pid, self.counters[1], &pmt_section(pmt_streams));
            self.counters[1] = (self.counters[1] + 1) & 0x0f;
            self.feed(&pmt);
        }

        fn push_video_frame(&mut self, pts: u64, idr: bool) {
            let mut es = vec![0x00, 0x00, 0x00, 0x01, if idr { 0x65 } else { 0x41 }];
            es.resize(200, 0xaa); // spill into a second TS packet
            let pes = pes_packet(0xe0, Some(pts), None, &es, false);
            let (packets, next) = packetize_pes(VIDEO_PID, self.counters[2], &pes);
            self.counters[2] = next;
            for p in &packets {
                self.feed(p);
            }
        }

        fn push_audio_frame(&mut self, pts: u64) {
            let es = [0x55u8; 64];
            let pes = pes_packet(0xc0, Some(pts), None, &es, true);
            let (packets, next) = packetize_pes(AUDIO_PID, self.counters[3], &pes);
            self.counters[3] = next;
            for p in &packets {
                self.feed(p);
            }
        }

        fn emitted_bytes(&self) -> usize {
            self.cuts.iter().map(|c| c.packets.len()).sum()
        }
    }

    fn cfg_no_partials(target: u64) -> SegmenterConfig {
        SegmenterConfig {
            init_duration: target,
            target_duration: target,
            partial_duration: 0,
            max_bytes: 64 * 1024 * 1024,
        }
    }

    /// 10 s of 30 fps AVC with an IDR every 2 s, audio alongside.
    fn run_basic_stream(cfg: SegmenterConfig) -> Harness {
        let mut h = Harness::new(cfg);
        for frame in 0..300u64 {
            if frame % 15 == 0 {
                h.push_psi(&[(STREAM_TYPE_AVC, VIDEO_PID), (STREAM_TYPE_ADTS, AUDIO_PID)]);
            }
            h.push_video_frame(frame * FRAME, frame % 60 == 0);
            if frame % 3 == 0 {
                h.push_audio_frame(frame * FRAME);
            }
        }
        h
    }

    #[test]
    fn test_segment_cuts_every_two_seconds() {
        let mut h = run_basic_stream(cfg_no_partials(180_000));
        assert_eq!(h.cuts.len(), 4);
        assert!(h.cuts.iter().all(|c| c.kind == CutKind::SegmentKey));
        for cut in &h.cuts {
            assert_eq!(cut.duration, 180_000);
        }
        let tail = h.seg.flush().unwrap();
        assert_eq!(tail.duration, (299 - 240) * FRAME);
        // Every fed packet comes out exactly once.
        assert_eq!(h.emitted_bytes() + tail.packets.len(), h.fed_bytes);
    }

    #[test]
    fn test_key_alignment_pat_pmt_key() {
        // Video-only program: nothing but PSI can precede the key
        // access unit, so the ordering is exact for every piece, the
        // flushed tail included.
        let mut h = Harness::new(cfg_no_partials(180_000));
        for frame in 0..300u64 {
            if frame % 15 == 0 {
                h.push_psi(&[(STREAM_TYPE_AVC, VIDEO_PID)]);
            }
            h.push_video_frame(frame * FRAME, frame % 60 == 0);
        }
        let tail = h.seg.flush().unwrap();
        let mut pieces: Vec<&Cut> = h.cuts.iter().collect();
        pieces.push(&tail);
        assert_eq!(pieces.len(), 5);
        for cut in pieces {
            let front = &cut.packets;
            assert!(front.len() >= 3 * PACKET_SIZE);
            assert_eq!(ts::pid(&front[..PACKET_SIZE]), 0, "first packet is PAT");
            assert_eq!(
                ts::pid(&front[PACKET_SIZE..2 * PACKET_SIZE]),
                PMT_PID,
                "second packet is PMT"
            );
            let third = &front[2 * PACKET_SIZE..3 * PACKET_SIZE];
            assert_eq!(ts::pid(third), VIDEO_PID);
            assert!(ts::unit_start(third), "third packet starts the key unit");
        }
    }

    #[test]
    fn test_key_alignment_with_interleaved_audio() {
        // With audio, the last audio PES before the boundary is carried
        // and can sit between the PMT and the key access unit; PAT and
        // PMT still lead, and the first video packet is the key start.
        let mut h = run_basic_stream(cfg_no_partials(180_000));
        let tail = h.seg.flush().unwrap();
        let mut pieces: Vec<&Cut> = h.cuts.iter().collect();
        pieces.push(&tail);
        for cut in pieces {
            let front = &cut.packets;
            assert_eq!(ts::pid(&front[..PACKET_SIZE]), 0, "first packet is PAT");
            assert_eq!(
                ts::pid(&front[PACKET_SIZE..2 * PACKET_SIZE]),
                PMT_PID,
                "second packet is PMT"
            );
            let first_video = front
                .chunks(PACKET_SIZE)
                .find(|p| ts::pid(p) == VIDEO_PID)
                .expect("piece carries video");
            assert!(
                ts::unit_start(first_video),
                "video payload starts at the key unit"
            );
        }
    }

    #[test]
    fn test_no_packet_is_split_or_duplicated() {
        let mut h = run_basic_stream(cfg_no_partials(180_000));
        let tail = h.seg.flush().unwrap();
        let mut emitted: Vec<&[u8]> = Vec::new();
        for cut in &h.cuts {
            assert_eq!(cut.packets.len() % PACKET_SIZE, 0);
            emitted.extend(cut.packets.chunks(PACKET_SIZE));
        }
        emitted.extend(tail.packets.chunks(PACKET_SIZE));
        assert_eq!(emitted.len() * PACKET_SIZE, h.fed_bytes);
        for p in emitted {
            assert_eq!(p[0], 0x47);
        }
    }

    #[test]
    fn test_partial_cuts_between_keys() {
        let cfg = SegmenterConfig {
            init_duration: 180_000,
            target_duration: 180_000,
            partial_duration: 45_000,
            max_bytes: 64 * 1024 * 1024,
        };
        let h = run_basic_stream(cfg);
        let kinds: Vec<CutKind> = h.cuts.iter().map(|c| c.kind).collect();
        // Three 500 ms partials then the key piece, repeated per segment.
        assert_eq!(kinds[..4], [
            CutKind::Partial,
            CutKind::Partial,
            CutKind::Partial,
            CutKind::SegmentKey,
        ]);
        for cut in &h.cuts {
            assert_eq!(cut.duration, 45_000);
        }
        // Piece durations per segment sum to the segment target.
        let seg_total: u64 = h.cuts[..4].iter().map(|c| c.duration).sum();
        assert_eq!(seg_total, 180_000);
    }

    #[test]
    fn test_forced_cut_on_size_ceiling() {
        let cfg = SegmenterConfig {
            init_duration: 180_000,
            target_duration: 180_000,
            partial_duration: 0,
            max_bytes: 16 * PACKET_SIZE,
        };
        let mut h = Harness::new(cfg);
        h.push_psi(&[(STREAM_TYPE_AVC, VIDEO_PID)]);
        // One IDR to arm, then key-less frames to overflow the ceiling.
        for frame in 0..20u64 {
            h.push_video_frame(frame * FRAME, frame == 0);
        }
        assert!(h.cuts.iter().any(|c| c.kind == CutKind::Forced));
        assert!(h.cuts.iter().all(|c| c.kind == CutKind::Forced));
    }

    #[test]
    fn test_pmt_change_reemitted_after_switch() {
        let new_pmt_pid = 0x1100;
        let mut h = Harness::new(cfg_no_partials(90_000));
        for frame in 0..120u64 {
            if frame % 15 == 0 {
                // The PAT points at a different PMT PID from 2 s onward.
                let pmt_pid = if frame < 60 { PMT_PID } else { new_pmt_pid };
                h.push_psi_with_pmt_pid(pmt_pid, &[(STREAM_TYPE_AVC, VIDEO_PID)]);
            }
            h.push_video_frame(frame * FRAME, frame % 30 == 0);
        }
        assert_eq!(h.cuts.len(), 3);
        let last = h.cuts.last().unwrap();
        assert_eq!(ts::pid(&last.packets[..PACKET_SIZE]), 0);
        assert_eq!(
            ts::pid(&last.packets[PACKET_SIZE..2 * PACKET_SIZE]),
            new_pmt_pid,
            "segment after the switch carries the new PMT"
        );
    }

    #[test]
    fn test_audio_governs_when_no_video() {
        let mut h = Harness::new(cfg_no_partials(90_000));
        h.push_psi(&[(STREAM_TYPE_ADTS, AUDIO_PID)]);
        // One audio PES every 24 ms.
        for i in 0..200u64 {
            h.push_audio_frame(i * 2160);
        }
        assert!(!h.cuts.is_empty());
        assert!(h.cuts.iter().all(|c| c.kind == CutKind::SegmentKey));
        for cut in &h.cuts {
            assert!(cut.duration >= 90_000);
        }
    }

    #[test]
    fn test_backward_pts_jump_reads_as_zero() {
        let mut h = Harness::new(cfg_no_partials(90_000));
        h.push_psi(&[(STREAM_TYPE_AVC, VIDEO_PID)]);
        h.push_video_frame(500_000, true);
        // PTS jumps backwards; elapsed must clamp to zero, not wrap huge.
        h.push_video_frame(100_000, true);
        assert!(h.cuts.is_empty());
        assert_eq!(h.seg.pending_duration(), 0);
    }

    #[test]
    fn test_wrap_safe_elapsed() {
        assert_eq!(pts_elapsed(10, (1 << 33) - 10), 20);
        assert_eq!(pts_elapsed(0, 1), 0);
        assert_eq!(pts_diff(0, 1), (1 << 33) - 1);
    }
}
