//! End-to-end pipeline tests: synthetic TS in, published frames out.

mod common;

use common::*;
use std::io::Cursor;
use std::sync::Arc;

use tsmemseg::driver::{self, DriverConfig, Stats};
use tsmemseg::filter::Passthrough;
use tsmemseg::publisher::{PublisherConfig, Ring};
use tsmemseg::shutdown::Shutdown;

fn driver_cfg(is_mp4: bool, target_ms: u32, partial_ms: u32, max_kbytes: usize) -> DriverConfig {
    DriverConfig {
        is_mp4,
        init_duration_ms: target_ms,
        target_duration_ms: target_ms,
        partial_duration_ms: partial_ms,
        access_timeout_ms: 0,
        read_rate_per_mille: 0,
        fill_read_rate_per_mille: 0,
        max_bytes: max_kbytes * 1024,
    }
}

fn run_pipeline(stream: Vec<u8>, cfg: &DriverConfig, slots: usize) -> (Arc<Ring>, Stats) {
    let ring = Arc::new(Ring::new(PublisherConfig {
        seg_name: "itest".into(),
        slot_count: slots,
        is_mp4: cfg.is_mp4,
        with_name_blocks: false,
    }));
    let shutdown = Shutdown::new();
    let mut filter = Passthrough::new();
    let mut input = Cursor::new(stream);
    let stats = driver::run(cfg, &mut input, &mut filter, &ring, &shutdown);
    (ring, stats)
}

fn read_listing(ring: &Ring) -> Vec<u8> {
    let listing = ring.begin_read(0).to_vec();
    ring.end_read(0);
    listing
}

fn read_slot(ring: &Ring, slot_index: u8) -> Vec<u8> {
    let seg = ring.begin_read(usize::from(slot_index)).to_vec();
    ring.end_read(usize::from(slot_index));
    seg
}

fn listing_rows(listing: &[u8]) -> Vec<&[u8]> {
    listing[16..16 * (1 + usize::from(listing[0]))].chunks(16).collect()
}

fn row_seg_number(row: &[u8]) -> u32 {
    u32::from_le_bytes(row[4..8].try_into().unwrap()) & 0xff_ffff
}

fn row_duration_ms(row: &[u8]) -> u32 {
    u32::from_le_bytes(row[8..12].try_into().unwrap())
}

/// 10 s of 30 fps AVC with a 2 s IDR cadence, TS mode, four slots.
#[test]
fn test_ts_mode_two_second_segments() {
    let stream = StreamBuilder::basic_program(10, 60);
    let (ring, stats) = run_pipeline(stream, &driver_cfg(false, 2000, 0, 4096), 4);
    assert_eq!(stats.sync_errors, 0);
    assert_eq!(stats.forced_segmentations, 0);

    let listing = read_listing(&ring);
    assert_eq!(listing[0], 4);
    assert_eq!(listing[8], 1, "end_list set at EOF");
    assert_eq!(listing[10], 0, "TS mode");

    let rows = listing_rows(&listing);
    // Five segments went through four slots: 2..=5 remain, oldest first.
    let numbers: Vec<u32> = rows.iter().map(|r| row_seg_number(r)).collect();
    assert_eq!(numbers, vec![2, 3, 4, 5]);
    assert!(rows.iter().all(|r| r[7] == 0), "all slots available");

    for row in &rows[..3] {
        let d = row_duration_ms(row);
        assert!((1966..=2034).contains(&d), "duration {d} out of range");
    }
    // The tail segment covers the last 59 frames.
    assert_eq!(row_duration_ms(rows[3]), 59 * 3000 / 90);

    // Total stream time in centiseconds on the newest row.
    let cumulative = u32::from_le_bytes(rows[3][12..16].try_into().unwrap());
    let total: u32 = rows.iter().map(|r| row_duration_ms(r)).sum::<u32>() + 2000; // plus the evicted first segment
    assert!((cumulative * 10).abs_diff(total) < 10);
}

#[test]
fn test_ts_mode_key_alignment_on_wire() {
    let stream = StreamBuilder::video_program(10, 60);
    let (ring, _) = run_pipeline(stream, &driver_cfg(false, 2000, 0, 4096), 4);
    let listing = read_listing(&ring);
    let rows = listing_rows(&listing);

    // A mid-stream key-cut segment and the EOF tail alike: PAT, PMT,
    // then the key video unit start right after the header packet.
    for row in [rows[1], rows[3]] {
        let seg = read_slot(&ring, row[0]);
        let header = &seg[..PACKET_SIZE];
        assert_eq!(&header[..4], &[0x47, 0x01, 0xff, 0x10]);
        assert_eq!(
            u32::from_le_bytes(header[4..8].try_into().unwrap()),
            row_seg_number(row)
        );
        let units = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        assert_eq!(seg.len(), PACKET_SIZE * (1 + units));

        let pid_of = |p: &[u8]| (u16::from(p[1] & 0x1f) << 8) | u16::from(p[2]);
        let body = &seg[PACKET_SIZE..];
        assert_eq!(pid_of(&body[..PACKET_SIZE]), 0, "PAT first");
        assert_eq!(pid_of(&body[PACKET_SIZE..2 * PACKET_SIZE]), PMT_PID, "PMT second");
        let third = &body[2 * PACKET_SIZE..3 * PACKET_SIZE];
        assert_eq!(pid_of(third), VIDEO_PID);
        assert!(third[1] & 0x40 != 0, "key unit start third");
    }
}

/// Same stream in fMP4 mode with 500 ms partials.
#[test]
fn test_mp4_mode_partials_and_init_segment() {
    let stream = StreamBuilder::basic_program(10, 60);
    let (ring, stats) = run_pipeline(stream, &driver_cfg(true, 2000, 500, 4096), 4);
    assert_eq!(stats.forced_segmentations, 0);

    let listing = read_listing(&ring);
    assert_eq!(listing[10], 1, "MP4 mode");
    let rows = listing_rows(&listing);

    // Four 500 ms fragments per segment.
    let counts: Vec<u16> = rows
        .iter()
        .map(|r| u16::from_le_bytes(r[2..4].try_into().unwrap()))
        .collect();
    assert_eq!(counts, vec![4, 4, 4, 4]);

    // Extra area: one 16-byte record per fragment, then ftyp+moov.
    let extra_len = u32::from_le_bytes(listing[12..16].try_into().unwrap()) as usize;
    let record_count: usize = counts.iter().map(|&c| usize::from(c)).sum();
    let extra_at = 16 * (1 + rows.len());
    assert_eq!(listing.len(), extra_at + extra_len);
    let init_at = extra_at + 16 * record_count;
    assert_eq!(&listing[init_at + 4..init_at + 8], b"ftyp");
    assert!(listing[init_at..].windows(4).any(|w| w == b"moov"));

    // Fragment durations within each key-cut slot sum to the slot
    // duration. (The EOF tail's last sample runs past its cut PTS, so
    // the newest row is exempt.)
    let mut record_at = extra_at;
    for (i, row) in rows.iter().enumerate() {
        let count = u16::from_le_bytes(row[2..4].try_into().unwrap());
        let mut sum = 0u32;
        for _ in 0..count {
            sum += u32::from_le_bytes(listing[record_at..record_at + 4].try_into().unwrap());
            record_at += 16;
        }
        if i + 1 < rows.len() {
            assert!(sum.abs_diff(row_duration_ms(row)) <= 1, "fragment sum property");
        }
    }

    // Segment bodies are moof/mdat runs, sized by the header table.
    let row = rows[1];
    let seg = read_slot(&ring, row[0]);
    let header = &seg[..PACKET_SIZE];
    assert_eq!(header[12], 1);
    let body_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    assert_eq!(seg.len(), PACKET_SIZE + body_len);
    let mut table_sum = 0usize;
    let mut at = 32;
    loop {
        let size = u32::from_le_bytes(header[at..at + 4].try_into().unwrap()) as usize;
        if size == 0 {
            break;
        }
        table_sum += size;
        at += 4;
    }
    assert_eq!(table_sum, body_len, "fragment sizes cover the body");
    assert_eq!(&seg[PACKET_SIZE + 4..PACKET_SIZE + 8], b"moof");
}

/// Sparse IDRs with a small size ceiling force segmentation.
#[test]
fn test_forced_segmentation_on_size_cap() {
    let stream = StreamBuilder::basic_program(10, 150);
    let (ring, stats) = run_pipeline(stream, &driver_cfg(false, 2000, 0, 32), 4);
    assert!(stats.forced_segmentations > 0);
    let listing = read_listing(&ring);
    assert!(listing_rows(&listing).iter().any(|r| r[7] == 0));
}

#[test]
fn test_sync_errors_are_counted_and_skipped() {
    let mut stream = StreamBuilder::basic_program(2, 30);
    stream[5 * PACKET_SIZE] = 0x00; // corrupt one sync byte
    let (_, stats) = run_pipeline(stream, &driver_cfg(false, 1000, 0, 4096), 4);
    assert_eq!(stats.sync_errors, 1);
}

/// ID3 PES turns into emsg boxes in the published fMP4 stream.
#[test]
fn test_id3_metadata_reaches_published_segments() {
    let mut b = StreamBuilder::new();
    for frame in 0..120u64 {
        if frame % 15 == 0 {
            b.psi(&[
                (STREAM_TYPE_AVC, VIDEO_PID),
                (STREAM_TYPE_ADTS, AUDIO_PID),
                (STREAM_TYPE_ID3, ID3_PID),
            ]);
        }
        b.video_frame(frame * 3000, frame % 30 == 0);
        if frame % 3 == 0 {
            b.audio_frame(frame * 3000);
        }
        if frame % 30 == 15 {
            b.id3_frame(frame * 3000);
        }
    }
    let (ring, _) = run_pipeline(b.bytes, &driver_cfg(true, 1000, 500, 4096), 4);

    let listing = read_listing(&ring);
    let rows = listing_rows(&listing);
    let scheme = b"https://aomedia.org/emsg/ID3";
    let found = rows.iter().any(|row| {
        row[7] == 0 && {
            let seg = read_slot(&ring, row[0]);
            seg.windows(4).any(|w| w == b"emsg")
                && seg.windows(scheme.len()).any(|w| w == scheme)
        }
    });
    assert!(found, "emsg with the ID3 scheme is published");
}
