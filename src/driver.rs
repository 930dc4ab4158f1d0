//! The pipeline driver: read loop, read-rate pacing and cut dispatch.

use std::io::Read;
use std::time::{Duration, Instant};

use tsmemseg_media::segmenter::{Cut, CutKind, Segmenter, SegmenterConfig};
use tsmemseg_media::ts::{self, PACKET_SIZE};
use tsmemseg_media::Fragmenter;

use crate::filter::PacketFilter;
use crate::publisher::{FragmentEntry, Piece, Ring};
use crate::shutdown::Shutdown;

/// Driver settings, durations in milliseconds.
pub struct DriverConfig {
    pub is_mp4: bool,
    pub init_duration_ms: u32,
    pub target_duration_ms: u32,
    pub partial_duration_ms: u32,
    /// 0 disables the access timeout.
    pub access_timeout_ms: u32,
    /// Steady-state read rate in per-mille of real time; 0 = unpaced.
    pub read_rate_per_mille: u32,
    /// Read rate used until every slot holds a segment.
    pub fill_read_rate_per_mille: u32,
    pub max_bytes: usize,
}

/// Counters reported on exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub sync_errors: u64,
    pub forced_segmentations: u64,
}

const PACING_SLEEP: Duration = Duration::from_millis(10);
const DRAIN_SLEEP: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = PACKET_SIZE * 16;

/// Drive the whole pipeline until EOF, access timeout or shutdown. The
/// listing is finalized with `end_list` before returning; the caller
/// still owns worker shutdown and endpoint teardown.
pub fn run(
    cfg: &DriverConfig,
    input: &mut dyn Read,
    filter: &mut dyn PacketFilter,
    ring: &Ring,
    shutdown: &Shutdown,
) -> Stats {
    let mut stats = Stats::default();
    let mut seg = Segmenter::new(SegmenterConfig {
        init_duration: u64::from(cfg.init_duration_ms) * 90,
        target_duration: u64::from(cfg.target_duration_ms) * 90,
        partial_duration: u64::from(cfg.partial_duration_ms) * 90,
        max_bytes: cfg.max_bytes,
    });
    let mut fragmenter = cfg.is_mp4.then(Fragmenter::new);

    let mut rate = cfg.fill_read_rate_per_mille;
    let mut base = Instant::now();
    let mut entire_ms: u64 = 0;
    let mut residual_90k: u64 = 0;
    let mut buf = [0u8; READ_CHUNK];
    let mut fill = 0usize;
    let mut timed_out = false;

    'read: loop {
        // Pacing and access-timeout checks before each read.
        loop {
            if shutdown.is_signaled() {
                break 'read;
            }
            if cfg.access_timeout_ms != 0
                && ring.millis_since_access() >= cfg.access_timeout_ms
            {
                tracing::info!("no reader activity, stopping");
                timed_out = true;
                break 'read;
            }
            if rate != cfg.read_rate_per_mille && ring.all_slots_occupied() {
                // The ring is full: drop from the fill rate to the
                // steady rate and rebase the wall clock.
                rate = cfg.read_rate_per_mille;
                base = Instant::now();
                entire_ms = 0;
            }
            if rate > 0 {
                let pending_ms = seg.pending_duration() / 90;
                let elapsed_ms = base.elapsed().as_millis() as u64;
                if entire_ms + pending_ms > elapsed_ms * u64::from(rate) / 1000 {
                    if shutdown.wait_timeout(PACING_SLEEP) {
                        break 'read;
                    }
                    continue;
                }
            }
            break;
        }

        let n = match input.read(&mut buf[fill..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("input read failed: {e}");
                break;
            }
        };
        fill += n;

        let whole = fill / PACKET_SIZE * PACKET_SIZE;
        for packet in buf[..whole].chunks_exact(PACKET_SIZE) {
            if ts::sync_byte(packet) != ts::SYNC_BYTE {
                // Resynchronization is intentionally not implemented.
                stats.sync_errors += 1;
                continue;
            }
            filter.push(packet);
        }
        for packet in filter.output().chunks_exact(PACKET_SIZE) {
            if let Some(cut) = seg.push(packet) {
                handle_cut(
                    cut,
                    &seg,
                    fragmenter.as_mut(),
                    ring,
                    &mut stats,
                    &mut entire_ms,
                    &mut residual_90k,
                );
            }
        }
        filter.clear();

        buf.copy_within(whole..fill, 0);
        fill -= whole;
    }

    if !timed_out && !shutdown.is_signaled() {
        // Publish whatever the stream left unfinished.
        if let Some(cut) = seg.flush() {
            handle_cut(
                cut,
                &seg,
                fragmenter.as_mut(),
                ring,
                &mut stats,
                &mut entire_ms,
                &mut residual_90k,
            );
        }
    }
    ring.finalize();

    // Keep serving until the readers go quiet.
    while cfg.access_timeout_ms != 0 && ring.millis_since_access() < cfg.access_timeout_ms {
        if shutdown.wait_timeout(DRAIN_SLEEP) {
            break;
        }
    }
    stats
}

fn handle_cut(
    cut: Cut,
    seg: &Segmenter,
    fragmenter: Option<&mut Fragmenter>,
    ring: &Ring,
    stats: &mut Stats,
    entire_ms: &mut u64,
    residual_90k: &mut u64,
) {
    if cut.kind == CutKind::Forced {
        stats.forced_segmentations += 1;
    }

    // 90 kHz to milliseconds with a residual carry so piece durations
    // sum to the stream duration.
    let mut duration_ms = (cut.duration / 90) as u32;
    *residual_90k += cut.duration % 90;
    duration_ms += (*residual_90k / 90) as u32;
    *residual_90k %= 90;
    *entire_ms += u64::from(duration_ms);

    let complete = cut.kind != CutKind::Partial;
    let piece = match fragmenter {
        Some(f) => {
            f.clear_fragments();
            f.push_packets(&cut.packets, seg.pmt(), cut.kind == CutKind::Forced);
            ring.set_init_segment(f.init_segment());
            if f.fragments().is_empty() {
                // Codec parameters still pending; nothing to publish.
                return;
            }
            let fragments = f
                .fragment_sizes()
                .iter()
                .zip(f.fragment_durations_ms())
                .map(|(&size, &duration_ms)| FragmentEntry {
                    size: size as u32,
                    duration_ms,
                })
                .collect();
            Piece {
                complete,
                duration_ms,
                body: f.fragments().to_vec(),
                fragments,
            }
        }
        None => {
            let units = (cut.packets.len() / PACKET_SIZE) as u32;
            Piece {
                complete,
                duration_ms,
                fragments: vec![FragmentEntry {
                    size: units,
                    duration_ms,
                }],
                body: cut.packets,
            }
        }
    };
    ring.publish(piece);
}
