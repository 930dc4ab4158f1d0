//! Byte-exact layout of the listing and segment frames readers consume.
//!
//! Everything is little-endian. The listing is made of 16-byte rows; a
//! segment starts with a 188-byte TS-NULL header packet. On Unix FIFOs
//! both frames carry an extra leading block with the ASCII stream name
//! so readers can verify what they connected to.

use tsmemseg_media::ts::PACKET_SIZE;

/// Sentinel segment number of an empty slot. The low three bytes are the
/// 24-bit segment number; the fourth byte doubles as the "unavailable"
/// flag in the wire layout.
pub const SEGMENT_COUNT_EMPTY: u32 = 0x0100_0000;

/// Fragments advertised per slot. The header layout fits 38 entries plus
/// the terminator; 20 is the operational cap, extra fragments fold into
/// the last entry.
pub const MAX_FRAGMENTS_PER_SLOT: usize = 20;

/// Offset of the fragment-size table inside the segment header packet.
const FRAGMENT_TABLE_OFFSET: usize = 32;

/// Length of the Unix listing name prefix.
const LISTING_NAME_PREFIX_LEN: usize = 64;

/// One fragment of a published segment: its size (bytes in MP4 mode,
/// 188-byte units in TS mode) and duration.
#[derive(Debug, Clone, Copy)]
pub struct FragmentEntry {
    pub size: u32,
    pub duration_ms: u32,
}

/// One slot row of the listing.
#[derive(Debug, Clone, Copy)]
pub struct ListingRow {
    pub slot_index: u8,
    pub fragment_count: u16,
    pub seg_count: u32,
    pub duration_ms: u32,
    pub cumulative_centisec: u32,
}

fn write_u32_le(buf: &mut [u8], value: u32) {
    buf[..4].copy_from_slice(&value.to_le_bytes());
}

/// 188-byte TS-NULL packet carrying the stream name, prepended to each
/// segment on Unix FIFOs.
pub fn name_block(seg_name: &str) -> [u8; PACKET_SIZE] {
    let mut block = [0u8; PACKET_SIZE];
    block[..4].copy_from_slice(&[0x47, 0x1f, 0xff, 0x10]);
    block[4..4 + seg_name.len()].copy_from_slice(seg_name.as_bytes());
    block
}

/// Build a complete segment frame: optional name block, the header
/// packet, then the body.
pub fn segment_frame(
    seg_name: Option<&str>,
    seg_count: u32,
    is_mp4: bool,
    fragment_sizes: &[u32],
    body: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 * PACKET_SIZE + body.len());
    if let Some(name) = seg_name {
        buf.extend_from_slice(&name_block(name));
    }
    let header_at = buf.len();
    buf.resize(header_at + PACKET_SIZE, 0);
    {
        let header = &mut buf[header_at..];
        header[..4].copy_from_slice(&[0x47, 0x01, 0xff, 0x10]);
        // Bytes 4..7 are the 24-bit segment number; byte 7 reads as the
        // "unavailable" flag and is only set by the empty sentinel.
        write_u32_le(&mut header[4..], seg_count);
        let count = if is_mp4 {
            body.len() as u32
        } else {
            (body.len() / PACKET_SIZE) as u32
        };
        write_u32_le(&mut header[8..], count);
        header[12] = u8::from(is_mp4);
        let mut at = FRAGMENT_TABLE_OFFSET;
        for &size in fragment_sizes.iter().take(MAX_FRAGMENTS_PER_SLOT) {
            write_u32_le(&mut header[at..], size);
            at += 4;
        }
        // The remaining zero bytes terminate the table.
    }
    buf.extend_from_slice(body);
    buf
}

/// Build the listing frame: optional 64-byte name prefix, row 0, one row
/// per slot (oldest first), then the extra area with one 16-byte record
/// per advertised fragment followed by the fMP4 init segment.
pub fn listing_frame(
    seg_name: Option<&str>,
    unix_time: u32,
    end_list: bool,
    last_incomplete: bool,
    is_mp4: bool,
    rows: &[ListingRow],
    fragment_durations_ms: &[u32],
    init_segment: &[u8],
) -> Vec<u8> {
    let extra_len = 16 * fragment_durations_ms.len() + init_segment.len();
    let prefix_len = if seg_name.is_some() {
        LISTING_NAME_PREFIX_LEN
    } else {
        0
    };
    let mut buf = vec![0u8; prefix_len + 16 * (1 + rows.len()) + extra_len];

    if let Some(name) = seg_name {
        buf[..name.len()].copy_from_slice(name.as_bytes());
    }

    let row0 = &mut buf[prefix_len..];
    row0[0] = rows.len() as u8;
    write_u32_le(&mut row0[4..], unix_time);
    row0[8] = u8::from(end_list);
    row0[9] = u8::from(last_incomplete);
    row0[10] = u8::from(is_mp4);
    write_u32_le(&mut row0[12..], extra_len as u32);

    for (i, row) in rows.iter().enumerate() {
        let at = prefix_len + 16 * (1 + i);
        let r = &mut buf[at..];
        r[0] = row.slot_index;
        r[2..4].copy_from_slice(&row.fragment_count.to_le_bytes());
        write_u32_le(&mut r[4..], row.seg_count);
        write_u32_le(&mut r[8..], row.duration_ms);
        write_u32_le(&mut r[12..], row.cumulative_centisec);
    }

    let mut at = prefix_len + 16 * (1 + rows.len());
    for &duration in fragment_durations_ms {
        write_u32_le(&mut buf[at..], duration);
        at += 16;
    }
    buf[at..].copy_from_slice(init_segment);
    buf
}
