//! Builders for synthetic TS data, shared by unit tests.

use crate::bits::crc32_mpeg2;
use crate::ts::PACKET_SIZE;

/// Encode a 33-bit timestamp into the 5-byte PES PTS/DTS field.
pub(crate) fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
        (ts >> 22) as u8,
        (((ts >> 15) as u8 & 0x7f) << 1) | 1,
        (ts >> 7) as u8,
        ((ts as u8 & 0x7f) << 1) | 1,
    ]
}

/// Build a complete PSI section: header, body, CRC.
pub(crate) fn make_section(table_id: u8, id: u16, version: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut s = vec![
        table_id,
        0xb0 | ((section_length >> 8) as u8 & 0x03),
        section_length as u8,
        (id >> 8) as u8,
        id as u8,
        0xc0 | (version << 1) | 1,
        0x00,
        0x00,
    ];
    s.extend_from_slice(body);
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

/// PAT with one program pointing at `pmt_pid`.
pub(crate) fn pat_section(pmt_pid: u16) -> Vec<u8> {
    let body = [0x00, 0x01, 0xe0 | (pmt_pid >> 8) as u8, pmt_pid as u8];
    make_section(0, 0x04d2, 1, &body)
}

/// PMT listing `(stream_type, pid)` elementary streams. PCR PID is the
/// first stream's PID, or 0x1fff when empty.
pub(crate) fn pmt_section(streams: &[(u8, u16)]) -> Vec<u8> {
    let pcr = streams.first().map(|&(_, pid)| pid).unwrap_or(0x1fff);
    let mut body = vec![0xe0 | (pcr >> 8) as u8, pcr as u8, 0xf0, 0x00];
    for &(stream_type, pid) in streams {
        body.push(stream_type);
        body.push(0xe0 | (pid >> 8) as u8);
        body.push(pid as u8);
        body.push(0xf0);
        body.push(0x00);
    }
    make_section(2, 0x0001, 1, &body)
}

/// Prepend a zero pointer field.
pub(crate) fn payload_with_pointer(section: &[u8]) -> Vec<u8> {
    let mut p = vec![0u8];
    p.extend_from_slice(section);
    p
}

/// Build one 188-byte TS packet, stuffing via the adaptation field when
/// the payload is short.
pub(crate) fn ts_packet(pid: u16, unit_start: bool, counter: u8, payload: &[u8]) -> [u8; PACKET_SIZE] {
    assert!(payload.len() <= 184);
    let mut p = [0xffu8; PACKET_SIZE];
    p[0] = 0x47;
    p[1] = (if unit_start { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1f);
    p[2] = pid as u8;
    if payload.len() == 184 {
        p[3] = 0x10 | (counter & 0x0f);
        p[4..].copy_from_slice(payload);
    } else {
        p[3] = 0x30 | (counter & 0x0f);
        let adaptation_length = 183 - payload.len();
        p[4] = adaptation_length as u8;
        if adaptation_length > 0 {
            p[5] = 0x00;
        }
        p[PACKET_SIZE - payload.len()..].copy_from_slice(payload);
    }
    p
}

/// One TS packet carrying a whole PSI section (pointer field zero).
pub(crate) fn section_packet(pid: u16, counter: u8, section: &[u8]) -> [u8; PACKET_SIZE] {
    ts_packet(pid, true, counter, &payload_with_pointer(section))
}

/// Build a full PES packet. `bounded` writes the real length (audio/ID3
/// style); unbounded writes 0 (video style).
pub(crate) fn pes_packet(
    stream_id: u8,
    pts: Option<u64>,
    dts: Option<u64>,
    es: &[u8],
    bounded: bool,
) -> Vec<u8> {
    let mut header_data = Vec::new();
    let flags = match (pts, dts) {
        (Some(p), Some(d)) => {
            header_data.extend_from_slice(&encode_timestamp(0x3, p));
            header_data.extend_from_slice(&encode_timestamp(0x1, d));
            0xc0u8
        }
        (Some(p), None) => {
            header_data.extend_from_slice(&encode_timestamp(0x2, p));
            0x80u8
        }
        _ => 0x00u8,
    };
    let mut pes = vec![0x00, 0x00, 0x01, stream_id];
    let packet_length = if bounded {
        3 + header_data.len() + es.len()
    } else {
        0
    };
    pes.push((packet_length >> 8) as u8);
    pes.push(packet_length as u8);
    pes.push(0x80);
    pes.push(flags);
    pes.push(header_data.len() as u8);
    pes.extend_from_slice(&header_data);
    pes.extend_from_slice(es);
    pes
}

/// Split a PES packet into TS packets on `pid`, counters starting at
/// `counter`. Returns the packets and the next counter value.
pub(crate) fn packetize_pes(
    pid: u16,
    mut counter: u8,
    pes: &[u8],
) -> (Vec<[u8; PACKET_SIZE]>, u8) {
    let mut packets = Vec::new();
    let mut off = 0;
    let mut first = true;
    while off < pes.len() {
        let take = (pes.len() - off).min(184);
        packets.push(ts_packet(pid, first, counter, &pes[off..off + take]));
        counter = (counter + 1) & 0x0f;
        off += take;
        first = false;
    }
    (packets, counter)
}
