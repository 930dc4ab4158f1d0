//! Packet filter seam ahead of the segmenter.
//!
//! The external ARIB-caption to ID3 converter plugs in here as a pure
//! byte-stream filter; the built-in filter passes packets through
//! unchanged.

use tsmemseg_media::ts::PACKET_SIZE;

/// A TS packet filter. Packets go in one at a time; whole packets come
/// out, possibly delayed or with extra packets interleaved.
pub trait PacketFilter: Send {
    /// Feed one sync-checked 188-byte packet.
    fn push(&mut self, packet: &[u8]);

    /// Packets ready for the segmenter (a multiple of 188 bytes).
    fn output(&self) -> &[u8];

    /// Drop the output buffer after it has been consumed.
    fn clear(&mut self);
}

/// The identity filter.
#[derive(Default)]
pub struct Passthrough {
    buf: Vec<u8>,
}

impl Passthrough {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketFilter for Passthrough {
    fn push(&mut self, packet: &[u8]) {
        debug_assert_eq!(packet.len(), PACKET_SIZE);
        self.buf.extend_from_slice(packet);
    }

    fn output(&self) -> &[u8] {
        &self.buf
    }

    fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_round_trip() {
        let mut f = Passthrough::new();
        let packet = [0x47u8; PACKET_SIZE];
        f.push(&packet);
        f.push(&packet);
        assert_eq!(f.output().len(), 2 * PACKET_SIZE);
        f.clear();
        assert!(f.output().is_empty());
    }
}
