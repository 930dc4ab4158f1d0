//! PSI section reassembly and the PAT/PMT tables built from it.
//!
//! Sections arrive split across TS packets. The reassembler follows the
//! continuity counter, handles the pointer field on unit starts (one
//! payload can finish a section and begin the next) and commits a section
//! only once its CRC-32 checks out.

use crate::bits::crc32_mpeg2;
use crate::ts::VideoCodec;

/// Sections longer than this are truncated; PAT/PMT never get close.
const SECTION_MAX: usize = 1024;

/// Reassembly buffer for one PSI table.
#[derive(Debug, Default, Clone)]
pub struct PsiSection {
    table_id: u8,
    section_length: usize,
    /// Version of the last committed section; `None` until one commits.
    version: Option<u8>,
    current_next: bool,
    /// Last continuity counter seen; `None` until primed.
    continuity: Option<u8>,
    data: Vec<u8>,
}

impl PsiSection {
    pub fn version(&self) -> Option<u8> {
        self.version
    }

    fn reset_progress(&mut self) {
        self.data.clear();
        self.version = None;
    }

    fn is_committed(&self) -> bool {
        self.version.is_some()
    }

    /// Feed one packet payload. Returns `true` when the payload has been
    /// fully consumed; `false` means a section completed partway through
    /// and the same payload must be fed once more for the remainder.
    fn extract(&mut self, payload: &[u8], unit_start: bool, counter: u8) -> bool {
        let mut copy_pos = 0usize;
        let mut copy_len = payload.len();
        let mut done = true;
        if unit_start {
            if payload.is_empty() {
                self.continuity = None;
                self.reset_progress();
                return true;
            }
            let pointer = usize::from(payload[0]);
            let expected = self.continuity.map(|c| (c + 1) & 0x0f);
            if pointer > 0 && expected == Some(counter) {
                // The bytes before the pointer target close the section in
                // progress; the new section is picked up on the next pass.
                self.continuity = expected;
                copy_pos = 1;
                copy_len = pointer;
                done = false;
            } else {
                self.continuity = Some(counter);
                self.reset_progress();
                copy_pos = 1 + pointer;
                copy_len = copy_len.saturating_sub(copy_pos);
            }
        } else {
            let expected = self.continuity.map(|c| (c + 1) & 0x0f);
            if expected != Some(counter) {
                self.continuity = None;
                self.reset_progress();
                return true;
            }
            self.continuity = expected;
        }
        if copy_len > 0 && copy_pos < payload.len() {
            let copy_len = copy_len
                .min(payload.len() - copy_pos)
                .min(SECTION_MAX - self.data.len());
            self.data
                .extend_from_slice(&payload[copy_pos..copy_pos + copy_len]);
        }

        if self.data.len() >= 3 {
            let section_length =
                (usize::from(self.data[1] & 0x03) << 8) | usize::from(self.data[2]);
            if section_length >= 3 && self.data.len() >= 3 + section_length {
                if crc32_mpeg2(&self.data[..3 + section_length]) == 0 {
                    self.table_id = self.data[0];
                    self.section_length = section_length;
                    self.version = Some((self.data[5] >> 1) & 0x1f);
                    self.current_next = self.data[5] & 0x01 != 0;
                } else {
                    // Corrupt section; the next unit start rearms.
                    self.reset_progress();
                }
            }
        }
        done
    }
}

fn be16(hi: u8, lo: u8) -> u16 {
    (u16::from(hi) << 8) | u16::from(lo)
}

fn pid13(hi: u8, lo: u8) -> u16 {
    (u16::from(hi & 0x1f) << 8) | u16::from(lo)
}

/// Program Map Table state for the first program.
#[derive(Debug, Default, Clone)]
pub struct Pmt {
    pub pmt_pid: u16,
    pub program_number: u16,
    pub version: Option<u8>,
    pub pcr_pid: u16,
    /// First video elementary stream (PID and codec), if any.
    pub first_video: Option<(u16, VideoCodec)>,
    /// First ADTS audio elementary stream.
    pub first_adts_audio_pid: Option<u16>,
    /// First ID3 timed-metadata PES stream.
    pub first_id3_pid: Option<u16>,
    psi: PsiSection,
}

impl Pmt {
    fn with_pid(pmt_pid: u16) -> Self {
        Self {
            pmt_pid,
            ..Self::default()
        }
    }

    /// PID of the first video stream, if present.
    pub fn video_pid(&self) -> Option<u16> {
        self.first_video.map(|(pid, _)| pid)
    }

    /// Codec of the first video stream, if present.
    pub fn video_codec(&self) -> Option<VideoCodec> {
        self.first_video.map(|(_, codec)| codec)
    }

    /// Feed the TS payload of one packet on the PMT PID.
    pub fn feed(&mut self, payload: &[u8], unit_start: bool, counter: u8) {
        loop {
            let done = self.psi.extract(payload, unit_start, counter);
            if self.psi.is_committed()
                && self.psi.current_next
                && self.psi.table_id == 2
                && self.psi.section_length >= 9
            {
                let table = &self.psi.data;
                self.program_number = be16(table[3], table[4]);
                self.version = self.psi.version;
                self.pcr_pid = pid13(table[8], table[9]);
                let program_info_length =
                    (usize::from(table[10] & 0x03) << 8) | usize::from(table[11]);

                self.first_video = None;
                self.first_adts_audio_pid = None;
                self.first_id3_pid = None;
                let mut pos = 3 + 9 + program_info_length;
                while pos + 4 < 3 + self.psi.section_length - 4 {
                    let stream_type = table[pos];
                    let es_pid = pid13(table[pos + 1], table[pos + 2]);
                    if self.first_video.is_none() {
                        if let Some(codec) = VideoCodec::from_stream_type(stream_type) {
                            self.first_video = Some((es_pid, codec));
                        }
                    }
                    if stream_type == super::STREAM_TYPE_ADTS && self.first_adts_audio_pid.is_none()
                    {
                        self.first_adts_audio_pid = Some(es_pid);
                    }
                    if stream_type == super::STREAM_TYPE_ID3 && self.first_id3_pid.is_none() {
                        self.first_id3_pid = Some(es_pid);
                    }
                    let es_info_length =
                        (usize::from(table[pos + 3] & 0x03) << 8) | usize::from(table[pos + 4]);
                    pos += 5 + es_info_length;
                }
            }
            if done {
                break;
            }
        }
    }
}

/// Program Association Table state. Tracks the first program only.
#[derive(Debug, Default, Clone)]
pub struct Pat {
    pub transport_stream_id: u16,
    pub version: Option<u8>,
    pub first_pmt: Pmt,
    psi: PsiSection,
}

impl Pat {
    /// Feed the TS payload of one packet on PID 0.
    pub fn feed(&mut self, payload: &[u8], unit_start: bool, counter: u8) {
        loop {
            let done = self.psi.extract(payload, unit_start, counter);
            if self.psi.is_committed()
                && self.psi.current_next
                && self.psi.table_id == 0
                && self.psi.section_length >= 5
            {
                let table = &self.psi.data;
                self.transport_stream_id = be16(table[3], table[4]);
                self.version = self.psi.version;

                // First program with a non-zero program number wins. A PMT
                // PID change zeroes the tracked PMT.
                let mut pmt_pid = 0u16;
                let mut pos = 3 + 5;
                while pos + 3 < 3 + self.psi.section_length - 4 {
                    let program_number = be16(table[pos], table[pos + 1]);
                    if program_number != 0 {
                        pmt_pid = pid13(table[pos + 2], table[pos + 3]);
                        if self.first_pmt.pmt_pid != pmt_pid {
                            tracing::debug!(pmt_pid, "PMT PID changed, resetting PMT");
                            self.first_pmt = Pmt::with_pid(pmt_pid);
                        }
                        break;
                    }
                    pos += 4;
                }
                if pmt_pid == 0 {
                    self.first_pmt = Pmt::default();
                }
            }
            if done {
                break;
            }
        }
    }
}
