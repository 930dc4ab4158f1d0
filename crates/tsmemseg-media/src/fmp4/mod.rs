//! Fragmented-MP4 packaging of reorganized TS packet runs.
//!
//! The fragmenter consumes the packet runs emitted by the segmenter,
//! reassembles the PES streams the PMT advertises (one video, one ADTS
//! audio, one ID3 metadata), and serializes fragmented MP4: `ftyp`+`moov`
//! once as the init segment, then `[emsg] moof mdat` per call. ID3 PES
//! packets become `emsg` boxes aligned to the media decode time.

pub mod adts;
pub mod avc;
mod boxes;
pub mod hevc;

use bytes::{BufMut, BytesMut};
use std::mem;

use crate::fmp4::boxes::{begin_box, begin_full_box, end_box};
use crate::segmenter::pts_diff;
use crate::ts::psi::Pmt;
use crate::ts::{self, pes, VideoCodec, PACKET_SIZE};

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

/// trun sample flags: sync sample (depends-on-none).
const SAMPLE_FLAGS_KEY: u32 = 0x0240_0000;
/// trun sample flags: non-sync sample.
const SAMPLE_FLAGS_NON_KEY: u32 = 0x0101_0000;
/// Fallback when no sample duration can be derived (90 kHz).
const DEFAULT_SAMPLE_DURATION: u32 = 3000;
/// Samples per AAC frame.
const AAC_SAMPLES_PER_FRAME: u32 = 1024;
/// Timestamp deltas beyond 10 s read as discontinuities.
const MAX_TIME_DELTA: u64 = 900_000;

const EMSG_SCHEME: &[u8] = b"https://aomedia.org/emsg/ID3";

#[derive(Debug, Default)]
struct PesBuffer {
    counter: u8,
    buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Track {
    Video,
    Audio,
    Id3,
}

#[derive(Debug, Clone, Copy)]
enum SpsInfo {
    Avc(avc::SpsInfo),
    Hevc(hevc::SpsInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AudioParams {
    profile: u8,
    sampling_frequency: u32,
    sampling_frequency_index: u8,
    channel_configuration: u8,
}

#[derive(Debug, Clone, Copy)]
struct VideoSample {
    size: u32,
    is_key: bool,
    /// DTS delta to the previous sample; `None` when unknown.
    duration: Option<u32>,
    cts_offset: u32,
}

/// Incremental fMP4 packager.
pub struct Fragmenter {
    fragment_count: u32,
    duration_residual: u64,
    fragments: BytesMut,
    fragment_sizes: Vec<usize>,
    fragment_durations_ms: Vec<u32>,

    video_pes: PesBuffer,
    audio_pes: PesBuffer,
    id3_pes: PesBuffer,

    video_pts: Option<u64>,
    video_dts: Option<u64>,
    video_decode_time: u64,
    video_anchor_dts: Option<u64>,

    audio_pts: Option<u64>,
    audio_decode_time: u64,
    audio_anchor_pts: Option<u64>,

    workspace: Vec<u8>,
    emsg: BytesMut,
    video_mdat: Vec<u8>,
    audio_mdat: Vec<u8>,
    init: BytesMut,

    h265: bool,
    sps_info: Option<SpsInfo>,
    parallelism_type: u8,
    num_temporal_layers: u32,
    temporal_id_nesting: bool,
    vps: Vec<u8>,
    sps: Vec<u8>,
    pps: Vec<u8>,
    video_samples: Vec<VideoSample>,

    audio: Option<AudioParams>,
    audio_sample_sizes: Vec<u16>,
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fragmenter {
    pub fn new() -> Self {
        Self {
            fragment_count: 0,
            duration_residual: 0,
            fragments: BytesMut::new(),
            fragment_sizes: Vec::new(),
            fragment_durations_ms: Vec::new(),
            video_pes: PesBuffer::default(),
            audio_pes: PesBuffer::default(),
            id3_pes: PesBuffer::default(),
            video_pts: None,
            video_dts: None,
            video_decode_time: 0,
            video_anchor_dts: None,
            audio_pts: None,
            audio_decode_time: 0,
            audio_anchor_pts: None,
            workspace: Vec::new(),
            emsg: BytesMut::new(),
            video_mdat: Vec::new(),
            audio_mdat: Vec::new(),
            init: BytesMut::new(),
            h265: false,
            sps_info: None,
            parallelism_type: 0,
            num_temporal_layers: 1,
            temporal_id_nesting: false,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            video_samples: Vec::new(),
            audio: None,
            audio_sample_sizes: Vec::new(),
        }
    }

    /// Pending fragment bytes (`[emsg] moof mdat` sequences).
    pub fn fragments(&self) -> &[u8] {
        &self.fragments
    }

    /// Byte length of each pending fragment.
    pub fn fragment_sizes(&self) -> &[usize] {
        &self.fragment_sizes
    }

    /// Duration of each pending fragment in milliseconds.
    pub fn fragment_durations_ms(&self) -> &[u32] {
        &self.fragment_durations_ms
    }

    /// `ftyp`+`moov`, empty until every advertised track has parameters.
    pub fn init_segment(&self) -> &[u8] {
        &self.init
    }

    /// Drop pending fragments after they have been published.
    pub fn clear_fragments(&mut self) {
        self.fragments.clear();
        self.fragment_sizes.clear();
        self.fragment_durations_ms.clear();
    }

    /// Consume one reorganized packet run. `may_not_end_at_unit_start`
    /// suppresses the trailing video-PES flush for runs (forced cuts)
    /// that can end mid-PES.
    pub fn push_packets(&mut self, packets: &[u8], pmt: &Pmt, may_not_end_at_unit_start: bool) {
        let mut base_video_dts: Option<u64> = None;
        let mut base_audio_pts: Option<u64> = None;
        self.emsg.clear();
        self.video_mdat.clear();
        self.audio_mdat.clear();
        self.video_samples.clear();
        self.audio_sample_sizes.clear();

        let video_pid = pmt.video_pid();
        let audio_pid = pmt.first_adts_audio_pid;
        let id3_pid = pmt.first_id3_pid;
        let h265 = pmt.video_codec() == Some(VideoCodec::Hevc);

        for packet in packets.chunks_exact(PACKET_SIZE) {
            let unit_start = ts::unit_start(packet);
            let pid = ts::pid(packet);
            let counter = ts::counter(packet);
            let payload = ts::payload(packet);

            let track = if pid != 0 && Some(pid) == video_pid {
                Track::Video
            } else if pid != 0 && Some(pid) == audio_pid {
                Track::Audio
            } else if pid != 0 && Some(pid) == id3_pid {
                Track::Id3
            } else {
                continue;
            };

            if unit_start {
                self.pes_buffer(track).counter = counter;
                if track == Track::Video {
                    // An unbounded video PES is closed by the next unit
                    // start.
                    if declared_length(&self.video_pes.buf) == Some(0) {
                        let pes = mem::take(&mut self.video_pes.buf);
                        self.push_video_pes(&pes, h265);
                        if base_video_dts.is_none() {
                            base_video_dts = self.video_dts;
                        }
                    }
                }
                self.pes_buffer(track).buf = payload.to_vec();
            } else {
                let buffer = self.pes_buffer(track);
                if !buffer.buf.is_empty() {
                    let expected = (buffer.counter + 1) & 0x0f;
                    buffer.counter = expected;
                    if expected == counter {
                        buffer.buf.extend_from_slice(payload);
                    } else {
                        // Drop until the next unit start.
                        buffer.buf.clear();
                    }
                }
            }

            // Bounded PES (audio/ID3, and bounded video) complete once the
            // declared length has accumulated.
            let buffer = self.pes_buffer(track);
            if let Some(declared) = declared_length_any_prefix(&buffer.buf) {
                if declared != 0 && buffer.buf.len() >= 6 + declared {
                    buffer.buf.truncate(6 + declared);
                    let pes = mem::take(&mut buffer.buf);
                    if pes[0] == 0 && pes[1] == 0 && pes[2] == 1 {
                        match track {
                            Track::Video => {
                                self.push_video_pes(&pes, h265);
                                if base_video_dts.is_none() {
                                    base_video_dts = self.video_dts;
                                }
                            }
                            Track::Audio => {
                                self.push_audio_pes(&pes);
                                if base_audio_pts.is_none() {
                                    base_audio_pts = self.audio_pts;
                                }
                            }
                            Track::Id3 => self.push_id3_pes(&pes),
                        }
                    }
                }
            }
        }

        // The run normally ends exactly at a unit start, so an unbounded
        // video PES left in the buffer is complete.
        if declared_length(&self.video_pes.buf) == Some(0) && !may_not_end_at_unit_start {
            let pes = mem::take(&mut self.video_pes.buf);
            self.push_video_pes(&pes, h265);
            if base_video_dts.is_none() {
                base_video_dts = self.video_dts;
            }
        }

        if self.init.is_empty() {
            let video_ready = video_pid.is_none() || self.sps_info.is_some();
            let audio_ready = audio_pid.is_none() || self.audio.is_some();
            if video_ready && audio_ready {
                self.build_init();
            }
        }
        if self.init.is_empty() {
            return;
        }

        let fragment_start = self.fragments.len();
        let mut fragment_duration_ms = 0u32;
        let emsg = mem::take(&mut self.emsg);
        self.fragments.extend_from_slice(&emsg);
        self.emsg = emsg;

        if !self.video_samples.is_empty() || !self.audio_sample_sizes.is_empty() {
            self.advance_decode_times(base_video_dts, base_audio_pts);

            let mut data = mem::take(&mut self.fragments);
            let (duration_num, duration_scale) = self.write_moof(&mut data);
            self.fragments = data;
            if duration_num > 0 {
                let num = duration_num * 1000 + self.duration_residual;
                fragment_duration_ms = (num / duration_scale) as u32;
                self.duration_residual = num % duration_scale;
            }
        }

        let fragment_size = self.fragments.len() - fragment_start;
        if fragment_size > 0 {
            self.fragment_sizes.push(fragment_size);
            self.fragment_durations_ms.push(fragment_duration_ms);
        }
    }

    fn pes_buffer(&mut self, track: Track) -> &mut PesBuffer {
        match track {
            Track::Video => &mut self.video_pes,
            Track::Audio => &mut self.audio_pes,
            Track::Id3 => &mut self.id3_pes,
        }
    }

    /// Move the per-track decode clocks forward by the wrap-safe progress
    /// of the first timestamps of this run, anchoring each track to the
    /// other on its first fragment so both tracks start aligned.
    fn advance_decode_times(&mut self, base_video_dts: Option<u64>, base_audio_pts: Option<u64>) {
        if let (Some(base), Some(anchor)) = (base_video_dts, self.video_anchor_dts) {
            let d = pts_diff(base, anchor);
            if d < 1 << 32 {
                self.video_decode_time += d;
            }
            self.video_anchor_dts = Some(base);
        }
        if let (Some(base), Some(anchor)) = (base_audio_pts, self.audio_anchor_pts) {
            let d = pts_diff(base, anchor);
            if d < 1 << 32 {
                self.audio_decode_time += d;
            }
            self.audio_anchor_pts = Some(base);
        }

        if self.video_anchor_dts.is_none() {
            if let Some(base) = base_video_dts {
                if let Some(audio_anchor) = self.audio_anchor_pts {
                    let d = wrap33(self.audio_decode_time + base + (1 << 34) - audio_anchor);
                    self.video_decode_time = clamp_delta(d);
                } else if let Some(base_audio) = base_audio_pts {
                    let d = pts_diff(base, base_audio);
                    self.video_decode_time = clamp_delta(d);
                }
                self.video_anchor_dts = Some(base);
            }
        }
        if self.audio_anchor_pts.is_none() {
            if let Some(base) = base_audio_pts {
                if let Some(video_anchor) = self.video_anchor_dts {
                    let d = wrap33(self.video_decode_time + base + (1 << 34) - video_anchor);
                    self.audio_decode_time = clamp_delta(d);
                }
                self.audio_anchor_pts = Some(base);
            }
        }
    }

    fn push_video_pes(&mut self, pes_bytes: &[u8], h265: bool) {
        let Some(header) = pes::parse_header(pes_bytes) else {
            return;
        };
        if header.stream_id & 0xf0 != 0xe0 || header.payload_offset >= pes_bytes.len() {
            return;
        }
        let last_dts = self.video_dts;
        if let Some(pts) = header.pts {
            self.video_pts = Some(pts);
            self.video_dts = Some(header.dts.unwrap_or(pts));
        }

        let payload = &pes_bytes[header.payload_offset..];
        let mut nals: Vec<&[u8]> = Vec::new();
        for_each_nal(payload, |nal| nals.push(nal));

        let mut parameter_changed = false;
        let mut is_key = false;
        let mut sample_size = 0usize;
        for nal in nals {
            if nal.is_empty() {
                continue;
            }
            let nal_unit_type = if h265 { (nal[0] >> 1) & 0x3f } else { nal[0] & 0x1f };
            if h265 && nal_unit_type == 32 {
                if self.vps != nal {
                    if self.init.is_empty() {
                        self.vps = nal.to_vec();
                        if let Ok(info) = hevc::parse_vps(&self.vps) {
                            self.num_temporal_layers = info.num_temporal_layers;
                            self.temporal_id_nesting = info.temporal_id_nesting_flag;
                        }
                    } else {
                        parameter_changed = true;
                    }
                }
            } else if nal_unit_type == (if h265 { 33 } else { 7 }) {
                if self.sps != nal {
                    if self.init.is_empty() {
                        self.sps = nal.to_vec();
                        let parsed = if h265 {
                            hevc::parse_sps(&self.sps).map(SpsInfo::Hevc)
                        } else {
                            avc::parse_sps(&self.sps).map(SpsInfo::Avc)
                        };
                        match parsed {
                            Ok(info) => self.sps_info = Some(info),
                            Err(err) => {
                                tracing::warn!("SPS parse failed: {err}");
                                self.sps_info = None;
                            }
                        }
                    } else {
                        parameter_changed = true;
                    }
                }
            } else if nal_unit_type == (if h265 { 34 } else { 8 }) {
                if self.pps != nal {
                    if self.init.is_empty() {
                        self.pps = nal.to_vec();
                        if h265 {
                            if let Ok(parallelism) = hevc::parse_pps(&self.pps) {
                                self.parallelism_type = parallelism;
                            }
                        }
                    } else {
                        parameter_changed = true;
                    }
                }
            } else if nal_unit_type == (if h265 { 35 } else { 9 }) {
                // AUD carries no sample data.
            } else if (h265 && (nal_unit_type == 39 || nal_unit_type == 40))
                || (!h265 && nal_unit_type == 6)
            {
                // SEI dropped.
            } else {
                let irap = if h265 {
                    (16..=21).contains(&nal_unit_type)
                } else {
                    nal_unit_type == 5
                };
                if irap {
                    // IRAP (BLA, CRA or IDR).
                    is_key = true;
                } else if !h265 && nal_unit_type == 1 && avc::slice_is_intra(nal) {
                    // I/SI picture without an IDR, for streams where IDRs
                    // are rare.
                    is_key = true;
                }
                sample_size += 4 + nal.len();
                self.video_mdat
                    .extend_from_slice(&(nal.len() as u32).to_be_bytes());
                self.video_mdat.extend_from_slice(nal);
            }
        }

        if self.init.is_empty() {
            self.h265 = h265;
        } else if self.h265 != h265 {
            parameter_changed = true;
        }

        if self.sps_info.is_none() || parameter_changed {
            self.video_mdat.clear();
            self.video_samples.clear();
        } else {
            let duration = match (last_dts, self.video_dts) {
                (Some(last), Some(current)) => {
                    let d = pts_diff(current, last);
                    if d > MAX_TIME_DELTA {
                        None
                    } else {
                        Some(d as u32)
                    }
                }
                _ => None,
            };
            let cts_offset = match (self.video_pts, self.video_dts) {
                (Some(pts), Some(dts)) => {
                    let d = pts_diff(pts, dts);
                    if d > MAX_TIME_DELTA {
                        0
                    } else {
                        d as u32
                    }
                }
                _ => 0,
            };
            self.video_samples.push(VideoSample {
                size: sample_size as u32,
                is_key,
                duration,
                cts_offset,
            });
        }
    }

    fn push_audio_pes(&mut self, pes_bytes: &[u8]) {
        let Some(header) = pes::parse_header(pes_bytes) else {
            return;
        };
        if header.stream_id & 0xe0 != 0xc0 || header.payload_offset >= pes_bytes.len() {
            return;
        }
        if !adts::sync_payload(&mut self.workspace, &pes_bytes[header.payload_offset..]) {
            return;
        }
        if let Some(pts) = header.pts {
            self.audio_pts = Some(pts);
        }

        loop {
            if self.workspace.is_empty() {
                break;
            }
            if self.workspace[0] != 0xff {
                self.workspace.clear();
                break;
            }
            if self.workspace.len() < 7 {
                break;
            }
            let Some(header) = adts::parse_header(&self.workspace) else {
                self.workspace.clear();
                break;
            };
            if header.frame_length < header.header_length {
                self.workspace.clear();
                break;
            }
            if self.workspace.len() < header.frame_length {
                break;
            }

            if self.init.is_empty() {
                if let Some(sampling_frequency) = header.sampling_frequency() {
                    self.audio = Some(AudioParams {
                        profile: header.profile,
                        sampling_frequency,
                        sampling_frequency_index: header.sampling_frequency_index,
                        channel_configuration: header.channel_configuration,
                    });
                }
            }
            let matches_params = self.audio.is_some_and(|a| {
                a.profile == header.profile
                    && a.sampling_frequency_index == header.sampling_frequency_index
                    && a.channel_configuration == header.channel_configuration
            });
            if matches_params {
                self.audio_mdat
                    .extend_from_slice(&self.workspace[header.header_length..header.frame_length]);
                self.audio_sample_sizes
                    .push((header.frame_length - header.header_length) as u16);
            }
            self.workspace.drain(..header.frame_length);
        }

        if !self.workspace.is_empty() {
            // Marks the leading 0xff as already synchronized.
            self.workspace[0] = 0;
        }
    }

    fn push_id3_pes(&mut self, pes_bytes: &[u8]) {
        const PRIVATE_STREAM_1: u8 = 0xbd;
        let Some(header) = pes::parse_header(pes_bytes) else {
            return;
        };
        if header.stream_id != PRIVATE_STREAM_1 || header.payload_offset >= pes_bytes.len() {
            return;
        }
        let Some(pts) = header.pts else {
            return;
        };

        // Align the event to the media timeline of whichever track is
        // anchored.
        let (mut emsg_time, media_anchor) = if self.video_anchor_dts.is_some() {
            (self.video_decode_time, self.video_anchor_dts)
        } else {
            (self.audio_decode_time, self.audio_anchor_pts)
        };
        if let Some(anchor) = media_anchor {
            emsg_time += clamp_delta(pts_diff(pts, anchor));
        }

        let mut buf = mem::take(&mut self.emsg);
        let b = begin_full_box(&mut buf, b"emsg", 0x0100_0000);
        buf.put_u32(90_000); // timescale
        buf.put_u64(emsg_time); // presentation_time
        buf.put_u32(0xffff_ffff); // event_duration
        buf.put_u32(0); // id
        buf.put_slice(EMSG_SCHEME);
        buf.put_u8(0);
        buf.put_u8(0); // empty value
        buf.put_slice(&pes_bytes[header.payload_offset..]);
        end_box(&mut buf, b);
        self.emsg = buf;
    }

    fn build_init(&mut self) {
        let mut buf = BytesMut::with_capacity(1024);
        let b = begin_box(&mut buf, b"ftyp");
        buf.put_slice(b"isom");
        buf.put_u32(1);
        buf.put_slice(b"isom");
        buf.put_slice(b"avc1");
        end_box(&mut buf, b);
        self.write_moov(&mut buf);
        self.init = buf;
    }

    fn write_moov(&self, buf: &mut BytesMut) {
        let moov = begin_box(buf, b"moov");

        let b = begin_full_box(buf, b"mvhd", 0);
        buf.put_u32(0); // creation_time
        buf.put_u32(0); // modification_time
        buf.put_u32(1000); // timescale
        buf.put_u32(0); // duration
        buf.put_u32(0x0001_0000); // rate
        buf.put_u16(0x0100); // volume
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32(0);
        put_unity_matrix(buf);
        for _ in 0..6 {
            buf.put_u32(0); // pre_defined
        }
        buf.put_u32(AUDIO_TRACK_ID + 1); // next_track_ID
        end_box(buf, b);

        if let Some(info) = self.sps_info {
            self.write_video_trak(buf, info);
        }
        if let Some(audio) = self.audio {
            self.write_audio_trak(buf, audio);
        }

        let mvex = begin_box(buf, b"mvex");
        if self.sps_info.is_some() {
            write_trex(buf, VIDEO_TRACK_ID);
        }
        if self.audio.is_some() {
            write_trex(buf, AUDIO_TRACK_ID);
        }
        end_box(buf, mvex);

        end_box(buf, moov);
    }

    fn write_video_trak(&self, buf: &mut BytesMut, info: SpsInfo) {
        let (width, height, sar) = match info {
            SpsInfo::Avc(i) => (i.codec_width, i.codec_height, (i.sar_width, i.sar_height)),
            SpsInfo::Hevc(i) => (i.codec_width, i.codec_height, (i.sar_width, i.sar_height)),
        };
        let trak = begin_box(buf, b"trak");

        let b = begin_full_box(buf, b"tkhd", 0x0000_0003);
        buf.put_u32(0); // creation_time
        buf.put_u32(0); // modification_time
        buf.put_u32(VIDEO_TRACK_ID);
        buf.put_u32(0);
        buf.put_u32(0); // duration
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(0); // layer
        buf.put_u16(0); // alternate_group
        buf.put_u16(0); // volume
        buf.put_u16(0);
        put_unity_matrix(buf);
        // Display width compensates for the sample aspect ratio.
        buf.put_u16(((width * sar.0 + sar.1 - 1) / sar.1) as u16);
        buf.put_u16(0);
        buf.put_u16(height as u16);
        buf.put_u16(0);
        end_box(buf, b);

        let mdia = begin_box(buf, b"mdia");
        let b = begin_full_box(buf, b"mdhd", 0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(90_000); // timescale
        buf.put_u32(0);
        buf.put_u16(0x55c4); // language: und
        buf.put_u16(0);
        end_box(buf, b);
        write_hdlr(buf, b"vide", b"Video Handler");

        let minf = begin_box(buf, b"minf");
        let b = begin_full_box(buf, b"vmhd", 0x0000_0001);
        buf.put_u16(0); // graphicsmode
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(0); // opcolor
        end_box(buf, b);
        write_dinf(buf);

        let stbl = begin_box(buf, b"stbl");
        let stsd = begin_full_box(buf, b"stsd", 0);
        buf.put_u32(1); // entry_count
        let entry = begin_box(buf, if self.h265 { b"hvc1" } else { b"avc1" });
        for _ in 0..6 {
            buf.put_u8(0);
        }
        buf.put_u16(1); // data_reference_index
        buf.put_u16(0); // pre_defined
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(width as u16);
        buf.put_u16(height as u16);
        buf.put_u16(72); // horizresolution
        buf.put_u16(0);
        buf.put_u16(72); // vertresolution
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u16(1); // frame_count
        for _ in 0..32 {
            buf.put_u8(0); // compressorname
        }
        buf.put_u16(24); // depth
        buf.put_u16(0xffff); // pre_defined
        match info {
            SpsInfo::Avc(i) => self.write_avcc(buf, i),
            SpsInfo::Hevc(i) => self.write_hvcc(buf, i),
        }
        end_box(buf, entry);
        end_box(buf, stsd);
        write_empty_sample_tables(buf);
        end_box(buf, stbl);

        end_box(buf, minf);
        end_box(buf, mdia);
        end_box(buf, trak);
    }

    fn write_avcc(&self, buf: &mut BytesMut, info: avc::SpsInfo) {
        let b = begin_box(buf, b"avcC");
        buf.put_u8(1); // configurationVersion
        buf.put_u8(self.sps[1]); // AVCProfileIndication
        buf.put_u8(self.sps[2]); // profile_compatibility
        buf.put_u8(self.sps[3]); // AVCLevelIndication
        buf.put_u8(0xff); // lengthSizeMinusOne = 3
        buf.put_u8(0xe1); // one SPS
        buf.put_u16(self.sps.len() as u16);
        buf.put_slice(&self.sps);
        buf.put_u8(1); // one PPS
        buf.put_u16(self.pps.len() as u16);
        buf.put_slice(&self.pps);
        // The gate reads sps[3], the level byte; real level values never
        // land on 66/77/88, so these bytes are effectively always
        // present.
        if !matches!(self.sps[3], 66 | 77 | 88) {
            buf.put_u8(0xfc | info.chroma_format_idc as u8);
            buf.put_u8(0xf8 | info.bit_depth_luma_minus8 as u8);
            buf.put_u8(0xf8 | info.bit_depth_chroma_minus8 as u8);
            buf.put_u8(0); // no SPS extensions
        }
        end_box(buf, b);
    }

    fn write_hvcc(&self, buf: &mut BytesMut, info: hevc::SpsInfo) {
        let b = begin_box(buf, b"hvcC");
        buf.put_u8(1); // configurationVersion
        buf.put_u8(
            (info.general_profile_space << 6)
                | (u8::from(info.general_tier_flag) << 5)
                | info.general_profile_idc,
        );
        buf.put_slice(&info.general_profile_compatibility_flags);
        buf.put_slice(&info.general_constraint_indicator_flags);
        buf.put_u8(info.general_level_idc);
        buf.put_u16(0xf000 | info.min_spatial_segmentation_idc as u16);
        buf.put_u8(0xfc | self.parallelism_type);
        buf.put_u8(0xfc | info.chroma_format_idc as u8);
        buf.put_u8(0xf8 | info.bit_depth_luma_minus8 as u8);
        buf.put_u8(0xf8 | info.bit_depth_chroma_minus8 as u8);
        buf.put_u16(0); // avgFrameRate
        buf.put_u8(
            ((self.num_temporal_layers as u8 & 0x07) << 3)
                | (u8::from(self.temporal_id_nesting) << 2)
                | 3, // lengthSizeMinusOne
        );
        buf.put_u8(3); // numOfArrays
        for (nal_type, nal) in [(32u8, &self.vps), (33, &self.sps), (34, &self.pps)] {
            buf.put_u8(0x80 | nal_type); // array_completeness set
            buf.put_u16(1); // numNalus
            buf.put_u16(nal.len() as u16);
            buf.put_slice(nal);
        }
        end_box(buf, b);
    }

    fn write_audio_trak(&self, buf: &mut BytesMut, audio: AudioParams) {
        let trak = begin_box(buf, b"trak");

        let b = begin_full_box(buf, b"tkhd", 0x0000_0003);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(AUDIO_TRACK_ID);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(0); // layer
        buf.put_u16(1); // alternate_group
        buf.put_u16(0x0100); // volume
        buf.put_u16(0);
        put_unity_matrix(buf);
        buf.put_u32(0); // width
        buf.put_u32(0); // height
        end_box(buf, b);

        let mdia = begin_box(buf, b"mdia");
        let b = begin_full_box(buf, b"mdhd", 0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(audio.sampling_frequency);
        buf.put_u32(0);
        buf.put_u16(0x55c4);
        buf.put_u16(0);
        end_box(buf, b);
        write_hdlr(buf, b"soun", b"Audio Handler");

        let minf = begin_box(buf, b"minf");
        let b = begin_full_box(buf, b"smhd", 0);
        buf.put_u16(0); // balance
        buf.put_u16(0);
        end_box(buf, b);
        write_dinf(buf);

        let stbl = begin_box(buf, b"stbl");
        let stsd = begin_full_box(buf, b"stsd", 0);
        buf.put_u32(1);
        let entry = begin_box(buf, b"mp4a");
        for _ in 0..6 {
            buf.put_u8(0);
        }
        buf.put_u16(1); // data_reference_index
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(u16::from(audio.channel_configuration));
        buf.put_u16(16); // samplesize
        buf.put_u32(0);
        buf.put_u16(audio.sampling_frequency as u16);
        buf.put_u16(0);
        self.write_esds(buf, audio);
        end_box(buf, entry);
        end_box(buf, stsd);
        write_empty_sample_tables(buf);
        end_box(buf, stbl);

        end_box(buf, minf);
        end_box(buf, mdia);
        end_box(buf, trak);
    }

    fn write_esds(&self, buf: &mut BytesMut, audio: AudioParams) {
        let b = begin_full_box(buf, b"esds", 0);
        // ES_Descriptor
        buf.put_u8(0x03);
        buf.put_u8(25);
        buf.put_u16(1); // ES_ID
        buf.put_u8(0);
        // DecoderConfigDescriptor
        buf.put_u8(0x04);
        buf.put_u8(17);
        buf.put_u8(0x40); // Audio ISO/IEC 14496-3
        buf.put_u8(0x15); // AudioStream
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0); // bufferSizeDB
        buf.put_u32(0); // maxBitrate
        buf.put_u32(0); // avgBitrate
        // DecoderSpecificInfo: AudioSpecificConfig
        buf.put_u8(0x05);
        buf.put_u8(2);
        buf.put_u8(((audio.profile + 1) << 3) | (audio.sampling_frequency_index >> 1));
        buf.put_u8(((audio.sampling_frequency_index & 0x01) << 7) | (audio.channel_configuration << 3));
        // SLConfigDescriptor
        buf.put_u8(0x06);
        buf.put_u8(1);
        buf.put_u8(2);
        end_box(buf, b);
    }

    /// Write `moof`+`mdat` for each track with pending samples. Returns
    /// the fragment duration as a rational (numerator, timescale).
    fn write_moof(&mut self, data: &mut BytesMut) -> (u64, u64) {
        let mut duration_num = 0u64;
        let mut duration_scale = 1u64;

        if !self.video_samples.is_empty() {
            self.fragment_count += 1;
            let moof_begin = data.len();
            let moof = begin_box(data, b"moof");
            let b = begin_full_box(data, b"mfhd", 0);
            data.put_u32(self.fragment_count);
            end_box(data, b);
            let traf = begin_box(data, b"traf");
            let b = begin_full_box(data, b"tfhd", 0);
            data.put_u32(VIDEO_TRACK_ID);
            end_box(data, b);
            let b = begin_full_box(data, b"tfdt", 0x0100_0000);
            data.put_u64(self.video_decode_time);
            end_box(data, b);
            // duration, size, flags and cts present + data offset
            let trun = begin_full_box(data, b"trun", 0x0000_0f01);
            data.put_u32(self.video_samples.len() as u32);
            let offset_field = data.len();
            data.put_u32(0);
            for i in 0..self.video_samples.len() {
                // An unknown duration borrows the next known one.
                let duration = self.video_samples[i..]
                    .iter()
                    .find_map(|s| s.duration)
                    .unwrap_or(DEFAULT_SAMPLE_DURATION);
                duration_num += u64::from(duration);
                duration_scale = 90_000;
                let sample = self.video_samples[i];
                data.put_u32(duration);
                data.put_u32(sample.size);
                data.put_u32(if sample.is_key {
                    SAMPLE_FLAGS_KEY
                } else {
                    SAMPLE_FLAGS_NON_KEY
                });
                data.put_u32(sample.cts_offset);
            }
            end_box(data, trun);
            end_box(data, traf);
            end_box(data, moof);

            let mdat = begin_box(data, b"mdat");
            let data_offset = (data.len() - moof_begin) as u32;
            data[offset_field..offset_field + 4].copy_from_slice(&data_offset.to_be_bytes());
            data.extend_from_slice(&self.video_mdat);
            end_box(data, mdat);
        }

        if let Some(audio) = self.audio.filter(|_| !self.audio_sample_sizes.is_empty()) {
            self.fragment_count += 1;
            let moof_begin = data.len();
            let moof = begin_box(data, b"moof");
            let b = begin_full_box(data, b"mfhd", 0);
            data.put_u32(self.fragment_count);
            end_box(data, b);
            let traf = begin_box(data, b"traf");
            // default-sample-duration and default-sample-flags present
            let b = begin_full_box(data, b"tfhd", 0x0000_0028);
            data.put_u32(AUDIO_TRACK_ID);
            data.put_u32(AAC_SAMPLES_PER_FRAME);
            data.put_u32(0x0200_0000);
            end_box(data, b);
            let b = begin_full_box(data, b"tfdt", 0x0100_0000);
            data.put_u64(
                self.audio_decode_time * u64::from(audio.sampling_frequency) / 90_000,
            );
            end_box(data, b);
            // size present + data offset
            let trun = begin_full_box(data, b"trun", 0x0000_0201);
            data.put_u32(self.audio_sample_sizes.len() as u32);
            let offset_field = data.len();
            data.put_u32(0);
            for &size in &self.audio_sample_sizes {
                data.put_u32(u32::from(size));
            }
            if self.sps_info.is_none() {
                duration_num =
                    u64::from(AAC_SAMPLES_PER_FRAME) * self.audio_sample_sizes.len() as u64;
                duration_scale = u64::from(audio.sampling_frequency);
            }
            end_box(data, trun);
            end_box(data, traf);
            end_box(data, moof);

            let mdat = begin_box(data, b"mdat");
            let data_offset = (data.len() - moof_begin) as u32;
            data[offset_field..offset_field + 4].copy_from_slice(&data_offset.to_be_bytes());
            data.extend_from_slice(&self.audio_mdat);
            end_box(data, mdat);
        }

        (duration_num, duration_scale)
    }
}

/// Declared PES packet length, requiring the full `00 00 01` prefix.
fn declared_length(buf: &[u8]) -> Option<usize> {
    if buf.len() >= 6 && buf[0] == 0 && buf[1] == 0 && buf[2] == 1 {
        Some((usize::from(buf[4]) << 8) | usize::from(buf[5]))
    } else {
        None
    }
}

/// Declared length with only the 6-byte minimum (prefix checked at
/// completion time, matching the accumulation contract).
fn declared_length_any_prefix(buf: &[u8]) -> Option<usize> {
    if buf.len() >= 6 {
        Some((usize::from(buf[4]) << 8) | usize::from(buf[5]))
    } else {
        None
    }
}

/// Invoke `f` for every NAL unit between start codes in `payload`.
fn for_each_nal<'a>(payload: &'a [u8], mut f: impl FnMut(&'a [u8])) {
    let mut nal_pos = 0usize;
    let mut i = 2usize;
    loop {
        if i >= payload.len() || (payload[i] == 1 && payload[i - 1] == 0 && payload[i - 2] == 0) {
            if nal_pos != 0 {
                let end = if i >= payload.len() {
                    payload.len()
                } else {
                    i - 2 - usize::from(payload[i - 3] == 0)
                };
                f(&payload[nal_pos..end]);
            }
            if i >= payload.len() {
                break;
            }
            nal_pos = i + 1;
            i += 3;
        } else if payload[i] > 0 {
            i += 3;
        } else {
            i += 1;
        }
    }
}

fn wrap33(v: u64) -> u64 {
    v & 0x1_ffff_ffff
}

/// A wrap-safe delta: clamped to 10 s, and 0 when it reads as negative.
fn clamp_delta(d: u64) -> u64 {
    if d < 1 << 32 {
        d.min(MAX_TIME_DELTA)
    } else {
        0
    }
}

fn put_unity_matrix(buf: &mut BytesMut) {
    buf.put_u32(0x0001_0000);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0x0001_0000);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0x4000_0000);
}

fn write_hdlr(buf: &mut BytesMut, handler: &[u8; 4], name: &[u8]) {
    let b = begin_full_box(buf, b"hdlr", 0);
    buf.put_u32(0); // pre_defined
    buf.put_slice(handler);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_slice(name);
    buf.put_u8(0);
    end_box(buf, b);
}

fn write_dinf(buf: &mut BytesMut) {
    let dinf = begin_box(buf, b"dinf");
    let dref = begin_full_box(buf, b"dref", 0);
    buf.put_u32(1); // entry_count
    let url = begin_full_box(buf, b"url ", 0x0000_0001); // self-contained
    end_box(buf, url);
    end_box(buf, dref);
    end_box(buf, dinf);
}

fn write_empty_sample_tables(buf: &mut BytesMut) {
    let b = begin_full_box(buf, b"stts", 0);
    buf.put_u32(0);
    end_box(buf, b);
    let b = begin_full_box(buf, b"stsc", 0);
    buf.put_u32(0);
    end_box(buf, b);
    let b = begin_full_box(buf, b"stsz", 0);
    buf.put_u32(0);
    buf.put_u32(0);
    end_box(buf, b);
    let b = begin_full_box(buf, b"stco", 0);
    buf.put_u32(0);
    end_box(buf, b);
}

fn write_trex(buf: &mut BytesMut, track_id: u32) {
    let b = begin_full_box(buf, b"trex", 0);
    buf.put_u32(track_id);
    buf.put_u32(1); // default_sample_description_index
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    end_box(buf, b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmp4::adts::tests::adts_frame;
    use crate::fmp4::avc::tests::sps_1280x720;
    use crate::fmp4::boxes::tests::{find_box, walk_boxes};
    use crate::testutil::{packetize_pes, pes_packet};

    const VIDEO_PID: u16 = 0x100;
    const AUDIO_PID: u16 = 0x110;
    const ID3_PID: u16 = 0x120;

    fn test_pmt(video: bool, audio: bool, id3: bool) -> Pmt {
        let mut pmt = Pmt::default();
        pmt.pmt_pid = 0x1000;
        if video {
            pmt.first_video = Some((VIDEO_PID, VideoCodec::Avc));
        }
        if audio {
            pmt.first_adts_audio_pid = Some(AUDIO_PID);
        }
        if id3 {
            pmt.first_id3_pid = Some(ID3_PID);
        }
        pmt
    }

    /// AUD + (optionally SPS/PPS) + one slice NAL.
    fn video_es(idr: bool, with_params: bool) -> Vec<u8> {
        let mut es = vec![0x00, 0x00, 0x00, 0x01, 0x09, 0xf0];
        if with_params {
            es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            es.extend_from_slice(&sps_1280x720());
            es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            es.extend_from_slice(&[0x68, 0xce, 0x38, 0x80]); // PPS
        }
        es.extend_from_slice(&[0x00, 0x00, 0x01]);
        if idr {
            es.push(0x65);
            es.extend_from_slice(&[0xaa; 40]);
        } else {
            es.push(0x41);
            es.push(0xa0); // first_mb 0, slice_type P
            es.extend_from_slice(&[0xaa; 40]);
        }
        es
    }

    fn video_packets(frames: &[(u64, bool, bool)]) -> Vec<u8> {
        let mut packets = Vec::new();
        let mut counter = 0u8;
        for &(pts, idr, with_params) in frames {
            let pes = pes_packet(0xe0, Some(pts), None, &video_es(idr, with_params), false);
            let (pkts, next) = packetize_pes(VIDEO_PID, counter, &pes);
            counter = next;
            for p in pkts {
                packets.extend_from_slice(&p);
            }
        }
        packets
    }

    #[test]
    fn test_init_and_fragment_layout() {
        let mut f = Fragmenter::new();
        let pmt = test_pmt(true, false, false);
        f.push_packets(
            &video_packets(&[(0, true, true), (3000, false, false)]),
            &pmt,
            false,
        );

        let init = f.init_segment().to_vec();
        assert_eq!(walk_boxes(&init), vec![*b"ftyp", *b"moov"]);
        assert!(find_box(&init, &[b"moov", b"mvex"]).is_some());
        assert!(init.windows(4).any(|w| w == b"avc1"));
        assert!(init.windows(4).any(|w| w == b"avcC"));

        let frags = f.fragments().to_vec();
        assert_eq!(walk_boxes(&frags), vec![*b"moof", *b"mdat"]);
        assert_eq!(f.fragment_sizes(), &[frags.len()]);
        // Two samples of 3000 ticks: 6000 / 90 = 66 ms.
        assert_eq!(f.fragment_durations_ms(), &[66]);

        let trun = find_box(&frags, &[b"moof", b"traf", b"trun"]).unwrap();
        let sample_count = u32::from_be_bytes(trun[4..8].try_into().unwrap());
        assert_eq!(sample_count, 2);
        let flags0 = u32::from_be_bytes(trun[20..24].try_into().unwrap());
        assert_eq!(flags0, SAMPLE_FLAGS_KEY);
        let flags1 = u32::from_be_bytes(trun[36..40].try_into().unwrap());
        assert_eq!(flags1, SAMPLE_FLAGS_NON_KEY);
        // data_offset points just past the moof and mdat headers.
        let moof_body = find_box(&frags, &[b"moof"]).unwrap();
        let data_offset = u32::from_be_bytes(trun[8..12].try_into().unwrap());
        assert_eq!(data_offset as usize, moof_body.len() + 8 + 8);
    }

    #[test]
    fn test_decode_time_advances_across_calls() {
        let mut f = Fragmenter::new();
        let pmt = test_pmt(true, false, false);
        f.push_packets(
            &video_packets(&[(0, true, true), (3000, false, false)]),
            &pmt,
            false,
        );
        f.clear_fragments();
        f.push_packets(
            &video_packets(&[(6000, false, false), (9000, false, false)]),
            &pmt,
            false,
        );
        let frags = f.fragments().to_vec();
        let tfdt = find_box(&frags, &[b"moof", b"traf", b"tfdt"]).unwrap();
        assert_eq!(tfdt[0], 1, "tfdt version 1");
        let decode_time = u64::from_be_bytes(tfdt[4..12].try_into().unwrap());
        assert_eq!(decode_time, 6000);
    }

    #[test]
    fn test_audio_only_fragment() {
        let mut f = Fragmenter::new();
        let pmt = test_pmt(false, true, false);
        let mut es = Vec::new();
        for _ in 0..3 {
            es.extend_from_slice(&adts_frame(1, 3, 2, &[0x22; 32]));
        }
        let pes = pes_packet(0xc0, Some(0), None, &es, true);
        let (pkts, _) = packetize_pes(AUDIO_PID, 0, &pes);
        let mut packets = Vec::new();
        for p in pkts {
            packets.extend_from_slice(&p);
        }
        f.push_packets(&packets, &pmt, false);

        let init = f.init_segment().to_vec();
        assert!(init.windows(4).any(|w| w == b"mp4a"));
        assert!(init.windows(4).any(|w| w == b"esds"));

        let frags = f.fragments().to_vec();
        assert_eq!(walk_boxes(&frags), vec![*b"moof", *b"mdat"]);
        // 3 frames x 1024 samples at 48 kHz = 64 ms.
        assert_eq!(f.fragment_durations_ms(), &[64]);
        let mdat = find_box(&frags, &[b"mdat"]).unwrap();
        assert_eq!(mdat.len(), 3 * 32);
    }

    #[test]
    fn test_id3_emits_emsg() {
        let mut f = Fragmenter::new();
        let pmt = test_pmt(true, false, true);
        f.push_packets(
            &video_packets(&[(0, true, true), (3000, false, false)]),
            &pmt,
            false,
        );
        f.clear_fragments();

        let mut packets = video_packets(&[(6000, false, false), (9000, false, false)]);
        let id3_pes = pes_packet(0xbd, Some(6600), None, b"ID3\x04\x00payload", true);
        let (pkts, _) = packetize_pes(ID3_PID, 0, &id3_pes);
        for p in pkts {
            packets.extend_from_slice(&p);
        }
        f.push_packets(&packets, &pmt, false);

        let frags = f.fragments().to_vec();
        assert_eq!(walk_boxes(&frags), vec![*b"emsg", *b"moof", *b"mdat"]);
        let emsg = find_box(&frags, &[b"emsg"]).unwrap();
        assert_eq!(u32::from_be_bytes(emsg[4..8].try_into().unwrap()), 90_000);
        // Anchored to the video timeline: decode time 0 plus PTS delta.
        let presentation = u64::from_be_bytes(emsg[8..16].try_into().unwrap());
        assert_eq!(presentation, 6600);
        let scheme_start = 24;
        assert_eq!(
            &emsg[scheme_start..scheme_start + EMSG_SCHEME.len()],
            EMSG_SCHEME
        );
    }

    #[test]
    fn test_no_fragment_before_parameters() {
        let mut f = Fragmenter::new();
        let pmt = test_pmt(true, false, false);
        // No SPS/PPS yet: nothing can be packaged.
        f.push_packets(&video_packets(&[(0, false, false)]), &pmt, false);
        assert!(f.init_segment().is_empty());
        assert!(f.fragments().is_empty());
        assert!(f.fragment_sizes().is_empty());
    }

    #[test]
    fn test_forced_run_keeps_trailing_pes_buffered() {
        let mut f = Fragmenter::new();
        let pmt = test_pmt(true, false, false);
        let packets = video_packets(&[(0, true, true), (3000, false, false)]);
        // A forced cut may end mid-PES: the trailing PES must stay queued.
        f.push_packets(&packets, &pmt, true);
        let frags = f.fragments().to_vec();
        let trun = find_box(&frags, &[b"moof", b"traf", b"trun"]).unwrap();
        let sample_count = u32::from_be_bytes(trun[4..8].try_into().unwrap());
        assert_eq!(sample_count, 1);
    }
}
