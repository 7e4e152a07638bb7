use super::types::*;
use bytes::{BufMut, BytesMut};

/// A PES packet header
///
/// Only the fields this multiplexer emits are modelled; the remaining
/// optional-field flags (ESCR, ES rate, DSM trick mode, CRC, extension)
/// are always written as zero.
#[derive(Debug, Clone)]
pub struct PesHeader {
    /// PES stream ID (0xe0 video, 0xc0 audio, 0xbd private 1, ...)
    pub stream_id: u8,
    /// 16-bit PES packet length; 0 is legal for video streams only
    pub packet_length: u16,
    /// Data alignment indicator
    pub data_alignment: bool,
    /// Presentation timestamp, 90 kHz
    pub pts: Option<u64>,
    /// Decoding timestamp, 90 kHz; only written together with a PTS
    pub dts: Option<u64>,
}

impl PesHeader {
    /// Creates a header for the given stream ID with no timestamps
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            packet_length: 0,
            data_alignment: false,
            pts: None,
            dts: None,
        }
    }

    /// Sets the PTS (90 kHz)
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts & 0x1_ffff_ffff);
        self
    }

    /// Sets the DTS (90 kHz)
    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = Some(dts & 0x1_ffff_ffff);
        self
    }

    /// Serialized size of this header in bytes
    pub fn len(&self) -> usize {
        match (self.pts.is_some(), self.dts.is_some()) {
            (true, true) => PES_HEADER_SIZE_PTSDTS,
            (true, false) => PES_HEADER_SIZE_PTS,
            _ => PES_HEADER_SIZE_NOPTS,
        }
    }

    /// Returns true if the header carries no timestamps
    pub fn is_empty(&self) -> bool {
        self.pts.is_none() && self.dts.is_none()
    }

    /// Writes the header to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        // Start code prefix
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u8(0x01);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length);

        // '10' marker, scrambling 0, priority 0, alignment, copyright 0,
        // original 0
        let mut flags = 0x80u8;
        if self.data_alignment {
            flags |= 0x04;
        }
        buf.put_u8(flags);

        let pts_dts_flags = match (self.pts.is_some(), self.dts.is_some()) {
            (true, true) => 0xc0u8,
            (true, false) => 0x80,
            _ => 0x00,
        };
        buf.put_u8(pts_dts_flags);

        let header_data_length = self.len() - PES_HEADER_SIZE_NOPTS;
        buf.put_u8(header_data_length as u8);

        if let Some(pts) = self.pts {
            let marker = if self.dts.is_some() { 0x30 } else { 0x20 };
            write_timestamp(buf, marker, pts);
        }
        if let Some(dts) = self.dts {
            write_timestamp(buf, 0x10, dts);
        }
    }
}

/// Patches the 16-bit PES packet length of an already serialized PES.
///
/// `total_len` is the full PES size; the stored length excludes the 6-byte
/// fixed header. Lengths above 65535 are stored as 0 (unbounded), which is
/// legal for video streams only.
pub fn patch_length(pes: &mut [u8], total_len: usize) {
    let length = total_len - PES_HEADER_SIZE;
    let stored = if length > 65535 { 0 } else { length as u16 };
    pes[4] = (stored >> 8) as u8;
    pes[5] = (stored & 0xff) as u8;
}

// 4-bit tag + 33-bit timestamp split over 5 bytes with marker bits.
fn write_timestamp(buf: &mut BytesMut, marker: u8, ts: u64) {
    let ts = ts & 0x1_ffff_ffff;
    buf.put_u8(marker | ((ts >> 29) & 0x0e) as u8 | 0x01);
    buf.put_u16((((ts >> 14) & 0xfffe) | 0x01) as u16);
    buf.put_u16((((ts << 1) & 0xfffe) | 0x01) as u16);
}
