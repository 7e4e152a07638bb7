use super::types::*;

/// A single 188-byte Transport Stream packet
///
/// Owns the raw cell and exposes field-level accessors so the mux core can
/// post-stamp PCR values and priority flags after the packet chain has been
/// built.
#[derive(Debug, Clone)]
pub struct TsPacket {
    buf: [u8; TS_PACKET_SIZE],
}

impl TsPacket {
    /// Creates a blank packet: sync byte set, PID 0, no adaptation field,
    /// no payload, continuity counter 0
    pub fn init() -> Self {
        let mut buf = [0u8; TS_PACKET_SIZE];
        buf[0] = 0x47;
        Self { buf }
    }

    /// Creates a null (stuffing) packet on PID 0x1fff
    pub fn null() -> Self {
        let mut packet = Self::init();
        packet.set_pid(PID_NULL);
        packet.buf[3] |= 0x10;
        for byte in &mut packet.buf[TS_HEADER_SIZE..] {
            *byte = 0xff;
        }
        packet
    }

    /// Returns the raw 188 bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Sets the 13-bit PID
    pub fn set_pid(&mut self, pid: u16) {
        self.buf[1] = (self.buf[1] & 0xe0) | ((pid >> 8) & 0x1f) as u8;
        self.buf[2] = (pid & 0xff) as u8;
    }

    /// Returns the 13-bit PID
    pub fn pid(&self) -> u16 {
        ((self.buf[1] as u16 & 0x1f) << 8) | self.buf[2] as u16
    }

    /// Sets the 4-bit continuity counter
    pub fn set_cc(&mut self, cc: u8) {
        self.buf[3] = (self.buf[3] & 0xf0) | (cc & 0x0f);
    }

    /// Returns the 4-bit continuity counter
    pub fn cc(&self) -> u8 {
        self.buf[3] & 0x0f
    }

    /// Sets the payload_unit_start indicator
    pub fn set_unit_start(&mut self) {
        self.buf[1] |= 0x40;
    }

    /// Returns the payload_unit_start indicator
    pub fn unit_start(&self) -> bool {
        self.buf[1] & 0x40 != 0
    }

    /// Sets the transport_priority bit
    pub fn set_transport_priority(&mut self) {
        self.buf[1] |= 0x20;
    }

    /// Returns whether the packet declares a payload
    pub fn has_payload(&self) -> bool {
        self.buf[3] & 0x10 != 0
    }

    /// Returns whether an adaptation field is present
    pub fn has_adaptation(&self) -> bool {
        self.buf[3] & 0x20 != 0
    }

    /// Returns the adaptation field length byte (0 when absent)
    pub fn adaptation_length(&self) -> usize {
        if self.has_adaptation() {
            self.buf[4] as usize
        } else {
            0
        }
    }

    /// Inserts an adaptation field of `length` bytes (not counting the
    /// length byte itself), zeroing the flags and stuffing the remainder
    /// with 0xff
    pub fn set_adaptation(&mut self, length: usize) {
        self.buf[3] |= 0x20;
        self.buf[4] = length as u8;
        if length > 0 {
            self.buf[5] = 0;
        }
        if length > 1 {
            for byte in &mut self.buf[6..5 + length] {
                *byte = 0xff;
            }
        }
    }

    /// Byte offset where the payload begins
    pub fn payload_offset(&self) -> usize {
        if self.has_adaptation() {
            TS_HEADER_SIZE + 1 + self.buf[4] as usize
        } else {
            TS_HEADER_SIZE
        }
    }

    /// Copies `data` into the payload area, setting the payload flag.
    ///
    /// The adaptation field, when needed for stuffing, must have been
    /// placed first so that `data` ends exactly on the packet boundary.
    pub fn set_payload(&mut self, data: &[u8]) {
        self.buf[3] |= 0x10;
        let offset = self.payload_offset();
        debug_assert!(offset + data.len() <= TS_PACKET_SIZE);
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Payload size in bytes (0 for adaptation-only packets)
    pub fn payload_len(&self) -> usize {
        if self.has_payload() {
            TS_PACKET_SIZE - self.payload_offset()
        } else {
            0
        }
    }

    /// Sets the adaptation discontinuity indicator
    pub fn set_discontinuity(&mut self) {
        debug_assert!(self.adaptation_length() > 0);
        self.buf[5] |= 0x80;
    }

    /// Sets the adaptation random_access indicator
    pub fn set_random_access(&mut self) {
        debug_assert!(self.adaptation_length() > 0);
        self.buf[5] |= 0x40;
    }

    /// Returns the adaptation random_access indicator
    pub fn has_random_access(&self) -> bool {
        self.adaptation_length() > 0 && self.buf[5] & 0x40 != 0
    }

    /// Sets the adaptation elementary_stream_priority indicator
    pub fn set_stream_priority(&mut self) {
        debug_assert!(self.adaptation_length() > 0);
        self.buf[5] |= 0x20;
    }

    /// Returns whether the adaptation field announces a PCR
    pub fn has_pcr(&self) -> bool {
        self.adaptation_length() > 0 && self.buf[5] & 0x10 != 0
    }

    /// Writes a PCR (33-bit base at 90 kHz, 9-bit extension at 27 MHz)
    /// into the adaptation field and raises the PCR flag.
    ///
    /// The adaptation field must be large enough (at least 7 bytes).
    pub fn set_pcr(&mut self, base: u64, ext: u16) {
        debug_assert!(self.adaptation_length() >= 7);
        self.buf[5] |= 0x10;
        self.buf[6] = (base >> 25) as u8;
        self.buf[7] = (base >> 17) as u8;
        self.buf[8] = (base >> 9) as u8;
        self.buf[9] = (base >> 1) as u8;
        self.buf[10] = ((base << 7) as u8 & 0x80) | 0x7e | ((ext >> 8) as u8 & 0x01);
        self.buf[11] = (ext & 0xff) as u8;
    }

    /// Reads back the PCR as (base, extension)
    pub fn pcr(&self) -> (u64, u16) {
        let base = ((self.buf[6] as u64) << 25)
            | ((self.buf[7] as u64) << 17)
            | ((self.buf[8] as u64) << 9)
            | ((self.buf[9] as u64) << 1)
            | ((self.buf[10] as u64) >> 7);
        let ext = ((self.buf[10] as u16 & 0x01) << 8) | self.buf[11] as u16;
        (base, ext)
    }
}
