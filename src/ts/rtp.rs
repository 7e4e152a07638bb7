use super::types::RTP_HEADER_SIZE;
use bytes::{BufMut, BytesMut};

/// RTP payload type for MPEG-2 Transport Stream (RFC 3551)
pub const RTP_TYPE_TS: u8 = 33;

/// Writes the 12-byte fixed RTP header (RFC 3550) that precedes a group
/// of TS packets.
///
/// The timestamp is the group's PCR reduced to the 90 kHz RTP clock
/// (PCR / 300). No padding, extension or CSRC entries are emitted.
pub fn write_header(
    buf: &mut BytesMut,
    sequence_number: u16,
    timestamp: u32,
    ssrc: [u8; 4],
) {
    buf.reserve(RTP_HEADER_SIZE);
    buf.put_u8(0x80); // version 2, no padding, no extension, no CSRC
    buf.put_u8(RTP_TYPE_TS); // no marker
    buf.put_u16(sequence_number);
    buf.put_u32(timestamp);
    buf.put_slice(&ssrc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rtp_header_layout() {
        let mut buf = BytesMut::new();
        write_header(&mut buf, 0x1234, 0x01020304, [1, 2, 3, 4]);

        assert_eq!(buf.len(), RTP_HEADER_SIZE);
        assert_eq!(buf[0] >> 6, 2); // version
        assert_eq!(buf[1] & 0x7f, RTP_TYPE_TS);
        assert_eq!(&buf[2..4], &[0x12, 0x34]);
        assert_eq!(&buf[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
    }
}
