// Stream IDs
/// PES stream ID for MPEG video streams
pub const STREAM_ID_VIDEO_MPEG: u8 = 0xe0;
/// PES stream ID for MPEG audio streams (MPEG audio and ADTS AAC)
pub const STREAM_ID_AUDIO_MPEG: u8 = 0xc0;
/// PES stream ID for private stream 1 (AC-3, DTS, DVB subtitles)
pub const STREAM_ID_PRIVATE_1: u8 = 0xbd;
/// PES stream ID used by the user-private video encapsulation
pub const STREAM_ID_PRIVATE_VIDEO: u8 = 0xa0;

// PIDs
/// PID for the Program Association Table (PAT)
pub const PID_PAT: u16 = 0x0000;
/// PID for the Network Information Table (NIT)
pub const PID_NIT: u16 = 0x0010;
/// PID for the Service Description Table (SDT)
pub const PID_SDT: u16 = 0x0011;
/// PID for the Time and Date Table (TDT)
pub const PID_TDT: u16 = 0x0014;
/// Null packet PID, also the "unassigned" sentinel
pub const PID_NULL: u16 = 0x1fff;

// Table IDs
/// Table ID for the Program Association Table
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table ID for the Program Map Table
pub const TABLE_ID_PMT: u8 = 0x02;
/// Table ID for the Network Information Table (actual network)
pub const TABLE_ID_NIT_ACTUAL: u8 = 0x40;
/// Table ID for the Service Description Table (actual TS)
pub const TABLE_ID_SDT_ACTUAL: u8 = 0x42;
/// Table ID for the Time and Date Table
pub const TABLE_ID_TDT: u8 = 0x70;

// Elementary stream types
/// Stream type for MPEG-2 video
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
/// Stream type for MPEG-1/2 audio
pub const STREAM_TYPE_MPEG_AUDIO: u8 = 0x04;
/// Stream type for private PES data (DVB AC-3, DTS, subtitles)
pub const STREAM_TYPE_PRIVATE_PES: u8 = 0x06;
/// Stream type for ADTS AAC audio
pub const STREAM_TYPE_ADTS_AAC: u8 = 0x0f;
/// Stream type for MPEG-4 Part 2 video
pub const STREAM_TYPE_MPEG4_VIDEO: u8 = 0x10;
/// Stream type for H.264/AVC video
pub const STREAM_TYPE_H264: u8 = 0x1b;
/// Stream type for ATSC AC-3 audio
pub const STREAM_TYPE_ATSC_A52: u8 = 0x81;
/// Stream type for HDMV DTS audio
pub const STREAM_TYPE_HDMV_DTS: u8 = 0x82;
/// Stream type for user-private encapsulation (non-standard video codecs)
pub const STREAM_TYPE_USER_PRIVATE: u8 = 0xa0;

// Descriptor tags
/// Registration descriptor (format identifier)
pub const DESC_TAG_REGISTRATION: u8 = 0x05;
/// ISO 639 language descriptor
pub const DESC_TAG_ISO639: u8 = 0x0a;
/// DVB network name descriptor
pub const DESC_TAG_NETWORK_NAME: u8 = 0x40;
/// DVB service descriptor
pub const DESC_TAG_SERVICE: u8 = 0x48;
/// DVB subtitling descriptor
pub const DESC_TAG_SUBTITLING: u8 = 0x59;
/// DVB AC-3 descriptor
pub const DESC_TAG_AC3: u8 = 0x6a;

// Sizes
/// Size of a Transport Stream packet in bytes
pub const TS_PACKET_SIZE: usize = 188;
/// Size of the fixed Transport Stream header in bytes
pub const TS_HEADER_SIZE: usize = 4;
/// TS header plus an empty adaptation field (length + flags bytes)
pub const TS_HEADER_SIZE_AF: usize = TS_HEADER_SIZE + 2;
/// TS header plus an adaptation field carrying a PCR
pub const TS_HEADER_SIZE_PCR: usize = TS_HEADER_SIZE_AF + 6;
/// Size of the fixed part of a PES header (start code, stream id, length)
pub const PES_HEADER_SIZE: usize = 6;
/// PES header with optional-field bytes but no timestamps
pub const PES_HEADER_SIZE_NOPTS: usize = PES_HEADER_SIZE + 3;
/// PES header carrying a PTS
pub const PES_HEADER_SIZE_PTS: usize = PES_HEADER_SIZE_NOPTS + 5;
/// PES header carrying both PTS and DTS
pub const PES_HEADER_SIZE_PTSDTS: usize = PES_HEADER_SIZE_PTS + 5;
/// Size of the PSI section header before the table-specific payload
pub const PSI_HEADER_SIZE: usize = 8;
/// Maximum value of the 12-bit section_length field for PSI tables
pub const PSI_MAX_SECTION_LENGTH: usize = 1021;
/// Size of the RTP fixed header
pub const RTP_HEADER_SIZE: usize = 12;

// Clocks
/// Clock frequency for PES timestamps (PTS/DTS) in Hz
pub const PTS_HZ: u64 = 90_000;
/// Clock frequency for the Program Clock Reference in Hz
pub const PCR_HZ: u64 = 27_000_000;
