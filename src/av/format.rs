/// Supported codec identifiers for elementary streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    /// MPEG-1/2 video
    Mpgv,
    /// MPEG-4 Part 2 video
    Mp4v,
    /// H.264/AVC video
    H264,
    /// MPEG-1/2 audio
    Mpga,
    /// MPEG-4 AAC audio
    Mp4a,
    /// AC-3 (Dolby Digital) audio
    A52,
    /// DTS Coherent Acoustics audio
    Dts,
    /// DVB subtitles
    DvbSub,
    /// H.263 video
    H263,
    /// Intel H.263 video
    H263i,
    /// Windows Media Video 7
    Wmv1,
    /// Windows Media Video 8
    Wmv2,
    /// Windows Media Video 9
    Wmv3,
    /// MS MPEG-4 v1
    Div1,
    /// MS MPEG-4 v2
    Div2,
    /// MS MPEG-4 v3
    Div3,
    /// Motion JPEG
    Mjpg,
    /// FFmpeg FFV1 video
    Ffv1,
    /// FFmpeg HuffYUV video
    FfvHuff,
}

/// Broad category of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCategory {
    /// Video streams
    Video,
    /// Audio streams
    Audio,
    /// Subtitle streams
    Subtitle,
}

impl CodecId {
    /// Returns the stream category of the codec
    pub fn category(&self) -> StreamCategory {
        match self {
            CodecId::Mpga | CodecId::Mp4a | CodecId::A52 | CodecId::Dts => StreamCategory::Audio,
            CodecId::DvbSub => StreamCategory::Subtitle,
            _ => StreamCategory::Video,
        }
    }

    /// Four-character code of the codec, as used in option matching and
    /// the user-private descriptor
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            CodecId::Mpgv => *b"mpgv",
            CodecId::Mp4v => *b"mp4v",
            CodecId::H264 => *b"h264",
            CodecId::Mpga => *b"mpga",
            CodecId::Mp4a => *b"mp4a",
            CodecId::A52 => *b"a52 ",
            CodecId::Dts => *b"dts ",
            CodecId::DvbSub => *b"dvbs",
            CodecId::H263 => *b"h263",
            CodecId::H263i => *b"I263",
            CodecId::Wmv1 => *b"WMV1",
            CodecId::Wmv2 => *b"WMV2",
            CodecId::Wmv3 => *b"WMV3",
            CodecId::Div1 => *b"DIV1",
            CodecId::Div2 => *b"DIV2",
            CodecId::Div3 => *b"DIV3",
            CodecId::Mjpg => *b"MJPG",
            CodecId::Ffv1 => *b"FFV1",
            CodecId::FfvHuff => *b"FFVH",
        }
    }
}

/// Video-specific format parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoParams {
    /// Frame rate numerator
    pub frame_rate: u32,
    /// Frame rate denominator
    pub frame_rate_base: u32,
    /// Picture width in pixels
    pub width: u32,
    /// Picture height in pixels
    pub height: u32,
    /// Peak bitrate of the coded stream in bits per second (0 = unknown)
    pub max_bitrate: u32,
    /// Coded picture buffer size in bits (0 = unknown)
    pub cpb_buffer: u32,
}

/// Audio-specific format parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioParams {
    /// Sample rate in Hz
    pub rate: u32,
    /// Samples per frame
    pub frame_length: u32,
    /// Coded bytes per frame (0 = derive from bitrate)
    pub bytes_per_frame: u32,
}

/// Description of an elementary stream handed to `TsMux::add_input`
///
/// Equality over the whole record is used to resurrect a deleted input
/// when an identical stream is re-added.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFormat {
    /// Codec of the stream
    pub codec: CodecId,
    /// Caller-side elementary stream ID (-1 when absent); used for PID
    /// assignment in `es_id_pid` mode and for option matching
    pub es_id: i32,
    /// Declared bitrate in bits per second (0 = unknown)
    pub bitrate: u32,
    /// ISO-639 language (2- or 3-letter code)
    pub language: Option<String>,
    /// Codec extradata: AVC decoder configuration, AudioSpecificConfig,
    /// or a prebuilt DVB subtitling descriptor payload
    pub extra: Vec<u8>,
    /// Video parameters, present for video codecs
    pub video: Option<VideoParams>,
    /// Audio parameters, present for audio codecs
    pub audio: Option<AudioParams>,
}

impl StreamFormat {
    /// Creates a bare format for `codec`
    pub fn new(codec: CodecId) -> Self {
        Self {
            codec,
            es_id: -1,
            bitrate: 0,
            language: None,
            extra: Vec::new(),
            video: None,
            audio: None,
        }
    }

    /// Convenience constructor for an H.264 video stream
    pub fn video_h264(frame_rate: u32, frame_rate_base: u32, bitrate: u32) -> Self {
        let mut fmt = Self::new(CodecId::H264);
        fmt.bitrate = bitrate;
        fmt.video = Some(VideoParams {
            frame_rate,
            frame_rate_base,
            ..VideoParams::default()
        });
        fmt
    }

    /// Convenience constructor for an MPEG-2 video stream
    pub fn video_mpeg2(frame_rate: u32, frame_rate_base: u32, bitrate: u32) -> Self {
        let mut fmt = Self::new(CodecId::Mpgv);
        fmt.bitrate = bitrate;
        fmt.video = Some(VideoParams {
            frame_rate,
            frame_rate_base,
            ..VideoParams::default()
        });
        fmt
    }

    /// Convenience constructor for an MPEG audio stream
    pub fn audio_mp2(rate: u32, frame_length: u32, bitrate: u32) -> Self {
        let mut fmt = Self::new(CodecId::Mpga);
        fmt.bitrate = bitrate;
        fmt.audio = Some(AudioParams {
            rate,
            frame_length,
            bytes_per_frame: 0,
        });
        fmt
    }

    /// Convenience constructor for an AAC stream with its
    /// AudioSpecificConfig bytes
    pub fn audio_aac(rate: u32, bitrate: u32, audio_specific_config: Vec<u8>) -> Self {
        let mut fmt = Self::new(CodecId::Mp4a);
        fmt.bitrate = bitrate;
        fmt.extra = audio_specific_config;
        fmt.audio = Some(AudioParams {
            rate,
            frame_length: 1024,
            bytes_per_frame: 0,
        });
        fmt
    }

    /// Sets the caller-side ES identifier
    pub fn with_es_id(mut self, es_id: i32) -> Self {
        self.es_id = es_id;
        self
    }

    /// Sets the stream language
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(CodecId::H264.category(), StreamCategory::Video);
        assert_eq!(CodecId::Mp4a.category(), StreamCategory::Audio);
        assert_eq!(CodecId::DvbSub.category(), StreamCategory::Subtitle);
        assert_eq!(CodecId::Wmv3.category(), StreamCategory::Video);
    }

    #[test]
    fn test_format_equality_for_resurrection() {
        let a = StreamFormat::video_h264(25, 1, 4_000_000).with_es_id(12);
        let b = StreamFormat::video_h264(25, 1, 4_000_000).with_es_id(12);
        let c = StreamFormat::video_h264(30, 1, 4_000_000).with_es_id(12);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
