use std::ops::{BitOr, BitOrAssign};

/// Flags attached to a media block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockFlags(u32);

impl BlockFlags {
    /// The block is a random access point (I-frame or first of stream)
    pub const TYPE_I: BlockFlags = BlockFlags(0x01);
    /// The payload starts on a frame header
    pub const ALIGNED: BlockFlags = BlockFlags(0x02);
    /// Timing discontinuity before this block
    pub const DISCONTINUITY: BlockFlags = BlockFlags(0x04);

    /// Returns true when all bits of `other` are set
    pub fn contains(&self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`
    pub fn insert(&mut self, other: BlockFlags) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`
    pub fn remove(&mut self, other: BlockFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for BlockFlags {
    type Output = BlockFlags;
    fn bitor(self, rhs: BlockFlags) -> BlockFlags {
        BlockFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BlockFlags {
    fn bitor_assign(&mut self, rhs: BlockFlags) {
        self.0 |= rhs.0;
    }
}

/// One timed access unit handed to the multiplexer
///
/// Timestamps are in microseconds on the caller's clock. `delay` is the
/// buffering delay to be applied downstream (how long the block may sit in
/// the decoder buffer), typically provided by a CPB/VBV model for video.
#[derive(Debug, Clone)]
pub struct Block {
    /// Payload bytes
    pub data: Vec<u8>,
    /// Decode timestamp in microseconds; blocks without one are rejected
    pub dts: Option<i64>,
    /// Presentation timestamp in microseconds; blocks without one are rejected
    pub pts: Option<i64>,
    /// Buffering delay in microseconds
    pub delay: i64,
    /// Block flags
    pub flags: BlockFlags,
}

impl Block {
    /// Creates a block with no timestamps
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            dts: None,
            pts: None,
            delay: 0,
            flags: BlockFlags::default(),
        }
    }

    /// Sets the decode timestamp (microseconds)
    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Sets the presentation timestamp (microseconds)
    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Sets the buffering delay (microseconds)
    pub fn with_delay(mut self, delay: i64) -> Self {
        self.delay = delay;
        self
    }

    /// Marks the block as a random access point
    pub fn key_frame(mut self) -> Self {
        self.flags.insert(BlockFlags::TYPE_I);
        self
    }

    /// Marks a timing discontinuity before the block
    pub fn discontinuity(mut self) -> Self {
        self.flags.insert(BlockFlags::DISCONTINUITY);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut flags = BlockFlags::default();
        assert!(!flags.contains(BlockFlags::TYPE_I));
        flags.insert(BlockFlags::TYPE_I | BlockFlags::ALIGNED);
        assert!(flags.contains(BlockFlags::TYPE_I));
        assert!(flags.contains(BlockFlags::ALIGNED));
        flags.remove(BlockFlags::ALIGNED);
        assert!(!flags.contains(BlockFlags::ALIGNED));
    }

    #[test]
    fn test_block_builder() {
        let block = Block::new(vec![1, 2, 3])
            .with_dts(100)
            .with_pts(140)
            .with_delay(20)
            .key_frame();
        assert_eq!(block.dts, Some(100));
        assert_eq!(block.pts, Some(140));
        assert_eq!(block.delay, 20);
        assert!(block.flags.contains(BlockFlags::TYPE_I));
    }
}
