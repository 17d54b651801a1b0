//! Usage masks and lock-state bits.

use bitflags::bitflags;

bitflags! {
    /// Buffer usage requested by a producer or consumer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u32 {
        /// CPU reads rarely.
        const SW_READ_RARELY = 0x0000_0002;
        /// CPU reads often.
        const SW_READ_OFTEN = 0x0000_0003;
        /// Any CPU read access.
        const SW_READ_MASK = 0x0000_000F;
        /// CPU writes rarely.
        const SW_WRITE_RARELY = 0x0000_0020;
        /// CPU writes often.
        const SW_WRITE_OFTEN = 0x0000_0030;
        /// Any CPU write access.
        const SW_WRITE_MASK = 0x0000_00F0;
        /// GPU texture.
        const HW_TEXTURE = 0x0000_0100;
        /// GPU render target.
        const HW_RENDER = 0x0000_0200;
        /// 2D blitter.
        const HW_2D = 0x0000_0400;
        /// Hardware composer overlay.
        const HW_COMPOSER = 0x0000_0800;
        /// Framebuffer.
        const HW_FB = 0x0000_1000;
        /// Video encoder.
        const HW_VIDEO_ENCODER = 0x0001_0000;
        /// FIMC1 scaler (reserved region).
        const HW_FIMC1 = 0x0100_0000;
        /// ION-allocated buffer.
        const HW_ION = 0x0200_0000;
        /// Lock returns luma/chroma plane addresses instead of a base pointer.
        const YUV_ADDR = 0x0400_0000;
    }
}

impl Usage {
    /// True if the CPU reads or writes the buffer directly.
    #[inline]
    pub fn wants_cpu_access(self) -> bool {
        self.intersects(Usage::SW_READ_MASK | Usage::SW_WRITE_MASK)
    }

    /// True if any CPU write bit is set.
    #[inline]
    pub fn wants_cpu_write(self) -> bool {
        self.intersects(Usage::SW_WRITE_MASK)
    }

    /// True if plane addresses were requested.
    #[inline]
    pub fn wants_planes(self) -> bool {
        self.contains(Usage::YUV_ADDR)
    }
}

bitflags! {
    /// Lock state of a registered handle.
    ///
    /// The low 30 bits count concurrent CPU readers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LockState: u32 {
        /// Locked for CPU write.
        const WRITE = 1 << 31;
        /// Mapped into the owning process.
        const MAPPED = 1 << 30;
        /// Reader count.
        const READ_MASK = 0x3FFF_FFFF;
    }
}

impl LockState {
    /// Number of CPU readers currently holding the lock.
    #[inline]
    pub fn readers(self) -> u32 {
        (self & LockState::READ_MASK).bits()
    }

    /// True if a reader or writer holds the buffer.
    #[inline]
    pub fn is_locked(self) -> bool {
        self.contains(LockState::WRITE) || self.readers() > 0
    }

    /// Same state with the reader count replaced.
    pub fn with_readers(self, readers: u32) -> Self {
        let kept = self - LockState::READ_MASK;
        kept | LockState::from_bits_retain(readers & LockState::READ_MASK.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_access_detection() {
        assert!(Usage::SW_READ_OFTEN.wants_cpu_access());
        assert!(Usage::SW_WRITE_RARELY.wants_cpu_access());
        assert!(!Usage::HW_TEXTURE.wants_cpu_access());
        assert!(!Usage::SW_READ_OFTEN.wants_cpu_write());
        assert!((Usage::HW_2D | Usage::YUV_ADDR).wants_planes());
    }

    #[test]
    fn test_reader_count() {
        let state = LockState::MAPPED.with_readers(3);
        assert_eq!(state.readers(), 3);
        assert!(state.contains(LockState::MAPPED));
        assert!(state.is_locked());

        let state = state.with_readers(0);
        assert_eq!(state, LockState::MAPPED);
        assert!(!state.is_locked());
    }

    #[test]
    fn test_write_bit_is_locked() {
        let state = LockState::MAPPED | LockState::WRITE;
        assert!(state.is_locked());
        assert_eq!(state.readers(), 0);
    }
}
