// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support.
#![allow(clippy::cast_possible_truncation)]

use arbitrary_int::u20;
use bitbybit::bitfield;

/// One entry of a (single-level, 4KB-page) page table, in the x86 layout.
///
/// The demand pager only reads and writes entries through the accessors
/// below; the hardware-walk side of this structure belongs to the boot and
/// trap layers.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    frame: u20,
}

impl PageTableEntry {
    pub fn frame_number(&self) -> usize {
        self.frame().value() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let pte = PageTableEntry::default()
            .with_present(true)
            .with_read_write(true)
            .with_user_supervisor(true)
            .with_frame(u20::new(0x1234));
        assert!(pte.present());
        assert!(pte.read_write());
        assert!(pte.user_supervisor());
        assert!(!pte.dirty());
        assert_eq!(pte.frame_number(), 0x1234);
    }

    #[test]
    fn test_default_is_not_present() {
        let pte = PageTableEntry::default();
        assert!(!pte.present());
        assert_eq!(pte.raw_value(), 0);
    }
}
