//! Fixed-offset binary schemas.
//!
//! The QPU reads these records straight out of shared memory, so every field
//! sits at an explicit little-endian offset with no padding between fields.

/// Writes `value` little-endian at `offset`.
///
/// Panics if the field does not fit in `buf`.
#[inline]
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Reads a little-endian `u32` at `offset`.
///
/// Panics if the field does not fit in `buf`.
#[inline]
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Writes an `f32` as its IEEE-754 bit pattern at `offset`.
#[inline]
pub fn put_f32(buf: &mut [u8], offset: usize, value: f32) {
    put_u32(buf, offset, value.to_bits());
}

/// Reads an `f32` stored as its IEEE-754 bit pattern at `offset`.
#[inline]
pub fn get_f32(buf: &[u8], offset: usize) -> f32 {
    f32::from_bits(get_u32(buf, offset))
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
///
/// Only for values known to be small, such as record sizes. Sizes that come
/// from callers go through [`checked_align_up`].
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Like [`align_up`], but returns `None` instead of overflowing.
///
/// # Arguments
///
/// * `value` - Byte count to round up
/// * `align` - Power-of-two alignment
///
/// # Returns
///
/// The rounded value, or `None` if it does not fit in a `usize`.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// The minimal record that starts one QPU.
///
/// The firmware's `execute_qpu` call and the direct submission path both
/// consume an array of these: the uniforms pointer goes to SRQUA and the
/// program pointer to SRQPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchMessage {
    /// Bus address of the unit's parameter block.
    pub uniforms_bus: u32,
    /// Bus address of the program entry point.
    pub code_bus: u32,
}

impl DispatchMessage {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    const UNIFORMS: usize = 0;
    const CODE: usize = 4;

    /// Encodes the message in the packed layout the firmware reads.
    ///
    /// The uniforms pointer comes first, then the program pointer, both
    /// little-endian with no padding.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        put_u32(&mut out, Self::UNIFORMS, self.uniforms_bus);
        put_u32(&mut out, Self::CODE, self.code_bus);
        out
    }

    /// Decodes a message written by [`DispatchMessage::to_bytes`].
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            uniforms_bus: get_u32(bytes, Self::UNIFORMS),
            code_bus: get_u32(bytes, Self::CODE),
        }
    }
}

/// Bookkeeping written at the start of every shared region.
///
/// The header lets the region be identified from a raw memory dump and
/// mirrors the state the session uses to tear the region down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionHeader {
    /// Host virtual address of the mapped register window.
    pub peri_ptr: u64,
    /// Byte size of the register window mapping.
    pub peri_size: u32,
    /// Identifier of the firmware channel (the mailbox descriptor).
    pub channel: u32,
    /// Firmware allocation handle.
    pub handle: u32,
    /// Total allocation size in bytes, header included.
    pub size: u32,
    /// Bus address of the first byte of the region.
    pub bus_base: u32,
}

impl RegionHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 28;

    /// Bytes reserved for the header in front of the payload.
    ///
    /// QPU code must start on a 16-byte boundary, and the program image is
    /// the first payload block.
    pub const SPAN: usize = align_up(Self::SIZE, 16);

    const PERI_PTR_LO: usize = 0;
    const PERI_PTR_HI: usize = 4;
    const PERI_SIZE: usize = 8;
    const CHANNEL: usize = 12;
    const HANDLE: usize = 16;
    const TOTAL: usize = 20;
    const BUS_BASE: usize = 24;

    /// Encodes the header. The 64-bit register pointer is split into two
    /// little-endian words, low word first.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        put_u32(&mut out, Self::PERI_PTR_LO, self.peri_ptr as u32);
        put_u32(&mut out, Self::PERI_PTR_HI, (self.peri_ptr >> 32) as u32);
        put_u32(&mut out, Self::PERI_SIZE, self.peri_size);
        put_u32(&mut out, Self::CHANNEL, self.channel);
        put_u32(&mut out, Self::HANDLE, self.handle);
        put_u32(&mut out, Self::TOTAL, self.size);
        put_u32(&mut out, Self::BUS_BASE, self.bus_base);
        out
    }

    /// Decodes a header read back from the start of a region.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let lo = get_u32(bytes, Self::PERI_PTR_LO) as u64;
        let hi = get_u32(bytes, Self::PERI_PTR_HI) as u64;
        Self {
            peri_ptr: lo | (hi << 32),
            peri_size: get_u32(bytes, Self::PERI_SIZE),
            channel: get_u32(bytes, Self::CHANNEL),
            handle: get_u32(bytes, Self::HANDLE),
            size: get_u32(bytes, Self::TOTAL),
            bus_base: get_u32(bytes, Self::BUS_BASE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_message_layout_is_packed() {
        let msg = DispatchMessage {
            uniforms_bus: 0xC000_1040,
            code_bus: 0xC000_1020,
        };
        assert_eq!(
            msg.to_bytes(),
            [0x40, 0x10, 0x00, 0xC0, 0x20, 0x10, 0x00, 0xC0]
        );
        assert_eq!(DispatchMessage::from_bytes(&msg.to_bytes()), msg);
    }

    #[test]
    fn checked_align_up_refuses_overflow() {
        assert_eq!(checked_align_up(5000, 4096), Some(8192));
        assert_eq!(checked_align_up(4096, 4096), Some(4096));
        assert_eq!(checked_align_up(usize::MAX - 4094, 4096), None);
        assert_eq!(checked_align_up(usize::MAX, 16), None);
    }

    #[test]
    fn header_span_keeps_code_aligned() {
        assert_eq!(RegionHeader::SPAN % 16, 0);
        assert!(RegionHeader::SPAN >= RegionHeader::SIZE);
    }

    #[test]
    fn header_fields_land_at_fixed_offsets() {
        let header = RegionHeader {
            peri_ptr: 0x0000_7f00_1234_5000,
            peri_size: 0x0100_0000,
            channel: 3,
            handle: 9,
            size: 0x2000,
            bus_base: 0xC040_0000,
        };
        let bytes = header.to_bytes();
        assert_eq!(get_u32(&bytes, 0), 0x1234_5000);
        assert_eq!(get_u32(&bytes, 4), 0x0000_7f00);
        assert_eq!(get_u32(&bytes, 24), 0xC040_0000);
        assert_eq!(RegionHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
