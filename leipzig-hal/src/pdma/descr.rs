//! PDMA ring descriptors.
//!
//! A descriptor describes one contiguous section of at most [MAX_DESC_BYTES] bytes. The second
//! word holds the section size minus one together with the interrupt and byte swap flags.
use arbitrary_int::u15;
use vcell::VolatileCell;

/// Maximum number of bytes a single descriptor can describe.
pub const MAX_DESC_BYTES: u32 = 32768;

#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
pub struct SectionControl {
    /// Raise the section complete interrupt after this descriptor was processed.
    #[bit(31, rw)]
    section_irq: bool,
    /// Raise the scatter-gather section interrupt after this descriptor was processed.
    #[bit(30, rw)]
    sg_irq: bool,
    /// Swap the byte order of the transferred data units.
    #[bit(29, rw)]
    data_swap: bool,
    #[bits(0..=14, rw)]
    size_minus_one: u15,
}

impl SectionControl {
    /// Control word for a section of `len` bytes with all interrupts disabled.
    ///
    /// Returns [None] if `len` is zero or larger than [MAX_DESC_BYTES].
    pub fn for_section(len: u32, data_swap: bool) -> Option<Self> {
        if len == 0 || len > MAX_DESC_BYTES {
            return None;
        }
        Some(
            Self::new_with_raw_value(0)
                .with_size_minus_one(u15::new((len - 1) as u16))
                .with_data_swap(data_swap),
        )
    }

    #[inline]
    pub fn section_len(&self) -> u32 {
        self.size_minus_one().value() as u32 + 1
    }
}

/// PDMA ring descriptor.
///
/// Descriptors are written by software before a transfer is published to the hardware and are
/// only read by the hardware afterwards. Both words are stored in little-endian byte order.
#[repr(C, align(8))]
pub struct Descriptor {
    /// Bus address of the section.
    pub word0: VolatileCell<u32>,
    pub word1: VolatileCell<SectionControl>,
}

/// Decoded content of a [Descriptor].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorFields {
    pub addr: u32,
    /// Section length in bytes, `1..=MAX_DESC_BYTES`.
    pub len: u32,
    pub data_swap: bool,
    pub section_irq: bool,
    pub sg_irq: bool,
}

impl Descriptor {
    #[inline]
    pub const fn new() -> Self {
        Self {
            word0: VolatileCell::new(0),
            word1: VolatileCell::new(SectionControl::new_with_raw_value(0)),
        }
    }

    #[inline]
    pub fn addr(&self) -> u32 {
        self.word0.get()
    }

    #[inline]
    pub fn set_addr(&self, addr: u32) {
        self.word0.set(addr)
    }

    #[inline]
    pub fn control(&self) -> SectionControl {
        self.word1.get()
    }

    #[inline]
    pub fn set_control(&self, control: SectionControl) {
        self.word1.set(control)
    }

    #[inline]
    pub fn clear(&self) {
        self.word0.set(0);
        self.word1.set(SectionControl::new_with_raw_value(0));
    }

    /// Encode the given fields into the descriptor.
    ///
    /// Returns [None] and leaves the descriptor untouched if the length is invalid.
    pub fn write_fields(&self, fields: &DescriptorFields) -> Option<()> {
        let control = SectionControl::for_section(fields.len, fields.data_swap)?
            .with_section_irq(fields.section_irq)
            .with_sg_irq(fields.sg_irq);
        self.set_addr(fields.addr);
        self.set_control(control);
        Some(())
    }

    pub fn fields(&self) -> DescriptorFields {
        let control = self.control();
        DescriptorFields {
            addr: self.addr(),
            len: control.section_len(),
            data_swap: control.data_swap(),
            section_irq: control.section_irq(),
            sg_irq: control.sg_irq(),
        }
    }

    /// Both descriptor words in their hardware byte order.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0..4].copy_from_slice(&self.addr().to_le_bytes());
        bytes[4..8].copy_from_slice(&self.control().raw_value().to_le_bytes());
        bytes
    }
}

impl Default for Descriptor {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
