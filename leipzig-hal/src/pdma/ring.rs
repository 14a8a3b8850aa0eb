//! Descriptor ring bookkeeping.
//!
//! Software produces descriptors at the tail, the DMA hardware consumes them at the head. Both
//! sides keep a wrap bit which toggles every time their index passes the end of the ring, so
//! an equal index on both sides can be told apart as either an empty or a full ring.
use super::{
    descr::{Descriptor, MAX_DESC_BYTES, SectionControl},
    mem::DescriptorRegion,
};

/// One contiguous memory section of a scatter-gather request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Bus address.
    pub addr: u32,
    pub len: u32,
}

impl Segment {
    #[inline]
    pub const fn new(addr: u32, len: u32) -> Self {
        Self { addr, len }
    }

    /// Number of descriptors required to describe this segment.
    #[inline]
    pub const fn descriptors_needed(&self) -> usize {
        self.len.div_ceil(MAX_DESC_BYTES) as usize
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferRequestError {
    #[error("scatter-gather list is empty")]
    EmptyList,
    #[error("segment {0} has a null address")]
    NullAddress(usize),
    #[error("segment {0} has zero length")]
    ZeroLength(usize),
    #[error("segment {0} exceeds the 32-bit address space")]
    AddressOverflow(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("transfer request rejected: {0}")]
    Rejected(#[from] TransferRequestError),
    #[error("ring overflow: {needed} descriptors needed, {available} available")]
    Full { needed: usize, available: usize },
}

/// Result of queueing one scatter-gather request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub first_index: usize,
    /// Index of the only descriptor with the section interrupt enabled.
    pub last_index: usize,
    pub descriptors: usize,
    pub total_bytes: u64,
}

pub struct DescriptorRing {
    region: DescriptorRegion,
    /// Next free slot.
    tail: usize,
    wrap: bool,
    /// Next slot the hardware reads, as last reported by the hardware.
    head: usize,
    head_wrap: bool,
}

impl DescriptorRing {
    /// Take ownership of a descriptor region and clear all of its descriptors.
    pub fn new(region: DescriptorRegion) -> Self {
        for descr in region.as_slice() {
            descr.clear();
        }
        Self {
            region,
            tail: 0,
            wrap: false,
            head: 0,
            head_wrap: false,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }

    #[inline]
    pub fn wrap(&self) -> bool {
        self.wrap
    }

    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn head_wrap(&self) -> bool {
        self.head_wrap
    }

    #[inline]
    pub fn bus_addr(&self) -> u32 {
        self.region.bus_addr()
    }

    #[inline]
    pub fn region(&self) -> &DescriptorRegion {
        &self.region
    }

    #[inline]
    pub fn descriptors(&self) -> &[Descriptor] {
        self.region.as_slice()
    }

    #[inline]
    pub fn descriptor(&self, index: usize) -> Option<&Descriptor> {
        self.region.as_slice().get(index)
    }

    /// Update the consumer position from the hardware read pointer and read wrap bit.
    ///
    /// A read pointer outside the ring is ignored.
    pub fn sync_head(&mut self, read_ptr: usize, read_wrap: bool) {
        if read_ptr >= self.capacity() {
            log::warn!(
                "ignoring hardware read pointer {} for ring of {} descriptors",
                read_ptr,
                self.capacity()
            );
            return;
        }
        self.head = read_ptr;
        self.head_wrap = read_wrap;
    }

    /// Descriptors written but not yet consumed by the hardware.
    pub fn occupancy(&self) -> usize {
        if self.wrap == self.head_wrap {
            self.tail.saturating_sub(self.head)
        } else {
            (self.capacity() - self.head + self.tail).min(self.capacity())
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.occupancy()
    }

    pub fn descriptors_needed(segments: &[Segment]) -> usize {
        segments.iter().map(Segment::descriptors_needed).sum()
    }

    fn validate(segments: &[Segment]) -> Result<(), TransferRequestError> {
        if segments.is_empty() {
            return Err(TransferRequestError::EmptyList);
        }
        for (idx, segment) in segments.iter().enumerate() {
            if segment.len == 0 {
                return Err(TransferRequestError::ZeroLength(idx));
            }
            if segment.addr == 0 {
                return Err(TransferRequestError::NullAddress(idx));
            }
            if segment.addr.checked_add(segment.len - 1).is_none() {
                return Err(TransferRequestError::AddressOverflow(idx));
            }
        }
        Ok(())
    }

    #[inline]
    fn advance_tail(&mut self) {
        self.tail += 1;
        if self.tail == self.capacity() {
            self.tail = 0;
            self.wrap = !self.wrap;
        }
    }

    /// Write the descriptors for a scatter-gather request at the tail of the ring.
    ///
    /// Each segment is split into sections of at most [MAX_DESC_BYTES]. Only the last
    /// descriptor of the whole request has the section interrupt enabled. Nothing is written if
    /// the request is invalid or the ring does not have enough free slots.
    pub fn enqueue(
        &mut self,
        segments: &[Segment],
        data_swap: bool,
    ) -> Result<TransferInfo, RingError> {
        Self::validate(segments)?;
        let needed = Self::descriptors_needed(segments);
        let available = self.available();
        if needed > available {
            return Err(RingError::Full { needed, available });
        }

        let first_index = self.tail;
        let mut last_index = self.tail;
        let mut total_bytes = 0;
        for segment in segments {
            let mut addr = segment.addr;
            let mut remaining = segment.len;
            while remaining > 0 {
                let chunk = remaining.min(MAX_DESC_BYTES);
                let control = SectionControl::for_section(chunk, data_swap)
                    .ok_or(TransferRequestError::ZeroLength(0))?;
                let descr = &self.region.as_slice()[self.tail];
                descr.set_addr(addr);
                descr.set_control(control);
                last_index = self.tail;
                self.advance_tail();
                addr = addr.wrapping_add(chunk);
                remaining -= chunk;
                total_bytes += chunk as u64;
            }
        }
        let last = &self.region.as_slice()[last_index];
        last.set_control(last.control().with_section_irq(true));

        Ok(TransferInfo {
            first_index,
            last_index,
            descriptors: needed,
            total_bytes,
        })
    }

    /// Give the descriptor memory back, for example to free it.
    #[inline]
    pub fn into_region(self) -> DescriptorRegion {
        self.region
    }
}
