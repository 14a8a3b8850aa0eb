//! # Peripheral DMA (PDMA) module
//!
//! The PDMA controller has 14 channels. Channel `2n` is the receive channel and channel
//! `2n + 1` the transmit channel of peripheral pair `n`. Each channel consumes a circular ring
//! of [descr::Descriptor]s which is shared between software (producer) and hardware (consumer).
//!
//! The [PdmaChannel] driver is generic over the register access, the descriptor memory and the
//! delay provider, so it can be used with the [MmioChannelRegisters] on the target or with a
//! simulated register block.
use core::{
    num::NonZeroU8,
    sync::atomic::{AtomicU16, Ordering},
};

use arbitrary_int::u5;
use embedded_hal::delay::DelayNs;
pub use leipzig::pdma::{CHANNEL_COUNT, DataUnit, FlowController};

use crate::time::{Microseconds, Milliseconds};

pub mod asynch;
pub mod channel;
pub mod descr;
pub mod mem;
pub mod pads;
pub mod regs;
pub mod ring;
#[cfg(test)]
pub(crate) mod sim;

pub use asynch::{
    ChannelSignals, CompletionCallback, CompletionDispatcher, CompletionFuture, DISPATCHER,
    InterruptResult, on_interrupt,
};
pub use channel::{ChannelState, CompletionMode, PdmaChannel};
pub use descr::{Descriptor, DescriptorFields, MAX_DESC_BYTES, SectionControl};
#[cfg(feature = "alloc")]
pub use mem::HeapDmaMemory;
pub use mem::{AllocError, DescriptorPool, DescriptorRegion, DmaMemory};
pub use pads::{PadMuxRegister, PadMuxUpdate, configure_pads, route_pads};
pub use regs::{ChannelReg, ChannelRegisters, ControllerReg, MmioChannelRegisters};
pub use ring::{DescriptorRing, RingError, Segment, TransferInfo, TransferRequestError};

/// Ring capacity used by [PdmaChannel::open] when no capacity is given.
pub const DEFAULT_RING_CAPACITY: usize = 256;
/// Largest ring the 14-bit depth field can describe.
pub const MAX_RING_CAPACITY: usize = 0x3FFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Peripheral to memory.
    Rx,
    /// Memory to peripheral.
    Tx,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceType {
    Ssic0 = 0,
    Ssic1 = 1,
    Ssic2 = 2,
    Ssic3 = 3,
    I2ssc = 4,
    Uart0 = 5,
    Uart1 = 6,
    Uart2 = 7,
    Uart3 = 8,
    Uart4 = 9,
}

impl DeviceType {
    /// Peripheral pair which serves this device. Some devices share a pair and are selected with
    /// the pad multiplexer, see [pads].
    pub const fn pair(&self) -> u8 {
        match self {
            DeviceType::Ssic0 => 0,
            DeviceType::Ssic1 => 1,
            DeviceType::Ssic2 | DeviceType::Ssic3 => 2,
            DeviceType::I2ssc => 3,
            DeviceType::Uart0 => 4,
            DeviceType::Uart1 => 5,
            DeviceType::Uart2 | DeviceType::Uart3 | DeviceType::Uart4 => 6,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(u8);

impl ChannelId {
    #[inline]
    pub const fn new(index: u8) -> Option<Self> {
        if index as usize >= CHANNEL_COUNT {
            return None;
        }
        Some(Self(index))
    }

    #[inline]
    pub const fn for_device(device: DeviceType, direction: Direction) -> Self {
        let rx = device.pair() * 2;
        match direction {
            Direction::Rx => Self(rx),
            Direction::Tx => Self(rx + 1),
        }
    }

    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn direction(&self) -> Direction {
        if self.0 % 2 == 0 {
            Direction::Rx
        } else {
            Direction::Tx
        }
    }

    #[inline]
    pub const fn pair(&self) -> u8 {
        self.0 / 2
    }

    /// Byte offset of the channel register block relative to the controller base.
    #[inline]
    pub const fn register_offset(&self) -> usize {
        leipzig::pdma::channel_offset(self.0 as usize)
    }

    #[inline]
    const fn mask(&self) -> u16 {
        1 << self.0
    }

    /// Steal the MMIO block of this channel.
    ///
    /// # Safety
    ///
    /// Circumvents ownership and safety guarantees by the HAL.
    #[inline]
    pub const unsafe fn steal_mmio(&self) -> leipzig::pdma::MmioChannel<'static> {
        unsafe {
            leipzig::pdma::Channel::new_mmio_at(
                leipzig::pdma::PDMA_BASE_ADDR + self.register_offset(),
            )
        }
    }

    /// Steal the register access for this channel.
    ///
    /// # Safety
    ///
    /// Circumvents ownership and safety guarantees by the HAL.
    #[inline]
    pub const unsafe fn steal_regs(&self) -> MmioChannelRegisters {
        unsafe { MmioChannelRegisters::steal(*self) }
    }
}

/// Fixed channel assignment of a device and transfer direction.
#[inline]
pub const fn request_channel(device: DeviceType, direction: Direction) -> ChannelId {
    ChannelId::for_device(device, direction)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub device: DeviceType,
    pub direction: Direction,
    /// Swap the byte order of all data units of this channel.
    pub data_swap: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClaimedChannel {
    pub id: ChannelId,
    pub device: DeviceType,
    pub data_swap: bool,
}

impl ClaimedChannel {
    /// Connect the shared pads of the claimed device to its channel pair, see [pads].
    #[inline]
    pub fn route_pads(&self, pads: &mut impl PadMuxRegister) -> Option<PadMuxUpdate> {
        pads::route_pads(pads, self.device)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelRequestError {
    #[error("channel {0:?} is already in use")]
    Busy(ChannelId),
    #[error("invalid channel index {0}")]
    InvalidIndex(u8),
    #[error("invalid device type {0}")]
    InvalidDevice(u8),
}

/// Book-keeping of claimed channels.
///
/// Usually declared as a static which is shared by all drivers using the controller.
pub struct ChannelAllocator {
    claimed: AtomicU16,
}

impl ChannelAllocator {
    #[inline]
    pub const fn new() -> Self {
        Self {
            claimed: AtomicU16::new(0),
        }
    }

    fn claim(&self, id: ChannelId) -> Result<(), ChannelRequestError> {
        let previous = self.claimed.fetch_or(id.mask(), Ordering::AcqRel);
        if previous & id.mask() != 0 {
            return Err(ChannelRequestError::Busy(id));
        }
        Ok(())
    }

    /// Claim the fixed channel of a device and direction.
    pub fn request(&self, request: ChannelRequest) -> Result<ClaimedChannel, ChannelRequestError> {
        let id = request_channel(request.device, request.direction);
        self.claim(id)?;
        log::debug!("pdma: claimed channel {} for {:?}", id.index(), request.device);
        Ok(ClaimedChannel {
            id,
            device: request.device,
            data_swap: request.data_swap,
        })
    }

    /// Claim the fixed channel of a device and direction and route the shared pads to the
    /// device. The pads are only touched if the claim succeeds.
    pub fn request_routed(
        &self,
        request: ChannelRequest,
        pads: &mut impl PadMuxRegister,
    ) -> Result<ClaimedChannel, ChannelRequestError> {
        let claimed = self.request(request)?;
        claimed.route_pads(pads);
        Ok(claimed)
    }

    /// Claim a channel by its raw index and raw device type, as found in a device tree
    /// `dmas = <&pdma channel device swap>` specifier.
    pub fn request_by_index(
        &self,
        index: u8,
        device: u8,
        data_swap: bool,
    ) -> Result<ClaimedChannel, ChannelRequestError> {
        let id = ChannelId::new(index).ok_or(ChannelRequestError::InvalidIndex(index))?;
        let device =
            DeviceType::try_from(device).map_err(|_| ChannelRequestError::InvalidDevice(device))?;
        self.claim(id)?;
        Ok(ClaimedChannel {
            id,
            device,
            data_swap,
        })
    }

    pub fn release(&self, id: ChannelId) {
        self.claimed.fetch_and(!id.mask(), Ordering::AcqRel);
    }

    #[inline]
    pub fn is_claimed(&self, id: ChannelId) -> bool {
        self.claimed.load(Ordering::Acquire) & id.mask() != 0
    }
}

impl Default for ChannelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic bus width of a peripheral data register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusWidth {
    OneByte = 1,
    TwoBytes = 2,
    ThreeBytes = 3,
    FourBytes = 4,
    EightBytes = 8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported bus width {0:?}")]
pub struct UnsupportedBusWidth(pub BusWidth);

impl TryFrom<BusWidth> for DataUnit {
    type Error = UnsupportedBusWidth;

    fn try_from(width: BusWidth) -> Result<Self, Self::Error> {
        match width {
            BusWidth::OneByte => Ok(DataUnit::Byte),
            BusWidth::TwoBytes => Ok(DataUnit::HalfWord),
            BusWidth::FourBytes => Ok(DataUnit::Word),
            _ => Err(UnsupportedBusWidth(width)),
        }
    }
}

/// Transfer profile of a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub data_unit: DataUnit,
    pub burst_len: u5,
    /// Scatter-gather segment count. The register holds the count minus one.
    pub sg_segments: NonZeroU8,
    pub flow_control: FlowController,
    /// Enable the reset, section complete and bus error interrupts.
    pub interrupts: bool,
}

impl ChannelConfig {
    pub const DEFAULT_SG_SEGMENTS: NonZeroU8 = NonZeroU8::new(4).unwrap();

    pub const fn new(data_unit: DataUnit, burst_len: u5) -> Self {
        Self {
            data_unit,
            burst_len,
            sg_segments: Self::DEFAULT_SG_SEGMENTS,
            flow_control: FlowController::Dma,
            interrupts: true,
        }
    }

    /// Create a configuration from a generic bus width, rejecting widths the controller can not
    /// transfer.
    pub fn with_bus_width(width: BusWidth, burst_len: u5) -> Result<Self, UnsupportedBusWidth> {
        Ok(Self::new(DataUnit::try_from(width)?, burst_len))
    }
}

/// Bounds for all hardware polling loops.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub reset: Milliseconds,
    /// Wait for the peripheral handshake to become idle.
    pub handshake: Milliseconds,
    /// Wait for a section complete in polled mode.
    pub transfer: Milliseconds,
    pub poll_interval: Microseconds,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            reset: Milliseconds::millis(20),
            handshake: Milliseconds::millis(20),
            transfer: Milliseconds::millis(1000),
            poll_interval: Microseconds::micros(10),
        }
    }
}

/// Hardware event a bounded wait was waiting for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitEvent {
    ResetComplete,
    HandshakeIdle,
    SectionComplete,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PdmaError {
    #[error("descriptor memory allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("timeout waiting for {0:?}")]
    Timeout(WaitEvent),
    #[error("transfer request rejected: {0}")]
    Rejected(#[from] TransferRequestError),
    #[error("ring overflow: {needed} descriptors needed, {available} available")]
    RingFull { needed: usize, available: usize },
    #[error("bus error reported by the channel")]
    BusError,
    #[error("operation not allowed in channel state {0:?}")]
    InvalidState(ChannelState),
    #[error("no descriptor ring allocated")]
    NoRing,
    #[error("descriptor ring already allocated")]
    RingAlreadyAllocated,
    #[error("channel does not use interrupt completion")]
    InterruptsNotConfigured,
}

impl From<RingError> for PdmaError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::Rejected(err) => PdmaError::Rejected(err),
            RingError::Full { needed, available } => PdmaError::RingFull { needed, available },
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bounded wait timed out")]
pub struct TimeoutError;

/// Poll `done` until it returns true, waiting `interval` between polls.
///
/// The condition is checked one last time after the timeout expired.
pub fn poll_until(
    delay: &mut impl DelayNs,
    timeout: Milliseconds,
    interval: Microseconds,
    mut done: impl FnMut() -> bool,
) -> Result<(), TimeoutError> {
    let timeout_us = timeout.to_micros();
    let interval_us = interval.to_micros().max(1);
    let mut waited_us: u32 = 0;
    loop {
        if done() {
            return Ok(());
        }
        if waited_us >= timeout_us {
            return Err(TimeoutError);
        }
        delay.delay_us(interval_us);
        waited_us = waited_us.saturating_add(interval_us);
    }
}

/// Read the controller version register.
pub fn controller_version(regs: &mut impl ChannelRegisters) -> u32 {
    regs.read_controller(ControllerReg::Version)
}
