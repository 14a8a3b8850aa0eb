//! # Peripheral DMA (PDMA) register module
//!
//! The controller consists of a common block (version, clock control and the shared peripheral
//! memory windows) followed by 14 channel blocks. Even channel indices are receive channels and
//! odd channel indices are transmit channels, so channels `2n` and `2n + 1` form one peripheral
//! pair.
use arbitrary_int::{u5, u14};

pub const PDMA_BASE_ADDR: usize = 0xC500_0000;

/// Offset of the first channel block relative to [PDMA_BASE_ADDR].
pub const CHANNEL_BLOCK_OFFSET: usize = 0x30;
/// Distance between two consecutive channel blocks.
pub const CHANNEL_STRIDE: usize = 0x2C;
pub const CHANNEL_COUNT: usize = 14;

/// Byte offset of a channel block relative to [PDMA_BASE_ADDR].
///
/// Receive channel `n` lives at `0x30 + 0x58 * n`, transmit channel `n` at `0x5C + 0x58 * n`.
#[inline]
pub const fn channel_offset(index: usize) -> usize {
    CHANNEL_BLOCK_OFFSET + index * CHANNEL_STRIDE
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct ClockCtrl0 {
    /// One clock enable bit per channel.
    #[bits(0..=13, rw)]
    clock_enable: u14,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct ClockCtrl1 {
    /// Bypass the automatic clock gating of a channel.
    #[bits(16..=29, rw)]
    gating_bypass: u14,
    /// Invert the peripheral clock of a channel.
    #[bits(0..=13, rw)]
    polarity_inverse: u14,
}

/// PDMA controller common block.
#[derive(derive_mmio::Mmio)]
#[repr(C)]
pub struct Controller {
    #[mmio(PureRead)]
    version: u32,
    ctrl0: ClockCtrl0,
    ctrl1: ClockCtrl1,
    #[mmio(PureRead)]
    interrupt: u32,
    base_addr: [u32; 4],
    mem_depth: [u32; 4],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Controller>(), CHANNEL_BLOCK_OFFSET);

impl Controller {
    /// Create a new PDMA controller MMIO instance at the fixed base address.
    ///
    /// # Safety
    ///
    /// This API can be used to potentially create a driver to the same peripheral structure
    /// from multiple threads. The user must ensure that concurrent accesses are safe and do not
    /// interfere with each other. The clock control registers are shared by all channels.
    #[inline]
    pub const unsafe fn new_mmio_fixed() -> MmioController<'static> {
        unsafe { Controller::new_mmio_at(PDMA_BASE_ADDR) }
    }
}

#[bitbybit::bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum DataUnit {
    Byte = 0b00,
    HalfWord = 0b01,
    Reserved = 0b10,
    Word = 0b11,
}

#[bitbybit::bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum FlowController {
    /// The PDMA controls the flow of the transfer.
    Dma = 0,
    /// The peripheral controls the flow of the transfer.
    Peripheral = 1,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct PerCtrl {
    #[bits(4..=8, rw)]
    burst_len: u5,
    #[bit(3, rw)]
    flow_control: FlowController,
    #[bits(1..=2, rw)]
    data_unit: DataUnit,
    /// Enables the hardware handshake with the peripheral.
    #[bit(0, rw)]
    handshake: bool,
}

#[bitbybit::bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum RingEvent {
    /// The next event pulse publishes a new write pointer.
    Update = 0,
    /// The next event pulse latches a new ring base and depth.
    Fire = 1,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct RingReadCtrl {
    #[bits(16..=29, rw)]
    write_ptr: u14,
    #[bit(15, rw)]
    wrap: bool,
    #[bit(14, rw)]
    event_select: RingEvent,
    /// Number of descriptors in the ring.
    #[bits(0..=13, rw)]
    depth: u14,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct RingEventPulse {
    #[bit(0, rw)]
    pulse: bool,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct SgCtrl {
    /// Scatter-gather segment count minus one.
    #[bits(0..=7, rw)]
    segments_minus_one: u8,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct ResetCtrl {
    #[bit(0, rw)]
    reset: bool,
}

#[bitbybit::bitfield(u32, debug)]
pub struct State {
    #[bits(18..=31, r)]
    complete_ptr: u14,
    #[bit(17, r)]
    complete_wrap: bool,
    /// Index of the next descriptor the hardware reads.
    #[bits(3..=16, r)]
    read_ptr: u14,
    #[bit(2, r)]
    read_wrap: bool,
    #[bit(1, r)]
    handshake_busy: bool,
    #[bit(0, r)]
    idle: bool,
}

/// Receive channel interrupt status. All bits are write-one-to-clear.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct RxInterrupt {
    #[bit(5, rw)]
    bus_error: bool,
    #[bit(3, rw)]
    section_complete: bool,
    #[bit(1, rw)]
    reset_complete: bool,
    #[bit(0, rw)]
    flush_complete: bool,
}

/// Transmit channel interrupt status. All bits are write-one-to-clear.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct TxInterrupt {
    #[bit(4, rw)]
    sg_section_complete: bool,
    #[bit(3, rw)]
    bus_error: bool,
    #[bit(1, rw)]
    section_complete: bool,
    #[bit(0, rw)]
    reset_complete: bool,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct RxInterruptEnable {
    #[bit(5, rw)]
    bus_error: bool,
    #[bit(3, rw)]
    section_complete: bool,
    #[bit(1, rw)]
    reset_complete: bool,
    #[bit(0, rw)]
    flush_complete: bool,
}

#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct TxInterruptEnable {
    #[bit(3, rw)]
    sg_section_complete: bool,
    #[bit(2, rw)]
    bus_error: bool,
    #[bit(1, rw)]
    section_complete: bool,
    #[bit(0, rw)]
    reset_complete: bool,
}

/// PDMA channel block.
///
/// The interrupt enable and status registers are kept as raw values because their layout
/// differs between receive ([RxInterrupt], [RxInterruptEnable]) and transmit ([TxInterrupt],
/// [TxInterruptEnable]) channels.
#[derive(derive_mmio::Mmio)]
#[repr(C)]
pub struct Channel {
    per_base_addr: u32,
    per_ctrl: PerCtrl,
    ring_base_addr: u32,
    ring_ctrl: RingReadCtrl,
    #[mmio(Write)]
    ring_event: RingEventPulse,
    sg_ctrl: SgCtrl,
    intr_ctrl: u32,
    /// DMA control register for receive channels, reset control register for transmit
    /// channels. Only the reset bit is used.
    #[mmio(Write)]
    reset_ctrl: ResetCtrl,
    #[mmio(PureRead)]
    state: State,
    /// Transferred bytes.
    #[mmio(PureRead)]
    byte_count: u32,
    #[mmio(PureRead, Write)]
    intr: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Channel>(), CHANNEL_STRIDE);

impl Channel {
    /// Create a new PDMA channel MMIO instance for the channel with the given index.
    ///
    /// Returns [None] for an index outside `0..14`.
    ///
    /// # Safety
    ///
    /// This API can be used to potentially create a driver to the same peripheral structure
    /// from multiple threads. The user must ensure that concurrent accesses are safe and do not
    /// interfere with each other.
    #[inline]
    pub const unsafe fn new_mmio_fixed(index: usize) -> Option<MmioChannel<'static>> {
        if index >= CHANNEL_COUNT {
            return None;
        }
        Some(unsafe { Channel::new_mmio_at(PDMA_BASE_ADDR + channel_offset(index)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_offsets() {
        assert_eq!(channel_offset(0), 0x30);
        assert_eq!(channel_offset(1), 0x5C);
        assert_eq!(channel_offset(2), 0x88);
        assert_eq!(channel_offset(13), 0x26C);
        assert_eq!(
            channel_offset(CHANNEL_COUNT - 1) + CHANNEL_STRIDE,
            0x298,
            "last channel block end"
        );
    }

    #[test]
    fn ring_ctrl_layout() {
        let ctrl = RingReadCtrl::builder()
            .with_write_ptr(u14::new(0x25))
            .with_wrap(true)
            .with_event_select(RingEvent::Fire)
            .with_depth(u14::new(256))
            .build();
        assert_eq!(ctrl.raw_value(), (0x25 << 16) | (1 << 15) | (1 << 14) | 256);
    }

    #[test]
    fn state_decoding() {
        let state = State::new_with_raw_value((7 << 18) | (1 << 17) | (9 << 3) | 0b111);
        assert_eq!(state.complete_ptr().value(), 7);
        assert!(state.complete_wrap());
        assert_eq!(state.read_ptr().value(), 9);
        assert!(state.read_wrap());
        assert!(state.handshake_busy());
        assert!(state.idle());
    }

    #[test]
    fn per_ctrl_layout() {
        let per_ctrl = PerCtrl::builder()
            .with_burst_len(u5::new(8))
            .with_flow_control(FlowController::Peripheral)
            .with_data_unit(DataUnit::Word)
            .with_handshake(true)
            .build();
        assert_eq!(per_ctrl.raw_value(), (8 << 4) | (1 << 3) | (0b11 << 1) | 1);
    }
}
