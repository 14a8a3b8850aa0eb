//! Register access capability used by the channel engine.
use leipzig::pdma::{
    ClockCtrl0, ClockCtrl1, MmioChannel, MmioController, PerCtrl, ResetCtrl, RingEventPulse,
    RingReadCtrl, SgCtrl,
};

use super::ChannelId;

/// Channel-relative registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelReg {
    PerBaseAddr,
    PerCtrl,
    RingBaseAddr,
    RingCtrl,
    RingEvent,
    SgCtrl,
    IntrCtrl,
    /// DMA control register of receive channels, reset control register of transmit channels.
    ResetCtrl,
    State,
    ByteCount,
    Intr,
}

impl ChannelReg {
    pub const fn offset(&self) -> usize {
        match self {
            ChannelReg::PerBaseAddr => 0x00,
            ChannelReg::PerCtrl => 0x04,
            ChannelReg::RingBaseAddr => 0x08,
            ChannelReg::RingCtrl => 0x0C,
            ChannelReg::RingEvent => 0x10,
            ChannelReg::SgCtrl => 0x14,
            ChannelReg::IntrCtrl => 0x18,
            ChannelReg::ResetCtrl => 0x1C,
            ChannelReg::State => 0x20,
            ChannelReg::ByteCount => 0x24,
            ChannelReg::Intr => 0x28,
        }
    }
}

/// Registers of the controller common block which are relevant for a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControllerReg {
    Version,
    /// Per-channel clock enable.
    Ctrl0,
    /// Per-channel clock polarity and clock gating bypass.
    Ctrl1,
    Interrupt,
}

impl ControllerReg {
    pub const fn offset(&self) -> usize {
        match self {
            ControllerReg::Version => 0x00,
            ControllerReg::Ctrl0 => 0x04,
            ControllerReg::Ctrl1 => 0x08,
            ControllerReg::Interrupt => 0x0C,
        }
    }
}

/// Raw 32-bit register access for one channel.
///
/// The controller registers are shared by all channels. Callers perform read-modify-write
/// sequences on them inside a critical section, implementors only need to provide plain
/// accesses.
pub trait ChannelRegisters {
    fn read(&mut self, reg: ChannelReg) -> u32;
    fn write(&mut self, reg: ChannelReg, value: u32);
    fn read_controller(&mut self, reg: ControllerReg) -> u32;
    fn write_controller(&mut self, reg: ControllerReg, value: u32);
}

/// [ChannelRegisters] implementation for the memory mapped PDMA controller.
pub struct MmioChannelRegisters {
    channel: MmioChannel<'static>,
    controller: MmioController<'static>,
}

impl MmioChannelRegisters {
    #[inline]
    pub const fn new(channel: MmioChannel<'static>, controller: MmioController<'static>) -> Self {
        Self {
            channel,
            controller,
        }
    }

    /// Create the register block for the given channel at the fixed controller address.
    ///
    /// # Safety
    ///
    /// Circumvents ownership and safety guarantees by the HAL. The user must ensure that only
    /// one driver uses the channel registers at a time.
    #[inline]
    pub const unsafe fn steal(id: ChannelId) -> Self {
        Self {
            channel: unsafe { id.steal_mmio() },
            controller: unsafe { leipzig::pdma::Controller::new_mmio_fixed() },
        }
    }

    #[inline]
    pub fn channel(&mut self) -> &mut MmioChannel<'static> {
        &mut self.channel
    }
}

impl ChannelRegisters for MmioChannelRegisters {
    fn read(&mut self, reg: ChannelReg) -> u32 {
        match reg {
            ChannelReg::PerBaseAddr => self.channel.read_per_base_addr(),
            ChannelReg::PerCtrl => self.channel.read_per_ctrl().raw_value(),
            ChannelReg::RingBaseAddr => self.channel.read_ring_base_addr(),
            ChannelReg::RingCtrl => self.channel.read_ring_ctrl().raw_value(),
            ChannelReg::SgCtrl => self.channel.read_sg_ctrl().raw_value(),
            ChannelReg::IntrCtrl => self.channel.read_intr_ctrl(),
            ChannelReg::State => self.channel.read_state().raw_value(),
            ChannelReg::ByteCount => self.channel.read_byte_count(),
            ChannelReg::Intr => self.channel.read_intr(),
            // Write-only.
            ChannelReg::RingEvent | ChannelReg::ResetCtrl => 0,
        }
    }

    fn write(&mut self, reg: ChannelReg, value: u32) {
        match reg {
            ChannelReg::PerBaseAddr => self.channel.write_per_base_addr(value),
            ChannelReg::PerCtrl => self
                .channel
                .write_per_ctrl(PerCtrl::new_with_raw_value(value)),
            ChannelReg::RingBaseAddr => self.channel.write_ring_base_addr(value),
            ChannelReg::RingCtrl => self
                .channel
                .write_ring_ctrl(RingReadCtrl::new_with_raw_value(value)),
            ChannelReg::RingEvent => self
                .channel
                .write_ring_event(RingEventPulse::new_with_raw_value(value)),
            ChannelReg::SgCtrl => self.channel.write_sg_ctrl(SgCtrl::new_with_raw_value(value)),
            ChannelReg::IntrCtrl => self.channel.write_intr_ctrl(value),
            ChannelReg::ResetCtrl => self
                .channel
                .write_reset_ctrl(ResetCtrl::new_with_raw_value(value)),
            ChannelReg::Intr => self.channel.write_intr(value),
            // Read-only.
            ChannelReg::State | ChannelReg::ByteCount => (),
        }
    }

    fn read_controller(&mut self, reg: ControllerReg) -> u32 {
        match reg {
            ControllerReg::Version => self.controller.read_version(),
            ControllerReg::Ctrl0 => self.controller.read_ctrl0().raw_value(),
            ControllerReg::Ctrl1 => self.controller.read_ctrl1().raw_value(),
            ControllerReg::Interrupt => self.controller.read_interrupt(),
        }
    }

    fn write_controller(&mut self, reg: ControllerReg, value: u32) {
        match reg {
            ControllerReg::Ctrl0 => self
                .controller
                .write_ctrl0(ClockCtrl0::new_with_raw_value(value)),
            ControllerReg::Ctrl1 => self
                .controller
                .write_ctrl1(ClockCtrl1::new_with_raw_value(value)),
            ControllerReg::Version | ControllerReg::Interrupt => (),
        }
    }
}
