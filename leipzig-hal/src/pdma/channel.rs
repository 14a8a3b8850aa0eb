//! PDMA channel driver.
//!
//! A [PdmaChannel] owns one hardware channel together with its descriptor ring. The typical
//! sequence is
//!
//! 1. [PdmaChannel::open] (or [PdmaChannel::reset] followed by [PdmaChannel::allocate_ring] and
//!    [PdmaChannel::enable_handshake])
//! 2. [PdmaChannel::configure] and [PdmaChannel::set_peripheral_address]
//! 3. [PdmaChannel::prepare_transfer] and [PdmaChannel::issue_transfer], repeated per request
//! 4. [PdmaChannel::release]
//!
//! In polled mode, [PdmaChannel::issue_transfer] blocks until the section complete interrupt
//! status is set. In interrupt mode, it returns immediately and the completion is observed
//! with [PdmaChannel::poll_completion], [PdmaChannel::wait_for_completion] or the asynchronous
//! [PdmaChannel::completion].
use core::sync::atomic::{Ordering, fence};

use arbitrary_int::u14;
use embedded_hal::delay::DelayNs;
use leipzig::pdma::{
    ClockCtrl0, ClockCtrl1, PerCtrl, ResetCtrl, RingEvent, RingEventPulse, RingReadCtrl,
    RxInterruptEnable, SgCtrl, State, TxInterruptEnable,
};

use super::{
    ChannelConfig, ChannelId, DEFAULT_RING_CAPACITY, Direction, MAX_RING_CAPACITY, PdmaError,
    Timeouts, WaitEvent,
    asynch::{ChannelSignals, CompletionFuture, InterruptResult},
    mem::{AllocError, DmaMemory},
    poll_until,
    regs::{ChannelReg, ChannelRegisters, ControllerReg},
    ring::{DescriptorRing, Segment, TransferInfo},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Unconfigured,
    Reset,
    Configured,
    /// Descriptors were written but not yet published to the hardware.
    Armed,
    Transferring,
    /// A reset, handshake or transfer timed out or the hardware reported a bus error. Only
    /// [PdmaChannel::reset] and [PdmaChannel::release] are allowed.
    Faulted,
    Released,
}

#[derive(Copy, Clone)]
pub enum CompletionMode {
    /// Completion is detected by polling the interrupt status register. The channel is not
    /// serviced by [super::on_interrupt].
    Polled,
    /// The interrupt handler signals completion.
    Interrupt(&'static ChannelSignals),
}

fn interrupt_enable_mask(direction: Direction) -> u32 {
    match direction {
        Direction::Rx => RxInterruptEnable::new_with_raw_value(0)
            .with_reset_complete(true)
            .with_section_complete(true)
            .with_bus_error(true)
            .raw_value(),
        Direction::Tx => TxInterruptEnable::new_with_raw_value(0)
            .with_reset_complete(true)
            .with_section_complete(true)
            .with_bus_error(true)
            .raw_value(),
    }
}

#[inline]
fn with_channel_bit(field: u14, id: ChannelId, enable: bool) -> u14 {
    let bit = 1 << id.index();
    if enable {
        u14::new(field.value() | bit)
    } else {
        u14::new(field.value() & !bit)
    }
}

#[inline]
fn completion_mask(direction: Direction) -> u32 {
    InterruptResult {
        section_complete: true,
        bus_error: true,
        ..Default::default()
    }
    .to_raw(direction)
}

/// Consume a pending section complete or bus error. Returns whether a bus error was reported.
///
/// A bus error terminates the transfer even without a section complete.
fn take_completion(
    regs: &mut impl ChannelRegisters,
    id: ChannelId,
    completion: CompletionMode,
) -> Option<bool> {
    match completion {
        CompletionMode::Polled => {
            let direction = id.direction();
            let status = InterruptResult::from_raw(direction, regs.read(ChannelReg::Intr));
            if !status.section_complete && !status.bus_error {
                return None;
            }
            let observed = InterruptResult {
                section_complete: status.section_complete,
                bus_error: status.bus_error,
                ..Default::default()
            };
            regs.write(ChannelReg::Intr, observed.to_raw(direction));
            Some(status.bus_error)
        }
        CompletionMode::Interrupt(signals) => signals.take_section_done(),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Progress {
    Pending,
    Done,
    BusError,
}

/// Evaluate a consumed completion against the hardware read pointer.
///
/// Several requests can be in flight, each ending with a section complete. The transfer is
/// only done once the hardware consumed every published descriptor.
fn observe(
    regs: &mut impl ChannelRegisters,
    ring: &mut Option<DescriptorRing>,
    published: (usize, bool),
    completion: Option<bool>,
) -> Progress {
    let Some(bus_error) = completion else {
        return Progress::Pending;
    };
    let hw_state = State::new_with_raw_value(regs.read(ChannelReg::State));
    let consumed = match ring.as_mut() {
        Some(ring) => {
            ring.sync_head(hw_state.read_ptr().value() as usize, hw_state.read_wrap());
            (ring.head(), ring.head_wrap()) == published
        }
        None => true,
    };
    if bus_error {
        Progress::BusError
    } else if consumed {
        Progress::Done
    } else {
        Progress::Pending
    }
}

pub struct PdmaChannel<R: ChannelRegisters, M: DmaMemory, D: DelayNs> {
    id: ChannelId,
    regs: R,
    mem: M,
    delay: D,
    timeouts: Timeouts,
    completion: CompletionMode,
    ring: Option<DescriptorRing>,
    /// Ring tail and wrap bit last written to the hardware.
    published: (usize, bool),
    /// Descriptors were prepared after the last write pointer update.
    unpublished: bool,
    config: Option<ChannelConfig>,
    state: ChannelState,
}

impl<R: ChannelRegisters, M: DmaMemory, D: DelayNs> PdmaChannel<R, M, D> {
    /// Create a driver for a channel in polled mode with the default [Timeouts].
    ///
    /// The hardware is not touched until the channel is reset.
    pub fn new(id: ChannelId, regs: R, mem: M, delay: D) -> Self {
        Self {
            id,
            regs,
            mem,
            delay,
            timeouts: Timeouts::default(),
            completion: CompletionMode::Polled,
            ring: None,
            published: (0, false),
            unpublished: false,
            config: None,
            state: ChannelState::Unconfigured,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Use interrupt completion. The interrupt handler of the channel must use the same
    /// signals, for example by using [super::asynch::DISPATCHER] and [super::on_interrupt].
    pub fn with_interrupt_completion(mut self, signals: &'static ChannelSignals) -> Self {
        signals.attach();
        self.completion = CompletionMode::Interrupt(signals);
        self
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn config(&self) -> Option<&ChannelConfig> {
        self.config.as_ref()
    }

    #[inline]
    pub fn ring(&self) -> Option<&DescriptorRing> {
        self.ring.as_ref()
    }

    #[inline]
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Direct register access.
    #[inline]
    pub fn regs(&mut self) -> &mut R {
        &mut self.regs
    }

    fn check_state(&self, allowed: &[ChannelState]) -> Result<(), PdmaError> {
        if !allowed.contains(&self.state) {
            return Err(PdmaError::InvalidState(self.state));
        }
        Ok(())
    }

    fn modify_controller(&mut self, reg: ControllerReg, f: impl FnOnce(u32) -> u32) {
        // The controller registers are shared with all other channels.
        critical_section::with(|_| {
            let value = self.regs.read_controller(reg);
            self.regs.write_controller(reg, f(value));
        });
    }

    pub fn enable_clock(&mut self) {
        let id = self.id;
        self.modify_controller(ControllerReg::Ctrl0, |raw| {
            let ctrl = ClockCtrl0::new_with_raw_value(raw);
            ctrl.with_clock_enable(with_channel_bit(ctrl.clock_enable(), id, true))
                .raw_value()
        });
    }

    pub fn disable_clock(&mut self) {
        let id = self.id;
        self.modify_controller(ControllerReg::Ctrl0, |raw| {
            let ctrl = ClockCtrl0::new_with_raw_value(raw);
            ctrl.with_clock_enable(with_channel_bit(ctrl.clock_enable(), id, false))
                .raw_value()
        });
    }

    pub fn clock_enabled(&mut self) -> bool {
        let ctrl = ClockCtrl0::new_with_raw_value(self.regs.read_controller(ControllerReg::Ctrl0));
        ctrl.clock_enable().value() & (1 << self.id.index()) != 0
    }

    pub fn set_clock_polarity(&mut self, inverse: bool) {
        let id = self.id;
        self.modify_controller(ControllerReg::Ctrl1, |raw| {
            let ctrl = ClockCtrl1::new_with_raw_value(raw);
            ctrl.with_polarity_inverse(with_channel_bit(ctrl.polarity_inverse(), id, inverse))
                .raw_value()
        });
    }

    pub fn set_clock_gating_bypass(&mut self, bypass: bool) {
        let id = self.id;
        self.modify_controller(ControllerReg::Ctrl1, |raw| {
            let ctrl = ClockCtrl1::new_with_raw_value(raw);
            ctrl.with_gating_bypass(with_channel_bit(ctrl.gating_bypass(), id, bypass))
                .raw_value()
        });
    }

    pub fn version(&mut self) -> u32 {
        self.regs.read_controller(ControllerReg::Version)
    }

    /// Bytes transferred by the hardware.
    pub fn byte_count(&mut self) -> u32 {
        self.regs.read(ChannelReg::ByteCount)
    }

    pub fn hw_state(&mut self) -> State {
        State::new_with_raw_value(self.regs.read(ChannelReg::State))
    }

    fn clear_interrupts(&mut self) {
        let all = InterruptResult {
            reset_complete: true,
            section_complete: true,
            bus_error: true,
            flush_complete: true,
            sg_section_complete: true,
        };
        self.regs
            .write(ChannelReg::Intr, all.to_raw(self.id.direction()));
    }

    /// Reset the channel hardware and wait for the reset complete interrupt status.
    ///
    /// This is allowed in every state and is the only way out of [ChannelState::Faulted]. The
    /// channel clock is enabled if required. The software ring state is not touched, see
    /// [Self::reset_ring].
    pub fn reset(&mut self) -> Result<(), PdmaError> {
        if !self.clock_enabled() {
            self.enable_clock();
        }
        self.clear_interrupts();
        let signals = match self.completion {
            CompletionMode::Interrupt(signals) => {
                signals.clear();
                signals.attach();
                Some(signals)
            }
            CompletionMode::Polled => None,
        };
        self.regs.write(
            ChannelReg::ResetCtrl,
            ResetCtrl::new_with_raw_value(0).with_reset(true).raw_value(),
        );

        let direction = self.id.direction();
        let reset_mask = InterruptResult {
            reset_complete: true,
            ..Default::default()
        }
        .to_raw(direction);
        let regs = &mut self.regs;
        let result = poll_until(
            &mut self.delay,
            self.timeouts.reset,
            self.timeouts.poll_interval,
            || {
                regs.read(ChannelReg::Intr) & reset_mask != 0
                    || signals.is_some_and(|signals| signals.reset_done())
            },
        );
        if result.is_err() {
            log::error!(
                "pdma channel {}: reset timeout after {} ms",
                self.id.index(),
                self.timeouts.reset.to_millis()
            );
            self.state = ChannelState::Faulted;
            return Err(PdmaError::Timeout(WaitEvent::ResetComplete));
        }
        self.regs.write(ChannelReg::Intr, reset_mask);
        if let Some(signals) = signals {
            signals.clear_reset_done();
        }
        self.state = ChannelState::Reset;
        Ok(())
    }

    /// Enable the clock, reset the channel, allocate a descriptor ring and enable the hardware
    /// handshake with the peripheral.
    pub fn open(&mut self, capacity: Option<usize>) -> Result<(), PdmaError> {
        self.enable_clock();
        self.reset()?;
        self.set_clock_polarity(false);
        self.set_clock_gating_bypass(false);
        self.allocate_ring(capacity.unwrap_or(DEFAULT_RING_CAPACITY))?;
        self.enable_handshake();
        Ok(())
    }

    /// Program the transfer profile of the channel.
    ///
    /// Can be called again for every profile change while no transfer is pending.
    pub fn configure(&mut self, config: &ChannelConfig) -> Result<(), PdmaError> {
        self.check_state(&[ChannelState::Reset, ChannelState::Configured])?;
        let per_ctrl = PerCtrl::new_with_raw_value(self.regs.read(ChannelReg::PerCtrl))
            .with_data_unit(config.data_unit)
            .with_burst_len(config.burst_len)
            .with_flow_control(config.flow_control);
        self.regs.write(ChannelReg::PerCtrl, per_ctrl.raw_value());
        self.regs.write(
            ChannelReg::SgCtrl,
            SgCtrl::new_with_raw_value(0)
                .with_segments_minus_one(config.sg_segments.get() - 1)
                .raw_value(),
        );
        let intr_ctrl = if config.interrupts {
            interrupt_enable_mask(self.id.direction())
        } else {
            0
        };
        self.regs.write(ChannelReg::IntrCtrl, intr_ctrl);
        self.config = Some(*config);
        self.state = ChannelState::Configured;
        Ok(())
    }

    #[inline]
    pub fn set_peripheral_address(&mut self, addr: u32) {
        self.regs.write(ChannelReg::PerBaseAddr, addr);
    }

    pub fn enable_handshake(&mut self) {
        let per_ctrl = PerCtrl::new_with_raw_value(self.regs.read(ChannelReg::PerCtrl));
        self.regs
            .write(ChannelReg::PerCtrl, per_ctrl.with_handshake(true).raw_value());
    }

    /// Disable the hardware handshake and wait until the handshake is no longer busy.
    pub fn disable_handshake(&mut self) -> Result<(), PdmaError> {
        let per_ctrl = PerCtrl::new_with_raw_value(self.regs.read(ChannelReg::PerCtrl));
        self.regs
            .write(ChannelReg::PerCtrl, per_ctrl.with_handshake(false).raw_value());
        let regs = &mut self.regs;
        let result = poll_until(
            &mut self.delay,
            self.timeouts.handshake,
            self.timeouts.poll_interval,
            || !State::new_with_raw_value(regs.read(ChannelReg::State)).handshake_busy(),
        );
        if result.is_err() {
            log::error!("pdma channel {}: handshake stays busy", self.id.index());
            self.state = ChannelState::Faulted;
            return Err(PdmaError::Timeout(WaitEvent::HandshakeIdle));
        }
        Ok(())
    }

    fn program_ring(&mut self) -> Result<(), PdmaError> {
        let ring = self.ring.as_ref().ok_or(PdmaError::NoRing)?;
        self.mem.sync_for_device(ring.region());
        fence(Ordering::SeqCst);
        self.regs.write(ChannelReg::RingBaseAddr, ring.bus_addr());
        let ctrl = RingReadCtrl::new_with_raw_value(0)
            .with_depth(u14::new(ring.capacity() as u16))
            .with_wrap(false)
            .with_write_ptr(u14::new(0))
            .with_event_select(RingEvent::Fire);
        self.regs.write(ChannelReg::RingCtrl, ctrl.raw_value());
        self.pulse_ring_event();
        self.published = (0, false);
        self.unpublished = false;
        Ok(())
    }

    #[inline]
    fn pulse_ring_event(&mut self) {
        self.regs.write(
            ChannelReg::RingEvent,
            RingEventPulse::new_with_raw_value(0).with_pulse(true).raw_value(),
        );
    }

    /// Allocate and clear a ring of `capacity` descriptors and program it into the hardware.
    ///
    /// The channel keeps no ring if the allocation fails.
    pub fn allocate_ring(&mut self, capacity: usize) -> Result<(), PdmaError> {
        self.check_state(&[ChannelState::Reset, ChannelState::Configured])?;
        if self.ring.is_some() {
            return Err(PdmaError::RingAlreadyAllocated);
        }
        if capacity == 0 || capacity > MAX_RING_CAPACITY {
            return Err(AllocError::InvalidCapacity(capacity).into());
        }
        let region = self.mem.allocate(capacity).inspect_err(|err| {
            log::error!("pdma channel {}: ring allocation failed: {}", self.id.index(), err)
        })?;
        log::debug!(
            "pdma channel {}: ring of {} descriptors ({} bytes) at {:#010x}",
            self.id.index(),
            region.len(),
            region.size_in_bytes(),
            region.bus_addr()
        );
        self.ring = Some(DescriptorRing::new(region));
        self.program_ring()
    }

    /// Clear all descriptors, rewind the ring indices and program the ring into the hardware
    /// again, for example after recovering from a fault with [Self::reset].
    pub fn reset_ring(&mut self) -> Result<(), PdmaError> {
        self.check_state(&[ChannelState::Reset, ChannelState::Configured])?;
        let ring = self.ring.take().ok_or(PdmaError::NoRing)?;
        self.ring = Some(DescriptorRing::new(ring.into_region()));
        self.program_ring()
    }

    /// Write the descriptors for a scatter-gather request into the ring.
    ///
    /// The hardware read pointer is read back first, so slots which are still owned by the
    /// hardware are never overwritten. The request is only published to the hardware by
    /// [Self::issue_transfer]. Several requests can be prepared before issuing them, and new
    /// requests can be queued while a transfer is in flight.
    pub fn prepare_transfer(
        &mut self,
        segments: &[Segment],
        data_swap: bool,
    ) -> Result<TransferInfo, PdmaError> {
        self.check_state(&[
            ChannelState::Configured,
            ChannelState::Armed,
            ChannelState::Transferring,
        ])?;
        if self.ring.is_none() {
            return Err(PdmaError::NoRing);
        }
        let hw_state = self.hw_state();
        let ring = self.ring.as_mut().ok_or(PdmaError::NoRing)?;
        ring.sync_head(hw_state.read_ptr().value() as usize, hw_state.read_wrap());
        let info = ring.enqueue(segments, data_swap).inspect_err(|err| {
            log::warn!("pdma channel {}: {}", self.id.index(), err);
        })?;
        self.mem.sync_for_device(ring.region());
        fence(Ordering::SeqCst);
        log::trace!(
            "pdma channel {}: queued {} descriptors ({} bytes), tail {} wrap {}",
            self.id.index(),
            info.descriptors,
            info.total_bytes,
            ring.tail(),
            ring.wrap()
        );
        self.unpublished = true;
        if self.state != ChannelState::Transferring {
            self.state = ChannelState::Armed;
        }
        Ok(info)
    }

    /// Publish the prepared descriptors to the hardware by updating the ring write pointer and
    /// wrap bit.
    ///
    /// In polled mode, this blocks until the hardware consumed all published descriptors or the
    /// transfer timeout expires. In interrupt mode, requests prepared during a transfer can be
    /// appended to it.
    pub fn issue_transfer(&mut self) -> Result<(), PdmaError> {
        let in_flight = self.state == ChannelState::Transferring;
        if !(self.state == ChannelState::Armed || (in_flight && self.unpublished)) {
            return Err(PdmaError::InvalidState(self.state));
        }
        let ring = self.ring.as_ref().ok_or(PdmaError::NoRing)?;
        let (tail, wrap) = (ring.tail(), ring.wrap());
        if !in_flight {
            // Completions latched before this point belong to earlier transfers.
            match self.completion {
                CompletionMode::Polled => self
                    .regs
                    .write(ChannelReg::Intr, completion_mask(self.id.direction())),
                CompletionMode::Interrupt(signals) => signals.clear_section_done(),
            }
        }
        // Descriptor writes must be visible before the hardware sees the new write pointer.
        fence(Ordering::SeqCst);
        let ctrl = RingReadCtrl::new_with_raw_value(self.regs.read(ChannelReg::RingCtrl))
            .with_write_ptr(u14::new(tail as u16))
            .with_wrap(wrap)
            .with_event_select(RingEvent::Update);
        self.regs.write(ChannelReg::RingCtrl, ctrl.raw_value());
        self.pulse_ring_event();
        self.published = (tail, wrap);
        self.unpublished = false;
        self.state = ChannelState::Transferring;

        match self.completion {
            CompletionMode::Polled => self.wait_for_completion(),
            CompletionMode::Interrupt(_) => Ok(()),
        }
    }

    /// Requests prepared during the transfer leave the channel [ChannelState::Armed].
    fn finish_transfer(&mut self, bus_error: bool) -> Result<(), PdmaError> {
        if bus_error {
            log::warn!("pdma channel {}: bus error", self.id.index());
            self.state = ChannelState::Faulted;
            return Err(PdmaError::BusError);
        }
        self.state = if self.unpublished {
            ChannelState::Armed
        } else {
            ChannelState::Configured
        };
        Ok(())
    }

    /// Check whether the issued transfer has completed.
    pub fn poll_completion(&mut self) -> nb::Result<(), PdmaError> {
        self.check_state(&[ChannelState::Transferring])
            .map_err(nb::Error::Other)?;
        let completion = take_completion(&mut self.regs, self.id, self.completion);
        match observe(&mut self.regs, &mut self.ring, self.published, completion) {
            Progress::Pending => Err(nb::Error::WouldBlock),
            progress => self
                .finish_transfer(progress == Progress::BusError)
                .map_err(nb::Error::Other),
        }
    }

    /// Block until the issued transfer has completed, bounded by the transfer timeout.
    pub fn wait_for_completion(&mut self) -> Result<(), PdmaError> {
        self.check_state(&[ChannelState::Transferring])?;
        let (id, completion, published) = (self.id, self.completion, self.published);
        let regs = &mut self.regs;
        let ring = &mut self.ring;
        let mut progress = Progress::Pending;
        let result = poll_until(
            &mut self.delay,
            self.timeouts.transfer,
            self.timeouts.poll_interval,
            || {
                let taken = take_completion(regs, id, completion);
                progress = observe(regs, ring, published, taken);
                progress != Progress::Pending
            },
        );
        if result.is_err() {
            log::error!("pdma channel {}: transfer timeout", self.id.index());
            self.state = ChannelState::Faulted;
            return Err(PdmaError::Timeout(WaitEvent::SectionComplete));
        }
        self.finish_transfer(progress == Progress::BusError)
    }

    /// Wait asynchronously for the issued transfer to complete. Requires interrupt completion.
    pub async fn completion(&mut self) -> Result<(), PdmaError> {
        let CompletionMode::Interrupt(signals) = self.completion else {
            return Err(PdmaError::InterruptsNotConfigured);
        };
        self.check_state(&[ChannelState::Transferring])?;
        loop {
            let bus_error = CompletionFuture::new(signals).await;
            match observe(&mut self.regs, &mut self.ring, self.published, Some(bus_error)) {
                Progress::Pending => continue,
                progress => return self.finish_transfer(progress == Progress::BusError),
            }
        }
    }

    /// Disable the handshake, reset the hardware, disable the channel clock and free the ring.
    ///
    /// The ring is freed and the clock disabled even if the handshake or the reset time out.
    /// The first error is returned in that case and the channel stays faulted.
    pub fn release(&mut self) -> Result<(), PdmaError> {
        if self.state == ChannelState::Released {
            return Ok(());
        }
        let handshake = self.disable_handshake();
        let reset = self.reset();
        self.disable_clock();
        if let Some(ring) = self.ring.take() {
            self.mem.free(ring.into_region());
        }
        if let CompletionMode::Interrupt(signals) = self.completion {
            signals.clear();
            signals.detach();
        }
        self.published = (0, false);
        self.unpublished = false;
        self.config = None;
        if let Err(err) = handshake.and(reset) {
            self.state = ChannelState::Faulted;
            return Err(err);
        }
        self.state = ChannelState::Released;
        Ok(())
    }
}
