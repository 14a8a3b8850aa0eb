//! Simulated PDMA channel for unit tests.
extern crate std;

use std::{
    boxed::Box,
    cell::{Cell, RefCell},
    rc::Rc,
    vec::Vec,
};

use core::ptr::NonNull;

use embedded_hal::delay::DelayNs;
use leipzig::pdma::{PerCtrl, RingEvent, RingReadCtrl};

use super::{
    ChannelId, Direction,
    descr::Descriptor,
    mem::{AllocError, DescriptorRegion, DmaMemory},
    pads::PadMuxRegister,
    regs::{ChannelReg, ChannelRegisters, ControllerReg},
};

pub const SIM_VERSION: u32 = 0x2015_0914;
pub const SIM_RING_BUS_ADDR: u32 = 0x3F00_0000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Write(ChannelReg, u32),
    WriteController(ControllerReg, u32),
    Alloc(usize),
    Free(usize),
    Sync,
}

pub type SimLog = Rc<RefCell<Vec<SimEvent>>>;

pub fn new_log() -> SimLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// Interrupt status bit positions of a channel direction.
#[derive(Debug, Copy, Clone)]
struct IntrBits {
    reset: u32,
    section: u32,
    bus_error: u32,
}

impl IntrBits {
    const fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Rx => Self {
                reset: 1 << 1,
                section: 1 << 3,
                bus_error: 1 << 5,
            },
            Direction::Tx => Self {
                reset: 1 << 0,
                section: 1 << 1,
                bus_error: 1 << 3,
            },
        }
    }
}

/// Register level model of one channel.
///
/// A pulse with [RingEvent::Fire] latches the ring and moves the read pointer to the start, a
/// pulse with [RingEvent::Update] consumes everything up to the write pointer and raises the
/// section complete interrupt.
pub struct SimChannel {
    pub id: ChannelId,
    regs: [u32; 11],
    controller: [u32; 4],
    pub respond_to_reset: bool,
    pub complete_on_update: bool,
    pub bus_error_on_update: bool,
    /// An update pulse only raises a bus error and consumes nothing.
    pub abort_on_update: bool,
    /// Number of state reads which still report a busy handshake.
    pub handshake_busy_reads: u32,
    pub read_ptr: u32,
    pub read_wrap: bool,
    pub resets: u32,
    pub update_pulses: u32,
    pub fire_pulses: u32,
    log: SimLog,
}

impl SimChannel {
    pub fn new(id: ChannelId, log: SimLog) -> Self {
        let mut controller = [0; 4];
        controller[ControllerReg::Version.offset() / 4] = SIM_VERSION;
        Self {
            id,
            regs: [0; 11],
            controller,
            respond_to_reset: true,
            complete_on_update: true,
            bus_error_on_update: false,
            abort_on_update: false,
            handshake_busy_reads: 0,
            read_ptr: 0,
            read_wrap: false,
            resets: 0,
            update_pulses: 0,
            fire_pulses: 0,
            log,
        }
    }

    fn bits(&self) -> IntrBits {
        IntrBits::for_direction(self.id.direction())
    }

    #[inline]
    pub fn reg(&self, reg: ChannelReg) -> u32 {
        self.regs[reg.offset() / 4]
    }

    #[inline]
    fn reg_mut(&mut self, reg: ChannelReg) -> &mut u32 {
        &mut self.regs[reg.offset() / 4]
    }

    #[inline]
    pub fn controller_reg(&self, reg: ControllerReg) -> u32 {
        self.controller[reg.offset() / 4]
    }

    pub fn per_ctrl(&self) -> PerCtrl {
        PerCtrl::new_with_raw_value(self.reg(ChannelReg::PerCtrl))
    }

    pub fn ring_ctrl(&self) -> RingReadCtrl {
        RingReadCtrl::new_with_raw_value(self.reg(ChannelReg::RingCtrl))
    }

    pub fn intr(&self) -> u32 {
        self.reg(ChannelReg::Intr)
    }

    pub fn section_pending(&self) -> bool {
        self.intr() & self.bits().section != 0
    }

    /// Raise interrupt status bits as the hardware would.
    pub fn raise_section_complete(&mut self, bus_error: bool) {
        let bits = self.bits();
        *self.reg_mut(ChannelReg::Intr) |= bits.section;
        if bus_error {
            *self.reg_mut(ChannelReg::Intr) |= bits.bus_error;
        }
    }

    pub fn raise_bus_error(&mut self) {
        let bus_error = self.bits().bus_error;
        *self.reg_mut(ChannelReg::Intr) |= bus_error;
    }

    fn state(&mut self) -> u32 {
        let busy = if self.handshake_busy_reads > 0 {
            self.handshake_busy_reads -= 1;
            true
        } else {
            false
        };
        let idle = !busy;
        (self.read_ptr << 18)
            | ((self.read_wrap as u32) << 17)
            | (self.read_ptr << 3)
            | ((self.read_wrap as u32) << 2)
            | ((busy as u32) << 1)
            | idle as u32
    }

    fn pulse(&mut self) {
        let ctrl = self.ring_ctrl();
        match ctrl.event_select() {
            RingEvent::Fire => {
                self.fire_pulses += 1;
                self.read_ptr = 0;
                self.read_wrap = false;
            }
            RingEvent::Update => {
                self.update_pulses += 1;
                if self.abort_on_update {
                    self.raise_bus_error();
                } else if self.complete_on_update {
                    self.read_ptr = ctrl.write_ptr().value() as u32;
                    self.read_wrap = ctrl.wrap();
                    let bus_error = self.bus_error_on_update;
                    self.raise_section_complete(bus_error);
                }
            }
        }
    }
}

impl ChannelRegisters for SimChannel {
    fn read(&mut self, reg: ChannelReg) -> u32 {
        match reg {
            ChannelReg::State => self.state(),
            ChannelReg::RingEvent | ChannelReg::ResetCtrl => 0,
            _ => self.reg(reg),
        }
    }

    fn write(&mut self, reg: ChannelReg, value: u32) {
        self.log.borrow_mut().push(SimEvent::Write(reg, value));
        match reg {
            ChannelReg::Intr => *self.reg_mut(reg) &= !value,
            ChannelReg::ResetCtrl => {
                if value & 1 != 0 {
                    self.resets += 1;
                    self.read_ptr = 0;
                    self.read_wrap = false;
                    *self.reg_mut(ChannelReg::ByteCount) = 0;
                    if self.respond_to_reset {
                        let reset = self.bits().reset;
                        *self.reg_mut(ChannelReg::Intr) |= reset;
                    }
                }
            }
            ChannelReg::RingEvent => {
                if value & 1 != 0 {
                    self.pulse();
                }
            }
            ChannelReg::State | ChannelReg::ByteCount => (),
            _ => *self.reg_mut(reg) = value,
        }
    }

    fn read_controller(&mut self, reg: ControllerReg) -> u32 {
        self.controller_reg(reg)
    }

    fn write_controller(&mut self, reg: ControllerReg, value: u32) {
        self.log
            .borrow_mut()
            .push(SimEvent::WriteController(reg, value));
        match reg {
            ControllerReg::Ctrl0 | ControllerReg::Ctrl1 => self.controller[reg.offset() / 4] = value,
            ControllerReg::Version | ControllerReg::Interrupt => (),
        }
    }
}

/// Delay provider which only accumulates the requested time. Clones share the elapsed time.
#[derive(Debug, Default, Clone)]
pub struct MockDelay {
    elapsed_ns: Rc<Cell<u64>>,
}

impl MockDelay {
    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_ns.get() / 1000
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns.set(self.elapsed_ns.get() + ns as u64);
    }
}

/// Heap backed descriptor memory with failure injection.
pub struct SimMemory {
    pub fail_allocations: bool,
    log: SimLog,
}

impl SimMemory {
    pub fn new(log: SimLog) -> Self {
        Self {
            fail_allocations: false,
            log,
        }
    }
}

fn leak_descriptors(slots: usize) -> NonNull<Descriptor> {
    let descriptors: Box<[Descriptor]> = (0..slots).map(|_| Descriptor::new()).collect();
    NonNull::from(Box::leak(descriptors)).cast::<Descriptor>()
}

unsafe impl DmaMemory for SimMemory {
    fn allocate(&mut self, slots: usize) -> Result<DescriptorRegion, AllocError> {
        if self.fail_allocations {
            return Err(AllocError::OutOfMemory(slots));
        }
        self.log.borrow_mut().push(SimEvent::Alloc(slots));
        // Stale content to check that rings are cleared.
        let ptr = leak_descriptors(slots);
        let region = unsafe { DescriptorRegion::new(ptr, slots, SIM_RING_BUS_ADDR) };
        for descr in region.as_slice() {
            descr.set_addr(0xDEAD_BEEF);
        }
        Ok(region)
    }

    fn free(&mut self, region: DescriptorRegion) {
        self.log.borrow_mut().push(SimEvent::Free(region.len()));
        let slice = core::ptr::slice_from_raw_parts_mut(region.as_ptr() as *mut Descriptor, region.len());
        drop(unsafe { Box::from_raw(slice) });
    }

    fn sync_for_device(&mut self, _region: &DescriptorRegion) {
        self.log.borrow_mut().push(SimEvent::Sync);
    }
}

/// Standalone region for ring level tests. The memory is leaked.
pub fn test_region(slots: usize) -> DescriptorRegion {
    let ptr = leak_descriptors(slots);
    unsafe { DescriptorRegion::new(ptr, slots, SIM_RING_BUS_ADDR) }
}

/// Pad multiplexer register model.
#[derive(Debug, Default)]
pub struct SimPadMux {
    pub value: u32,
    pub writes: u32,
}

impl PadMuxRegister for SimPadMux {
    fn read(&mut self) -> u32 {
        self.value
    }

    fn write(&mut self, value: u32) {
        self.writes += 1;
        self.value = value;
    }
}
