//! Interrupt driven completion of PDMA transfers.
//!
//! The interrupt handler ([CompletionDispatcher::on_channel_interrupt] or the global
//! [on_interrupt]) reads and clears the interrupt status of a channel, raises the matching
//! [ChannelSignals] flags and wakes a waiting [CompletionFuture]. Completion callbacks are not
//! called from the interrupt context: they run in [CompletionDispatcher::run_deferred], which the
//! user calls from a task or the main loop.
use core::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};

use critical_section::Mutex;
use embassy_sync::waitqueue::AtomicWaker;
use leipzig::pdma::{RxInterrupt, TxInterrupt};

use super::{CHANNEL_COUNT, ChannelId, ChannelRegisters, Direction, PdmaError, regs::ChannelReg};

/// Decoded interrupt status of a channel.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct InterruptResult {
    pub reset_complete: bool,
    pub section_complete: bool,
    pub bus_error: bool,
    /// Receive channels only.
    pub flush_complete: bool,
    /// Transmit channels only.
    pub sg_section_complete: bool,
}

impl InterruptResult {
    pub fn from_raw(direction: Direction, raw: u32) -> Self {
        match direction {
            Direction::Rx => {
                let intr = RxInterrupt::new_with_raw_value(raw);
                Self {
                    reset_complete: intr.reset_complete(),
                    section_complete: intr.section_complete(),
                    bus_error: intr.bus_error(),
                    flush_complete: intr.flush_complete(),
                    sg_section_complete: false,
                }
            }
            Direction::Tx => {
                let intr = TxInterrupt::new_with_raw_value(raw);
                Self {
                    reset_complete: intr.reset_complete(),
                    section_complete: intr.section_complete(),
                    bus_error: intr.bus_error(),
                    flush_complete: false,
                    sg_section_complete: intr.sg_section_complete(),
                }
            }
        }
    }

    pub fn to_raw(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Rx => RxInterrupt::new_with_raw_value(0)
                .with_reset_complete(self.reset_complete)
                .with_section_complete(self.section_complete)
                .with_bus_error(self.bus_error)
                .with_flush_complete(self.flush_complete)
                .raw_value(),
            Direction::Tx => TxInterrupt::new_with_raw_value(0)
                .with_reset_complete(self.reset_complete)
                .with_section_complete(self.section_complete)
                .with_bus_error(self.bus_error)
                .with_sg_section_complete(self.sg_section_complete)
                .raw_value(),
        }
    }

    #[inline]
    pub fn any(&self) -> bool {
        self.reset_complete
            || self.section_complete
            || self.bus_error
            || self.flush_complete
            || self.sg_section_complete
    }
}

/// Flags raised by the interrupt handler for one channel.
pub struct ChannelSignals {
    section_done: AtomicBool,
    reset_done: AtomicBool,
    bus_error: AtomicBool,
    deferred: AtomicBool,
    deferred_bus_error: AtomicBool,
    attached: AtomicBool,
    waker: AtomicWaker,
}

impl ChannelSignals {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            section_done: AtomicBool::new(false),
            reset_done: AtomicBool::new(false),
            bus_error: AtomicBool::new(false),
            deferred: AtomicBool::new(false),
            deferred_bus_error: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    pub fn clear(&self) {
        self.section_done.store(false, Ordering::Relaxed);
        self.reset_done.store(false, Ordering::Relaxed);
        self.bus_error.store(false, Ordering::Relaxed);
        self.deferred.store(false, Ordering::Relaxed);
        self.deferred_bus_error.store(false, Ordering::Relaxed);
    }

    /// Mark the channel as using interrupt completion, so [on_interrupt] services it.
    #[inline]
    pub fn attach(&self) {
        self.attached.store(true, Ordering::Release);
    }

    #[inline]
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reset_done(&self) -> bool {
        self.reset_done.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn clear_reset_done(&self) {
        self.reset_done.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_section_done(&self) {
        self.section_done.store(false, Ordering::Relaxed);
        self.bus_error.store(false, Ordering::Relaxed);
    }

    /// Consume a section complete or a bus error. Returns whether a bus error was reported.
    pub(crate) fn take_section_done(&self) -> Option<bool> {
        if self.section_done.swap(false, Ordering::AcqRel) {
            return Some(self.bus_error.swap(false, Ordering::AcqRel));
        }
        None
    }

    fn signal(&self, status: &InterruptResult) {
        if status.reset_complete {
            self.reset_done.store(true, Ordering::Release);
        }
        if status.bus_error {
            self.bus_error.store(true, Ordering::Release);
            self.deferred_bus_error.store(true, Ordering::Release);
        }
        // A bus error ends the transfer even without a section complete.
        if status.section_complete || status.bus_error {
            self.section_done.store(true, Ordering::Release);
            self.deferred.store(true, Ordering::Release);
        }
        self.waker.wake();
    }
}

/// Callback invoked from [CompletionDispatcher::run_deferred] once per completed request.
pub type CompletionCallback = fn(ChannelId, Result<(), PdmaError>);

pub struct CompletionDispatcher {
    signals: [ChannelSignals; CHANNEL_COUNT],
    callbacks: Mutex<RefCell<[Option<CompletionCallback>; CHANNEL_COUNT]>>,
    running: AtomicBool,
}

/// Dispatcher used by [on_interrupt].
pub static DISPATCHER: CompletionDispatcher = CompletionDispatcher::new();

impl CompletionDispatcher {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            signals: [const { ChannelSignals::new() }; CHANNEL_COUNT],
            callbacks: Mutex::new(RefCell::new([None; CHANNEL_COUNT])),
            running: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn signals(&self, id: ChannelId) -> &ChannelSignals {
        &self.signals[id.index()]
    }

    /// Channels whose signals are attached to a driver in interrupt completion mode.
    pub fn attached(&self) -> impl Iterator<Item = ChannelId> + '_ {
        (0..CHANNEL_COUNT as u8)
            .filter_map(ChannelId::new)
            .filter(|id| self.signals(*id).is_attached())
    }

    pub fn set_callback(&self, id: ChannelId, callback: Option<CompletionCallback>) {
        critical_section::with(|cs| {
            self.callbacks.borrow(cs).borrow_mut()[id.index()] = callback;
        });
    }

    /// Handle the interrupt of one channel.
    ///
    /// All observed status bits are cleared immediately to avoid re-triggering.
    pub fn on_channel_interrupt(
        &self,
        id: ChannelId,
        regs: &mut impl ChannelRegisters,
    ) -> InterruptResult {
        let direction = id.direction();
        let status = InterruptResult::from_raw(direction, regs.read(ChannelReg::Intr));
        if !status.any() {
            return status;
        }
        regs.write(ChannelReg::Intr, status.to_raw(direction));
        self.signals(id).signal(&status);
        status
    }

    /// Invoke the completion callbacks of all channels with a pending completion.
    ///
    /// Calls are serialized: a nested or concurrent call returns immediately without doing
    /// anything. Returns the number of invoked callbacks.
    pub fn run_deferred(&self) -> usize {
        if self.running.swap(true, Ordering::Acquire) {
            return 0;
        }
        let mut invoked = 0;
        for index in 0..CHANNEL_COUNT as u8 {
            let Some(id) = ChannelId::new(index) else {
                continue;
            };
            let signals = self.signals(id);
            if !signals.deferred.swap(false, Ordering::AcqRel) {
                continue;
            }
            let result = if signals.deferred_bus_error.swap(false, Ordering::AcqRel) {
                Err(PdmaError::BusError)
            } else {
                Ok(())
            };
            let callback =
                critical_section::with(|cs| self.callbacks.borrow(cs).borrow()[id.index()]);
            if let Some(callback) = callback {
                callback(id, result);
                invoked += 1;
            }
        }
        self.running.store(false, Ordering::Release);
        invoked
    }
}

/// Generic interrupt handler for the PDMA controller using the global [DISPATCHER].
///
/// The user has to call this once in the PDMA interrupt handler. Only channels attached to the
/// dispatcher are serviced, the status of polled channels is left alone. Returns a bit mask of
/// the channels which had a pending interrupt.
pub fn on_interrupt() -> u16 {
    let mut active = 0;
    for id in DISPATCHER.attached() {
        // Safety: Only the interrupt status register is accessed, which is owned by the
        // interrupt handler while interrupt completion is used.
        let mut regs = unsafe { id.steal_regs() };
        if DISPATCHER.on_channel_interrupt(id, &mut regs).any() {
            active |= 1 << id.index();
        }
    }
    active
}

/// Resolves once the section complete interrupt of a channel was handled. The output is
/// `true` if a bus error was reported together with the completion.
pub struct CompletionFuture {
    signals: &'static ChannelSignals,
}

impl CompletionFuture {
    #[inline]
    pub const fn new(signals: &'static ChannelSignals) -> Self {
        Self { signals }
    }
}

impl Future for CompletionFuture {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.signals.waker.register(cx.waker());
        match self.signals.take_section_done() {
            Some(bus_error) => Poll::Ready(bus_error),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use core::{pin::pin, sync::atomic::AtomicU32, task::Waker};

    use super::*;
    use crate::pdma::sim::{SimChannel, new_log};

    fn poll_once<F: Future>(future: Pin<&mut F>) -> Poll<F::Output> {
        let mut cx = Context::from_waker(Waker::noop());
        future.poll(&mut cx)
    }

    #[test]
    fn status_encoding() {
        let status = InterruptResult {
            reset_complete: true,
            section_complete: true,
            bus_error: true,
            ..Default::default()
        };
        assert_eq!(status.to_raw(Direction::Rx), 0b10_1010);
        assert_eq!(status.to_raw(Direction::Tx), 0b1011);
        assert_eq!(InterruptResult::from_raw(Direction::Tx, 0b1011), status);
        let flush = InterruptResult::from_raw(Direction::Rx, 0b1);
        assert!(flush.flush_complete && flush.any());
        assert!(!InterruptResult::from_raw(Direction::Rx, 0).any());
    }

    #[test]
    fn interrupt_clears_status_and_signals() {
        static DISPATCHER: CompletionDispatcher = CompletionDispatcher::new();
        let id = ChannelId::new(3).unwrap();
        let mut sim = SimChannel::new(id, new_log());
        let signals = DISPATCHER.signals(id);

        assert!(!DISPATCHER.on_channel_interrupt(id, &mut sim).any());
        assert_eq!(signals.take_section_done(), None);

        sim.raise_section_complete(false);
        let status = DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert!(status.section_complete);
        assert!(!status.bus_error);
        assert_eq!(sim.intr(), 0);
        assert_eq!(signals.take_section_done(), Some(false));
        assert_eq!(signals.take_section_done(), None);
        // Other channels are untouched.
        assert_eq!(
            DISPATCHER.signals(ChannelId::new(2).unwrap()).take_section_done(),
            None
        );
    }

    #[test]
    fn deferred_callbacks_run_once() {
        static DISPATCHER: CompletionDispatcher = CompletionDispatcher::new();
        static CALLS: AtomicU32 = AtomicU32::new(0);
        static BUS_ERRORS: AtomicU32 = AtomicU32::new(0);

        fn on_complete(id: ChannelId, result: Result<(), PdmaError>) {
            assert_eq!(id.index(), 8);
            CALLS.fetch_add(1, Ordering::SeqCst);
            if result == Err(PdmaError::BusError) {
                BUS_ERRORS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let id = ChannelId::new(8).unwrap();
        let mut sim = SimChannel::new(id, new_log());
        DISPATCHER.set_callback(id, Some(on_complete));
        assert_eq!(DISPATCHER.run_deferred(), 0);

        sim.raise_section_complete(false);
        DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert_eq!(DISPATCHER.run_deferred(), 1);
        assert_eq!(DISPATCHER.run_deferred(), 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        sim.raise_section_complete(true);
        DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert_eq!(DISPATCHER.run_deferred(), 1);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(BUS_ERRORS.load(Ordering::SeqCst), 1);

        // A bus error alone still completes the transfer.
        sim.raise_bus_error();
        DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert_eq!(DISPATCHER.run_deferred(), 1);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
        assert_eq!(BUS_ERRORS.load(Ordering::SeqCst), 2);

        // Without callback, pending completions are dropped.
        DISPATCHER.set_callback(id, None);
        sim.raise_section_complete(false);
        DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert_eq!(DISPATCHER.run_deferred(), 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn run_deferred_is_not_reentrant() {
        static DISPATCHER: CompletionDispatcher = CompletionDispatcher::new();
        static NESTED: AtomicU32 = AtomicU32::new(u32::MAX);

        fn on_complete(_id: ChannelId, _result: Result<(), PdmaError>) {
            NESTED.store(DISPATCHER.run_deferred() as u32, Ordering::SeqCst);
        }

        let id = ChannelId::new(0).unwrap();
        let mut sim = SimChannel::new(id, new_log());
        DISPATCHER.set_callback(id, Some(on_complete));
        sim.raise_section_complete(false);
        DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert_eq!(DISPATCHER.run_deferred(), 1);
        assert_eq!(NESTED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_future() {
        static DISPATCHER: CompletionDispatcher = CompletionDispatcher::new();
        let id = ChannelId::new(5).unwrap();
        let mut sim = SimChannel::new(id, new_log());

        let mut future = pin!(CompletionFuture::new(DISPATCHER.signals(id)));
        assert_eq!(poll_once(future.as_mut()), Poll::Pending);
        sim.raise_section_complete(true);
        DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert_eq!(poll_once(future.as_mut()), Poll::Ready(true));
    }

    #[test]
    fn bus_error_resolves_future() {
        static DISPATCHER: CompletionDispatcher = CompletionDispatcher::new();
        let id = ChannelId::new(4).unwrap();
        let mut sim = SimChannel::new(id, new_log());

        let mut future = pin!(CompletionFuture::new(DISPATCHER.signals(id)));
        assert_eq!(poll_once(future.as_mut()), Poll::Pending);
        sim.raise_bus_error();
        let status = DISPATCHER.on_channel_interrupt(id, &mut sim);
        assert!(status.bus_error && !status.section_complete);
        assert_eq!(sim.intr(), 0);
        assert_eq!(poll_once(future.as_mut()), Poll::Ready(true));
    }

    #[test]
    fn attached_channels() {
        static DISPATCHER: CompletionDispatcher = CompletionDispatcher::new();
        assert_eq!(DISPATCHER.attached().count(), 0);
        let first = ChannelId::new(1).unwrap();
        let second = ChannelId::new(11).unwrap();
        DISPATCHER.signals(second).attach();
        DISPATCHER.signals(first).attach();
        assert!(DISPATCHER.attached().eq([first, second]));

        // Clearing the signals keeps the channel attached.
        DISPATCHER.signals(first).clear();
        DISPATCHER.signals(second).detach();
        assert!(DISPATCHER.attached().eq([first]));
    }
}
