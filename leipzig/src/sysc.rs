//! Secure system controller register module.
//!
//! Only the pad multiplexer register which routes the shared SSIC and UART pads to the PDMA
//! handshake lines is described here.

pub const SYSC_SECURE_BASE_ADDR: usize = 0xCEF0_0000;

#[bitbybit::bitfield(u32, debug)]
pub struct PadMux {
    /// Second select bit for the UART2/UART3/UART4 pads.
    #[bit(13, rw)]
    uart_select_b_hi: bool,
    /// First select bit for the UART2/UART3/UART4 pads.
    #[bit(12, rw)]
    uart_select_a_hi: bool,
    #[bit(9, rw)]
    uart_select_b_lo: bool,
    #[bit(8, rw)]
    uart_select_a_lo: bool,
    /// Route the shared SSIC pads to SSIC3 instead of SSIC2.
    #[bit(4, rw)]
    ssic_select_hi: bool,
    #[bit(0, rw)]
    ssic_select_lo: bool,
}

/// Secure system controller.
#[derive(derive_mmio::Mmio)]
#[repr(C)]
pub struct SecureSysc {
    _reserved0: [u32; 0x33],
    pad_mux: PadMux,
}

static_assertions::const_assert_eq!(core::mem::size_of::<SecureSysc>(), 0xD0);

impl SecureSysc {
    /// Create a new secure system controller MMIO instance at the fixed base address.
    ///
    /// # Safety
    ///
    /// This API can be used to potentially create a driver to the same peripheral structure
    /// from multiple threads. The user must ensure that concurrent accesses are safe and do not
    /// interfere with each other.
    #[inline]
    pub const unsafe fn new_mmio_fixed() -> MmioSecureSysc<'static> {
        unsafe { SecureSysc::new_mmio_at(SYSC_SECURE_BASE_ADDR) }
    }
}
