//! Routing of shared peripheral pads to the PDMA handshake lines.
//!
//! SSIC2 and SSIC3 share channel pair 2, UART2, UART3 and UART4 share channel pair 6. The pad
//! multiplexer of the secure system controller selects which device is connected.
use leipzig::sysc::{MmioSecureSysc, PadMux, SecureSysc};

use super::DeviceType;

/// Bits to clear and set in the pad multiplexer register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PadMuxUpdate {
    pub clear: u32,
    pub set: u32,
}

impl PadMuxUpdate {
    /// Required pad multiplexer change for a device, or [None] if the device has dedicated
    /// pads.
    pub fn for_device(device: DeviceType) -> Option<Self> {
        let ssic = PadMux::new_with_raw_value(0)
            .with_ssic_select_lo(true)
            .with_ssic_select_hi(true)
            .raw_value();
        let uart_a = PadMux::new_with_raw_value(0)
            .with_uart_select_a_lo(true)
            .with_uart_select_a_hi(true)
            .raw_value();
        let uart_b = PadMux::new_with_raw_value(0)
            .with_uart_select_b_lo(true)
            .with_uart_select_b_hi(true)
            .raw_value();
        match device {
            DeviceType::Ssic2 => Some(Self {
                clear: ssic,
                set: 0,
            }),
            DeviceType::Ssic3 => Some(Self {
                clear: 0,
                set: ssic,
            }),
            DeviceType::Uart2 => Some(Self {
                clear: uart_a | uart_b,
                set: 0,
            }),
            DeviceType::Uart3 => Some(Self {
                clear: uart_b,
                set: uart_a,
            }),
            DeviceType::Uart4 => Some(Self {
                clear: 0,
                set: uart_b,
            }),
            _ => None,
        }
    }

    #[inline]
    pub fn apply(&self, value: u32) -> u32 {
        (value & !self.clear) | self.set
    }
}

/// Raw access to the pad multiplexer register.
pub trait PadMuxRegister {
    fn read(&mut self) -> u32;
    fn write(&mut self, value: u32);
}

impl PadMuxRegister for MmioSecureSysc<'static> {
    #[inline]
    fn read(&mut self) -> u32 {
        self.read_pad_mux().raw_value()
    }

    #[inline]
    fn write(&mut self, value: u32) {
        self.write_pad_mux(PadMux::new_with_raw_value(value));
    }
}

/// Route the shared pads to the given device.
///
/// Returns the applied update, or [None] without touching the register for devices with
/// dedicated pads.
pub fn route_pads(pads: &mut impl PadMuxRegister, device: DeviceType) -> Option<PadMuxUpdate> {
    let update = PadMuxUpdate::for_device(device)?;
    // The pad multiplexer register is shared with other pad functions.
    critical_section::with(|_| {
        let value = pads.read();
        pads.write(update.apply(value));
    });
    log::debug!("pdma: routed shared pads to {:?}", device);
    Some(update)
}

/// [route_pads] on the secure system controller at its fixed address.
///
/// # Safety
///
/// The caller must run in a context which is allowed to write the secure system controller.
pub unsafe fn configure_pads(device: DeviceType) -> Option<PadMuxUpdate> {
    let mut sysc = unsafe { SecureSysc::new_mmio_fixed() };
    route_pads(&mut sysc, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdma::sim::SimPadMux;

    #[test]
    fn shared_pad_masks() {
        assert_eq!(
            PadMuxUpdate::for_device(DeviceType::Ssic2),
            Some(PadMuxUpdate {
                clear: 0x11,
                set: 0
            })
        );
        assert_eq!(
            PadMuxUpdate::for_device(DeviceType::Ssic3),
            Some(PadMuxUpdate {
                clear: 0,
                set: 0x11
            })
        );
        assert_eq!(
            PadMuxUpdate::for_device(DeviceType::Uart2),
            Some(PadMuxUpdate {
                clear: 0x3300,
                set: 0
            })
        );
        assert_eq!(
            PadMuxUpdate::for_device(DeviceType::Uart3),
            Some(PadMuxUpdate {
                clear: 0x2200,
                set: 0x1100
            })
        );
        assert_eq!(
            PadMuxUpdate::for_device(DeviceType::Uart4),
            Some(PadMuxUpdate {
                clear: 0,
                set: 0x2200
            })
        );
        for device in [
            DeviceType::Ssic0,
            DeviceType::Ssic1,
            DeviceType::I2ssc,
            DeviceType::Uart0,
            DeviceType::Uart1,
        ] {
            assert_eq!(PadMuxUpdate::for_device(device), None);
        }
    }

    #[test]
    fn route_shared_pads() {
        let mut pads = SimPadMux {
            value: 0x8000_0000,
            writes: 0,
        };
        assert_eq!(
            route_pads(&mut pads, DeviceType::Ssic3),
            PadMuxUpdate::for_device(DeviceType::Ssic3)
        );
        assert_eq!(pads.value, 0x8000_0011);
        route_pads(&mut pads, DeviceType::Ssic2);
        assert_eq!(pads.value, 0x8000_0000);
        assert_eq!(pads.writes, 2);
        assert_eq!(route_pads(&mut pads, DeviceType::I2ssc), None);
        assert_eq!(pads.writes, 2);
    }

    #[test]
    fn apply_keeps_other_bits() {
        let update = PadMuxUpdate::for_device(DeviceType::Uart3).unwrap();
        assert_eq!(update.apply(0xFFFF_0000 | 0x2211), 0xFFFF_0000 | 0x1111);
        let update = PadMuxUpdate::for_device(DeviceType::Uart4).unwrap();
        assert_eq!(update.apply(0x1100), 0x3300);
    }
}
