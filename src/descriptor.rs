//! Fixed descriptor data of the virtual COM port.
//!
//! These tables are static configuration handed to the USB stack at
//! [`init`](crate::CdcDriver::init) time. The stack owns enumeration; the driver never looks at
//! them again.

/// Texas Instruments vendor ID.
pub const USB_VID_TI: u16 = 0x1cbe;

/// Product ID of the virtual serial port.
pub const USB_PID_SERIAL: u16 = 0x0002;

/// Device identity and strings for one CDC device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CdcDevice {
    pub vid: u16,
    pub pid: u16,
    /// Maximum bus current in mA. 0 together with `self_powered` draws nothing from VBUS.
    pub max_power: u16,
    pub self_powered: bool,
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial_number: &'static str,
    /// Name of the ACM communication interface.
    pub control_interface: &'static str,
}

/// The stock virtual COM port.
pub const DEFAULT_DEVICE: CdcDevice = CdcDevice::new();

impl CdcDevice {
    pub const fn new() -> Self {
        Self {
            vid: USB_VID_TI,
            pid: USB_PID_SERIAL,
            max_power: 0,
            self_powered: true,
            manufacturer: "Texas Instruments",
            product: "Virtual COM Port",
            serial_number: "12345678",
            control_interface: "ACM Control Interface",
        }
    }

    pub const fn vid_pid(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }

    /// Sets the power attributes. A bus powered device must declare its current draw.
    pub const fn power(mut self, self_powered: bool, max_power: u16) -> Self {
        self.self_powered = self_powered;
        self.max_power = max_power;
        self
    }

    pub const fn manufacturer(mut self, manufacturer: &'static str) -> Self {
        self.manufacturer = manufacturer;
        self
    }

    pub const fn product(mut self, product: &'static str) -> Self {
        self.product = product;
        self
    }

    pub const fn serial_number(mut self, serial_number: &'static str) -> Self {
        self.serial_number = serial_number;
        self
    }

    pub const fn control_interface(mut self, name: &'static str) -> Self {
        self.control_interface = name;
        self
    }
}

impl Default for CdcDevice {
    fn default() -> Self {
        Self::new()
    }
}
