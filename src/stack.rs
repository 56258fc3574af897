//! The USB device stack as seen by [`CdcDriver::init`](crate::CdcDriver::init).

use crate::buffer::SharedBuffer;
use crate::cdc_acm::USB_CLASS_CDC;
use crate::descriptor::{CdcDevice, DEFAULT_DEVICE};
use crate::event::CdcEvents;
use crate::serial_port::SerialPort;
use core::borrow::BorrowMut;
use core::fmt;
use usb_device::bus::{UsbBus, UsbBusAllocator};
use usb_device::descriptor::lang_id::LangID;
use usb_device::device::{StringDescriptors, UsbDevice, UsbDeviceBuilder, UsbVidPid};

/// Boot-time services the driver needs from a USB device stack.
pub trait UsbStack {
    type Error;

    /// Hooks the stack's device interrupt handler to the USB interrupt.
    fn install_interrupt(&mut self) -> Result<(), Self::Error>;

    /// Forces the controller into device mode.
    fn set_device_mode(&mut self);

    /// Registers the CDC device, connecting it to the bus.
    fn register(&mut self, device: &'static CdcDevice) -> Result<(), Self::Error>;
}

/// Why [`UsbdStack`] refused a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    /// `register` came before `set_device_mode`.
    NotDeviceMode,

    /// Nothing has been registered yet.
    NotRegistered,

    /// usb-device rejected the descriptor data.
    Descriptor,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::NotDeviceMode => f.write_str("controller not in device mode"),
            StackError::NotRegistered => f.write_str("no device registered"),
            StackError::Descriptor => f.write_str("invalid descriptor data"),
        }
    }
}

/// [`UsbStack`] on top of [usb-device](https://crates.io/crates/usb-device).
///
/// usb-device has no interrupt plumbing of its own: the application's USB interrupt handler
/// calls [`SerialPort::service`]. `register` records the descriptor set, which
/// [`build`](UsbdStack::build) and [`serial_port`](UsbdStack::serial_port) turn into the
/// usb-device objects once the bus allocator exists.
#[derive(Debug, Default)]
pub struct UsbdStack {
    device_mode: bool,
    device: Option<&'static CdcDevice>,
}

impl UsbdStack {
    pub const fn new() -> Self {
        Self {
            device_mode: false,
            device: None,
        }
    }

    /// The registered descriptor set.
    pub fn device(&self) -> Option<&'static CdcDevice> {
        self.device
    }

    /// Builds the `UsbDevice` for the registered descriptor set.
    pub fn build<'a, B: UsbBus>(
        &self,
        alloc: &'a UsbBusAllocator<B>,
    ) -> Result<UsbDevice<'a, B>, StackError> {
        let device = self.device.ok_or(StackError::NotRegistered)?;

        let builder = UsbDeviceBuilder::new(alloc, UsbVidPid(device.vid, device.pid))
            .strings(&[StringDescriptors::new(LangID::EN_US)
                .manufacturer(device.manufacturer)
                .product(device.product)
                .serial_number(device.serial_number)])
            .map_err(|_| StackError::Descriptor)?
            .self_powered(device.self_powered)
            .max_power(usize::from(device.max_power))
            .map_err(|_| StackError::Descriptor)?
            .device_class(USB_CLASS_CDC);

        Ok(builder.build())
    }

    /// Creates the CDC-ACM class for the registered device, reporting to `events` and moving
    /// data through `read_buf` and `write_buf`.
    pub fn serial_port<'a, B, H, RS, WS>(
        &self,
        alloc: &'a UsbBusAllocator<B>,
        events: &'a H,
        read_buf: &'a SharedBuffer<RS>,
        write_buf: &'a SharedBuffer<WS>,
    ) -> SerialPort<'a, B, H, RS, WS>
    where
        B: UsbBus,
        H: CdcEvents,
        RS: BorrowMut<[u8]>,
        WS: BorrowMut<[u8]>,
    {
        let device = self.device.unwrap_or(&DEFAULT_DEVICE);
        SerialPort::new(alloc, device.control_interface, events, read_buf, write_buf)
    }
}

impl UsbStack for UsbdStack {
    type Error = StackError;

    fn install_interrupt(&mut self) -> Result<(), StackError> {
        Ok(())
    }

    fn set_device_mode(&mut self) {
        self.device_mode = true;
    }

    fn register(&mut self, device: &'static CdcDevice) -> Result<(), StackError> {
        if !self.device_mode {
            return Err(StackError::NotDeviceMode);
        }
        if device.product.is_empty() {
            return Err(StackError::Descriptor);
        }

        debug!("registered {=u16:#x}:{=u16:#x}", device.vid, device.pid);
        self.device = Some(device);
        Ok(())
    }
}
