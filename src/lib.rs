//! Buffered CDC-ACM virtual serial port with blocking, timeout-bounded transfers.
//!
//! CDC-ACM is a USB class that's supported out of the box by most operating systems and used for
//! implementing modems and generic serial ports. This crate splits a serial port into two halves
//! that share a pair of ring buffers:
//!
//! - [`CdcDriver`] is the task side. [`receive_data`](CdcDriver::receive_data) and
//!   [`send_data`](CdcDriver::send_data) block on kernel signals, bounded by a [`Timeout`], and
//!   [`wait_for_connect`](CdcDriver::wait_for_connect) waits for a host.
//! - The USB stack is the interrupt side. It fills and drains the buffers and reports what it
//!   did through the [`CdcEvents`] handlers, which `CdcDriver` implements. [`SerialPort`] is
//!   such a stack side for [usb-device](https://crates.io/crates/usb-device).
//!
//! The blocking primitives come from a [`Kernel`]; the `std` feature provides
//! [`hosted::HostKernel`].
//!
//! Example
//! =======
//!
//! A full example requires the use of a hardware-driver and a kernel, but the hardware independent
//! part is as follows:
//!
//! ```ignore
//! use usbd_cdcd::{CdcDriver, Config, SharedBuffer, Timeout, UsbdStack};
//!
//! static RX: SharedBuffer = SharedBuffer::new();
//! static TX: SharedBuffer = SharedBuffer::new();
//!
//! // Runs the USB interrupt handler below when a task moved data.
//! fn pend_usb() {
//!     NVIC::pend(Interrupt::USB);
//! }
//!
//! // Boot.
//! let mut stack = UsbdStack::new();
//! let config = Config::new().wake_stack(pend_usb);
//! let driver = CdcDriver::init(config, &kernel, &mut stack, &RX, &TX);
//! let mut usb_dev = stack.build(&usb_bus).unwrap();
//! let mut serial = stack.serial_port(&usb_bus, &driver, &RX, &TX);
//!
//! // USB interrupt.
//! serial.service(&mut usb_dev);
//!
//! // Task.
//! loop {
//!     if !driver.wait_for_connect(Timeout::Forever) {
//!         continue;
//!     }
//!
//!     let mut buf = [0u8; 64];
//!     let count = driver.receive_data(&mut buf, Timeout::ticks(100));
//!     driver.send_data(&buf[..count], Timeout::Forever);
//! }
//! ```

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
mod log;

mod buffer;
mod cdc_acm;
mod descriptor;
mod driver;
mod event;
#[cfg(any(test, feature = "std"))]
pub mod hosted;
mod io;
mod kernel;
mod serial_port;
mod stack;
mod state;

pub use crate::buffer::{DefaultBufferStore, SharedBuffer, UsbBuffer, BUFFER_SIZE};
pub use crate::cdc_acm::*;
pub use crate::descriptor::*;
pub use crate::driver::{CdcDriver, Config, InitError, Resource};
pub use crate::event::*;
pub use crate::io::{Error, Port};
pub use crate::kernel::{Gate, Kernel, KernelError, Signal, Timeout};
pub use crate::serial_port::*;
pub use crate::stack::{StackError, UsbStack, UsbdStack};
pub use crate::state::ConnectionState;
pub use embedded_io;
pub use usb_device::{Result, UsbError};
