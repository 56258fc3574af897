//! The buffered serial port driver.
//!
//! [`CdcDriver`] turns the callbacks of a USB stack into blocking, timeout-bounded reads and
//! writes. Tasks call [`receive_data`](CdcDriver::receive_data),
//! [`send_data`](CdcDriver::send_data) and [`wait_for_connect`](CdcDriver::wait_for_connect);
//! the stack's interrupt handler calls the [`CdcEvents`] handlers.
//!
//! Every blocking call holds the gate of its direction for its whole duration, including the
//! pends. Concurrent callers of one direction run one after another.

use crate::buffer::UsbBuffer;
use crate::cdc_acm::LineCoding;
use crate::descriptor::{CdcDevice, DEFAULT_DEVICE};
use crate::event::{CdcEvents, EventStatus, RxEvent, SerialEvent, TxEvent, STATUS_HANDLED};
use crate::io::Port;
use crate::kernel::{Gate, Kernel, KernelError, Signal, Timeout};
use crate::stack::UsbStack;
use crate::state::{ConnectionCell, ConnectionState};
use core::cell::Cell;
use core::cmp;
use core::fmt;
use critical_section::Mutex;

/// Boot-time settings of a [`CdcDriver`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    device: &'static CdcDevice,
    line_coding: LineCoding,
    wake: fn(),
}

impl Config {
    pub const fn new() -> Self {
        Self {
            device: &DEFAULT_DEVICE,
            line_coding: LineCoding::new(),
            wake: stack_runs_anyway,
        }
    }

    /// Descriptor data registered with the stack.
    pub const fn device(mut self, device: &'static CdcDevice) -> Self {
        self.device = device;
        self
    }

    /// Line coding reported to the host until it sets its own.
    pub const fn line_coding(mut self, line_coding: LineCoding) -> Self {
        self.line_coding = line_coding;
        self
    }

    /// Called after a task put data into the transmit buffer or took data out of the receive
    /// buffer.
    ///
    /// An idle stack gets no interrupt for either, so `wake` has to get it to move packets
    /// again. With [`SerialPort`](crate::SerialPort), pend the USB interrupt whose handler calls
    /// [`SerialPort::service`](crate::SerialPort::service). Runs in task context.
    pub const fn wake_stack(mut self, wake: fn()) -> Self {
        self.wake = wake;
        self
    }
}

// For stacks that are polled continuously.
fn stack_runs_anyway() {}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// The owner of a signal or gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resource {
    Tx,
    Rx,
    Connect,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Tx => "TX",
            Resource::Rx => "RX",
            Resource::Connect => "connect",
        })
    }
}

/// Why [`CdcDriver::try_init`] failed. `E` is the error type of the USB stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError<E> {
    /// The stack couldn't install its interrupt handler.
    Interrupt(E),

    Signal(Resource, KernelError),

    Gate(Resource, KernelError),

    /// The stack rejected the descriptor set.
    Register(E),
}

impl<E> fmt::Display for InitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Interrupt(_) => f.write_str("can't create USB interrupt handler"),
            InitError::Signal(resource, err) => {
                write!(f, "can't create {} signal: {}", resource, err)
            }
            InitError::Gate(resource, err) => write!(f, "can't create {} gate: {}", resource, err),
            InitError::Register(_) => f.write_str("error initializing the serial device"),
        }
    }
}

/// Buffered CDC serial port.
///
/// `R` and `T` are the receive and transmit buffers shared with the USB stack, usually
/// `&'static SharedBuffer`.
pub struct CdcDriver<K: Kernel, R, T> {
    state: ConnectionCell,
    rx: R,
    tx: T,
    rx_signal: K::Signal,
    tx_signal: K::Signal,
    connect_signal: K::Signal,
    rx_gate: K::Gate,
    tx_gate: K::Gate,
    connect_gate: K::Gate,
    line_coding: Mutex<Cell<LineCoding>>,
    device: &'static CdcDevice,
    wake: fn(),
}

impl<K, R, T> CdcDriver<K, R, T>
where
    K: Kernel,
    R: UsbBuffer,
    T: UsbBuffer,
{
    /// Sets up the driver and registers the device with `stack`.
    ///
    /// # Panics
    ///
    /// If the interrupt handler, a signal or a gate can't be created, or if the stack rejects
    /// the device. The driver can't run without any of them.
    pub fn init<S: UsbStack>(config: Config, kernel: &K, stack: &mut S, rx: R, tx: T) -> Self {
        match Self::try_init(config, kernel, stack, rx, tx) {
            Ok(driver) => driver,
            Err(err) => panic!("{}", err),
        }
    }

    /// Like [`init`](CdcDriver::init), but reports the failure instead of panicking.
    pub fn try_init<S: UsbStack>(
        config: Config,
        kernel: &K,
        stack: &mut S,
        rx: R,
        tx: T,
    ) -> Result<Self, InitError<S::Error>> {
        stack.install_interrupt().map_err(InitError::Interrupt)?;

        let signal = |resource| {
            kernel
                .signal()
                .map_err(|err| InitError::Signal(resource, err))
        };
        let tx_signal = signal(Resource::Tx)?;
        let rx_signal = signal(Resource::Rx)?;
        let connect_signal = signal(Resource::Connect)?;

        let gate = |resource| kernel.gate().map_err(|err| InitError::Gate(resource, err));
        let tx_gate = gate(Resource::Tx)?;
        let rx_gate = gate(Resource::Rx)?;
        let connect_gate = gate(Resource::Connect)?;

        let driver = Self {
            state: ConnectionCell::new(),
            rx,
            tx,
            rx_signal,
            tx_signal,
            connect_signal,
            rx_gate,
            tx_gate,
            connect_gate,
            line_coding: Mutex::new(Cell::new(config.line_coding)),
            device: config.device,
            wake: config.wake,
        };

        stack.set_device_mode();
        stack.register(driver.device).map_err(InitError::Register)?;

        debug!("serial device registered");
        Ok(driver)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether a host has configured the device.
    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Unconfigured
    }

    /// The descriptor data registered at init.
    pub fn device(&self) -> &'static CdcDevice {
        self.device
    }

    /// The line coding the host set last.
    pub fn line_coding(&self) -> LineCoding {
        critical_section::with(|cs| self.line_coding.borrow(cs).get())
    }

    /// Blocks until a host configures the device or `timeout` expires.
    ///
    /// Returns `true` when connected, `false` otherwise. A finite `timeout` covers a single
    /// wait: a connection that is gone again by the time the caller wakes up ends the wait
    /// early with `false`. `Forever` waits for a connection that is still there.
    pub fn wait_for_connect(&self, timeout: Timeout) -> bool {
        let _gate = self.connect_gate.enter();

        // Posts of connections that are already gone don't count.
        while !self.is_connected() && self.connect_signal.pend(Timeout::NoWait) {}

        if timeout == Timeout::Forever {
            while !self.is_connected() {
                self.connect_signal.pend(Timeout::Forever);
            }
            return true;
        }

        self.is_connected() || (self.connect_signal.pend(timeout) && self.is_connected())
    }

    /// Reads whatever is buffered, up to `buf.len()` bytes, waiting at most once for data.
    ///
    /// Returns the number of bytes read. 0 means nothing arrived within `timeout` or the port
    /// wasn't connected; after the latter, the call waited for a connection.
    pub fn receive_data(&self, buf: &mut [u8], timeout: Timeout) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let state = self.state();
        if state == ConnectionState::Unconfigured {
            self.wait_for_connect(timeout);
            return 0;
        }

        let _gate = self.rx_gate.enter();
        if state == ConnectionState::Initializing {
            self.reinit_buffers();
        }

        if self.rx.data_available() || self.rx_signal.pend(timeout) {
            let count = self.rx.read(buf);
            if count > 0 {
                // There may be a packet waiting for the room this made.
                (self.wake)();
            }
            trace!("rx {=usize}", count);
            count
        } else {
            0
        }
    }

    /// Buffers `data` for transmission, waiting for room as often as needed.
    ///
    /// Each round writes as much as fits, wakes the stack (see [`Config::wake_stack`]) and then
    /// waits for it to report a finished packet. Returns the number of bytes buffered, short if a wait timed out. 0 if the port
    /// wasn't connected; in that case, the call waited for a connection.
    pub fn send_data(&self, data: &[u8], timeout: Timeout) -> usize {
        if data.is_empty() {
            return 0;
        }

        let state = self.state();
        if state == ConnectionState::Unconfigured {
            self.wait_for_connect(timeout);
            return 0;
        }

        let _gate = self.tx_gate.enter();
        if state == ConnectionState::Initializing {
            self.reinit_buffers();
        }

        let mut sent = 0;
        while sent < data.len() {
            let count = cmp::min(data.len() - sent, self.tx.space_available());
            let written = self.tx.write(&data[sent..sent + count]);
            if written > 0 {
                (self.wake)();
            }
            sent += written;

            if !self.tx_signal.pend(timeout) {
                break;
            }
        }

        trace!("tx {=usize}/{=usize}", sent, data.len());
        sent
    }

    /// Whether [`receive_data`](CdcDriver::receive_data) would return data without waiting.
    pub fn read_ready(&self) -> bool {
        self.is_connected() && self.rx.data_available()
    }

    /// Whether [`send_data`](CdcDriver::send_data) would accept data without waiting.
    pub fn write_ready(&self) -> bool {
        self.is_connected() && self.tx.space_available() > 0
    }

    /// A stream handle whose calls wait up to `timeout`.
    pub fn port(&self, timeout: Timeout) -> Port<'_, K, R, T> {
        Port::new(self, timeout)
    }

    /// Drops data left over from before the connection, once per connection.
    fn reinit_buffers(&self) {
        critical_section::with(|_| {
            // Buffer access of the other direction can't slip in between the state change and
            // the clear.
            if self.state.advance() {
                self.rx.init();
                self.tx.init();
                debug!("buffers reinitialized");
            }
        });
    }
}

impl<K, R, T> CdcEvents for CdcDriver<K, R, T>
where
    K: Kernel,
    R: UsbBuffer,
    T: UsbBuffer,
{
    fn rx_event(&self, event: RxEvent) -> EventStatus {
        match event {
            RxEvent::Available(_) => self.rx_signal.post(),
            RxEvent::DataRemaining | RxEvent::RequestBuffer | RxEvent::Other(_) => {}
        }

        STATUS_HANDLED
    }

    fn tx_event(&self, event: TxEvent) -> EventStatus {
        if let TxEvent::Complete(_) = event {
            self.tx_signal.post();
        }

        STATUS_HANDLED
    }

    fn serial_event(&self, event: SerialEvent<'_>) -> EventStatus {
        match event {
            SerialEvent::Connected => {
                self.state.connect();
                self.connect_signal.post();
                debug!("connected");
            }
            SerialEvent::Disconnected => {
                self.state.disconnect();
                debug!("disconnected");
            }
            SerialEvent::GetLineCoding(line_coding) => {
                *line_coding = self.line_coding();
            }
            SerialEvent::SetLineCoding(line_coding) => {
                critical_section::with(|cs| self.line_coding.borrow(cs).set(*line_coding));
                trace!("line coding {}", line_coding);
            }
            _event => {
                trace!("unhandled {}", _event);
            }
        }

        STATUS_HANDLED
    }
}
