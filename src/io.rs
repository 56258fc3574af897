use crate::buffer::UsbBuffer;
use crate::driver::CdcDriver;
use crate::kernel::{Kernel, Timeout};
use core::fmt;
use core::slice;

/// Stream handle on a [`CdcDriver`], created by [`CdcDriver::port`].
///
/// The `embedded-io` traits block up to the port's timeout. The `embedded-hal` serial traits
/// never block and report `WouldBlock` instead.
pub struct Port<'d, K: Kernel, R, T> {
    driver: &'d CdcDriver<K, R, T>,
    timeout: Timeout,
}

impl<'d, K, R, T> Port<'d, K, R, T>
where
    K: Kernel,
    R: UsbBuffer,
    T: UsbBuffer,
{
    pub(crate) fn new(driver: &'d CdcDriver<K, R, T>, timeout: Timeout) -> Self {
        Self { driver, timeout }
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Nothing moved before the timeout expired.
    TimedOut,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TimedOut => f.write_str("timed out"),
        }
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Error::TimedOut => embedded_io::ErrorKind::TimedOut,
        }
    }
}

impl<K: Kernel, R: UsbBuffer, T: UsbBuffer> embedded_io::ErrorType for Port<'_, K, R, T> {
    type Error = Error;
}

impl<K: Kernel, R: UsbBuffer, T: UsbBuffer> embedded_io::Read for Port<'_, K, R, T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut connected = self.driver.is_connected();
        loop {
            match self.driver.receive_data(buf, self.timeout) {
                // We are required by `embedded-io` to continue reading until at least one byte is
                // read.
                0 if self.timeout == Timeout::Forever => {}
                // That call only waited for the connection.
                0 if !connected && self.driver.is_connected() => connected = true,
                0 => return Err(Error::TimedOut),
                count => return Ok(count),
            }
        }
    }
}

impl<K: Kernel, R: UsbBuffer, T: UsbBuffer> embedded_io::ReadReady for Port<'_, K, R, T> {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.driver.read_ready())
    }
}

impl<K: Kernel, R: UsbBuffer, T: UsbBuffer> embedded_io::Write for Port<'_, K, R, T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut connected = self.driver.is_connected();
        loop {
            match self.driver.send_data(buf, self.timeout) {
                0 if self.timeout == Timeout::Forever => {}
                0 if !connected && self.driver.is_connected() => connected = true,
                0 => return Err(Error::TimedOut),
                count => return Ok(count),
            }
        }
    }

    /// Written data is already in the hands of the stack.
    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<K: Kernel, R: UsbBuffer, T: UsbBuffer> embedded_io::WriteReady for Port<'_, K, R, T> {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.driver.write_ready())
    }
}

impl<K: Kernel, R: UsbBuffer, T: UsbBuffer> embedded_hal::serial::Read<u8> for Port<'_, K, R, T> {
    type Error = Error;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let mut byte = 0;

        match self
            .driver
            .receive_data(slice::from_mut(&mut byte), Timeout::NoWait)
        {
            0 => Err(nb::Error::WouldBlock),
            _ => Ok(byte),
        }
    }
}

impl<K: Kernel, R: UsbBuffer, T: UsbBuffer> embedded_hal::serial::Write<u8> for Port<'_, K, R, T> {
    type Error = Error;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        match self
            .driver
            .send_data(slice::from_ref(&word), Timeout::NoWait)
        {
            0 => Err(nb::Error::WouldBlock),
            _ => Ok(()),
        }
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::Error;
    use crate::buffer::{SharedBuffer, UsbBuffer};
    use crate::driver::{CdcDriver, Config};
    use crate::event::{CdcEvents, RxEvent, SerialEvent};
    use crate::hosted::HostKernel;
    use crate::kernel::Timeout;
    use crate::stack::UsbdStack;
    use crate::state::ConnectionState;
    use core::convert::Infallible;
    use embedded_io::{Error as _, ErrorKind, Read, ReadReady, Write, WriteReady};
    use std::thread;

    type Rx = SharedBuffer<[u8; 16]>;
    type Tx = SharedBuffer<[u8; 4]>;
    type TestDriver<'a> = CdcDriver<HostKernel, &'a Rx, &'a Tx>;

    fn driver<'a>(rx: &'a Rx, tx: &'a Tx) -> TestDriver<'a> {
        let mut stack = UsbdStack::new();
        CdcDriver::init(Config::new(), &HostKernel::default(), &mut stack, rx, tx)
    }

    fn stage(rx: &Rx, data: &[u8]) {
        rx.fill(data.len(), |dest| {
            dest.copy_from_slice(data);
            Ok::<_, Infallible>(data.len())
        })
        .unwrap();
    }

    #[test]
    fn read_times_out() {
        let (rx, tx) = (Rx::with_store([0; 16]), Tx::with_store([0; 4]));
        let driver = driver(&rx, &tx);
        let mut port = driver.port(Timeout::ticks(2));

        let mut buf = [0; 4];
        let err = port.read(&mut buf).unwrap_err();
        assert_eq!(err, Error::TimedOut);
        assert_eq!(err.kind(), ErrorKind::TimedOut);

        driver.serial_event(SerialEvent::Connected);
        assert_eq!(port.read(&mut buf), Err(Error::TimedOut));
        assert_eq!(port.read(&mut []), Ok(0));
    }

    #[test]
    fn read_buffered_data() {
        let (rx, tx) = (Rx::with_store([0; 16]), Tx::with_store([0; 4]));
        let driver = driver(&rx, &tx);
        driver.serial_event(SerialEvent::Connected);
        let mut port = driver.port(Timeout::NoWait);

        assert_eq!(port.read_ready(), Ok(false));
        let mut buf = [0; 8];
        assert_eq!(port.read(&mut buf), Err(Error::TimedOut));

        stage(&rx, b"data");
        assert_eq!(port.read_ready(), Ok(true));
        assert_eq!(port.read(&mut buf), Ok(4));
        assert_eq!(&buf[..4], b"data");
    }

    #[test]
    fn read_waits_through_connect() {
        let (rx, tx) = (Rx::with_store([0; 16]), Tx::with_store([0; 4]));
        let driver = driver(&rx, &tx);

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut port = driver.port(Timeout::ticks(5000));
                let mut buf = [0; 8];
                let count = port.read(&mut buf).unwrap();
                buf[..count].to_vec()
            });

            driver.serial_event(SerialEvent::Connected);
            // Data arrives once the reader cleared out the old connection's leftovers.
            while driver.state() != ConnectionState::Ready {
                thread::yield_now();
            }
            stage(&rx, b"late");
            driver.rx_event(RxEvent::Available(4));

            assert_eq!(reader.join().unwrap(), b"late");
        });
    }

    #[test]
    fn write_until_full() {
        let (rx, tx) = (Rx::with_store([0; 16]), Tx::with_store([0; 4]));
        let driver = driver(&rx, &tx);
        let mut port = driver.port(Timeout::NoWait);

        assert_eq!(port.write(b"early"), Err(Error::TimedOut));
        assert_eq!(port.write_ready(), Ok(false));

        driver.serial_event(SerialEvent::Connected);
        assert_eq!(port.write(b"abc"), Ok(3));
        assert_eq!(port.write_ready(), Ok(true));
        assert_eq!(port.write(b"def"), Ok(1));
        assert_eq!(port.write(b"gh"), Err(Error::TimedOut));
        assert_eq!(port.flush(), Ok(()));

        let mut out = [0; 4];
        assert_eq!(tx.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn nb_serial() {
        let (rx, tx) = (Rx::with_store([0; 16]), Tx::with_store([0; 4]));
        let driver = driver(&rx, &tx);
        driver.serial_event(SerialEvent::Connected);
        let mut port = driver.port(Timeout::Forever);

        assert_eq!(
            embedded_hal::serial::Read::read(&mut port),
            Err(nb::Error::WouldBlock)
        );
        stage(&rx, b"xy");
        assert_eq!(embedded_hal::serial::Read::read(&mut port), Ok(b'x'));
        assert_eq!(embedded_hal::serial::Read::read(&mut port), Ok(b'y'));

        for &byte in b"1234" {
            assert_eq!(embedded_hal::serial::Write::write(&mut port, byte), Ok(()));
        }
        assert_eq!(
            embedded_hal::serial::Write::write(&mut port, b'5'),
            Err(nb::Error::WouldBlock)
        );
        assert_eq!(embedded_hal::serial::Write::flush(&mut port), Ok(()));
        assert_eq!(port.timeout(), Timeout::Forever);
    }
}
