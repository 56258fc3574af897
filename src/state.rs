use portable_atomic::{AtomicU8, Ordering};

/// Connection state of the serial port, as seen from the host side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConnectionState {
    /// Not configured by a host. Transfers wait for a connection and move nothing.
    Unconfigured = 0,

    /// Configured, but the buffers still hold data from before the connection.
    Initializing = 1,

    /// Buffers initialized, transfers run normally.
    Ready = 2,
}

impl ConnectionState {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => ConnectionState::Initializing,
            2 => ConnectionState::Ready,
            _ => ConnectionState::Unconfigured,
        }
    }
}

/// The connection state, written from interrupt context and read from tasks without a lock.
pub(crate) struct ConnectionCell(AtomicU8);

impl ConnectionCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Unconfigured as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Host configured the device.
    pub fn connect(&self) {
        self.0
            .store(ConnectionState::Initializing as u8, Ordering::Release);
    }

    /// Host went away, from any state.
    pub fn disconnect(&self) {
        self.0
            .store(ConnectionState::Unconfigured as u8, Ordering::Release);
    }

    /// Initializing -> Ready. Returns `true` only for the caller that made the transition.
    pub fn advance(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Initializing as u8,
                ConnectionState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
