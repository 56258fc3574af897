//! Events the USB stack reports to the driver.
//!
//! A stack calls the three [`CdcEvents`] handlers from its interrupt handler. Handlers never
//! block and always return a status, [`STATUS_HANDLED`] for everything this driver knows about
//! and for everything it doesn't.

use crate::cdc_acm::LineCoding;

/// Value a handler returns to the stack.
pub type EventStatus = u32;

/// "Handled, no value".
pub const STATUS_HANDLED: EventStatus = 0;

/// Events of the receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxEvent {
    /// New data landed in the receive buffer; carries the byte count.
    Available(usize),

    /// The stack still holds data it couldn't fit into the buffer.
    DataRemaining,

    /// The stack asks for a buffer to receive into.
    RequestBuffer,

    /// Any other stack event code.
    Other(u32),
}

/// Events of the transmit buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxEvent {
    /// A packet went out to the host, freeing buffer space; carries the packet size.
    Complete(usize),

    /// Any other stack event code.
    Other(u32),
}

/// Device-level and control-transfer events.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SerialEvent<'a> {
    /// A host configured the device.
    Connected,

    /// The host deconfigured the device or the bus was reset.
    Disconnected,

    /// GET_LINE_CODING: the handler fills in the current line coding.
    GetLineCoding(&'a mut LineCoding),

    /// SET_LINE_CODING: the host picked a new line coding.
    SetLineCoding(&'a LineCoding),

    /// SET_CONTROL_LINE_STATE.
    ControlLineState { dtr: bool, rts: bool },

    /// SEND_BREAK with a non-zero duration in milliseconds (0xFFFF: until cleared).
    SendBreak(u16),

    /// SEND_BREAK with a zero duration.
    ClearBreak,

    Suspend,

    Resume,

    /// Any other stack event code.
    Other(u32),
}

/// Handlers the USB stack calls from interrupt context.
pub trait CdcEvents {
    fn rx_event(&self, event: RxEvent) -> EventStatus;

    fn tx_event(&self, event: TxEvent) -> EventStatus;

    fn serial_event(&self, event: SerialEvent<'_>) -> EventStatus;
}

impl<H: CdcEvents + ?Sized> CdcEvents for &H {
    fn rx_event(&self, event: RxEvent) -> EventStatus {
        (**self).rx_event(event)
    }

    fn tx_event(&self, event: TxEvent) -> EventStatus {
        (**self).tx_event(event)
    }

    fn serial_event(&self, event: SerialEvent<'_>) -> EventStatus {
        (**self).serial_event(event)
    }
}
