use crate::event::{CdcEvents, SerialEvent};
use usb_device::class_prelude::*;
use usb_device::descriptor::lang_id::LangID;
use usb_device::device::DEFAULT_ALTERNATE_SETTING;
use usb_device::Result;

/// This should be used as `device_class` when building the `UsbDevice`.
pub const USB_CLASS_CDC: u8 = 0x02;

const USB_CLASS_CDC_DATA: u8 = 0x0a;
const CDC_SUBCLASS_ACM: u8 = 0x02;
const CDC_PROTOCOL_NONE: u8 = 0x00;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_CALL_MANAGEMENT: u8 = 0x01;
const CDC_TYPE_ACM: u8 = 0x02;
const CDC_TYPE_UNION: u8 = 0x06;

const REQ_SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
const REQ_SET_LINE_CODING: u8 = 0x20;
const REQ_GET_LINE_CODING: u8 = 0x21;
const REQ_SET_CONTROL_LINE_STATE: u8 = 0x22;
const REQ_SEND_BREAK: u8 = 0x23;

/// Size of the notification endpoint.
const COMM_PACKET_SIZE: u16 = 8;

/// Packet level implementation of a CDC-ACM serial port.
///
/// This class allocates the interfaces and endpoints and answers the class requests. It has no
/// buffering of its own: [`SerialPort`](crate::SerialPort) moves the packets in and out of the
/// driver's ring buffers. Line coding requests are answered by the [`CdcEvents`] handler passed
/// to the control methods.
pub struct CdcAcmClass<'a, B: UsbBus> {
    comm_if: InterfaceNumber,
    pub(crate) comm_if_name: StringIndex,
    comm_if_label: &'static str,
    comm_ep: EndpointIn<'a, B>,
    data_if: InterfaceNumber,
    read_ep: EndpointOut<'a, B>,
    write_ep: EndpointIn<'a, B>,
    dtr: bool,
    rts: bool,
}

impl<'a, B: UsbBus> CdcAcmClass<'a, B> {
    /// Creates a new CdcAcmClass with the provided UsbBus and max_packet_size in bytes. For
    /// full-speed devices, max_packet_size has to be one of 8, 16, 32 or 64. `comm_if_label`
    /// names the communication interface.
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        max_packet_size: u16,
        comm_if_label: &'static str,
    ) -> CdcAcmClass<'a, B> {
        CdcAcmClass {
            comm_if: alloc.interface(),
            comm_if_name: alloc.string(),
            comm_if_label,
            comm_ep: alloc.interrupt(COMM_PACKET_SIZE, 255),
            data_if: alloc.interface(),
            read_ep: alloc.bulk(max_packet_size),
            write_ep: alloc.bulk(max_packet_size),
            dtr: false,
            rts: false,
        }
    }

    /// Gets the maximum packet size in bytes.
    pub fn max_packet_size(&self) -> u16 {
        // The size is the same for both endpoints.
        self.read_ep.max_packet_size()
    }

    /// Gets the DTR (data terminal ready) state
    pub fn dtr(&self) -> bool {
        self.dtr
    }

    /// Gets the RTS (request to send) state
    pub fn rts(&self) -> bool {
        self.rts
    }

    /// Writes a single packet into the IN endpoint.
    pub fn write_packet(&self, data: &[u8]) -> Result<usize> {
        self.write_ep.write(data)
    }

    /// Reads a single packet from the OUT endpoint.
    pub fn read_packet(&self, data: &mut [u8]) -> Result<usize> {
        self.read_ep.read(data)
    }

    /// Gets the address of the IN endpoint.
    pub(crate) fn write_ep_address(&self) -> EndpointAddress {
        self.write_ep.address()
    }

    /// Gets the address of the OUT endpoint.
    pub(crate) fn read_ep_address(&self) -> EndpointAddress {
        self.read_ep.address()
    }

    pub(crate) fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> Result<()> {
        writer.iad(
            self.comm_if,
            2,
            USB_CLASS_CDC,
            CDC_SUBCLASS_ACM,
            CDC_PROTOCOL_NONE,
            None,
        )?;

        writer.interface_alt(
            self.comm_if,
            DEFAULT_ALTERNATE_SETTING,
            USB_CLASS_CDC,
            CDC_SUBCLASS_ACM,
            CDC_PROTOCOL_NONE,
            Some(self.comm_if_name),
        )?;

        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_HEADER, // bDescriptorSubtype
                0x10,
                0x01, // bcdCDC (1.10)
            ],
        )?;

        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_ACM, // bDescriptorSubtype
                0x02,         // bmCapabilities: line coding and serial state
            ],
        )?;

        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_UNION,      // bDescriptorSubtype
                self.comm_if.into(), // bControlInterface
                self.data_if.into(), // bSubordinateInterface
            ],
        )?;

        writer.write(
            CS_INTERFACE,
            &[
                CDC_TYPE_CALL_MANAGEMENT, // bDescriptorSubtype
                0x00,                     // bmCapabilities
                self.data_if.into(),      // bDataInterface
            ],
        )?;

        writer.endpoint(&self.comm_ep)?;

        writer.interface(self.data_if, USB_CLASS_CDC_DATA, 0x00, 0x00)?;

        writer.endpoint(&self.write_ep)?;
        writer.endpoint(&self.read_ep)?;

        Ok(())
    }

    pub(crate) fn get_string(&self, index: StringIndex, _lang_id: LangID) -> Option<&str> {
        if index == self.comm_if_name {
            Some(self.comm_if_label)
        } else {
            None
        }
    }

    pub(crate) fn reset(&mut self) {
        self.dtr = false;
        self.rts = false;
    }

    fn is_own_request(&self, req: &control::Request) -> bool {
        req.request_type == control::RequestType::Class
            && req.recipient == control::Recipient::Interface
            && req.index == u8::from(self.comm_if) as u16
    }

    pub(crate) fn control_in<H: CdcEvents>(&mut self, xfer: ControlIn<B>, events: &H) {
        let req = *xfer.request();

        if !self.is_own_request(&req) {
            return;
        }

        match req.request {
            // REQ_GET_ENCAPSULATED_COMMAND is not really supported - it will be rejected below.
            REQ_GET_LINE_CODING if req.length == 7 => {
                let mut coding = LineCoding::default();
                events.serial_event(SerialEvent::GetLineCoding(&mut coding));
                xfer.accept_with(&coding.to_bytes()).ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    pub(crate) fn control_out<H: CdcEvents>(&mut self, xfer: ControlOut<B>, events: &H) {
        let req = *xfer.request();

        if !self.is_own_request(&req) {
            return;
        }

        match req.request {
            REQ_SEND_ENCAPSULATED_COMMAND => {
                // We don't actually support encapsulated commands but pretend we do for standards
                // compatibility.
                xfer.accept().ok();
            }
            REQ_SET_LINE_CODING => match LineCoding::from_bytes(xfer.data()) {
                Some(coding) => {
                    events.serial_event(SerialEvent::SetLineCoding(&coding));
                    xfer.accept().ok();
                }
                None => {
                    xfer.reject().ok();
                }
            },
            REQ_SET_CONTROL_LINE_STATE => {
                self.dtr = (req.value & 0x0001) != 0;
                self.rts = (req.value & 0x0002) != 0;
                events.serial_event(SerialEvent::ControlLineState {
                    dtr: self.dtr,
                    rts: self.rts,
                });
                xfer.accept().ok();
            }
            REQ_SEND_BREAK => {
                let event = match req.value {
                    0 => SerialEvent::ClearBreak,
                    duration => SerialEvent::SendBreak(duration),
                };
                events.serial_event(event);
                xfer.accept().ok();
            }
            _ => {
                xfer.reject().ok();
            }
        };
    }
}

/// Number of stop bits for LineCoding
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    /// 1 stop bit
    One = 0,

    /// 1.5 stop bits
    OnePointFive = 1,

    /// 2 stop bits
    Two = 2,
}

impl From<u8> for StopBits {
    fn from(value: u8) -> Self {
        match value {
            1 => StopBits::OnePointFive,
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }
}

/// Parity for LineCoding
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParityType {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

impl From<u8> for ParityType {
    fn from(value: u8) -> Self {
        match value {
            1 => ParityType::Odd,
            2 => ParityType::Even,
            3 => ParityType::Mark,
            4 => ParityType::Space,
            _ => ParityType::None,
        }
    }
}

/// Line coding parameters
///
/// This is provided by the host for specifying the standard UART parameters such as baud rate.
/// Can be ignored if you don't plan to interface with a physical UART.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineCoding {
    pub stop_bits: StopBits,
    pub data_bits: u8,
    pub parity_type: ParityType,
    pub data_rate: u32,
}

impl LineCoding {
    /// Size of the GET_LINE_CODING / SET_LINE_CODING payload.
    pub const SIZE: usize = 7;

    /// 115200 baud, 8 data bits, no parity, 1 stop bit.
    pub const fn new() -> Self {
        LineCoding {
            stop_bits: StopBits::One,
            data_bits: 8,
            parity_type: ParityType::None,
            data_rate: 115_200,
        }
    }

    /// Encodes the coding as the control transfer payload.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let rate = self.data_rate.to_le_bytes();
        [
            rate[0],
            rate[1],
            rate[2],
            rate[3],
            self.stop_bits as u8,
            self.parity_type as u8,
            self.data_bits,
        ]
    }

    /// Decodes a control transfer payload. Returns `None` if it is too short.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        match data {
            [r0, r1, r2, r3, stop_bits, parity_type, data_bits, ..] => Some(LineCoding {
                data_rate: u32::from_le_bytes([*r0, *r1, *r2, *r3]),
                stop_bits: (*stop_bits).into(),
                parity_type: (*parity_type).into(),
                data_bits: *data_bits,
            }),
            _ => None,
        }
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self::new()
    }
}
