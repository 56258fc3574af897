use crate::buffer::{DefaultBufferStore, SharedBuffer};
use crate::cdc_acm::CdcAcmClass;
use crate::event::{CdcEvents, RxEvent, SerialEvent, TxEvent};
use core::borrow::BorrowMut;
use core::mem;
use usb_device::class_prelude::*;
use usb_device::descriptor::lang_id::LangID;
use usb_device::device::{UsbDevice, UsbDeviceState};
use usb_device::Result;

/// Packet size of the bulk endpoints.
const MAX_PACKET_SIZE: u16 = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WriteState {
    /// Not currently writing anything.
    Idle = 0,

    /// Writing a short packet.
    WriteShort = 1,

    /// Writing a full packet that needs to be followed by a short packet.
    WriteFull = 2,
}

/// USB serial port (CDC-ACM) class that moves packets between the endpoints and the driver's
/// shared buffers.
///
/// Received packets go into `read_buf` and are announced with [`RxEvent::Available`]. Data the
/// driver puts into `write_buf` goes out one packet at a time; each acknowledged packet is
/// announced with [`TxEvent::Complete`]. Configuration changes are reported as
/// [`SerialEvent::Connected`] and [`SerialEvent::Disconnected`].
///
/// An OUT packet is only taken off the endpoint once a whole packet fits into `read_buf`. Until
/// then, the endpoint NAKs and the host retries. Neither a task-side read that makes room nor a
/// task-side write to an idle endpoint raises a USB interrupt; the driver's wake hook
/// ([`Config::wake_stack`](crate::Config::wake_stack)) has to pend one so that
/// [`service`](Self::service) runs again.
pub struct SerialPort<'a, B, H, RS = DefaultBufferStore, WS = DefaultBufferStore>
where
    B: UsbBus,
    RS: BorrowMut<[u8]>,
    WS: BorrowMut<[u8]>,
{
    inner: CdcAcmClass<'a, B>,
    events: &'a H,
    read_buf: &'a SharedBuffer<RS>,
    write_buf: &'a SharedBuffer<WS>,
    write_state: WriteState,
    /// Size of the data packet the host hasn't acknowledged yet.
    in_flight: usize,
    configured: bool,
    suspended: bool,
}

impl<'a, B, H, RS, WS> SerialPort<'a, B, H, RS, WS>
where
    B: UsbBus,
    H: CdcEvents,
    RS: BorrowMut<[u8]>,
    WS: BorrowMut<[u8]>,
{
    /// Creates a new USB serial port with the provided UsbBus. `comm_if_label` names the
    /// communication interface.
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        comm_if_label: &'static str,
        events: &'a H,
        read_buf: &'a SharedBuffer<RS>,
        write_buf: &'a SharedBuffer<WS>,
    ) -> SerialPort<'a, B, H, RS, WS> {
        SerialPort {
            inner: CdcAcmClass::new(alloc, MAX_PACKET_SIZE, comm_if_label),
            events,
            read_buf,
            write_buf,
            write_state: WriteState::Idle,
            in_flight: 0,
            configured: false,
            suspended: false,
        }
    }

    /// Gets the DTR (data terminal ready) state
    pub fn dtr(&self) -> bool {
        self.inner.dtr()
    }

    /// Gets the RTS (request to send) state
    pub fn rts(&self) -> bool {
        self.inner.rts()
    }

    /// Whether the host has configured the device, as of the last [`service`](Self::service).
    pub fn configured(&self) -> bool {
        self.configured
    }

    /// The body of the USB interrupt handler.
    ///
    /// Polls `device`, reports configuration and suspend changes, and moves pending packets.
    /// Returns the result of `UsbDevice::poll`.
    pub fn service(&mut self, device: &mut UsbDevice<'a, B>) -> bool {
        let activity = device.poll(&mut [&mut *self]);

        self.track(device.state());
        self.transfer();

        activity
    }

    /// Takes every OUT packet that fits into the read buffer and starts the next IN packet.
    ///
    /// [`service`](Self::service) ends with this. Does nothing unless configured and awake.
    pub fn transfer(&mut self) {
        if !self.configured || self.suspended {
            return;
        }

        while self.pull() > 0 {}
        self.flush();
    }

    fn track(&mut self, state: UsbDeviceState) {
        let suspended = state == UsbDeviceState::Suspend;
        if suspended != self.suspended {
            self.suspended = suspended;
            self.events.serial_event(if suspended {
                SerialEvent::Suspend
            } else {
                SerialEvent::Resume
            });
        }

        // A suspended device keeps its configuration.
        if suspended {
            return;
        }

        let configured = state == UsbDeviceState::Configured;
        if configured != self.configured {
            self.configured = configured;
            self.events.serial_event(if configured {
                SerialEvent::Connected
            } else {
                SerialEvent::Disconnected
            });
        }
    }

    /// Moves one packet from the OUT endpoint into the read buffer, if it fits. Returns its size.
    fn pull(&mut self) -> usize {
        let inner = &self.inner;

        let result = self
            .read_buf
            .fill(usize::from(inner.max_packet_size()), |buf_data| {
                match inner.read_packet(buf_data) {
                    Ok(count) => Ok(count),
                    Err(UsbError::WouldBlock) => Ok(0),
                    Err(err) => Err(err),
                }
            });

        match result {
            Ok(0) => 0,
            Ok(count) => {
                self.events.rx_event(RxEvent::Available(count));
                count
            }
            Err(_err) => {
                warn!("dropped OUT packet: {}", _err);
                0
            }
        }
    }

    /// Starts the next IN packet unless one is still in flight.
    fn flush(&mut self) {
        if self.write_state != WriteState::Idle || self.write_buf.is_empty() {
            return;
        }

        let inner = &self.inner;
        let write_state = &mut self.write_state;
        let in_flight = &mut self.in_flight;
        let max_packet_size = usize::from(inner.max_packet_size());

        let result = self.write_buf.drain(max_packet_size, |buf_data| {
            match inner.write_packet(buf_data) {
                Ok(count) => {
                    *write_state = if count == max_packet_size {
                        WriteState::WriteFull
                    } else {
                        WriteState::WriteShort
                    };
                    *in_flight = count;

                    Ok(count)
                }
                Err(UsbError::WouldBlock) => Ok(0),
                Err(err) => Err(err),
            }
        });

        if let Err(_err) = result {
            warn!("dropped IN packet: {}", _err);
        }
    }
}

impl<'a, B, H, RS, WS> UsbClass<B> for SerialPort<'a, B, H, RS, WS>
where
    B: UsbBus,
    H: CdcEvents,
    RS: BorrowMut<[u8]>,
    WS: BorrowMut<[u8]>,
{
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        self.inner.get_configuration_descriptors(writer)
    }

    fn get_string(&self, index: StringIndex, lang_id: LangID) -> Option<&str> {
        self.inner.get_string(index, lang_id)
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.write_state = WriteState::Idle;
        self.in_flight = 0;
        self.suspended = false;

        if self.configured {
            self.configured = false;
            self.events.serial_event(SerialEvent::Disconnected);
        }
    }

    fn poll(&mut self) {
        self.flush();
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.inner.read_ep_address() {
            self.pull();
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr != self.inner.write_ep_address() {
            return;
        }

        match self.write_state {
            // A full packet ending the transfer needs a zero length packet behind it.
            WriteState::WriteFull if self.write_buf.is_empty() => {
                self.write_state = WriteState::WriteShort;
                self.inner.write_packet(&[]).ok();
            }
            WriteState::WriteFull | WriteState::WriteShort => {
                self.write_state = WriteState::Idle;
            }
            WriteState::Idle => {}
        }

        let sent = mem::take(&mut self.in_flight);
        if sent > 0 {
            self.events.tx_event(TxEvent::Complete(sent));
        }

        self.flush();
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        self.inner.control_in(xfer, self.events);
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        self.inner.control_out(xfer, self.events);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::buffer::UsbBuffer;
    use crate::descriptor::{USB_PID_SERIAL, USB_VID_TI};
    use crate::driver::{CdcDriver, Config};
    use crate::event::EventStatus;
    use crate::hosted::{HostKernel, HostSignal, DEFAULT_TICK};
    use crate::kernel::{Signal, Timeout};
    use crate::stack::UsbdStack;
    use std::collections::VecDeque;
    use std::format;
    use std::string::String;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};
    use std::vec::Vec;
    use usb_device::bus::PollResult;
    use usb_device::device::{UsbDeviceBuilder, UsbVidPid};
    use usb_device::endpoint::EndpointType;
    use usb_device::UsbDirection;

    type Buf = SharedBuffer<[u8; 128]>;

    #[derive(Default)]
    struct Wire {
        /// Packets the host sent, oldest first.
        out: VecDeque<Vec<u8>>,
        /// Packets the device wrote, with their endpoint.
        sent: Vec<(EndpointAddress, Vec<u8>)>,
        busy: bool,
    }

    /// Bus that queues OUT packets and records IN packets.
    #[derive(Default)]
    struct MockBus {
        next_index: usize,
        wire: Arc<Mutex<Wire>>,
    }

    impl UsbBus for MockBus {
        fn alloc_ep(
            &mut self,
            ep_dir: UsbDirection,
            ep_addr: Option<EndpointAddress>,
            _ep_type: EndpointType,
            _max_packet_size: u16,
            _interval: u8,
        ) -> Result<EndpointAddress> {
            Ok(ep_addr.unwrap_or_else(|| {
                self.next_index += 1;
                EndpointAddress::from_parts(self.next_index, ep_dir)
            }))
        }

        fn enable(&mut self) {}

        fn reset(&self) {}

        fn set_device_address(&self, _addr: u8) {}

        fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> Result<usize> {
            let mut wire = self.wire.lock().unwrap();
            if wire.busy {
                return Err(UsbError::WouldBlock);
            }
            wire.sent.push((ep_addr, buf.to_vec()));
            Ok(buf.len())
        }

        fn read(&self, _ep_addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
            let mut wire = self.wire.lock().unwrap();
            let packet = wire.out.pop_front().ok_or(UsbError::WouldBlock)?;
            if packet.len() > buf.len() {
                return Err(UsbError::BufferOverflow);
            }
            buf[..packet.len()].copy_from_slice(&packet);
            Ok(packet.len())
        }

        fn set_stalled(&self, _ep_addr: EndpointAddress, _stalled: bool) {}

        fn is_stalled(&self, _ep_addr: EndpointAddress) -> bool {
            false
        }

        fn suspend(&self) {}

        fn resume(&self) {}

        fn poll(&self) -> PollResult {
            PollResult::None
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn take(&self) -> Vec<String> {
            mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl CdcEvents for Recorder {
        fn rx_event(&self, event: RxEvent) -> EventStatus {
            self.0.lock().unwrap().push(format!("{:?}", event));
            0
        }

        fn tx_event(&self, event: TxEvent) -> EventStatus {
            self.0.lock().unwrap().push(format!("{:?}", event));
            0
        }

        fn serial_event(&self, event: SerialEvent<'_>) -> EventStatus {
            self.0.lock().unwrap().push(format!("{:?}", event));
            0
        }
    }

    /// Creates the class and freezes the allocator, which endpoint access needs.
    fn open<'a, H: CdcEvents>(
        alloc: &'a UsbBusAllocator<MockBus>,
        events: &'a H,
        read_buf: &'a Buf,
        write_buf: &'a Buf,
    ) -> SerialPort<'a, MockBus, H, [u8; 128], [u8; 128]> {
        let port = SerialPort::new(alloc, "ACM Control Interface", events, read_buf, write_buf);
        let _ = UsbDeviceBuilder::new(alloc, UsbVidPid(USB_VID_TI, USB_PID_SERIAL)).build();
        port
    }

    struct Fixture {
        alloc: UsbBusAllocator<MockBus>,
        wire: Arc<Mutex<Wire>>,
        events: Recorder,
        read_buf: Buf,
        write_buf: Buf,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = MockBus::default();
            let wire = bus.wire.clone();
            Self {
                alloc: UsbBusAllocator::new(bus),
                wire,
                events: Recorder::default(),
                read_buf: Buf::with_store([0; 128]),
                write_buf: Buf::with_store([0; 128]),
            }
        }

        fn port(&self) -> SerialPort<'_, MockBus, Recorder, [u8; 128], [u8; 128]> {
            open(&self.alloc, &self.events, &self.read_buf, &self.write_buf)
        }

        fn host_sends(&self, packet: &[u8]) {
            self.wire.lock().unwrap().out.push_back(packet.to_vec());
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            mem::take(&mut self.wire.lock().unwrap().sent)
                .into_iter()
                .map(|(_, packet)| packet)
                .collect()
        }
    }

    #[test]
    fn out_packet_lands_in_read_buffer() {
        let fixture = Fixture::new();
        let mut port = fixture.port();
        let addr = port.inner.read_ep_address();

        fixture.host_sends(b"hello");
        port.endpoint_out(addr);

        assert_eq!(fixture.events.take(), ["Available(5)"]);
        let mut data = [0; 8];
        assert_eq!(fixture.read_buf.read(&mut data), 5);
        assert_eq!(&data[..5], b"hello");

        // Nothing queued: no event.
        port.endpoint_out(addr);
        assert!(fixture.events.take().is_empty());
    }

    #[test]
    fn out_packet_waits_for_room() {
        let fixture = Fixture::new();
        let mut port = fixture.port();
        let addr = port.inner.read_ep_address();

        assert_eq!(fixture.read_buf.write(&[0; 100]), 100);
        fixture.host_sends(b"later");
        port.endpoint_out(addr);

        assert!(fixture.events.take().is_empty());
        assert_eq!(fixture.wire.lock().unwrap().out.len(), 1);

        let mut data = [0; 100];
        assert_eq!(fixture.read_buf.read(&mut data), 100);
        port.endpoint_out(addr);
        assert_eq!(fixture.events.take(), ["Available(5)"]);
    }

    #[test]
    fn short_write() {
        let fixture = Fixture::new();
        let mut port = fixture.port();
        let addr = port.inner.write_ep_address();

        assert_eq!(fixture.write_buf.write(b"hi"), 2);
        port.poll();
        assert_eq!(fixture.sent(), [b"hi".to_vec()]);
        assert_eq!(port.write_state, WriteState::WriteShort);

        // Busy until acknowledged.
        assert_eq!(fixture.write_buf.write(b"!"), 1);
        port.poll();
        assert!(fixture.sent().is_empty());

        port.endpoint_in_complete(addr);
        assert_eq!(fixture.events.take(), ["Complete(2)"]);
        assert_eq!(fixture.sent(), [b"!".to_vec()]);

        port.endpoint_in_complete(addr);
        assert_eq!(fixture.events.take(), ["Complete(1)"]);
        assert_eq!(port.write_state, WriteState::Idle);
    }

    #[test]
    fn full_packet_gets_zero_length_packet() {
        let fixture = Fixture::new();
        let mut port = fixture.port();
        let addr = port.inner.write_ep_address();

        assert_eq!(fixture.write_buf.write(&[7; 64]), 64);
        port.poll();
        assert_eq!(port.write_state, WriteState::WriteFull);

        port.endpoint_in_complete(addr);
        assert_eq!(fixture.events.take(), ["Complete(64)"]);
        assert_eq!(fixture.sent(), [[7; 64].to_vec(), Vec::new()]);
        assert_eq!(port.write_state, WriteState::WriteShort);

        // The zero length packet completes silently.
        port.endpoint_in_complete(addr);
        assert!(fixture.events.take().is_empty());
        assert_eq!(port.write_state, WriteState::Idle);
    }

    #[test]
    fn full_packet_followed_by_data() {
        let fixture = Fixture::new();
        let mut port = fixture.port();
        let addr = port.inner.write_ep_address();

        assert_eq!(fixture.write_buf.write(&[1; 70]), 70);
        port.poll();
        port.endpoint_in_complete(addr);

        assert_eq!(fixture.events.take(), ["Complete(64)"]);
        assert_eq!(fixture.sent(), [[1; 64].to_vec(), [1; 6].to_vec()]);
        assert_eq!(port.write_state, WriteState::WriteShort);

        port.endpoint_in_complete(addr);
        assert_eq!(fixture.events.take(), ["Complete(6)"]);
    }

    #[test]
    fn busy_endpoint_keeps_data() {
        let fixture = Fixture::new();
        let mut port = fixture.port();

        fixture.wire.lock().unwrap().busy = true;
        assert_eq!(fixture.write_buf.write(b"wait"), 4);
        port.poll();

        assert!(fixture.sent().is_empty());
        assert_eq!(fixture.write_buf.len(), 4);
        assert_eq!(port.write_state, WriteState::Idle);

        fixture.wire.lock().unwrap().busy = false;
        port.poll();
        assert_eq!(fixture.sent(), [b"wait".to_vec()]);
        assert!(fixture.write_buf.is_empty());
    }

    #[test]
    fn state_edges() {
        let fixture = Fixture::new();
        let mut port = fixture.port();

        port.track(UsbDeviceState::Default);
        port.track(UsbDeviceState::Addressed);
        assert!(fixture.events.take().is_empty());

        port.track(UsbDeviceState::Configured);
        port.track(UsbDeviceState::Configured);
        assert!(port.configured());
        assert_eq!(fixture.events.take(), ["Connected"]);

        port.track(UsbDeviceState::Suspend);
        port.track(UsbDeviceState::Configured);
        assert_eq!(fixture.events.take(), ["Suspend", "Resume"]);

        port.track(UsbDeviceState::Default);
        assert_eq!(fixture.events.take(), ["Disconnected"]);
    }

    #[test]
    fn bus_reset_disconnects() {
        let fixture = Fixture::new();
        let mut port = fixture.port();

        port.reset();
        assert!(fixture.events.take().is_empty());

        port.track(UsbDeviceState::Configured);
        assert_eq!(fixture.write_buf.write(&[0; 64]), 64);
        port.poll();
        fixture.events.take();

        port.reset();
        assert_eq!(fixture.events.take(), ["Disconnected"]);
        assert!(!port.configured());
        assert_eq!(port.write_state, WriteState::Idle);
    }

    #[test]
    fn interface_string() {
        let fixture = Fixture::new();
        let port = fixture.port();

        assert_eq!(
            port.get_string(port.inner.comm_if_name, LangID::EN_US),
            Some("ACM Control Interface")
        );
    }

    /// A driver whose wake hook is `wake`, on a pair of 128 byte buffers.
    fn driver<'a>(wake: fn(), rx: &'a Buf, tx: &'a Buf) -> CdcDriver<HostKernel, &'a Buf, &'a Buf> {
        let config = Config::new().wake_stack(wake);
        CdcDriver::init(config, &HostKernel::default(), &mut UsbdStack::new(), rx, tx)
    }

    #[test]
    fn transfer_needs_configuration() {
        let fixture = Fixture::new();
        let mut port = fixture.port();

        fixture.host_sends(b"early");
        assert_eq!(fixture.write_buf.write(b"early"), 5);
        port.transfer();
        assert!(fixture.sent().is_empty());
        assert!(fixture.events.take().is_empty());

        port.track(UsbDeviceState::Configured);
        fixture.events.take();
        port.transfer();
        assert_eq!(fixture.sent(), [b"early".to_vec()]);
        assert_eq!(fixture.events.take(), ["Available(5)"]);
    }

    #[test]
    fn task_write_starts_idle_endpoint() {
        static USB_IRQ: HostSignal = HostSignal::new(DEFAULT_TICK);
        fn pend_usb_irq() {
            USB_IRQ.post();
        }

        let bus = MockBus::default();
        let wire = bus.wire.clone();
        let alloc = UsbBusAllocator::new(bus);
        let (read_buf, write_buf) = (Buf::with_store([0; 128]), Buf::with_store([0; 128]));
        let driver = driver(pend_usb_irq, &read_buf, &write_buf);
        let mut port = open(&alloc, &driver, &read_buf, &write_buf);
        let write_addr = port.inner.write_ep_address();

        port.track(UsbDeviceState::Configured);
        assert!(driver.is_connected());

        let done = AtomicBool::new(false);
        thread::scope(|s| {
            let task = s.spawn(|| {
                let start = Instant::now();
                let sent = driver.send_data(b"hi", Timeout::ticks(1000));
                done.store(true, Ordering::SeqCst);
                (sent, start.elapsed())
            });

            // The USB interrupt handler only runs when something pended it.
            let mut acked = 0;
            while !done.load(Ordering::SeqCst) {
                if !USB_IRQ.pend(Timeout::ticks(10)) {
                    continue;
                }
                port.transfer();

                // The host takes every packet right away.
                let sent = wire.lock().unwrap().sent.len();
                if sent > acked {
                    acked = sent;
                    port.endpoint_in_complete(write_addr);
                }
            }

            let (sent, elapsed) = task.join().unwrap();
            assert_eq!(sent, 2);
            assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
        });

        let packets: Vec<Vec<u8>> = mem::take(&mut wire.lock().unwrap().sent)
            .into_iter()
            .map(|(_, packet)| packet)
            .collect();
        assert_eq!(packets, [b"hi".to_vec()]);
        assert!(write_buf.is_empty());
    }

    #[test]
    fn task_read_frees_waiting_packet() {
        static USB_IRQ: HostSignal = HostSignal::new(DEFAULT_TICK);
        fn pend_usb_irq() {
            USB_IRQ.post();
        }

        let bus = MockBus::default();
        let wire = bus.wire.clone();
        let alloc = UsbBusAllocator::new(bus);
        let (read_buf, write_buf) = (Buf::with_store([0; 128]), Buf::with_store([0; 128]));
        let driver = driver(pend_usb_irq, &read_buf, &write_buf);
        let mut port = open(&alloc, &driver, &read_buf, &write_buf);
        let read_addr = port.inner.read_ep_address();

        port.track(UsbDeviceState::Configured);
        let mut buf = [0; 128];
        assert_eq!(driver.receive_data(&mut buf, Timeout::NoWait), 0);

        // Two packets fill the buffer; the third has to stay on the endpoint.
        wire.lock()
            .unwrap()
            .out
            .extend([[1; 64].to_vec(), [2; 64].to_vec(), b"tail".to_vec()]);
        for _ in 0..3 {
            port.endpoint_out(read_addr);
        }
        assert_eq!(wire.lock().unwrap().out.len(), 1);
        assert_eq!(USB_IRQ.pending(), 0);

        assert_eq!(driver.receive_data(&mut buf, Timeout::NoWait), 128);
        assert_eq!(&buf[..64], &[1u8; 64]);

        // The read pended the interrupt, whose handler picks up the packet.
        assert!(USB_IRQ.pend(Timeout::NoWait));
        port.transfer();
        assert!(wire.lock().unwrap().out.is_empty());

        assert_eq!(driver.receive_data(&mut buf, Timeout::ticks(100)), 4);
        assert_eq!(&buf[..4], b"tail");
    }
}
