//! One attached controller board.
//!
//! A [`Controller`] is shared (`Arc`) between the manager's service loop, the
//! verification task and the hardware layer. It owns the write half of the
//! transport, the inbox of decoded messages and the output lease table. The
//! read half lives in a [`ControllerReader`] that runs on the controller's own
//! task and pushes decoded messages into the inbox.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use kegtap_core::constants::{
    DEFAULT_CONTROLLER_NAME, MAX_OUTPUTS, OUTPUT_REFRESH_INTERVAL_MS, SERIAL_NUMBER_PREFIX,
};
use kegtap_core::{ControllerInfo, ControllerStatus, TransportKind};
use kegtap_protocol::{Message, WireCodec, WireFormat, decode_all};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{HardwareError, Result};
use crate::transport::{ReadOutcome, Transport, TransportReader, TransportWriter};

/// Derive the logical controller name from a serial number.
///
/// Uses the last `-`-separated segment, lower-cased. Serial numbers with
/// fewer than two segments, or whose tail is empty or not alphanumeric, fall
/// back to the default name.
///
/// # Examples
///
/// ```
/// use kegtap_hardware::controller::name_from_serial;
///
/// assert_eq!(name_from_serial("KB-0000-0000-1A2B3C4D"), "kegboard-1a2b3c4d");
/// assert_eq!(name_from_serial("garbage"), "kegboard");
/// ```
#[must_use]
pub fn name_from_serial(serial_number: &str) -> String {
    let mut segments = serial_number.rsplit('-');
    let tail = segments.next().unwrap_or_default();
    let has_prefix = segments.next().is_some();

    if has_prefix && !tail.is_empty() && tail.chars().all(|c| c.is_ascii_alphanumeric()) {
        format!("{DEFAULT_CONTROLLER_NAME}-{}", tail.to_ascii_lowercase())
    } else {
        DEFAULT_CONTROLLER_NAME.to_string()
    }
}

/// Generate a fresh serial number for a blank board.
#[must_use]
pub fn generate_serial_number() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
    format!("{SERIAL_NUMBER_PREFIX}{suffix}")
}

#[derive(Debug)]
struct Identity {
    name: String,
    serial_number: String,
    status: ControllerStatus,
    firmware_version: Option<u16>,
    protocol_version: Option<u16>,
}

#[derive(Debug, Default)]
struct Leases {
    expiry: HashMap<u8, Instant>,
    last_refresh: Option<Instant>,
}

#[derive(Debug, Default)]
struct Readings {
    meters: HashMap<String, u64>,
    thermo: HashMap<String, Option<f64>>,
}

struct WriteHalf {
    writer: TransportWriter,
    codec: WireCodec,
}

/// Shared controller state.
pub struct Controller {
    device_id: String,
    transport: TransportKind,
    identity: Mutex<Identity>,
    inbox: Mutex<VecDeque<Message>>,
    leases: Mutex<Leases>,
    readings: Mutex<Readings>,
    write_half: tokio::sync::Mutex<WriteHalf>,
    hello_seq: AtomicU64,
    hello: Notify,
    activity: Arc<Notify>,
    lease_duration: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Controller {
    /// Split a transport into a shared controller and its reader.
    ///
    /// `activity` is notified whenever the reader queues a message, waking
    /// the owning manager's service loop.
    pub fn new(
        transport: Transport,
        activity: Arc<Notify>,
        lease_duration: Duration,
        read_timeout: Duration,
    ) -> (Arc<Self>, ControllerReader) {
        let Transport {
            kind,
            device_id,
            format,
            reader,
            writer,
        } = transport;

        let controller = Arc::new(Self {
            device_id,
            transport: kind,
            identity: Mutex::new(Identity {
                name: DEFAULT_CONTROLLER_NAME.to_string(),
                serial_number: String::new(),
                status: ControllerStatus::Unknown,
                firmware_version: None,
                protocol_version: None,
            }),
            inbox: Mutex::new(VecDeque::new()),
            leases: Mutex::new(Leases::default()),
            readings: Mutex::new(Readings::default()),
            write_half: tokio::sync::Mutex::new(WriteHalf {
                writer,
                codec: WireCodec::new(format),
            }),
            hello_seq: AtomicU64::new(0),
            hello: Notify::new(),
            activity,
            lease_duration,
        });

        let reader = ControllerReader {
            controller: Arc::clone(&controller),
            reader,
            codec: WireCodec::new(format),
            buf: BytesMut::new(),
            read_timeout,
        };

        (controller, reader)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn name(&self) -> String {
        lock(&self.identity).name.clone()
    }

    pub fn serial_number(&self) -> String {
        lock(&self.identity).serial_number.clone()
    }

    pub fn status(&self) -> ControllerStatus {
        lock(&self.identity).status
    }

    pub fn set_status(&self, status: ControllerStatus) {
        let mut identity = lock(&self.identity);
        if identity.status != status {
            debug!(
                device = %self.device_id,
                name = %identity.name,
                from = %identity.status,
                to = %status,
                "Controller status changed"
            );
            identity.status = status;
        }
    }

    pub fn firmware_version(&self) -> Option<u16> {
        lock(&self.identity).firmware_version
    }

    pub fn info(&self) -> ControllerInfo {
        let identity = lock(&self.identity);
        ControllerInfo {
            name: identity.name.clone(),
            serial_number: identity.serial_number.clone(),
            status: identity.status,
            firmware_version: identity.firmware_version,
            transport: self.transport,
            device_id: self.device_id.clone(),
        }
    }

    /// Number of Hello messages seen so far.
    pub fn hello_count(&self) -> u64 {
        self.hello_seq.load(Ordering::SeqCst)
    }

    /// Wait until more than `seen` Hello messages have arrived.
    pub async fn wait_for_hello(&self, seen: u64) {
        loop {
            let notified = self.hello.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.hello_count() > seen {
                return;
            }
            notified.await;
        }
    }

    fn apply_hello(&self, firmware_version: u16, protocol_version: u16, serial_number: &str) {
        {
            let mut identity = lock(&self.identity);
            identity.firmware_version = Some(firmware_version);
            identity.protocol_version = Some(protocol_version);

            if identity.serial_number.is_empty() {
                if !serial_number.is_empty() {
                    identity.serial_number = serial_number.to_string();
                    identity.name = name_from_serial(serial_number);
                    info!(
                        device = %self.device_id,
                        serial_number,
                        name = %identity.name,
                        "Controller identified"
                    );
                }
            } else if identity.serial_number != serial_number {
                warn!(
                    device = %self.device_id,
                    known = %identity.serial_number,
                    reported = serial_number,
                    "Controller reported a different serial number; keeping the original"
                );
            }
        }
        self.hello_seq.fetch_add(1, Ordering::SeqCst);
        self.hello.notify_waiters();
    }

    /// Accept one decoded message from the reader.
    ///
    /// Hello messages update identity and wake verifiers; everything else is
    /// queued for the service loop.
    pub fn ingest(&self, message: Message) {
        match message {
            Message::Hello {
                firmware_version,
                protocol_version,
                serial_number,
            } => self.apply_hello(firmware_version, protocol_version, &serial_number),
            other => {
                lock(&self.inbox).push_back(other);
                self.activity.notify_one();
            }
        }
    }

    /// Next queued message, without waiting.
    pub fn read_message(&self) -> Option<Message> {
        lock(&self.inbox).pop_front()
    }

    /// All queued messages, without waiting.
    pub fn read_messages(&self) -> Vec<Message> {
        lock(&self.inbox).drain(..).collect()
    }

    /// Record the latest reading of a meter or temperature sensor message.
    pub fn record_reading(&self, message: &Message) {
        let mut readings = lock(&self.readings);
        match message {
            Message::MeterStatus { meter_name, ticks } => {
                readings.meters.insert(meter_name.clone(), u64::from(*ticks));
            }
            Message::TemperatureReading { sensor_name, .. } => {
                let value = message.celsius().filter(|c| plausible_temperature(*c));
                readings.thermo.insert(sensor_name.clone(), value);
            }
            _ => {}
        }
    }

    /// Latest cumulative tick count per meter port.
    pub fn meters(&self) -> HashMap<String, u64> {
        lock(&self.readings).meters.clone()
    }

    /// Latest temperature per sensor port; `None` marks an invalid reading.
    pub fn thermo_sensors(&self) -> HashMap<String, Option<f64>> {
        lock(&self.readings).thermo.clone()
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        let mut half = self.write_half.lock().await;
        let bytes = half.codec.encode_message(message)?;
        half.writer.write_all(bytes.to_vec()).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(Message::Ping).await
    }

    pub async fn set_serial_number(&self, serial_number: &str) -> Result<()> {
        self.send(Message::SetSerialNumber {
            serial_number: serial_number.to_string(),
        })
        .await
    }

    /// Enable or disable one output.
    ///
    /// Enabling records a lease that the service loop keeps re-asserting until
    /// it expires; calling again renews it. Disabling drops the lease and
    /// switches the output off immediately.
    pub async fn schedule_toggle_output(&self, output_id: u8, enable: bool) -> Result<()> {
        if output_id >= MAX_OUTPUTS {
            return Err(HardwareError::InvalidOutput {
                output_id,
                max: MAX_OUTPUTS,
            });
        }

        if enable {
            {
                let mut leases = lock(&self.leases);
                leases
                    .expiry
                    .insert(output_id, Instant::now() + self.lease_duration);
                leases.last_refresh = None;
            }
            self.activity.notify_one();
            Ok(())
        } else {
            lock(&self.leases).expiry.remove(&output_id);
            self.send(Message::SetOutput {
                output_id,
                enabled: false,
            })
            .await
        }
    }

    /// Outputs with an unexpired lease.
    pub fn active_outputs(&self) -> Vec<u8> {
        let now = Instant::now();
        let mut outputs: Vec<u8> = lock(&self.leases)
            .expiry
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(id, _)| *id)
            .collect();
        outputs.sort_unstable();
        outputs
    }

    /// Re-send `SetOutput` for every unexpired lease and prune expired ones.
    ///
    /// Rate-limited per controller; returns how many outputs were asserted.
    pub async fn refresh_outputs(&self) -> Result<usize> {
        let active = {
            let mut leases = lock(&self.leases);
            let now = Instant::now();
            if let Some(last) = leases.last_refresh
                && now.duration_since(last) < Duration::from_millis(OUTPUT_REFRESH_INTERVAL_MS)
            {
                return Ok(0);
            }
            leases.expiry.retain(|id, expiry| {
                let live = *expiry > now;
                if !live {
                    debug!(output_id = id, "Output lease expired");
                }
                live
            });
            if leases.expiry.is_empty() {
                return Ok(0);
            }
            leases.last_refresh = Some(now);
            let mut ids: Vec<u8> = leases.expiry.keys().copied().collect();
            ids.sort_unstable();
            ids
        };

        for &output_id in &active {
            self.send(Message::SetOutput {
                output_id,
                enabled: true,
            })
            .await?;
        }
        Ok(active.len())
    }

    /// Close the write half; a stream peer sees end-of-file.
    pub async fn close(&self) {
        self.write_half.lock().await.writer.close().await;
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("device_id", &self.device_id)
            .field("transport", &self.transport)
            .field("identity", &*lock(&self.identity))
            .finish_non_exhaustive()
    }
}

/// Readings outside this range come from disconnected or faulty probes.
pub(crate) fn plausible_temperature(celsius: f64) -> bool {
    celsius.is_finite() && (-60.0..=150.0).contains(&celsius)
}

/// How a reader's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// Cancelled by the manager.
    Cancelled,
    /// The peer closed the transport.
    Closed,
    /// A read failed; the controller is marked `OpenError`.
    Failed,
}

/// Read half of a controller, driven by its dedicated task.
pub struct ControllerReader {
    controller: Arc<Controller>,
    reader: TransportReader,
    codec: WireCodec,
    buf: BytesMut,
    read_timeout: Duration,
}

impl ControllerReader {
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Read once (bounded by the read timeout) and queue decoded messages.
    pub async fn blocking_read(&mut self) -> Result<ReadOutcome> {
        let outcome = self.reader.read(self.read_timeout).await?;
        if let ReadOutcome::Data(bytes) = &outcome {
            self.buf.extend_from_slice(bytes);
            let (messages, errors) = decode_all(&mut self.codec, &mut self.buf);
            for error in errors {
                debug!(device = %self.controller.device_id, error = %error, "Skipping undecodable message");
            }
            for message in messages {
                self.controller.ingest(message);
            }
        }
        Ok(outcome)
    }

    /// Read until cancelled, closed or failed.
    pub async fn run(mut self, cancel: tokio_util::sync::CancellationToken) -> ReaderExit {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ReaderExit::Cancelled,
                result = self.blocking_read() => match result {
                    Ok(ReadOutcome::Closed) => {
                        info!(device = %self.controller.device_id, "Transport closed");
                        return ReaderExit::Closed;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(device = %self.controller.device_id, error = %e, "Read failed");
                        self.controller.set_status(ControllerStatus::OpenError);
                        return ReaderExit::Failed;
                    }
                },
            }
        }
    }
}

/// Codec framing for a transport kind when not set explicitly.
pub fn default_format(kind: TransportKind) -> WireFormat {
    match kind {
        TransportKind::Serial | TransportKind::Fake => WireFormat::Binary,
        TransportKind::Network => WireFormat::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kegtap_protocol::KegboardCodec;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::{Decoder, Encoder};

    fn attach() -> (Arc<Controller>, ControllerReader, DuplexStream) {
        let (host, device) = tokio::io::duplex(1024);
        let transport = Transport::from_stream(TransportKind::Fake, "fake-0", WireFormat::Binary, host);
        let (controller, reader) = Controller::new(
            transport,
            Arc::new(Notify::new()),
            Duration::from_secs(5),
            Duration::from_millis(250),
        );
        (controller, reader, device)
    }

    async fn send_from_device(device: &mut DuplexStream, message: Message) {
        let mut buf = BytesMut::new();
        KegboardCodec::new().encode(message, &mut buf).unwrap();
        device.write_all(&buf).await.unwrap();
    }

    async fn recv_on_device(device: &mut DuplexStream) -> Vec<Message> {
        let mut raw = [0u8; 512];
        let n = device.read(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(&raw[..n]);
        let mut codec = KegboardCodec::new();
        let mut out = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            out.push(message);
        }
        out
    }

    #[rstest]
    #[case("KB-0000-0000-1A2B3C4D", "kegboard-1a2b3c4d")]
    #[case("KB-01", "kegboard-01")]
    #[case("noseparator", "kegboard")]
    #[case("KB-0000-", "kegboard")]
    #[case("KB-12 34", "kegboard")]
    #[case("", "kegboard")]
    fn test_name_from_serial(#[case] serial: &str, #[case] expected: &str) {
        assert_eq!(name_from_serial(serial), expected);
    }

    #[test]
    fn test_generated_serial_shape() {
        let serial = generate_serial_number();
        assert!(serial.starts_with("KB-0000-0000-"));
        let suffix = &serial["KB-0000-0000-".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(generate_serial_number(), serial);
    }

    #[tokio::test]
    async fn test_hello_sets_identity_once() {
        let (controller, _reader, _device) = attach();

        controller.ingest(Message::Hello {
            firmware_version: 18,
            protocol_version: 1,
            serial_number: "KB-0000-0000-AAAA0001".into(),
        });
        assert_eq!(controller.name(), "kegboard-aaaa0001");
        assert_eq!(controller.firmware_version(), Some(18));

        controller.ingest(Message::Hello {
            firmware_version: 19,
            protocol_version: 1,
            serial_number: "KB-0000-0000-BBBB0002".into(),
        });
        assert_eq!(controller.serial_number(), "KB-0000-0000-AAAA0001");
        assert_eq!(controller.name(), "kegboard-aaaa0001");
        assert_eq!(controller.firmware_version(), Some(19));
        assert_eq!(controller.hello_count(), 2);
        assert!(controller.read_message().is_none());
    }

    #[tokio::test]
    async fn test_reader_queues_messages() {
        let (controller, mut reader, mut device) = attach();
        send_from_device(
            &mut device,
            Message::MeterStatus {
                meter_name: "flow0".into(),
                ticks: 120,
            },
        )
        .await;

        assert!(matches!(reader.blocking_read().await.unwrap(), ReadOutcome::Data(_)));
        assert_eq!(
            controller.read_messages(),
            vec![Message::MeterStatus {
                meter_name: "flow0".into(),
                ticks: 120
            }]
        );
        assert!(controller.read_messages().is_empty());
    }

    #[tokio::test]
    async fn test_reader_exits_on_close() {
        let (controller, reader, device) = attach();
        drop(device);
        let exit = reader.run(tokio_util::sync::CancellationToken::new()).await;
        assert_eq!(exit, ReaderExit::Closed);
        assert_eq!(controller.status(), ControllerStatus::Unknown);
    }

    #[tokio::test]
    async fn test_invalid_output_rejected() {
        let (controller, _reader, _device) = attach();
        let err = controller.schedule_toggle_output(MAX_OUTPUTS, true).await.unwrap_err();
        assert!(matches!(err, HardwareError::InvalidOutput { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_refresh_and_expiry() {
        let (controller, _reader, mut device) = attach();

        controller.schedule_toggle_output(1, true).await.unwrap();
        assert_eq!(controller.active_outputs(), vec![1]);

        assert_eq!(controller.refresh_outputs().await.unwrap(), 1);
        assert_eq!(
            recv_on_device(&mut device).await,
            vec![Message::SetOutput {
                output_id: 1,
                enabled: true
            }]
        );

        // Rate limited inside the refresh interval.
        assert_eq!(controller.refresh_outputs().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(controller.active_outputs().is_empty());
        assert_eq!(controller.refresh_outputs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disable_sends_immediately() {
        let (controller, _reader, mut device) = attach();
        controller.schedule_toggle_output(0, true).await.unwrap();
        controller.schedule_toggle_output(0, false).await.unwrap();

        assert!(controller.active_outputs().is_empty());
        assert_eq!(
            recv_on_device(&mut device).await,
            vec![Message::SetOutput {
                output_id: 0,
                enabled: false
            }]
        );
    }

    #[tokio::test]
    async fn test_implausible_temperature_recorded_as_unknown() {
        let (controller, _reader, _device) = attach();
        controller.record_reading(&Message::TemperatureReading {
            sensor_name: "thermo-1".into(),
            micro_celsius: -127_000_000,
        });
        controller.record_reading(&Message::TemperatureReading {
            sensor_name: "thermo-2".into(),
            micro_celsius: 3_500_000,
        });

        let sensors = controller.thermo_sensors();
        assert_eq!(sensors["thermo-1"], None);
        assert_eq!(sensors["thermo-2"], Some(3.5));
    }
}
