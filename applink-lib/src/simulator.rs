//! Live link simulation.
//!
//! A modem endpoint drives a scripted sequence of steps against an appliance
//! task spawned on the runtime. The two sides exchange encoded frames over
//! channels and append every transmission to one shared [`CommunicationLog`].
//! A reply that does not arrive within the acknowledgment timeout is logged
//! as a missed acknowledgment and the script moves on; nothing is retried.

use crate::auth::Challenge;
use crate::capture::{Capture, CaptureRecord, Device, render_line};
use crate::constants::*;
use crate::error::LinkError;
use crate::frame::{CodecConfig, Frame, FrameCodec, FrameType};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 32;

const POWER_UP_PAYLOAD: &[u8] = &[0x0F, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

const FIRMWARE_INFO_PAYLOAD: &[u8] = &[
    0x45, 0x2B, 0x2B, 0x32, 0x2E, 0x31, 0x37, 0x00, // version
    0x32, 0x30, 0x32, 0x34, 0x31, 0x32, 0x32, 0x34, // build date
    0xF1, 0x00, 0x00, 0x30, 0x30, 0x30, 0x30, 0x30, 0x30, 0x30, 0x31, 0x00, //
    0x55, 0x2D, 0x57, 0x4D, 0x54, 0x00, 0x00, 0x00, 0x00,
];

const STATUS_REPORT_PAYLOAD: &[u8] = &[
    0x01, 0x30, 0x10, 0x03, 0x00, 0x00, 0x00, 0x20, 0x04, 0x03, 0x05, 0x01, //
    0x00, 0x01, 0x02, 0x30, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x0F, 0x08, 0x14, //
    0x05, 0x05, 0x06, 0x05, 0x04, 0x1A, 0x04, 0x1A, 0x04, 0x1A, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
];

const NETWORK_QUERY_PAYLOAD: &[u8] = &[
    0x01, 0x03, 0x01, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, //
    0x02, 0x06, 0x01, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x04, 0x00, 0x01,
];

const NETWORK_STATUS_PAYLOAD: &[u8] = &[0x00, 0x00, 0x3D, 0xD0, 0xE1];

const ACK_PAYLOAD: &[u8] = &[0x61, 0x80];

/// Alarm record of a high-temperature event; bytes 4..12 are the rolling challenge
const ALARM_RECORD: [u8; 32] = [
    0x10, 0x02, 0x00, 0x01, 0xD9, 0x93, 0xE4, 0xC8, 0xD3, 0x74, 0x95, 0x1C, //
    0x01, 0xA3, 0xEF, 0x0F, 0x08, 0xCD, 0xB4, 0x54, 0xFE, 0x10, 0xFC, 0xCF, //
    0x0A, 0x5E, 0x52, 0xA0, 0xD0, 0x1C, 0xF4, 0x35,
];

/// Challenge carried by the standard alarm exchange
pub const ALARM_CHALLENGE: Challenge = Challenge([0xD9, 0x93, 0xE4, 0xC8, 0xD3, 0x74, 0x95, 0x1C]);

/// Appliance setting changed by a control step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Power,
    Temperature,
    Mode,
}

impl ControlCommand {
    fn code(self) -> u8 {
        match self {
            ControlCommand::Power => 0x01,
            ControlCommand::Temperature => 0x02,
            ControlCommand::Mode => 0x03,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ControlCommand::Power),
            0x02 => Some(ControlCommand::Temperature),
            0x03 => Some(ControlCommand::Mode),
            _ => None,
        }
    }
}

/// One scripted step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Both sides restart; the modem announces itself and the appliance acknowledges
    PowerUp,
    Control { command: ControlCommand, value: u8 },
    /// The appliance reports its status and the modem acknowledges
    StatusReport,
    NetworkQuery,
    /// The appliance issues `challenge`; the modem answers with `response`
    Authenticate { challenge: Challenge, response: Bytes },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::PowerUp => "power-up",
            Step::Control { .. } => "control",
            Step::StatusReport => "status report",
            Step::NetworkQuery => "network query",
            Step::Authenticate { .. } => "authenticate",
        }
    }
}

/// Alarm exchange: the appliance challenges with [`ALARM_CHALLENGE`] and the
/// modem answers with the alarm record minus its `10 02 00 01` prefix.
pub fn alarm_step() -> Step {
    Step::Authenticate {
        challenge: ALARM_CHALLENGE,
        response: Bytes::copy_from_slice(&ALARM_RECORD[ALARM_RECORD.len() - AUTH_PAYLOAD_SIZE..]),
    }
}

/// The full power-up, control, status, network and alarm sequence
pub fn standard_script() -> Vec<Step> {
    vec![
        Step::PowerUp,
        Step::Control {
            command: ControlCommand::Power,
            value: 1,
        },
        Step::Control {
            command: ControlCommand::Temperature,
            value: 22,
        },
        Step::Control {
            command: ControlCommand::Mode,
            value: 2,
        },
        Step::StatusReport,
        Step::NetworkQuery,
        alarm_step(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Power-cycle marker
    Marker,
    Frame { wire: Bytes, description: String },
    /// Nothing arrived within the acknowledgment timeout
    MissedAck { awaiting: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Unix timestamp, seconds
    pub timestamp: u64,
    /// Time since the simulation started
    pub elapsed: Duration,
    pub device: Device,
    pub event: LinkEvent,
}

/// Ordered record of everything that crossed the simulated link.
///
/// Entries are stamped while the log is locked, so log order and timestamp
/// order agree.
#[derive(Debug, Clone)]
pub struct CommunicationLog {
    epoch: u64,
    started: Instant,
    entries: Vec<LogEntry>,
}

impl CommunicationLog {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, device: Device, event: LinkEvent) {
        let elapsed = self.started.elapsed();
        self.entries.push(LogEntry {
            timestamp: self.epoch + elapsed.as_secs(),
            elapsed,
            device,
            event,
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn missed_acks(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.event, LinkEvent::MissedAck { .. }))
            .count()
    }

    /// Transmissions as capture records, numbered from 1
    pub fn records(&self) -> Vec<CaptureRecord> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let bytes = match &entry.event {
                    LinkEvent::Marker => Bytes::from_static(POWER_CYCLE_MARKER),
                    LinkEvent::Frame { wire, .. } => wire.clone(),
                    LinkEvent::MissedAck { .. } => return None,
                };
                Some((entry.device, entry.timestamp, bytes))
            })
            .enumerate()
            .map(|(idx, (device, timestamp, bytes))| CaptureRecord {
                line: idx + 1,
                device,
                timestamp,
                bytes,
            })
            .collect()
    }

    pub fn to_capture(&self) -> Capture {
        let mut capture = Capture::new();
        for record in self.records() {
            capture.push(record);
        }
        capture
    }

    /// Transmissions in capture line format, one per line
    pub fn render(&self) -> String {
        self.records()
            .iter()
            .map(|r| render_line(r.device, r.timestamp, &r.bytes))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Settings the appliance holds after a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplianceStatus {
    pub power: bool,
    pub temperature: u8,
    pub mode: u8,
}

impl ApplianceStatus {
    fn apply(&mut self, command: ControlCommand, value: u8) {
        match command {
            ControlCommand::Power => self.power = value == 1,
            ControlCommand::Temperature => self.temperature = value,
            ControlCommand::Mode => self.mode = value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// How long a sender waits for the reply to a frame
    pub ack_timeout: Duration,
    /// Delay before the appliance answers a request
    pub appliance_latency: Duration,
    /// Unix time of the first log entry; the wall clock when unset
    pub epoch: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            appliance_latency: Duration::ZERO,
            epoch: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub log: CommunicationLog,
    pub appliance: ApplianceStatus,
    /// Steps skipped because the link was not powered up
    pub skipped_steps: usize,
}

/// A frame in flight. `reply_to` names the peer transmission it answers.
#[derive(Debug, Clone)]
struct Transmission {
    seq: u64,
    reply_to: Option<u64>,
    wire: Bytes,
}

/// Requests from the modem for steps the appliance starts
#[derive(Debug, Clone, Copy)]
enum ApplianceRequest {
    Report,
    Challenge(Challenge),
}

/// One side of the link
struct Endpoint {
    device: Device,
    codec: FrameCodec,
    tx: mpsc::Sender<Transmission>,
    rx: mpsc::Receiver<Transmission>,
    log: Arc<Mutex<CommunicationLog>>,
    ack_timeout: Duration,
    next_seq: u64,
}

impl Endpoint {
    fn frame(&self, frame_type: FrameType, payload: &'static [u8]) -> Frame {
        let config = self.codec.config();
        Frame::new(config.source, config.destination, frame_type, Bytes::from_static(payload))
    }

    async fn send(&mut self, frame: &Frame, reply_to: Option<u64>, description: &str) -> Result<u64, LinkError> {
        let wire = self.codec.encode_frame(frame)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        {
            let mut log = self.log.lock().await;
            log.append(
                self.device,
                LinkEvent::Frame {
                    wire: wire.clone(),
                    description: description.to_string(),
                },
            );
        }
        debug!(device = %self.device, seq, "{}: {}", description, frame);
        self.tx
            .send(Transmission { seq, reply_to, wire })
            .await
            .map_err(|_| LinkError::Simulation(format!("{} link closed", self.device.peer())))?;
        Ok(seq)
    }

    /// Wait for a transmission accepted by `wanted`, dropping anything else.
    /// `None` means the timeout elapsed; that is logged as a missed acknowledgment.
    async fn await_transmission<F>(&mut self, awaiting: &str, wanted: F) -> Result<Option<(u64, Frame)>, LinkError>
    where
        F: Fn(&Transmission, &Frame) -> bool,
    {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Err(_) => {
                    warn!(device = %self.device, "No {} within {:?}", awaiting, self.ack_timeout);
                    let mut log = self.log.lock().await;
                    log.append(
                        self.device,
                        LinkEvent::MissedAck {
                            awaiting: awaiting.to_string(),
                        },
                    );
                    return Ok(None);
                }
                Ok(None) => return Err(LinkError::Simulation(format!("{} link closed", self.device.peer()))),
                Ok(Some(t)) => {
                    let frame = self.codec.decode(&t.wire)?;
                    if wanted(&t, &frame) {
                        return Ok(Some((t.seq, frame)));
                    }
                    debug!(device = %self.device, seq = t.seq, "Dropping stale {}", frame);
                }
            }
        }
    }

    async fn await_reply(&mut self, seq: u64, awaiting: &str) -> Result<Option<Frame>, LinkError> {
        let reply = self
            .await_transmission(awaiting, |t, _| t.reply_to == Some(seq))
            .await?;
        Ok(reply.map(|(_, frame)| frame))
    }

    /// Wait for a frame the peer starts on its own; returns it with its sequence number
    async fn await_unsolicited(
        &mut self,
        frame_type: FrameType,
        awaiting: &str,
    ) -> Result<Option<(u64, Frame)>, LinkError> {
        self.await_transmission(awaiting, |t, f| t.reply_to.is_none() && f.frame_type == frame_type)
            .await
    }
}

/// Runs scripted steps over a simulated modem/appliance link.
#[derive(Debug, Clone, Default)]
pub struct LinkSimulator {
    config: SimulatorConfig,
}

impl LinkSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, steps: &[Step]) -> Result<SimulationOutcome, LinkError> {
        for step in steps {
            if let Step::Authenticate { response, .. } = step {
                if response.len() != AUTH_PAYLOAD_SIZE {
                    return Err(LinkError::Simulation(format!(
                        "authentication response must be {} bytes, got {}",
                        AUTH_PAYLOAD_SIZE,
                        response.len()
                    )));
                }
            }
        }

        let epoch = match self.config.epoch {
            Some(epoch) => epoch,
            None => u64::try_from(chrono::Utc::now().timestamp())
                .map_err(|_| LinkError::Simulation("system clock before 1970".to_string()))?,
        };
        let log = Arc::new(Mutex::new(CommunicationLog::new(epoch)));

        let (modem_tx, appliance_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (appliance_tx, modem_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let link = CodecConfig {
            source: APPLIANCE_ADDRESS,
            destination: MODULE_ADDRESS,
            ..CodecConfig::default()
        };
        let mut modem = Endpoint {
            device: Device::Modem,
            codec: FrameCodec::new(link.clone()),
            tx: modem_tx,
            rx: modem_rx,
            log: Arc::clone(&log),
            ack_timeout: self.config.ack_timeout,
            next_seq: 0,
        };
        let appliance = Appliance {
            endpoint: Endpoint {
                device: Device::Machine,
                codec: FrameCodec::new(link),
                tx: appliance_tx,
                rx: appliance_rx,
                log: Arc::clone(&log),
                ack_timeout: self.config.ack_timeout,
                next_seq: 0,
            },
            latency: self.config.appliance_latency,
            status: ApplianceStatus::default(),
        };
        let handle = tokio::spawn(appliance.run(request_rx));

        info!("Running {} simulation steps", steps.len());
        let mut powered = false;
        let mut skipped_steps = 0;
        let mut result = Ok(());
        for step in steps {
            if !powered && *step != Step::PowerUp {
                warn!("Skipping {} step: link not powered up", step.name());
                skipped_steps += 1;
                continue;
            }
            if let Err(e) = modem_step(&mut modem, &request_tx, step).await {
                result = Err(e);
                break;
            }
            powered = true;
        }

        // Closing the requests and the modem's sending half stops the appliance;
        // the modem keeps receiving so late replies still land in the log.
        drop(request_tx);
        let Endpoint {
            tx, rx, log: modem_log, ..
        } = modem;
        drop(tx);
        let appliance = handle
            .await
            .map_err(|e| LinkError::Simulation(format!("appliance task failed: {}", e)))??;
        drop(rx);
        drop(modem_log);
        result?;

        let log = Arc::try_unwrap(log)
            .map(Mutex::into_inner)
            .map_err(|_| LinkError::Simulation("communication log still shared".to_string()))?;
        info!(
            entries = log.entries().len(),
            missed_acks = log.missed_acks(),
            "Simulation complete"
        );
        Ok(SimulationOutcome {
            log,
            appliance,
            skipped_steps,
        })
    }
}

async fn modem_step(
    modem: &mut Endpoint,
    requests: &mpsc::Sender<ApplianceRequest>,
    step: &Step,
) -> Result<(), LinkError> {
    info!("Step: {}", step.name());
    match step {
        Step::PowerUp => {
            {
                let mut log = modem.log.lock().await;
                log.append(Device::Modem, LinkEvent::Marker);
                log.append(Device::Machine, LinkEvent::Marker);
            }
            let frame = modem.frame(FrameType::PowerUp, POWER_UP_PAYLOAD);
            let seq = modem.send(&frame, None, "Power-up initialization").await?;
            modem.await_reply(seq, "power-up acknowledgment").await?;
            modem.await_reply(seq, "firmware info").await?;
        }
        Step::Control { command, value } => {
            let payload = Bytes::from(vec![0x01, 0x4D, command.code(), *value]);
            let config = modem.codec.config();
            let frame = Frame::new(config.source, config.destination, FrameType::Control, payload);
            let seq = modem
                .send(&frame, None, &format!("Control: {}={}", command, value))
                .await?;
            modem.await_reply(seq, "control acknowledgment").await?;
        }
        Step::StatusReport => {
            request(requests, ApplianceRequest::Report).await?;
            if let Some((seq, _)) = modem
                .await_unsolicited(FrameType::StatusReport, "status report")
                .await?
            {
                let ack = modem.frame(FrameType::Acknowledge, ACK_PAYLOAD);
                modem.send(&ack, Some(seq), "Status acknowledgment").await?;
            }
        }
        Step::NetworkQuery => {
            let frame = modem.frame(FrameType::NetworkQuery, NETWORK_QUERY_PAYLOAD);
            let seq = modem.send(&frame, None, "Network status query").await?;
            modem.await_reply(seq, "network status").await?;
        }
        Step::Authenticate { challenge, response } => {
            request(requests, ApplianceRequest::Challenge(*challenge)).await?;
            if let Some((seq, _)) = modem
                .await_unsolicited(FrameType::Authenticate, "authentication challenge")
                .await?
            {
                let config = modem.codec.config();
                let frame = Frame::new(
                    config.source,
                    config.destination,
                    FrameType::Authenticate,
                    response.clone(),
                );
                modem.send(&frame, Some(seq), "Authentication response").await?;
            }
        }
    }
    Ok(())
}

async fn request(requests: &mpsc::Sender<ApplianceRequest>, req: ApplianceRequest) -> Result<(), LinkError> {
    requests
        .send(req)
        .await
        .map_err(|_| LinkError::Simulation("appliance stopped".to_string()))
}

/// The appliance side: answers modem requests and starts reports and challenges on request.
struct Appliance {
    endpoint: Endpoint,
    latency: Duration,
    status: ApplianceStatus,
}

impl Appliance {
    async fn run(mut self, mut requests: mpsc::Receiver<ApplianceRequest>) -> Result<ApplianceStatus, LinkError> {
        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => self.initiate(req).await?,
                    None => break,
                },
                t = self.endpoint.rx.recv() => match t {
                    Some(t) => self.respond(t).await?,
                    None => break,
                },
            }
        }
        debug!(status = ?self.status, "Appliance stopped");
        Ok(self.status)
    }

    async fn respond(&mut self, t: Transmission) -> Result<(), LinkError> {
        let frame = self.endpoint.codec.decode(&t.wire)?;
        match frame.frame_type {
            FrameType::PowerUp => {
                sleep(self.latency).await;
                // the acknowledgment keeps the module's addressing
                let ack = Frame::new(MODULE_ADDRESS, APPLIANCE_ADDRESS, FrameType::PowerUpAck, vec![0x00]);
                self.endpoint.send(&ack, Some(t.seq), "Power-up acknowledgment").await?;
                let info = self.endpoint.frame(FrameType::FirmwareInfo, FIRMWARE_INFO_PAYLOAD);
                self.endpoint.send(&info, Some(t.seq), "Device info").await?;
            }
            FrameType::Control => {
                if let [_, _, code, value, ..] = frame.payload[..] {
                    if let Some(command) = ControlCommand::from_code(code) {
                        self.status.apply(command, value);
                        debug!(status = ?self.status, "Appliance status updated");
                    }
                }
                sleep(self.latency).await;
                let ack = self.endpoint.frame(FrameType::Acknowledge, ACK_PAYLOAD);
                self.endpoint.send(&ack, Some(t.seq), "Control acknowledgment").await?;
            }
            FrameType::NetworkQuery => {
                sleep(self.latency).await;
                let status = self.endpoint.frame(FrameType::NetworkStatus, NETWORK_STATUS_PAYLOAD);
                self.endpoint.send(&status, Some(t.seq), "Network status response").await?;
            }
            _ => debug!("Appliance ignoring {}", frame),
        }
        Ok(())
    }

    async fn initiate(&mut self, req: ApplianceRequest) -> Result<(), LinkError> {
        match req {
            ApplianceRequest::Report => {
                let frame = self.endpoint.frame(FrameType::StatusReport, STATUS_REPORT_PAYLOAD);
                let seq = self.endpoint.send(&frame, None, "Status report").await?;
                self.endpoint.await_reply(seq, "status acknowledgment").await?;
            }
            ApplianceRequest::Challenge(challenge) => {
                let mut payload = vec![0u8; AUTH_PAYLOAD_SIZE];
                payload[..CHALLENGE_SIZE].copy_from_slice(challenge.as_bytes());
                let config = self.endpoint.codec.config();
                let frame = Frame::new(config.source, config.destination, FrameType::Authenticate, payload);
                let seq = self.endpoint.send(&frame, None, "Authentication challenge").await?;
                self.endpoint.await_reply(seq, "authentication response").await?;
            }
        }
        Ok(())
    }
}
