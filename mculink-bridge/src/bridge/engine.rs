//! The engine task

use super::accumulator::Accumulator;
use super::ack::{AckStatus, AckWait};
use super::job::{Phase, SendJob};
use super::queue::SendQueue;
use super::{BridgeState, Command, Event, SendOutcome, SendRequest};
use crate::channel::ChannelRegistry;
use crate::config::{BridgeConfig, ChannelSettings};
use crate::error::Result;
use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use mculink_core::constants::{
    major_key_name, MAJOR_KEY_ACK, MAX_MAJOR_KEY, MAJOR_KEY_DEVICE_READY, MAJOR_KEY_ERROR, MAJOR_KEY_RESET,
    MINOR_KEY_PACKET_END, MINOR_KEY_PACKET_START,
};
use mculink_core::encoder::{encode_ack, encode_error_ack, encode_reset};
use mculink_core::{ChecksumTable, Frame, FrameError};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Local reset waiting for ACK(RESET)
struct ResetHandshake {
    bytes: Bytes,
    wait: AckWait,
    waiters: Vec<oneshot::Sender<SendOutcome>>,
}

impl ResetHandshake {
    fn complete(self, outcome: SendOutcome) {
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Inbound packeted transfer on one key
struct RxPacket {
    total: u64,
    received: u64,
}

type Exit = Option<oneshot::Sender<Result<()>>>;

pub(crate) struct Engine {
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    state: BridgeState,
    checksums: ChecksumTable,
    channels: ChannelRegistry,
    settings: HashMap<u8, ChannelSettings>,
    accumulator: Accumulator,
    queue: SendQueue,
    active: Option<SendJob>,
    reset: Option<ResetHandshake>,
    rx_packets: HashMap<u8, RxPacket>,
    events: mpsc::Receiver<Event>,
    link: Option<mpsc::Receiver<TransportEvent>>,
}

impl Engine {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: BridgeConfig,
        checksums: ChecksumTable,
        events: mpsc::Receiver<Event>,
    ) -> Self {
        let settings = config
            .channels
            .iter()
            .map(|c| (c.major_key, c.clone()))
            .collect();
        let accumulator = Accumulator::new(config.max_inbound_payload);
        Self {
            transport,
            config,
            state: BridgeState::Closed,
            checksums,
            channels: ChannelRegistry::default(),
            settings,
            accumulator,
            queue: SendQueue::default(),
            active: None,
            reset: None,
            rx_packets: HashMap::new(),
            events,
            link: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let exit = loop {
            self.pump().await;
            let deadline = self.next_deadline();

            let flow = tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    // Every handle dropped
                    None => ControlFlow::Break(None),
                },
                event = next_link_event(&mut self.link) => self.handle(event).await,
                _ = sleep_or_park(deadline) => {
                    self.on_deadline().await;
                    ControlFlow::Continue(())
                }
            };

            if let ControlFlow::Break(exit) = flow {
                break exit;
            }
        };

        let result = self.close().await;
        info!("Bridge engine for {} stopped", self.transport.describe());
        if let Some(reply) = exit {
            let _ = reply.send(result);
        }
    }

    async fn handle(&mut self, event: Event) -> ControlFlow<Exit> {
        match event {
            Event::Command(command) => return self.on_command(command).await,
            Event::Inbound(bytes) => self.on_inbound(&bytes).await,
            Event::TransportClosed(reason) => self.on_disconnect(reason),
        }
        ControlFlow::Continue(())
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<Exit> {
        match command {
            Command::Send { request, reply } => self.on_send(request, reply),
            Command::Reset { reply } => self.on_reset_request(reply).await,
            Command::Open { reply } => {
                let _ = reply.send(self.open().await);
            }
            Command::Close { reply } => {
                let _ = reply.send(self.close().await);
            }
            Command::Destroy { reply } => return ControlFlow::Break(Some(reply)),
            Command::RegisterChannel(channel) => {
                self.channels.register(channel);
                debug!("{} channel(s) registered", self.channels.len());
            }
            Command::DeregisterChannel(major_key) => self.channels.deregister(major_key),
            Command::ConfigureChecksum {
                major_key,
                config,
                reply,
            } => {
                let result = config
                    .build()
                    .and_then(|slot| self.checksums.configure(major_key, slot))
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::ConfigureChannel { settings, reply } => {
                let result = match &settings.checksum {
                    Some(checksum) => checksum
                        .build()
                        .and_then(|slot| self.checksums.configure(settings.major_key, slot)),
                    None if settings.major_key > MAX_MAJOR_KEY => {
                        Err(FrameError::InvalidMajorKey(settings.major_key))
                    }
                    None => Ok(()),
                }
                .map_err(Into::into);
                if result.is_ok() {
                    self.settings.insert(settings.major_key, settings);
                }
                let _ = reply.send(result);
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::PendingLen(reply) => {
                let _ = reply.send(self.queue.len());
            }
        }
        ControlFlow::Continue(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn set_state(&mut self, to: BridgeState) {
        match self.state.transition(to) {
            Ok(next) => {
                if next != self.state {
                    debug!("Bridge state {:?} -> {:?}", self.state, next);
                }
                self.state = next;
            }
            Err(e) => warn!("{}", e),
        }
    }

    async fn open(&mut self) -> Result<()> {
        let next = self.state.transition(BridgeState::Idle)?;
        let rx = self.transport.open().await?;
        self.link = Some(rx);
        self.accumulator.clear();
        self.state = next;
        info!("Bridge open on {}", self.transport.describe());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.state == BridgeState::Closed {
            return Ok(());
        }
        self.set_state(BridgeState::Closing);
        self.abort_all(SendOutcome::Cancelled);
        let result = self.transport.close().await;
        self.link = None;
        self.set_state(BridgeState::Closed);
        info!("Bridge closed");
        result
    }

    fn on_disconnect(&mut self, reason: String) {
        if self.state == BridgeState::Closed {
            return;
        }
        warn!("{} disconnected: {}", self.transport.describe(), reason);
        self.set_state(BridgeState::Closing);
        self.abort_all(SendOutcome::Failed(format!("disconnected: {}", reason)));
        self.link = None;
        self.set_state(BridgeState::Closed);
        for channel in self.channels.all() {
            channel.on_disconnect();
        }
    }

    /// Resolve queued, in-flight and reset work with `outcome`; drop partial input
    fn abort_all(&mut self, outcome: SendOutcome) {
        self.cancel_sends(outcome.clone());
        if let Some(reset) = self.reset.take() {
            reset.complete(outcome);
        }
    }

    fn cancel_sends(&mut self, outcome: SendOutcome) {
        let queued = self.queue.drain(outcome.clone());
        let active = self.active.take();
        if queued > 0 || active.is_some() {
            info!(
                "Dropping {} queued send(s){} ({:?})",
                queued,
                if active.is_some() { " and the in-flight one" } else { "" },
                outcome
            );
        }
        if let Some(job) = active {
            finish_job(job, outcome);
        }
        self.accumulator.clear();
        self.rx_packets.clear();
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn on_send(&mut self, request: SendRequest, reply: oneshot::Sender<SendOutcome>) {
        match self.state {
            BridgeState::Idle => {
                debug!("Queueing {:?}", request);
                if self.queue.push(request, reply) {
                    debug!("Merged with an identical queued request");
                }
            }
            BridgeState::Resetting => {
                let _ = reply.send(SendOutcome::Cancelled);
            }
            BridgeState::Closed | BridgeState::Closing => {
                let _ = reply.send(SendOutcome::Failed("bridge is not open".into()));
            }
        }
    }

    fn settings_for(&self, major_key: u8) -> ChannelSettings {
        self.settings
            .get(&major_key)
            .cloned()
            .unwrap_or_else(|| ChannelSettings::new(major_key))
    }

    /// Start queued work and write frames until something has to be waited for
    async fn pump(&mut self) {
        while self.state == BridgeState::Idle {
            if self.active.is_none() {
                let Some(pending) = self.queue.pop() else {
                    return;
                };
                let settings = self.settings_for(pending.request.major_key);
                let mut job = SendJob::new(pending, &settings, self.config.file_read_chunk);
                if let Err(msg) = job.start(&self.checksums).await {
                    warn!("Send on major key {} failed: {}", job.major_key(), msg);
                    finish_job(job, SendOutcome::Failed(msg));
                    continue;
                }
                self.active = Some(job);
            }

            let next = match self.active.as_mut() {
                Some(job) if matches!(job.phase, Phase::Ready) => job.next_frame(&self.checksums).await,
                _ => return,
            };

            match next {
                Ok(Some(frame)) => {
                    if let Err(e) = self.transport.write(&frame.bytes).await {
                        self.fail_active(format!("write failed: {}", e));
                        continue;
                    }
                    if let Some(job) = self.active.as_mut() {
                        let wait = AckWait::new(job.major_key(), self.config.ack_timeout(), Instant::now());
                        job.phase = Phase::AwaitAck { frame, wait };
                    }
                    return;
                }
                Ok(None) => {
                    if let Some(job) = self.active.take() {
                        debug!("Send on major key {} complete", job.major_key());
                        finish_job(job, SendOutcome::Completed);
                    }
                }
                Err(msg) => self.fail_active(msg),
            }
        }
    }

    fn fail_active(&mut self, msg: String) {
        if let Some(job) = self.active.take() {
            warn!("Send on major key {} failed: {}", job.major_key(), msg);
            finish_job(job, SendOutcome::Failed(msg));
        }
    }

    /// Write the in-flight frame again, or give up past the retry ceiling
    async fn retransmit_active(&mut self) {
        let max = self.config.max_retries;
        let retry = match self.active.as_mut().map(|job| &mut job.phase) {
            Some(Phase::AwaitAck { frame, wait }) if wait.may_retry(max) => {
                wait.rearm(Instant::now());
                warn!(
                    "Retransmitting frame for major key {} (retry {})",
                    wait.key(),
                    wait.retransmissions()
                );
                Ok(frame.bytes.clone())
            }
            Some(Phase::AwaitAck { wait, .. }) => Err(format!(
                "no acknowledgement for major key {} after {} retransmissions",
                wait.key(),
                wait.retransmissions()
            )),
            _ => return,
        };
        match retry {
            Ok(bytes) => {
                if let Err(e) = self.transport.write(&bytes).await {
                    self.fail_active(format!("write failed: {}", e));
                }
            }
            Err(msg) => self.fail_active(msg),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let reset = self.reset.as_ref().map(|r| r.wait.deadline());
        let job = self.active.as_ref().and_then(|job| match &job.phase {
            Phase::AwaitAck { wait, .. } => Some(wait.deadline()),
            Phase::AwaitReady { deadline } => Some(*deadline),
            Phase::Ready => None,
        });
        match (reset, job) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if matches!(&self.reset, Some(r) if r.wait.poll(now) == AckStatus::TimedOut) {
            self.retransmit_reset().await;
        }

        let (ack_expired, ready_expired) = match self.active.as_ref().map(|job| &job.phase) {
            Some(Phase::AwaitAck { wait, .. }) => (wait.poll(now) == AckStatus::TimedOut, false),
            Some(Phase::AwaitReady { deadline }) => (false, now >= *deadline),
            _ => (false, false),
        };

        if ack_expired {
            self.retransmit_active().await;
        } else if ready_expired {
            if let Some(job) = self.active.as_mut() {
                warn!(
                    "No DEVICE_READY within {:?} on major key {}, continuing",
                    self.config.device_ready_timeout(),
                    job.major_key()
                );
                job.phase = Phase::Ready;
            }
        }
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    async fn on_reset_request(&mut self, reply: oneshot::Sender<SendOutcome>) {
        match self.state {
            BridgeState::Idle => {}
            BridgeState::Resetting => {
                if let Some(reset) = self.reset.as_mut() {
                    reset.waiters.push(reply);
                } else {
                    let _ = reply.send(SendOutcome::Cancelled);
                }
                return;
            }
            BridgeState::Closed | BridgeState::Closing => {
                let _ = reply.send(SendOutcome::Failed("bridge is not open".into()));
                return;
            }
        }

        info!("Resetting remote");
        self.set_state(BridgeState::Resetting);
        self.cancel_sends(SendOutcome::Cancelled);

        let bytes = match encode_reset(&self.checksums) {
            Ok(b) => b,
            Err(e) => {
                let _ = reply.send(SendOutcome::Failed(e.to_string()));
                self.set_state(BridgeState::Idle);
                return;
            }
        };
        if let Err(e) = self.transport.write(&bytes).await {
            let _ = reply.send(SendOutcome::Failed(format!("write failed: {}", e)));
            self.set_state(BridgeState::Idle);
            return;
        }
        self.reset = Some(ResetHandshake {
            bytes,
            wait: AckWait::new(MAJOR_KEY_RESET, self.config.ack_timeout(), Instant::now()),
            waiters: vec![reply],
        });
    }

    async fn retransmit_reset(&mut self) {
        let max = self.config.max_retries;
        let Some(reset) = self.reset.as_mut() else {
            return;
        };
        if !reset.wait.may_retry(max) {
            let msg = format!(
                "no acknowledgement for reset after {} retransmissions",
                reset.wait.retransmissions()
            );
            warn!("{}", msg);
            if let Some(reset) = self.reset.take() {
                reset.complete(SendOutcome::Failed(msg));
            }
            self.set_state(BridgeState::Idle);
            return;
        }
        reset.wait.rearm(Instant::now());
        warn!("Retransmitting reset (retry {})", reset.wait.retransmissions());
        let bytes = reset.bytes.clone();
        if let Err(e) = self.transport.write(&bytes).await {
            warn!("Reset write failed: {}", e);
        }
    }

    fn finish_reset(&mut self) {
        if let Some(reset) = self.reset.take() {
            info!("Remote reset acknowledged");
            self.cancel_sends(SendOutcome::Cancelled);
            reset.complete(SendOutcome::Completed);
            self.set_state(BridgeState::Idle);
        }
    }

    async fn on_remote_reset(&mut self) {
        info!("Peer requested a reset");
        if self.reset.is_none() {
            self.set_state(BridgeState::Resetting);
        }
        self.cancel_sends(SendOutcome::Cancelled);
        self.write_control(encode_ack(MAJOR_KEY_RESET, &self.checksums)).await;
        if self.reset.is_none() {
            self.set_state(BridgeState::Idle);
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    async fn on_inbound(&mut self, bytes: &[u8]) {
        if !self.state.is_open() {
            debug!("Dropping {} inbound bytes while {:?}", bytes.len(), self.state);
            return;
        }
        self.accumulator.push(bytes);

        loop {
            let frame = match self.accumulator.next_frame(&self.checksums) {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Framing error, discarding receive buffer: {}", e);
                    self.write_control(encode_error_ack(&self.checksums)).await;
                    break;
                }
            };
            debug!(
                "Received {} minor {} ({} bytes)",
                major_key_name(frame.major_key),
                frame.minor_key,
                frame.payload.len()
            );

            match frame.major_key {
                MAJOR_KEY_ACK => self.on_ack(frame.minor_key).await,
                MAJOR_KEY_DEVICE_READY => self.on_device_ready(),
                MAJOR_KEY_ERROR => {
                    warn!("Peer sent an error frame (minor {}), not dispatched", frame.minor_key);
                }
                MAJOR_KEY_RESET => {
                    self.on_remote_reset().await;
                    break;
                }
                _ => {
                    if !self.dispatch(frame).await {
                        break;
                    }
                }
            }
        }

        if self.accumulator.len() > 0 {
            debug!("{} bytes of a partial frame buffered", self.accumulator.len());
        }
    }

    async fn on_ack(&mut self, acked_key: u8) {
        if self.reset.is_some() {
            match acked_key {
                MAJOR_KEY_RESET => self.finish_reset(),
                MAJOR_KEY_ERROR => self.retransmit_reset().await,
                other => debug!("Ignoring ack for {} during reset", other),
            }
            return;
        }

        let Some(job) = self.active.as_mut() else {
            debug!("Unsolicited ack for major key {}", acked_key);
            return;
        };
        let Phase::AwaitAck { wait, .. } = &mut job.phase else {
            debug!("Ack for major key {} with nothing on the wire", acked_key);
            return;
        };

        if acked_key == MAJOR_KEY_ERROR {
            warn!("Peer reported a framing error");
            self.retransmit_active().await;
            return;
        }
        if !wait.observe(acked_key) {
            debug!("Ack for {} while waiting for {}", acked_key, wait.key());
            return;
        }

        if let Phase::AwaitAck { frame, .. } = std::mem::replace(&mut job.phase, Phase::Ready) {
            if let Some((percent, label)) = job.record_ack(&frame) {
                if let Some(source) = job.source() {
                    source.on_send_progress(percent, &label);
                }
            }
        }
        if job.paced() && job.has_more() {
            job.phase = Phase::AwaitReady {
                deadline: Instant::now() + self.config.device_ready_timeout(),
            };
        }
    }

    fn on_device_ready(&mut self) {
        match self.active.as_mut() {
            Some(job) if matches!(job.phase, Phase::AwaitReady { .. }) => {
                job.phase = Phase::Ready;
            }
            _ => debug!("DEVICE_READY with no paced send waiting"),
        }
    }

    /// Hand a data frame to its channels and acknowledge it. Returns false
    /// when the receive buffer was discarded.
    async fn dispatch(&mut self, frame: Frame) -> bool {
        let major = frame.major_key;
        let targets = self.channels.targets(major);
        if targets.is_empty() {
            warn!("No channel for major key {}, discarding receive buffer", major);
            self.accumulator.clear();
            self.write_control(encode_error_ack(&self.checksums)).await;
            return false;
        }

        match frame.minor_key {
            MINOR_KEY_PACKET_START => {
                let total = frame
                    .payload
                    .get(1..5)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64)
                    .unwrap_or(0);
                self.rx_packets.insert(major, RxPacket { total, received: 0 });
                self.receive_progress(major, 0, format!("0/{} KB", total / 1024));
            }
            MINOR_KEY_PACKET_END => {
                self.rx_packets.remove(&major);
                self.receive_progress(major, 100, "Done!".to_string());
            }
            minor => {
                for channel in &targets {
                    channel.receive(minor, frame.payload.clone());
                }
                if let Some(packet) = self.rx_packets.get_mut(&major) {
                    packet.received += frame.payload.len() as u64;
                    let percent = if packet.total == 0 {
                        100
                    } else {
                        (packet.received.min(packet.total) * 100 / packet.total) as u8
                    };
                    let label = format!("{}/{} KB", packet.received / 1024, packet.total / 1024);
                    self.receive_progress(major, percent, label);
                }
            }
        }

        self.write_control(encode_ack(major, &self.checksums)).await;
        true
    }

    fn receive_progress(&self, major_key: u8, percent: u8, label: String) {
        if let Some(channel) = self.channels.exact(major_key) {
            channel.on_receive_progress(percent, &label);
        }
    }

    async fn write_control(&self, encoded: mculink_core::Result<Bytes>) {
        let result = match encoded {
            Ok(bytes) => self.transport.write(&bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Control frame not sent: {}", e);
        }
    }
}

/// Report the outcome to the sender's channel and every waiter
fn finish_job(job: SendJob, outcome: SendOutcome) {
    if let Some(source) = job.source() {
        match &outcome {
            SendOutcome::Completed if job.is_file() => source.on_send_progress(100, "Done!"),
            SendOutcome::Failed(msg) => source.on_send_progress(0, &format!("Error: {}", msg)),
            SendOutcome::Cancelled if job.is_file() => source.on_send_progress(0, "Cancelled"),
            _ => {}
        }
    }
    job.pending.complete(outcome);
}

async fn next_link_event(link: &mut Option<mpsc::Receiver<TransportEvent>>) -> Event {
    match link {
        Some(rx) => match rx.recv().await {
            Some(TransportEvent::Data(bytes)) => Event::Inbound(bytes),
            Some(TransportEvent::Disconnected(reason)) => Event::TransportClosed(reason),
            None => Event::TransportClosed("transport event stream ended".into()),
        },
        None => std::future::pending().await,
    }
}

async fn sleep_or_park(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
