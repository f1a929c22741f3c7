//! Sync Channel
//!
//! Link state machine, outbound queueing and inbound reordering between the
//! primary device and the companion. `ChannelCore` holds all of the protocol
//! logic and never does I/O; `SyncChannel` runs it as an actor task that
//! talks to the platform transport.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::message::{DeviceId, Envelope, SyncMessage};
use super::queue::OutboundQueue;
use super::reorder::{Arrival, ReorderBuffer, FIRST_SEQ};
use super::SyncError;
use crate::config::SyncSettings;

/// Resync requests sent before the channel reports a stall.
const MAX_RESYNC_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Reachable,
    SendingPending,
}

impl LinkState {
    pub fn is_reachable(&self) -> bool {
        matches!(self, LinkState::Reachable | LinkState::SendingPending)
    }
}

/// Signals from the platform transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Available,
    HandshakeComplete,
    Lost,
}

/// Observable channel condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: LinkState,
    pub queued: usize,
    /// Outbound messages were dropped; the owner should send a full snapshot
    pub overflowed: bool,
    /// A resync request went unanswered; cleared by the next full snapshot
    pub stalled: bool,
    pub awaiting_resync: bool,
}

/// Opaque byte channel provided by the platform.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transmit(&self, bytes: Vec<u8>) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    Idle,
    Waiting { since: Instant, attempts: u32 },
}

/// Deterministic protocol state for one channel endpoint.
#[derive(Debug)]
pub struct ChannelCore {
    device: DeviceId,
    settings: SyncSettings,
    state: LinkState,
    queue: OutboundQueue,
    next_seq: u64,
    reorder: ReorderBuffer,
    gap_since: Option<Instant>,
    resync: Resync,
    stalled: bool,
}

impl ChannelCore {
    pub fn new(device: DeviceId, settings: SyncSettings) -> Self {
        Self {
            queue: OutboundQueue::new(settings.outbound_capacity),
            device,
            settings,
            state: LinkState::Disconnected,
            next_seq: FIRST_SEQ,
            reorder: ReorderBuffer::new(),
            gap_since: None,
            resync: Resync::Idle,
            stalled: false,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.state,
            queued: self.queue.len(),
            overflowed: self.queue.overflowed(),
            stalled: self.stalled,
            awaiting_resync: matches!(self.resync, Resync::Waiting { .. }),
        }
    }

    pub fn link(&mut self, event: LinkEvent, now: Instant) {
        let before = self.state;
        match event {
            LinkEvent::Available => {
                if self.state == LinkState::Disconnected {
                    self.state = LinkState::Connecting;
                }
            }
            LinkEvent::HandshakeComplete => {
                if self.state == LinkState::Disconnected {
                    log::warn!("Handshake reported without link, ignoring");
                    return;
                }
                // Both directions start numbering afresh
                self.next_seq = FIRST_SEQ;
                self.reorder.reset();
                self.gap_since = None;
                if let Resync::Waiting { attempts, .. } = self.resync {
                    self.resync = Resync::Waiting { since: now, attempts };
                }
                self.state = if self.queue.is_empty() {
                    LinkState::Reachable
                } else {
                    LinkState::SendingPending
                };
            }
            LinkEvent::Lost => self.state = LinkState::Disconnected,
        }
        if before != self.state {
            log::info!("Sync link {:?} -> {:?}", before, self.state);
        }
    }

    /// Queue a message; it goes out once the link is reachable.
    pub fn send(&mut self, message: SyncMessage) {
        self.queue.push(message);
        if self.state == LinkState::Reachable {
            self.state = LinkState::SendingPending;
        }
    }

    /// Next message to hand to the transport with its wire bytes. A sequence
    /// number is spent only once the envelope encoded.
    pub fn next_frame(&mut self) -> Option<(Envelope, Vec<u8>)> {
        if self.state != LinkState::SendingPending {
            return None;
        }
        while let Some(message) = self.queue.pop_front() {
            let envelope = Envelope {
                seq: self.next_seq,
                origin: self.device.clone(),
                message,
            };
            match envelope.encode() {
                Ok(bytes) => {
                    self.next_seq += 1;
                    return Some((envelope, bytes));
                }
                Err(e) => log::error!("Dropping unencodable {}: {}", envelope.message.label(), e),
            }
        }
        self.state = LinkState::Reachable;
        None
    }

    pub fn next_outbound(&mut self) -> Option<Envelope> {
        self.next_frame().map(|(envelope, _)| envelope)
    }

    /// The transport rejected `envelope`: keep it for the next link.
    pub fn transmit_failed(&mut self, envelope: Envelope) {
        self.queue.push_front(envelope.message);
        self.state = LinkState::Disconnected;
    }

    /// Feed one inbound envelope; returns what is now deliverable, in order.
    pub fn receive(&mut self, envelope: Envelope, now: Instant) -> Vec<Envelope> {
        if envelope.origin == self.device {
            log::warn!("Dropping echo of own message #{}", envelope.seq);
            return Vec::new();
        }

        let seq = envelope.seq;
        let mut ready = Vec::new();
        if self.reorder.insert(envelope, &mut ready) == Arrival::Stale {
            log::debug!("Dropping stale message #{}", seq);
        }

        if ready.iter().any(|e| e.message.is_full_snapshot()) {
            if self.stalled || self.resync != Resync::Idle {
                log::info!("Resync answered");
            }
            self.resync = Resync::Idle;
            self.stalled = false;
        }

        if !self.reorder.has_gap() {
            self.gap_since = None;
        } else if self.reorder.held() > self.settings.reorder_window {
            log::warn!("{} messages held behind a gap, requesting resync", self.reorder.held());
            self.request_resync(now);
        } else if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }

        ready
    }

    /// Ask the other side for a full snapshot and start the answer timer.
    pub fn request_resync(&mut self, now: Instant) {
        self.gap_since = None;
        if self.resync == Resync::Idle {
            self.resync = Resync::Waiting { since: now, attempts: 1 };
            self.send(SyncMessage::ResyncRequest);
        }
    }

    /// Drive timeouts. Returns true when the channel has just stalled.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.state.is_reachable() {
            return false;
        }

        if let Some(since) = self.gap_since {
            if now.duration_since(since) >= self.settings.gap_timeout() {
                log::warn!("Gap before #{} not filled in time", self.reorder.expected());
                self.request_resync(now);
            }
        }

        match self.resync {
            Resync::Waiting { since, attempts } if now.duration_since(since) >= self.settings.resync_timeout() => {
                if attempts < MAX_RESYNC_ATTEMPTS {
                    log::warn!("Resync unanswered, asking again");
                    self.resync = Resync::Waiting {
                        since: now,
                        attempts: attempts + 1,
                    };
                    self.send(SyncMessage::ResyncRequest);
                    false
                } else {
                    log::error!("Resync unanswered after {} requests, sync stalled", attempts);
                    self.resync = Resync::Idle;
                    self.stalled = true;
                    true
                }
            }
            _ => false,
        }
    }
}

type ReceiveHandler = Box<dyn FnMut(Envelope) + Send>;

enum ChannelCmd {
    Send(SyncMessage),
    Link(LinkEvent),
    Inbound(Vec<u8>),
    OnReceive(ReceiveHandler),
    RequestResync,
    Shutdown,
}

struct ChannelActor {
    core: ChannelCore,
    transport: Arc<dyn Transport>,
    rx: mpsc::UnboundedReceiver<ChannelCmd>,
    status_tx: watch::Sender<ChannelStatus>,
    handler: Option<ReceiveHandler>,
    /// Deliveries that arrived before a handler was registered
    backlog: Vec<Envelope>,
}

impl ChannelActor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.core.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    None | Some(ChannelCmd::Shutdown) => break,
                    Some(cmd) => self.handle(cmd),
                },
                _ = ticker.tick() => {
                    self.core.tick(Instant::now());
                }
            }
            self.flush().await;
            self.status_tx.send_if_modified(|status| {
                let next = self.core.status();
                let changed = *status != next;
                *status = next;
                changed
            });
        }
        log::debug!("Sync channel for {} stopped", self.core.device());
    }

    fn handle(&mut self, cmd: ChannelCmd) {
        match cmd {
            ChannelCmd::Send(message) => self.core.send(message),
            ChannelCmd::Link(event) => self.core.link(event, Instant::now()),
            ChannelCmd::Inbound(bytes) => match Envelope::decode(&bytes) {
                Ok(envelope) => {
                    for ready in self.core.receive(envelope, Instant::now()) {
                        self.deliver(ready);
                    }
                }
                Err(e) => log::warn!("Dropping undecodable inbound message: {}", e),
            },
            ChannelCmd::OnReceive(mut handler) => {
                for envelope in self.backlog.drain(..) {
                    handler(envelope);
                }
                self.handler = Some(handler);
            }
            ChannelCmd::RequestResync => self.core.request_resync(Instant::now()),
            ChannelCmd::Shutdown => {}
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        match self.handler.as_mut() {
            Some(handler) => handler(envelope),
            None => self.backlog.push(envelope),
        }
    }

    async fn flush(&mut self) {
        while let Some((envelope, bytes)) = self.core.next_frame() {
            if let Err(e) = self.transport.transmit(bytes).await {
                log::warn!("Transmit of #{} failed: {}", envelope.seq, e);
                self.core.transmit_failed(envelope);
                break;
            }
        }
    }
}

/// Handle to a running channel actor. `send` never blocks.
pub struct SyncChannel {
    tx: mpsc::UnboundedSender<ChannelCmd>,
    status: watch::Receiver<ChannelStatus>,
    task: JoinHandle<()>,
}

impl SyncChannel {
    pub fn spawn(device: DeviceId, settings: SyncSettings, transport: Arc<dyn Transport>) -> Self {
        let core = ChannelCore::new(device, settings);
        let (status_tx, status) = watch::channel(core.status());
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = ChannelActor {
            core,
            transport,
            rx,
            status_tx,
            handler: None,
            backlog: Vec::new(),
        };
        let task = tokio::spawn(actor.run());

        Self { tx, status, task }
    }

    fn command(&self, cmd: ChannelCmd) -> Result<(), SyncError> {
        self.tx.send(cmd).map_err(|_| SyncError::ChannelClosed)
    }

    pub fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        self.command(ChannelCmd::Send(message))
    }

    /// Link signal from the platform transport.
    pub fn link(&self, event: LinkEvent) -> Result<(), SyncError> {
        self.command(ChannelCmd::Link(event))
    }

    /// Raw bytes received by the platform transport.
    pub fn deliver(&self, bytes: Vec<u8>) -> Result<(), SyncError> {
        self.command(ChannelCmd::Inbound(bytes))
    }

    /// Register the consumer, called once per inbound message in sequence
    /// order. Replaces any earlier handler.
    pub fn on_receive<F>(&self, handler: F) -> Result<(), SyncError>
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        self.command(ChannelCmd::OnReceive(Box::new(handler)))
    }

    /// `on_receive` into a channel, for async consumers.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Envelope>, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_receive(move |envelope| {
            let _ = tx.send(envelope);
        })?;
        Ok(rx)
    }

    pub fn request_resync(&self) -> Result<(), SyncError> {
        self.command(ChannelCmd::RequestResync)
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// `SyncStalled` if the last resync went unanswered.
    pub fn check_stalled(&self) -> Result<(), SyncError> {
        if self.status.borrow().stalled {
            Err(SyncError::SyncStalled)
        } else {
            Ok(())
        }
    }

    /// Stop the actor without waiting for it. Later calls fail with
    /// `ChannelClosed`.
    pub fn close(&self) {
        let _ = self.tx.send(ChannelCmd::Shutdown);
    }

    pub async fn shutdown(self) {
        self.close();
        if let Err(e) = self.task.await {
            log::error!("Sync channel task failed: {}", e);
        }
    }
}
