//! The broker: one thread routing between the world and the device workers
//!
//! Inbound, every world datagram is fanned out to the workers subscribed to
//! its sender and the sender's roster entry is stamped. Outbound, every
//! encoded frame a worker produces is forwarded to each address in the
//! outbound set. A five-second sweep ages silent peers out of the roster,
//! and any roster change is broadcast to all workers as a `ClientList`
//! command.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, info, trace, warn};

use crate::audio::DeviceId;
use crate::protocol::{DeviceCommand, WorldMessage};
use crate::{PeerId, SWEEP_INTERVAL_MS};

use super::roster::{ClientRoster, OutboundSet};
use super::transport::WorldSocket;

/// One encoded frame a worker hands to the broker for fan-out.
#[derive(Debug, Clone)]
pub struct WorkerFrame {
    pub device: DeviceId,
    pub decoded_len: u32,
    pub channels: u32,
    pub payload: Vec<u8>,
}

/// One encoded frame the broker routes to a subscribed worker.
#[derive(Debug, Clone)]
pub struct PeerFrame {
    pub peer: PeerId,
    pub decoded_len: u32,
    pub channels: u32,
    pub payload: Vec<u8>,
}

/// Control messages into the broker loop. Connect/disconnect come from the
/// main thread; subscriptions come from workers reacting to roster
/// commands.
pub enum BrokerControl {
    /// Forward locally-captured audio to this address from now on.
    Connect(SocketAddr),
    /// Stop forwarding to this address.
    Disconnect(SocketAddr),
    /// Route `peer`'s audio to this worker channel.
    Subscribe {
        peer: PeerId,
        device: DeviceId,
        tx: Sender<PeerFrame>,
    },
    /// Stop routing `peer`'s audio to this worker.
    Unsubscribe { peer: PeerId, device: DeviceId },
    /// Close the broker loop. Sent by the main thread after all workers
    /// have joined.
    Shutdown,
}

/// A worker as the broker sees it: its id and its command channel carrying
/// wire-format command bytes.
pub struct WorkerLink {
    pub device: DeviceId,
    pub cmd_tx: Sender<Vec<u8>>,
}

/// The channel endpoints the broker serves.
pub struct BrokerChannels {
    pub input_rx: Receiver<WorkerFrame>,
    pub control_rx: Receiver<BrokerControl>,
}

pub struct Broker {
    world: WorldSocket,
    roster: ClientRoster,
    outbound: OutboundSet,
    workers: Vec<WorkerLink>,
    subscriptions: HashMap<PeerId, Vec<(DeviceId, Sender<PeerFrame>)>>,
    channels: BrokerChannels,
    sweep_interval: Duration,
    last_sweep: Instant,
    last_sweep_ms: f64,
    started: Instant,
    frames_in: u64,
    frames_out: u64,
}

impl Broker {
    pub fn new(
        world: WorldSocket,
        workers: Vec<WorkerLink>,
        channels: BrokerChannels,
    ) -> Self {
        Self::with_sweep_interval(
            world,
            workers,
            channels,
            Duration::from_millis(SWEEP_INTERVAL_MS),
        )
    }

    /// Construction with an injectable sweep interval, for eviction tests.
    pub fn with_sweep_interval(
        world: WorldSocket,
        workers: Vec<WorkerLink>,
        channels: BrokerChannels,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            world,
            roster: ClientRoster::new(),
            outbound: OutboundSet::new(),
            workers,
            subscriptions: HashMap::new(),
            channels,
            sweep_interval,
            last_sweep: Instant::now(),
            last_sweep_ms: 0.0,
            started: Instant::now(),
            frames_in: 0,
            frames_out: 0,
        }
    }

    pub fn identity(&self) -> &PeerId {
        self.world.identity()
    }

    pub fn local_port(&self) -> u16 {
        self.world.local_port()
    }

    /// Run until a `Shutdown` control arrives. Consumes the broker; sockets
    /// close on drop, after every worker has already been joined by the
    /// main thread.
    pub fn run(mut self) {
        info!("broker running as {}", self.world.identity());
        loop {
            if !self.tick() {
                break;
            }
        }
        info!(
            "broker done: {} frames in, {} frames out, {} peers",
            self.frames_in,
            self.frames_out,
            self.roster.len()
        );
    }

    /// One broker tick: a world receive bounded by the 10 ms socket
    /// timeout, then channel drains, sweep and roster broadcast. Returns
    /// false on shutdown.
    pub fn tick(&mut self) -> bool {
        match self.world.recv() {
            Ok(Some((msg, addr))) => self.handle_world(msg, addr),
            Ok(None) => {}
            Err(e) => warn!("world socket error: {e}"),
        }

        loop {
            match self.channels.input_rx.try_recv() {
                Ok(frame) => self.handle_worker_frame(frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("worker input channel closed");
                    return false;
                }
            }
        }

        loop {
            match self.channels.control_rx.try_recv() {
                Ok(BrokerControl::Shutdown) => return false,
                Ok(ctrl) => self.handle_control(ctrl),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("control channel closed");
                    return false;
                }
            }
        }

        if self.last_sweep.elapsed() >= self.sweep_interval {
            self.sweep();
        }

        if self.roster.take_dirty() {
            self.broadcast_roster();
        }
        true
    }

    fn now_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1_000.0
    }

    fn handle_world(&mut self, msg: WorldMessage, addr: SocketAddr) {
        match msg {
            WorldMessage::Probe { from } => {
                debug!("identity probe from {from} ({addr})");
                if let Err(e) = self.world.send_identity_reply(addr) {
                    warn!("identity reply to {addr} failed: {e}");
                }
            }
            WorldMessage::Audio {
                from,
                decoded_len,
                channels,
                payload,
            } => {
                self.frames_in += 1;
                if let Some(subs) = self.subscriptions.get(&from) {
                    for (device, tx) in subs {
                        let frame = PeerFrame {
                            peer: from.clone(),
                            decoded_len,
                            channels,
                            payload: payload.clone(),
                        };
                        if tx.try_send(frame).is_err() {
                            trace!("worker {device} lagging; frame from {from} dropped");
                        }
                    }
                }
                self.roster.heard(&from, self.now_ms());
            }
        }
    }

    fn handle_worker_frame(&mut self, frame: WorkerFrame) {
        self.frames_out += 1;
        let msg = WorldMessage::Audio {
            from: self.world.identity().clone(),
            decoded_len: frame.decoded_len,
            channels: frame.channels,
            payload: frame.payload,
        };
        for &addr in self.outbound.iter() {
            if let Err(e) = self.world.send(&msg, addr) {
                warn!("send to {addr} failed: {e}");
            }
        }
    }

    fn handle_control(&mut self, ctrl: BrokerControl) {
        match ctrl {
            BrokerControl::Connect(addr) => {
                if self.outbound.insert(addr) {
                    info!("forwarding audio to {addr}");
                }
            }
            BrokerControl::Disconnect(addr) => {
                if self.outbound.remove(&addr) {
                    info!("stopped forwarding to {addr}");
                }
            }
            BrokerControl::Subscribe { peer, device, tx } => {
                let subs = self.subscriptions.entry(peer).or_default();
                subs.retain(|(d, _)| *d != device);
                subs.push((device, tx));
            }
            BrokerControl::Unsubscribe { peer, device } => {
                if let Some(subs) = self.subscriptions.get_mut(&peer) {
                    subs.retain(|(d, _)| *d != device);
                    if subs.is_empty() {
                        self.subscriptions.remove(&peer);
                    }
                }
            }
            BrokerControl::Shutdown => unreachable!("handled by tick"),
        }
    }

    /// Age out peers not heard from since the previous sweep started.
    fn sweep(&mut self) {
        let evicted = self.roster.sweep(self.last_sweep_ms);
        for peer in &evicted {
            info!("peer {peer} silent for two sweeps, evicted");
            self.subscriptions.remove(peer);
        }
        self.last_sweep = Instant::now();
        self.last_sweep_ms = self.now_ms();
    }

    /// Send the current roster to every worker as a `ClientList` command.
    fn broadcast_roster(&mut self) {
        let cmd = DeviceCommand::ClientList {
            identities: self.roster.identities(),
        }
        .to_bytes();
        debug!("roster changed: {} inbound peers", self.roster.len());
        for worker in &self.workers {
            if worker.cmd_tx.send(cmd.clone()).is_err() {
                warn!("worker {} command channel closed", worker.device);
            }
        }
    }
}
