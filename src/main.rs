//! meshjam - peer-to-peer real-time audio conferencing for cooperative LANs

use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshjam::audio::{
    build_input_stream, build_output_stream, list_devices, resolve_spec, CodecKind, DeviceId,
    DeviceWorker, PlayoutWorker,
};
use meshjam::config::{DeviceSpec, EngineOptions};
use meshjam::network::broker::{Broker, BrokerChannels, BrokerControl, WorkerLink};
use meshjam::network::packet_buffer::PacketBuffer;
use meshjam::network::timesync::{spawn_timing_responder, spawn_timing_thread, SharedClock};
use meshjam::network::transport::{bind_multicast, bind_udp, probe_peer, WorldSocket};
use meshjam::protocol::{extract_channel, DeviceCommand};

#[derive(Parser)]
#[command(name = "meshjam")]
#[command(about = "Peer-to-peer real-time audio conferencing for cooperative LANs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Run a conferencing node
    Run {
        /// Device to open, as <input/output>:<name or id>:<channels>.
        /// Repeatable; defaults to the default input and output devices.
        #[arg(short, long = "device")]
        devices: Vec<String>,

        /// Peer address to send captured audio to. Repeatable.
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Port to listen on
        #[arg(short, long, default_value = "5040")]
        port: u16,

        /// Audio codec (pcm or opus)
        #[arg(long, default_value = "pcm")]
        codec: String,
    },

    /// Receive a timestamped multicast audio stream
    Receive {
        /// Sender address for timing sync and retransmit requests
        upstream: String,

        /// Multicast group to join
        #[arg(long, default_value = "ff12::5040")]
        group: Ipv6Addr,

        /// Multicast port
        #[arg(short, long, default_value = "5041")]
        port: u16,

        /// Which channel of the stream this node plays
        #[arg(short, long, default_value = "0")]
        channel: u16,

        /// Playout window around host-now, in milliseconds
        #[arg(long, default_value = "55")]
        buff_time: u64,

        /// Output device, as <output>:<name or id>:<channels>
        #[arg(short, long)]
        device: Option<String>,

        /// Audio codec (pcm or opus)
        #[arg(long, default_value = "pcm")]
        codec: String,
    },
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List all devices
    List,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}

fn print_devices() {
    println!("Devices:");
    for (idx, dev) in list_devices().iter().enumerate() {
        let mut marker = String::new();
        if dev.is_default_input {
            marker.push('<');
        }
        if dev.is_default_output {
            marker.push('>');
        }
        println!(
            "[{idx:2}] {:<33} [{:3} in, {:3} out] {marker}",
            dev.name, dev.max_input_channels, dev.max_output_channels
        );
    }
}

fn resolve_target(target: &str) -> Result<SocketAddr> {
    target
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve \"{target}\""))?
        .next()
        .ok_or_else(|| anyhow!("\"{target}\" resolved to no addresses"))
}

async fn run_node(opts: EngineOptions, codec: CodecKind) -> Result<()> {
    let world = WorldSocket::bind(opts.port)?;
    let our_identity = world.identity().clone();

    let (input_tx, input_rx) = bounded(256);
    let (control_tx, control_rx) = bounded(64);

    let mut links = Vec::new();
    let mut cmd_txs = Vec::new();
    let mut worker_handles = Vec::new();
    // Streams stay on the main thread; their callbacks run on driver
    // threads and talk to workers only through channels.
    let mut streams = Vec::new();

    for (idx, spec) in opts.devices.iter().enumerate() {
        let (info, device) = resolve_spec(spec, DeviceId(idx as u32))?;
        if codec == CodecKind::Pcm
            && info.direction == meshjam::audio::Direction::Input
            && info.channels > 1
        {
            bail!(
                "the pcm codec fits only mono capture in a packet; \
                 open \"{}\" with 1 channel or use --codec opus",
                info.name
            );
        }
        info!(
            "opening \"{}\" ({}, {} channels)",
            info.name,
            info.direction.as_str(),
            info.channels
        );
        let (worker, cmd_tx, capture, playback) =
            DeviceWorker::build(info.clone(), codec, input_tx.clone(), control_tx.clone())?;
        if let Some(capture) = capture {
            streams.push(build_input_stream(&device, &info, capture)?);
        }
        if let Some(playback) = playback {
            streams.push(build_output_stream(&device, &info, playback)?);
        }
        links.push(WorkerLink {
            device: info.id,
            cmd_tx: cmd_tx.clone(),
        });
        cmd_txs.push(cmd_tx);
        worker_handles.push(worker.spawn());
    }

    let broker = Broker::new(
        world,
        links,
        BrokerChannels {
            input_rx,
            control_rx,
        },
    );
    let broker_handle = std::thread::Builder::new()
        .name("broker".to_string())
        .spawn(move || broker.run())
        .expect("failed to spawn broker");

    // Probe each target for its identity before forwarding audio to it.
    for target in &opts.targets {
        let addr = resolve_target(target)?;
        match probe_peer(addr, &our_identity) {
            Ok(remote) => {
                info!("connected to {remote} at {addr}");
                let _ = control_tx.send(BrokerControl::Connect(addr));
            }
            Err(e) => warn!("skipping target {target}: {e}"),
        }
    }

    println!("Running as {our_identity}. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Workers first, then the broker; sockets close only after every
    // worker has joined.
    for cmd_tx in &cmd_txs {
        let _ = cmd_tx.send(DeviceCommand::Shutdown.to_bytes());
    }
    let joiner = tokio::task::spawn_blocking(move || {
        for handle in worker_handles {
            let _ = handle.join();
        }
    });
    tokio::select! {
        res = joiner => {
            res.context("worker join panicked")?;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("forced exit");
            std::process::exit(130);
        }
    }

    let _ = control_tx.send(BrokerControl::Shutdown);
    let _ = broker_handle.join();
    drop(streams);

    println!("\nClean shutdown.");
    Ok(())
}

async fn run_receive(
    upstream: String,
    group: Ipv6Addr,
    port: u16,
    channel: u16,
    buff_time_ms: u64,
    device_string: Option<String>,
    codec: CodecKind,
) -> Result<()> {
    let upstream = resolve_target(&upstream)?;

    // The receiver attends to exactly one channel of the stream and plays
    // it out mono.
    let mut spec = match &device_string {
        Some(s) => DeviceSpec::parse(s)?,
        None => DeviceSpec::defaults().remove(1),
    };
    spec.channels = Some(1);
    let (info, device) = resolve_spec(&spec, DeviceId(0))?;
    if info.direction != meshjam::audio::Direction::Output {
        bail!("receive mode needs an output device");
    }

    let running = Arc::new(AtomicBool::new(true));
    let clock = SharedClock::new();

    // Timing: ping the sender, serve pings ourselves, share the offset.
    let timing_socket = bind_udp(0, Some(std::time::Duration::from_millis(50)))?;
    let timing_handle =
        spawn_timing_thread(timing_socket, upstream, clock.clone(), running.clone());
    let responder_socket = bind_udp(port + 1, Some(std::time::Duration::from_millis(500)))?;
    let responder_handle = spawn_timing_responder(responder_socket, running.clone());

    let decoder = meshjam::audio::codec::create_decoder(codec, 1)?;
    let buffer = PacketBuffer::with_buff_time(decoder, buff_time_ms);
    let retransmit_socket = bind_udp(0, None)?;
    let (worker, endpoints) =
        PlayoutWorker::build(buffer, clock, 1, Some((retransmit_socket, upstream)));

    let stream = build_output_stream(&device, &info, endpoints.playback)?;
    let playout_handle = worker.spawn();

    // Network thread: pull datagrams off the group, slice out our channel.
    let multicast = bind_multicast(group, port)?;
    let packet_tx = endpoints.packet_tx;
    let net_running = running.clone();
    let net_handle = std::thread::Builder::new()
        .name("mcast-recv".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            while net_running.load(Ordering::Relaxed) {
                match multicast.recv_from(&mut buf) {
                    Ok((len, _)) => {
                        if let Some((ts, payload)) = extract_channel(&buf[..len], channel) {
                            if packet_tx.try_send((ts, payload.to_vec())).is_err() {
                                warn!("playout worker lagging; packet dropped");
                            }
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        error!("multicast receive failed: {e}");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn multicast receiver");

    println!(
        "Receiving channel {channel} of {group}:{port}. Press Ctrl+C to stop."
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    running.store(false, Ordering::Relaxed);
    let _ = endpoints.cmd_tx.send(DeviceCommand::Shutdown.to_bytes());
    let joiner = tokio::task::spawn_blocking(move || {
        let _ = playout_handle.join();
        let _ = net_handle.join();
        let _ = timing_handle.join();
        let _ = responder_handle.join();
    });
    tokio::select! {
        res = joiner => {
            res.context("worker join panicked")?;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("forced exit");
            std::process::exit(130);
        }
    }
    drop(stream);

    println!("\nClean shutdown.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Devices { action } => match action {
            DevicesAction::List => print_devices(),
        },
        Commands::Run {
            devices,
            targets,
            port,
            codec,
        } => {
            let codec: CodecKind = codec.parse()?;
            let specs = if devices.is_empty() {
                DeviceSpec::defaults()
            } else {
                devices
                    .iter()
                    .map(|s| DeviceSpec::parse(s))
                    .collect::<Result<Vec<_>, _>>()?
            };
            let opts = EngineOptions {
                devices: specs,
                targets,
                port,
            };
            run_node(opts, codec).await?;
        }
        Commands::Receive {
            upstream,
            group,
            port,
            channel,
            buff_time,
            device,
            codec,
        } => {
            let codec: CodecKind = codec.parse()?;
            run_receive(upstream, group, port, channel, buff_time, device, codec).await?;
        }
    }

    Ok(())
}
