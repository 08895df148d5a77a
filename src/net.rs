//! Network wiring for `radiod`'s I/O edges (spec.md §5): the RTP input
//! socket, the status publisher/listener, the RTCP sender-report emitter
//! and the optional Doppler-tracking child process. The CPU-bound signal
//! path (sample processor, filter, demodulator) runs on dedicated
//! `std::thread`s started by [`Receiver`]/[`crate::demod_runtime`]; this
//! module is the tokio-driven network edge around it, grounded in
//! `turn-server/src/server.rs`'s per-core `udp_server` task shape
//! (SPEC_FULL.md §5).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::process::Command as TokioCommand;
use tokio::time::interval;

use proto::rtcp::{encode_compound, ntp_timestamp, SenderReport, SourceDescription};
use proto::rtp::{parse_iq_datagram, PacketQueue};
use proto::tlv::{commands_from_message, decode_message};

use crate::config::Config;
use crate::receiver::Receiver;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch
/// (1970-01-01), needed to convert `SystemTime::now()` into the NTP
/// timestamp an RTCP sender report carries.
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

/// Number of concurrent tasks reading the RTP input socket, matching
/// `turn-server/src/server.rs`'s `num_cpus::get()` fan-out per socket:
/// several tasks race on the same `UdpSocket`, which is a valid way to
/// spread datagram reception across cores without `SO_REUSEPORT`.
fn input_task_count() -> usize {
    num_cpus::get().max(1)
}

/// Binds a UDP socket to `addr`'s port on all interfaces and, for an IPv4
/// multicast address, joins that group so packets sent to it arrive here.
async fn bind_multicast(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
    let socket = UdpSocket::bind(bind_addr).await?;
    if let IpAddr::V4(group) = addr.ip() {
        if group.is_multicast() {
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        }
    }
    Ok(socket)
}

/// Spawns every network-facing task (spec.md §5's thread/task inventory,
/// minus the sample processor and demodulator threads the `Receiver`
/// itself owns) and blocks until the process receives a shutdown signal.
pub async fn run(
    config: Arc<Config>,
    receiver: Arc<Receiver>,
    queue: Arc<PacketQueue>,
) -> anyhow::Result<()> {
    spawn_sample_processor(receiver.clone());

    spawn_rtp_input(config.clone(), queue).await?;
    spawn_status_publisher(config.clone(), receiver.clone());
    spawn_status_listener(config.clone(), receiver.clone()).await?;
    spawn_rtcp_emitter(config.clone(), receiver.clone());

    if let Some(command) = config.doppler.command.clone() {
        spawn_doppler_tracker(command, receiver.clone());
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");
    Ok(())
}

/// Dedicated thread draining the packet queue through the sample
/// processor (spec.md §5 "Sample processor"). It only ever suspends on
/// the queue's own condvar, so there is nothing further to cancel; it
/// exits when the process does.
fn spawn_sample_processor(receiver: Arc<Receiver>) {
    let processor = receiver.processor();
    std::thread::Builder::new()
        .name("radiod-sampleproc".into())
        .spawn(move || loop {
            processor.lock().process_one();
        })
        .expect("spawn sample processor thread");
}

/// Binds the RTP input multicast socket and fans its reads out across
/// `input_task_count()` tasks racing on the same socket (spec.md §4.1).
async fn spawn_rtp_input(config: Arc<Config>, queue: Arc<PacketQueue>) -> anyhow::Result<()> {
    let socket = Arc::new(bind_multicast(config.network.input_group).await?);
    log::info!("RTP input listening on {}", config.network.input_group);

    for _ in 0..input_task_count() {
        let socket = socket.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (size, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("RTP input recv failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                match parse_iq_datagram(&buf[..size]) {
                    Some(packet) => queue.push(packet, from),
                    None => log::trace!("dropped malformed/unsupported RTP packet from {from}"),
                }
            }
        });
    }

    Ok(())
}

/// Emits a status TLV response packet every `update_interval_ms`
/// milliseconds to the output group's status port (spec.md §4.8).
fn spawn_status_publisher(config: Arc<Config>, receiver: Arc<Receiver>) {
    let dest = config.status_addr();
    let period = Duration::from_millis(config.update_interval_ms.max(1));

    tokio::spawn(async move {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(s) => s,
            Err(e) => {
                log::error!("status publisher socket bind failed: {e}");
                return;
            }
        };

        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let packet = receiver.publish_status();
            if let Err(e) = socket.send_to(&packet, dest).await {
                log::warn!("status publish send failed: {e}");
            }
        }
    });
}

/// Listens for inbound command TLV packets on the same status port
/// (spec.md §4.8/§6: "Command stream: same encoding, inbound on
/// port+2") and applies any recognized command to the receiver.
async fn spawn_status_listener(config: Arc<Config>, receiver: Arc<Receiver>) -> anyhow::Result<()> {
    let socket = bind_multicast(config.status_addr()).await?;
    log::info!("status/command listener on {}", config.status_addr());

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (size, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("status listener recv failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let Some(message) = decode_message(&buf[..size]) else {
                log::trace!("dropped malformed command packet from {from}");
                continue;
            };
            if !message.is_command {
                continue;
            }

            for command in commands_from_message(&message) {
                receiver.apply_command(command);
            }
        }
    });

    Ok(())
}

/// Emits a compound RTCP sender-report + SDES packet every second
/// (spec.md §4.9).
fn spawn_rtcp_emitter(config: Arc<Config>, receiver: Arc<Receiver>) {
    let dest = config.rtcp_addr();

    tokio::spawn(async move {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(s) => s,
            Err(e) => {
                log::error!("RTCP emitter socket bind failed: {e}");
                return;
            }
        };

        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;

            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            let ntp_time = ntp_timestamp(now.as_secs() + NTP_UNIX_DELTA, now.subsec_nanos());
            let (packets, bytes) = receiver.pcm_totals();

            let sr = SenderReport {
                ssrc: receiver.ssrc(),
                ntp_time,
                rtp_time: receiver.audio_timestamp(),
                packet_count: packets.min(u32::MAX as u64) as u32,
                octet_count: bytes.min(u32::MAX as u64) as u32,
            };
            let sdes = SourceDescription {
                cname: format!("radiod@{}", std::process::id()),
                name: Some("radiod".to_string()),
                email: None,
                tool: Some(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()),
            };

            let packet = encode_compound(&sr, &sdes);
            if let Err(e) = socket.send_to(&packet, dest).await {
                log::warn!("RTCP send failed: {e}");
            }
        }
    });
}

/// Runs the configured Doppler-tracking child process and feeds each
/// line of its stdout, parsed as a frequency in Hz, to the Doppler
/// oscillator (spec.md §5 "Doppler tracker", out of scope beyond
/// consuming its output). Restarts the child if it exits; never fatal
/// to the receiver (spec.md §7 "Tuner unreachable... best-effort").
fn spawn_doppler_tracker(command: String, receiver: Arc<Receiver>) {
    tokio::spawn(async move {
        loop {
            let mut child = match TokioCommand::new("sh")
                .arg("-c")
                .arg(&command)
                .stdout(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    log::error!("doppler tracker command failed to start: {e}");
                    return;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                log::error!("doppler tracker child produced no stdout pipe");
                return;
            };
            let mut lines = BufReader::new(stdout).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                match line.trim().parse::<f64>() {
                    Ok(hz) => receiver.set_doppler_frequency(hz),
                    Err(_) => log::warn!("doppler tracker: unparsable line {line:?}"),
                }
            }

            log::warn!("doppler tracker child exited, restarting in 1s");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_task_count_is_at_least_one() {
        assert!(input_task_count() >= 1);
    }

    #[tokio::test]
    async fn bind_multicast_joins_multicast_group() {
        let addr: SocketAddr = "239.1.2.1:0".parse().unwrap();
        let socket = bind_multicast(addr).await.unwrap();
        assert!(socket.local_addr().is_ok());
    }

    #[tokio::test]
    async fn bind_multicast_skips_join_for_unicast() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = bind_multicast(addr).await.unwrap();
        assert!(socket.local_addr().is_ok());
    }
}
