//! Clock synchronization with the upstream sender
//!
//! A ping thread sends its realtime clock every 200 ms (±5 ms of jitter so
//! fleets do not phase-lock) and records `(t_tx, t_remote, t_rx)` triples
//! from the replies into a 100-deep window. From that window it estimates
//! one-way propagation from the minimum quintile of round trips, clock skew
//! from a masked linear regression, and folds both into a smoothed offset.
//! The packet engine reads the offset through [`SharedClock`] to schedule
//! playout on the sender's timeline.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::protocol::{TimingPing, TimingReply};
use crate::{PING_INTERVAL_MS, TIMING_WINDOW};

/// Realtime clock in nanoseconds since the Unix epoch.
pub fn realtime_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// The clock offset shared between the timing thread (writer) and the
/// playout worker (reader). A relaxed f64-bits atomic: updates land about
/// five times a second, so a torn read costs at most one frame period.
#[derive(Clone, Default)]
pub struct SharedClock {
    offset_bits: Arc<AtomicU64>,
}

impl SharedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset_ns(&self) -> f64 {
        f64::from_bits(self.offset_bits.load(Ordering::Relaxed))
    }

    fn set_offset_ns(&self, offset: f64) {
        self.offset_bits.store(offset.to_bits(), Ordering::Relaxed);
    }

    /// Our estimate of the sender's clock, in nanoseconds.
    pub fn host_time_ns(&self) -> u64 {
        (realtime_ns() as f64 + self.offset_ns()) as u64
    }
}

/// Rolling window of timing samples, newest first.
pub struct TimingWindow {
    t_txs: Vec<u64>,
    t_remotes: Vec<u64>,
    t_rxs: Vec<u64>,
    offset_ns: f64,
}

/// Minimum samples before estimates are trusted; below this the offset may
/// jump freely (warmup).
const MIN_SAMPLES: usize = 20;

/// Fraction of lowest round trips kept for the propagation estimate.
const MIN_QUINTILE: f64 = 0.2;

impl TimingWindow {
    pub fn new() -> Self {
        Self {
            t_txs: Vec::with_capacity(TIMING_WINDOW),
            t_remotes: Vec::with_capacity(TIMING_WINDOW),
            t_rxs: Vec::with_capacity(TIMING_WINDOW),
            offset_ns: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.t_rxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t_rxs.is_empty()
    }

    pub fn offset_ns(&self) -> f64 {
        self.offset_ns
    }

    /// Fold one reply into the estimate, then store the sample. Returns the
    /// updated offset when enough samples have accumulated.
    pub fn update(&mut self, t_tx: u64, t_remote: u64, t_rx: u64) -> Option<f64> {
        let updated = if self.len() > MIN_SAMPLES {
            // Propagation: half the mean of the lowest-quintile round trips.
            let trips: Vec<i64> = self
                .t_rxs
                .iter()
                .zip(&self.t_txs)
                .map(|(&rx, &tx)| rx as i64 - tx as i64)
                .collect();
            let mask = min_quintile_mask(&trips, MIN_QUINTILE);
            let t_prop = masked_mean(&trips, &mask) / 2.0;

            // Skew: regress the receive-vs-remote lag onto elapsed receive
            // time, then project to this reply's receive instant.
            let lags: Vec<i64> = self
                .t_rxs
                .iter()
                .zip(&self.t_remotes)
                .map(|(&rx, &rem)| rx as i64 - rem as i64)
                .collect();
            let (slope, intercept) = masked_linreg(&self.t_rxs, &lags, &mask);
            let oldest = *self.t_rxs.last().unwrap_or(&t_rx);
            let elapsed_s = (t_rx.saturating_sub(oldest)) as f64 / 1e9;
            let skew_estimate = elapsed_s * slope + intercept;

            let alpha = 0.99 * self.len() as f64 / TIMING_WINDOW as f64;
            self.offset_ns = alpha * self.offset_ns + (1.0 - alpha) * (skew_estimate + t_prop);
            trace!(
                "clock offset {:.3}ms (prop {:.3}ms, skew {:.3}ms)",
                self.offset_ns / 1e6,
                t_prop / 1e6,
                skew_estimate / 1e6
            );
            Some(self.offset_ns)
        } else {
            None
        };

        self.t_txs.insert(0, t_tx);
        self.t_remotes.insert(0, t_remote);
        self.t_rxs.insert(0, t_rx);
        self.t_txs.truncate(TIMING_WINDOW);
        self.t_remotes.truncate(TIMING_WINDOW);
        self.t_rxs.truncate(TIMING_WINDOW);

        updated
    }

    pub fn clear(&mut self) {
        self.t_txs.clear();
        self.t_remotes.clear();
        self.t_rxs.clear();
        self.offset_ns = 0.0;
    }
}

impl Default for TimingWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask selecting the lowest `proportion` of `values` (at least one).
fn min_quintile_mask(values: &[i64], proportion: f64) -> Vec<bool> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&i| values[i]);

    let keep = ((values.len() as f64 * proportion) as usize).max(1);
    let mut mask = vec![false; values.len()];
    for &i in order.iter().take(keep) {
        mask[i] = true;
    }
    mask
}

fn masked_mean(values: &[i64], mask: &[bool]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0.0;
    for (v, &m) in values.iter().zip(mask) {
        if m {
            sum += *v as f64;
            count += 1.0;
        }
    }
    if count == 0.0 {
        0.0
    } else {
        sum / count
    }
}

/// Least squares of `ys` against seconds elapsed since the oldest `xs`
/// entry, over the masked subset. Returns (slope per second, intercept).
fn masked_linreg(xs: &[u64], ys: &[i64], mask: &[bool]) -> (f64, f64) {
    let oldest = match xs.last() {
        Some(&v) => v,
        None => return (0.0, 0.0),
    };

    let mut n = 0.0;
    let (mut sumx, mut sumx2, mut sumxy, mut sumy) = (0.0, 0.0, 0.0, 0.0);
    for i in 0..xs.len() {
        if !mask[i] {
            continue;
        }
        let x = (xs[i].saturating_sub(oldest)) as f64 / 1e9;
        let y = ys[i] as f64;
        n += 1.0;
        sumx += x;
        sumx2 += x * x;
        sumxy += x * y;
        sumy += y;
    }

    let denom = n * sumx2 - sumx * sumx;
    if n < 2.0 || denom.abs() < f64::EPSILON {
        // Degenerate fit: fall back to the plain mean as intercept.
        let intercept = if n > 0.0 { sumy / n } else { 0.0 };
        return (0.0, intercept);
    }
    let slope = (n * sumxy - sumx * sumy) / denom;
    let intercept = (sumy * sumx2 - sumx * sumxy) / denom;
    (slope, intercept)
}

/// Spawn the timing thread: pings `upstream` every 200 ms ± 5 ms, folds
/// replies into `clock`, stops when `running` clears. The socket must carry
/// a short read timeout so the reply loop can observe its deadline.
pub fn spawn_timing_thread(
    socket: UdpSocket,
    upstream: SocketAddr,
    clock: SharedClock,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("timing".to_string())
        .spawn(move || {
            let mut window = TimingWindow::new();
            let mut buf = [0u8; TimingReply::SIZE];
            while running.load(Ordering::Relaxed) {
                let ping = TimingPing(realtime_ns());
                if let Err(e) = socket.send_to(&ping.to_bytes(), upstream) {
                    warn!("timing ping failed: {e}");
                }

                // Collect replies until the next ping is due.
                let jitter: i64 = rand::thread_rng().gen_range(-5..=5);
                let deadline = std::time::Instant::now()
                    + Duration::from_millis((PING_INTERVAL_MS as i64 + jitter) as u64);
                while std::time::Instant::now() < deadline {
                    match socket.recv_from(&mut buf) {
                        Ok((len, _)) => {
                            let t_rx = realtime_ns();
                            if let Some(reply) = TimingReply::from_bytes(&buf[..len]) {
                                if let Some(offset) =
                                    window.update(reply.echoed_tx_ns, reply.remote_ns, t_rx)
                                {
                                    clock.set_offset_ns(offset);
                                }
                            }
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!("timing recv failed: {e}");
                            break;
                        }
                    }
                }
            }
            debug!("timing thread finished");
        })
        .expect("failed to spawn timing thread")
}

/// Spawn the responder that answers timing pings with {echo, our clock}.
pub fn spawn_timing_responder(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("timing-pong".to_string())
        .spawn(move || {
            let mut buf = [0u8; TimingPing::SIZE];
            while running.load(Ordering::Relaxed) {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        if let Some(ping) = TimingPing::from_bytes(&buf[..len]) {
                            let reply = TimingReply {
                                echoed_tx_ns: ping.0,
                                remote_ns: realtime_ns(),
                            };
                            if let Err(e) = socket.send_to(&reply.to_bytes(), from) {
                                warn!("timing reply to {from} failed: {e}");
                            }
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!("timing responder recv failed: {e}");
                        break;
                    }
                }
            }
            debug!("timing responder finished");
        })
        .expect("failed to spawn timing responder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_clock_roundtrip() {
        let clock = SharedClock::new();
        assert_eq!(clock.offset_ns(), 0.0);
        clock.set_offset_ns(-1.5e6);
        assert_eq!(clock.offset_ns(), -1.5e6);
    }

    #[test]
    fn test_min_quintile_mask() {
        let values = vec![50, 10, 40, 20, 30, 60, 70, 80, 90, 100];
        let mask = min_quintile_mask(&values, 0.2);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 2);
        assert!(mask[1]); // 10
        assert!(mask[3]); // 20
    }

    #[test]
    fn test_masked_linreg_recovers_line() {
        // y = 3e-3 * x_seconds + 500 over 50 evenly spaced samples, oldest
        // last (window order).
        let n = 50;
        let xs: Vec<u64> = (0..n).map(|i| ((n - 1 - i) as u64) * 1_000_000_000).collect();
        let ys: Vec<i64> = xs
            .iter()
            .map(|&x| (3.0e-3 * (x as f64 / 1e9) + 500.0) as i64)
            .collect();
        let mask = vec![true; n];
        let (slope, intercept) = masked_linreg(&xs, &ys, &mask);
        assert!((slope - 3.0e-3).abs() < 1e-4, "slope {slope}");
        assert!((intercept - 500.0).abs() < 1.0, "intercept {intercept}");
    }

    #[test]
    fn test_window_warms_up_before_estimating() {
        let mut window = TimingWindow::new();
        for i in 0..MIN_SAMPLES as u64 {
            // Symmetric 2 ms round trip, remote clock 7 ms ahead.
            let t_tx = i * 200_000_000;
            let t_rx = t_tx + 2_000_000;
            let t_remote = t_tx + 1_000_000 + 7_000_000;
            assert_eq!(window.update(t_tx, t_remote, t_rx), None);
        }
        assert_eq!(window.len(), MIN_SAMPLES);
    }

    #[test]
    fn test_window_converges_to_constant_offset() {
        let mut window = TimingWindow::new();
        let mut last = None;
        for i in 0..200u64 {
            let t_tx = i * 200_000_000;
            let t_rx = t_tx + 2_000_000;
            let t_remote = t_tx + 1_000_000 + 7_000_000;
            if let Some(offset) = window.update(t_tx, t_remote, t_rx) {
                last = Some(offset);
            }
        }
        // lag = t_rx - t_remote = -6 ms; prop = +1 ms; offset -> -5 ms,
        // softened by the IIR memory.
        let offset = last.expect("window never produced an estimate");
        assert!(
            (-6.0e6..=-2.0e6).contains(&offset),
            "offset {offset} out of expected band"
        );
        assert_eq!(window.len(), TIMING_WINDOW);
    }

    #[test]
    fn test_timing_responder_answers() {
        let responder_sock = crate::network::transport::bind_udp(
            0,
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        let port = responder_sock.local_addr().unwrap().port();
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_timing_responder(responder_sock, running.clone());

        let client = crate::network::transport::bind_udp(
            0,
            Some(Duration::from_millis(500)),
        )
        .unwrap();
        let ping = TimingPing(12345);
        client
            .send_to(&ping.to_bytes(), format!("[::1]:{port}").parse::<SocketAddr>().unwrap())
            .unwrap();

        let mut buf = [0u8; TimingReply::SIZE];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let reply = TimingReply::from_bytes(&buf[..len]).unwrap();
        assert_eq!(reply.echoed_tx_ns, 12345);
        assert!(reply.remote_ns > 0);

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
