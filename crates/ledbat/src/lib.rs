//! LEDBAT congestion controller per [RFC6817].
//!
//! One instance per remote peer on a datagram transport. The controller gates
//! sending on the congestion window and a congestion timeout (CTO), and
//! adjusts the window from one-way delay samples carried in ACKs. The CTO is
//! estimated per [RFC6298] from round-trip samples, with samples from
//! retransmitted packets excluded (Karn's algorithm).

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

/// Controller parameters. Defaults follow the RFC recommendations with an
/// Ethernet-MTU segment size.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Sender's maximum segment size, bytes.
    pub mss: u64,
    /// Target queuing delay, milliseconds. Per [RFC6817] must be <= 100 ms.
    pub target_ms: f64,
    /// Congestion window to delay response rate.
    pub gain: f64,
    /// Multiples of MSS the window may exceed flightsize by.
    pub allowed_increase: u64,
    /// Initial congestion window, in MSSes.
    pub init_cwnd: u64,
    /// Window floor, in MSSes.
    pub min_cwnd: u64,
    /// Number of per-minute delay minima kept.
    pub base_history: usize,
    /// Number of recent delay samples kept.
    pub current_filter: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1500,
            target_ms: 50.0,
            gain: 1.0,
            allowed_increase: 1,
            init_cwnd: 2,
            min_cwnd: 2,
            base_history: 10,
            current_filter: 8,
        }
    }
}

/// Why a send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No ACK within the congestion timeout.
    Cto,
    /// The congestion window is full.
    Cwnd,
}

// [RFC6298] constants.
const COEF_G: f64 = 0.1;
const COEF_K: f64 = 4.0;
// alpha, beta per Jacobson, "Congestion avoidance and control".
const COEF_ALPHA: f64 = 0.125;
const COEF_BETA: f64 = 0.25;

const BASE_ROLLOVER_SECS: u64 = 60;

pub struct LedbatController {
    config: Config,
    current_delays: VecDeque<f64>,
    base_delays: VecDeque<f64>,
    last_rollover: Instant,
    flightsize: u64,
    cwnd: f64,
    /// Congestion timeout, seconds.
    cto: f64,
    queuing_delay: f64,
    rtt: Option<f64>,
    srtt: f64,
    rttvar: f64,
    rt_measured: bool,
    last_ack_received: Option<Instant>,
    last_send_time: Option<Instant>,
    last_cto_fail_time: Option<Instant>,
    in_cto: bool,
    last_data_loss: Option<Instant>,
}

impl LedbatController {
    pub fn new(config: Config) -> Self {
        let current_delays = std::iter::repeat_n(1_000_000.0, config.current_filter).collect();
        let base_delays = std::iter::repeat_n(f64::INFINITY, config.base_history).collect();
        Self {
            config,
            current_delays,
            base_delays,
            last_rollover: Instant::now(),
            flightsize: 0,
            cwnd: (config.init_cwnd * config.mss) as f64,
            cto: 1.0,
            queuing_delay: 0.0,
            rtt: None,
            srtt: 0.0,
            rttvar: 0.0,
            rt_measured: false,
            last_ack_received: None,
            last_send_time: None,
            last_cto_fail_time: None,
            in_cto: false,
            last_data_loss: None,
        }
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd as u64
    }

    pub fn flightsize(&self) -> u64 {
        self.flightsize
    }

    pub fn cto(&self) -> f64 {
        self.cto
    }

    pub fn queuing_delay_ms(&self) -> f64 {
        self.queuing_delay
    }

    /// Latest round-trip estimate, seconds. 0 until measured.
    pub fn rtt(&self) -> f64 {
        self.rtt.unwrap_or(0.0)
    }

    pub fn srtt(&self) -> Option<f64> {
        self.rt_measured.then_some(self.srtt)
    }

    pub fn rttvar(&self) -> Option<f64> {
        self.rt_measured.then_some(self.rttvar)
    }

    pub fn last_ack_received(&self) -> Option<Instant> {
        self.last_ack_received
    }

    /// Gate a send of `data_len` bytes. On success flightsize is charged and
    /// the send must happen.
    pub fn try_send(&mut self, data_len: u64) -> Result<(), DenyReason> {
        let now = Instant::now();

        // By definition we can always send the first segment.
        let Some(_) = self.last_send_time else {
            self.flightsize += data_len;
            self.last_send_time = Some(now);
            return Ok(());
        };

        if let Some(last_ack) = self.last_ack_received {
            if self.in_cto {
                if now.duration_since(last_ack).as_secs_f64() < self.cto {
                    // ACKs arrived within the CTO window again.
                    self.in_cto = false;
                } else if let Some(fail) = self.last_cto_fail_time {
                    if fail.elapsed().as_secs_f64() < self.cto {
                        return Err(DenyReason::Cto);
                    }
                    self.in_cto = false;
                }
            } else {
                let ack_overdue = now.duration_since(last_ack).as_secs_f64() > self.cto;
                // Allow some time after leaving CTO for ACKs to arrive.
                let recently_sending = self
                    .last_send_time
                    .is_some_and(|t| now.duration_since(t).as_secs_f64() < 2.0 * self.rtt());
                if ack_overdue && recently_sending {
                    let cto_expired = self
                        .last_cto_fail_time
                        .is_none_or(|t| t.elapsed().as_secs_f64() > self.cto);
                    if cto_expired {
                        self.last_cto_fail_time = Some(now);
                        self.no_ack_in_cto();
                    }
                    self.in_cto = true;
                    return Err(DenyReason::Cto);
                }
            }
        }

        if self.flightsize + data_len <= self.cwnd as u64 {
            self.flightsize += data_len;
            self.last_send_time = Some(now);
            Ok(())
        } else {
            Err(DenyReason::Cwnd)
        }
    }

    /// Feed ACK information: bytes newly acknowledged, one-way delay samples
    /// (milliseconds, oldest first) and round-trip samples (seconds, oldest
    /// first, retransmitted packets already excluded).
    pub fn on_ack(&mut self, bytes_acked: Option<u64>, one_way_delays_ms: &[f64], rtts_s: &[f64]) {
        self.last_ack_received = Some(Instant::now());

        for &delay in one_way_delays_ms {
            self.update_base_delay(delay);
            self.update_current_delay(delay);
        }

        let bytes_newly_acked =
            bytes_acked.unwrap_or(one_way_delays_ms.len() as u64 * self.config.mss);

        self.queuing_delay = self.filter_current() - self.min_base();
        let off_target = (self.config.target_ms - self.queuing_delay) / self.config.target_ms;
        self.cwnd +=
            self.config.gain * off_target * bytes_newly_acked as f64 * self.config.mss as f64
                / self.cwnd;
        let max_allowed_cwnd = (self.flightsize + self.config.allowed_increase * self.config.mss) as f64;
        self.cwnd = self.cwnd.min(max_allowed_cwnd);
        self.cwnd = self.cwnd.max((self.config.min_cwnd * self.config.mss) as f64);
        self.flightsize = self.flightsize.saturating_sub(bytes_newly_acked);

        self.update_cto(rtts_s);
    }

    /// Reduce the window on inferred data loss; no-op if loss was already
    /// handled within the last RTT.
    pub fn on_data_loss(&mut self, will_retransmit: bool, loss_size: Option<u64>) {
        let now = Instant::now();
        let loss_size = loss_size.unwrap_or(self.config.mss);

        if let Some(last) = self.last_data_loss {
            if now.duration_since(last).as_secs_f64() < self.rtt() {
                return;
            }
        }
        self.last_data_loss = Some(now);

        let floor = (self.config.min_cwnd * self.config.mss) as f64;
        self.cwnd = self.cwnd.min((self.cwnd / 2.0).max(floor));
        debug!(cwnd = self.cwnd as u64, "data loss, window halved");

        if !will_retransmit {
            self.flightsize = self.flightsize.saturating_sub(loss_size);
        }
    }

    fn no_ack_in_cto(&mut self) {
        self.cwnd = self.config.mss as f64;
        self.cto *= 2.0;
        debug!(cto = self.cto, "no ACK within CTO");
    }

    fn update_cto(&mut self, rtt_values: &[f64]) {
        // Karn's algorithm: nothing valid to measure from.
        let Some(rtt) = rtt_values.iter().copied().reduce(f64::min) else {
            return;
        };

        if !self.rt_measured {
            self.srtt = rtt;
            self.rttvar = rtt / 2.0;
            self.rt_measured = true;
        } else {
            self.rttvar = (1.0 - COEF_BETA) * self.rttvar + COEF_BETA * (self.srtt - rtt).abs();
            self.srtt = (1.0 - COEF_ALPHA) * self.srtt + COEF_ALPHA * rtt;
        }
        self.cto = self.srtt + (COEF_G).max(COEF_K * self.rttvar);

        // Per [RFC6298] §2.4.
        if self.cto < 1.0 {
            self.cto = 1.0;
        }
        self.rtt = Some(rtt);
    }

    // MIN filter over the newest ceil(base_history / 4) samples.
    fn filter_current(&self) -> f64 {
        let window = self.config.base_history.div_ceil(4);
        self.current_delays
            .iter()
            .rev()
            .take(window)
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    fn min_base(&self) -> f64 {
        self.base_delays
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    fn update_base_delay(&mut self, delay_ms: f64) {
        let now = Instant::now();
        if now.duration_since(self.last_rollover).as_secs() >= BASE_ROLLOVER_SECS {
            // Shift in a fresh minute slot.
            self.last_rollover = now;
            self.base_delays.pop_front();
            self.base_delays.push_back(delay_ms);
        } else {
            // Keep the minimum for the current minute in the newest slot.
            if let Some(last) = self.base_delays.back_mut() {
                *last = last.min(delay_ms);
            }
        }
    }

    fn update_current_delay(&mut self, delay_ms: f64) {
        self.current_delays.pop_front();
        self.current_delays.push_back(delay_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LedbatController {
        LedbatController::new(Config::default())
    }

    #[test]
    fn test_first_send_always_allowed() {
        let mut c = controller();
        assert!(c.try_send(1_000_000).is_ok());
        assert_eq!(c.flightsize(), 1_000_000);
    }

    #[test]
    fn test_cwnd_gates_sending() {
        let mut c = controller();
        // cwnd starts at 2 * MSS = 3000.
        assert!(c.try_send(1500).is_ok());
        assert!(c.try_send(1500).is_ok());
        assert_eq!(c.try_send(1500), Err(DenyReason::Cwnd));
    }

    #[test]
    fn test_target_tracking_keeps_window_bounded() {
        // Delay samples exactly at target: queuing delay reads ~0 and the
        // window never exceeds flightsize + allowed increase.
        let cfg = Config::default();
        let mut c = LedbatController::new(cfg);
        let floor = cfg.min_cwnd * cfg.mss;

        for _ in 0..40 {
            while c.try_send(cfg.mss).is_ok() {}
            let flight_at_ack = c.flightsize();
            c.on_ack(Some(cfg.mss), &[50.0], &[0.05]);
            assert!(c.cwnd() >= floor, "cwnd {} below floor", c.cwnd());
            assert!(
                c.cwnd() <= (flight_at_ack + cfg.mss).max(floor),
                "cwnd {} above flightsize {} + mss",
                c.cwnd(),
                flight_at_ack
            );
            assert!(c.queuing_delay_ms() <= 1.0);
        }
    }

    #[test]
    fn test_flightsize_never_negative() {
        let mut c = controller();
        assert!(c.try_send(100).is_ok());
        c.on_ack(Some(1_000_000), &[10.0], &[0.01]);
        assert_eq!(c.flightsize(), 0);
    }

    #[test]
    fn test_rfc6298_initial_measurement() {
        let mut c = controller();
        c.on_ack(Some(1500), &[10.0], &[0.2]);
        assert_eq!(c.srtt(), Some(0.2));
        assert_eq!(c.rttvar(), Some(0.1));
        // srtt + max(G, 4 * rttvar) = 0.2 + 0.4, above the 1 s floor anyway.
        assert!(c.cto() >= 1.0);
    }

    #[test]
    fn test_karns_algorithm_skips_empty_rtts() {
        let mut c = controller();
        c.on_ack(Some(1500), &[10.0], &[]);
        assert_eq!(c.srtt(), None);
        assert_eq!(c.cto(), 1.0);
    }

    #[test]
    fn test_data_loss_halves_window_once_per_rtt() {
        let mut c = controller();
        // Grow the window first so halving is visible above the floor.
        c.cwnd = (10 * 1500) as f64;
        c.rtt = Some(60.0);
        c.on_data_loss(true, None);
        assert_eq!(c.cwnd(), 5 * 1500);
        // A second loss within the same RTT is a no-op.
        c.on_data_loss(true, None);
        assert_eq!(c.cwnd(), 5 * 1500);
    }

    #[test]
    fn test_data_loss_without_retransmit_releases_flight() {
        let mut c = controller();
        assert!(c.try_send(3000).is_ok());
        c.on_data_loss(false, Some(1000));
        assert_eq!(c.flightsize(), 2000);
    }

    #[test]
    fn test_loss_respects_window_floor() {
        let mut c = controller();
        c.on_data_loss(true, None);
        assert_eq!(c.cwnd(), 2 * 1500);
    }
}
