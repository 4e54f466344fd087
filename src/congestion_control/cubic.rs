// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;
use log::*;

use super::cubic_window::BICTCP_BETA_SCALE;
use super::cubic_window::BICTCP_HZ;
use super::AckOutcome;
use super::AckSample;
use super::CongestionController;
use super::CongestionStats;
use super::CubeRootMethod;
use super::CubicWindow;
use super::Hystart;
use super::HystartDelayThresh;
use super::HystartMode;
use super::RttStats;
use super::HYSTART_MIN_SAMPLES;
use crate::Config;
use crate::MIN_CONGESTION_WINDOW;

/// Cubic Configuration.
///
/// An immutable snapshot of [`Config`] with the fixed point scale factors
/// precomputed. Controllers share it through an `Arc`; administrative
/// updates build a new snapshot.
#[derive(Debug, Clone)]
pub struct CubicConfig {
    /// Enable fast convergence.
    pub(crate) fast_convergence: bool,

    /// Multiplicative decrease factor, over `BICTCP_BETA_SCALE`.
    pub(crate) beta: u32,

    /// `8 * (1024 + beta) / 3 / (1024 - beta)`, the Reno-equivalent ACK
    /// scale.
    pub(crate) beta_scale: u32,

    /// `bic_scale * 10`, the cubic coefficient over an RTT of 100ms.
    pub(crate) cube_rtt_scale: u32,

    /// `2^40 / (bic_scale * 10)`, the scale used to solve `K`.
    pub(crate) cube_factor: u64,

    /// Initial slow start threshold in packets, `0` if unset.
    pub(crate) initial_ssthresh: u32,

    /// Enable the Reno-friendly region.
    pub(crate) tcp_friendliness: bool,

    /// Enable HyStart.
    pub(crate) hystart: bool,

    /// Enabled HyStart detection mechanisms.
    pub(crate) hystart_detect: BitFlags<HystartMode>,

    /// Lower bound of cwnd for HyStart, in packets.
    pub(crate) hystart_low_window: u32,

    /// Spacing between ACKs indicating a train, in milliseconds.
    pub(crate) hystart_ack_delta: u32,

    /// Lower bound of the delay threshold, `ms << 3`.
    pub(crate) hystart_delay_lower: u32,

    /// Upper bound of the delay threshold, `ms << 3`.
    pub(crate) hystart_delay_upper: u32,

    /// Derivation of the delay threshold.
    pub(crate) hystart_delay_thresh: HystartDelayThresh,

    /// Coefficient of the RTT standard deviation.
    pub(crate) hystart_stddev_k: f64,

    /// Method for solving `K`.
    pub(crate) cube_root: CubeRootMethod,

    /// Initial congestion window in packets.
    pub(crate) initial_congestion_window: u32,
}

impl CubicConfig {
    pub fn from(conf: &Config) -> Self {
        let beta = conf.beta.clamp(1, BICTCP_BETA_SCALE - 1);
        let bic_scale = conf.bic_scale.max(1);

        let beta_scale = 8 * (BICTCP_BETA_SCALE + beta) / 3 / (BICTCP_BETA_SCALE - beta);
        let cube_rtt_scale = bic_scale.saturating_mul(10);
        let cube_factor = (1_u64 << (10 + 3 * BICTCP_HZ)) / cube_rtt_scale as u64;

        let hystart_delay_upper = if conf.hystart_delay_max {
            conf.hystart_delay_upper
        } else {
            u32::MAX
        };

        Self {
            fast_convergence: conf.fast_convergence,
            beta,
            beta_scale,
            cube_rtt_scale,
            cube_factor,
            initial_ssthresh: conf.initial_ssthresh,
            tcp_friendliness: conf.tcp_friendliness,
            hystart: conf.hystart,
            hystart_detect: BitFlags::from_bits_truncate(conf.hystart_detect),
            hystart_low_window: conf.hystart_low_window,
            hystart_ack_delta: conf.hystart_ack_delta,
            hystart_delay_lower: conf.hystart_delay_lower,
            hystart_delay_upper,
            hystart_delay_thresh: conf.hystart_delay_thresh,
            hystart_stddev_k: conf.hystart_stddev_k,
            cube_root: conf.cube_root,
            initial_congestion_window: conf.initial_congestion_window.max(MIN_CONGESTION_WINDOW),
        }
    }

    pub fn beta_scale(&self) -> u32 {
        self.beta_scale
    }

    pub fn cube_rtt_scale(&self) -> u32 {
        self.cube_rtt_scale
    }

    pub fn cube_factor(&self) -> u64 {
        self.cube_factor
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Cubic congestion control algorithm with HyStart.
///
/// See <https://www.rfc-editor.org/rfc/rfc9438.html>.
#[derive(Debug)]
pub struct Cubic {
    /// Configuration.
    config: Arc<CubicConfig>,

    /// Cubic window state.
    window: CubicWindow,

    /// HyStart object.
    hystart: Hystart,

    /// RTT mean and variance.
    rtt_stats: RttStats,

    /// Congestion window in packets.
    cwnd: u32,

    /// Slow start threshold in packets.
    ssthresh: u32,

    /// Packets ACKed toward the next additive increase.
    cwnd_cnt: u32,

    /// Highest sequence number sent.
    snd_nxt: u64,

    /// Sent time of the last packet.
    last_sent_time: Option<Instant>,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl Cubic {
    pub fn new(config: Arc<CubicConfig>) -> Self {
        let ssthresh = if !config.hystart && config.initial_ssthresh != 0 {
            config.initial_ssthresh
        } else {
            u32::MAX
        };

        Self {
            cwnd: config.initial_congestion_window,
            ssthresh,
            config,
            window: CubicWindow::new(),
            hystart: Hystart::new(),
            rtt_stats: RttStats::new(),
            cwnd_cnt: 0,
            snd_nxt: 0,
            last_sent_time: None,
            stats: Default::default(),
        }
    }

    pub fn window(&self) -> &CubicWindow {
        &self.window
    }

    pub fn hystart(&self) -> &Hystart {
        &self.hystart
    }

    pub fn rtt_stats(&self) -> &RttStats {
        &self.rtt_stats
    }

    fn hystart_enabled(&self) -> bool {
        self.config.hystart && !self.config.hystart_detect.is_empty()
    }

    /// RTT standard deviation for the delay threshold, if enough samples
    /// exist. An impossible variance falls back to the baseline threshold.
    fn rtt_stddev(&mut self) -> Option<u64> {
        if self.rtt_stats.count() < HYSTART_MIN_SAMPLES as u64 {
            return None;
        }

        match self.rtt_stats.stddev() {
            Ok(stddev) => Some(stddev),
            Err(e) => {
                warn!("{} rtt stats anomaly: {:?}", self.name(), e);
                self.stats.variance_anomalies = self.stats.variance_anomalies.saturating_add(1);
                None
            }
        }
    }

    /// Process one RTT sample: connection minimum delay, then HyStart.
    fn on_rtt_sample(&mut self, rtt: Duration, now: Instant, outcome: &mut AckOutcome) {
        self.rtt_stats.update(rtt);

        // Discard delay samples right after a congestion event.
        if self.window.in_recovery_hold(now) {
            return;
        }

        let delay = u32::try_from(rtt.as_micros() * 8 / 1000)
            .unwrap_or(u32::MAX)
            .max(1);
        self.window.update_delay_min(delay);

        if !self.hystart_enabled()
            || !self.in_slow_start()
            || self.cwnd < self.config.hystart_low_window
        {
            return;
        }

        let stddev = self.rtt_stddev();
        let fired = self.hystart.update(
            &self.config,
            now,
            delay,
            self.window.delay_min(),
            stddev,
        );

        for mode in fired.iter() {
            let cwnd = self.cwnd as u64;
            match mode {
                HystartMode::AckTrain => {
                    self.stats.hystart_train_detect += 1;
                    self.stats.hystart_train_cwnd =
                        self.stats.hystart_train_cwnd.saturating_add(cwnd);
                }
                HystartMode::Delay => {
                    self.stats.hystart_delay_detect += 1;
                    self.stats.hystart_delay_cwnd =
                        self.stats.hystart_delay_cwnd.saturating_add(cwnd);
                }
            }

            trace!(
                "{} hystart exit by {:?}: cwnd={} delay={} delay_min={} stddev={:?}",
                self.name(),
                mode,
                self.cwnd,
                delay,
                self.window.delay_min(),
                stddev
            );
            self.ssthresh = self.cwnd;
        }

        if !fired.is_empty() {
            outcome.detected |= fired;
            outcome.hystart_cwnd = self.cwnd;
        }
    }

    /// Reno slow start. Returns the ACKed packets left over beyond ssthresh.
    fn slow_start(&mut self, acked: u32) -> u32 {
        let cwnd = self.cwnd.saturating_add(acked).min(self.ssthresh);
        let used = cwnd - self.cwnd;
        self.cwnd = cwnd;
        acked - used
    }

    /// Additive increase of one packet per `cnt` ACKed packets.
    fn cong_avoid_ai(&mut self, cnt: u32, acked: u32) {
        if self.cwnd_cnt >= cnt {
            self.cwnd_cnt = 0;
            self.cwnd = self.cwnd.saturating_add(1);
        }

        self.cwnd_cnt = self.cwnd_cnt.saturating_add(acked);
        if self.cwnd_cnt >= cnt {
            let delta = self.cwnd_cnt / cnt;
            self.cwnd_cnt -= delta * cnt;
            self.cwnd = self.cwnd.saturating_add(delta);
        }
    }
}

impl CongestionController for Cubic {
    fn name(&self) -> &str {
        "CUBIC"
    }

    fn on_sent(&mut self, now: Instant, seq: u64, packets_in_flight: u32) {
        // Follow the cubic curve after an idle period.
        if packets_in_flight == 0 {
            if let Some(last_sent_time) = self.last_sent_time {
                self.on_idle_resume(now.saturating_duration_since(last_sent_time), now);
            }
        }

        self.last_sent_time = Some(now);
        self.snd_nxt = self.snd_nxt.max(seq);

        self.stats.packets_sent_in_total = self.stats.packets_sent_in_total.saturating_add(1);
        if self.in_slow_start() {
            self.stats.packets_sent_in_slow_start =
                self.stats.packets_sent_in_slow_start.saturating_add(1);
        }
    }

    fn on_ack(&mut self, ack: &AckSample) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let cwnd = self.cwnd;
        let ssthresh = self.ssthresh;

        // Statistics.
        let acked = ack.acked as u64;
        self.stats.packets_acked_in_total = self.stats.packets_acked_in_total.saturating_add(acked);
        if self.in_slow_start() {
            self.stats.packets_acked_in_slow_start =
                self.stats.packets_acked_in_slow_start.saturating_add(acked);
        }

        if self.hystart_enabled() && self.in_slow_start() && self.hystart.is_new_round(ack.ack_seq)
        {
            self.hystart.reset_round(ack.time, self.snd_nxt);
            trace!(
                "{} hystart round start: end_seq={} cwnd={}",
                self.name(),
                self.snd_nxt,
                self.cwnd
            );
        }

        match ack.rtt {
            Some(rtt) => self.on_rtt_sample(rtt, ack.time, &mut outcome),
            None => {
                self.stats.rtt_samples_discarded = self.stats.rtt_samples_discarded.saturating_add(1)
            }
        }

        if !ack.app_limited && ack.acked > 0 {
            let mut acked = ack.acked;
            if self.in_slow_start() {
                acked = self.slow_start(acked);
            }

            if acked > 0 {
                self.window.update(&self.config, self.cwnd, acked, ack.time);
                self.cong_avoid_ai(self.window.cnt(), acked);
            }
        }

        outcome.cwnd_increment = self.cwnd.saturating_sub(cwnd);
        if self.ssthresh != ssthresh {
            outcome.ssthresh = Some(self.ssthresh);
        }

        outcome
    }

    fn on_congestion_event(&mut self, now: Instant) -> u32 {
        self.ssthresh = self.window.recalc_ssthresh(&self.config, self.cwnd);

        trace!(
            "{} congestion event: cwnd={} ssthresh={} last_max_cwnd={}",
            self.name(),
            self.cwnd,
            self.ssthresh,
            self.window.last_max_cwnd()
        );

        self.cwnd = self.ssthresh;
        self.cwnd_cnt = 0;
        self.hystart.on_congestion_event();
        self.hystart.reset_round(now, self.snd_nxt);
        self.stats.congestion_events = self.stats.congestion_events.saturating_add(1);

        self.ssthresh
    }

    fn on_idle_resume(&mut self, idle: Duration, now: Instant) {
        self.window.on_idle_resume(idle, now);
    }

    fn on_loss_state_enter(&mut self, now: Instant) {
        self.ssthresh = self.window.recalc_ssthresh(&self.config, self.cwnd);

        trace!(
            "{} loss state: cwnd={} ssthresh={}",
            self.name(),
            self.cwnd,
            self.ssthresh
        );

        self.window.reset();
        self.hystart = Hystart::new();
        self.hystart.reset_round(now, self.snd_nxt);
        self.rtt_stats.reset();
        self.cwnd = MIN_CONGESTION_WINDOW;
        self.cwnd_cnt = 0;
        self.stats.loss_state_events = self.stats.loss_state_events.saturating_add(1);
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn congestion_window(&self) -> u32 {
        self.cwnd
    }

    fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    fn set_config(&mut self, config: Arc<CubicConfig>) {
        self.config = config;
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}
