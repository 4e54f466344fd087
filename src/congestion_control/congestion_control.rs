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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use enumflags2::BitFlags;

pub use cubic::Cubic;
pub use cubic::CubicConfig;
pub use cubic_window::cube_root;
pub use cubic_window::cube_root_newton;
pub use cubic_window::CubeRootMethod;
pub use cubic_window::CubicWindow;
pub use hystart::Hystart;
pub use hystart::HystartDelayThresh;
pub use hystart::HystartMode;
pub use hystart::HYSTART_DELAY_MAX;
pub use hystart::HYSTART_DELAY_MIN;
pub use hystart::HYSTART_MIN_SAMPLES;
pub use rtt_stats::isqrt;
pub use rtt_stats::RttStats;

/// Congestion control mode.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CongestionMode {
    /// The window grows by the ACKed packets, until ssthresh.
    SlowStart,

    /// The window follows the cubic function.
    CongestionAvoidance,
}

/// An acknowledgment delivered by the host.
#[derive(Debug, Clone, Copy)]
pub struct AckSample {
    /// Highest sequence number covered by the ACK.
    pub ack_seq: u64,

    /// Number of packets newly ACKed.
    pub acked: u32,

    /// RTT sample. `None` if the ACK carries no usable timestamp, such as
    /// for duplicates.
    pub rtt: Option<Duration>,

    /// Time the ACK was received.
    pub time: Instant,

    /// The sender was not limited by the congestion window.
    pub app_limited: bool,
}

/// Observability signal emitted when HyStart ends slow start.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum HystartSignal {
    /// ACK train detected, with the cwnd at detection time.
    AckTrainDetected { cwnd: u32 },

    /// Delay increase detected, with the cwnd at detection time.
    DelayIncreaseDetected { cwnd: u32 },
}

/// Decisions taken on one ACK.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Packets added to the congestion window.
    pub cwnd_increment: u32,

    /// New slow start threshold, if it changed.
    pub ssthresh: Option<u32>,

    /// HyStart mechanisms that fired on this ACK.
    pub detected: BitFlags<HystartMode>,

    /// Congestion window when HyStart fired.
    pub hystart_cwnd: u32,
}

impl AckOutcome {
    /// HyStart signals raised by this ACK.
    pub fn signals(&self) -> impl Iterator<Item = HystartSignal> + '_ {
        self.detected.iter().map(move |mode| match mode {
            HystartMode::AckTrain => HystartSignal::AckTrainDetected {
                cwnd: self.hystart_cwnd,
            },
            HystartMode::Delay => HystartSignal::DelayIncreaseDetected {
                cwnd: self.hystart_cwnd,
            },
        })
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Total packets sent.
    pub packets_sent_in_total: u64,

    /// Total packets sent in slow start.
    pub packets_sent_in_slow_start: u64,

    /// Total packets acked.
    pub packets_acked_in_total: u64,

    /// Total packets acked in slow start.
    pub packets_acked_in_slow_start: u64,

    /// Congestion events.
    pub congestion_events: u64,

    /// Entries into the loss state.
    pub loss_state_events: u64,

    /// Slow start exits by ACK train detection.
    pub hystart_train_detect: u64,

    /// Sum of cwnd at ACK train detection.
    pub hystart_train_cwnd: u64,

    /// Slow start exits by delay increase detection.
    pub hystart_delay_detect: u64,

    /// Sum of cwnd at delay increase detection.
    pub hystart_delay_cwnd: u64,

    /// ACKs without a usable RTT sample.
    pub rtt_samples_discarded: u64,

    /// Impossible RTT variance values.
    pub variance_anomalies: u64,
}

/// Congestion control interfaces.
pub trait CongestionController {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Callback after packet `seq` was sent out. `packets_in_flight` does
    /// not include the packet.
    fn on_sent(&mut self, now: Instant, seq: u64, packets_in_flight: u32);

    /// Callback for processing an ACK.
    fn on_ack(&mut self, ack: &AckSample) -> AckOutcome;

    /// Congestion event, such as a loss or an ECN mark. Returns the new
    /// ssthresh.
    fn on_congestion_event(&mut self, now: Instant) -> u32;

    /// The sender resumes after being idle for `idle`.
    fn on_idle_resume(&mut self, idle: Duration, now: Instant);

    /// Enter the loss state after a retransmission timeout.
    fn on_loss_state_enter(&mut self, now: Instant);

    /// Check if in slow start.
    fn in_slow_start(&self) -> bool;

    /// Current mode.
    fn mode(&self) -> CongestionMode {
        if self.in_slow_start() {
            CongestionMode::SlowStart
        } else {
            CongestionMode::CongestionAvoidance
        }
    }

    /// Current congestion window in packets.
    fn congestion_window(&self) -> u32;

    /// Current slow start threshold in packets.
    fn ssthresh(&self) -> u32;

    /// Replace the configuration snapshot. Takes effect from the next event.
    fn set_config(&mut self, config: Arc<CubicConfig>);

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller.")
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &Arc<CubicConfig>) -> Box<dyn CongestionController> {
    Box::new(Cubic::new(conf.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn congestion_control_build() {
        let conf = Arc::new(CubicConfig::from(&Config::new()));
        let mut cc = build_congestion_controller(&conf);

        assert_eq!(cc.name(), "CUBIC");
        assert_eq!(cc.congestion_window(), 10);
        assert_eq!(cc.mode(), CongestionMode::SlowStart);
        assert_eq!(format!("{:?}", cc), "congestion controller.");

        let now = Instant::now();
        let ssthresh = cc.on_congestion_event(now);
        assert_eq!(ssthresh, 7);
        assert_eq!(cc.mode(), CongestionMode::CongestionAvoidance);
        assert_eq!(cc.stats().congestion_events, 1);
    }

    #[test]
    fn ack_outcome_signals() {
        let outcome = AckOutcome::default();
        assert_eq!(outcome.signals().count(), 0);

        let outcome = AckOutcome {
            detected: HystartMode::AckTrain | HystartMode::Delay,
            hystart_cwnd: 42,
            ..Default::default()
        };
        assert_eq!(
            outcome.signals().collect::<Vec<_>>(),
            vec![
                HystartSignal::AckTrainDetected { cwnd: 42 },
                HystartSignal::DelayIncreaseDetected { cwnd: 42 },
            ]
        );
    }

    #[test]
    fn congestion_controllers_are_independent() {
        let conf = Arc::new(CubicConfig::from(&Config::new()));
        let mut a = build_congestion_controller(&conf);
        let b = build_congestion_controller(&conf);
        let now = Instant::now();

        a.on_ack(&AckSample {
            ack_seq: 1,
            acked: 3,
            rtt: Some(Duration::from_millis(20)),
            time: now,
            app_limited: false,
        });
        assert_eq!(a.congestion_window(), 13);
        assert_eq!(b.congestion_window(), 10);
        assert_eq!(Arc::strong_count(&conf), 3);
    }
}

mod cubic;
mod cubic_window;
mod hystart;
mod rtt_stats;
