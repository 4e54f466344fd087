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

//! CUBIC window growth.
//!
//! The window follows `W(t) = C * (t - K)^3 + W_max`, evaluated in fixed
//! point. Time is measured in units of 1/1024 seconds (`BICTCP_HZ`), the
//! window in packets. The engine does not change the window itself: it
//! yields `cnt`, the number of ACKed packets after which the window grows by
//! one packet.
//!
//! See <https://www.rfc-editor.org/rfc/rfc9438.html>.

use core::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use log::*;
use serde::Deserialize;
use serde::Serialize;

use super::CubicConfig;
use crate::Error;
use crate::Result;

/// Fixed point scale of beta.
pub const BICTCP_BETA_SCALE: u32 = 1024;

/// Fixed point time unit of the cubic function, 2^10 per second.
pub const BICTCP_HZ: u32 = 10;

/// Clock ticks per second. One tick is one millisecond.
pub const HZ: u64 = 1000;

/// Divisor used when the window is already above the cubic curve.
const VERY_SMALL_INCREMENT: u32 = 100;

/// Upper bound of `cnt` while no congestion maximum is known.
const BOOTSTRAP_MAX_CNT: u32 = 20;

/// Lower bound of `cnt`. The window grows at most 1.5x per round trip.
const MIN_CNT: u32 = 2;

/// Methods for solving `K`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CubeRootMethod {
    /// Lookup table followed by one Newton-Raphson step. Average error is
    /// about 0.2%.
    #[default]
    Table,

    /// Newton-Raphson iteration to the exact floor.
    Newton,
}

impl FromStr for CubeRootMethod {
    type Err = Error;

    fn from_str(method: &str) -> Result<CubeRootMethod> {
        if method.eq_ignore_ascii_case("table") {
            Ok(CubeRootMethod::Table)
        } else if method.eq_ignore_ascii_case("newton") {
            Ok(CubeRootMethod::Newton)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

impl CubeRootMethod {
    pub fn cube_root(&self, a: u64) -> u32 {
        match self {
            CubeRootMethod::Table => cube_root(a),
            CubeRootMethod::Newton => cube_root_newton(a),
        }
    }
}

/// `cbrt(x << 18) - 1` for x in `[0, 63]`, refined by hand.
const CBRT_TABLE: [u8; 64] = [
    0, 54, 54, 54, 118, 118, 118, 118, //
    123, 129, 134, 138, 143, 147, 151, 156, //
    157, 161, 164, 168, 170, 173, 176, 179, //
    181, 185, 187, 190, 192, 194, 197, 199, //
    200, 202, 204, 206, 209, 211, 213, 215, //
    217, 219, 221, 222, 224, 225, 227, 229, //
    231, 232, 234, 236, 237, 239, 240, 242, //
    244, 245, 246, 248, 250, 251, 252, 254, //
];

/// One-based index of the most significant set bit, `0` for zero.
fn fls64(a: u64) -> u32 {
    64 - a.leading_zeros()
}

/// Cube root by table lookup and one Newton-Raphson step.
pub fn cube_root(a: u64) -> u32 {
    let b = fls64(a);
    if b < 7 {
        return (CBRT_TABLE[a as usize] as u32 + 35) >> 6;
    }

    let b = ((b * 84) >> 8) - 1;
    let shift = (a >> (b * 3)) as usize;

    let x = ((CBRT_TABLE[shift] as u64 + 10) << b) >> 6;

    // x' = (2 * x + a / x^2) / 3
    let x = 2 * x + a / (x * (x - 1));
    ((x * 341) >> 10) as u32
}

/// Floor cube root by Newton-Raphson from an over-estimate.
pub fn cube_root_newton(a: u64) -> u32 {
    if a == 0 {
        return 0;
    }

    let mut x: u64 = 1 << ((fls64(a) + 2) / 3);
    loop {
        let y = (2 * x + a / (x * x)) / 3;
        if y >= x {
            return x as u32;
        }
        x = y;
    }
}

/// CUBIC state of a connection.
#[derive(Debug, Default)]
pub struct CubicWindow {
    /// Increase the window by one packet after `cnt` ACKed packets.
    cnt: u32,

    /// Window before the last congestion event, `W_max`.
    last_max_cwnd: u32,

    /// Window at the last recomputation of `cnt`.
    last_cwnd: u32,

    /// Time of the last recomputation of `cnt`.
    last_time: Option<Instant>,

    /// Window at the vertex of the cubic function.
    bic_origin_point: u32,

    /// Time from epoch start to the vertex, in `BICTCP_HZ` units.
    bic_k: u32,

    /// Minimum delay of the connection, `ms << 3`. Zero means no sample.
    delay_min: u32,

    /// Beginning of the current epoch. `None` forces a new epoch.
    epoch_start: Option<Instant>,

    /// ACKed packets not yet credited to `tcp_cwnd`.
    ack_cnt: u32,

    /// Window a Reno flow would have reached in this epoch.
    tcp_cwnd: u32,
}

impl CubicWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every field.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn cnt(&self) -> u32 {
        self.cnt
    }

    pub fn last_max_cwnd(&self) -> u32 {
        self.last_max_cwnd
    }

    pub fn origin_point(&self) -> u32 {
        self.bic_origin_point
    }

    pub fn k(&self) -> u32 {
        self.bic_k
    }

    pub fn delay_min(&self) -> u32 {
        self.delay_min
    }

    pub fn epoch_start(&self) -> Option<Instant> {
        self.epoch_start
    }

    pub fn tcp_cwnd(&self) -> u32 {
        self.tcp_cwnd
    }

    /// Fold a delay sample, `ms << 3`, into the connection minimum.
    pub fn update_delay_min(&mut self, delay: u32) {
        if self.delay_min == 0 || self.delay_min > delay {
            self.delay_min = delay;
        }
    }

    /// Whether samples should be ignored because the current epoch started
    /// less than one second ago.
    pub fn in_recovery_hold(&self, now: Instant) -> bool {
        match self.epoch_start {
            Some(epoch) => now.saturating_duration_since(epoch) < Duration::from_secs(1),
            None => false,
        }
    }

    /// Recompute `cnt` for a window of `cwnd` packets after `acked` packets
    /// were ACKed.
    pub fn update(&mut self, conf: &CubicConfig, cwnd: u32, acked: u32, now: Instant) {
        self.ack_cnt = self.ack_cnt.saturating_add(acked);

        let since_last = self.last_time.map(|t| now.saturating_duration_since(t));

        if let Some(elapsed) = since_last {
            if self.last_cwnd == cwnd && elapsed.as_millis() <= (HZ / 32) as u128 {
                return;
            }

            // At most one recomputation per tick.
            if self.epoch_start.is_some() && elapsed < Duration::from_millis(1) {
                self.tcp_friendliness(conf, cwnd);
                return;
            }
        }

        self.last_cwnd = cwnd;
        self.last_time = Some(now);

        let epoch_start = match self.epoch_start {
            Some(epoch) => epoch,
            None => {
                self.start_epoch(conf, cwnd, acked, now);
                now
            }
        };

        let target = self.target_at_scaled(conf, self.scaled_time(epoch_start, now));

        self.cnt = if target > cwnd {
            cwnd / (target - cwnd)
        } else {
            VERY_SMALL_INCREMENT.saturating_mul(cwnd)
        };

        if self.last_max_cwnd == 0 && self.cnt > BOOTSTRAP_MAX_CNT {
            self.cnt = BOOTSTRAP_MAX_CNT;
        }

        self.tcp_friendliness(conf, cwnd);
    }

    fn start_epoch(&mut self, conf: &CubicConfig, cwnd: u32, acked: u32, now: Instant) {
        self.epoch_start = Some(now);
        self.ack_cnt = acked;
        self.tcp_cwnd = cwnd;

        if self.last_max_cwnd <= cwnd {
            self.bic_k = 0;
            self.bic_origin_point = cwnd;
        } else {
            let a = conf
                .cube_factor
                .saturating_mul((self.last_max_cwnd - cwnd) as u64);
            self.bic_k = conf.cube_root.cube_root(a);
            self.bic_origin_point = self.last_max_cwnd;
        }

        trace!(
            "cubic epoch start: cwnd={} last_max_cwnd={} k={} origin={}",
            cwnd,
            self.last_max_cwnd,
            self.bic_k,
            self.bic_origin_point
        );
    }

    /// Reno-equivalent window estimate. Caps `cnt` so that the window never
    /// grows slower than Reno, then applies the `cnt` floor.
    fn tcp_friendliness(&mut self, conf: &CubicConfig, cwnd: u32) {
        if conf.tcp_friendliness {
            let delta = ((cwnd as u64 * conf.beta_scale as u64) >> 3).max(1);
            let ack_cnt = self.ack_cnt as u64;
            if ack_cnt > delta {
                let n = (ack_cnt - 1) / delta;
                self.ack_cnt = (ack_cnt - n * delta) as u32;
                self.tcp_cwnd = self.tcp_cwnd.saturating_add(n as u32);
            }

            if self.tcp_cwnd > cwnd {
                let max_cnt = cwnd / (self.tcp_cwnd - cwnd);
                if self.cnt > max_cnt {
                    self.cnt = max_cnt;
                }
            }
        }

        self.cnt = self.cnt.max(MIN_CNT);
    }

    /// Elapsed epoch time in `BICTCP_HZ` units, shifted by the minimum delay.
    fn scaled_time(&self, epoch_start: Instant, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(epoch_start).as_millis() as u64;
        let t = elapsed.saturating_add((self.delay_min >> 3) as u64);
        (t << BICTCP_HZ) / HZ
    }

    /// Cubic target window at scaled time `t` of the current epoch.
    pub(crate) fn target_at_scaled(&self, conf: &CubicConfig, t: u64) -> u32 {
        let k = self.bic_k as u64;
        let offs = t.abs_diff(k) as u128;

        let delta = (conf.cube_rtt_scale as u128 * offs * offs * offs) >> (10 + 3 * BICTCP_HZ);
        let delta = u32::try_from(delta).unwrap_or(u32::MAX);

        if t < k {
            self.bic_origin_point.saturating_sub(delta)
        } else {
            self.bic_origin_point.saturating_add(delta)
        }
    }

    /// Cubic target window at `now`, if an epoch is active.
    pub fn target(&self, conf: &CubicConfig, now: Instant) -> Option<u32> {
        self.epoch_start
            .map(|epoch| self.target_at_scaled(conf, self.scaled_time(epoch, now)))
    }

    /// End the epoch and remember the window maximum. Returns the new slow
    /// start threshold.
    pub fn recalc_ssthresh(&mut self, conf: &CubicConfig, cwnd: u32) -> u32 {
        self.epoch_start = None;

        if cwnd < self.last_max_cwnd && conf.fast_convergence {
            self.last_max_cwnd = ((cwnd as u64 * (BICTCP_BETA_SCALE + conf.beta) as u64)
                / (2 * BICTCP_BETA_SCALE as u64)) as u32;
        } else {
            self.last_max_cwnd = cwnd;
        }

        let ssthresh = (cwnd as u64 * conf.beta as u64 / BICTCP_BETA_SCALE as u64) as u32;
        ssthresh.max(crate::MIN_CONGESTION_WINDOW)
    }

    /// Shift the epoch forward by an idle period, so the cubic curve resumes
    /// where it stopped. The epoch never moves past `now`.
    pub fn on_idle_resume(&mut self, idle: Duration, now: Instant) {
        if idle.is_zero() {
            return;
        }

        if let Some(epoch) = self.epoch_start {
            let shifted = epoch.checked_add(idle).unwrap_or(now).min(now);
            trace!("cubic epoch shifted by {:?} after idle", idle);
            self.epoch_start = Some(shifted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use proptest::prelude::*;

    fn config(method: CubeRootMethod) -> CubicConfig {
        let mut conf = Config::new();
        conf.set_cube_root(method);
        CubicConfig::from(&conf)
    }

    #[test]
    fn cube_root_method_name() {
        let cases = [
            ("table", Ok(CubeRootMethod::Table)),
            ("Newton", Ok(CubeRootMethod::Newton)),
            ("cbrt", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, method) in cases {
            assert_eq!(CubeRootMethod::from_str(name), method);
        }
    }

    #[test]
    fn cube_root_small() {
        assert_eq!(cube_root(0), 0);
        assert_eq!(cube_root(1), 1);
        assert_eq!(cube_root(8), 2);
        assert_eq!(cube_root(27), 3);
        assert_eq!(cube_root(63), 4);

        assert_eq!(cube_root_newton(0), 0);
        assert_eq!(cube_root_newton(1), 1);
        assert_eq!(cube_root_newton(7), 1);
        assert_eq!(cube_root_newton(8), 2);
        assert_eq!(cube_root_newton(26), 2);
        assert_eq!(cube_root_newton(27), 3);
    }

    #[test]
    fn cube_root_newton_exact() {
        let mut inputs = vec![u64::MAX, 1 << 40, 1 << 63, 999_999_999_999];
        inputs.extend((1..2000_u64).map(|i| i * i * i));
        inputs.extend((2..2000_u64).map(|i| i * i * i - 1));

        for a in inputs {
            let r = cube_root_newton(a) as u128;
            assert!(r * r * r <= a as u128, "a={}", a);
            assert!((r + 1) * (r + 1) * (r + 1) > a as u128, "a={}", a);
        }
    }

    #[test]
    fn cube_root_table_accuracy() {
        // The range used for K: cube_factor times up to a million packets.
        let conf = config(CubeRootMethod::Table);
        for diff in [1_u64, 3, 10, 100, 1000, 12_345, 1_000_000] {
            let a = conf.cube_factor * diff;
            let exact = cube_root_newton(a) as f64;
            let approx = cube_root(a) as f64;
            assert!(
                (approx - exact).abs() / exact < 0.02,
                "a={} exact={} approx={}",
                a,
                exact,
                approx
            );
        }
    }

    #[test]
    fn cubic_target_at_vertex() {
        for method in [CubeRootMethod::Table, CubeRootMethod::Newton] {
            let conf = config(method);
            let now = Instant::now();
            let mut w = CubicWindow::new();
            w.last_max_cwnd = 100;
            w.update(&conf, 70, 1, now);

            assert_eq!(w.epoch_start(), Some(now));
            assert_eq!(w.origin_point(), 100);
            assert_eq!(w.k(), method.cube_root(conf.cube_factor * 30));
            assert!(w.k() > 0);

            // Target is the old maximum at t = K.
            assert_eq!(w.target_at_scaled(&conf, w.k() as u64), 100);

            // Non-decreasing over the whole epoch.
            let mut prev = 0;
            for t in 0..(4 * w.k() as u64) {
                let target = w.target_at_scaled(&conf, t);
                assert!(target >= prev, "t={} target={} prev={}", t, target, prev);
                prev = target;
            }
            // Close to the reduced window at the epoch start.
            assert!(w.target_at_scaled(&conf, 0) <= 71);
            assert!(w.target_at_scaled(&conf, 0) >= 69);
            // Convex region beyond the vertex.
            assert!(prev > 100);
        }
    }

    #[test]
    fn cubic_epoch_above_max() {
        let conf = config(CubeRootMethod::Table);
        let now = Instant::now();
        let mut w = CubicWindow::new();
        w.last_max_cwnd = 50;
        w.update(&conf, 80, 1, now);

        assert_eq!(w.k(), 0);
        assert_eq!(w.origin_point(), 80);
        // Window on the curve: very small increment.
        assert_eq!(w.cnt(), VERY_SMALL_INCREMENT * 80);
    }

    #[test]
    fn cubic_bootstrap_cap() {
        let conf = config(CubeRootMethod::Table);
        let now = Instant::now();
        let mut w = CubicWindow::new();
        w.update(&conf, 10, 1, now);
        assert_eq!(w.cnt(), BOOTSTRAP_MAX_CNT);
    }

    #[test]
    fn cubic_rate_limit() {
        let conf = config(CubeRootMethod::Table);
        let start = Instant::now();
        let mut w = CubicWindow::new();
        w.last_max_cwnd = 100;
        w.update(&conf, 70, 1, start);
        let cnt = w.cnt();
        let last_time = w.last_time;

        // Same window within HZ / 32: only the ACK count moves.
        w.update(&conf, 70, 1, start + Duration::from_millis(31));
        assert_eq!(w.last_time, last_time);
        assert_eq!(w.cnt(), cnt);
        assert_eq!(w.ack_cnt, 2);

        // Different window within the same tick: friendliness only.
        w.update(&conf, 71, 1, start + Duration::from_micros(500));
        assert_eq!(w.last_time, last_time);

        // Different window in a later tick: recomputed.
        let later = start + Duration::from_millis(2);
        w.update(&conf, 71, 1, later);
        assert_eq!(w.last_time, Some(later));
        assert_eq!(w.last_cwnd, 71);
    }

    #[test]
    fn cubic_tcp_friendliness() {
        let conf = config(CubeRootMethod::Table);
        assert_eq!(conf.beta_scale, 15);

        let now = Instant::now();
        let mut w = CubicWindow::new();
        w.last_max_cwnd = 1000;
        w.update(&conf, 100, 1, now);
        assert_eq!(w.tcp_cwnd(), 100);

        // delta = 100 * 15 / 8 = 187 ACKs per Reno increment.
        let later = now + Duration::from_millis(100);
        w.update(&conf, 100, 187 * 3, later);
        assert_eq!(w.tcp_cwnd(), 103);
        assert_eq!(w.ack_cnt, 1);
        // Reno is ahead by three packets: at least one packet per 33 ACKs.
        assert!(w.cnt() <= 100 / 3);
    }

    #[test]
    fn cubic_recalc_ssthresh() {
        let conf = config(CubeRootMethod::Table);
        let now = Instant::now();
        let mut w = CubicWindow::new();
        w.update(&conf, 100, 1, now);

        assert_eq!(w.recalc_ssthresh(&conf, 100), 100 * 717 / 1024);
        assert_eq!(w.epoch_start(), None);
        assert_eq!(w.last_max_cwnd(), 100);

        // Fast convergence below the previous maximum.
        assert_eq!(w.recalc_ssthresh(&conf, 80), 80 * 717 / 1024);
        assert_eq!(w.last_max_cwnd(), 80 * (1024 + 717) / 2048);

        // Floor of two packets.
        assert_eq!(w.recalc_ssthresh(&conf, 2), 2);

        let mut slow = Config::new();
        slow.enable_fast_convergence(false);
        let slow = CubicConfig::from(&slow);
        let mut w = CubicWindow::new();
        w.recalc_ssthresh(&slow, 100);
        w.recalc_ssthresh(&slow, 80);
        assert_eq!(w.last_max_cwnd(), 80);
    }

    #[test]
    fn cubic_idle_resume() {
        let conf = config(CubeRootMethod::Table);
        let base = Instant::now();

        let mut idle = CubicWindow::new();
        idle.last_max_cwnd = 200;
        idle.update(&conf, 140, 1, base + Duration::from_millis(100));

        let mut busy = CubicWindow::new();
        busy.last_max_cwnd = 200;
        busy.update(&conf, 140, 1, base + Duration::from_millis(100));

        let resume = base + Duration::from_millis(200);
        idle.on_idle_resume(Duration::from_millis(50), resume);
        assert_eq!(idle.epoch_start(), Some(base + Duration::from_millis(150)));

        assert_eq!(
            idle.target(&conf, resume),
            busy.target(&conf, base + Duration::from_millis(150))
        );
        assert_ne!(idle.target(&conf, resume), busy.target(&conf, resume));

        // Never moved into the future.
        idle.on_idle_resume(Duration::from_secs(10), resume);
        assert_eq!(idle.epoch_start(), Some(resume));

        // No epoch, nothing to shift.
        let mut w = CubicWindow::new();
        w.on_idle_resume(Duration::from_millis(50), resume);
        assert_eq!(w.epoch_start(), None);
    }

    #[test]
    fn cubic_delay_min() {
        let now = Instant::now();
        let mut w = CubicWindow::new();
        w.update_delay_min(400);
        w.update_delay_min(720);
        assert_eq!(w.delay_min(), 400);
        w.update_delay_min(320);
        assert_eq!(w.delay_min(), 320);

        assert!(!w.in_recovery_hold(now));
        w.epoch_start = Some(now);
        assert!(w.in_recovery_hold(now + Duration::from_millis(999)));
        assert!(!w.in_recovery_hold(now + Duration::from_secs(1)));

        w.reset();
        assert_eq!(w.delay_min(), 0);
        assert_eq!(w.epoch_start(), None);
    }

    proptest! {
        #[test]
        fn cnt_never_below_two(
            cwnd in 1u32..2_000_000,
            last_max_cwnd in 0u32..2_000_000,
            acked in 1u32..10_000,
            delay_min in 0u32..80_000,
            steps in proptest::collection::vec(0u64..5_000, 1..16),
            newton in any::<bool>(),
            friendly in any::<bool>(),
        ) {
            let mut conf = Config::new();
            conf.enable_tcp_friendliness(friendly);
            if newton {
                conf.set_cube_root(CubeRootMethod::Newton);
            }
            let conf = CubicConfig::from(&conf);

            let mut now = Instant::now();
            let mut w = CubicWindow::new();
            w.last_max_cwnd = last_max_cwnd;
            w.update_delay_min(delay_min);

            let mut cwnd = cwnd;
            for step in steps {
                now += Duration::from_millis(step);
                w.update(&conf, cwnd, acked, now);
                prop_assert!(w.cnt() >= MIN_CNT);
                cwnd = cwnd.saturating_add(acked / w.cnt());
            }
        }
    }
}
