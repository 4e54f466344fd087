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

//! HyStart: Hybrid Slow Start.
//!
//! HyStart looks for a safe exit point from slow start before the sender
//! overshoots the path and induces loss. Two independent detectors run once
//! per ACK during slow start:
//!
//! * Ack-train: ACKs keep arriving closely spaced for longer than a fraction
//!   of the minimum RTT, so the pipe is already full.
//! * Delay increase: the minimum RTT of the current round rises above the
//!   connection's minimum RTT by more than a threshold.
//!
//! The delay threshold may additionally follow the RTT standard deviation,
//! so that jittery paths do not exit early and stable paths may exit sooner.
//!
//! See "Taming the Elephants: New TCP Slow Start", Ha and Rhee, 2008.

use core::str::FromStr;
use std::time::Instant;

use enumflags2::bitflags;
use enumflags2::BitFlags;
use serde::Deserialize;
use serde::Serialize;

use super::CubicConfig;
use crate::Error;
use crate::Result;

/// Number of delay samples taken in a round before the delay increase is
/// evaluated.
pub const HYSTART_MIN_SAMPLES: u8 = 8;

/// Default lower bound of the delay threshold, 4ms in `ms << 3` units.
pub const HYSTART_DELAY_MIN: u32 = 4 << 3;

/// Default upper bound of the delay threshold, 16ms in `ms << 3` units.
pub const HYSTART_DELAY_MAX: u32 = 16 << 3;

/// HyStart detection mechanisms.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HystartMode {
    /// Ack-train detection.
    AckTrain = 0x1,

    /// Delay increase detection.
    Delay = 0x2,
}

/// How the raw delay-increase threshold is derived, before it is clamped to
/// the configured bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HystartDelayThresh {
    /// One eighth of the minimum RTT.
    Fraction,

    /// `k` times the RTT standard deviation.
    StdDev,

    /// The larger of `Fraction` and `StdDev`.
    #[default]
    Wider,
}

impl FromStr for HystartDelayThresh {
    type Err = Error;

    fn from_str(mode: &str) -> Result<HystartDelayThresh> {
        if mode.eq_ignore_ascii_case("fraction") {
            Ok(HystartDelayThresh::Fraction)
        } else if mode.eq_ignore_ascii_case("stddev") {
            Ok(HystartDelayThresh::StdDev)
        } else if mode.eq_ignore_ascii_case("wider") {
            Ok(HystartDelayThresh::Wider)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Implementation of HyStart.
pub struct Hystart {
    /// Detection mechanisms that have fired in this slow start phase.
    found: BitFlags<HystartMode>,

    /// Beginning of the current round.
    round_start: Option<Instant>,

    /// Last time an ACK arrived close to its predecessor.
    last_ack: Option<Instant>,

    /// The last sent sequence number when the current round started.
    end_seq: u64,

    /// Minimum delay of the current round, `ms << 3`. Zero means no sample.
    curr_rtt: u32,

    /// Delay samples taken in the current round.
    sample_cnt: u8,
}

impl std::fmt::Debug for Hystart {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Hystart ")?;
        write!(f, "found={:?} ", self.found)?;
        write!(f, "end_seq={:?} ", self.end_seq)?;
        write!(f, "curr_rtt={:?} ", self.curr_rtt)?;
        write!(f, "sample_cnt={:?} ", self.sample_cnt)?;

        Ok(())
    }
}

impl Default for Hystart {
    fn default() -> Self {
        Self::new()
    }
}

impl Hystart {
    pub fn new() -> Self {
        Self {
            found: BitFlags::empty(),
            round_start: None,
            last_ack: None,
            end_seq: 0,
            curr_rtt: 0,
            sample_cnt: 0,
        }
    }

    /// Detection mechanisms that have fired so far.
    pub fn found(&self) -> BitFlags<HystartMode> {
        self.found
    }

    /// Whether any of the given mechanisms has already fired.
    pub fn has_exited(&self, detect: BitFlags<HystartMode>) -> bool {
        self.found.intersects(detect)
    }

    /// Mark all mechanisms as fired, ending HyStart for this phase.
    pub fn on_congestion_event(&mut self) {
        self.found = BitFlags::all();
    }

    /// Forget fired mechanisms. The round state is left untouched.
    pub fn clear_found(&mut self) {
        self.found = BitFlags::empty();
    }

    /// Whether an ACK of `ack_seq` completes the current round.
    pub fn is_new_round(&self, ack_seq: u64) -> bool {
        self.round_start.is_none() || ack_seq > self.end_seq
    }

    /// Start a new round ending at `end_seq`.
    pub fn reset_round(&mut self, now: Instant, end_seq: u64) {
        self.round_start = Some(now);
        self.last_ack = Some(now);
        self.end_seq = end_seq;
        self.curr_rtt = 0;
        self.sample_cnt = 0;
    }

    /// Evaluate one delay sample, `ms << 3`, against the connection minimum
    /// `delay_min`.
    ///
    /// Returns the mechanisms that fired on this sample. `stddev` is the RTT
    /// standard deviation in milliseconds, when enough samples exist.
    pub fn update(
        &mut self,
        conf: &CubicConfig,
        now: Instant,
        delay: u32,
        delay_min: u32,
        stddev: Option<u64>,
    ) -> BitFlags<HystartMode> {
        let detect = conf.hystart_detect;
        let mut fired = BitFlags::empty();

        if self.found.intersects(detect) {
            return fired;
        }

        if detect.contains(HystartMode::AckTrain) {
            if let (Some(last_ack), Some(round_start)) = (self.last_ack, self.round_start) {
                let since_last = now.saturating_duration_since(last_ack).as_millis();
                if since_last <= conf.hystart_ack_delta as u128 {
                    self.last_ack = Some(now);

                    let since_round = now.saturating_duration_since(round_start).as_millis();
                    if since_round > (delay_min >> 4) as u128 {
                        self.found |= HystartMode::AckTrain;
                        fired |= HystartMode::AckTrain;
                    }
                }
            }
        }

        if detect.contains(HystartMode::Delay) {
            if self.curr_rtt > delay {
                self.curr_rtt = delay;
            }

            if self.sample_cnt < HYSTART_MIN_SAMPLES {
                if self.curr_rtt == 0 || self.curr_rtt > delay {
                    self.curr_rtt = delay;
                }
                self.sample_cnt += 1;
            } else {
                let thresh = delay_thresh(conf, delay_min, stddev);
                if self.curr_rtt > delay_min.saturating_add(thresh) {
                    self.found |= HystartMode::Delay;
                    fired |= HystartMode::Delay;
                }
            }
        }

        fired
    }
}

/// Delay increase threshold in `ms << 3` units.
pub fn delay_thresh(conf: &CubicConfig, delay_min: u32, stddev: Option<u64>) -> u32 {
    let fraction = delay_min >> 3;
    let deviation = stddev.map(|sd| {
        let k = if conf.hystart_stddev_k.is_finite() {
            conf.hystart_stddev_k.max(0.0)
        } else {
            0.0
        };
        // Saturating float to int conversion.
        (k * (sd as f64) * 8.0) as u32
    });

    let raw = match (conf.hystart_delay_thresh, deviation) {
        (_, None) | (HystartDelayThresh::Fraction, _) => fraction,
        (HystartDelayThresh::StdDev, Some(dev)) => dev,
        (HystartDelayThresh::Wider, Some(dev)) => fraction.max(dev),
    };

    let lower = conf.hystart_delay_lower;
    let upper = conf.hystart_delay_upper.max(lower);
    raw.clamp(lower, upper)
}
