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

//! A per-connection CUBIC congestion controller with Hybrid Slow Start.
//!
//! The controller decides the congestion window and the slow start threshold
//! of one connection from the stream of ACK, loss and idle events delivered
//! by its host. It does no I/O and never blocks.
//!
//! ## Features
//!
//! * **CUBIC**: fixed point cubic window growth with the Reno-friendly
//!   region and fast convergence.
//! * **HyStart**: slow start exit on ACK trains and on delay increase, with
//!   a delay threshold that can follow the RTT standard deviation so that
//!   jittery paths do not exit early.
//! * **RTT statistics**: numerically stable online mean and variance.
//!
//! ## Get started
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use std::time::Instant;
//!
//! use cubic_hystart::congestion_control::AckSample;
//! use cubic_hystart::congestion_control::CubicConfig;
//! use cubic_hystart::congestion_control::build_congestion_controller;
//! use cubic_hystart::Config;
//! use cubic_hystart::CongestionController;
//!
//! let conf = Arc::new(CubicConfig::from(&Config::new()));
//! let mut cc = build_congestion_controller(&conf);
//!
//! let now = Instant::now();
//! cc.on_sent(now, 1, 0);
//! cc.on_ack(&AckSample {
//!     ack_seq: 1,
//!     acked: 1,
//!     rtt: Some(Duration::from_millis(30)),
//!     time: now + Duration::from_millis(30),
//!     app_limited: false,
//! });
//! assert_eq!(cc.congestion_window(), 11);
//! ```

use core::str::FromStr;

use enumflags2::BitFlags;
use serde::Deserialize;
use serde::Serialize;

/// Minimal congestion window in packets.
pub const MIN_CONGESTION_WINDOW: u32 = 2;

/// Default initial congestion window in packets.
pub const INITIAL_CONGESTION_WINDOW: u32 = 10;

/// Default beta, over 1024.
const DEFAULT_BETA: u32 = 717;

/// Default cubic scale, over 1024.
const DEFAULT_BIC_SCALE: u32 = 41;

/// Default lower bound of cwnd for HyStart, in packets.
const DEFAULT_HYSTART_LOW_WINDOW: u32 = 16;

/// Default ACK train spacing in milliseconds.
const DEFAULT_HYSTART_ACK_DELTA: u32 = 2;

/// Default coefficient of the RTT standard deviation.
const DEFAULT_HYSTART_STDDEV_K: f64 = 2.0;

/// A specialized [`Result`] type for congestion control operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// Congestion control configurations.
///
/// Values are not validated here. They are clamped where they are used, so
/// a malformed configuration degrades instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enable fast convergence.
    fast_convergence: bool,

    /// Multiplicative decrease factor, over 1024.
    beta: u32,

    /// Initial slow start threshold in packets, `0` if unset.
    initial_ssthresh: u32,

    /// Cubic scale, over 1024.
    bic_scale: u32,

    /// Enable the Reno-friendly region.
    tcp_friendliness: bool,

    /// Enable HyStart.
    hystart: bool,

    /// HyStart detection mechanisms. 1: ACK train, 2: delay, 3: both.
    hystart_detect: u8,

    /// Lower bound of cwnd for HyStart, in packets.
    hystart_low_window: u32,

    /// Spacing between ACKs indicating a train, in milliseconds.
    hystart_ack_delta: u32,

    /// Clamp the delay threshold to `hystart_delay_upper`. Unbounded
    /// otherwise.
    hystart_delay_max: bool,

    /// Lower bound of the delay threshold, `ms << 3`.
    hystart_delay_lower: u32,

    /// Upper bound of the delay threshold, `ms << 3`.
    hystart_delay_upper: u32,

    /// Derivation of the delay threshold.
    hystart_delay_thresh: HystartDelayThresh,

    /// Coefficient of the RTT standard deviation in the delay threshold.
    hystart_stddev_k: f64,

    /// Method for solving the cubic root.
    cube_root: CubeRootMethod,

    /// Initial congestion window in packets.
    initial_congestion_window: u32,
}

impl Config {
    /// Create default configuration.
    ///
    /// ```
    /// let config = cubic_hystart::Config::new();
    /// ```
    pub fn new() -> Self {
        Self {
            fast_convergence: true,
            beta: DEFAULT_BETA,
            initial_ssthresh: 0,
            bic_scale: DEFAULT_BIC_SCALE,
            tcp_friendliness: true,
            hystart: true,
            hystart_detect: (HystartMode::AckTrain | HystartMode::Delay).bits(),
            hystart_low_window: DEFAULT_HYSTART_LOW_WINDOW,
            hystart_ack_delta: DEFAULT_HYSTART_ACK_DELTA,
            hystart_delay_max: true,
            hystart_delay_lower: HYSTART_DELAY_MIN,
            hystart_delay_upper: HYSTART_DELAY_MAX,
            hystart_delay_thresh: HystartDelayThresh::default(),
            hystart_stddev_k: DEFAULT_HYSTART_STDDEV_K,
            cube_root: CubeRootMethod::default(),
            initial_congestion_window: INITIAL_CONGESTION_WINDOW,
        }
    }

    /// Load configuration from a JSON document. Missing fields take their
    /// default values.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to a JSON document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Enable fast convergence.
    /// The default value is true.
    pub fn enable_fast_convergence(&mut self, v: bool) {
        self.fast_convergence = v;
    }

    /// Set the multiplicative decrease factor, over 1024.
    /// The default value is 717.
    pub fn set_beta(&mut self, v: u32) {
        self.beta = v;
    }

    /// Set the initial slow start threshold in packets. It only applies if
    /// HyStart is disabled.
    /// The default value is 0, which means unset.
    pub fn set_initial_ssthresh(&mut self, packets: u32) {
        self.initial_ssthresh = packets;
    }

    /// Set the cubic scale, over 1024.
    /// The default value is 41.
    pub fn set_bic_scale(&mut self, v: u32) {
        self.bic_scale = v;
    }

    /// Enable the Reno-friendly region.
    /// The default value is true.
    pub fn enable_tcp_friendliness(&mut self, v: bool) {
        self.tcp_friendliness = v;
    }

    /// Enable HyStart.
    /// The default value is true.
    pub fn enable_hystart(&mut self, v: bool) {
        self.hystart = v;
    }

    /// Set HyStart detection mechanisms.
    /// The default value is both ACK train and delay.
    pub fn set_hystart_detect(&mut self, v: BitFlags<HystartMode>) {
        self.hystart_detect = v.bits();
    }

    /// Set the lower bound of cwnd for HyStart in packets.
    /// The default value is 16.
    pub fn set_hystart_low_window(&mut self, packets: u32) {
        self.hystart_low_window = packets;
    }

    /// Set the spacing between ACKs indicating a train in milliseconds.
    /// The default value is 2.
    pub fn set_hystart_ack_delta(&mut self, millis: u32) {
        self.hystart_ack_delta = millis;
    }

    /// Enable the upper bound of the delay threshold.
    /// The default value is true.
    pub fn enable_hystart_delay_max(&mut self, v: bool) {
        self.hystart_delay_max = v;
    }

    /// Set the bounds of the delay threshold, in units of 1/8 milliseconds.
    /// The default values are 32 and 128.
    pub fn set_hystart_delay_bounds(&mut self, lower: u32, upper: u32) {
        self.hystart_delay_lower = lower;
        self.hystart_delay_upper = upper;
    }

    /// Set the derivation of the delay threshold.
    /// The default value is `Wider`.
    pub fn set_hystart_delay_thresh(&mut self, v: HystartDelayThresh) {
        self.hystart_delay_thresh = v;
    }

    /// Set the coefficient of the RTT standard deviation.
    /// The default value is 2.0.
    pub fn set_hystart_stddev_k(&mut self, v: f64) {
        self.hystart_stddev_k = v;
    }

    /// Set the method for solving the cubic root.
    /// The default value is `Table`.
    pub fn set_cube_root(&mut self, v: CubeRootMethod) {
        self.cube_root = v;
    }

    /// Set the initial congestion window in packets.
    /// The default value is 10.
    pub fn set_initial_congestion_window(&mut self, packets: u32) {
        self.initial_congestion_window = packets;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(json: &str) -> Result<Config> {
        Config::from_json(json)
    }
}


pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CubeRootMethod;
pub use crate::congestion_control::CubicConfig;
pub use crate::congestion_control::HystartDelayThresh;
pub use crate::congestion_control::HystartMode;
pub use crate::congestion_control::HYSTART_DELAY_MAX;
pub use crate::congestion_control::HYSTART_DELAY_MIN;
pub use crate::error::Error;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod error;
