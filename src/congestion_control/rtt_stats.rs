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

//! Online RTT mean and variance.
//!
//! The running aggregates are folded with Welford's single-pass algorithm,
//! which keeps the variance numerically stable without the catastrophic
//! cancellation of a naive sum-of-squares. The standard deviation is
//! reported as an integer number of milliseconds, computed by a bisection
//! square root so that it matches fixed-point arithmetic semantics.

use std::time::Duration;

use crate::Error;
use crate::Result;

/// Running RTT statistics of a connection.
#[derive(Debug, Default, Clone)]
pub struct RttStats {
    /// Number of RTT samples folded in.
    count: u64,

    /// Running mean RTT in milliseconds.
    mean: f64,

    /// Running sum of squared deviations from the mean, in square
    /// milliseconds.
    m2: f64,
}

impl RttStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one RTT sample into the aggregates.
    pub fn update(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;

        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = sample - self.mean;
        self.m2 += delta * delta2;
    }

    #[cfg(test)]
    pub(crate) fn from_parts(count: u64, mean: f64, m2: f64) -> Self {
        Self { count, mean, m2 }
    }

    /// Drop all samples.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of samples folded in.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean RTT in milliseconds.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sum of squared deviations in square milliseconds.
    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Population variance in square milliseconds, `0` without samples.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }

    /// Standard deviation in whole milliseconds (floor).
    ///
    /// A negative variance cannot arise from valid samples, so it is
    /// reported as an error instead of being turned into a deviation.
    pub fn stddev(&self) -> Result<u64> {
        let variance = self.variance();
        if variance.is_nan() || variance < 0.0 {
            return Err(Error::InvalidState(format!(
                "rtt variance is negative: m2={} count={}",
                self.m2, self.count
            )));
        }

        Ok(isqrt(variance as u64))
    }
}

/// Integer floor square root by bisection over `[1, v / 2]`.
pub fn isqrt(v: u64) -> u64 {
    if v < 2 {
        return v;
    }

    let mut root = 1;
    let mut start = 1;
    let mut end = v >> 1;
    while start <= end {
        let mid = start + (end - start) / 2;
        // `mid * mid <= v` without overflowing.
        if mid <= v / mid {
            root = mid;
            start = mid + 1;
        } else {
            end = mid - 1;
        }
    }

    root
}
