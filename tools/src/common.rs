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

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::trace;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use cubic_hystart::congestion_control::build_congestion_controller;
use cubic_hystart::congestion_control::AckSample;
use cubic_hystart::congestion_control::CongestionStats;
use cubic_hystart::CongestionController;
use cubic_hystart::CubicConfig;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Log target: the given file, or `stderr`.
pub fn log_target(log_file: &Option<String>) -> Result<env_logger::Target> {
    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        return Ok(env_logger::Target::Pipe(Box::new(file)));
    }
    Ok(env_logger::Target::Stderr)
}

/// A single bottleneck path.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Base round trip time in milliseconds.
    pub rtt: u64,

    /// Maximum extra delay of an ACK in milliseconds, uniformly distributed.
    pub jitter: u64,

    /// Bottleneck rate in packets per millisecond.
    pub bandwidth: f64,

    /// Bottleneck buffer in packets.
    pub buffer: usize,
}

/// Path events, ordered by time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PathEvent {
    /// Time the sender learns about the packet, in milliseconds.
    time: u64,

    /// Flow index.
    flow: usize,

    /// Packet sequence number.
    seq: u64,

    /// Send time in milliseconds.
    sent: u64,

    /// The packet was dropped at the bottleneck.
    lost: bool,
}

/// A packet waiting at the bottleneck.
#[derive(Debug, Clone, Copy)]
struct QueuedPacket {
    flow: usize,
    seq: u64,
    sent: u64,
}

/// A sender with one congestion controller.
struct Flow {
    cc: Box<dyn CongestionController>,

    /// Next sequence number to send.
    next_seq: u64,

    /// Packets sent and not yet ACKed or declared lost.
    in_flight: u32,

    /// Losses of packets up to this sequence number belong to the last
    /// congestion event.
    recovery_seq: u64,

    /// Congestion window sampled every millisecond.
    cwnd_samples: Vec<f64>,
}

/// Final state of a flow.
#[derive(Debug, Clone)]
pub struct FlowReport {
    pub cwnd: u32,
    pub ssthresh: u32,
    pub stats: CongestionStats,
    pub cwnd_samples: Vec<f64>,
}

/// Discrete time simulation of flows sharing a FIFO bottleneck, stepped
/// every millisecond.
pub struct Simulator {
    path: PathConfig,
    flows: Vec<Flow>,
    queue: VecDeque<QueuedPacket>,
    events: BinaryHeap<Reverse<PathEvent>>,

    /// Fractional packets the bottleneck may serve.
    credit: f64,

    rng: StdRng,
    start: Instant,
    now: u64,
}

impl Simulator {
    pub fn new(path: PathConfig, conf: &Arc<CubicConfig>, flows: usize, seed: u64) -> Self {
        let flows = (0..flows)
            .map(|_| Flow {
                cc: build_congestion_controller(conf),
                next_seq: 1,
                in_flight: 0,
                recovery_seq: 0,
                cwnd_samples: Vec::new(),
            })
            .collect();

        Self {
            path,
            flows,
            queue: VecDeque::new(),
            events: BinaryHeap::new(),
            credit: 0.0,
            rng: StdRng::seed_from_u64(seed),
            start: Instant::now(),
            now: 0,
        }
    }

    fn instant(&self, millis: u64) -> Instant {
        self.start + Duration::from_millis(millis)
    }

    /// Run the simulation for `duration` milliseconds.
    pub fn run(&mut self, duration: u64) {
        let end = self.now + duration;
        while self.now < end {
            self.process_events();
            self.send();
            self.serve();

            for flow in self.flows.iter_mut() {
                flow.cwnd_samples.push(flow.cc.congestion_window() as f64);
            }
            self.now += 1;
        }
    }

    fn process_events(&mut self) {
        while let Some(Reverse(ev)) = self.events.peek().copied() {
            if ev.time > self.now {
                break;
            }
            self.events.pop();

            let now = self.instant(self.now);
            let flow = &mut self.flows[ev.flow];
            flow.in_flight = flow.in_flight.saturating_sub(1);

            if ev.lost {
                // One congestion event per window of data.
                if ev.seq > flow.recovery_seq {
                    let ssthresh = flow.cc.on_congestion_event(now);
                    flow.recovery_seq = flow.next_seq - 1;
                    debug!(
                        "flow {} loss of packet {} at {}ms, ssthresh {}",
                        ev.flow, ev.seq, self.now, ssthresh
                    );
                }
                continue;
            }

            let outcome = flow.cc.on_ack(&AckSample {
                ack_seq: ev.seq,
                acked: 1,
                rtt: Some(Duration::from_millis(ev.time - ev.sent)),
                time: now,
                app_limited: false,
            });

            for signal in outcome.signals() {
                debug!("flow {} at {}ms: {:?}", ev.flow, self.now, signal);
            }
        }
    }

    fn send(&mut self) {
        let now = self.instant(self.now);
        for (i, flow) in self.flows.iter_mut().enumerate() {
            while flow.in_flight < flow.cc.congestion_window() {
                let seq = flow.next_seq;
                flow.cc.on_sent(now, seq, flow.in_flight);
                flow.next_seq += 1;
                flow.in_flight += 1;

                if self.queue.len() < self.path.buffer {
                    self.queue.push_back(QueuedPacket {
                        flow: i,
                        seq,
                        sent: self.now,
                    });
                } else {
                    trace!("flow {} packet {} dropped at {}ms", i, seq, self.now);
                    self.events.push(Reverse(PathEvent {
                        time: self.now + self.path.rtt,
                        flow: i,
                        seq,
                        sent: self.now,
                        lost: true,
                    }));
                }
            }
        }
    }

    fn serve(&mut self) {
        self.credit += self.path.bandwidth;
        while self.credit >= 1.0 {
            let pkt = match self.queue.pop_front() {
                Some(pkt) => pkt,
                None => {
                    // An idle link does not bank capacity.
                    self.credit = self.credit.min(1.0);
                    break;
                }
            };
            self.credit -= 1.0;

            let jitter = if self.path.jitter > 0 {
                self.rng.gen_range(0..=self.path.jitter)
            } else {
                0
            };
            self.events.push(Reverse(PathEvent {
                time: self.now.max(pkt.sent + self.path.rtt) + jitter,
                flow: pkt.flow,
                seq: pkt.seq,
                sent: pkt.sent,
                lost: false,
            }));
        }
    }

    /// Final state of every flow.
    pub fn reports(&self) -> Vec<FlowReport> {
        self.flows
            .iter()
            .map(|flow| FlowReport {
                cwnd: flow.cc.congestion_window(),
                ssthresh: flow.cc.ssthresh(),
                stats: flow.cc.stats().clone(),
                cwnd_samples: flow.cwnd_samples.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubic_hystart::Config;

    fn path() -> PathConfig {
        PathConfig {
            rtt: 40,
            jitter: 0,
            bandwidth: 1.0,
            buffer: 50,
        }
    }

    #[test]
    fn simulator_single_flow() {
        let conf = Arc::new(CubicConfig::from(&Config::new()));
        let mut sim = Simulator::new(path(), &conf, 1, 1);
        sim.run(3000);

        let reports = sim.reports();
        assert_eq!(reports.len(), 1);

        let report = &reports[0];
        assert_eq!(report.cwnd_samples.len(), 3000);
        assert!(report.stats.packets_acked_in_total > 1000);
        // Slow start ended, either by HyStart or by loss.
        assert!(report.ssthresh < u32::MAX);
        // The window stays near the path capacity: BDP plus buffer.
        assert!(report.cwnd < 4 * (40 + 50));
    }

    #[test]
    fn simulator_deterministic() {
        let conf = Arc::new(CubicConfig::from(&Config::new()));
        let mut p = path();
        p.jitter = 10;
        p.bandwidth = 2.0;

        let run = |seed| {
            let mut sim = Simulator::new(p.clone(), &conf, 2, seed);
            sim.run(2000);
            sim.reports()
                .iter()
                .map(|r| (r.cwnd, r.ssthresh))
                .collect::<Vec<_>>()
        };

        assert_eq!(run(7), run(7));
    }
}
