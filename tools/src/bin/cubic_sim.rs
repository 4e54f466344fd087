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
use std::time::Instant;

use clap::Parser;
use log::info;
use statrs::statistics::Data;
use statrs::statistics::Distribution;
use statrs::statistics::Max;
use statrs::statistics::Min;
use statrs::statistics::OrderStatistics;

use cubic_hystart::Config;
use cubic_hystart::CubeRootMethod;
use cubic_hystart::CubicConfig;
use cubic_hystart::HystartDelayThresh;
use cubic_hystart_tools::FlowReport;
use cubic_hystart_tools::PathConfig;
use cubic_hystart_tools::Result;
use cubic_hystart_tools::Simulator;

#[derive(Parser, Debug, Clone)]
#[clap(name = "cubic_sim")]
pub struct SimOpt {
    /// Base round trip time of the path in milliseconds.
    #[clap(long, default_value = "40", value_name = "TIME")]
    pub rtt: u64,

    /// Maximum extra ACK delay in milliseconds, uniformly distributed.
    #[clap(long, default_value = "0", value_name = "TIME")]
    pub jitter: u64,

    /// Bottleneck rate in packets per millisecond.
    #[clap(long, default_value = "1.0", value_name = "NUM")]
    pub bandwidth: f64,

    /// Bottleneck buffer in packets.
    #[clap(long, default_value = "64", value_name = "NUM")]
    pub buffer: usize,

    /// Simulated time in milliseconds.
    #[clap(short, long, default_value = "10000", value_name = "TIME")]
    pub duration: u64,

    /// Number of flows sharing the bottleneck.
    #[clap(short, long, default_value = "1", value_name = "NUM")]
    pub flows: usize,

    /// Congestion control configuration in JSON.
    #[clap(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// Derivation of the HyStart delay threshold, support FRACTION/STDDEV/WIDER.
    #[clap(long, value_name = "STR")]
    pub delay_thresh: Option<HystartDelayThresh>,

    /// Coefficient of the RTT standard deviation in the delay threshold.
    #[clap(long, value_name = "NUM")]
    pub stddev_k: Option<f64>,

    /// Cube root method, support TABLE/NEWTON.
    #[clap(long, value_name = "STR")]
    pub cube_root: Option<CubeRootMethod>,

    /// Disable HyStart.
    #[clap(long)]
    pub disable_hystart: bool,

    /// Seed of the jitter generator.
    #[clap(long, default_value = "0", value_name = "NUM")]
    pub seed: u64,

    /// Log level, support OFF/ERROR/WARN/INFO/DEBUG/TRACE.
    #[clap(long, default_value = "INFO", value_name = "STR")]
    pub log_level: log::LevelFilter,

    /// Log file path. If no file is specified, logs will be written to `stderr`.
    #[clap(long, value_name = "FILE")]
    pub log_file: Option<String>,
}

fn load_config(option: &SimOpt) -> Result<Config> {
    let mut conf = match &option.config {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::new(),
    };

    if let Some(thresh) = option.delay_thresh {
        conf.set_hystart_delay_thresh(thresh);
    }
    if let Some(k) = option.stddev_k {
        conf.set_hystart_stddev_k(k);
    }
    if let Some(method) = option.cube_root {
        conf.set_cube_root(method);
    }
    if option.disable_hystart {
        conf.enable_hystart(false);
    }

    Ok(conf)
}

fn print_report(id: usize, report: &FlowReport) {
    let stats = &report.stats;

    println!("flow {}:", id);
    println!("\tcwnd: {}, ssthresh: {}", report.cwnd, report.ssthresh);
    println!(
        "\tpkts: sent {}, acked {}, acked in slow start {}",
        stats.packets_sent_in_total, stats.packets_acked_in_total, stats.packets_acked_in_slow_start
    );
    println!(
        "\thystart: train {} (cwnd {}), delay {} (cwnd {})",
        stats.hystart_train_detect,
        stats.hystart_train_cwnd,
        stats.hystart_delay_detect,
        stats.hystart_delay_cwnd
    );
    println!(
        "\tcongestion events: {}, loss states: {}, variance anomalies: {}",
        stats.congestion_events, stats.loss_state_events, stats.variance_anomalies
    );

    if report.cwnd_samples.is_empty() {
        return;
    }

    let mut s = Data::new(report.cwnd_samples.clone());
    println!("\tcwnd (pkts):");
    println!(
        "\t\tmin: {:.2}, max: {:.2}, mean: {:.2}, sd: {:.2}",
        s.min(),
        s.max(),
        s.mean().unwrap_or_default(),
        s.std_dev().unwrap_or_default(),
    );
    println!(
        "\t\tmedian: {:.2}, p90: {:.2}, p99: {:.2}",
        s.median(),
        s.percentile(90),
        s.percentile(99),
    );
}

fn main() -> Result<()> {
    let option = SimOpt::parse();

    env_logger::builder()
        .target(cubic_hystart_tools::log_target(&option.log_file)?)
        .filter_level(option.log_level)
        .format_timestamp_millis()
        .init();

    let conf = Arc::new(CubicConfig::from(&load_config(&option)?));
    let path = PathConfig {
        rtt: option.rtt,
        jitter: option.jitter,
        bandwidth: option.bandwidth,
        buffer: option.buffer,
    };
    info!("simulating {} flows over {:?}", option.flows, path);

    let start = Instant::now();
    let mut sim = Simulator::new(path, &conf, option.flows, option.seed);
    sim.run(option.duration);

    println!();
    println!(
        "simulated {}ms in {:?}",
        option.duration,
        start.elapsed()
    );
    for (id, report) in sim.reports().iter().enumerate() {
        print_report(id, report);
    }
    println!();

    Ok(())
}
