// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

mod config;

use std::{path::PathBuf, time::Instant};

use clap::Parser;
use common::{SystemConfig, TimeS};
use ctr::{testing::SyntheticCore, ResultStatus, System};

/// Drive the CTR scheduler with synthetic cores and report how
/// far virtual time got.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Scheduler iterations to run
    #[arg(short, long, default_value_t = 1000)]
    iterations: u64,
    /// Provision the second ARM11 core
    #[arg(short, long)]
    dual_core: bool,
    /// Maximum slice length in ticks
    #[arg(short, long)]
    slice_length: Option<TimeS>,
    /// Emulated CPU clock, in percent
    #[arg(long)]
    clock_percentage: Option<u32>,
    /// Extra ticks the last core runs past every slice
    #[arg(long, default_value_t = 0)]
    overshoot: u64,
    /// Ticks between heartbeat events
    #[arg(long, default_value_t = 100_000, value_parser = clap::value_parser!(i64).range(1..))]
    heartbeat: TimeS,

    /// Load the system configuration from this file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Save the resulting system configuration to this file
    #[arg(long)]
    save_config: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut sys_config = match &args.config {
        Some(path) => match config::load(path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("Failed to load config from {}: {err}", path.display());
                return;
            }
        },
        None => SystemConfig::default(),
    };
    sys_config.enable_core_2 |= args.dual_core;
    if let Some(slice) = args.slice_length {
        sys_config.max_slice_length = slice;
    }
    if let Some(percentage) = args.clock_percentage {
        sys_config.cpu_clock_percentage = percentage;
    }
    if let Some(path) = &args.save_config {
        match config::save(&sys_config, path) {
            Ok(()) => log::info!("Saved config to {}", path.display()),
            Err(err) => log::error!("Failed to save config to {}: {err}", path.display()),
        }
    }

    let mut system = setup(sys_config, &args);
    let start = Instant::now();
    let mut iterations = 0;
    while iterations < args.iterations {
        match system.run() {
            ResultStatus::Success => iterations += 1,
            status => {
                log::error!("System stopped after {iterations} iterations: {status:?}");
                break;
            }
        }
    }

    println!(
        "Ran {iterations} iterations in {:.2?}: {} ticks, {} us of guest time",
        start.elapsed(),
        system.timing.global_ticks(),
        system.timing.global_time_us()
    );
    for core in 0..system.core_count() {
        let timer = system.timing.timer(core);
        println!(
            "  Core {core}: {} ticks, {} events pending",
            timer.ticks(),
            timer.queued_events()
        );
    }
}

/// Build a system with synthetic cores, a guest thread per core and a
/// periodic heartbeat event.
fn setup(config: SystemConfig, args: &Args) -> System {
    let last_core = config.core_count() - 1;
    let overshoot = args.overshoot;
    let mut system = System::new(config);
    system.init_cores(|id| {
        let core = SyntheticCore::new(id);
        Box::new(if id == last_core {
            core.with_overshoot(overshoot)
        } else {
            core
        })
    });

    for core in 0..system.core_count() {
        if let Err(err) = system.kernel.create_thread(format!("main{core}"), 48, core) {
            log::error!("Failed to create thread on core {core}: {err}");
        }
    }

    let period = args.heartbeat;
    let heartbeat = system
        .timing
        .register_event("heartbeat", move |system: &mut System, beat: u64, late: TimeS| {
            log::debug!(
                "Heartbeat {beat} on core {} at {} us ({late} ticks late)",
                system.running_core(),
                system.timing.global_time_us()
            );
            if let Some(kind) = system.timing.event_type("heartbeat") {
                system.timing.schedule_event(period - late, kind, beat + 1, None);
            }
        });
    system.timing.schedule_event(period, heartbeat, 0, None);
    system
}
