//! Programs the default core event set, sleeps briefly, samples once, and
//! prints per-core instructions/cycles plus the system uncore totals.

use std::time::Duration;

use pcm_core::engine::program::ProgramMode;
use pcm_core::Pcm;

fn main() {
    tracing_subscriber::fmt::init();

    let mut pcm = match Pcm::new() {
        Ok(pcm) => pcm,
        Err(e) => {
            eprintln!("failed to initialize: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = pcm.program(ProgramMode::DefaultCache) {
        eprintln!("failed to program PMU: {e}");
        std::process::exit(1);
    }

    std::thread::sleep(Duration::from_millis(100));

    match pcm.sample_all() {
        Ok((_system, _sockets, cores)) => {
            println!("{:>6} {:>14} {:>14}", "os_id", "instructions", "cycles");
            for (os_id, state) in &cores {
                println!("{:>6} {:>14} {:>14}", os_id, state.instructions_retired, state.core_cycles_unhalted);
            }
        }
        Err(e) => {
            eprintln!("failed to sample: {e}");
        }
    }

    if let Err(e) = pcm.cleanup() {
        eprintln!("failed to clean up: {e}");
    }
}
