//! Adds two generated vectors of `VECTOR_LEN` integers across a group of processes.
//!
//! ```text
//! VECSUM_PROCS=4 vector-sum
//! ```
//!
//! The launched process becomes the coordinator and spawns the other ranks itself.
//! `VECSUM_SEED` fixes the generated operands and `VECSUM_REDUCTION` selects how the grand total
//! is reduced; `RUST_LOG` controls diagnostics on stderr.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error};
use mpi_vector_sum::{run, Communicator, GroupConfig, Result, World, VECTOR_LEN};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    install_panic_hook();

    if let Err(e) = try_main() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let config = GroupConfig::from_env()?;
    let world = World::init(config.procs)?;

    let seed = config.seed.unwrap_or_else(clock_seed);
    if world.is_coordinator() {
        debug!("Seeding operands with {} and reducing with {}", seed, config.reduction);
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    if let Some(report) = run(&world, VECTOR_LEN, &mut rng, config.reduction)? {
        println!("{}", report);
    }

    world.destruct()
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

/// A panicking rank can not take part in later collectives, so log where it happened and abort.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = backtrace::Backtrace::new();
        error!("{}\n{:?}", info, backtrace);
        std::process::abort();
    }));
}
