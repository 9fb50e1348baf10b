//! Basic strand example
//!
//! A task that counts down by rescheduling itself, plus a few tasks that
//! yield to each other, spread over a small worker pool.
//!
//! # Environment Variables
//!
//! - `STRAND_LOG=debug` - Log filter (EnvFilter syntax)
//! - `STRAND_THREADS=4` - Worker threads
//! - `STRAND_USE_CALLER=0` - Keep the main thread out of the pool

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strand::{spawn, yield_now, Runtime, Scheduler, SchedulerConfig, Thread};
use tracing::{debug, info};

// STRAND_LOG=debug cargo run -p strand-basic
fn countdown(n: usize, done: Arc<AtomicUsize>) {
    info!(n, thread = %Thread::current_name(), "countdown");
    if n == 0 {
        done.fetch_add(1, Ordering::SeqCst);
        return;
    }
    if let Some(sched) = Scheduler::current() {
        sched.schedule(move || countdown(n - 1, done));
    }
}

fn main() -> strand::RuntimeResult<()> {
    strand::init_logging();
    println!("=== strand Basic Example ===\n");

    let runtime = Runtime::new(SchedulerConfig::from_env().name("basic"))?;
    let completed = Arc::new(AtomicUsize::new(0));

    let c = completed.clone();
    runtime.block_on(move || {
        info!("Spawning tasks...");
        spawn({
            let c = c.clone();
            move || countdown(5, c)
        });

        for i in 1..=3 {
            let c = c.clone();
            spawn(move || {
                for j in 0..3 {
                    debug!(task = i, iteration = j, id = ?strand::current_id(), "working");
                    yield_now();
                }
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    println!("\nCompleted: {}/4", completed.load(Ordering::SeqCst));
    println!("=== Example Complete ===");
    Ok(())
}
