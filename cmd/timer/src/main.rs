//! Timer example
//!
//! A recurring 500 ms timer that, after three ticks, is reset to a 1 s
//! period and, after six, cancels itself. A one-shot timer and a sleeping
//! task run alongside it.
//!
//! # Environment Variables
//!
//! - `STRAND_LOG=debug` - Log filter (EnvFilter syntax)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use strand::{Runtime, SchedulerConfig, Timer};
use tracing::info;

fn main() -> strand::RuntimeResult<()> {
    strand::init_logging();

    let runtime = Runtime::new(SchedulerConfig::from_env().name("timer").threads(2).use_caller(false))?;
    let start = Instant::now();
    let ticks = Arc::new(AtomicUsize::new(0));
    let handle: Arc<OnceLock<Arc<Timer>>> = Arc::new(OnceLock::new());

    let t = ticks.clone();
    let h = handle.clone();
    let timer = runtime.add_timer(
        500,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            info!(tick = n, elapsed_ms = start.elapsed().as_millis() as u64, "recurring");
            let Some(timer) = h.get() else { return };
            match n {
                3 => {
                    timer.reset(1000, true);
                    info!("period is now 1000 ms");
                }
                6 => {
                    timer.cancel();
                    info!("cancelled");
                }
                _ => {}
            }
        },
        true,
    );
    let _ = handle.set(timer);

    runtime.add_timer(
        1200,
        move || info!(elapsed_ms = start.elapsed().as_millis() as u64, "one-shot"),
        false,
    );

    runtime.spawn(move || {
        strand::sleep(Duration::from_millis(800));
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "task woke from sleep");
    });

    while ticks.load(Ordering::SeqCst) < 6 {
        std::thread::sleep(Duration::from_millis(50));
    }
    runtime.shutdown();
    println!("ticks: {}", ticks.load(Ordering::SeqCst));
    Ok(())
}
