//! Facade behavior: block_on, free functions, fallbacks off the runtime.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use strand::{Runtime, SchedulerConfig};

#[test]
fn block_on_waits_for_spawned_tasks() {
    let rt = Runtime::new(SchedulerConfig::new().threads(2).use_caller(true).name("block-on")).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    let d = done.clone();
    let value = rt.block_on(move || {
        for _ in 0..64 {
            let d = d.clone();
            strand::spawn(move || {
                d.fetch_add(1, Ordering::SeqCst);
            });
        }
        7
    });

    assert_eq!(value, 7);
    assert_eq!(done.load(Ordering::SeqCst), 64);
}

#[test]
fn yield_now_interleaves_tasks() {
    let rt = Runtime::new(SchedulerConfig::new().threads(1).use_caller(false).name("yield")).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    rt.spawn(move || {
        for name in ["a", "b"] {
            let o = o.clone();
            strand::spawn(move || {
                o.lock().push(format!("{}1", name));
                strand::yield_now();
                o.lock().push(format!("{}2", name));
            });
        }
    });
    rt.shutdown();

    assert_eq!(*order.lock(), vec!["a1", "b1", "a2", "b2"]);
}

#[test]
fn sleep_in_task_frees_the_worker() {
    let rt = Runtime::new(SchedulerConfig::new().threads(1).use_caller(false).name("sleep")).unwrap();
    let (tx, rx) = mpsc::channel();

    let sleeper = tx.clone();
    rt.spawn(move || {
        assert!(strand::in_fiber());
        let start = Instant::now();
        strand::sleep(Duration::from_millis(80));
        let _ = sleeper.send(("sleeper", start.elapsed()));
    });
    rt.spawn(move || {
        let _ = tx.send(("other", Duration::ZERO));
    });

    let (first, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (second, slept) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, "other");
    assert_eq!(second, "sleeper");
    assert!(slept >= Duration::from_millis(70), "{:?}", slept);
    rt.shutdown();
}

#[test]
fn runtime_timer_fires() {
    let rt = Runtime::new(SchedulerConfig::new().threads(1).use_caller(false).name("timer")).unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    rt.add_timer(
        20,
        move || {
            let _ = tx.lock().send(());
        },
        false,
    );
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!rt.io_manager().has_timer());
    rt.shutdown();
    rt.shutdown();
}

#[test]
fn helpers_outside_runtime() {
    assert!(!strand::in_fiber());
    strand::yield_now();

    let start = Instant::now();
    strand::sleep(Duration::from_millis(10));
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[test]
#[should_panic(expected = "outside a runtime")]
fn spawn_outside_runtime_panics() {
    strand::spawn(|| {});
}
