//! Multi-threaded scheduler behaviour.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_runtime::{Fiber, FiberState, Scheduler, Task, Thread};

fn countdown(n: usize, seen: Arc<Mutex<Vec<usize>>>) {
    seen.lock().push(n);
    if n == 0 {
        return;
    }
    if let Some(sched) = Scheduler::current() {
        sched.schedule(move || countdown(n - 1, seen));
    }
}

#[test]
fn self_rescheduling_countdown() {
    let sched = Scheduler::new(3, false, "countdown").unwrap();
    sched.start().unwrap();
    assert_eq!(sched.thread_ids().len(), 3);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    sched.schedule(move || countdown(5, s));

    // Stop only drains what is queued, so wait for the chain to finish.
    for _ in 0..200 {
        if seen.lock().len() == 6 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    sched.stop();
    assert_eq!(*seen.lock(), vec![5, 4, 3, 2, 1, 0]);
}

#[test]
fn concurrent_submitters_run_every_task_once() {
    const SUBMITTERS: usize = 4;
    const PER: usize = 250;

    let sched = Scheduler::new(3, false, "fanin").unwrap();
    sched.start().unwrap();

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let runs = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..SUBMITTERS)
        .map(|p| {
            let sched = sched.clone();
            let seen = seen.clone();
            let runs = runs.clone();
            std::thread::spawn(move || {
                for i in 0..PER {
                    let seen = seen.clone();
                    let runs = runs.clone();
                    sched.schedule(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        assert!(seen.lock().insert(p * PER + i));
                    });
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    sched.stop();
    assert_eq!(runs.load(Ordering::SeqCst), SUBMITTERS * PER);
    assert_eq!(seen.lock().len(), SUBMITTERS * PER);
}

#[test]
fn pinned_tasks_run_on_their_thread() {
    let sched = Scheduler::new(3, false, "pinned").unwrap();
    sched.start().unwrap();
    let target = sched.thread_ids()[1];

    let tids = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..20 {
        let t = tids.clone();
        sched.schedule_task(Task::callback(move || t.lock().push(Thread::current_tid())).on_thread(target));
    }
    sched.stop();

    let tids = tids.lock();
    assert_eq!(tids.len(), 20);
    assert!(tids.iter().all(|&tid| tid == target));
}

#[test]
fn yielded_fiber_is_resumed_after_reschedule() {
    let sched = Scheduler::new(2, false, "yield").unwrap();
    sched.start().unwrap();

    let steps = Arc::new(Mutex::new(Vec::new()));
    let s = steps.clone();
    sched.schedule(move || {
        s.lock().push("before");
        let me = Fiber::current();
        if let Some(sched) = Scheduler::current() {
            sched.schedule_fiber(me);
        }
        Fiber::yield_current();
        s.lock().push("after");
    });

    for _ in 0..200 {
        if steps.lock().len() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    sched.stop();
    assert_eq!(*steps.lock(), vec!["before", "after"]);
}

#[test]
fn caller_scheduler_with_workers() {
    let sched = Scheduler::new(3, true, "mixed").unwrap();
    sched.start().unwrap();
    let ids = sched.thread_ids();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], Thread::current_tid());

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 100);
}

#[test]
fn finished_fiber_task_is_skipped() {
    let fiber = Fiber::new(|| {}, 0, true);
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);

    let sched = Scheduler::new(1, false, "term").unwrap();
    sched.start().unwrap();
    sched.schedule_fiber(fiber);
    sched.stop();
    assert_eq!(sched.active_count(), 0);
}
