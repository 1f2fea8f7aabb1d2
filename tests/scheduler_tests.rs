/// Scheduler tests
///
/// Cadence under a manual clock, reruns, replacement and the control loop
/// Run with: cargo test --test scheduler_tests

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use wardendb::core::{ManualClock, SystemClock};
use wardendb::scheduler::{Scheduler, Task, TaskEvent, TaskKind, TaskOutcome, task_fn};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap()
}

fn counting_task(counter: Arc<AtomicUsize>) -> Arc<dyn Task> {
    task_fn(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

async fn completed(events: &mut broadcast::Receiver<TaskEvent>, name: &str) -> TaskOutcome {
    let wait = async {
        loop {
            if let TaskEvent::Completed { name: n, outcome } = events.recv().await.unwrap() {
                if n == name {
                    return outcome;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("task did not complete")
}

#[tokio::test]
async fn test_periodic_cadence_over_five_cycles() {
    let clock = Arc::new(ManualClock::new(start_time()));
    let scheduler = Scheduler::new(clock.clone());
    let mut events = scheduler.subscribe();
    let runs = Arc::new(AtomicUsize::new(0));
    scheduler
        .add_periodic("sweep", start_time(), Duration::from_secs(600), counting_task(runs.clone()))
        .unwrap();

    for cycle in 0..5 {
        let due = start_time() + ChronoDuration::minutes(10 * cycle);

        assert!(scheduler.tick(due - ChronoDuration::seconds(1)).is_empty());

        clock.set(due);
        assert_eq!(scheduler.tick(due), vec!["sweep".to_string()]);
        assert_eq!(completed(&mut events, "sweep").await, TaskOutcome::Success);

        let info = scheduler.task_info("sweep").unwrap();
        assert_eq!(info.last_run, Some(due));
        assert_eq!(info.next_run, Some(due + ChronoDuration::minutes(10)));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_late_tick_runs_once_and_keeps_the_grid() {
    let clock = Arc::new(ManualClock::new(start_time()));
    let scheduler = Scheduler::new(clock.clone());
    let mut events = scheduler.subscribe();
    let runs = Arc::new(AtomicUsize::new(0));
    scheduler
        .add_periodic("sweep", start_time(), Duration::from_secs(600), counting_task(runs.clone()))
        .unwrap();

    // three slots overdue: one run, then the schedule advances one step
    let late = start_time() + ChronoDuration::minutes(25);
    clock.set(late);
    scheduler.tick(late);
    completed(&mut events, "sweep").await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        scheduler.task_info("sweep").unwrap().next_run,
        Some(start_time() + ChronoDuration::minutes(10))
    );
}

#[tokio::test]
async fn test_demanded_rerun_happens_exactly_once() {
    let scheduler = Scheduler::new(Arc::new(ManualClock::new(start_time())));
    let mut events = scheduler.subscribe();
    let runs = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let task = {
        let runs = runs.clone();
        let release = release.clone();
        let seen = seen.clone();
        task_fn(move |ctx| {
            let runs = runs.clone();
            let release = release.clone();
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(ctx.options.clone());
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    release.notified().await;
                }
                Ok(())
            }
        })
    };
    scheduler.add_on_demand("build", task);

    assert!(scheduler.run_task_now("build").unwrap());
    assert!(scheduler.task_info("build").unwrap().running);
    scheduler
        .run_on_completion("build", Some(vec!["forcebuild".to_string()]))
        .unwrap();
    scheduler.demand_task("build").unwrap();
    scheduler.demand_task("build").unwrap();
    assert!(scheduler.task_info("build").unwrap().rerun_pending);

    release.notify_one();
    completed(&mut events, "build").await;
    completed(&mut events, "build").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let info = scheduler.task_info("build").unwrap();
    assert!(!info.running);
    assert!(!info.rerun_pending);
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], None);
    assert_eq!(seen[1], Some(vec!["forcebuild".to_string()]));
}

#[tokio::test]
async fn test_timed_task_fires_once() {
    let clock = Arc::new(ManualClock::new(start_time()));
    let scheduler = Scheduler::new(clock.clone());
    let mut events = scheduler.subscribe();
    let runs = Arc::new(AtomicUsize::new(0));
    let at = start_time() + ChronoDuration::minutes(5);
    scheduler.add_timed("reminder", at, counting_task(runs.clone()));

    assert!(scheduler.tick(start_time()).is_empty());
    clock.set(at);
    assert_eq!(scheduler.tick(at).len(), 1);
    completed(&mut events, "reminder").await;

    let info = scheduler.task_info("reminder").unwrap();
    assert_eq!(info.kind, TaskKind::Timed);
    assert!(info.next_run.is_none());
    assert!(scheduler.tick(at + ChronoDuration::hours(1)).is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_forced_run_keeps_the_scheduled_slot() {
    let clock = Arc::new(ManualClock::new(start_time()));
    let scheduler = Scheduler::new(clock.clone());
    let mut events = scheduler.subscribe();
    let next = start_time() + ChronoDuration::minutes(30);
    scheduler
        .add_periodic("dump", next, Duration::from_secs(3600), counting_task(Arc::new(AtomicUsize::new(0))))
        .unwrap();

    clock.advance(ChronoDuration::minutes(2));
    scheduler.run_task_now("dump").unwrap();
    completed(&mut events, "dump").await;

    let info = scheduler.task_info("dump").unwrap();
    assert_eq!(info.next_run, Some(next));
    assert_eq!(info.interval, "1 hour");
}

#[tokio::test]
async fn test_reregistration_replaces_the_task() {
    let scheduler = Scheduler::new(Arc::new(ManualClock::new(start_time())));
    let mut events = scheduler.subscribe();
    let old = Arc::new(AtomicUsize::new(0));
    let new = Arc::new(AtomicUsize::new(0));

    scheduler.add_on_demand("job", counting_task(old.clone()));
    scheduler.add_on_demand("job", counting_task(new.clone()));
    assert_eq!(scheduler.task_table().len(), 1);

    scheduler.run_task_now("job").unwrap();
    completed(&mut events, "job").await;
    assert_eq!(old.load(Ordering::SeqCst), 0);
    assert_eq!(new.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sub_minute_interval_rejected() {
    let scheduler = Scheduler::new(Arc::new(ManualClock::new(start_time())));
    let noop = task_fn(|_| async { Ok(()) });
    assert!(
        scheduler
            .add_periodic("fast", start_time(), Duration::from_secs(30), noop)
            .is_err()
    );
    assert!(scheduler.task_info("fast").is_none());
}

#[tokio::test]
async fn test_control_loop_dispatches_due_tasks() {
    let scheduler = Scheduler::new(Arc::new(SystemClock));
    let mut events = scheduler.subscribe();
    let runs = Arc::new(AtomicUsize::new(0));
    let handle = scheduler.start();

    // registering wakes the loop
    scheduler.add_timed("now", Utc::now(), counting_task(runs.clone()));
    assert_eq!(completed(&mut events, "now").await, TaskOutcome::Success);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    scheduler.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("control loop did not exit")
        .unwrap();
    assert!(scheduler.tick(Utc::now()).is_empty());
}
