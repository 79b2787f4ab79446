use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cronwheel::{AddError, Scheduler};

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let begun = Instant::now();
    while !done() && begun.elapsed() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn every_second_job_fires_on_a_one_second_cadence() {
    let scheduler = Scheduler::new(Duration::from_millis(100), 512);
    let fires: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = fires.clone();
    scheduler
        .add("every-second", "* * * * * ?", move || {
            sink.lock().unwrap().push(Instant::now());
        })
        .unwrap();

    wait_until(Duration::from_secs(8), || fires.lock().unwrap().len() >= 5);
    scheduler.shutdown();

    let fires = fires.lock().unwrap();
    assert!(fires.len() >= 5, "only {} fires", fires.len());
    // Whole-second calendar cadence, give or take the tick and sleep jitter.
    for pair in fires.windows(2).take(4) {
        let gap = pair[1] - pair[0];
        assert!(
            gap > Duration::from_millis(600) && gap < Duration::from_millis(1500),
            "irregular gap {gap:?}"
        );
    }
}

#[test]
fn cancel_before_fire_suppresses_the_body() {
    let scheduler = Scheduler::new(Duration::from_millis(100), 512);
    let invoked = Arc::new(AtomicUsize::new(0));

    let counter = invoked.clone();
    scheduler
        .add("noon", "0 0 12 * * ?", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(scheduler.cancel("noon"));
    // Idempotent: the id is gone, cancelling again is a no-op success.
    assert!(scheduler.cancel("noon"));

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.job_count(), 0);
    assert!(scheduler.shutdown().is_empty());
}

#[test]
fn late_start_fires_on_the_first_tick_after_the_deadline() {
    // One-second cron under a 200 ms tick: the deadline rarely aligns with
    // a tick boundary, so the first fire lands on the tick after it.
    let scheduler = Scheduler::new(Duration::from_millis(200), 32);
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let begun = Instant::now();
    scheduler
        .add("soon", "* * * * * ?", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    wait_until(Duration::from_secs(3), || fired.load(Ordering::SeqCst) > 0);
    let elapsed = begun.elapsed();
    scheduler.shutdown();

    assert!(fired.load(Ordering::SeqCst) > 0);
    // Never before the next whole second; at most a tick (plus jitter) late.
    assert!(elapsed < Duration::from_millis(1600), "first fire took {elapsed:?}");
}

#[test]
fn add_rejects_expressions_beyond_the_year_cap() {
    let scheduler = Scheduler::new(Duration::from_millis(100), 512);

    let parse_err = scheduler.add("future", "0 0 0 1 1 ? 2200", || {}).unwrap_err();
    assert!(matches!(parse_err, AddError::InvalidCron(_)));

    let exhausted = scheduler.add("spent", "0 0 0 1 1 ? 1970", || {}).unwrap_err();
    assert!(matches!(exhausted, AddError::ExpressionExhausted));

    assert_eq!(scheduler.job_count(), 0);
    scheduler.shutdown();
}

#[test]
fn shutdown_reports_only_jobs_that_never_fired() {
    let scheduler = Scheduler::new(Duration::from_millis(50), 64);
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    scheduler
        .add("busy", "* * * * * ?", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    scheduler.add("noon", "0 0 12 * * ?", || {}).unwrap();
    scheduler.add("midnight", "0 0 0 * * ?", || {}).unwrap();

    wait_until(Duration::from_secs(3), || fired.load(Ordering::SeqCst) > 0);
    assert!(scheduler.cancel("midnight"));

    let unfired = scheduler.shutdown();
    // "busy" has fired (its current handle may be pending re-arm, but the
    // job ran); "midnight" was cancelled; only "noon" never got to run.
    assert!(unfired.contains(&"noon".to_string()));
    assert!(!unfired.contains(&"midnight".to_string()));
    assert!(fired.load(Ordering::SeqCst) > 0);
}

#[test]
fn replacing_a_job_keeps_a_single_registration() {
    let scheduler = Scheduler::new(Duration::from_millis(50), 64);
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let counter = first.clone();
    scheduler
        .add("job", "* * * * * ?", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let counter = second.clone();
    scheduler
        .add("job", "* * * * * ?", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(scheduler.job_count(), 1);

    wait_until(Duration::from_secs(4), || second.load(Ordering::SeqCst) >= 2);
    scheduler.shutdown();

    assert!(second.load(Ordering::SeqCst) >= 2);
    assert_eq!(first.load(Ordering::SeqCst), 0, "replaced body must not run");
}
