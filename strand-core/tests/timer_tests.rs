//! Integration tests for the shared timer scheduler.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use strand_core::{Error, RuntimePool, Scheduler, SchedulerConfig, Timer, WorkerConfig, WorkerPool};

fn start(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<RuntimePool>) {
    let pool = RuntimePool::new(WorkerConfig::new().max_threads(16)).unwrap();
    let scheduler = Scheduler::start(config, pool.clone() as Arc<dyn WorkerPool>).unwrap();
    (scheduler, pool)
}

fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

#[test]
fn test_timer_fires_after_delay() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let delay = Duration::from_millis(50);
    let started = Instant::now();
    scheduler
        .schedule(delay, move |_| {
            let _ = tx.lock().send(Instant::now());
        })
        .unwrap();

    let fired_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(fired_at.duration_since(started) >= delay);
    scheduler.shutdown();
}

fn assert_never_early(scheduler: &Scheduler, delays: &[Duration], rounds: usize) {
    let elapsed: Arc<Mutex<Vec<(Duration, Duration)>>> = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..rounds {
        for &delay in delays {
            let elapsed = Arc::clone(&elapsed);
            let started = Instant::now();
            scheduler
                .schedule(delay, move |_| {
                    elapsed.lock().push((delay, started.elapsed()));
                })
                .unwrap();
        }
    }

    let expected = rounds * delays.len();
    assert!(wait_until(Duration::from_secs(10), || elapsed.lock().len() == expected));
    for (delay, took) in elapsed.lock().iter() {
        assert!(took >= delay, "fired after {took:?}, delay was {delay:?}");
    }
}

#[test]
fn test_short_timers_never_fire_early() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    let delays = [
        Duration::from_micros(300),
        Duration::from_micros(1_900),
        Duration::from_millis(2),
        Duration::from_micros(2_500),
    ];
    assert_never_early(&scheduler, &delays, 75);
    scheduler.shutdown();
}

#[test]
fn test_approx_clock_timers_never_fire_early() {
    let config = SchedulerConfig::new()
        .approx_threshold(Duration::from_millis(10))
        .sample_interval(Duration::from_millis(1), Duration::from_millis(20));
    let (scheduler, _pool) = start(config);

    // Let the sampler back off so the cached clock is stale.
    thread::sleep(Duration::from_millis(60));
    let delays = [Duration::from_micros(10_500), Duration::from_millis(15)];
    assert_never_early(&scheduler, &delays, 50);
    scheduler.shutdown();
}

#[test]
fn test_cancelled_timer_never_fires() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let timer = scheduler
        .schedule(Duration::from_millis(50), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(scheduler.cancel(&timer));
    assert!(!timer.is_queued());
    assert!(!scheduler.cancel(&timer));

    thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.stats().cancelled(), 1);
    scheduler.shutdown();
}

#[test]
fn test_requeue_moves_timer() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let timer = Timer::builder().owner("requeue").build(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    scheduler.queue(&timer, Duration::from_secs(60)).unwrap();
    scheduler.queue(&timer, Duration::from_millis(20)).unwrap();
    assert_eq!(scheduler.pending(), 1);

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending(), 0);
    scheduler.shutdown();
}

#[test]
fn test_timer_requeues_itself() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let weak = Arc::downgrade(&scheduler);
    let timer = Timer::new(move |timer| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.queue(timer, Duration::from_millis(5)).unwrap();
            }
        }
    });
    scheduler.queue(&timer, Duration::from_millis(5)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 3));
    scheduler.shutdown();
}

#[test]
fn test_fire_order_follows_wake_time() {
    let (scheduler, _pool) = start(SchedulerConfig::default().dispatch_limit(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    for delay in [90u64, 30, 60] {
        let order = Arc::clone(&order);
        scheduler
            .schedule(Duration::from_millis(delay), move |_| order.lock().push(delay))
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || order.lock().len() == 3));
    assert_eq!(*order.lock(), vec![30, 60, 90]);
    scheduler.shutdown();
}

#[test]
fn test_burst_respects_dispatch_limit() {
    const LIMIT: usize = 4;
    const TIMERS: usize = 1000;

    let (scheduler, _pool) = start(SchedulerConfig::default().dispatch_limit(LIMIT));
    let fired = Arc::new(AtomicUsize::new(0));

    let at = scheduler.current_exact_time() + 1;
    for _ in 0..TIMERS {
        let counter = Arc::clone(&fired);
        scheduler
            .schedule_at(at, move |_| {
                thread::sleep(Duration::from_micros(200));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(20), || {
        fired.load(Ordering::SeqCst) == TIMERS
    }));
    assert!(scheduler.peak_in_flight() <= LIMIT);
    assert_eq!(scheduler.stats().fired(), TIMERS as u64);
    assert_eq!(scheduler.stats().dropped(), 0);
    scheduler.shutdown();
}

#[test]
fn test_panicking_callback_is_contained() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    let fired = Arc::new(AtomicUsize::new(0));

    scheduler
        .schedule(Duration::from_millis(5), |_| panic!("callback failure"))
        .unwrap();
    let counter = Arc::clone(&fired);
    scheduler
        .schedule(Duration::from_millis(30), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(scheduler.stats().panicked(), 1);
    scheduler.shutdown();
}

#[test]
fn test_schedule_after_shutdown_fails() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    scheduler.shutdown();
    assert!(scheduler.is_shutdown());

    let result = scheduler.schedule(Duration::from_millis(5), |_| {});
    assert!(matches!(result, Err(Error::SchedulerShutdown)));
}

#[test]
fn test_approximate_clock_tracks_exact() {
    let (scheduler, _pool) = start(SchedulerConfig::default());
    thread::sleep(Duration::from_millis(50));

    let exact = scheduler.current_exact_time();
    let approx = scheduler.current_approx_time();
    assert!(approx <= exact);
    assert!(exact - approx <= 200);
    scheduler.shutdown();
}

#[test]
fn test_timer_queued_in_one_scheduler_at_a_time() {
    let (first, _pool) = start(SchedulerConfig::default());
    let (second, _other_pool) = start(SchedulerConfig::default());
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let timer = Timer::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    first.queue(&timer, Duration::from_millis(30)).unwrap();

    assert!(matches!(
        second.queue(&timer, Duration::from_millis(1)),
        Err(Error::TimerBusy(id)) if id == timer.id()
    ));
    assert!(!second.cancel(&timer));
    assert_eq!(second.pending(), 0);
    assert_eq!(first.pending(), 1);

    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1));

    // Fired timers are free to move.
    second.queue(&timer, Duration::from_millis(10)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 2));

    first.shutdown();
    second.shutdown();
}
