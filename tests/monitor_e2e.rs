use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};

use kyromatch::{
    ConnectionId, ConsumerDispatcher, ConsumerPoint, ConsumerSetChangeCallback, MatchingConfig,
    MatchingEngine, ProxySubscription, SelectionCriteria, SelectorDomain,
};

fn engine() -> MatchingEngine {
    // RUST_LOG=kyromatch=debug shows registry churn and deliveries.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    MatchingEngine::new(MatchingConfig::default())
}

fn recorder() -> (Arc<dyn ConsumerSetChangeCallback>, Receiver<bool>) {
    let (tx, rx) = unbounded();
    let tx = Mutex::new(tx);
    let callback: Arc<dyn ConsumerSetChangeCallback> = Arc::new(move |is_empty: bool| {
        let _ = tx.lock().unwrap().send(is_empty);
    });
    (callback, rx)
}

// Collects deliveries until the pool has been quiet for a while.
fn drain(rx: &Receiver<bool>) -> Vec<bool> {
    let mut seen = Vec::new();
    while let Ok(is_empty) = rx.recv_timeout(Duration::from_millis(300)) {
        seen.push(is_empty);
    }
    seen
}

#[test]
fn first_consumer_fires_once_for_a_burst() {
    let engine = engine();
    let conn = ConnectionId::new();
    let (callback, rx) = recorder();
    let present = engine
        .register_consumer_set_monitor(conn, "ts", Some("a/b"), callback)
        .unwrap();
    assert!(!present);

    for name in ["s1", "s2", "s3"] {
        let sub = ConsumerDispatcher::new(name, "ts");
        engine
            .add_consumer_dispatcher_match_target(&sub, &SelectionCriteria::topic("a/b"))
            .unwrap();
    }

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(!first);
    assert!(drain(&rx).is_empty());
}

#[test]
fn last_consumer_fires_once_and_middle_changes_are_silent() {
    let engine = engine();
    let conn = ConnectionId::new();
    let (callback, rx) = recorder();

    let a = ConsumerDispatcher::new("a", "ts");
    let b = ProxySubscription::new("bus-b");
    engine
        .add_consumer_dispatcher_match_target(&a, &SelectionCriteria::topic("x/y"))
        .unwrap();
    engine
        .add_proxy_subscription_match_target(&b, "ts", &SelectionCriteria::topic("x/*"))
        .unwrap();

    let present = engine
        .register_consumer_set_monitor(conn, "ts", Some("x/y"), callback)
        .unwrap();
    assert!(present);

    // 2 -> 1
    engine
        .remove_consumer_dispatcher_match_target(a.id, &SelectionCriteria::topic("x/y"))
        .unwrap();
    assert!(drain(&rx).is_empty());

    // 1 -> 2
    engine
        .add_consumer_dispatcher_match_target(&a, &SelectionCriteria::topic("x/y"))
        .unwrap();
    assert!(drain(&rx).is_empty());

    engine
        .remove_consumer_dispatcher_match_target(a.id, &SelectionCriteria::topic("x/y"))
        .unwrap();
    engine.remove_proxy_subscription_match_target(b.id).unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    assert!(drain(&rx).is_empty());
}

#[test]
fn consumer_points_and_selectors() {
    let engine = engine();
    let conn = ConnectionId::new();
    let (callback, rx) = recorder();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("q"), callback)
        .unwrap();

    // Consumer points are not monitored consumers.
    engine
        .add_consumer_point_match_target(
            &ConsumerPoint::new("cp"),
            "ts",
            &SelectionCriteria::topic("q"),
        )
        .unwrap();
    assert!(drain(&rx).is_empty());

    // A selector never hides a subscription from a monitor.
    let picky = ConsumerDispatcher::new("picky", "ts");
    engine
        .add_consumer_dispatcher_match_target(
            &picky,
            &SelectionCriteria::topic("q").with_selector("never = 'true'", SelectorDomain::Jms),
        )
        .unwrap();
    assert_eq!(drain(&rx), vec![false]);
}

#[test]
fn duplicate_registration_delivers_once() {
    let engine = engine();
    let conn = ConnectionId::new();
    let (callback, rx) = recorder();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("a"), Arc::clone(&callback))
        .unwrap();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("a"), Arc::clone(&callback))
        .unwrap();
    assert_eq!(engine.monitored_expressions(conn).unwrap().len(), 1);

    engine
        .add_consumer_dispatcher_match_target(
            &ConsumerDispatcher::new("s", "ts"),
            &SelectionCriteria::topic("a"),
        )
        .unwrap();
    assert_eq!(drain(&rx), vec![false]);
}

#[test]
fn deregistering_unknown_callback_is_not_possible() {
    let engine = engine();
    let conn = ConnectionId::new();
    let (registered, rx) = recorder();
    let (stranger, _unused) = recorder();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("a"), Arc::clone(&registered))
        .unwrap();

    let err = engine
        .deregister_consumer_set_monitor(conn, &stranger)
        .unwrap_err();
    assert!(err.is_not_possible());

    // The existing registration still works.
    engine
        .add_consumer_dispatcher_match_target(
            &ConsumerDispatcher::new("s", "ts"),
            &SelectionCriteria::topic("a"),
        )
        .unwrap();
    assert_eq!(drain(&rx), vec![false]);

    engine.deregister_consumer_set_monitor(conn, &registered).unwrap();
    assert!(engine.monitored_expressions(conn).unwrap().is_empty());
    let err = engine
        .deregister_consumer_set_monitor(conn, &registered)
        .unwrap_err();
    assert!(err.is_not_possible());
}

#[test]
fn closing_a_connection_removes_its_monitors() {
    let engine = engine();
    let closing = ConnectionId::new();
    let staying = ConnectionId::new();
    let (cb1, rx1) = recorder();
    let (cb2, _rx2) = recorder();
    let (cb3, rx3) = recorder();
    engine
        .register_consumer_set_monitor(closing, "ts", Some("a"), cb1)
        .unwrap();
    engine
        .register_consumer_set_monitor(closing, "ts", None, cb2)
        .unwrap();
    engine
        .register_consumer_set_monitor(staying, "ts", Some("a"), cb3)
        .unwrap();

    engine.remove_consumer_set_monitors(closing).unwrap();
    engine.remove_consumer_set_monitors(ConnectionId::new()).unwrap();
    assert!(engine.monitored_expressions(closing).unwrap().is_empty());

    let snapshot = engine.monitored_expressions(staying).unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].expression, "ts/a");
    assert_eq!(snapshot[0].callback_count, 1);

    engine
        .add_consumer_dispatcher_match_target(
            &ConsumerDispatcher::new("s", "ts"),
            &SelectionCriteria::topic("a"),
        )
        .unwrap();
    assert_eq!(drain(&rx3), vec![false]);
    assert!(drain(&rx1).is_empty());
}

#[test]
fn wildcard_monitor_tracks_wildcard_consumers() {
    let engine = engine();
    let conn = ConnectionId::new();
    let (callback, rx) = recorder();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("a//."), callback)
        .unwrap();

    let deep = ConsumerDispatcher::new("deep", "ts");
    let criteria = SelectionCriteria::topic("a/b/*");
    engine.add_consumer_dispatcher_match_target(&deep, &criteria).unwrap();
    assert_eq!(drain(&rx), vec![false]);

    let snapshot = engine.monitored_expressions(conn).unwrap();
    assert!(snapshot[0].wildcarded);
    assert_eq!(snapshot[0].consumer_count, 1);

    engine
        .remove_consumer_dispatcher_match_target(deep.id, &criteria)
        .unwrap();
    assert_eq!(drain(&rx), vec![true]);
}

#[test]
fn full_queue_defers_and_collapses_churn() {
    let engine = MatchingEngine::new(MatchingConfig {
        callback_workers: 1,
        callback_queue_capacity: 1,
        ..MatchingConfig::default()
    });
    let conn = ConnectionId::new();

    // Holds the only worker inside the first delivery until the gate opens.
    let (started_tx, started_rx) = unbounded();
    let (gate_tx, gate_rx) = unbounded::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let blocker: Arc<dyn ConsumerSetChangeCallback> = Arc::new(move |_is_empty: bool| {
        let _ = started_tx.send(());
        let _ = gate_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
    });
    let (queued, queued_rx) = recorder();
    let (churned, churned_rx) = recorder();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("hold"), blocker)
        .unwrap();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("queued"), queued)
        .unwrap();
    engine
        .register_consumer_set_monitor(conn, "ts", Some("churn"), churned)
        .unwrap();

    let add = |topic: &str| {
        let cd = ConsumerDispatcher::new(topic, "ts");
        engine
            .add_consumer_dispatcher_match_target(&cd, &SelectionCriteria::topic(topic))
            .unwrap();
        cd
    };

    add("hold");
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    add("queued");

    // The queue is full from here on: add, remove, add again.
    let first = add("churn");
    engine
        .remove_consumer_dispatcher_match_target(first.id, &SelectionCriteria::topic("churn"))
        .unwrap();
    add("churn");
    assert!(churned_rx.recv_timeout(Duration::from_millis(100)).is_err());

    gate_tx.send(()).unwrap();
    assert_eq!(drain(&churned_rx), vec![false]);
    assert_eq!(drain(&queued_rx), vec![false]);
}

// Records deliveries and counts overlapping calls.
#[derive(Default)]
struct Watch {
    in_call: AtomicBool,
    overlaps: AtomicUsize,
    seen: Mutex<Vec<bool>>,
}

impl ConsumerSetChangeCallback for Watch {
    fn consumer_set_change(&self, is_empty: bool) {
        if self.in_call.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.seen.lock().unwrap().push(is_empty);
        thread::sleep(Duration::from_micros(200));
        self.in_call.store(false, Ordering::SeqCst);
    }
}

impl Watch {
    // Waits until no delivery has arrived for a while.
    fn settle(&self) -> Vec<bool> {
        loop {
            let before = self.seen.lock().unwrap().len();
            thread::sleep(Duration::from_millis(300));
            let seen = self.seen.lock().unwrap();
            if seen.len() == before {
                return seen.clone();
            }
        }
    }
}

// Deliveries for a monitor registered on an empty set alternate, starting
// with "has consumers", and the last one reflects the final set.
fn assert_consistent(seen: &[bool], finally_empty: bool) {
    for (i, is_empty) in seen.iter().enumerate() {
        assert_eq!(*is_empty, i % 2 == 1, "deliveries out of order: {seen:?}");
    }
    match seen.last() {
        Some(last) => assert_eq!(*last, finally_empty, "stale final delivery: {seen:?}"),
        None => assert!(finally_empty, "no delivery for a non-empty set"),
    }
}

#[test]
fn concurrent_churn_keeps_deliveries_serialized_and_consistent() {
    let engine = Arc::new(MatchingEngine::new(MatchingConfig {
        callback_workers: 4,
        ..MatchingConfig::default()
    }));
    let conn = ConnectionId::new();

    let stable: Vec<(&str, Arc<Watch>)> = ["w/a", "w/*", "w//."]
        .into_iter()
        .map(|expr| (expr, Arc::new(Watch::default())))
        .collect();
    for (expr, watch) in &stable {
        let callback: Arc<dyn ConsumerSetChangeCallback> = watch.clone();
        let present = engine
            .register_consumer_set_monitor(conn, "ts", Some(*expr), callback)
            .unwrap();
        assert!(!present);
    }

    let topics = ["w/a", "w/b", "w/*", "w/a/b", "w//."];
    let mut handles = Vec::new();
    for t in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..150 {
                let topic = topics[(t + i) % topics.len()];
                let criteria = SelectionCriteria::topic(topic);
                let cd = ConsumerDispatcher::new(format!("s-{t}-{i}"), "ts");
                engine.add_consumer_dispatcher_match_target(&cd, &criteria).unwrap();
                let ps = ProxySubscription::new(format!("bus-{t}-{i}"));
                engine
                    .add_proxy_subscription_match_target(&ps, "ts", &criteria)
                    .unwrap();
                engine.remove_consumer_dispatcher_match_target(cd.id, &criteria).unwrap();
                engine.remove_proxy_subscription_match_target(ps.id).unwrap();
            }
        }));
    }

    // Monitors come and go on overlapping expressions while consumers churn.
    let churn_watches: Vec<Arc<Watch>> = (0..2).map(|_| Arc::new(Watch::default())).collect();
    for (n, watch) in churn_watches.iter().enumerate() {
        let engine = Arc::clone(&engine);
        let watch = Arc::clone(watch);
        handles.push(thread::spawn(move || {
            let own = ConnectionId::new();
            for i in 0..100 {
                let expr = if (n + i) % 2 == 0 { "w//." } else { "w/*" };
                let callback: Arc<dyn ConsumerSetChangeCallback> = watch.clone();
                engine
                    .register_consumer_set_monitor(own, "ts", Some(expr), Arc::clone(&callback))
                    .unwrap();
                engine.deregister_consumer_set_monitor(own, &callback).unwrap();
            }
            engine.remove_consumer_set_monitors(own).unwrap();
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let last = ConsumerDispatcher::new("last", "ts");
    engine
        .add_consumer_dispatcher_match_target(&last, &SelectionCriteria::topic("w/b"))
        .unwrap();

    for (expr, watch) in &stable {
        let seen = watch.settle();
        assert_eq!(watch.overlaps.load(Ordering::SeqCst), 0, "{expr} re-entered");
        assert_consistent(&seen, *expr == "w/a");
    }
    for watch in &churn_watches {
        watch.settle();
        assert_eq!(watch.overlaps.load(Ordering::SeqCst), 0);
    }
    assert_eq!(engine.monitored_expressions(conn).unwrap().len(), 3);
}
