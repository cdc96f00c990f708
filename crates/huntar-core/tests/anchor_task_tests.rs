// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Anchor task completion and anchor slot invariants.

#![allow(missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use huntar_core::{
    completion_channel, AnchorSlot, CloudAnchorError, CloudAnchorManager, LocalAnchor,
    SessionDriver, TaskId, TaskKind, TerminalState,
};
use huntar_dry_tests::{anchor_id, FakeAnchor, FakeSessionDriver};
use proptest::prelude::*;

fn manager() -> (Arc<FakeSessionDriver>, CloudAnchorManager<FakeSessionDriver>) {
    let driver = Arc::new(FakeSessionDriver::new());
    (driver.clone(), CloudAnchorManager::new(driver))
}

#[test]
fn completion_fires_once_across_repeated_frames() {
    let (driver, manager) = manager();
    let (sender, outcomes) = completion_channel();
    let source = driver.anchor();
    let task = manager.host_anchor(&source, sender.completion()).unwrap();

    let tracked = driver.hosting()[0].clone();
    manager.on_update(&driver.poll_updated_anchors());
    assert!(manager.is_pending(task));

    tracked.succeed(&anchor_id("ua-1"));
    let mut fired = 0;
    for _ in 0..5 {
        driver.push_update(&tracked);
        fired += manager.on_update(&driver.poll_updated_anchors());
    }
    assert_eq!(fired, 1);
    assert!(!manager.is_pending(task));

    let outcome = outcomes.try_recv().unwrap();
    assert_eq!(outcome.task, task);
    assert_eq!(outcome.kind, TaskKind::Host);
    assert_eq!(outcome.cloud_anchor_id(), Some(anchor_id("ua-1")));
    assert!(outcomes.try_recv().is_err());
}

#[test]
fn failed_resolve_reports_backend_error() {
    let (driver, manager) = manager();
    let (sender, outcomes) = completion_channel();
    manager
        .resolve_anchor(&anchor_id("ua-gone"), sender.completion())
        .unwrap();
    assert_eq!(driver.resolved_ids(), vec![anchor_id("ua-gone")]);

    let tracked = driver.resolving()[0].clone();
    tracked.fail(CloudAnchorError::CloudIdNotFound);
    driver.push_update(&tracked);
    manager.on_update(&driver.poll_updated_anchors());

    let outcome = outcomes.try_recv().unwrap();
    assert_eq!(outcome.kind, TaskKind::Resolve);
    assert_eq!(
        outcome.state,
        TerminalState::Failed(CloudAnchorError::CloudIdNotFound)
    );
    assert!(!outcome.is_success());
}

#[test]
fn cleared_listeners_never_fire() {
    let (driver, manager) = manager();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    manager
        .host_anchor(&driver.anchor(), move |_| f.store(true, Ordering::SeqCst))
        .unwrap();

    manager.clear_listeners();
    assert_eq!(manager.pending_count(), 0);
    driver.finish_hosting(&anchor_id("ua-late")).unwrap();
    assert_eq!(manager.on_update(&driver.poll_updated_anchors()), 0);
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn start_failure_registers_nothing() {
    let (driver, manager) = manager();
    driver.fail_next_host(huntar_core::SessionError::NotTracking);
    assert!(manager.host_anchor(&driver.anchor(), |_| {}).is_err());
    assert_eq!(manager.pending_count(), 0);
}

proptest! {
    #[test]
    fn every_task_completes_once_whatever_the_update_order(
        order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle(),
        frame_size in 1usize..4,
        repeats in 1usize..3,
    ) {
        let (driver, manager) = manager();
        let seen: Arc<Mutex<Vec<TaskId>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tracked = Vec::new();
        for i in 0..order.len() {
            let s = seen.clone();
            let task = manager
                .host_anchor(&driver.anchor(), move |o| s.lock().unwrap().push(o.task))
                .unwrap();
            let anchor = driver.hosting()[i].clone();
            anchor.succeed(&anchor_id(&format!("ua-{i}")));
            tracked.push((task, anchor));
        }

        let mut fired = 0;
        for frame in order.chunks(frame_size) {
            let mut updated: Vec<FakeAnchor> = Vec::new();
            for _ in 0..repeats {
                updated.extend(frame.iter().map(|&i| tracked[i].1.clone()));
            }
            let before = seen.lock().unwrap().len();
            fired += manager.on_update(&updated);
            let batch = seen.lock().unwrap()[before..].to_vec();
            prop_assert!(batch.windows(2).all(|w| w[0] < w[1]));
        }

        prop_assert_eq!(fired, order.len());
        prop_assert_eq!(manager.pending_count(), 0);
        let mut counts: HashMap<TaskId, usize> = HashMap::new();
        for task in seen.lock().unwrap().iter() {
            *counts.entry(*task).or_default() += 1;
        }
        prop_assert_eq!(counts.len(), order.len());
        prop_assert!(counts.values().all(|&c| c == 1));
    }
}

#[test]
fn slot_readers_never_see_a_detached_anchor() {
    let driver = Arc::new(FakeSessionDriver::new());
    let slot = Arc::new(AnchorSlot::<FakeAnchor>::new());
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let (slot, driver, stop) = (slot.clone(), driver.clone(), stop.clone());
        thread::spawn(move || {
            for _ in 0..2_000 {
                slot.replace(Some(driver.anchor()));
            }
            stop.store(true, Ordering::SeqCst);
        })
    };
    let reader = {
        let (slot, stop) = (slot.clone(), stop.clone());
        thread::spawn(move || {
            let mut observed = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let guard = slot.lock();
                if let Some(anchor) = guard.current() {
                    assert!(!anchor.is_detached(), "detached anchor {:?}", anchor.key());
                    observed += 1;
                }
            }
            observed
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    let last = slot.current().unwrap();
    assert!(!last.is_detached());
    slot.clear();
    assert!(last.is_detached());
    assert!(slot.is_empty());
}

#[test]
fn driver_anchor_keys_are_unique() {
    let driver = FakeSessionDriver::new();
    let a = driver.anchor();
    let b = driver.host_anchor(&a).unwrap();
    assert_ne!(a.key(), b.key());
}
