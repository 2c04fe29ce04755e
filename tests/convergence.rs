//! Replication scenarios over the in-process fabric: live propagation,
//! deletion by transaction id, stale-cut of fused operations, rev-up, and
//! multi-clone convergence.

mod common;

use serde_json::json;
use skein::UpdateEvent;

use common::{assert_converged, spawn};
use skein::remotes::memory::MemoryHub;

#[test]
fn insert_then_describe_on_genesis() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);

    assert_eq!(alice.status().ticks, 0);
    let update = alice
        .insert_json(&json!({ "@id": "fred", "name": "Fred" }))
        .unwrap()
        .expect("insert commits");
    assert_eq!(update.inserts.len(), 1);

    let fred = alice.describe("fred").unwrap().expect("fred exists");
    assert_eq!(fred, json!({ "@id": "fred", "name": "Fred" }));
    assert_eq!(alice.status().ticks, 1);
}

#[test]
fn remote_insert_applies_with_join_and_tick() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, _) = spawn(&hub, "bob", false);

    assert_eq!(bob.status().ticks, 0);
    alice
        .insert_json(&json!({ "@id": "fred", "name": "Fred" }))
        .unwrap();

    let fred = bob.describe("fred").unwrap().expect("replicated");
    assert_eq!(fred, json!({ "@id": "fred", "name": "Fred" }));
    // One tick joined from alice, one local tick for the apply.
    assert_eq!(bob.status().ticks, 2);
}

#[test]
fn empty_write_is_a_no_op() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, _) = spawn(&hub, "bob", false);
    let bob_updates = bob.follow().expect("subscription");

    let outcome = alice.write(&skein::Patch::default()).unwrap();
    assert!(outcome.is_none());
    assert_eq!(alice.status().ticks, 0);
    // Nothing was published, nothing was emitted.
    assert!(bob_updates.drain().is_empty());
}

#[test]
fn delete_by_tid_removes_the_subject_everywhere() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, _) = spawn(&hub, "bob", false);

    alice
        .insert_json(&json!({ "@id": "fred", "name": "Fred" }))
        .unwrap();
    assert!(bob.describe("fred").unwrap().is_some());

    // Bob resolves the triple to its asserting tid and withdraws it.
    let update = bob
        .delete_json(&json!({ "@id": "fred" }))
        .unwrap()
        .expect("delete commits");
    assert_eq!(update.deletes.len(), 1);

    assert!(bob.describe("fred").unwrap().is_none());
    assert!(alice.describe("fred").unwrap().is_none());
}

#[test]
fn updates_stream_after_commit() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, _) = spawn(&hub, "bob", false);
    let stream = bob.follow().expect("subscription");

    alice
        .insert_json(&json!({ "@id": "fred", "name": "Fred" }))
        .unwrap();

    let events = stream.drain();
    assert_eq!(events.len(), 1);
    let UpdateEvent::Update(update) = &events[0] else {
        panic!("expected an update event");
    };
    assert_eq!(update.inserts.len(), 1);
    assert!(update.deletes.is_empty());
}

#[test]
fn stale_cut_on_fusion_preserves_concurrent_delete() {
    let hub = MemoryHub::new();
    let (alice, alice_channel) = spawn(&hub, "alice", true);
    let (bob, _) = spawn(&hub, "bob", false);
    let (charlie, _) = spawn(&hub, "charlie", false);

    // Alice inserts wilma; everyone sees it.
    alice
        .insert_json(&json!({ "@id": "wilma", "name": "Wilma" }))
        .unwrap();
    assert!(bob.describe("wilma").unwrap().is_some());

    // Alice drops off the fabric; charlie deletes wilma by its tid.
    alice_channel.set_connected(false);
    charlie.delete_json(&json!({ "@id": "wilma" })).unwrap();
    assert!(bob.describe("wilma").unwrap().is_none());
    assert!(alice.describe("wilma").unwrap().is_some());

    // Alice, unaware, writes barney: her journal splices wilma+barney
    // into one fused operation.
    alice
        .insert_json(&json!({ "@id": "barney", "name": "Barney" }))
        .unwrap();

    // Bob revs up from alice and receives the fusion. The wilma part is
    // already reflected (and concurrently deleted): it must be cut.
    alice_channel.set_connected(true);
    bob.rejoin().unwrap();

    assert!(bob.describe("wilma").unwrap().is_none(), "wilma resurrected");
    assert_eq!(
        bob.describe("barney").unwrap().expect("barney replicated"),
        json!({ "@id": "barney", "name": "Barney" })
    );
}

#[test]
fn revup_from_fork_time_replays_the_missed_write() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, bob_channel) = spawn(&hub, "bob", false);

    // Bob partitions immediately after cloning; alice writes once.
    bob_channel.set_connected(false);
    alice
        .insert_json(&json!({ "@id": "fred", "name": "Fred" }))
        .unwrap();
    assert!(bob.describe("fred").unwrap().is_none());

    bob_channel.set_connected(true);
    bob.rejoin().unwrap();

    assert_eq!(
        bob.describe("fred").unwrap().expect("revved up"),
        json!({ "@id": "fred", "name": "Fred" })
    );
    assert_converged(&[&alice, &bob], &["fred"]);
}

#[test]
fn concurrent_writes_converge_in_both_directions() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, bob_channel) = spawn(&hub, "bob", false);

    // Partition, then write on both sides.
    bob_channel.set_connected(false);
    alice
        .insert_json(&json!({ "@id": "fred", "name": "Fred" }))
        .unwrap();
    bob.insert_json(&json!({ "@id": "wilma", "name": "Wilma" }))
        .unwrap();

    // Heal: each side revs up from the other.
    bob_channel.set_connected(true);
    bob.rejoin().unwrap();
    alice.rejoin().unwrap();

    assert_converged(&[&alice, &bob], &["fred", "wilma"]);
    assert!(alice.describe("wilma").unwrap().is_some());
    assert!(bob.describe("fred").unwrap().is_some());
}

#[test]
fn concurrent_values_union_everywhere() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, bob_channel) = spawn(&hub, "bob", false);

    bob_channel.set_connected(false);
    alice
        .insert_json(&json!({ "@id": "fred", "likes": "bowling" }))
        .unwrap();
    bob.insert_json(&json!({ "@id": "fred", "likes": "golf" }))
        .unwrap();

    bob_channel.set_connected(true);
    bob.rejoin().unwrap();
    alice.rejoin().unwrap();

    // Set union: both concurrent values survive on both clones.
    let fred = alice.describe("fred").unwrap().expect("fred exists");
    assert_eq!(fred["likes"], json!(["bowling", "golf"]));
    assert_converged(&[&alice, &bob], &["fred"]);
}

#[test]
fn three_clones_converge_through_interleaved_activity() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, _) = spawn(&hub, "bob", false);
    let (charlie, _) = spawn(&hub, "charlie", false);

    alice
        .insert_json(&json!({ "@id": "fred", "name": "Fred", "wife": { "@id": "wilma" } }))
        .unwrap();
    bob.insert_json(&json!({ "@id": "wilma", "name": "Wilma" }))
        .unwrap();
    charlie
        .insert_json(&json!({ "@id": "barney", "name": "Barney" }))
        .unwrap();
    bob.delete_json(&json!({ "@id": "barney" })).unwrap();
    alice
        .insert_json(&json!({ "@id": "wilma", "age": 25 }))
        .unwrap();

    assert_converged(&[&alice, &bob, &charlie], &["fred", "wilma", "barney"]);
    assert!(charlie.describe("barney").unwrap().is_none());
    let wilma = charlie.describe("wilma").unwrap().expect("wilma merged");
    assert_eq!(wilma["name"], "Wilma");
    assert_eq!(wilma["age"], 25);
}

#[test]
fn cyclic_references_replicate() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    let (bob, _) = spawn(&hub, "bob", false);

    alice
        .insert_json(&json!({
            "@id": "fred",
            "spouse": { "@id": "wilma", "spouse": { "@id": "fred" } },
        }))
        .unwrap();

    let fred = bob.describe("fred").unwrap().expect("fred exists");
    assert_eq!(fred["spouse"], json!({ "@id": "wilma" }));
    let wilma = bob.describe("wilma").unwrap().expect("wilma exists");
    assert_eq!(wilma["spouse"], json!({ "@id": "fred" }));
}

#[test]
fn snapshot_clone_of_a_populated_domain() {
    let hub = MemoryHub::new();
    let (alice, _) = spawn(&hub, "alice", true);
    for i in 0..20 {
        alice
            .insert_json(&json!({ "@id": format!("subject-{i}"), "n": i }))
            .unwrap();
    }

    // A late joiner ingests the whole graph by snapshot.
    let (bob, _) = spawn(&hub, "bob", false);
    for i in 0..20 {
        let id = format!("subject-{i}");
        assert_eq!(
            bob.describe(&id).unwrap().expect("snapshotted"),
            json!({ "@id": id, "n": i }),
        );
    }
    assert!(!bob.status().outdated);
    assert!(bob.status().online);
}
