mod common;

use chat_mirror::{ConversationScope, FeedEvent, Message, MessageId};
use common::{at, conversation, message};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
enum Op {
    Insert(u8),
    Update(u8, u8),
    Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..8).prop_map(Op::Insert),
        2 => (0u8..8, 0u8..5).prop_map(|(n, v)| Op::Update(n, v)),
        1 => (0u8..8).prop_map(Op::Delete),
    ]
}

fn scope() -> ConversationScope {
    ConversationScope::room("props")
}

/// Record `n`. Several ids share a timestamp so the id tie-break matters.
fn record(n: u8) -> Message {
    message(&format!("m{}", n), &scope(), "u1", &format!("body {}", n), i64::from(n % 3))
}

/// Version `v` of record `n`, stamped after every original.
fn revision(n: u8, v: u8) -> Message {
    let mut edited = record(n);
    edited.body = format!("v{}", v);
    edited.edited = true;
    edited.updated_at = at(10 + i64::from(v));
    edited
}

fn visible_ids(messages: impl Iterator<Item = Message>) -> Vec<MessageId> {
    messages.map(|m| m.id).collect()
}

proptest! {
    /// Starting from a fetch, any interleaving of inserts, updates and deletes
    /// leaves exactly the records that exist and were never deleted, each
    /// once, in order, carrying their newest body. With `resync` the fetch
    /// snapshot lands after the events and the replay log has to restore them.
    #[test]
    fn view_holds_exactly_the_live_records_in_order(
        initial in prop::collection::btree_set(0u8..8, 0..8),
        ops in prop::collection::vec(op(), 0..40),
        resync in any::<bool>(),
    ) {
        let mut conv = conversation(scope());
        let fetched: Vec<Message> = initial.iter().map(|n| record(*n)).collect();
        if resync {
            conv.begin_resync();
        } else {
            conv.apply_initial_fetch(fetched.clone());
        }

        let mut existing = initial.clone();
        let mut deleted = BTreeSet::new();
        let mut newest: BTreeMap<u8, u8> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Insert(n) => {
                    conv.apply_feed_event(FeedEvent::Insert(record(*n)));
                    existing.insert(*n);
                }
                Op::Update(n, v) => {
                    conv.apply_feed_event(FeedEvent::Update(revision(*n, *v)));
                    let version = newest.entry(*n).or_insert(*v);
                    *version = (*version).max(*v);
                }
                Op::Delete(n) => {
                    conv.apply_feed_event(FeedEvent::Delete {
                        id: record(*n).id,
                        scope: scope(),
                    });
                    deleted.insert(*n);
                }
            }
        }

        if resync {
            conv.apply_initial_fetch(fetched);
        }

        let mut expected: Vec<Message> = existing
            .difference(&deleted)
            .map(|n| match newest.get(n) {
                Some(v) => revision(*n, *v),
                None => record(*n),
            })
            .collect();
        expected.sort_by_key(|m| (m.created_at, m.id.clone()));

        let actual: Vec<Message> = conv.messages().cloned().collect();
        prop_assert_eq!(visible_ids(actual.iter().cloned()), visible_ids(expected.iter().cloned()));
        for (got, want) in actual.iter().zip(&expected) {
            prop_assert_eq!(&got.body, &want.body);
            prop_assert_eq!(got.edited, want.edited);
        }
        prop_assert_eq!(conv.len(), expected.len());
        prop_assert!(!conv.is_resyncing());
    }

    #[test]
    fn insert_order_does_not_matter(
        records in Just((0u8..8).collect::<Vec<_>>()).prop_shuffle(),
        duplicates in prop::collection::vec(0u8..8, 0..8),
    ) {
        let mut shuffled = conversation(scope());
        for n in records.iter().chain(duplicates.iter()) {
            shuffled.apply_feed_event(FeedEvent::Insert(record(*n)));
        }

        let mut fetched = conversation(scope());
        fetched.apply_initial_fetch((0u8..8).map(record).collect());

        prop_assert_eq!(shuffled.snapshot(), fetched.snapshot());
    }

    #[test]
    fn fetch_is_idempotent(ns in prop::collection::btree_set(0u8..8, 0..8)) {
        let records: Vec<Message> = ns.iter().map(|n| record(*n)).collect();
        let mut conv = conversation(scope());

        conv.apply_initial_fetch(records.clone());
        let once = conv.snapshot();
        conv.apply_initial_fetch(records);

        prop_assert_eq!(conv.snapshot(), once);
    }

    #[test]
    fn update_and_insert_converge_in_either_order(n in 0u8..8, edit_secs in 10i64..100) {
        let original = record(n);
        let mut edited = original.clone();
        edited.body = "edited".to_string();
        edited.edited = true;
        edited.updated_at = at(edit_secs);

        let mut insert_first = conversation(scope());
        insert_first.apply_feed_event(FeedEvent::Insert(original.clone()));
        insert_first.apply_feed_event(FeedEvent::Update(edited.clone()));

        let mut update_first = conversation(scope());
        update_first.apply_feed_event(FeedEvent::Update(edited.clone()));
        update_first.apply_feed_event(FeedEvent::Insert(original));

        prop_assert_eq!(insert_first.snapshot(), update_first.snapshot());
        prop_assert_eq!(insert_first.get(&edited.id).map(|m| m.body.as_str()), Some("edited"));
    }
}
