//! Property tests for ordering, unread counters and feed fallback.

use marketplace_sync::conversations::{conversation_path, mark_read};
use marketplace_sync::{
    append_message, create_conversation, Conversation, Document, FeedSpec, FeedUpdate, Filter,
    Identity, MemoryStore, PeerProfile, RemoteStore, ResilientQuerySubscriber, SyncConfig, UserId,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn chat(store: &MemoryStore, config: &SyncConfig) -> Conversation {
    create_conversation(store, config, &UserId::from("a"), &PeerProfile::new("b")).unwrap()
}

fn counters(store: &MemoryStore, config: &SyncConfig, conv: &Conversation) -> (u64, u64) {
    let doc = store
        .get_document(&conversation_path(config, &conv.id))
        .unwrap()
        .unwrap();
    (
        doc.get_u64("unread_a").unwrap_or(0),
        doc.get_u64("unread_b").unwrap_or(0),
    )
}

#[derive(Clone, Debug)]
enum Op {
    Send { from_a: bool },
    Read { by_a: bool },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<bool>().prop_map(|from_a| Op::Send { from_a }),
        1 => any::<bool>().prop_map(|by_a| Op::Read { by_a }),
    ]
}

fn arb_job() -> impl Strategy<Value = (String, Option<i64>)> {
    (
        prop_oneof![Just("design".to_string()), Just("dev".to_string())],
        proptest::option::of(0i64..20),
    )
}

fn ids(docs: &[Document]) -> Vec<String> {
    docs.iter().map(|d| d.id.clone()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// Property: the message feed is ordered by server timestamp, whoever sent.
    #[test]
    fn prop_message_feed_non_decreasing(senders in proptest::collection::vec(any::<bool>(), 1..20)) {
        let store = Arc::new(MemoryStore::new());
        let config = SyncConfig::default();
        let conv = chat(&store, &config);
        let mut feed = ResilientQuerySubscriber::watch(
            store.clone(),
            FeedSpec::new(config.messages_path(conv.id.as_str()), "createdAt"),
        );

        for (i, from_a) in senders.iter().enumerate() {
            let sender = Identity::new(if *from_a { "a" } else { "b" });
            append_message(&*store, &config, &conv, &sender, &format!("m{}", i)).unwrap();
        }

        let last = feed.poll().into_iter().rev().find_map(|u| match u {
            FeedUpdate::Items(items) => Some(items),
            _ => None,
        });
        let items = last.unwrap();
        prop_assert_eq!(items.len(), senders.len());

        let stamps: Vec<i64> = items
            .iter()
            .map(|d| d.get_timestamp("createdAt").unwrap().0)
            .collect();
        prop_assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        // Send order is preserved by the server clock
        let texts: Vec<String> = items
            .iter()
            .map(|d| d.get_str("text").unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..senders.len()).map(|i| format!("m{}", i)).collect();
        prop_assert_eq!(texts, expected);
    }

    /// Property: each counter equals the sends addressed to that user since
    /// their last read (or their own last send).
    #[test]
    fn prop_unread_counters_follow_model(ops in proptest::collection::vec(arb_op(), 0..30)) {
        let store = MemoryStore::new();
        let config = SyncConfig::default();
        let conv = chat(&store, &config);
        let (mut unread_a, mut unread_b) = (0u64, 0u64);

        for op in ops {
            match op {
                Op::Send { from_a: true } => {
                    append_message(&store, &config, &conv, &Identity::new("a"), "x").unwrap();
                    unread_a = 0;
                    unread_b += 1;
                }
                Op::Send { from_a: false } => {
                    append_message(&store, &config, &conv, &Identity::new("b"), "y").unwrap();
                    unread_b = 0;
                    unread_a += 1;
                }
                Op::Read { by_a } => {
                    let user = UserId::from(if by_a { "a" } else { "b" });
                    prop_assert!(mark_read(&store, &config, &conv.id, &user));
                    if by_a { unread_a = 0 } else { unread_b = 0 }
                }
            }
            prop_assert_eq!(counters(&store, &config, &conv), (unread_a, unread_b));
        }
    }

    /// Property: N sends from one side leave exactly N unread on the other.
    #[test]
    fn prop_n_sends_n_unread(n in 1usize..25) {
        let store = MemoryStore::new();
        let config = SyncConfig::default();
        let conv = chat(&store, &config);
        for _ in 0..n {
            append_message(&store, &config, &conv, &Identity::new("a"), "hi").unwrap();
        }
        prop_assert_eq!(counters(&store, &config, &conv), (0, n as u64));

        mark_read(&store, &config, &conv.id, &UserId::from("b"));
        prop_assert_eq!(counters(&store, &config, &conv), (0, 0));
    }

    /// Property: the fallback branch emits exactly what the ordered query returns.
    #[test]
    fn prop_fallback_matches_ordered(
        jobs in proptest::collection::vec(arb_job(), 0..25),
        descending in any::<bool>(),
        limit in proptest::option::of(1usize..10),
    ) {
        let reference = MemoryStore::new();
        let restricted = Arc::new(MemoryStore::new());
        restricted.require_composite_indexes(true);
        for (i, (category, at)) in jobs.iter().enumerate() {
            let id = format!("j{:02}", i);
            let value = json!({"category": category, "createdAt": at});
            reference.seed("jobs", &id, value.clone()).unwrap();
            restricted.seed("jobs", &id, value).unwrap();
        }

        let mut spec = FeedSpec::new("jobs", "createdAt").filter(Filter::eq("category", "design"));
        if descending {
            spec = spec.descending();
        }
        if let Some(limit) = limit {
            spec = spec.limit(limit);
        }

        let expected = reference.get(&spec.preferred_query()).unwrap();
        let mut feed = ResilientQuerySubscriber::watch(restricted.clone(), spec);
        let updates = feed.poll();

        prop_assert_eq!(updates.len(), 1);
        match &updates[0] {
            FeedUpdate::Items(items) => prop_assert_eq!(ids(items), ids(&expected)),
            other => prop_assert!(false, "unexpected update {:?}", other),
        }
    }
}
