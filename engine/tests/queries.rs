//! Live query tests: filtering, ordering windows, joins and grouping kept
//! up to date as the source collections change.

mod common;

use common::{init_tracing, local, on_demand, recorder};
use reflow_engine::query::builder::{count, eq, gt, prop, sum, val};
use reflow_engine::{
    AutoIndex, CollectionConfig, CollectionStatus, Key, LiveQuery, Query, Store,
    TransactionConfig,
};
use serde_json::{json, Value};

fn people(store: &Store) -> reflow_engine::Collection {
    let c = local(store, "people");
    for (id, name, age, team) in [
        (1, "Ann", 31, "red"),
        (2, "Bob", 25, "blue"),
        (3, "Cid", 47, "red"),
        (4, "Dee", 19, "green"),
        (5, "Eve", 38, "blue"),
    ] {
        c.insert(json!({"id": id, "name": name, "age": age, "team": team}))
            .unwrap();
    }
    c
}

fn field(results: &[Value], name: &str) -> Vec<Value> {
    results.iter().map(|r| r[name].clone()).collect()
}

fn names(query: &LiveQuery) -> Vec<Value> {
    field(&query.results(), "name")
}

// ============================================================================
// Filtering
// ============================================================================

#[test]
fn where_tracks_rows_entering_and_leaving() {
    let store = Store::new();
    let c = people(&store);
    let adults = store
        .live_query(Query::from_collection("p", &c).where_(gt(prop("p.age"), val(30))))
        .unwrap();
    assert_eq!(adults.status(), CollectionStatus::Ready);
    assert_eq!(adults.len(), 3);

    let (seen, listener) = recorder();
    adults.subscribe_changes(listener);
    c.update(2, |row| row["age"] = json!(40)).unwrap();
    c.update(1, |row| row["age"] = json!(29)).unwrap();
    c.update(3, |row| row["name"] = json!("Cyd")).unwrap();

    let seen = seen.borrow();
    let kinds: Vec<_> = seen.iter().map(|m| (m.kind, m.key.clone())).collect();
    use reflow_engine::ChangeType::*;
    assert_eq!(
        kinds,
        vec![(Insert, Key::from(2)), (Delete, Key::from(1)), (Update, Key::from(3))]
    );
    assert_eq!(adults.get(&Key::from(3)).unwrap()["name"], json!("Cyd"));
}

#[test]
fn select_projects_and_find_one_returns_a_row() {
    let store = Store::new();
    let c = people(&store);
    let bob = store
        .live_query(
            Query::from_collection("p", &c)
                .where_(eq(prop("p.id"), val(2)))
                .select(vec![("who", prop("p.name")), ("years", prop("p.age"))])
                .find_one(),
        )
        .unwrap();
    assert!(bob.is_single_result());
    assert_eq!(bob.first(), Some(json!({"who": "Bob", "years": 25})));

    c.delete(2).unwrap();
    assert_eq!(bob.first(), None);
}

#[test]
fn subqueries_feed_outer_queries() {
    let store = Store::new();
    let c = people(&store);
    let reds = Query::from_collection("p", &c).where_(eq(prop("p.team"), val("red")));
    let older_reds = store
        .live_query(Query::from_query("r", reds).where_(gt(prop("r.age"), val(40))))
        .unwrap();
    assert_eq!(names(&older_reds), vec![json!("Cid")]);

    c.update(1, |row| row["age"] = json!(50)).unwrap();
    assert_eq!(older_reds.len(), 2);
}

// ============================================================================
// Ordering And Windows
// ============================================================================

#[test]
fn ordered_limit_without_index() {
    let store = Store::new();
    let c = store
        .create_collection(
            common::accepting(CollectionConfig::keyed_by("people", "id"))
                .auto_index(AutoIndex::Off),
        )
        .unwrap();
    for (id, age) in [(1, 31), (2, 25), (3, 47), (4, 19), (5, 38)] {
        c.insert(json!({"id": id, "age": age})).unwrap();
    }
    let youngest = store
        .live_query(Query::from_collection("p", &c).order_by_asc(prop("p.age")).limit(2))
        .unwrap();
    assert!(c.indexes().is_empty());
    assert_eq!(field(&youngest.results(), "age"), vec![json!(19), json!(25)]);

    c.insert(json!({"id": 6, "age": 20})).unwrap();
    assert_eq!(field(&youngest.results(), "age"), vec![json!(19), json!(20)]);
}

#[test]
fn ordered_limit_without_index_breaks_ties_by_insertion() {
    let store = Store::new();
    let c = store
        .create_collection(
            common::accepting(CollectionConfig::keyed_by("people", "id"))
                .auto_index(AutoIndex::Off),
        )
        .unwrap();
    for (id, age) in [(5, 20), (1, 20), (9, 30)] {
        c.insert(json!({"id": id, "age": age})).unwrap();
    }
    let first = store
        .live_query(Query::from_collection("p", &c).order_by_asc(prop("p.age")).limit(1))
        .unwrap();
    assert_eq!(field(&first.results(), "id"), vec![json!(5)]);

    // Updating the leader keeps it ahead of its equal.
    c.update(5, |row| row["name"] = json!("Five")).unwrap();
    assert_eq!(field(&first.results(), "id"), vec![json!(5)]);

    // Once it leaves, the next row inserted with the same age takes over.
    c.delete(5).unwrap();
    assert_eq!(field(&first.results(), "id"), vec![json!(1)]);
    c.insert(json!({"id": 5, "age": 20})).unwrap();
    assert_eq!(field(&first.results(), "id"), vec![json!(1)]);
}

#[test]
fn indexed_window_refills_after_delete() {
    init_tracing();
    let store = Store::new();
    let c = people(&store);
    let youngest = store
        .live_query(Query::from_collection("p", &c).order_by_asc(prop("p.age")).limit(2))
        .unwrap();
    assert!(c.has_index_on(&["age".to_string()]));
    assert_eq!(names(&youngest), vec![json!("Dee"), json!("Bob")]);

    c.delete(4).unwrap();
    assert_eq!(names(&youngest), vec![json!("Bob"), json!("Ann")]);
    c.delete(2).unwrap();
    c.delete(1).unwrap();
    assert_eq!(names(&youngest), vec![json!("Eve"), json!("Cid")]);
    c.delete(5).unwrap();
    assert_eq!(names(&youngest), vec![json!("Cid")]);
}

#[test]
fn descending_window_with_offset() {
    let store = Store::new();
    let c = people(&store);
    let page = store
        .live_query(
            Query::from_collection("p", &c)
                .order_by_desc(prop("p.age"))
                .offset(1)
                .limit(2),
        )
        .unwrap();
    assert_eq!(names(&page), vec![json!("Eve"), json!("Ann")]);

    c.insert(json!({"id": 6, "name": "Fay", "age": 60, "team": "red"}))
        .unwrap();
    assert_eq!(names(&page), vec![json!("Cid"), json!("Eve")]);
}

// ============================================================================
// Joins
// ============================================================================

fn posts(store: &Store) -> reflow_engine::Collection {
    let c = local(store, "posts");
    for (id, author, title) in [(10, 1, "hello"), (11, 1, "again"), (12, 3, "mine"), (13, 9, "orphan")] {
        c.insert(json!({"id": id, "author": author, "title": title}))
            .unwrap();
    }
    c
}

#[test]
fn inner_join_matches_both_sides() {
    let store = Store::new();
    let people = people(&store);
    let posts = posts(&store);
    let bylines = store
        .live_query(
            Query::from_collection("post", &posts)
                .inner_join("author", &people, prop("post.author"), prop("author.id"))
                .select(vec![("title", prop("post.title")), ("by", prop("author.name"))]),
        )
        .unwrap();
    let mut rows = bylines.results();
    rows.sort_by_key(|r| r["title"].to_string());
    assert_eq!(
        rows,
        vec![
            json!({"title": "again", "by": "Ann"}),
            json!({"title": "hello", "by": "Ann"}),
            json!({"title": "mine", "by": "Cid"}),
        ]
    );

    people.insert(json!({"id": 9, "name": "Ivy", "age": 22, "team": "red"}))
        .unwrap();
    assert_eq!(bylines.len(), 4);
    people.update(1, |row| row["name"] = json!("Anne")).unwrap();
    let by: Vec<Value> = field(&bylines.results(), "by");
    assert_eq!(by.iter().filter(|b| **b == json!("Anne")).count(), 2);
    people.delete(3).unwrap();
    assert_eq!(bylines.len(), 3);
}

#[test]
fn left_join_keeps_unmatched_rows() {
    let store = Store::new();
    let people = people(&store);
    let posts = posts(&store);
    let authored = store
        .live_query(
            Query::from_collection("u", &people)
                .left_join("p", &posts, prop("u.id"), prop("p.author"))
                .where_(eq(prop("u.team"), val("red"))),
        )
        .unwrap();
    // Ann twice, Cid once.
    assert_eq!(authored.len(), 3);

    posts.delete(12).unwrap();
    let cid: Vec<Value> = authored
        .results()
        .into_iter()
        .filter(|r| r["u"]["name"] == json!("Cid"))
        .collect();
    assert_eq!(cid.len(), 1);
    assert_eq!(cid[0]["p"], Value::Null);
}

#[test]
fn lazy_join_side_loads_only_matching_rows() {
    init_tracing();
    let store = Store::new();
    let people = people(&store);
    let (comments, backend) = on_demand(&store, "comments");
    backend.insert_rows(vec![
        json!({"id": 100, "person": 1, "text": "hi"}),
        json!({"id": 101, "person": 4, "text": "yo"}),
    ]);
    let threads = store
        .live_query(
            Query::from_collection("u", &people)
                .where_(eq(prop("u.team"), val("red")))
                .left_join("c", &comments, prop("u.id"), prop("c.person")),
        )
        .unwrap();
    let loads = backend.loads();
    assert_eq!(loads.len(), 1);
    let where_ = loads[0].where_.as_ref().unwrap().to_string();
    assert!(where_.starts_with("in(person"), "{where_}");
    assert_eq!(threads.len(), 2);
    assert!(threads
        .results()
        .iter()
        .any(|r| r["c"]["text"] == json!("hi")));
}

// ============================================================================
// Grouping
// ============================================================================

#[test]
fn group_by_aggregates_follow_writes() {
    let store = Store::new();
    let c = people(&store);
    let teams = store
        .live_query(
            Query::from_collection("p", &c)
                .group_by(prop("p.team"))
                .select(vec![
                    ("team", prop("p.team")),
                    ("members", count(prop("p.id"))),
                    ("years", sum(prop("p.age"))),
                ]),
        )
        .unwrap();
    let mut rows = teams.results();
    rows.sort_by_key(|r| r["team"].to_string());
    assert_eq!(
        rows,
        vec![
            json!({"team": "blue", "members": 2, "years": 63}),
            json!({"team": "green", "members": 1, "years": 19}),
            json!({"team": "red", "members": 2, "years": 78}),
        ]
    );

    c.delete(4).unwrap();
    assert_eq!(teams.len(), 2);
    c.update(2, |row| row["team"] = json!("red")).unwrap();
    let red = teams
        .results()
        .into_iter()
        .find(|r| r["team"] == json!("red"))
        .unwrap();
    assert_eq!(red["members"], json!(3));
}

#[test]
fn distinct_collapses_duplicates() {
    let store = Store::new();
    let c = people(&store);
    let teams = store
        .live_query(
            Query::from_collection("p", &c)
                .select(vec![("team", prop("p.team"))])
                .distinct(),
        )
        .unwrap();
    assert_eq!(teams.len(), 3);
    c.delete(4).unwrap();
    assert_eq!(teams.len(), 2);
    c.delete(1).unwrap();
    assert_eq!(teams.len(), 2);
}

// ============================================================================
// Scheduling And Lifecycle
// ============================================================================

#[test]
fn transaction_writes_reach_the_query_in_one_batch() {
    let store = Store::new();
    let c = people(&store);
    let all = store.live_query(Query::from_collection("p", &c)).unwrap();
    let (seen, listener) = recorder();
    let batches = std::rc::Rc::new(std::cell::Cell::new(0));
    let counter = std::rc::Rc::clone(&batches);
    all.subscribe_changes(move |changes| {
        counter.set(counter.get() + 1);
        listener(changes);
    });

    let tx = store
        .create_transaction(
            TransactionConfig::new(|_| Box::pin(futures::future::pending())).manual_commit(),
        )
        .unwrap();
    tx.mutate(|| {
        c.insert(json!({"id": 6, "name": "Fay", "age": 60, "team": "red"}))?;
        c.insert(json!({"id": 7, "name": "Gus", "age": 61, "team": "red"}))?;
        c.delete(1)?;
        Ok(())
    })
    .unwrap();
    assert_eq!(batches.get(), 1);
    assert_eq!(seen.borrow().len(), 3);
    assert_eq!(all.len(), 6);
}

#[test]
fn dispose_stops_updates() {
    let store = Store::new();
    let c = people(&store);
    let all = store.live_query(Query::from_collection("p", &c)).unwrap();
    assert_eq!(c.subscriber_count(), 1);
    all.dispose();
    assert_eq!(all.status(), CollectionStatus::CleanedUp);
    assert_eq!(c.subscriber_count(), 0);
    c.delete(1).unwrap();
    assert_eq!(all.len(), 5);
}

#[test]
fn malformed_queries_are_rejected() {
    let store = Store::new();
    let c = people(&store);
    let err = store
        .live_query(Query::from_collection("p", &c).limit(1))
        .unwrap_err();
    assert!(err.is_query_shape());
    assert_eq!(c.subscriber_count(), 0);
}
