// Live listeners over documents and queries.
//
// Every successful mutation publishes the affected collection's `Scope`
// on one broadcast bus. Each listener is a task that owns its previous
// result, re-fetches through the execution queue when a relevant scope
// arrives, and calls back with the new result. Tasks hold a weak store
// handle, so they end once every `Database` clone is gone.

use crate::document::{DocumentSnapshot, QueryDocumentSnapshot, QuerySnapshot};
use crate::error::Result;
use crate::query::{Query, QuerySource};
use crate::reference::DocumentRef;
use crate::store::Database;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// What a change notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Collection(String),
    /// Every collection. Collection group listeners listen here, and
    /// whole-store imports publish here.
    Wildcard,
}

impl Scope {
    /// Whether a listener on `self` must re-evaluate for `notification`.
    pub fn matches(&self, notification: &Scope) -> bool {
        *self == Scope::Wildcard || *notification == Scope::Wildcard || self == notification
    }
}

pub(crate) struct EventBus {
    sender: broadcast::Sender<Scope>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub(crate) fn emit(&self, scope: Scope) {
        log::trace!("Change notification: {scope:?}");
        // No receivers just means nobody is listening.
        let _ = self.sender.send(scope);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Scope> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry of a query listener's diff.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub doc: QueryDocumentSnapshot,
    /// Position in the previous result; `None` for added documents.
    pub old_index: Option<usize>,
    /// Position in the new result; `None` for removed documents.
    pub new_index: Option<usize>,
}

/// Classify the difference between two query results. Documents are keyed
/// by collection and id.
///
/// New documents come first, in result order, as `Added` or `Modified`
/// (same key, different data). Documents that disappeared follow as
/// `Removed`, in their old order. A document that only moved is not a
/// change.
pub fn diff_snapshots(
    previous: &[QueryDocumentSnapshot],
    next: &[QueryDocumentSnapshot],
) -> Vec<DocumentChange> {
    let old_positions: HashMap<(&str, &str), usize> = previous
        .iter()
        .enumerate()
        .map(|(i, doc)| (key(doc), i))
        .collect();
    let next_keys: HashSet<(&str, &str)> = next.iter().map(key).collect();

    let mut changes = Vec::new();
    for (new_index, doc) in next.iter().enumerate() {
        match old_positions.get(&key(doc)) {
            None => changes.push(DocumentChange {
                kind: ChangeKind::Added,
                doc: doc.clone(),
                old_index: None,
                new_index: Some(new_index),
            }),
            Some(&old_index) if previous[old_index].data != doc.data => {
                changes.push(DocumentChange {
                    kind: ChangeKind::Modified,
                    doc: doc.clone(),
                    old_index: Some(old_index),
                    new_index: Some(new_index),
                })
            }
            Some(_) => {}
        }
    }

    for (old_index, doc) in previous.iter().enumerate() {
        if !next_keys.contains(&key(doc)) {
            changes.push(DocumentChange {
                kind: ChangeKind::Removed,
                doc: doc.clone(),
                old_index: Some(old_index),
                new_index: None,
            });
        }
    }
    changes
}

fn key(doc: &QueryDocumentSnapshot) -> (&str, &str) {
    (doc.collection_id.as_str(), doc.id.as_str())
}

/// Handle returned by listener registration. Dropping it stops the
/// listener, same as `unsubscribe`.
pub struct ListenerRegistration {
    task: JoinHandle<()>,
}

impl ListenerRegistration {
    /// Stop the listener. The callback is not invoked again.
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait for the next notification relevant to `scope`. Returns false once
/// the bus is gone.
async fn next_relevant(events: &mut broadcast::Receiver<Scope>, scope: &Scope) -> bool {
    loop {
        match events.recv().await {
            Ok(notification) if scope.matches(&notification) => return true,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Listener on {scope:?} missed {skipped} notifications; re-fetching");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

impl Database {
    /// Listen to one document. The current state is delivered before this
    /// returns; afterwards the callback runs whenever the document's data or
    /// existence changes.
    pub async fn on_doc_snapshot<F>(
        &self,
        reference: &DocumentRef,
        callback: F,
    ) -> Result<ListenerRegistration>
    where
        F: Fn(DocumentSnapshot) + Send + 'static,
    {
        let mut events = self.events().subscribe();
        let initial = self.get_doc(reference).await?;
        let mut last = initial.data().cloned();
        callback(initial);

        let scope = Scope::Collection(reference.collection_id().to_string());
        let store = self.downgrade();
        let reference = reference.clone();
        let task = tokio::spawn(async move {
            while next_relevant(&mut events, &scope).await {
                let Some(db) = store.upgrade() else { break };
                match db.get_doc(&reference).await {
                    Ok(snapshot) => {
                        if snapshot.data() != last.as_ref() {
                            last = snapshot.data().cloned();
                            callback(snapshot);
                        }
                    }
                    Err(e) => log::error!("Re-fetch of {reference} for listener failed: {e}"),
                }
            }
        });

        Ok(ListenerRegistration { task })
    }

    /// Listen to a query. The first delivery happens before this returns and
    /// reports every document as added. Every relevant change notification
    /// afterwards re-runs the query and delivers the new result with its diff
    /// against the previous one, which may be empty.
    pub async fn on_query_snapshot<F>(&self, query: &Query, callback: F) -> Result<ListenerRegistration>
    where
        F: Fn(QuerySnapshot, Vec<DocumentChange>) + Send + 'static,
    {
        let mut events = self.events().subscribe();
        let initial = self.get_docs(query).await?;
        let mut previous = initial.docs().to_vec();
        let changes = diff_snapshots(&[], &previous);
        callback(initial, changes);

        let scope = match &query.source {
            QuerySource::Collection(collection) => Scope::Collection(collection.id().to_string()),
            QuerySource::CollectionGroup(_) => Scope::Wildcard,
        };
        let store = self.downgrade();
        let query = query.clone();
        let task = tokio::spawn(async move {
            while next_relevant(&mut events, &scope).await {
                let Some(db) = store.upgrade() else { break };
                match db.get_docs(&query).await {
                    Ok(snapshot) => {
                        let changes = diff_snapshots(&previous, snapshot.docs());
                        previous = snapshot.docs().to_vec();
                        callback(snapshot, changes);
                    }
                    Err(e) => log::error!(
                        "Re-fetch of query on {} for listener failed: {e}",
                        query.source.id()
                    ),
                }
            }
        });

        Ok(ListenerRegistration { task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::query::{order_by, Direction};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::timeout;

    async fn setup_test_db() -> (TempDir, Database) {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(Config::new(tmp.path(), "listen.db")).await.unwrap();
        (tmp, db)
    }

    async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener did not deliver in time")
            .expect("listener channel closed")
    }

    async fn assert_quiet<T>(rx: &mut UnboundedReceiver<T>) {
        let delivered = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(delivered, Ok(Some(_))), "unexpected delivery");
    }

    fn doc(collection_id: &str, id: &str, data: serde_json::Value) -> QueryDocumentSnapshot {
        QueryDocumentSnapshot {
            collection_id: collection_id.into(),
            id: id.into(),
            data,
        }
    }

    #[test]
    fn test_scope_matching() {
        let users = Scope::Collection("users".into());
        assert!(users.matches(&Scope::Collection("users".into())));
        assert!(!users.matches(&Scope::Collection("posts".into())));
        assert!(users.matches(&Scope::Wildcard));
        assert!(Scope::Wildcard.matches(&Scope::Collection("posts".into())));
    }

    #[test]
    fn test_diff_snapshots() {
        let previous = vec![
            doc("c", "a", json!({ "v": 1 })),
            doc("c", "b", json!({ "v": 2 })),
            doc("c", "x", json!({ "v": 9 })),
        ];
        let next = vec![
            doc("c", "b", json!({ "v": 2 })),
            doc("c", "a", json!({ "v": 5 })),
            doc("c", "n", json!({ "v": 0 })),
        ];
        let changes = diff_snapshots(&previous, &next);
        let summary: Vec<(ChangeKind, &str, Option<usize>, Option<usize>)> = changes
            .iter()
            .map(|c| (c.kind, c.doc.id(), c.old_index, c.new_index))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeKind::Modified, "a", Some(0), Some(1)),
                (ChangeKind::Added, "n", None, Some(2)),
                (ChangeKind::Removed, "x", Some(2), None),
            ]
        );
    }

    #[test]
    fn test_diff_keys_include_collection() {
        let previous = vec![doc("users/a/posts", "p1", json!({}))];
        let next = vec![doc("users/b/posts", "p1", json!({}))];
        let kinds: Vec<ChangeKind> = diff_snapshots(&previous, &next)
            .into_iter()
            .map(|c| c.kind)
            .collect();
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Removed]);
    }

    #[tokio::test]
    async fn test_query_listener_added_only_for_own_collection() {
        let (_tmp, db) = setup_test_db().await;
        let c = db.collection("c").unwrap();
        let d = db.collection("d").unwrap();

        let (tx, mut rx) = unbounded_channel();
        let registration = db
            .on_query_snapshot(&Query::from(c.clone()), move |snapshot, changes| {
                let _ = tx.send((snapshot, changes));
            })
            .await
            .unwrap();

        let (initial, changes) = next(&mut rx).await;
        assert!(initial.is_empty());
        assert!(changes.is_empty());

        db.add_doc(&d, json!({ "other": true })).await.unwrap();
        assert_quiet(&mut rx).await;

        let added = db.add_doc(&c, json!({ "hello": "world" })).await.unwrap();
        let (snapshot, changes) = next(&mut rx).await;
        assert_eq!(snapshot.size(), 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert_eq!(changes[0].doc.id(), added.id());
        assert_eq!(changes[0].new_index, Some(0));
        assert_quiet(&mut rx).await;

        registration.unsubscribe();
    }

    #[tokio::test]
    async fn test_query_listener_modified_and_removed() {
        let (_tmp, db) = setup_test_db().await;
        let tasks = db.collection("tasks").unwrap();
        let first = tasks.doc("t1").unwrap();
        let second = tasks.doc("t2").unwrap();
        db.set_doc(&first, json!({ "rank": 1 })).await.unwrap();
        db.set_doc(&second, json!({ "rank": 2 })).await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        let query = Query::new(tasks, vec![order_by("rank", Direction::Asc)]);
        let registration = db
            .on_query_snapshot(&query, move |_, changes| {
                let _ = tx.send(changes);
            })
            .await
            .unwrap();

        let initial = next(&mut rx).await;
        assert_eq!(initial.len(), 2);
        assert!(initial.iter().all(|c| c.kind == ChangeKind::Added));

        db.update_doc(&second, json!({ "done": true })).await.unwrap();
        let changes = next(&mut rx).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[0].new_index, Some(1));

        db.delete_doc(&first).await.unwrap();
        let changes = next(&mut rx).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[0].old_index, Some(0));

        registration.unsubscribe();
    }

    #[tokio::test]
    async fn test_collection_group_listener() {
        let (_tmp, db) = setup_test_db().await;
        let (tx, mut rx) = unbounded_channel();
        let group = db.collection_group("comments").unwrap();
        let _registration = db
            .on_query_snapshot(&Query::from(group), move |_, changes| {
                let _ = tx.send(changes);
            })
            .await
            .unwrap();
        assert!(next(&mut rx).await.is_empty());

        let nested = db.doc("posts/p1/comments/c1").unwrap();
        db.set_doc(&nested, json!({ "text": "hi" })).await.unwrap();
        let changes = next(&mut rx).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].doc.collection_id, "posts/p1/comments");
    }

    #[tokio::test]
    async fn test_doc_listener_suppresses_redundant_deliveries() {
        let (_tmp, db) = setup_test_db().await;
        let profile = db.doc("profiles/p").unwrap();

        let (tx, mut rx) = unbounded_channel();
        let registration = db
            .on_doc_snapshot(&profile, move |snapshot| {
                let _ = tx.send(snapshot);
            })
            .await
            .unwrap();
        assert!(!next(&mut rx).await.exists());

        db.set_doc(&profile, json!({ "bio": "hi" })).await.unwrap();
        assert_eq!(next(&mut rx).await.get("bio"), Some(&json!("hi")));

        // Same data again, then a sibling document: neither changes this one.
        db.set_doc(&profile, json!({ "bio": "hi" })).await.unwrap();
        db.set_doc(&db.doc("profiles/other").unwrap(), json!({ "bio": "x" }))
            .await
            .unwrap();
        db.set_doc(&profile, json!({ "bio": "bye" })).await.unwrap();
        assert_eq!(next(&mut rx).await.get("bio"), Some(&json!("bye")));

        db.delete_doc(&profile).await.unwrap();
        assert!(!next(&mut rx).await.exists());

        assert!(registration.is_active());
        registration.unsubscribe();
    }

    #[tokio::test]
    async fn test_query_listener_delivers_unchanged_result() {
        let (_tmp, db) = setup_test_db().await;
        let flags = db.collection("flags").unwrap();
        let beta = flags.doc("beta").unwrap();
        db.set_doc(&beta, json!({ "on": true })).await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        let _registration = db
            .on_query_snapshot(&Query::from(flags), move |snapshot, changes| {
                let _ = tx.send((snapshot.size(), changes));
            })
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await.0, 1);

        db.set_doc(&beta, json!({ "on": true })).await.unwrap();
        let (size, changes) = next(&mut rx).await;
        assert_eq!(size, 1);
        assert!(changes.is_empty());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_dropping_handles_releases_callback() {
        let (_tmp, db) = setup_test_db().await;
        let (tx, mut rx) = unbounded_channel();
        let registration = db
            .on_query_snapshot(&Query::from(db.collection("logs").unwrap()), move |s, _| {
                let _ = tx.send(s.size());
            })
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await, 0);

        drop(registration);
        drop(db);
        let closed = timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(closed, Ok(None));
    }

    #[tokio::test]
    async fn test_listener_ends_with_the_store() {
        let (_tmp, db) = setup_test_db().await;
        let (tx, mut rx) = unbounded_channel();
        let registration = db
            .on_doc_snapshot(&db.doc("logs/l1").unwrap(), move |s| {
                let _ = tx.send(s.exists());
            })
            .await
            .unwrap();
        assert!(!next(&mut rx).await);

        // The registration is still held; only the store handle goes away.
        drop(db);
        let closed = timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(closed, Ok(None));
        for _ in 0..100 {
            if !registration.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registration.is_active());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (_tmp, db) = setup_test_db().await;
        let notes = db.collection("notes").unwrap();

        let (tx, mut rx) = unbounded_channel();
        let registration = db
            .on_query_snapshot(&Query::from(notes.clone()), move |snapshot, _| {
                let _ = tx.send(snapshot.size());
            })
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await, 0);

        registration.unsubscribe();
        db.add_doc(&notes, json!({ "n": 1 })).await.unwrap();
        assert_quiet(&mut rx).await;
    }
}
