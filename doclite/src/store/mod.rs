mod batch;

pub use batch::WriteBatch;

use crate::config::Config;
use crate::document::{self, DocumentSnapshot, QueryDocumentSnapshot, QuerySnapshot};
use crate::engine::{Row, SqlValue, SqliteEngine, Statement, StorageEngine};
use crate::error::{DocError, Result};
use crate::listen::{EventBus, Scope};
use crate::query::{self, sql_literal, Query};
use crate::queue::ExecutionQueue;
use crate::reference::{CollectionGroupRef, CollectionRef, DocumentRef};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};

/// The main entry point for doclite.
/// A cheaply cloneable handle onto one named store: every clone shares the
/// same execution queue and change notification bus.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    queue: ExecutionQueue,
    events: EventBus,
}

/// A handle that does not keep the store alive. Background tasks hold one so
/// that dropping every `Database` shuts the queue and the bus down.
#[derive(Clone)]
pub(crate) struct WeakDatabase {
    inner: Weak<Inner>,
}

impl WeakDatabase {
    pub(crate) fn upgrade(&self) -> Option<Database> {
        self.inner.upgrade().map(|inner| Database { inner })
    }
}

impl Database {
    /// Start the execution queue for the store described by `config`.
    /// The backing file is opened by `init` or the first operation.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_engine(Box::new(SqliteEngine::new()), config)
    }

    pub fn with_engine(engine: Box<dyn StorageEngine>, config: Config) -> Result<Self> {
        let events = EventBus::new(config.listener_buffer);
        let queue = ExecutionQueue::start(engine, config.clone())?;
        Ok(Database {
            inner: Arc::new(Inner {
                config,
                queue,
                events,
            }),
        })
    }

    /// Start the queue and open the backing file.
    pub async fn open(config: Config) -> Result<Self> {
        let db = Self::new(config)?;
        db.init().await?;
        Ok(db)
    }

    /// Open the backing file. Safe to call repeatedly or concurrently.
    pub async fn init(&self) -> Result<()> {
        self.inner.queue.init().await
    }

    /// Close the backing file. Later operations reopen it.
    pub async fn close(&self) -> Result<()> {
        self.inner.queue.close().await
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn collection(&self, path: &str) -> Result<CollectionRef> {
        CollectionRef::new(path)
    }

    pub fn doc(&self, path: &str) -> Result<DocumentRef> {
        DocumentRef::new(path)
    }

    pub fn collection_group(&self, id: &str) -> Result<CollectionGroupRef> {
        CollectionGroupRef::new(id)
    }

    /// Read one document. An absent document is a snapshot whose `exists()`
    /// is false, not an error.
    pub async fn get_doc(&self, reference: &DocumentRef) -> Result<DocumentSnapshot> {
        let statement = Statement::new(
            "SELECT data FROM documents WHERE collection_id = ? AND doc_id = ?",
            key_bindings(reference),
        );
        let rows = self
            .inner
            .queue
            .submit_safe(move |session| session.run_statement(&statement))
            .await?;

        let data = match rows.first() {
            Some(row) => Some(parse_data(row.text("data")?)?),
            None => None,
        };
        Ok(DocumentSnapshot::new(reference.clone(), data))
    }

    /// Run a query. Results follow the requested order, including for
    /// `limitToLast` queries.
    pub async fn get_docs(&self, query: &Query) -> Result<QuerySnapshot> {
        let compiled = query::compile(query)?;
        let reverse = compiled.reverse;
        let rows = self
            .inner
            .queue
            .submit_safe(move |session| session.run(&compiled.sql, &compiled.bindings))
            .await?;

        let mut docs = rows.iter().map(row_to_doc).collect::<Result<Vec<_>>>()?;
        if reverse {
            docs.reverse();
        }
        Ok(QuerySnapshot::new(docs))
    }

    /// Number of documents matching the query's filters. Ordering and limits
    /// are ignored.
    pub async fn count(&self, query: &Query) -> Result<u64> {
        let compiled = query::compile_count(query)?;
        let rows = self
            .inner
            .queue
            .submit_safe(move |session| session.run(&compiled.sql, &compiled.bindings))
            .await?;
        let count = match rows.first() {
            Some(row) => row.integer("count")?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Create or fully replace a document.
    pub async fn set_doc(&self, reference: &DocumentRef, data: Value) -> Result<()> {
        let payload = document::prepare_write(data, Utc::now())?;
        let statement = set_statement(reference, &payload)?;
        self.execute(statement).await?;
        self.emit_collection(reference.collection_id());
        Ok(())
    }

    /// Store `data` under a freshly generated id and return its reference.
    pub async fn add_doc(&self, collection: &CollectionRef, data: Value) -> Result<DocumentRef> {
        let reference = collection.doc(&uuid::Uuid::new_v4().to_string())?;
        self.set_doc(&reference, data).await?;
        Ok(reference)
    }

    /// Merge `data` into the stored document. Updating a document that does
    /// not exist changes nothing and is not an error.
    pub async fn update_doc(&self, reference: &DocumentRef, data: Value) -> Result<()> {
        let payload = document::prepare_write(data, Utc::now())?;
        let statement = update_statement(reference, &payload)?;
        self.execute(statement).await?;
        self.emit_collection(reference.collection_id());
        Ok(())
    }

    /// Apply an RFC 6902 patch (an array of operations) to a stored document.
    /// Read, patch and write happen in one queue slot. Fails with `NotFound`
    /// when the document does not exist; a failing operation leaves the
    /// document untouched.
    pub async fn update_doc_patch(
        &self,
        collection_id: &str,
        doc_id: &str,
        patch: Value,
    ) -> Result<()> {
        let reference = CollectionRef::new(collection_id)?.doc(doc_id)?;
        let patch: json_patch::Patch = serde_json::from_value(patch)
            .map_err(|e| DocError::Patch(format!("Malformed patch document: {e}")))?;

        let target = reference.clone();
        self.inner
            .queue
            .submit_safe(move |session| {
                let rows = session.run(
                    "SELECT data FROM documents WHERE collection_id = ? AND doc_id = ?",
                    &key_bindings(&target),
                )?;
                let row = rows.first().ok_or_else(|| DocError::NotFound {
                    collection: target.collection_id().to_string(),
                    id: target.id().to_string(),
                })?;

                let mut data = parse_data(row.text("data")?)?;
                json_patch::patch(&mut data, &patch.0)
                    .map_err(|e| DocError::Patch(e.to_string()))?;
                let payload = match data {
                    Value::Object(map) => map,
                    _ => {
                        return Err(DocError::Patch(
                            "Patched document is no longer an object".into(),
                        ))
                    }
                };
                session.run_statement(&set_statement(&target, &payload)?)?;
                Ok(())
            })
            .await?;

        self.emit_collection(reference.collection_id());
        Ok(())
    }

    /// Delete a document. Deleting an absent document is not an error.
    pub async fn delete_doc(&self, reference: &DocumentRef) -> Result<()> {
        self.execute(delete_statement(reference)).await?;
        self.emit_collection(reference.collection_id());
        Ok(())
    }

    /// Start an empty write batch.
    pub fn write_batch(&self) -> WriteBatch {
        WriteBatch::new(self.clone())
    }

    /// Create a partial index over one field of one collection and return
    /// its name. The indexed expression is the one queries filter and sort on.
    pub async fn create_index(&self, collection_id: &str, field: &str) -> Result<String> {
        let collection = CollectionRef::new(collection_id)?;
        let name = index_name(collection.id(), field);
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS \"{name}\" ON documents ({}) WHERE collection_id = {}",
            query::field_expr(field)?,
            sql_literal(collection.id())
        );
        log::info!("Creating index {name} on {}", collection.id());
        self.execute(Statement::new(sql, Vec::new())).await?;
        Ok(name)
    }

    /// How many times the storage engine has been torn down and reopened
    /// after a crash.
    pub async fn engine_restarts(&self) -> Result<u64> {
        self.inner.queue.restarts().await
    }

    pub(crate) fn downgrade(&self) -> WeakDatabase {
        WeakDatabase {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn queue(&self) -> &ExecutionQueue {
        &self.inner.queue
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub(crate) fn emit_collection(&self, collection_id: &str) {
        self.inner
            .events
            .emit(Scope::Collection(collection_id.to_string()));
    }

    async fn execute(&self, statement: Statement) -> Result<()> {
        self.inner
            .queue
            .submit_safe(move |session| session.run_statement(&statement).map(|_| ()))
            .await
    }
}

fn key_bindings(reference: &DocumentRef) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(reference.collection_id().to_string()),
        SqlValue::Text(reference.id().to_string()),
    ]
}

pub(crate) fn set_statement(reference: &DocumentRef, data: &Map<String, Value>) -> Result<Statement> {
    let mut bindings = key_bindings(reference);
    bindings.push(SqlValue::Text(serde_json::to_string(data)?));
    Ok(Statement::new(
        "INSERT INTO documents (collection_id, doc_id, data) VALUES (?, ?, ?) \
         ON CONFLICT(collection_id, doc_id) DO UPDATE SET data = excluded.data",
        bindings,
    ))
}

pub(crate) fn update_statement(
    reference: &DocumentRef,
    data: &Map<String, Value>,
) -> Result<Statement> {
    let mut bindings = vec![SqlValue::Text(serde_json::to_string(data)?)];
    bindings.extend(key_bindings(reference));
    Ok(Statement::new(
        "UPDATE documents SET data = json_patch(data, ?) WHERE collection_id = ? AND doc_id = ?",
        bindings,
    ))
}

pub(crate) fn delete_statement(reference: &DocumentRef) -> Statement {
    Statement::new(
        "DELETE FROM documents WHERE collection_id = ? AND doc_id = ?",
        key_bindings(reference),
    )
}

/// `idx_<collection>_<field>`, every non-alphanumeric character replaced
/// with `_`.
pub(crate) fn index_name(collection_id: &str, field: &str) -> String {
    format!("idx_{collection_id}_{field}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn parse_data(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

fn row_to_doc(row: &Row) -> Result<QueryDocumentSnapshot> {
    Ok(QueryDocumentSnapshot {
        collection_id: row.text("collection_id")?.to_string(),
        id: row.text("doc_id")?.to_string(),
        data: parse_data(row.text("data")?)?,
    })
}
