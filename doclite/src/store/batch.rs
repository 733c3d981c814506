use super::{delete_statement, set_statement, update_statement, Database};
use crate::document;
use crate::engine::Statement;
use crate::error::{DocError, Result};
use crate::reference::DocumentRef;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;

/// A set of writes that commit all-or-nothing.
/// Nothing runs until `commit`; a failing statement rolls back the whole
/// batch. A batch commits at most once.
pub struct WriteBatch {
    db: Database,
    statements: Vec<Statement>,
    collections: BTreeSet<String>,
    committed: bool,
}

impl WriteBatch {
    pub(crate) fn new(db: Database) -> Self {
        WriteBatch {
            db,
            statements: Vec::new(),
            collections: BTreeSet::new(),
            committed: false,
        }
    }

    /// Queue a full replace of the document.
    pub fn set(&mut self, reference: &DocumentRef, data: Value) -> Result<&mut Self> {
        self.check_open()?;
        let payload = document::prepare_write(data, Utc::now())?;
        self.push(reference, set_statement(reference, &payload)?);
        Ok(self)
    }

    /// Queue a merge into the document.
    pub fn update(&mut self, reference: &DocumentRef, data: Value) -> Result<&mut Self> {
        self.check_open()?;
        let payload = document::prepare_write(data, Utc::now())?;
        self.push(reference, update_statement(reference, &payload)?);
        Ok(self)
    }

    pub fn delete(&mut self, reference: &DocumentRef) -> Result<&mut Self> {
        self.check_open()?;
        self.push(reference, delete_statement(reference));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Run every queued write in one transaction, then notify each affected
    /// collection once.
    pub async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.committed = true;

        if self.statements.is_empty() {
            return Ok(());
        }

        let statements = std::mem::take(&mut self.statements);
        log::debug!("Committing batch of {} writes", statements.len());
        self.db.queue().submit_transactional(statements).await?;

        for collection in std::mem::take(&mut self.collections) {
            self.db.emit_collection(&collection);
        }
        Ok(())
    }

    fn push(&mut self, reference: &DocumentRef, statement: Statement) {
        self.collections
            .insert(reference.collection_id().to_string());
        self.statements.push(statement);
    }

    fn check_open(&self) -> Result<()> {
        if self.committed {
            return Err(DocError::BatchAlreadyCommitted);
        }
        Ok(())
    }
}
