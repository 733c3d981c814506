// Whole-store export and import, as a raw file image or as document rows.

use crate::engine::{backing_files, SqlValue, SqliteEngine, Statement, StorageEngine};
use crate::error::{DocError, Result};
use crate::listen::Scope;
use crate::store::Database;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";
/// Smallest possible image: the 100-byte database header.
const MIN_IMAGE_LEN: usize = 100;
const MIN_PAGE_SIZE: usize = 512;
const MAX_PAGE_SIZE: usize = 65536;

/// One document in the JSON backup format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRow {
    pub collection_id: String,
    pub doc_id: String,
    pub data: Value,
}

impl Database {
    /// Raw image of the backing file. The handle is closed for the read and
    /// reopened afterwards, also when the read fails.
    pub async fn export_binary(&self) -> Result<Vec<u8>> {
        self.queue()
            .submit(|session| {
                session.ensure_open()?;
                session.close()?;
                let image = std::fs::read(session.path());
                let reopened = session.ensure_open();
                let image = image?;
                reopened?;
                log::info!(
                    "Exported {} bytes from {}",
                    image.len(),
                    session.path().display()
                );
                Ok(image)
            })
            .await
    }

    /// Replace the backing file with `image` and reopen it. The image is
    /// checked in a scratch copy first; a rejected image leaves the store
    /// untouched. Every listener re-evaluates afterwards.
    pub async fn import_binary(&self, image: Vec<u8>) -> Result<()> {
        check_header(&image)?;

        self.queue()
            .submit(move |session| {
                let path = session.path();
                let scratch = verified_copy(&image, &path)?;

                session.close()?;
                // Sidecar journals belong to the file being replaced.
                for sidecar in backing_files(&path).into_iter().skip(1) {
                    if sidecar.exists() {
                        std::fs::remove_file(&sidecar)?;
                    }
                }

                let replaced = scratch.persist(&path).map(|_| ()).map_err(|e| e.error);
                let reopened = session.ensure_open();
                replaced?;
                reopened?;
                log::info!("Imported {} bytes into {}", image.len(), path.display());
                Ok(())
            })
            .await?;

        self.events().emit(Scope::Wildcard);
        Ok(())
    }

    /// Every document as a backup row, ordered by collection and id.
    pub async fn export_json(&self) -> Result<Vec<BackupRow>> {
        let rows = self
            .queue()
            .submit_safe(|session| {
                session.run(
                    "SELECT collection_id, doc_id, data FROM documents ORDER BY collection_id, doc_id",
                    &[],
                )
            })
            .await?;

        rows.iter()
            .map(|row| {
                Ok(BackupRow {
                    collection_id: row.text("collection_id")?.to_string(),
                    doc_id: row.text("doc_id")?.to_string(),
                    data: serde_json::from_str(row.text("data")?)?,
                })
            })
            .collect()
    }

    /// Replace every document with the rows of a JSON backup. The whole
    /// backup is validated before the store is touched, and the replacement
    /// is one transaction. Every listener re-evaluates afterwards.
    pub async fn import_json(&self, backup: &Value) -> Result<usize> {
        let rows = parse_backup(backup)?;
        let count = rows.len();

        let mut statements = vec![Statement::new("DELETE FROM documents", Vec::new())];
        for row in rows {
            statements.push(Statement::new(
                "INSERT INTO documents (collection_id, doc_id, data) VALUES (?, ?, ?)",
                vec![
                    SqlValue::Text(row.collection_id),
                    SqlValue::Text(row.doc_id),
                    SqlValue::Text(serde_json::to_string(&row.data)?),
                ],
            ));
        }
        self.queue().submit_transactional(statements).await?;

        log::info!("Imported {count} documents from JSON backup");
        self.events().emit(Scope::Wildcard);
        Ok(count)
    }
}

/// Reject images whose header is not a SQLite header, or that end before
/// the last page the header declares.
fn check_header(image: &[u8]) -> Result<()> {
    let reject = |reason: &str| {
        Err(DocError::Backup(format!(
            "Binary import is not a SQLite database image: {reason}"
        )))
    };
    if image.len() < MIN_IMAGE_LEN || !image.starts_with(SQLITE_HEADER) {
        return reject("missing header");
    }

    let page_size = match u16::from_be_bytes([image[16], image[17]]) {
        1 => MAX_PAGE_SIZE,
        n => usize::from(n),
    };
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return reject("invalid page size");
    }

    if image.len() % page_size != 0 {
        return reject("image is not a whole number of pages");
    }
    // The in-header page count is only trusted when its version stamp
    // matches the change counter.
    let page_count = u32::from_be_bytes([image[28], image[29], image[30], image[31]]) as usize;
    let stamped = image[24..28] == image[92..96];
    if stamped && page_count.saturating_mul(page_size) > image.len() {
        return reject("image is truncated");
    }
    Ok(())
}

/// Write `image` to a scratch file beside `path` and run an integrity check
/// on it. The checked copy is returned so it can be moved into place.
fn verified_copy(image: &[u8], path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut scratch = tempfile::Builder::new()
        .prefix(".doclite-import-")
        .tempfile_in(dir)?;
    scratch.write_all(image)?;
    scratch.as_file().sync_all()?;

    let mut handle = SqliteEngine::new()
        .open(scratch.path())
        .map_err(|e| DocError::Backup(format!("Binary import does not open: {e}")))?;
    let checked = handle.run("PRAGMA quick_check", &[]);
    handle.close()?;

    let rows = checked
        .map_err(|e| DocError::Backup(format!("Binary import failed integrity check: {e}")))?;
    let verdict = match rows.first() {
        Some(row) => row.text("quick_check")?,
        None => "no result",
    };
    if verdict != "ok" {
        return Err(DocError::Backup(format!(
            "Binary import failed integrity check: {verdict}"
        )));
    }
    Ok(scratch)
}

/// Validate a JSON backup. `data` may be an object or a string holding one.
pub fn parse_backup(backup: &Value) -> Result<Vec<BackupRow>> {
    let entries = backup
        .as_array()
        .ok_or_else(|| DocError::Backup("Expected a JSON array of document rows".into()))?;

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let field = |name: &str| {
                entry
                    .get(name)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        DocError::Backup(format!("Row {i}: missing string field '{name}'"))
                    })
            };
            let collection_id = field("collection_id")?;
            let doc_id = field("doc_id")?;

            let data = match entry.get("data") {
                Some(Value::Object(map)) => Value::Object(map.clone()),
                Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                    Ok(parsed @ Value::Object(_)) => parsed,
                    _ => {
                        return Err(DocError::Backup(format!(
                            "Row {i}: 'data' string is not a JSON object"
                        )))
                    }
                },
                _ => {
                    return Err(DocError::Backup(format!(
                        "Row {i}: 'data' must be an object"
                    )))
                }
            };

            Ok(BackupRow {
                collection_id,
                doc_id,
                data,
            })
        })
        .collect()
}
