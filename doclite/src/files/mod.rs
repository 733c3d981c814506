// Binary blobs stored next to the documents, keyed by path.

use crate::document::format_timestamp;
use crate::engine::{SqlValue, Statement};
use crate::error::{DocError, Result};
use crate::store::Database;
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFile {
    pub path: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub content_type: String,
    pub size: u64,
    pub updated_at: String,
}

impl Database {
    /// Store `data` under `path`, replacing any previous file.
    pub async fn upload_file(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        if path.is_empty() {
            return Err(DocError::Validation("File path must not be empty".into()));
        }
        let size = data.len() as i64;
        let statement = Statement::new(
            "INSERT INTO files (path, data, contentType, size, updatedAt) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET data = excluded.data, contentType = excluded.contentType, \
             size = excluded.size, updatedAt = excluded.updatedAt",
            vec![
                SqlValue::Text(path.to_string()),
                SqlValue::Blob(data),
                SqlValue::Text(content_type.to_string()),
                SqlValue::Integer(size),
                SqlValue::Text(format_timestamp(Utc::now())),
            ],
        );
        self.queue()
            .submit_safe(move |session| session.run_statement(&statement).map(|_| ()))
            .await?;
        log::debug!("Stored file {path} ({size} bytes)");
        Ok(())
    }

    pub async fn get_file(&self, path: &str) -> Result<Option<StoredFile>> {
        let binding = vec![SqlValue::Text(path.to_string())];
        let rows = self
            .queue()
            .submit_safe(move |session| {
                session.run(
                    "SELECT path, data, contentType, size, updatedAt FROM files WHERE path = ?",
                    &binding,
                )
            })
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(StoredFile {
            path: row.text("path")?.to_string(),
            data: row.blob("data")?.to_vec(),
            content_type: row.text("contentType")?.to_string(),
            size: u64::try_from(row.integer("size")?).unwrap_or(0),
            updated_at: row.text("updatedAt")?.to_string(),
        }))
    }

    /// Remove the file at `path`. Missing files are ignored.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let binding = vec![SqlValue::Text(path.to_string())];
        self.queue()
            .submit_safe(move |session| {
                session
                    .run("DELETE FROM files WHERE path = ?", &binding)
                    .map(|_| ())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::store::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_get_delete() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(Config::new(tmp.path(), "files.db")).await.unwrap();

        assert_eq!(db.get_file("avatars/a.png").await.unwrap(), None);

        db.upload_file("avatars/a.png", vec![0x89, b'P', b'N', b'G'], "image/png")
            .await
            .unwrap();
        let file = db.get_file("avatars/a.png").await.unwrap().unwrap();
        assert_eq!(file.data, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(file.size, 4);
        assert_eq!(file.content_type, "image/png");
        assert!(file.updated_at.ends_with('Z'));

        db.upload_file("avatars/a.png", b"new".to_vec(), "text/plain")
            .await
            .unwrap();
        let file = db.get_file("avatars/a.png").await.unwrap().unwrap();
        assert_eq!(file.data, b"new".to_vec());
        assert_eq!(file.content_type, "text/plain");

        db.delete_file("avatars/a.png").await.unwrap();
        assert_eq!(db.get_file("avatars/a.png").await.unwrap(), None);
        db.delete_file("avatars/a.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_file_round_trips() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(Config::new(tmp.path(), "files.db")).await.unwrap();
        db.upload_file("empty.bin", Vec::new(), "application/octet-stream")
            .await
            .unwrap();
        let file = db.get_file("empty.bin").await.unwrap().unwrap();
        assert!(file.data.is_empty());
        assert_eq!(file.size, 0);
        assert!(db.upload_file("", Vec::new(), "x").await.is_err());
    }
}
