//! SQLite-based persistence layer for downloads
//!
//! Stores download records, their pieces and custom headers in a relational
//! database. Piece rows are updated independently by piece workers; the
//! download row is written by the coordinator only after all pieces joined.

use crate::error::SegdlError;
use chrono::{DateTime, Utc};
use segdl_types::{DownloadHeader, DownloadInfo, DownloadPiece, StatusCode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS download_info (
        id TEXT PRIMARY KEY,
        url TEXT NOT NULL,
        dir_path TEXT NOT NULL,
        file_name TEXT NOT NULL,
        description TEXT,
        mime_type TEXT NOT NULL,
        total_bytes INTEGER,
        num_pieces INTEGER NOT NULL DEFAULT 1,
        status_code TEXT NOT NULL,
        status_msg TEXT,
        partial_support INTEGER NOT NULL DEFAULT 0,
        retry INTEGER NOT NULL DEFAULT 1,
        unmetered_only INTEGER NOT NULL DEFAULT 0,
        num_failed INTEGER NOT NULL DEFAULT 0,
        retry_after INTEGER,
        last_modify TEXT NOT NULL,
        date_added TEXT NOT NULL,
        has_metadata INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS download_pieces (
        info_id TEXT NOT NULL,
        piece_index INTEGER NOT NULL,
        size INTEGER,
        cur_bytes INTEGER NOT NULL DEFAULT 0,
        status_code TEXT NOT NULL,
        status_msg TEXT,
        num_failed INTEGER NOT NULL DEFAULT 0,
        speed INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (info_id, piece_index),
        FOREIGN KEY (info_id) REFERENCES download_info(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS download_headers (
        info_id TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (info_id, name),
        FOREIGN KEY (info_id) REFERENCES download_info(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_info_status ON download_info(status_code);
    CREATE INDEX IF NOT EXISTS idx_pieces_info ON download_pieces(info_id);
"#;

/// Database connection pool for download persistence
#[derive(Clone, Debug)]
pub struct DownloadDatabase {
    pool: SqlitePool,
}

impl DownloadDatabase {
    /// Open (or create) the database file at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, SegdlError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::init(pool).await
    }

    /// A private in-memory database, used by tests and dry runs
    pub async fn in_memory() -> Result<Self, SegdlError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Every connection would get its own empty database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, SegdlError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    // ========================================================================
    // Download info
    // ========================================================================

    /// Insert a new download with its pieces and headers
    pub async fn add_info(
        &self,
        info: &DownloadInfo,
        headers: &[DownloadHeader],
    ) -> Result<(), SegdlError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO download_info (
                id, url, dir_path, file_name, description, mime_type, total_bytes,
                num_pieces, status_code, status_msg, partial_support, retry,
                unmetered_only, num_failed, retry_after, last_modify, date_added,
                has_metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(info.id.to_string())
        .bind(&info.url)
        .bind(info.dir_path.to_string_lossy().to_string())
        .bind(&info.file_name)
        .bind(info.description.as_ref())
        .bind(&info.mime_type)
        .bind(info.total_bytes.map(|b| b as i64))
        .bind(i64::from(info.num_pieces))
        .bind(info.status_code.to_string())
        .bind(info.status_msg.as_ref())
        .bind(info.partial_support)
        .bind(info.retry)
        .bind(info.unmetered_only)
        .bind(i64::from(info.num_failed))
        .bind(info.retry_after.map(|ms| ms as i64))
        .bind(info.last_modify.to_rfc3339())
        .bind(info.date_added.to_rfc3339())
        .bind(info.has_metadata)
        .execute(&mut *tx)
        .await?;

        for piece in info.make_pieces() {
            insert_piece(&mut tx, &piece).await?;
        }

        for header in headers {
            sqlx::query("INSERT OR REPLACE INTO download_headers (info_id, name, value) VALUES (?, ?, ?)")
                .bind(info.id.to_string())
                .bind(&header.name)
                .bind(&header.value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load a download by ID
    pub async fn get_info(&self, id: Uuid) -> Result<Option<DownloadInfo>, SegdlError> {
        let row = sqlx::query("SELECT * FROM download_info WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_info).transpose()
    }

    /// Load all downloads, oldest first
    pub async fn list_infos(&self) -> Result<Vec<DownloadInfo>, SegdlError> {
        let rows = sqlx::query("SELECT * FROM download_info ORDER BY date_added ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_info).collect()
    }

    /// Write back every mutable column of a download; returns rows affected
    pub async fn update_info(&self, info: &DownloadInfo) -> Result<u64, SegdlError> {
        let result = sqlx::query(
            r#"
            UPDATE download_info SET
                url = ?, dir_path = ?, file_name = ?, description = ?, mime_type = ?,
                total_bytes = ?, num_pieces = ?, status_code = ?, status_msg = ?,
                partial_support = ?, retry = ?, unmetered_only = ?, num_failed = ?,
                retry_after = ?, last_modify = ?, has_metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(&info.url)
        .bind(info.dir_path.to_string_lossy().to_string())
        .bind(&info.file_name)
        .bind(info.description.as_ref())
        .bind(&info.mime_type)
        .bind(info.total_bytes.map(|b| b as i64))
        .bind(i64::from(info.num_pieces))
        .bind(info.status_code.to_string())
        .bind(info.status_msg.as_ref())
        .bind(info.partial_support)
        .bind(info.retry)
        .bind(info.unmetered_only)
        .bind(i64::from(info.num_failed))
        .bind(info.retry_after.map(|ms| ms as i64))
        .bind(info.last_modify.to_rfc3339())
        .bind(info.has_metadata)
        .bind(info.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete a download together with its pieces and headers
    pub async fn delete_info(&self, id: Uuid) -> Result<(), SegdlError> {
        let mut tx = self.pool.begin().await?;
        for table in ["download_pieces", "download_headers"] {
            sqlx::query(&format!("DELETE FROM {} WHERE info_id = ?", table))
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM download_info WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Pieces
    // ========================================================================

    /// Load the pieces of a download ordered by index
    pub async fn get_pieces(&self, info_id: Uuid) -> Result<Vec<DownloadPiece>, SegdlError> {
        let rows = sqlx::query("SELECT * FROM download_pieces WHERE info_id = ? ORDER BY piece_index")
            .bind(info_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_piece).collect()
    }

    /// Load a single piece
    pub async fn get_piece(
        &self,
        info_id: Uuid,
        index: u32,
    ) -> Result<Option<DownloadPiece>, SegdlError> {
        let row = sqlx::query("SELECT * FROM download_pieces WHERE info_id = ? AND piece_index = ?")
            .bind(info_id.to_string())
            .bind(i64::from(index))
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_piece).transpose()
    }

    /// Destroy the piece set of a download and insert `pieces` in its place
    pub async fn replace_pieces(
        &self,
        info_id: Uuid,
        pieces: &[DownloadPiece],
    ) -> Result<(), SegdlError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM download_pieces WHERE info_id = ?")
            .bind(info_id.to_string())
            .execute(&mut *tx)
            .await?;
        for piece in pieces {
            insert_piece(&mut tx, piece).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Update one piece row.
    ///
    /// Returns the number of rows affected; zero means the download was
    /// deleted while the piece was running.
    pub async fn update_piece(&self, piece: &DownloadPiece) -> Result<u64, SegdlError> {
        let result = sqlx::query(
            r#"
            UPDATE download_pieces
            SET size = ?, cur_bytes = ?, status_code = ?, status_msg = ?, num_failed = ?, speed = ?
            WHERE info_id = ? AND piece_index = ?
            "#,
        )
        .bind(piece.size.map(|s| s as i64))
        .bind(piece.cur_bytes as i64)
        .bind(piece.status_code.to_string())
        .bind(piece.status_msg.as_ref())
        .bind(i64::from(piece.num_failed))
        .bind(piece.speed as i64)
        .bind(piece.info_id.to_string())
        .bind(i64::from(piece.index))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Headers
    // ========================================================================

    pub async fn get_headers(&self, info_id: Uuid) -> Result<Vec<DownloadHeader>, SegdlError> {
        let rows = sqlx::query("SELECT * FROM download_headers WHERE info_id = ? ORDER BY name")
            .bind(info_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DownloadHeader {
                    info_id: parse_uuid(row.get("info_id"))?,
                    name: row.get("name"),
                    value: row.get("value"),
                })
            })
            .collect()
    }

    /// Insert or replace a header by name
    pub async fn set_header(&self, header: &DownloadHeader) -> Result<(), SegdlError> {
        sqlx::query("INSERT OR REPLACE INTO download_headers (info_id, name, value) VALUES (?, ?, ?)")
            .bind(header.info_id.to_string())
            .bind(&header.name)
            .bind(&header.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_header(&self, info_id: Uuid, name: &str) -> Result<(), SegdlError> {
        sqlx::query("DELETE FROM download_headers WHERE info_id = ? AND name = ?")
            .bind(info_id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_piece(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    piece: &DownloadPiece,
) -> Result<(), SegdlError> {
    sqlx::query(
        r#"
        INSERT INTO download_pieces (
            info_id, piece_index, size, cur_bytes, status_code, status_msg, num_failed, speed
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(piece.info_id.to_string())
    .bind(i64::from(piece.index))
    .bind(piece.size.map(|s| s as i64))
    .bind(piece.cur_bytes as i64)
    .bind(piece.status_code.to_string())
    .bind(piece.status_msg.as_ref())
    .bind(i64::from(piece.num_failed))
    .bind(piece.speed as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_uuid(s: String) -> Result<Uuid, SegdlError> {
    Uuid::parse_str(&s).map_err(|e| SegdlError::Serialization(e.to_string()))
}

fn parse_status(s: String) -> Result<StatusCode, SegdlError> {
    s.parse().map_err(SegdlError::Serialization)
}

fn parse_time(s: String) -> Result<DateTime<Utc>, SegdlError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SegdlError::Serialization(e.to_string()))
}

fn row_to_info(row: SqliteRow) -> Result<DownloadInfo, SegdlError> {
    Ok(DownloadInfo {
        id: parse_uuid(row.get("id"))?,
        url: row.get("url"),
        dir_path: PathBuf::from(row.get::<String, _>("dir_path")),
        file_name: row.get("file_name"),
        description: row.get("description"),
        mime_type: row.get("mime_type"),
        total_bytes: row.get::<Option<i64>, _>("total_bytes").map(|b| b as u64),
        num_pieces: row.get::<i64, _>("num_pieces") as u32,
        status_code: parse_status(row.get("status_code"))?,
        status_msg: row.get("status_msg"),
        partial_support: row.get("partial_support"),
        retry: row.get("retry"),
        unmetered_only: row.get("unmetered_only"),
        num_failed: row.get::<i64, _>("num_failed") as u32,
        retry_after: row.get::<Option<i64>, _>("retry_after").map(|ms| ms as u64),
        last_modify: parse_time(row.get("last_modify"))?,
        date_added: parse_time(row.get("date_added"))?,
        has_metadata: row.get("has_metadata"),
    })
}

fn row_to_piece(row: SqliteRow) -> Result<DownloadPiece, SegdlError> {
    Ok(DownloadPiece {
        info_id: parse_uuid(row.get("info_id"))?,
        index: row.get::<i64, _>("piece_index") as u32,
        size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
        cur_bytes: row.get::<i64, _>("cur_bytes") as u64,
        status_code: parse_status(row.get("status_code"))?,
        status_msg: row.get("status_msg"),
        num_failed: row.get::<i64, _>("num_failed") as u32,
        speed: row.get::<i64, _>("speed") as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> DownloadInfo {
        let mut info = DownloadInfo::new(
            "http://example.com/a.iso".to_string(),
            PathBuf::from("/tmp"),
            "a.iso".to_string(),
        );
        info.total_bytes = Some(4001);
        info.num_pieces = 4;
        info.partial_support = true;
        info
    }

    #[tokio::test]
    async fn test_add_and_load_info() {
        let db = DownloadDatabase::in_memory().await.unwrap();
        let info = sample_info();
        let headers = vec![DownloadHeader::new(info.id, "ETag", "\"abc\"")];
        db.add_info(&info, &headers).await.unwrap();

        let loaded = db.get_info(info.id).await.unwrap().unwrap();
        assert_eq!(loaded.url, info.url);
        assert_eq!(loaded.total_bytes, Some(4001));
        assert_eq!(loaded.status_code, StatusCode::Pending);

        let pieces = db.get_pieces(info.id).await.unwrap();
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[3].cur_bytes, 3000);
        assert_eq!(pieces[3].size, Some(1001));

        assert_eq!(db.get_headers(info.id).await.unwrap(), headers);
    }

    #[tokio::test]
    async fn test_update_piece_reports_deleted_download() {
        let db = DownloadDatabase::in_memory().await.unwrap();
        let info = sample_info();
        db.add_info(&info, &[]).await.unwrap();

        let mut piece = db.get_piece(info.id, 1).await.unwrap().unwrap();
        piece.cur_bytes += 10;
        assert_eq!(db.update_piece(&piece).await.unwrap(), 1);

        db.delete_info(info.id).await.unwrap();
        assert_eq!(db.update_piece(&piece).await.unwrap(), 0);
        assert!(db.get_info(info.id).await.unwrap().is_none());
        assert!(db.get_headers(info.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_pieces_rebuilds_set() {
        let db = DownloadDatabase::in_memory().await.unwrap();
        let mut info = sample_info();
        db.add_info(&info, &[]).await.unwrap();

        info.num_pieces = 2;
        db.replace_pieces(info.id, &info.make_pieces()).await.unwrap();
        let pieces = db.get_pieces(info.id).await.unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].size, Some(2001));
    }

    #[tokio::test]
    async fn test_set_header_replaces_by_name() {
        let db = DownloadDatabase::in_memory().await.unwrap();
        let info = sample_info();
        db.add_info(&info, &[]).await.unwrap();

        db.set_header(&DownloadHeader::new(info.id, "ETag", "\"1\"")).await.unwrap();
        db.set_header(&DownloadHeader::new(info.id, "ETag", "\"2\"")).await.unwrap();
        let headers = db.get_headers(info.id).await.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].value, "\"2\"");

        db.remove_header(info.id, "ETag").await.unwrap();
        assert!(db.get_headers(info.id).await.unwrap().is_empty());
    }
}
