use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::api::RemoteApi;
use crate::config::ContentMode;

const LATEST_WITHOUT_TEXT: &str = "SELECT rev_id FROM revision
    JOIN page ON page_latest = rev_id
    WHERE rev_text_id IS NULL ORDER BY rev_id";
const ALL_WITHOUT_TEXT: &str = "SELECT rev_id FROM revision WHERE rev_text_id IS NULL ORDER BY rev_id";

#[derive(Debug, Clone, Serialize)]
pub struct ContentReport {
    pub mode: ContentMode,
    pub requested: usize,
    pub stored: usize,
    pub missing: usize,
}

/// Fills in text rows for mirrored revisions that have none yet.
///
/// Each chunk commits on its own so an interrupted run keeps what it fetched.
pub fn sync_revision_content(
    connection: &mut Connection,
    api: &mut dyn RemoteApi,
    mode: ContentMode,
    batch_size: usize,
) -> Result<ContentReport> {
    if batch_size == 0 {
        bail!("content batch size must be positive");
    }
    let sql = match mode {
        ContentMode::Latest => LATEST_WITHOUT_TEXT,
        ContentMode::All => ALL_WITHOUT_TEXT,
    };
    let pending = {
        let mut statement = connection
            .prepare(sql)
            .context("failed to prepare pending content query")?;
        statement
            .query_map([], |row| row.get::<_, i64>(0))
            .context("failed to query revisions without content")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode pending revision ids")?
    };

    let mut report = ContentReport {
        mode,
        requested: pending.len(),
        stored: 0,
        missing: 0,
    };
    for chunk in pending.chunks(batch_size) {
        let contents = api.revision_contents(chunk)?;
        let tx = connection
            .transaction()
            .context("failed to start content transaction")?;
        let mut next_id: i64 = tx
            .query_row("SELECT COALESCE(MAX(old_id), 0) + 1 FROM text", [], |row| row.get(0))
            .context("failed to read text id high-water mark")?;
        for content in &contents {
            tx.execute(
                "INSERT INTO text (old_id, old_text) VALUES (?1, ?2)",
                params![next_id, content.content],
            )
            .with_context(|| format!("failed to store content of revision {}", content.revid))?;
            tx.execute(
                "UPDATE revision SET rev_text_id = ?1 WHERE rev_id = ?2",
                params![next_id, content.revid],
            )
            .with_context(|| format!("failed to link content of revision {}", content.revid))?;
            next_id += 1;
        }
        tx.commit().context("failed to commit content chunk")?;

        report.stored += contents.len();
        let missing = chunk.len().saturating_sub(contents.len());
        if missing > 0 {
            tracing::warn!(missing, "remote returned no content for some revisions");
            report.missing += missing;
        }
    }
    tracing::info!(
        requested = report.requested,
        stored = report.stored,
        "revision content synchronized"
    );
    Ok(report)
}
