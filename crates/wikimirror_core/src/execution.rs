use anyhow::{Context, Result, bail};
use rusqlite::types::{ToSql, ToSqlOutput, Value};
use rusqlite::{Connection, params_from_iter};

/// One bound parameter list for a queued statement.
pub type Row = Vec<Value>;

/// Converts any bindable value into an owned [`Value`] for queueing.
pub fn to_value<T: ToSql + ?Sized>(value: &T) -> rusqlite::Result<Value> {
    Ok(match value.to_sql()? {
        ToSqlOutput::Borrowed(borrowed) => Value::from(borrowed),
        ToSqlOutput::Owned(owned) => owned,
        _ => Value::Null,
    })
}

/// Builds a [`Row`] from heterogeneous bindable expressions, propagating conversion errors.
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::execution::to_value(&$value)?),*]
    };
}

/// Buffers same-shaped writes and executes them in batches.
///
/// Statements are keyed by their SQL text. When any key's buffer reaches
/// `chunk_size`, every buffer is flushed in the order its statement was first
/// seen, so rows queued under a later statement never run before the rows
/// they reference. Dropping the queue flushes whatever is still pending.
pub struct DeferredQueue<'conn> {
    connection: &'conn Connection,
    chunk_size: usize,
    buffers: Vec<(String, Vec<Row>)>,
    executed: usize,
    finished: bool,
}

impl<'conn> DeferredQueue<'conn> {
    pub fn new(connection: &'conn Connection, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("execution queue chunk size must be positive");
        }
        Ok(Self {
            connection,
            chunk_size,
            buffers: Vec::new(),
            executed: 0,
            finished: false,
        })
    }

    pub fn connection(&self) -> &'conn Connection {
        self.connection
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Rows executed so far, not counting rows still buffered.
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn pending(&self) -> usize {
        self.buffers.iter().map(|(_, rows)| rows.len()).sum()
    }

    pub fn execute(&mut self, statement: &str, row: Row) -> Result<()> {
        let index = match self.buffers.iter().position(|(sql, _)| sql == statement) {
            Some(index) => index,
            None => {
                self.buffers.push((statement.to_string(), Vec::new()));
                self.buffers.len() - 1
            }
        };
        let rows = &mut self.buffers[index].1;
        rows.push(row);
        if rows.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Executes every buffered row, statements in first-seen order.
    pub fn flush(&mut self) -> Result<()> {
        let pending = self.pending();
        if pending == 0 {
            return Ok(());
        }
        for (sql, rows) in &mut self.buffers {
            if rows.is_empty() {
                continue;
            }
            let mut statement = self
                .connection
                .prepare_cached(sql)
                .with_context(|| format!("failed to prepare queued statement: {sql}"))?;
            for row in rows.drain(..) {
                statement
                    .execute(params_from_iter(row.iter()))
                    .with_context(|| format!("failed to execute queued statement: {sql}"))?;
                self.executed += 1;
            }
        }
        tracing::debug!(rows = pending, "flushed execution queue");
        Ok(())
    }

    /// Drops every buffered row without executing it.
    pub fn discard(mut self) -> usize {
        let dropped = self.pending();
        self.buffers.clear();
        self.finished = true;
        dropped
    }

    /// Flushes the remaining buffers and returns the total executed row count.
    pub fn finish(mut self) -> Result<usize> {
        self.flush()?;
        self.finished = true;
        Ok(self.executed)
    }
}

impl Drop for DeferredQueue<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(error) = self.flush() {
            tracing::error!("failed to flush execution queue on drop: {error:#}");
        }
    }
}
