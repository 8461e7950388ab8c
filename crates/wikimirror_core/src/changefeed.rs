use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use crate::api::{FeedBounds, RemoteApi, RemoteLogEvent};
use crate::timestamp::{format_timestamp, normalize_timestamp, parse_timestamp};
use crate::title::TitleResolver;

/// Result of a feed read that may not reach back far enough.
#[derive(Debug, Clone, PartialEq)]
pub enum Coverage<T> {
    Covered(T),
    WindowTooShort { oldest: Option<DateTime<Utc>> },
}

impl<T> Coverage<T> {
    pub fn is_covered(&self) -> bool {
        matches!(self, Self::Covered(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSource {
    RecentChanges,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Edit,
    Create,
    Delete,
    Restore,
    Move,
    Protect,
    Unprotect,
    Merge,
    Import,
    Suppress,
    Visibility,
    TagUpdate,
    Block,
    Unblock,
    UserMerge,
    UserRename,
    UserRights,
    UserCreate,
    Interwiki,
    Patrol,
    Other,
}

impl ChangeKind {
    /// Classifies a feed row by its change type and log type/action.
    pub fn classify(rc_type: Option<&str>, log_type: Option<&str>, log_action: Option<&str>) -> Self {
        match rc_type {
            Some("edit") | Some("categorize") | Some("external") => return Self::Edit,
            Some("new") => return Self::Create,
            _ => {}
        }
        let action = log_action.unwrap_or_default();
        match log_type.unwrap_or_default() {
            "delete" => match action {
                "delete" | "delete_redir" => Self::Delete,
                "restore" => Self::Restore,
                "revision" | "event" => Self::Visibility,
                _ => Self::Other,
            },
            "suppress" => match action {
                "delete" => Self::Suppress,
                "revision" | "event" => Self::Visibility,
                "block" | "reblock" => Self::Block,
                _ => Self::Other,
            },
            "move" => Self::Move,
            "protect" => match action {
                "unprotect" => Self::Unprotect,
                _ => Self::Protect,
            },
            "merge" => Self::Merge,
            "import" => Self::Import,
            "tag" if action == "update" => Self::TagUpdate,
            "block" => match action {
                "unblock" => Self::Unblock,
                _ => Self::Block,
            },
            "usermerge" => Self::UserMerge,
            "renameuser" => Self::UserRename,
            "rights" => Self::UserRights,
            "newusers" => Self::UserCreate,
            "interwiki" => Self::Interwiki,
            "patrol" => Self::Patrol,
            _ => Self::Other,
        }
    }
}

/// One typed entry from either change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub source: FeedSource,
    pub kind: ChangeKind,
    pub timestamp: String,
    pub namespace: i64,
    pub title: String,
    /// For log rows this is the log's page id, which may point at a deleted page.
    pub page_id: Option<i64>,
    pub rev_id: Option<i64>,
    pub log_id: Option<i64>,
    pub log_type: Option<String>,
    pub log_action: Option<String>,
    pub user_text: String,
    pub params: Value,
}

impl ChangeEvent {
    /// Wraps a log entry fetched straight from the remote wiki.
    pub fn from_remote_log(event: &RemoteLogEvent, titles: &TitleResolver) -> Result<Self> {
        let namespace = event.ns.unwrap_or_default();
        let title = event
            .title
            .as_deref()
            .map(|title| titles.db_title(title, namespace))
            .unwrap_or_default();
        Ok(Self {
            source: FeedSource::Log,
            kind: ChangeKind::classify(None, Some(&event.log_type), Some(&event.action)),
            timestamp: normalize_timestamp(&event.timestamp)?,
            namespace,
            title,
            page_id: event.logpage.or(event.pageid),
            rev_id: None,
            log_id: Some(event.logid),
            log_type: Some(event.log_type.clone()),
            log_action: Some(event.action.clone()),
            user_text: event.user.clone().unwrap_or_default(),
            params: event.params.clone(),
        })
    }

    pub fn is_log(&self, log_type: &str) -> bool {
        self.log_type.as_deref() == Some(log_type)
    }

    pub fn is_action(&self, log_type: &str, log_action: &str) -> bool {
        self.is_log(log_type) && self.log_action.as_deref() == Some(log_action)
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        match self.params.get(key)? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_ids(&self) -> Vec<i64> {
        self.params
            .get("ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| match id {
                        Value::Number(number) => number.as_i64(),
                        Value::String(text) => text.trim().parse().ok(),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn param_strings(&self, key: &str) -> Vec<String> {
        self.params
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// New visibility bitmask carried by `delete/revision` and `delete/event` entries.
    pub fn new_bitmask(&self) -> Option<i64> {
        self.params.get("new")?.get("bitmask")?.as_i64()
    }
}

/// Reads typed change events from the mirrored recent-changes and logging tables.
pub struct ChangeFeed<'conn> {
    connection: &'conn Connection,
}

const RC_EVENT_SQL: &str = "SELECT rc_type, rc_timestamp, rc_namespace, rc_title, rc_cur_id,
        rc_this_oldid, rc_logid, rc_log_type, rc_log_action, rc_user_text, rc_params
    FROM recentchanges
    WHERE (?1 IS NULL OR rc_timestamp > ?1)
    ORDER BY rc_timestamp, rc_id";

const LOG_EVENT_SQL: &str = "SELECT log_type, log_action, log_timestamp, log_namespace, log_title,
        log_page, log_id, log_user_text, log_params
    FROM logging
    WHERE (?1 IS NULL OR log_timestamp > ?1)
    ORDER BY log_timestamp, log_id";

impl<'conn> ChangeFeed<'conn> {
    pub fn new(connection: &'conn Connection) -> Self {
        Self { connection }
    }

    pub fn oldest_recent_change(&self) -> Result<Option<DateTime<Utc>>> {
        self.edge_timestamp("SELECT MIN(rc_timestamp) FROM recentchanges")
    }

    pub fn newest_recent_change(&self) -> Result<Option<DateTime<Utc>>> {
        self.edge_timestamp("SELECT MAX(rc_timestamp) FROM recentchanges")
    }

    /// Checks that the mirrored short feed still reaches back to `since`.
    /// An empty feed never covers anything.
    pub fn check_window(&self, since: DateTime<Utc>) -> Result<Coverage<()>> {
        let oldest = self.oldest_recent_change()?;
        Ok(match oldest {
            Some(oldest) if oldest <= since => Coverage::Covered(()),
            _ => Coverage::WindowTooShort { oldest },
        })
    }

    /// Recent-change events strictly after `since`, restricted to `rc_types`
    /// when it is non-empty. The window is checked before any rows are read.
    pub fn recent_changes_since(
        &self,
        since: DateTime<Utc>,
        rc_types: &[&str],
    ) -> Result<Coverage<Vec<ChangeEvent>>> {
        if let Coverage::WindowTooShort { oldest } = self.check_window(since)? {
            return Ok(Coverage::WindowTooShort { oldest });
        }
        let events = self
            .read_recent_changes(Some(since))?
            .into_iter()
            .filter(|(rc_type, _)| rc_types.is_empty() || rc_types.contains(&rc_type.as_str()))
            .map(|(_, event)| event)
            .collect();
        Ok(Coverage::Covered(events))
    }

    /// Log events strictly after `since`, or every log event when `since` is `None`.
    pub fn log_events_since(
        &self,
        since: Option<DateTime<Utc>>,
        log_types: &[&str],
    ) -> Result<Vec<ChangeEvent>> {
        let since = since.map(format_timestamp);
        let mut statement = self
            .connection
            .prepare_cached(LOG_EVENT_SQL)
            .context("failed to prepare log event scan")?;
        let rows = statement
            .query_map(params![since], log_event_from_row)
            .context("failed to scan log events")?;
        let mut out = Vec::new();
        for row in rows {
            let event = row.context("failed to decode log event row")?;
            if log_types.is_empty()
                || event
                    .log_type
                    .as_deref()
                    .is_some_and(|log_type| log_types.contains(&log_type))
            {
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Chronological merge of both streams with log events standing in for
    /// the short feed's log rows. `None` scans everything.
    pub fn events_since(&self, since: Option<DateTime<Utc>>) -> Result<Coverage<Vec<ChangeEvent>>> {
        if let Some(since) = since
            && let Coverage::WindowTooShort { oldest } = self.check_window(since)?
        {
            return Ok(Coverage::WindowTooShort { oldest });
        }
        let mut events = self
            .read_recent_changes(since)?
            .into_iter()
            .filter(|(rc_type, _)| rc_type != "log")
            .map(|(_, event)| event)
            .collect::<Vec<_>>();
        events.extend(self.log_events_since(since, &[])?);
        events.sort_by(|left, right| left.timestamp.cmp(&right.timestamp));
        Ok(Coverage::Covered(events))
    }

    fn read_recent_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<(String, ChangeEvent)>> {
        let since = since.map(format_timestamp);
        let mut statement = self
            .connection
            .prepare_cached(RC_EVENT_SQL)
            .context("failed to prepare recent change scan")?;
        let rows = statement
            .query_map(params![since], |row| {
                let rc_type: String = row.get(0)?;
                let log_type: Option<String> = row.get(7)?;
                let log_action: Option<String> = row.get(8)?;
                let params: Option<String> = row.get(10)?;
                let event = ChangeEvent {
                    source: FeedSource::RecentChanges,
                    kind: ChangeKind::classify(
                        Some(&rc_type),
                        log_type.as_deref(),
                        log_action.as_deref(),
                    ),
                    timestamp: row.get(1)?,
                    namespace: row.get(2)?,
                    title: row.get(3)?,
                    page_id: row.get(4)?,
                    rev_id: row.get(5)?,
                    log_id: row.get(6)?,
                    log_type,
                    log_action,
                    user_text: row.get(9)?,
                    params: decode_params(params.as_deref()),
                };
                Ok((rc_type, event))
            })
            .context("failed to scan recent changes")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode recent change row")
    }

    fn edge_timestamp(&self, sql: &str) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .connection
            .query_row(sql, [], |row| row.get(0))
            .optional()
            .context("failed to read recent change bounds")?
            .flatten();
        value.as_deref().map(parse_timestamp).transpose()
    }
}

fn log_event_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeEvent> {
    let log_type: String = row.get(0)?;
    let log_action: String = row.get(1)?;
    let params: String = row.get(8)?;
    Ok(ChangeEvent {
        source: FeedSource::Log,
        kind: ChangeKind::classify(None, Some(&log_type), Some(&log_action)),
        timestamp: row.get(2)?,
        namespace: row.get(3)?,
        title: row.get(4)?,
        page_id: row.get(5)?,
        rev_id: None,
        log_id: row.get(6)?,
        log_type: Some(log_type),
        log_action: Some(log_action),
        user_text: row.get(7)?,
        params: decode_params(Some(&params)),
    })
}

fn decode_params(raw: Option<&str>) -> Value {
    match raw {
        None | Some("") => Value::Null,
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|error| {
            tracing::warn!("ignoring malformed change params: {error}");
            Value::Null
        }),
    }
}

/// Checks the remote short feed against `since` before an incremental pass.
pub fn remote_window(
    api: &mut dyn RemoteApi,
    since: DateTime<Utc>,
) -> Result<Coverage<Option<FeedBounds>>> {
    let bounds = api.recent_changes_bounds()?;
    Ok(match bounds {
        Some(bounds) if bounds.oldest <= since => Coverage::Covered(Some(bounds)),
        Some(bounds) => Coverage::WindowTooShort {
            oldest: Some(bounds.oldest),
        },
        None => Coverage::WindowTooShort { oldest: None },
    })
}
