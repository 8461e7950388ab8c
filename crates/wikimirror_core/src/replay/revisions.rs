//! Revision fields shared by `list=allrevisions`, `list=alldeletedrevisions`
//! and the revision page-set props.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use super::mapping::{FieldRule, PropField, anon_flag, joined_list, map_record, visibility};
use super::{ModuleParams, QueryError, Record, Select};
use crate::flags::VisibilityTarget;

/// Column names of one of the two revision tables.
#[derive(Debug, Clone, Copy)]
pub struct RevisionTable {
    pub table: &'static str,
    id: &'static str,
    parent: &'static str,
    timestamp: &'static str,
    user: &'static str,
    user_text: &'static str,
    comment: &'static str,
    minor: &'static str,
    deleted: &'static str,
    len: &'static str,
    sha1: &'static str,
    model: &'static str,
    format: &'static str,
    text_id: &'static str,
    tag_table: &'static str,
    tag_item: &'static str,
    tag_id: &'static str,
}

pub const LIVE: RevisionTable = RevisionTable {
    table: "revision",
    id: "rev_id",
    parent: "rev_parent_id",
    timestamp: "rev_timestamp",
    user: "rev_user",
    user_text: "rev_user_text",
    comment: "rev_comment",
    minor: "rev_minor_edit",
    deleted: "rev_deleted",
    len: "rev_len",
    sha1: "rev_sha1",
    model: "rev_content_model",
    format: "rev_content_format",
    text_id: "rev_text_id",
    tag_table: "tagged_revision",
    tag_item: "tgrev_rev_id",
    tag_id: "tgrev_tag_id",
};

pub const ARCHIVED: RevisionTable = RevisionTable {
    table: "archive",
    id: "ar_rev_id",
    parent: "ar_parent_id",
    timestamp: "ar_timestamp",
    user: "ar_user",
    user_text: "ar_user_text",
    comment: "ar_comment",
    minor: "ar_minor_edit",
    deleted: "ar_deleted",
    len: "ar_len",
    sha1: "ar_sha1",
    model: "ar_content_model",
    format: "ar_content_format",
    text_id: "ar_text_id",
    tag_table: "tagged_archived_revision",
    tag_item: "tgar_rev_id",
    tag_id: "tgar_tag_id",
};

impl RevisionTable {
    pub fn id(&self) -> &'static str {
        self.id
    }
}

pub const PROPS: &[&str] = &[
    "user",
    "userid",
    "comment",
    "flags",
    "timestamp",
    "ids",
    "size",
    "sha1",
    "tags",
    "content",
    "contentmodel",
];

const FIELDS: &[PropField] = &[
    ("ids", FieldRule::Plain("r_id", "revid")),
    ("ids", FieldRule::ZeroIfNull("r_parent", "parentid")),
    ("flags", FieldRule::Flag("r_minor", "minor")),
    ("user", FieldRule::Plain("r_user_text", "user")),
    ("userid", FieldRule::ZeroIfNull("r_user", "userid")),
    ("timestamp", FieldRule::Plain("r_timestamp", "timestamp")),
    ("size", FieldRule::Plain("r_len", "size")),
    ("sha1", FieldRule::Plain("r_sha1", "sha1")),
    ("comment", FieldRule::Plain("r_comment", "comment")),
];

const SLOT_FIELDS: &[PropField] = &[
    ("contentmodel", FieldRule::Plain("r_model", "contentmodel")),
    ("contentmodel", FieldRule::Plain("r_format", "contentformat")),
    ("content", FieldRule::Plain("r_text", "content")),
];

#[derive(Debug, Clone)]
pub struct RevisionOptions {
    pub props: BTreeSet<String>,
    range: super::TimeRange,
    user: Option<String>,
    exclude_user: Option<String>,
}

/// Applies revision defaults and validates the options every revision module shares.
pub fn options(module: &mut ModuleParams) -> Result<RevisionOptions, QueryError> {
    module.set_default("dir", "older");
    module.set_default("prop", "timestamp|ids|flags|comment|user");
    let range = module.time_range()?;
    module.exclusive("user", "excludeuser")?;
    let props = module.subset("prop", PROPS)?;
    if (props.contains("content") || props.contains("contentmodel"))
        && module.get("slots") != Some("main")
    {
        return Err(QueryError::Validation(
            "content props require slots=main".to_string(),
        ));
    }
    Ok(RevisionOptions {
        props,
        range,
        user: module.get("user").map(str::to_string),
        exclude_user: module.get("excludeuser").map(str::to_string),
    })
}

/// Adds the aliased revision columns, filters and ordering to `select`.
pub fn add_to_select(select: &mut Select, table: &RevisionTable, options: &RevisionOptions) {
    for (column, alias) in [
        (table.id, "r_id"),
        (table.parent, "r_parent"),
        (table.timestamp, "r_timestamp"),
        (table.user, "r_user"),
        (table.user_text, "r_user_text"),
        (table.comment, "r_comment"),
        (table.minor, "r_minor"),
        (table.deleted, "r_deleted"),
        (table.len, "r_len"),
        (table.sha1, "r_sha1"),
        (table.model, "r_model"),
        (table.format, "r_format"),
    ] {
        select.column(&format!("{column} AS {alias}"));
    }
    if options.props.contains("content") {
        select.join(&format!("LEFT JOIN text ON old_id = {}", table.text_id));
        select.column("old_text AS r_text");
    }
    if options.props.contains("tags") {
        select.column(&format!(
            "(SELECT group_concat(tag_name, char(31)) FROM {} JOIN tag ON tag_id = {} WHERE {} = {}) AS r_tags",
            table.tag_table, table.tag_id, table.tag_item, table.id
        ));
    }

    if let Some(newest) = &options.range.newest {
        let placeholder = select.bind(newest.clone());
        select.filter(format!("{} <= {placeholder}", table.timestamp));
    }
    if let Some(oldest) = &options.range.oldest {
        let placeholder = select.bind(oldest.clone());
        select.filter(format!("{} >= {placeholder}", table.timestamp));
    }
    if let Some(user) = &options.user {
        let placeholder = select.bind(user.clone());
        select.filter(format!("{} = {placeholder}", table.user_text));
    }
    if let Some(user) = &options.exclude_user {
        let placeholder = select.bind(user.clone());
        select.filter(format!("{} != {placeholder}", table.user_text));
    }
    let order = options.range.order();
    select.order_by(format!("{} {order}", table.timestamp));
    select.order_by(format!("{} {order}", table.id));
}

/// One revision in the remote shape, without page identity fields.
pub fn entry(record: &Record, options: &RevisionOptions) -> Map<String, Value> {
    let mut entry = map_record(record, FIELDS, &options.props);
    if options.props.contains("userid") {
        anon_flag(&mut entry);
    }
    visibility(&mut entry, record, "r_deleted", VisibilityTarget::Content);
    if options.props.contains("tags") {
        entry.insert("tags".to_string(), joined_list(record, "r_tags"));
    }
    let slot = map_record(record, SLOT_FIELDS, &options.props);
    if !slot.is_empty() {
        let mut slots = Map::new();
        slots.insert("main".to_string(), Value::Object(slot));
        entry.insert("slots".to_string(), Value::Object(slots));
    }
    entry
}
