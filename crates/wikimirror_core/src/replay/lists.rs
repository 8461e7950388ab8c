//! `list=` modules.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::mapping::{FieldRule, PropField, anon_flag, joined_list, map_record, visibility};
use super::revisions::{self, ARCHIVED, LIVE};
use super::{ModuleParams, QueryError, QueryParams, QueryReplay, Record, Select};
use crate::flags::VisibilityTarget;
use crate::timestamp::{INFINITY, format_timestamp};
use crate::title::{canonical_spacing, upper_first};

pub type Entry = Map<String, Value>;

/// List modules that can also feed a page set.
pub const GENERATORS: &[&str] = &[
    "recentchanges",
    "allpages",
    "protectedtitles",
    "allrevisions",
    "alldeletedrevisions",
];

pub fn run(
    replay: &QueryReplay<'_>,
    name: &str,
    params: &QueryParams,
    generator: bool,
) -> Result<Vec<Entry>, QueryError> {
    if generator && !GENERATORS.contains(&name) {
        return Err(QueryError::Unsupported(format!(
            "generator={name} is not supported"
        )));
    }
    match name {
        "recentchanges" => recent_changes(replay, params.module("rc", generator), generator),
        "logevents" => log_events(replay, params.module("le", generator)),
        "allpages" => all_pages(replay, params.module("ap", generator)),
        "protectedtitles" => protected_titles(replay, params.module("pt", generator)),
        "allrevisions" => all_revisions(replay, params.module("arv", generator)),
        "alldeletedrevisions" => all_deleted_revisions(replay, params.module("adr", generator)),
        "allusers" => all_users(replay, params.module("au", generator)),
        other => Err(QueryError::Unsupported(format!("list={other} is not supported"))),
    }
}

fn insert_title(entry: &mut Entry, replay: &QueryReplay<'_>, record: &Record, ns_column: &str, title_column: &str) {
    let namespace = record.get(ns_column).and_then(Value::as_i64).unwrap_or_default();
    let title = record.get(title_column).and_then(Value::as_str).unwrap_or_default();
    entry.insert("ns".to_string(), Value::from(namespace));
    entry.insert(
        "title".to_string(),
        Value::from(replay.titles().full_title(namespace, title)),
    );
}

fn time_bounds(select: &mut Select, column: &str, range: &super::TimeRange) {
    if let Some(newest) = &range.newest {
        let placeholder = select.bind(newest.clone());
        select.filter(format!("{column} <= {placeholder}"));
    }
    if let Some(oldest) = &range.oldest {
        let placeholder = select.bind(oldest.clone());
        select.filter(format!("{column} >= {placeholder}"));
    }
}

fn name_bounds(select: &mut Select, column: &str, from: Option<String>, to: Option<String>) {
    if let Some(from) = from {
        let placeholder = select.bind(from);
        select.filter(format!("{column} >= {placeholder}"));
    }
    if let Some(to) = to {
        let placeholder = select.bind(to);
        select.filter(format!("{column} <= {placeholder}"));
    }
}

fn in_list<T: serde::Serialize>(select: &mut Select, column: &str, values: &[T]) {
    if !values.is_empty() {
        let list = select.bind_list(values);
        select.filter(format!("{column} IN {list}"));
    }
}

/// A title inside a known namespace, normalized the way the mirror stores it.
fn stored_title(replay: &QueryReplay<'_>, namespace: i64, raw: &str) -> String {
    let titles = replay.titles();
    titles.split(&titles.full_title(namespace, &canonical_spacing(raw))).1
}

fn tag_filter(select: &mut Select, column: &str, tag_table: &str, item: &str, tag_id: &str, tag: &str) {
    let placeholder = select.bind(tag.to_string());
    select.filter(format!(
        "{column} IN (SELECT {item} FROM {tag_table} JOIN tag ON tag_id = {tag_id} WHERE tag_name = {placeholder})"
    ));
}

const RC_ALLOWED: &[&str] = &[
    "start", "end", "dir", "namespace", "user", "excludeuser", "tag", "prop", "show", "type",
    "toponly", "limit", "continue",
];
const RC_PROPS: &[&str] = &[
    "user", "userid", "comment", "flags", "timestamp", "title", "ids", "sizes", "patrolled",
    "loginfo", "sha1", "redirect", "tags",
];
const RC_FIELDS: &[PropField] = &[
    ("", FieldRule::Plain("rc_type", "type")),
    ("user", FieldRule::Plain("rc_user_text", "user")),
    ("userid", FieldRule::ZeroIfNull("rc_user", "userid")),
    ("comment", FieldRule::Plain("rc_comment", "comment")),
    ("flags", FieldRule::Flag("rc_minor", "minor")),
    ("flags", FieldRule::Flag("rc_bot", "bot")),
    ("flags", FieldRule::Flag("rc_new", "new")),
    ("timestamp", FieldRule::Plain("rc_timestamp", "timestamp")),
    ("ids", FieldRule::Plain("rc_id", "rcid")),
    ("ids", FieldRule::ZeroIfNull("rc_cur_id", "pageid")),
    ("ids", FieldRule::ZeroIfNull("rc_this_oldid", "revid")),
    ("ids", FieldRule::ZeroIfNull("rc_last_oldid", "old_revid")),
    ("sizes", FieldRule::Plain("rc_old_len", "oldlen")),
    ("sizes", FieldRule::Plain("rc_new_len", "newlen")),
    ("patrolled", FieldRule::Flag("rc_patrolled", "patrolled")),
    ("loginfo", FieldRule::Plain("rc_logid", "logid")),
    ("loginfo", FieldRule::Plain("rc_log_type", "logtype")),
    ("loginfo", FieldRule::Plain("rc_log_action", "logaction")),
    ("loginfo", FieldRule::Json("rc_params", "logparams")),
    ("sha1", FieldRule::Plain("rev_sha1", "sha1")),
    ("redirect", FieldRule::Flag("page_is_redirect", "redirect")),
];

fn recent_changes(
    replay: &QueryReplay<'_>,
    mut module: ModuleParams,
    generator: bool,
) -> Result<Vec<Entry>, QueryError> {
    module.allow(RC_ALLOWED)?;
    module.set_default("dir", "older");
    module.set_default("prop", "title|timestamp|ids");
    module.set_default("type", "edit|new|log");
    let range = module.time_range()?;
    module.exclusive("user", "excludeuser")?;
    let mut props = module.subset("prop", RC_PROPS)?;
    if generator {
        props.extend(["title".to_string(), "ids".to_string()]);
    }
    let show = module.show_flags(&["minor", "bot", "anon", "patrolled", "redirect"])?;
    let types = module.subset("type", &["edit", "new", "log", "external"])?;
    let namespaces = module.ints("namespace")?;
    module.unsupported(&["continue"])?;

    let mut select = Select::new("recentchanges");
    select.column("recentchanges.*");
    if props.contains("sha1") {
        select.join("LEFT JOIN revision ON rev_id = rc_this_oldid");
        select.column("rev_sha1");
    }
    let toponly = module.has("toponly");
    if toponly || props.contains("redirect") || show.contains_key("redirect") {
        select.join("LEFT JOIN page ON page_namespace = rc_namespace AND page_title = rc_title");
        select.columns(&["page_is_redirect", "page_latest"]);
    }
    if props.contains("tags") {
        select.column(
            "(SELECT group_concat(tag_name, char(31)) FROM tagged_recentchange
              JOIN tag ON tag_id = tgrc_tag_id WHERE tgrc_rc_id = rc_id) AS rc_tags",
        );
    }

    time_bounds(&mut select, "rc_timestamp", &range);
    in_list(&mut select, "rc_namespace", &namespaces);
    if let Some(user) = module.get("user") {
        let placeholder = select.bind(upper_first(&canonical_spacing(user)));
        select.filter(format!("rc_user_text = {placeholder}"));
    }
    if let Some(user) = module.get("excludeuser") {
        let placeholder = select.bind(upper_first(&canonical_spacing(user)));
        select.filter(format!("rc_user_text != {placeholder}"));
    }
    if let Some(tag) = module.get("tag") {
        tag_filter(&mut select, "rc_id", "tagged_recentchange", "tgrc_rc_id", "tgrc_tag_id", tag);
    }
    let types = types.into_iter().collect::<Vec<_>>();
    in_list(&mut select, "rc_type", &types);
    if toponly {
        select.filter("rc_this_oldid = page_latest".to_string());
    }
    for (flag, wanted) in &show {
        let condition = match (flag.as_str(), *wanted) {
            ("minor", true) => "rc_minor != 0",
            ("minor", false) => "rc_minor = 0",
            ("bot", true) => "rc_bot != 0",
            ("bot", false) => "rc_bot = 0",
            ("patrolled", true) => "rc_patrolled != 0",
            ("patrolled", false) => "rc_patrolled = 0",
            ("anon", true) => "COALESCE(rc_user, 0) = 0",
            ("anon", false) => "rc_user > 0",
            ("redirect", true) => "page_is_redirect = 1",
            _ => "COALESCE(page_is_redirect, 0) = 0",
        };
        select.filter(condition.to_string());
    }
    let order = range.order();
    select.order_by(format!("rc_timestamp {order}"));
    select.order_by(format!("rc_id {order}"));

    let records = select.fetch(replay.connection())?;
    Ok(records
        .iter()
        .map(|record| {
            let mut entry = map_record(record, RC_FIELDS, &props);
            if props.contains("title") {
                insert_title(&mut entry, replay, record, "rc_namespace", "rc_title");
            }
            if props.contains("userid") {
                anon_flag(&mut entry);
            }
            let target = if record.get("rc_type").and_then(Value::as_str) == Some("log") {
                VisibilityTarget::LogAction
            } else {
                VisibilityTarget::Content
            };
            visibility(&mut entry, record, "rc_deleted", target);
            if props.contains("tags") {
                entry.insert("tags".to_string(), joined_list(record, "rc_tags"));
            }
            entry
        })
        .collect())
}

const LE_ALLOWED: &[&str] = &[
    "start", "end", "dir", "user", "title", "namespace", "prefix", "tag", "prop", "type",
    "action", "limit", "continue",
];
const LE_PROPS: &[&str] = &[
    "ids", "title", "type", "user", "userid", "timestamp", "comment", "details", "tags",
];
const LE_FIELDS: &[PropField] = &[
    ("ids", FieldRule::Plain("log_id", "logid")),
    ("ids", FieldRule::ZeroIfNull("log_page", "logpage")),
    ("title", FieldRule::ZeroIfNull("page_id", "pageid")),
    ("type", FieldRule::Plain("log_type", "type")),
    ("type", FieldRule::Plain("log_action", "action")),
    ("user", FieldRule::Plain("log_user_text", "user")),
    ("userid", FieldRule::ZeroIfNull("log_user", "userid")),
    ("timestamp", FieldRule::Plain("log_timestamp", "timestamp")),
    ("comment", FieldRule::Plain("log_comment", "comment")),
    ("details", FieldRule::Json("log_params", "params")),
];

fn log_events(replay: &QueryReplay<'_>, mut module: ModuleParams) -> Result<Vec<Entry>, QueryError> {
    module.allow(LE_ALLOWED)?;
    module.set_default("dir", "older");
    module.set_default("prop", "ids|title|type|user|timestamp|comment|details");
    let range = module.time_range()?;
    let props = module.subset("prop", LE_PROPS)?;
    if props.is_empty() {
        return Err(QueryError::Validation(
            "logevents needs at least one prop".to_string(),
        ));
    }
    let namespace = module.int("namespace")?;
    module.unsupported(&["prefix", "continue"])?;

    let mut select = Select::new("logging");
    select.column("logging.*");
    select.join("LEFT JOIN page ON page_namespace = log_namespace AND page_title = log_title");
    select.column("page_id");
    if props.contains("tags") {
        select.column(
            "(SELECT group_concat(tag_name, char(31)) FROM tagged_logevent
              JOIN tag ON tag_id = tgle_tag_id WHERE tgle_log_id = log_id) AS log_tags",
        );
    }

    time_bounds(&mut select, "log_timestamp", &range);
    if let Some(namespace) = namespace {
        let placeholder = select.bind(namespace);
        select.filter(format!("log_namespace = {placeholder}"));
    }
    if let Some(title) = module.get("title") {
        let (namespace, title) = replay.titles().split(title);
        let namespace = select.bind(namespace);
        let title = select.bind(title);
        select.filter(format!("log_namespace = {namespace} AND log_title = {title}"));
    }
    if let Some(user) = module.get("user") {
        let placeholder = select.bind(upper_first(&canonical_spacing(user)));
        select.filter(format!("log_user_text = {placeholder}"));
    }
    if let Some(kind) = module.get("type") {
        let placeholder = select.bind(kind.to_string());
        select.filter(format!("log_type = {placeholder}"));
    }
    if let Some(action) = module.get("action") {
        let (kind, action) = match action.split_once('/') {
            Some((kind, action)) => (Some(kind.to_string()), action.to_string()),
            None => (None, action.to_string()),
        };
        if let Some(kind) = kind {
            let placeholder = select.bind(kind);
            select.filter(format!("log_type = {placeholder}"));
        }
        let placeholder = select.bind(action);
        select.filter(format!("log_action = {placeholder}"));
    }
    if let Some(tag) = module.get("tag") {
        tag_filter(&mut select, "log_id", "tagged_logevent", "tgle_log_id", "tgle_tag_id", tag);
    }
    let order = range.order();
    select.order_by(format!("log_timestamp {order}"));
    select.order_by(format!("log_id {order}"));

    let records = select.fetch(replay.connection())?;
    Ok(records
        .iter()
        .map(|record| {
            let mut entry = map_record(record, LE_FIELDS, &props);
            if props.contains("title") {
                insert_title(&mut entry, replay, record, "log_namespace", "log_title");
            }
            if props.contains("userid") {
                anon_flag(&mut entry);
            }
            visibility(&mut entry, record, "log_deleted", VisibilityTarget::LogAction);
            if props.contains("tags") {
                entry.insert("tags".to_string(), joined_list(record, "log_tags"));
            }
            entry
        })
        .collect())
}

const AP_ALLOWED: &[&str] = &[
    "from", "to", "dir", "prefix", "namespace", "filterredir", "minsize", "maxsize", "prtype",
    "prlevel", "prexpiry", "prfiltercascade", "filterlanglinks", "limit", "continue",
];

fn all_pages(replay: &QueryReplay<'_>, mut module: ModuleParams) -> Result<Vec<Entry>, QueryError> {
    module.allow(AP_ALLOWED)?;
    module.set_default("dir", "ascending");
    module.set_default("namespace", "0");
    module.set_default("filterredir", "all");
    module.set_default("prexpiry", "all");
    module.set_default("prfiltercascade", "all");
    let range = module.name_range()?;
    let namespace = module.int("namespace")?.unwrap_or_default();
    let redirects = module.one_of("filterredir", &["all", "redirects", "nonredirects"])?;
    let min_size = module.int("minsize")?;
    let max_size = module.int("maxsize")?;
    let types = module.subset("prtype", &["edit", "move", "upload"])?;
    module.requires("prlevel", "prtype")?;
    let levels = module.subset("prlevel", &["autoconfirmed", "sysop"])?;
    let expiry = module.one_of("prexpiry", &["all", "indefinite", "definite"])?;
    let cascade = module.one_of("prfiltercascade", &["all", "cascading", "noncascading"])?;
    module.unsupported(&["filterlanglinks", "continue"])?;

    let mut select = Select::new("page");
    select.columns(&["page_id", "page_namespace", "page_title"]);
    if !types.is_empty() || expiry != "all" || cascade != "all" {
        select.distinct();
        select.join("JOIN page_restrictions ON pr_page = page_id");
        let now = select.bind(format_timestamp(replay.now()));
        select.filter(format!(
            "(pr_expiry IS NULL OR pr_expiry = '{INFINITY}' OR pr_expiry > {now})"
        ));
        let types = types.into_iter().collect::<Vec<_>>();
        in_list(&mut select, "pr_type", &types);
        let levels = levels.into_iter().collect::<Vec<_>>();
        in_list(&mut select, "pr_level", &levels);
        match expiry.as_str() {
            "indefinite" => select.filter(format!("(pr_expiry IS NULL OR pr_expiry = '{INFINITY}')")),
            "definite" => select.filter(format!("pr_expiry != '{INFINITY}'")),
            _ => {}
        }
        match cascade.as_str() {
            "cascading" => select.filter("pr_cascade = 1".to_string()),
            "noncascading" => select.filter("pr_cascade = 0".to_string()),
            _ => {}
        }
    }

    let placeholder = select.bind(namespace);
    select.filter(format!("page_namespace = {placeholder}"));
    name_bounds(
        &mut select,
        "page_title",
        range.from.as_deref().map(|from| stored_title(replay, namespace, from)),
        range.to.as_deref().map(|to| stored_title(replay, namespace, to)),
    );
    if let Some(prefix) = module.get("prefix") {
        let prefix = stored_title(replay, namespace, prefix);
        let length = prefix.chars().count() as i64;
        let placeholder = select.bind(prefix);
        select.filter(format!("substr(page_title, 1, {length}) = {placeholder}"));
    }
    match redirects.as_str() {
        "redirects" => select.filter("page_is_redirect = 1".to_string()),
        "nonredirects" => select.filter("page_is_redirect = 0".to_string()),
        _ => {}
    }
    if let Some(min_size) = min_size {
        let placeholder = select.bind(min_size);
        select.filter(format!("page_len >= {placeholder}"));
    }
    if let Some(max_size) = max_size {
        let placeholder = select.bind(max_size);
        select.filter(format!("page_len <= {placeholder}"));
    }
    select.order_by(format!("page_title {}", range.order()));

    let records = select.fetch(replay.connection())?;
    Ok(records
        .iter()
        .map(|record| {
            let mut entry = Entry::new();
            entry.insert(
                "pageid".to_string(),
                record.get("page_id").cloned().unwrap_or(Value::Null),
            );
            insert_title(&mut entry, replay, record, "page_namespace", "page_title");
            entry
        })
        .collect())
}

const PT_ALLOWED: &[&str] = &[
    "start", "end", "dir", "namespace", "level", "prop", "limit", "continue",
];
const PT_FIELDS: &[PropField] = &[
    ("timestamp", FieldRule::Plain("pt_timestamp", "timestamp")),
    ("user", FieldRule::Plain("pt_user_text", "user")),
    ("user", FieldRule::ZeroIfNull("pt_user", "userid")),
    ("userid", FieldRule::ZeroIfNull("pt_user", "userid")),
    ("comment", FieldRule::Plain("pt_reason", "comment")),
    ("expiry", FieldRule::Plain("pt_expiry", "expiry")),
    ("level", FieldRule::Plain("pt_level", "level")),
];

fn protected_titles(replay: &QueryReplay<'_>, mut module: ModuleParams) -> Result<Vec<Entry>, QueryError> {
    module.allow(PT_ALLOWED)?;
    module.set_default("dir", "older");
    module.set_default("prop", "timestamp|level");
    let range = module.time_range()?;
    let namespaces = module.ints("namespace")?;
    let levels = module.subset("level", &["autoconfirmed", "sysop"])?;
    let props = module.subset(
        "prop",
        &["timestamp", "user", "userid", "comment", "expiry", "level"],
    )?;
    module.unsupported(&["continue"])?;

    let mut select = Select::new("protected_titles");
    select.columns(&[
        "pt_namespace",
        "pt_title",
        "pt_level",
        "pt_expiry",
        "pt_timestamp",
        "pt_user",
        "pt_user_text",
        "pt_reason",
    ]);
    time_bounds(&mut select, "pt_timestamp", &range);
    in_list(&mut select, "pt_namespace", &namespaces);
    let levels = levels.into_iter().collect::<Vec<_>>();
    in_list(&mut select, "pt_level", &levels);
    let order = range.order();
    select.order_by(format!("pt_timestamp {order}"));
    select.order_by(format!("pt_namespace {order}"));
    select.order_by(format!("pt_title {order}"));

    let records = select.fetch(replay.connection())?;
    Ok(records
        .iter()
        .map(|record| {
            let mut entry = Entry::new();
            insert_title(&mut entry, replay, record, "pt_namespace", "pt_title");
            entry.extend(map_record(record, PT_FIELDS, &props));
            entry
        })
        .collect())
}

const ARV_ALLOWED: &[&str] = &[
    "start", "end", "dir", "namespace", "user", "excludeuser", "prop", "slots", "section",
    "generatetitles", "limit", "continue",
];

fn all_revisions(replay: &QueryReplay<'_>, mut module: ModuleParams) -> Result<Vec<Entry>, QueryError> {
    module.allow(ARV_ALLOWED)?;
    let options = revisions::options(&mut module)?;
    let namespaces = module.ints("namespace")?;
    module.unsupported(&["section", "generatetitles", "continue"])?;

    let mut select = Select::new(LIVE.table);
    select.join("JOIN page ON page_id = rev_page");
    select.columns(&["page_id", "page_namespace", "page_title"]);
    revisions::add_to_select(&mut select, &LIVE, &options);
    in_list(&mut select, "page_namespace", &namespaces);

    let records = select.fetch(replay.connection())?;
    Ok(records
        .iter()
        .map(|record| {
            let mut entry = Entry::new();
            entry.insert(
                "pageid".to_string(),
                record.get("page_id").cloned().unwrap_or(Value::Null),
            );
            insert_title(&mut entry, replay, record, "page_namespace", "page_title");
            entry.extend(revisions::entry(record, &options));
            entry
        })
        .collect())
}

const ADR_ALLOWED: &[&str] = &[
    "start", "end", "dir", "from", "to", "prefix", "tag", "namespace", "user", "excludeuser",
    "prop", "slots", "section", "generatetitles", "limit", "continue",
];

fn all_deleted_revisions(
    replay: &QueryReplay<'_>,
    mut module: ModuleParams,
) -> Result<Vec<Entry>, QueryError> {
    module.allow(ADR_ALLOWED)?;
    let options = revisions::options(&mut module)?;
    let namespaces = module.ints("namespace")?;
    module.unsupported(&["prefix", "section", "generatetitles", "continue"])?;

    let mut select = Select::new(ARCHIVED.table);
    select.join("LEFT JOIN page ON page_namespace = ar_namespace AND page_title = ar_title");
    select.columns(&["page_id", "ar_namespace", "ar_title"]);
    revisions::add_to_select(&mut select, &ARCHIVED, &options);
    in_list(&mut select, "ar_namespace", &namespaces);
    let normalize = |raw: &str| upper_first(&canonical_spacing(raw));
    name_bounds(
        &mut select,
        "ar_title",
        module.get("from").map(normalize),
        module.get("to").map(normalize),
    );
    if let Some(tag) = module.get("tag") {
        tag_filter(
            &mut select,
            ARCHIVED.id(),
            "tagged_archived_revision",
            "tgar_rev_id",
            "tgar_tag_id",
            tag,
        );
    }

    let records = select.fetch(replay.connection())?;
    Ok(records
        .iter()
        .map(|record| {
            let mut entry = Entry::new();
            if let Some(page_id) = record.get("page_id").filter(|value| !value.is_null()) {
                entry.insert("pageid".to_string(), page_id.clone());
            }
            insert_title(&mut entry, replay, record, "ar_namespace", "ar_title");
            entry.extend(revisions::entry(record, &options));
            entry
        })
        .collect())
}

const AU_ALLOWED: &[&str] = &[
    "from", "to", "dir", "prefix", "group", "excludegroup", "prop", "witheditsonly",
    "activeusers", "limit", "continue",
];
const AU_FIELDS: &[PropField] = &[
    ("", FieldRule::Plain("user_id", "userid")),
    ("", FieldRule::Plain("user_name", "name")),
    ("editcount", FieldRule::ZeroIfNull("user_editcount", "editcount")),
    ("registration", FieldRule::Plain("user_registration", "registration")),
    ("blockinfo", FieldRule::Plain("ipb_id", "blockid")),
    ("blockinfo", FieldRule::Plain("ipb_by", "blockedbyid")),
    ("blockinfo", FieldRule::Plain("ipb_by_text", "blockedby")),
    ("blockinfo", FieldRule::Plain("ipb_timestamp", "blockedtimestamp")),
    ("blockinfo", FieldRule::Plain("ipb_expiry", "blockexpiry")),
    ("blockinfo", FieldRule::Plain("ipb_reason", "blockreason")),
    ("blockinfo", FieldRule::Flag("ipb_deleted", "hidden")),
];

fn all_users(replay: &QueryReplay<'_>, mut module: ModuleParams) -> Result<Vec<Entry>, QueryError> {
    module.allow(AU_ALLOWED)?;
    module.set_default("dir", "ascending");
    module.set_default("prop", "");
    let range = module.name_range()?;
    module.exclusive("group", "excludegroup")?;
    let props = module.subset("prop", &["blockinfo", "groups", "editcount", "registration"])?;
    module.unsupported(&["prefix", "activeusers", "continue"])?;

    let mut select = Select::new("user");
    select.columns(&["user_id", "user_name", "user_editcount", "user_registration"]);
    if props.contains("groups") {
        select.column(
            "(SELECT group_concat(ug_group, char(31)) FROM user_groups WHERE ug_user = user_id) AS user_groups",
        );
    }
    if props.contains("blockinfo") {
        select.join(
            "LEFT JOIN ipblocks ON ipb_id = (SELECT MAX(ipb_id) FROM ipblocks WHERE ipb_user = user_id)",
        );
        select.columns(&[
            "ipb_id",
            "ipb_by",
            "ipb_by_text",
            "ipb_timestamp",
            "ipb_expiry",
            "ipb_reason",
            "ipb_deleted",
        ]);
    }
    select.filter("user_id > 0".to_string());
    let normalize = |raw: &str| upper_first(&canonical_spacing(raw));
    name_bounds(
        &mut select,
        "user_name",
        range.from.as_deref().map(normalize),
        range.to.as_deref().map(normalize),
    );
    let groups = module.list("group");
    if !groups.is_empty() {
        let list = select.bind_list(&groups);
        select.filter(format!(
            "EXISTS (SELECT 1 FROM user_groups WHERE ug_user = user_id AND ug_group IN {list})"
        ));
    }
    let excluded = module.list("excludegroup");
    if !excluded.is_empty() {
        let list = select.bind_list(&excluded);
        select.filter(format!(
            "NOT EXISTS (SELECT 1 FROM user_groups WHERE ug_user = user_id AND ug_group IN {list})"
        ));
    }
    if module.has("witheditsonly") {
        select.filter("user_editcount > 0".to_string());
    }
    select.order_by(format!("user_name {}", range.order()));

    let records = select.fetch(replay.connection())?;
    Ok(records
        .iter()
        .map(|record| {
            let mut entry = map_record(record, AU_FIELDS, &props);
            if props.contains("registration") && !entry.contains_key("registration") {
                entry.insert("registration".to_string(), Value::from(""));
            }
            if props.contains("groups") {
                let mut groups = BTreeSet::from(["*".to_string(), "user".to_string()]);
                if let Value::Array(names) = joined_list(record, "user_groups") {
                    groups.extend(names.iter().filter_map(Value::as_str).map(str::to_string));
                }
                entry.insert(
                    "groups".to_string(),
                    Value::from(groups.into_iter().collect::<Vec<_>>()),
                );
            }
            entry
        })
        .collect())
}

/// A page reference produced by a generator, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageRef {
    Id(i64),
    Title(i64, String),
}

/// Page references named by generator entries, deduplicated in first-seen order.
pub fn page_refs(replay: &QueryReplay<'_>, entries: &[Entry]) -> Vec<PageRef> {
    let mut seen = BTreeMap::new();
    let mut out = Vec::new();
    for entry in entries {
        let reference = match entry.get("pageid").and_then(Value::as_i64) {
            Some(page_id) if page_id > 0 => PageRef::Id(page_id),
            _ => match entry.get("title").and_then(Value::as_str) {
                Some(title) => {
                    let (namespace, title) = replay.titles().split(title);
                    PageRef::Title(namespace, title)
                }
                None => continue,
            },
        };
        if seen.insert(reference.clone(), ()).is_none() {
            out.push(reference);
        }
    }
    out
}
