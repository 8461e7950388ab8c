//! `prop=` modules applied to a resolved page set.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use super::mapping::{FieldRule, PropField, map_record};
use super::pageset::PageEntry;
use super::revisions::{self, ARCHIVED, LIVE};
use super::{ModuleParams, QueryError, QueryParams, QueryReplay, Record, Select};
use crate::timestamp::INFINITY;

pub const MODULES: &[&str] = &[
    "info",
    "pageprops",
    "revisions",
    "latestrevisions",
    "deletedrevisions",
    "templates",
    "transcludedin",
    "links",
    "linkshere",
    "images",
    "categories",
    "langlinks",
    "iwlinks",
    "extlinks",
    "redirects",
    "sections",
];

/// What one result row adds to its page.
enum Addition {
    Fields(Map<String, Value>),
    Item(&'static str, Value),
}

type Additions = Vec<(i64, Addition)>;

pub fn check_names(names: &[String]) -> Result<(), QueryError> {
    match names.iter().find(|name| !MODULES.contains(&name.as_str())) {
        Some(name) => Err(QueryError::Unsupported(format!("prop={name} is not supported"))),
        None => Ok(()),
    }
}

/// Runs every requested prop module and merges its rows into `pages` by page id.
pub fn expand(
    replay: &QueryReplay<'_>,
    params: &QueryParams,
    names: &[String],
    pages: &mut [PageEntry],
) -> Result<(), QueryError> {
    let ids = pages.iter().filter_map(|page| page.id).collect::<Vec<_>>();
    let mut index = BTreeMap::new();
    for (position, page) in pages.iter().enumerate() {
        if let Some(id) = page.id {
            index.insert(id, position);
        }
    }

    for name in names {
        let additions = match name.as_str() {
            "info" => info(replay, params.module("in", false), &ids)?,
            "pageprops" => page_props(replay, params.module("pp", false), &ids)?,
            "revisions" => page_revisions(replay, params.module("rv", false), &ids, false)?,
            "latestrevisions" => page_revisions(replay, params.module("rv", false), &ids, true)?,
            "deletedrevisions" => deleted_revisions(replay, params.module("drv", false), &ids)?,
            "templates" => outgoing(replay, params, &TEMPLATES, &ids)?,
            "links" => outgoing(replay, params, &LINKS, &ids)?,
            "images" => outgoing(replay, params, &IMAGES, &ids)?,
            "categories" => outgoing(replay, params, &CATEGORIES, &ids)?,
            "transcludedin" => incoming(replay, params, &TRANSCLUDED_IN, &ids)?,
            "linkshere" => incoming(replay, params, &LINKS_HERE, &ids)?,
            "langlinks" => lang_links(replay, params.module("ll", false), &ids)?,
            "iwlinks" => interwiki_links(replay, params.module("iw", false), &ids)?,
            "extlinks" => external_links(replay, params.module("el", false), &ids)?,
            "redirects" => redirects(replay, params.module("rd", false), &ids)?,
            "sections" => sections(replay, params.module("sec", false), &ids)?,
            other => return Err(QueryError::Unsupported(format!("prop={other} is not supported"))),
        };
        for (owner, addition) in additions {
            let Some(position) = index.get(&owner) else {
                continue;
            };
            let fields = &mut pages[*position].fields;
            match addition {
                Addition::Fields(extra) => fields.extend(extra),
                Addition::Item(key, item) => {
                    if let Value::Array(items) = fields
                        .entry(key.to_string())
                        .or_insert_with(|| Value::Array(Vec::new()))
                    {
                        items.push(item);
                    }
                }
            }
        }
    }
    Ok(())
}

fn owner(record: &Record) -> Option<i64> {
    record.get("owner").and_then(Value::as_i64)
}

fn owned_by(select: &mut Select, column: &str, ids: &[i64]) {
    let list = select.bind_list(ids);
    select.filter(format!("{column} IN {list}"));
}

fn items(records: Vec<Record>, key: &'static str, mut item: impl FnMut(&Record) -> Value) -> Additions {
    records
        .iter()
        .filter_map(|record| owner(record).map(|page| (page, Addition::Item(key, item(record)))))
        .collect()
}

fn sort_order(module: &mut ModuleParams) -> Result<&'static str, QueryError> {
    module.set_default("dir", "ascending");
    Ok(
        if module.one_of("dir", &["ascending", "descending"])? == "ascending" {
            "ASC"
        } else {
            "DESC"
        },
    )
}

const INFO_FIELDS: &[PropField] = &[
    ("", FieldRule::Flag("page_is_redirect", "redirect")),
    ("", FieldRule::Flag("page_is_new", "new")),
    ("", FieldRule::Plain("page_touched", "touched")),
    ("", FieldRule::Plain("page_len", "length")),
    ("", FieldRule::Plain("page_latest", "lastrevid")),
    ("", FieldRule::Plain("page_content_model", "contentmodel")),
    ("", FieldRule::Plain("page_lang", "pagelanguage")),
];

fn info(replay: &QueryReplay<'_>, module: ModuleParams, ids: &[i64]) -> Result<Additions, QueryError> {
    module.allow(&["prop"])?;
    let props = module.subset(
        "prop",
        &["protection", "displaytitle", "url", "talkid", "subjectid"],
    )?;
    if let Some(computed) = ["url", "talkid", "subjectid"]
        .iter()
        .find(|prop| props.contains(**prop))
    {
        return Err(QueryError::Unsupported(format!(
            "inprop={computed} is not supported"
        )));
    }

    let mut select = Select::new("page");
    select.columns(&[
        "page_id AS owner",
        "page_namespace",
        "page_title",
        "page_is_redirect",
        "page_is_new",
        "page_touched",
        "page_len",
        "page_latest",
        "page_content_model",
        "page_lang",
    ]);
    if props.contains("displaytitle") {
        select.column(
            "(SELECT pp_value FROM page_props WHERE pp_page = page_id AND pp_propname = 'displaytitle') AS displaytitle",
        );
    }
    owned_by(&mut select, "page_id", ids);
    let records = select.fetch(replay.connection())?;

    let mut protection = BTreeMap::<i64, Vec<Value>>::new();
    if props.contains("protection") {
        let mut select = Select::new("page_restrictions");
        select.columns(&["pr_page AS owner", "pr_type", "pr_level", "pr_cascade", "pr_expiry"]);
        owned_by(&mut select, "pr_page", ids);
        select.order_by("pr_page".to_string());
        select.order_by("pr_type".to_string());
        for record in select.fetch(replay.connection())? {
            let Some(page) = owner(&record) else {
                continue;
            };
            let mut entry = map_record(
                &record,
                &[
                    ("", FieldRule::Plain("pr_type", "type")),
                    ("", FieldRule::Plain("pr_level", "level")),
                    ("", FieldRule::Flag("pr_cascade", "cascade")),
                ],
                &BTreeSet::new(),
            );
            let expiry = match record.get("pr_expiry").and_then(Value::as_str) {
                None | Some(INFINITY) => "infinite".to_string(),
                Some(expiry) => expiry.to_string(),
            };
            entry.insert("expiry".to_string(), Value::from(expiry));
            protection.entry(page).or_default().push(Value::Object(entry));
        }
    }

    Ok(records
        .iter()
        .filter_map(|record| {
            let page = owner(record)?;
            let mut fields = map_record(record, INFO_FIELDS, &props);
            let language = fields
                .get("pagelanguage")
                .and_then(Value::as_str)
                .unwrap_or("en")
                .to_string();
            fields.insert("pagelanguagehtmlcode".to_string(), Value::from(html_code(&language)));
            let direction = if matches!(language.as_str(), "ar" | "he" | "fa") { "rtl" } else { "ltr" };
            fields.insert("pagelanguagedir".to_string(), Value::from(direction));
            if props.contains("protection") {
                fields.insert("restrictiontypes".to_string(), Value::from(vec!["edit", "move"]));
                fields.insert(
                    "protection".to_string(),
                    Value::Array(protection.remove(&page).unwrap_or_default()),
                );
            }
            if props.contains("displaytitle") {
                let title = match record.get("displaytitle").and_then(Value::as_str) {
                    Some(display) if !display.is_empty() => display.to_string(),
                    _ => replay.titles().full_title(
                        record.get("page_namespace").and_then(Value::as_i64).unwrap_or_default(),
                        record.get("page_title").and_then(Value::as_str).unwrap_or_default(),
                    ),
                };
                fields.insert("displaytitle".to_string(), Value::from(title));
            }
            Some((page, Addition::Fields(fields)))
        })
        .collect())
}

fn html_code(language: &str) -> String {
    match language {
        "zh-hans" => "zh-Hans".to_string(),
        "zh-hant" => "zh-Hant".to_string(),
        other => other.to_string(),
    }
}

fn page_props(replay: &QueryReplay<'_>, module: ModuleParams, ids: &[i64]) -> Result<Additions, QueryError> {
    module.allow(&["prop", "continue"])?;
    module.unsupported(&["continue"])?;
    let names = module.list("prop");

    let mut select = Select::new("page_props");
    select.columns(&["pp_page AS owner", "pp_propname", "pp_value"]);
    owned_by(&mut select, "pp_page", ids);
    if !names.is_empty() {
        let list = select.bind_list(&names);
        select.filter(format!("pp_propname IN {list}"));
    }
    select.order_by("pp_page".to_string());
    select.order_by("pp_propname".to_string());

    let mut grouped = BTreeMap::<i64, Map<String, Value>>::new();
    for record in select.fetch(replay.connection())? {
        if let (Some(page), Some(name)) = (owner(&record), record.get("pp_propname").and_then(Value::as_str)) {
            grouped.entry(page).or_default().insert(
                name.to_string(),
                record.get("pp_value").cloned().unwrap_or(Value::Null),
            );
        }
    }
    Ok(grouped
        .into_iter()
        .map(|(page, props)| {
            let mut fields = Map::new();
            fields.insert("pageprops".to_string(), Value::Object(props));
            (page, Addition::Fields(fields))
        })
        .collect())
}

const REVISION_ALLOWED: &[&str] = &[
    "start", "end", "dir", "user", "excludeuser", "prop", "slots", "section", "limit", "continue",
];

fn page_revisions(
    replay: &QueryReplay<'_>,
    mut module: ModuleParams,
    ids: &[i64],
    latest_only: bool,
) -> Result<Additions, QueryError> {
    module.allow(REVISION_ALLOWED)?;
    let options = revisions::options(&mut module)?;
    module.unsupported(&["section", "continue"])?;

    let mut select = Select::new(LIVE.table);
    select.column("rev_page AS owner");
    if latest_only {
        select.join("JOIN page ON page_id = rev_page AND page_latest = rev_id");
    }
    revisions::add_to_select(&mut select, &LIVE, &options);
    owned_by(&mut select, "rev_page", ids);
    let records = select.fetch(replay.connection())?;
    Ok(items(records, "revisions", |record| {
        Value::Object(revisions::entry(record, &options))
    }))
}

fn deleted_revisions(
    replay: &QueryReplay<'_>,
    mut module: ModuleParams,
    ids: &[i64],
) -> Result<Additions, QueryError> {
    module.allow(REVISION_ALLOWED)?;
    let options = revisions::options(&mut module)?;
    module.unsupported(&["section", "continue"])?;

    let mut select = Select::new(ARCHIVED.table);
    select.join("JOIN page ON page_namespace = ar_namespace AND page_title = ar_title");
    select.column("page_id AS owner");
    revisions::add_to_select(&mut select, &ARCHIVED, &options);
    owned_by(&mut select, "page_id", ids);
    let records = select.fetch(replay.connection())?;
    Ok(items(records, "deletedrevisions", |record| {
        Value::Object(revisions::entry(record, &options))
    }))
}

/// A link relation read from the linking page's side.
struct Outgoing {
    key: &'static str,
    prefix: &'static str,
    table: &'static str,
    from: &'static str,
    /// Namespace column, or the fixed namespace of every target.
    namespace: Result<&'static str, i64>,
    title: &'static str,
    /// Option restricting the targets to a list of titles.
    targets: &'static str,
}

const TEMPLATES: Outgoing = Outgoing {
    key: "templates",
    prefix: "tl",
    table: "templatelinks",
    from: "tl_from",
    namespace: Ok("tl_namespace"),
    title: "tl_title",
    targets: "templates",
};

const LINKS: Outgoing = Outgoing {
    key: "links",
    prefix: "pl",
    table: "pagelinks",
    from: "pl_from",
    namespace: Ok("pl_namespace"),
    title: "pl_title",
    targets: "titles",
};

const IMAGES: Outgoing = Outgoing {
    key: "images",
    prefix: "im",
    table: "imagelinks",
    from: "il_from",
    namespace: Err(6),
    title: "il_to",
    targets: "images",
};

const CATEGORIES: Outgoing = Outgoing {
    key: "categories",
    prefix: "cl",
    table: "categorylinks",
    from: "cl_from",
    namespace: Err(14),
    title: "cl_to",
    targets: "categories",
};

fn outgoing(
    replay: &QueryReplay<'_>,
    params: &QueryParams,
    relation: &Outgoing,
    ids: &[i64],
) -> Result<Additions, QueryError> {
    let mut module = params.module(relation.prefix, false);
    let mut allowed = vec![relation.targets, "dir", "limit", "continue"];
    if relation.namespace.is_ok() {
        allowed.push("namespace");
    }
    module.allow(&allowed)?;
    let order = sort_order(&mut module)?;
    let namespaces = module.ints("namespace")?;
    module.unsupported(&["continue"])?;

    let mut select = Select::new(relation.table);
    select.column(&format!("{} AS owner", relation.from));
    match relation.namespace {
        Ok(column) => select.column(&format!("{column} AS target_ns")),
        Err(namespace) => select.column(&format!("{namespace} AS target_ns")),
    }
    select.column(&format!("{} AS target_title", relation.title));
    owned_by(&mut select, relation.from, ids);
    if let Ok(column) = relation.namespace
        && !namespaces.is_empty()
    {
        let list = select.bind_list(&namespaces);
        select.filter(format!("{column} IN {list}"));
    }
    let targets = module.list(relation.targets);
    if !targets.is_empty() {
        let titles = replay.titles();
        match relation.namespace {
            Ok(column) => {
                let pairs = targets.iter().map(|target| titles.split(target)).collect::<Vec<_>>();
                let condition = select.bind_pairs(&pairs, column, relation.title);
                select.filter(condition);
            }
            Err(namespace) => {
                let names = targets
                    .iter()
                    .map(|target| titles.db_title(target, namespace))
                    .collect::<Vec<_>>();
                let list = select.bind_list(&names);
                select.filter(format!("{} IN {list}", relation.title));
            }
        }
    }
    if let Ok(column) = relation.namespace {
        select.order_by(format!("{column} {order}"));
    }
    select.order_by(format!("{} {order}", relation.title));

    let records = select.fetch(replay.connection())?;
    Ok(items(records, relation.key, |record| {
        let namespace = record.get("target_ns").and_then(Value::as_i64).unwrap_or_default();
        let title = record.get("target_title").and_then(Value::as_str).unwrap_or_default();
        let mut entry = Map::new();
        entry.insert("ns".to_string(), Value::from(namespace));
        entry.insert(
            "title".to_string(),
            Value::from(replay.titles().full_title(namespace, title)),
        );
        Value::Object(entry)
    }))
}

/// A link relation read from the target page's side.
struct Incoming {
    key: &'static str,
    prefix: &'static str,
    table: &'static str,
    from: &'static str,
    namespace: &'static str,
    title: &'static str,
}

const TRANSCLUDED_IN: Incoming = Incoming {
    key: "transcludedin",
    prefix: "ti",
    table: "templatelinks",
    from: "tl_from",
    namespace: "tl_namespace",
    title: "tl_title",
};

const LINKS_HERE: Incoming = Incoming {
    key: "linkshere",
    prefix: "lh",
    table: "pagelinks",
    from: "pl_from",
    namespace: "pl_namespace",
    title: "pl_title",
};

const SOURCE_FIELDS: &[PropField] = &[
    ("pageid", FieldRule::Plain("source_id", "pageid")),
    ("title", FieldRule::Plain("source_ns", "ns")),
    ("redirect", FieldRule::Flag("source_redirect", "redirect")),
    ("fragment", FieldRule::Plain("rd_fragment", "fragment")),
];

fn source_entry(replay: &QueryReplay<'_>, record: &Record, props: &BTreeSet<String>) -> Value {
    let mut entry = map_record(record, SOURCE_FIELDS, props);
    if props.contains("title") {
        let namespace = record.get("source_ns").and_then(Value::as_i64).unwrap_or_default();
        let title = record.get("source_title").and_then(Value::as_str).unwrap_or_default();
        entry.insert(
            "title".to_string(),
            Value::from(replay.titles().full_title(namespace, title)),
        );
    }
    Value::Object(entry)
}

fn source_columns(select: &mut Select, from: &str) {
    select.join(&format!("JOIN page AS source ON source.page_id = {from}"));
    select.columns(&[
        "source.page_id AS source_id",
        "source.page_namespace AS source_ns",
        "source.page_title AS source_title",
        "source.page_is_redirect AS source_redirect",
    ]);
}

fn source_namespaces(select: &mut Select, module: &ModuleParams) -> Result<(), QueryError> {
    let namespaces = module.ints("namespace")?;
    if !namespaces.is_empty() {
        let list = select.bind_list(&namespaces);
        select.filter(format!("source.page_namespace IN {list}"));
    }
    Ok(())
}

fn incoming(
    replay: &QueryReplay<'_>,
    params: &QueryParams,
    relation: &Incoming,
    ids: &[i64],
) -> Result<Additions, QueryError> {
    let mut module = params.module(relation.prefix, false);
    module.allow(&["prop", "namespace", "show", "limit", "continue"])?;
    module.set_default("prop", "pageid|title|redirect");
    let props = module.subset("prop", &["pageid", "title", "redirect"])?;
    let show = module.show_flags(&["redirect"])?;
    module.unsupported(&["continue"])?;

    let mut select = Select::new(relation.table);
    select.join(&format!(
        "JOIN page AS target ON target.page_namespace = {} AND target.page_title = {}",
        relation.namespace, relation.title
    ));
    select.column("target.page_id AS owner");
    source_columns(&mut select, relation.from);
    owned_by(&mut select, "target.page_id", ids);
    source_namespaces(&mut select, &module)?;
    match show.get("redirect") {
        Some(true) => select.filter("source.page_is_redirect = 1".to_string()),
        Some(false) => select.filter("source.page_is_redirect = 0".to_string()),
        None => {}
    }
    select.order_by(format!("{} ASC", relation.from));

    let records = select.fetch(replay.connection())?;
    Ok(items(records, relation.key, |record| source_entry(replay, record, &props)))
}

fn redirects(replay: &QueryReplay<'_>, mut module: ModuleParams, ids: &[i64]) -> Result<Additions, QueryError> {
    module.allow(&["prop", "namespace", "show", "limit", "continue"])?;
    module.set_default("prop", "pageid|title");
    let props = module.subset("prop", &["pageid", "title", "fragment"])?;
    let show = module.show_flags(&["fragment"])?;
    module.unsupported(&["continue"])?;

    let mut select = Select::new("redirect");
    select.join(
        "JOIN page AS target ON target.page_namespace = rd_namespace AND target.page_title = rd_title",
    );
    select.column("target.page_id AS owner");
    select.column("rd_fragment");
    source_columns(&mut select, "rd_from");
    select.filter("COALESCE(rd_interwiki, '') = ''".to_string());
    owned_by(&mut select, "target.page_id", ids);
    source_namespaces(&mut select, &module)?;
    match show.get("fragment") {
        Some(true) => select.filter("rd_fragment IS NOT NULL".to_string()),
        Some(false) => select.filter("rd_fragment IS NULL".to_string()),
        None => {}
    }
    select.order_by("rd_from ASC".to_string());

    let records = select.fetch(replay.connection())?;
    Ok(items(records, "redirects", |record| source_entry(replay, record, &props)))
}

fn lang_links(replay: &QueryReplay<'_>, mut module: ModuleParams, ids: &[i64]) -> Result<Additions, QueryError> {
    module.allow(&["lang", "title", "dir", "limit", "continue"])?;
    let order = sort_order(&mut module)?;
    module.requires("title", "lang")?;
    module.unsupported(&["continue"])?;

    let mut select = Select::new("langlinks");
    select.columns(&["ll_from AS owner", "ll_lang", "ll_title"]);
    owned_by(&mut select, "ll_from", ids);
    if let Some(lang) = module.get("lang") {
        let placeholder = select.bind(lang.to_string());
        select.filter(format!("ll_lang = {placeholder}"));
    }
    if let Some(title) = module.get("title") {
        let placeholder = select.bind(title.to_string());
        select.filter(format!("ll_title = {placeholder}"));
    }
    select.order_by(format!("ll_lang {order}"));
    select.order_by(format!("ll_title {order}"));

    let records = select.fetch(replay.connection())?;
    Ok(items(records, "langlinks", |record| {
        Value::Object(map_record(
            record,
            &[
                ("", FieldRule::Plain("ll_lang", "lang")),
                ("", FieldRule::Plain("ll_title", "title")),
            ],
            &BTreeSet::new(),
        ))
    }))
}

fn interwiki_links(
    replay: &QueryReplay<'_>,
    mut module: ModuleParams,
    ids: &[i64],
) -> Result<Additions, QueryError> {
    module.allow(&["prefix", "title", "dir", "limit", "continue"])?;
    let order = sort_order(&mut module)?;
    module.requires("title", "prefix")?;
    module.unsupported(&["continue"])?;

    let mut select = Select::new("iwlinks");
    select.columns(&["iwl_from AS owner", "iwl_prefix", "iwl_title"]);
    owned_by(&mut select, "iwl_from", ids);
    if let Some(prefix) = module.get("prefix") {
        let placeholder = select.bind(prefix.to_lowercase());
        select.filter(format!("iwl_prefix = {placeholder}"));
    }
    if let Some(title) = module.get("title") {
        let placeholder = select.bind(title.to_string());
        select.filter(format!("iwl_title = {placeholder}"));
    }
    select.order_by(format!("iwl_prefix {order}"));
    select.order_by(format!("iwl_title {order}"));

    let records = select.fetch(replay.connection())?;
    Ok(items(records, "iwlinks", |record| {
        Value::Object(map_record(
            record,
            &[
                ("", FieldRule::Plain("iwl_prefix", "prefix")),
                ("", FieldRule::Plain("iwl_title", "title")),
            ],
            &BTreeSet::new(),
        ))
    }))
}

fn external_links(
    replay: &QueryReplay<'_>,
    module: ModuleParams,
    ids: &[i64],
) -> Result<Additions, QueryError> {
    module.allow(&["protocol", "query", "offset", "limit", "continue"])?;
    module.requires("query", "protocol")?;
    module.unsupported(&["offset", "continue"])?;

    let mut select = Select::new("externallinks");
    select.columns(&["el_from AS owner", "el_to"]);
    owned_by(&mut select, "el_from", ids);
    if let Some(protocol) = module.get("protocol") {
        let protocol = protocol.trim_end_matches([':', '/']).to_lowercase();
        let pattern = if protocol == "mailto" {
            "mailto:%".to_string()
        } else {
            format!("{protocol}://%")
        };
        let placeholder = select.bind(pattern);
        select.filter(format!("lower(el_to) LIKE {placeholder}"));
    }
    if let Some(query) = module.get("query") {
        let placeholder = select.bind(query.to_string());
        select.filter(format!("instr(el_to, {placeholder}) > 0"));
    }
    select.order_by("el_from".to_string());
    select.order_by("el_to".to_string());

    let records = select.fetch(replay.connection())?;
    Ok(items(records, "extlinks", |record| {
        Value::Object(map_record(
            record,
            &[("", FieldRule::Plain("el_to", "url"))],
            &BTreeSet::new(),
        ))
    }))
}

fn sections(replay: &QueryReplay<'_>, mut module: ModuleParams, ids: &[i64]) -> Result<Additions, QueryError> {
    module.allow(&["prop"])?;
    module.set_default("prop", "number|level|title");
    let props = module.subset("prop", &["number", "level", "title", "anchor"])?;

    let mut select = Select::new("section");
    select.columns(&["sec_page AS owner", "sec_number", "sec_level", "sec_title", "sec_anchor"]);
    owned_by(&mut select, "sec_page", ids);
    select.order_by("sec_page".to_string());
    select.order_by("sec_number".to_string());

    let records = select.fetch(replay.connection())?;
    Ok(items(records, "sections", |record| {
        Value::Object(map_record(
            record,
            &[
                ("number", FieldRule::Plain("sec_number", "number")),
                ("level", FieldRule::Plain("sec_level", "level")),
                ("title", FieldRule::Plain("sec_title", "title")),
                ("anchor", FieldRule::Plain("sec_anchor", "anchor")),
            ],
            &props,
        ))
    }))
}
