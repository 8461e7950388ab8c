use std::collections::BTreeSet;

use rusqlite::{OptionalExtension, params};
use serde_json::{Map, Value};

use super::lists::{self, PageRef};
use super::{QueryError, QueryParams, QueryReplay, props};

/// One slot of a page-set result. Missing placeholders have no id.
#[derive(Debug, Clone)]
pub struct PageEntry {
    pub id: Option<i64>,
    pub fields: Map<String, Value>,
}

/// Outcome of resolving one page reference against the mirror.
enum PageLookup {
    Found { id: i64, namespace: i64, title: String },
    Missing,
}

const BY_ID: &str = "SELECT page_id, page_namespace, page_title FROM page WHERE page_id = ?1";
const BY_TITLE: &str =
    "SELECT page_id, page_namespace, page_title FROM page WHERE page_namespace = ?1 AND page_title = ?2";

fn lookup(replay: &QueryReplay<'_>, reference: &PageRef) -> Result<PageLookup, QueryError> {
    let connection = replay.connection();
    let row: Option<(i64, i64, String)> = match reference {
        PageRef::Id(id) => connection
            .prepare_cached(BY_ID)?
            .query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()?,
        PageRef::Title(namespace, title) => connection
            .prepare_cached(BY_TITLE)?
            .query_row(params![namespace, title], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?,
    };
    Ok(match row {
        Some((id, namespace, title)) => PageLookup::Found { id, namespace, title },
        None => PageLookup::Missing,
    })
}

fn resolve(replay: &QueryReplay<'_>, reference: &PageRef) -> Result<PageEntry, QueryError> {
    let mut fields = Map::new();
    let id = match lookup(replay, reference)? {
        PageLookup::Found { id, namespace, title } => {
            fields.insert("pageid".to_string(), Value::from(id));
            fields.insert("ns".to_string(), Value::from(namespace));
            fields.insert(
                "title".to_string(),
                Value::from(replay.titles().full_title(namespace, &title)),
            );
            Some(id)
        }
        PageLookup::Missing => {
            match reference {
                PageRef::Id(id) => {
                    fields.insert("pageid".to_string(), Value::from(*id));
                }
                PageRef::Title(namespace, title) => {
                    fields.insert("ns".to_string(), Value::from(*namespace));
                    fields.insert(
                        "title".to_string(),
                        Value::from(replay.titles().full_title(*namespace, title)),
                    );
                }
            }
            fields.insert("missing".to_string(), Value::Bool(true));
            None
        }
    };
    Ok(PageEntry { id, fields })
}

/// Page references from `titles=` or `pageids=`, in the order given.
fn explicit_refs(replay: &QueryReplay<'_>, params: &QueryParams) -> Result<Vec<PageRef>, QueryError> {
    let references = if params.contains("titles") {
        params
            .list("titles")
            .iter()
            .map(|title| {
                let (namespace, title) = replay.titles().split(title);
                PageRef::Title(namespace, title)
            })
            .collect::<Vec<_>>()
    } else {
        params
            .list("pageids")
            .iter()
            .map(|id| {
                id.trim().parse::<i64>().map(PageRef::Id).map_err(|_| {
                    QueryError::Validation(format!("invalid page id '{id}'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?
    };
    let mut seen = BTreeSet::new();
    Ok(references
        .into_iter()
        .filter(|reference| seen.insert(reference.clone()))
        .collect())
}

/// Resolves the page set, then expands it with the requested props.
pub fn run(replay: &QueryReplay<'_>, params: &QueryParams) -> Result<Vec<Value>, QueryError> {
    let names = params.list("prop");
    props::check_names(&names)?;
    if let Some(option) = ["redirects", "converttitles"]
        .into_iter()
        .find(|option| params.contains(option))
    {
        return Err(QueryError::Unsupported(format!(
            "parameter '{option}' is not supported"
        )));
    }

    let references = match params.get("generator") {
        Some(generator) => {
            let entries = lists::run(replay, generator, params, true)?;
            lists::page_refs(replay, &entries)
        }
        None => explicit_refs(replay, params)?,
    };
    let mut pages = references
        .iter()
        .map(|reference| resolve(replay, reference))
        .collect::<Result<Vec<_>, _>>()?;
    props::expand(replay, params, &names, &mut pages)?;
    Ok(pages.into_iter().map(|page| Value::Object(page.fields)).collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::replay::{QueryError, QueryParams, QueryReplay};
    use crate::test_support::synced_sample;

    #[test]
    fn missing_title_keeps_its_position() {
        let (_temp, connection) = synced_sample();
        let replay = QueryReplay::new(&connection).expect("replay");
        let pages = replay
            .query(
                &QueryParams::new()
                    .with("titles", "Main_Page|No such page|Template:Box")
                    .with("prop", "info|templates"),
            )
            .expect("titles");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1], json!({"ns": 0, "title": "No such page", "missing": true}));
        assert_eq!(pages[0]["pageid"], json!(1));
        assert_eq!(pages[0]["lastrevid"], json!(11));
        assert_eq!(pages[2]["title"], json!("Template:Box"));
        assert_eq!(pages[2]["lastrevid"], json!(12));
    }

    #[test]
    fn pageids_report_missing_ids() {
        let (_temp, connection) = synced_sample();
        let replay = QueryReplay::new(&connection).expect("replay");
        let pages = replay
            .query(&QueryParams::new().with("pageids", "2|99"))
            .expect("pageids");
        assert_eq!(
            pages,
            vec![
                json!({"pageid": 2, "ns": 10, "title": "Template:Box"}),
                json!({"pageid": 99, "missing": true}),
            ]
        );
    }

    #[test]
    fn latest_revisions_prop_returns_one_revision_per_page() {
        let (_temp, connection) = synced_sample();
        let replay = QueryReplay::new(&connection).expect("replay");
        let pages = replay
            .query(
                &QueryParams::new()
                    .with("titles", "Main Page")
                    .with("prop", "latestrevisions")
                    .with("rvprop", "ids|tags"),
            )
            .expect("latest");
        assert_eq!(
            pages[0]["revisions"],
            json!([{"revid": 11, "parentid": 10, "tags": ["mw-undo"]}])
        );

        let pages = replay
            .query(
                &QueryParams::new()
                    .with("titles", "Main Page")
                    .with("prop", "revisions")
                    .with("rvprop", "ids")
                    .with("rvdir", "newer"),
            )
            .expect("all");
        assert_eq!(
            pages[0]["revisions"],
            json!([{"revid": 10, "parentid": 0}, {"revid": 11, "parentid": 10}])
        );
    }

    #[test]
    fn generator_feeds_page_set() {
        let (_temp, connection) = synced_sample();
        let replay = QueryReplay::new(&connection).expect("replay");
        let pages = replay
            .query(
                &QueryParams::new()
                    .with("generator", "recentchanges")
                    .with("grcdir", "newer"),
            )
            .expect("generator");
        let ids = pages
            .iter()
            .map(|page| page["pageid"].as_i64().expect("pageid"))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn rejects_unknown_props_and_mixed_sources() {
        let (_temp, connection) = synced_sample();
        let replay = QueryReplay::new(&connection).expect("replay");
        assert!(matches!(
            replay.query(&QueryParams::new().with("titles", "A").with("prop", "imageinfo")),
            Err(QueryError::Unsupported(_))
        ));
        assert!(matches!(
            replay.query(&QueryParams::new().with("titles", "A").with("pageids", "1")),
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            replay.query(
                &QueryParams::new()
                    .with("titles", "Main Page")
                    .with("prop", "info")
                    .with("inprop", "url")
            ),
            Err(QueryError::Unsupported(_))
        ));
    }
}
