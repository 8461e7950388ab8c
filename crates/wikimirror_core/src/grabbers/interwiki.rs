use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::changefeed::{ChangeEvent, ChangeFeed};
use crate::row;

const INSERT_INTERWIKI: &str = "INSERT INTO interwiki
        (iw_prefix, iw_url, iw_api, iw_local, iw_trans, iw_language)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
const UPSERT_INTERWIKI: &str = "INSERT INTO interwiki (iw_prefix, iw_url, iw_local, iw_trans)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(iw_prefix) DO UPDATE SET
        iw_url = excluded.iw_url,
        iw_local = excluded.iw_local,
        iw_trans = excluded.iw_trans";
const DELETE_INTERWIKI: &str = "DELETE FROM interwiki WHERE iw_prefix = ?1";

pub struct InterwikiGrabber;

/// Reads a log parameter stored either positionally or by name.
fn interwiki_param<'e>(event: &'e ChangeEvent, position: &str, name: &str) -> Option<&'e Value> {
    event.params.get(position).or_else(|| event.params.get(name))
}

fn param_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|number| number != 0),
        Some(Value::String(text)) => matches!(text.as_str(), "1" | "true"),
        _ => false,
    }
}

impl Grabber for InterwikiGrabber {
    fn name(&self) -> &'static str {
        "GrabberInterwiki"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &["interwiki"]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        for entry in ctx.api.interwiki_map()? {
            ctx.execute(
                INSERT_INTERWIKI,
                row![
                    entry.prefix,
                    entry.url,
                    entry.api,
                    entry.local,
                    entry.trans,
                    entry.language,
                ],
            )?;
        }
        ctx.reload_titles()
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let events = ChangeFeed::new(ctx.db()).log_events_since(Some(since), &["interwiki"])?;
        for event in events {
            let Some(prefix) = interwiki_param(&event, "0", "prefix").and_then(Value::as_str)
            else {
                tracing::warn!(log_id = ?event.log_id, "interwiki log entry without prefix");
                continue;
            };
            match event.log_action.as_deref() {
                Some("iw_add" | "iw_edit") => {
                    let url = interwiki_param(&event, "1", "url")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let trans = param_flag(interwiki_param(&event, "2", "trans"));
                    let local = param_flag(interwiki_param(&event, "3", "local"));
                    ctx.execute(UPSERT_INTERWIKI, row![prefix, url, local, trans])?;
                }
                Some("iw_delete") => ctx.execute(DELETE_INTERWIKI, row![prefix])?,
                _ => {}
            }
        }
        ctx.reload_titles()?;
        Ok(UpdateOutcome::CaughtUp)
    }
}
