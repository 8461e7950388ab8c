use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::flags::DeletedFlags;
use crate::timestamp::format_timestamp;

const TITLE_BATCH: usize = 50;

/// Read-only view of the remote wiki consumed by the grabbers.
///
/// Collections are returned fully paginated. Time-ordered collections come
/// back oldest first.
pub trait RemoteApi {
    fn site_info(&mut self) -> Result<SiteInfo>;
    fn interwiki_map(&mut self) -> Result<Vec<RemoteInterwiki>>;
    fn tags(&mut self) -> Result<Vec<RemoteTag>>;
    /// Entries strictly newer than `since`, or the whole retained feed.
    fn recent_changes(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRecentChange>>;
    /// Oldest and newest timestamps currently retained by the short feed.
    fn recent_changes_bounds(&mut self) -> Result<Option<FeedBounds>>;
    fn log_events(&mut self, query: &LogQuery) -> Result<Vec<RemoteLogEvent>>;
    fn all_users(&mut self) -> Result<Vec<RemoteUser>>;
    fn users(&mut self, names: &[String]) -> Result<Vec<RemoteUser>>;
    fn blocks(&mut self, query: &BlockQuery) -> Result<Vec<RemoteBlock>>;
    fn all_pages(&mut self) -> Result<Vec<RemotePage>>;
    fn pages(&mut self, selector: &PageSelector) -> Result<Vec<RemotePage>>;
    fn protected_titles(&mut self) -> Result<Vec<RemoteProtectedTitle>>;
    fn all_revisions(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRevision>>;
    fn all_deleted_revisions(&mut self) -> Result<Vec<RemoteRevision>>;
    fn deleted_revisions(&mut self, titles: &[String]) -> Result<Vec<RemoteRevision>>;
    /// Every live and deleted revision of the selected pages.
    fn page_history(&mut self, selector: &PageSelector) -> Result<Vec<RemoteRevision>>;
    fn revision_contents(&mut self, revids: &[i64]) -> Result<Vec<RevisionContent>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedBounds {
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub since: Option<DateTime<Utc>>,
    pub log_type: Option<String>,
}

impl LogQuery {
    pub fn since(since: Option<DateTime<Utc>>) -> Self {
        Self {
            since,
            log_type: None,
        }
    }

    pub fn of_type(log_type: &str, since: Option<DateTime<Utc>>) -> Self {
        Self {
            since,
            log_type: Some(log_type.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockQuery {
    /// Blocks created at or after this instant.
    pub start: Option<DateTime<Utc>>,
    /// Restrict to blocks targeting these users or addresses.
    pub users: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PageSelector {
    Ids(Vec<i64>),
    Titles(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteInfo {
    #[serde(default)]
    pub namespaces: BTreeMap<String, RemoteNamespace>,
    #[serde(default, rename = "namespacealiases")]
    pub namespace_aliases: Vec<RemoteNamespaceAlias>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteNamespace {
    pub id: i64,
    pub case: String,
    pub name: String,
    pub canonical: Option<String>,
    #[serde(default)]
    pub content: bool,
    #[serde(default)]
    pub subpages: bool,
    #[serde(default)]
    pub nonincludable: bool,
    pub defaultcontentmodel: Option<String>,
    pub namespaceprotection: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteNamespaceAlias {
    pub id: i64,
    pub alias: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteInterwiki {
    pub prefix: String,
    pub url: String,
    pub api: Option<String>,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub trans: bool,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTag {
    pub name: String,
    pub displayname: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub defined: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub source: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteRecentChange {
    pub rcid: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub ns: i64,
    pub title: String,
    pub pageid: Option<i64>,
    pub revid: Option<i64>,
    pub old_revid: Option<i64>,
    pub user: Option<String>,
    pub userid: Option<i64>,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub minor: bool,
    #[serde(default)]
    pub redirect: bool,
    #[serde(default)]
    pub patrolled: bool,
    pub oldlen: Option<i64>,
    pub newlen: Option<i64>,
    pub timestamp: String,
    pub comment: Option<String>,
    pub logid: Option<i64>,
    pub logtype: Option<String>,
    pub logaction: Option<String>,
    pub logparams: Option<Value>,
    #[serde(default)]
    pub sha1hidden: bool,
    #[serde(default)]
    pub actionhidden: bool,
    #[serde(default)]
    pub commenthidden: bool,
    #[serde(default)]
    pub userhidden: bool,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RemoteRecentChange {
    pub fn deleted_flags(&self) -> DeletedFlags {
        DeletedFlags::from_hidden(
            self.sha1hidden || self.actionhidden,
            self.commenthidden,
            self.userhidden,
            self.suppressed,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteLogEvent {
    pub logid: i64,
    #[serde(rename = "type")]
    pub log_type: String,
    pub action: String,
    pub ns: Option<i64>,
    pub title: Option<String>,
    pub pageid: Option<i64>,
    pub logpage: Option<i64>,
    #[serde(default)]
    pub params: Value,
    pub user: Option<String>,
    pub userid: Option<i64>,
    pub timestamp: String,
    pub comment: Option<String>,
    #[serde(default)]
    pub actionhidden: bool,
    #[serde(default)]
    pub commenthidden: bool,
    #[serde(default)]
    pub userhidden: bool,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RemoteLogEvent {
    pub fn deleted_flags(&self) -> DeletedFlags {
        DeletedFlags::from_hidden(
            self.actionhidden,
            self.commenthidden,
            self.userhidden,
            self.suppressed,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteUser {
    pub userid: Option<i64>,
    pub name: String,
    pub registration: Option<String>,
    pub editcount: Option<i64>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub groupmemberships: Vec<RemoteGroupMembership>,
    #[serde(default)]
    pub missing: bool,
    #[serde(default)]
    pub invalid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteGroupMembership {
    pub group: String,
    pub expiry: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteBlock {
    pub id: i64,
    pub user: String,
    pub userid: Option<i64>,
    pub by: String,
    pub byid: i64,
    pub timestamp: String,
    pub expiry: String,
    #[serde(default)]
    pub reason: String,
    pub rangestart: Option<String>,
    pub rangeend: Option<String>,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub anononly: bool,
    #[serde(default)]
    pub nocreate: bool,
    #[serde(default)]
    pub autoblock: bool,
    #[serde(default)]
    pub noemail: bool,
    #[serde(default)]
    pub allowusertalk: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemotePage {
    pub pageid: Option<i64>,
    pub ns: i64,
    pub title: String,
    #[serde(default)]
    pub missing: bool,
    pub contentmodel: Option<String>,
    pub pagelanguage: Option<String>,
    pub touched: Option<String>,
    pub lastrevid: Option<i64>,
    pub length: Option<i64>,
    #[serde(default)]
    pub redirect: bool,
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub protection: Vec<RemoteProtection>,
    #[serde(default)]
    pub pageprops: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteProtection {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub expiry: String,
    #[serde(default)]
    pub cascade: bool,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteProtectedTitle {
    pub ns: i64,
    pub title: String,
    pub level: String,
    pub expiry: String,
    #[serde(default)]
    pub timestamp: String,
    pub user: Option<String>,
    pub userid: Option<i64>,
    #[serde(default)]
    pub comment: String,
}

/// A revision flattened together with the page it was listed under.
#[derive(Debug, Clone, Default)]
pub struct RemoteRevision {
    pub pageid: Option<i64>,
    pub ns: i64,
    pub title: String,
    pub revid: i64,
    pub parentid: Option<i64>,
    pub timestamp: String,
    pub user: Option<String>,
    pub userid: Option<i64>,
    pub comment: Option<String>,
    pub minor: bool,
    pub size: Option<i64>,
    pub sha1: Option<String>,
    pub contentmodel: Option<String>,
    pub contentformat: Option<String>,
    pub content: Option<String>,
    pub deleted: DeletedFlags,
    pub tags: Vec<String>,
    /// Listed among the deleted revisions of its page.
    pub archived: bool,
}

#[derive(Debug, Clone)]
pub struct RevisionContent {
    pub revid: i64,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &crate::config::MirrorConfig) -> Self {
        Self {
            api_url: config.api_url().unwrap_or_default(),
            user_agent: config.user_agent(),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            bail!("wiki API URL is not configured (set [wiki] api_url or WIKI_API_URL)");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_json_get(&mut self, params: &[(String, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push((key.clone(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    /// Runs a query and follows `continue` until exhausted, collecting `query.<key>` items.
    fn query_continued(&mut self, params: &[(&str, String)], key: &str) -> Result<Vec<Value>> {
        let base = params
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect::<Vec<_>>();
        let mut continuation: Vec<(String, String)> = Vec::new();
        let mut items = Vec::new();

        loop {
            let mut request = base.clone();
            request.push(("action".to_string(), "query".to_string()));
            request.extend(continuation.iter().cloned());
            let payload = self.request_json_get(&request)?;

            if let Some(Value::Array(batch)) = payload.get("query").and_then(|query| query.get(key))
            {
                items.extend(batch.iter().cloned());
            }

            continuation = match payload.get("continue").and_then(Value::as_object) {
                Some(object) => object
                    .iter()
                    .map(|(name, value)| {
                        let value = match value {
                            Value::String(text) => text.clone(),
                            other => other.to_string(),
                        };
                        (name.clone(), value)
                    })
                    .collect(),
                None => break,
            };
        }

        Ok(items)
    }

    fn query_typed<T: DeserializeOwned>(
        &mut self,
        params: &[(&str, String)],
        key: &str,
    ) -> Result<Vec<T>> {
        let items = self.query_continued(params, key)?;
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .with_context(|| format!("failed to decode {key} API item"))
            })
            .collect()
    }

    fn revision_pages(&mut self, params: &[(&str, String)], key: &str) -> Result<Vec<RemoteRevision>> {
        let pages: Vec<RevisionPageItem> = self.query_typed(params, key)?;
        Ok(flatten_revision_pages(pages))
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_read_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

const REVISION_PROPS: &str = "ids|timestamp|flags|user|userid|comment|size|sha1|contentmodel|tags";

impl RemoteApi for MediaWikiClient {
    fn site_info(&mut self) -> Result<SiteInfo> {
        let payload = self.request_json_get(&[
            ("action".to_string(), "query".to_string()),
            ("meta".to_string(), "siteinfo".to_string()),
            ("siprop".to_string(), "namespaces|namespacealiases".to_string()),
        ])?;
        let query = payload.get("query").cloned().unwrap_or(Value::Null);
        serde_json::from_value(query).context("failed to decode siteinfo API response")
    }

    fn interwiki_map(&mut self) -> Result<Vec<RemoteInterwiki>> {
        let payload = self.request_json_get(&[
            ("action".to_string(), "query".to_string()),
            ("meta".to_string(), "siteinfo".to_string()),
            ("siprop".to_string(), "interwikimap".to_string()),
        ])?;
        let map = payload
            .get("query")
            .and_then(|query| query.get("interwikimap"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(map).context("failed to decode interwikimap API response")
    }

    fn tags(&mut self) -> Result<Vec<RemoteTag>> {
        self.query_typed(
            &[
                ("list", "tags".to_string()),
                ("tglimit", "max".to_string()),
                (
                    "tgprop",
                    "displayname|description|defined|active|source".to_string(),
                ),
            ],
            "tags",
        )
    }

    fn recent_changes(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRecentChange>> {
        let mut params = vec![
            ("list", "recentchanges".to_string()),
            (
                "rcprop",
                "user|userid|comment|flags|timestamp|title|ids|sizes|redirect|patrolled|loginfo|tags|sha1"
                    .to_string(),
            ),
            ("rcdir", "newer".to_string()),
            ("rclimit", "max".to_string()),
        ];
        if let Some(since) = since {
            params.push(("rcstart", format_timestamp(since)));
        }
        let mut items: Vec<RemoteRecentChange> = self.query_typed(&params, "recentchanges")?;
        if let Some(since) = since {
            let since = format_timestamp(since);
            items.retain(|item| item.timestamp > since);
        }
        Ok(items)
    }

    fn recent_changes_bounds(&mut self) -> Result<Option<FeedBounds>> {
        let mut edge = |dir: &str| -> Result<Option<String>> {
            let payload = self.request_json_get(&[
                ("action".to_string(), "query".to_string()),
                ("list".to_string(), "recentchanges".to_string()),
                ("rcprop".to_string(), "timestamp".to_string()),
                ("rcdir".to_string(), dir.to_string()),
                ("rclimit".to_string(), "1".to_string()),
            ])?;
            Ok(payload
                .pointer("/query/recentchanges/0/timestamp")
                .and_then(Value::as_str)
                .map(str::to_string))
        };
        let oldest = edge("newer")?;
        let newest = edge("older")?;
        match (oldest, newest) {
            (Some(oldest), Some(newest)) => Ok(Some(FeedBounds {
                oldest: crate::timestamp::parse_timestamp(&oldest)?,
                newest: crate::timestamp::parse_timestamp(&newest)?,
            })),
            _ => Ok(None),
        }
    }

    fn log_events(&mut self, query: &LogQuery) -> Result<Vec<RemoteLogEvent>> {
        let mut params = vec![
            ("list", "logevents".to_string()),
            (
                "leprop",
                "ids|title|type|user|userid|timestamp|comment|details|tags".to_string(),
            ),
            ("ledir", "newer".to_string()),
            ("lelimit", "max".to_string()),
        ];
        if let Some(since) = query.since {
            params.push(("lestart", format_timestamp(since)));
        }
        if let Some(log_type) = &query.log_type {
            params.push(("letype", log_type.clone()));
        }
        let mut items: Vec<RemoteLogEvent> = self.query_typed(&params, "logevents")?;
        if let Some(since) = query.since {
            let since = format_timestamp(since);
            items.retain(|item| item.timestamp > since);
        }
        Ok(items)
    }

    fn all_users(&mut self) -> Result<Vec<RemoteUser>> {
        self.query_typed(
            &[
                ("list", "allusers".to_string()),
                ("aulimit", "max".to_string()),
                ("auprop", "groups|groupmemberships|editcount|registration".to_string()),
            ],
            "allusers",
        )
    }

    fn users(&mut self, names: &[String]) -> Result<Vec<RemoteUser>> {
        let mut out = Vec::new();
        for batch in names.chunks(TITLE_BATCH) {
            let batch: Vec<RemoteUser> = self.query_typed(
                &[
                    ("list", "users".to_string()),
                    ("ususers", batch.join("|")),
                    ("usprop", "groups|groupmemberships|editcount|registration".to_string()),
                ],
                "users",
            )?;
            out.extend(batch);
        }
        Ok(out)
    }

    fn blocks(&mut self, query: &BlockQuery) -> Result<Vec<RemoteBlock>> {
        let mut base = vec![
            ("list", "blocks".to_string()),
            ("bklimit", "max".to_string()),
            (
                "bkprop",
                "id|user|userid|by|byid|timestamp|expiry|reason|range|flags".to_string(),
            ),
        ];
        if let Some(start) = query.start {
            base.push(("bkdir", "newer".to_string()));
            base.push(("bkstart", format_timestamp(start)));
        }
        if query.users.is_empty() {
            return self.query_typed(&base, "blocks");
        }
        let mut out = Vec::new();
        for batch in query.users.chunks(TITLE_BATCH) {
            let mut params = base.clone();
            params.push(("bkusers", batch.join("|")));
            let blocks: Vec<RemoteBlock> = self.query_typed(&params, "blocks")?;
            out.extend(blocks);
        }
        Ok(out)
    }

    fn all_pages(&mut self) -> Result<Vec<RemotePage>> {
        let namespaces = self
            .site_info()?
            .namespaces
            .values()
            .map(|namespace| namespace.id)
            .filter(|id| *id >= 0)
            .collect::<Vec<_>>();
        let mut out = Vec::new();
        for namespace in namespaces {
            let pages: Vec<RemotePage> = self.query_typed(
                &[
                    ("generator", "allpages".to_string()),
                    ("gapnamespace", namespace.to_string()),
                    ("gaplimit", "max".to_string()),
                    ("prop", "info|pageprops".to_string()),
                    ("inprop", "protection".to_string()),
                ],
                "pages",
            )?;
            out.extend(pages);
        }
        Ok(out)
    }

    fn pages(&mut self, selector: &PageSelector) -> Result<Vec<RemotePage>> {
        let (key, values) = selector_values(selector);
        let mut out = Vec::new();
        for batch in values.chunks(TITLE_BATCH) {
            let pages: Vec<RemotePage> = self.query_typed(
                &[
                    (key, batch.join("|")),
                    ("prop", "info|pageprops".to_string()),
                    ("inprop", "protection".to_string()),
                ],
                "pages",
            )?;
            out.extend(pages);
        }
        Ok(out)
    }

    fn protected_titles(&mut self) -> Result<Vec<RemoteProtectedTitle>> {
        self.query_typed(
            &[
                ("list", "protectedtitles".to_string()),
                ("ptlimit", "max".to_string()),
                ("ptprop", "timestamp|user|userid|comment|level|expiry".to_string()),
            ],
            "protectedtitles",
        )
    }

    fn all_revisions(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteRevision>> {
        let mut params = vec![
            ("list", "allrevisions".to_string()),
            ("arvprop", REVISION_PROPS.to_string()),
            ("arvslots", "main".to_string()),
            ("arvlimit", "max".to_string()),
            ("arvdir", "newer".to_string()),
        ];
        if let Some(since) = since {
            params.push(("arvstart", format_timestamp(since)));
        }
        let mut revisions = self.revision_pages(&params, "allrevisions")?;
        if let Some(since) = since {
            let since = format_timestamp(since);
            revisions.retain(|revision| revision.timestamp > since);
        }
        Ok(revisions)
    }

    fn all_deleted_revisions(&mut self) -> Result<Vec<RemoteRevision>> {
        let mut revisions = self.revision_pages(
            &[
                ("list", "alldeletedrevisions".to_string()),
                ("adrprop", REVISION_PROPS.to_string()),
                ("adrslots", "main".to_string()),
                ("adrlimit", "max".to_string()),
            ],
            "alldeletedrevisions",
        )?;
        for revision in &mut revisions {
            revision.archived = true;
        }
        Ok(revisions)
    }

    fn deleted_revisions(&mut self, titles: &[String]) -> Result<Vec<RemoteRevision>> {
        let mut out = Vec::new();
        for batch in titles.chunks(TITLE_BATCH) {
            let pages: Vec<HistoryPageItem> = self.query_typed(
                &[
                    ("titles", batch.join("|")),
                    ("prop", "deletedrevisions".to_string()),
                    ("drvprop", REVISION_PROPS.to_string()),
                    ("drvslots", "main".to_string()),
                    ("drvlimit", "max".to_string()),
                ],
                "pages",
            )?;
            for page in pages {
                out.extend(page.flatten(true));
            }
        }
        Ok(out)
    }

    fn page_history(&mut self, selector: &PageSelector) -> Result<Vec<RemoteRevision>> {
        let (key, values) = selector_values(selector);
        let mut out = Vec::new();
        for value in values {
            let pages: Vec<HistoryPageItem> = self.query_typed(
                &[
                    (key, value),
                    ("prop", "revisions|deletedrevisions".to_string()),
                    ("rvprop", REVISION_PROPS.to_string()),
                    ("rvslots", "main".to_string()),
                    ("rvlimit", "max".to_string()),
                    ("rvdir", "newer".to_string()),
                    ("drvprop", REVISION_PROPS.to_string()),
                    ("drvslots", "main".to_string()),
                    ("drvlimit", "max".to_string()),
                    ("drvdir", "newer".to_string()),
                ],
                "pages",
            )?;
            for page in pages {
                out.extend(page.flatten(false));
                out.extend(page.flatten(true));
            }
        }
        Ok(out)
    }

    fn revision_contents(&mut self, revids: &[i64]) -> Result<Vec<RevisionContent>> {
        let mut out = Vec::new();
        for batch in revids.chunks(TITLE_BATCH) {
            let ids = batch
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            let pages: Vec<RevisionPageItem> = self.query_typed(
                &[
                    ("revids", ids),
                    ("prop", "revisions".to_string()),
                    ("rvprop", "ids|content".to_string()),
                    ("rvslots", "main".to_string()),
                ],
                "pages",
            )?;
            for revision in flatten_revision_pages(pages) {
                if let Some(content) = revision.content {
                    out.push(RevisionContent {
                        revid: revision.revid,
                        content,
                    });
                }
            }
        }
        Ok(out)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct RevisionPageItem {
    pageid: Option<i64>,
    ns: i64,
    title: String,
    #[serde(default)]
    revisions: Vec<RevisionItem>,
}

#[derive(Debug, Deserialize)]
struct HistoryPageItem {
    pageid: Option<i64>,
    ns: i64,
    title: String,
    #[serde(default)]
    revisions: Vec<RevisionItem>,
    #[serde(default)]
    deletedrevisions: Vec<RevisionItem>,
}

impl HistoryPageItem {
    fn flatten(&self, deleted: bool) -> Vec<RemoteRevision> {
        let source = if deleted {
            &self.deletedrevisions
        } else {
            &self.revisions
        };
        source
            .iter()
            .map(|item| RemoteRevision {
                archived: deleted,
                ..item.to_remote(self.pageid, self.ns, &self.title)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RevisionItem {
    revid: i64,
    parentid: Option<i64>,
    timestamp: String,
    user: Option<String>,
    userid: Option<i64>,
    comment: Option<String>,
    #[serde(default)]
    minor: bool,
    size: Option<i64>,
    sha1: Option<String>,
    contentmodel: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    sha1hidden: bool,
    #[serde(default)]
    texthidden: bool,
    #[serde(default)]
    commenthidden: bool,
    #[serde(default)]
    userhidden: bool,
    #[serde(default)]
    suppressed: bool,
    slots: Option<RevisionSlots>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlots {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    contentmodel: Option<String>,
    contentformat: Option<String>,
    content: Option<String>,
}

impl RevisionItem {
    fn to_remote(&self, pageid: Option<i64>, ns: i64, title: &str) -> RemoteRevision {
        let main = self.slots.as_ref().and_then(|slots| slots.main.as_ref());
        RemoteRevision {
            pageid,
            ns,
            title: title.to_string(),
            revid: self.revid,
            parentid: self.parentid,
            timestamp: self.timestamp.clone(),
            user: self.user.clone(),
            userid: self.userid,
            comment: self.comment.clone(),
            minor: self.minor,
            size: self.size,
            sha1: self.sha1.clone(),
            contentmodel: main
                .and_then(|slot| slot.contentmodel.clone())
                .or_else(|| self.contentmodel.clone()),
            contentformat: main.and_then(|slot| slot.contentformat.clone()),
            content: main.and_then(|slot| slot.content.clone()),
            deleted: DeletedFlags::from_hidden(
                self.sha1hidden || self.texthidden,
                self.commenthidden,
                self.userhidden,
                self.suppressed,
            ),
            tags: self.tags.clone(),
            archived: false,
        }
    }
}

fn flatten_revision_pages(pages: Vec<RevisionPageItem>) -> Vec<RemoteRevision> {
    let mut out = Vec::new();
    for page in pages {
        for item in &page.revisions {
            out.push(item.to_remote(page.pageid, page.ns, &page.title));
        }
    }
    out
}

fn selector_values(selector: &PageSelector) -> (&'static str, Vec<String>) {
    match selector {
        PageSelector::Ids(ids) => (
            "pageids",
            ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        ),
        PageSelector::Titles(titles) => ("titles", titles.clone()),
    }
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{HistoryPageItem, RemoteLogEvent, RemoteRecentChange, SiteInfo, flatten_revision_pages};

    #[test]
    fn decodes_recentchange_with_hidden_flags() {
        let item: RemoteRecentChange = serde_json::from_value(json!({
            "rcid": 7,
            "type": "edit",
            "ns": 0,
            "title": "Main Page",
            "pageid": 1,
            "revid": 20,
            "old_revid": 19,
            "userhidden": true,
            "suppressed": true,
            "timestamp": "2024-01-01T00:00:00Z",
            "tags": ["mw-undo"]
        }))
        .expect("decode");
        assert_eq!(item.kind, "edit");
        assert_eq!(item.deleted_flags().bits(), 4 | 8);
        assert_eq!(item.tags, vec!["mw-undo".to_string()]);
    }

    #[test]
    fn decodes_log_event_params() {
        let item: RemoteLogEvent = serde_json::from_value(json!({
            "logid": 3,
            "type": "move",
            "action": "move",
            "ns": 0,
            "title": "A",
            "logpage": 5,
            "params": {"target_ns": 0, "target_title": "B"},
            "timestamp": "2024-01-01T00:00:00Z",
            "commenthidden": true
        }))
        .expect("decode");
        assert_eq!(item.params["target_title"], "B");
        assert_eq!(item.deleted_flags().bits(), 2);
    }

    #[test]
    fn decodes_namespaces_keyed_by_id() {
        let info: SiteInfo = serde_json::from_value(json!({
            "namespaces": {
                "0": {"id": 0, "case": "first-letter", "name": "", "content": true},
                "10": {"id": 10, "case": "first-letter", "name": "Template", "canonical": "Template"}
            },
            "namespacealiases": [{"id": 6, "alias": "Image"}]
        }))
        .expect("decode");
        assert_eq!(info.namespaces.len(), 2);
        assert!(info.namespaces["0"].content);
        assert_eq!(info.namespace_aliases[0].alias, "Image");
    }

    #[test]
    fn flattens_revision_pages_with_main_slot() {
        let pages = serde_json::from_value(json!([{
            "pageid": 4,
            "ns": 0,
            "title": "A",
            "revisions": [
                {"revid": 1, "parentid": 0, "timestamp": "2024-01-01T00:00:00Z",
                 "slots": {"main": {"contentmodel": "wikitext", "contentformat": "text/x-wiki", "content": "x"}}},
                {"revid": 2, "parentid": 1, "timestamp": "2024-01-02T00:00:00Z", "texthidden": true}
            ]
        }]))
        .expect("decode");
        let revisions = flatten_revision_pages(pages);
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].content.as_deref(), Some("x"));
        assert_eq!(revisions[0].contentmodel.as_deref(), Some("wikitext"));
        assert!(revisions[1].deleted.text_hidden());
        assert_eq!(revisions[1].title, "A");
    }

    #[test]
    fn history_page_splits_live_and_deleted() {
        let page: HistoryPageItem = serde_json::from_value(json!({
            "ns": 0,
            "title": "Gone",
            "missing": true,
            "deletedrevisions": [{"revid": 9, "timestamp": "2024-01-01T00:00:00Z"}]
        }))
        .expect("decode");
        assert!(page.flatten(false).is_empty());
        assert_eq!(page.flatten(true)[0].revid, 9);
    }
}
