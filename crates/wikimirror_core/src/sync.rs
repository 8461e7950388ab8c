use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::api::RemoteApi;
use crate::config::{ContentMode, MirrorConfig};
use crate::grabbers::{
    ContentReport, GrabReport, GrabberRunner, default_grabbers, grabber_by_name,
    sync_revision_content,
};
use crate::link_cache::{LinkCache, LinkCacheReport};
use crate::timestamp::{Clock, format_timestamp, parse_timestamp};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub with_content: bool,
    pub content_mode: ContentMode,
    pub update_link_cache: bool,
    pub content_cache_capacity: usize,
    /// Run the grabbers even when the remote has nothing newer.
    pub force: bool,
}

impl SyncOptions {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            batch_size: config.batch_size(),
            with_content: config.sync.with_content,
            content_mode: config.sync.content_mode,
            update_link_cache: config.sync.update_link_cache,
            content_cache_capacity: config.link_cache.content_cache_capacity,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Set when the staleness pre-check skipped the grabbers.
    pub up_to_date: bool,
    pub remote_newest: Option<String>,
    pub local_newest: Option<String>,
    pub grabbers: Vec<GrabReport>,
    pub content: Option<ContentReport>,
    pub link_cache: Option<LinkCacheReport>,
    pub request_count: usize,
}

/// Result of comparing the remote change feed with the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing has been synchronized yet.
    Empty,
    Behind {
        remote_newest: DateTime<Utc>,
        local_newest: Option<DateTime<Utc>>,
    },
    UpToDate {
        remote_newest: Option<DateTime<Utc>>,
        local_newest: Option<DateTime<Utc>>,
    },
}

pub fn check_freshness(connection: &Connection, api: &mut dyn RemoteApi) -> Result<Freshness> {
    let synced: i64 = connection
        .query_row("SELECT COUNT(*) FROM ws_sync", [], |row| row.get(0))
        .context("failed to count sync points")?;
    if synced == 0 {
        return Ok(Freshness::Empty);
    }

    let local_newest = connection
        .query_row("SELECT MAX(rc_timestamp) FROM recentchanges", [], |row| {
            row.get::<_, Option<String>>(0)
        })
        .context("failed to read newest mirrored recent change")?
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    let remote_newest = api.recent_changes_bounds()?.map(|bounds| bounds.newest);

    Ok(match remote_newest {
        Some(remote) if local_newest.is_none_or(|local| remote > local) => Freshness::Behind {
            remote_newest: remote,
            local_newest,
        },
        _ => Freshness::UpToDate {
            remote_newest,
            local_newest,
        },
    })
}

/// Runs every grabber in dependency order, then the optional content and
/// link-cache passes.
pub fn sync_mirror(
    connection: &mut Connection,
    api: &mut dyn RemoteApi,
    clock: &dyn Clock,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let freshness = check_freshness(connection, api)?;
    let (remote_newest, local_newest) = match freshness {
        Freshness::Empty => (None, None),
        Freshness::Behind {
            remote_newest,
            local_newest,
        } => (Some(remote_newest), local_newest),
        Freshness::UpToDate {
            remote_newest,
            local_newest,
        } => (remote_newest, local_newest),
    };
    let mut report = SyncReport {
        up_to_date: false,
        remote_newest: remote_newest.map(format_timestamp),
        local_newest: local_newest.map(format_timestamp),
        grabbers: Vec::new(),
        content: None,
        link_cache: None,
        request_count: 0,
    };

    if matches!(freshness, Freshness::UpToDate { .. }) && !options.force {
        tracing::info!(
            remote_newest = ?report.remote_newest,
            local_newest = ?report.local_newest,
            "mirror is up to date"
        );
        report.up_to_date = true;
        report.request_count = api.request_count();
        return Ok(report);
    }

    let runner = GrabberRunner::new(clock, options.batch_size);
    let inline_content = options.with_content && options.content_mode == ContentMode::All;
    for mut grabber in default_grabbers(inline_content) {
        let grab = runner
            .update(connection, api, grabber.as_mut(), None)
            .with_context(|| format!("failed to synchronize {}", grabber.name()))?;
        report.grabbers.push(grab);
    }

    if options.with_content {
        report.content = Some(sync_revision_content(
            connection,
            api,
            options.content_mode,
            options.batch_size,
        )?);
    }
    if options.update_link_cache {
        let mut cache = LinkCache::new(options.content_cache_capacity);
        report.link_cache = Some(cache.update(connection)?);
    }

    report.request_count = api.request_count();
    Ok(report)
}

/// Runs a single grabber by name. `rebuild` forces a full insert.
pub fn grab_one(
    connection: &mut Connection,
    api: &mut dyn RemoteApi,
    clock: &dyn Clock,
    name: &str,
    rebuild: bool,
    options: &SyncOptions,
) -> Result<GrabReport> {
    let Some(mut grabber) = grabber_by_name(name, options.with_content) else {
        bail!("unknown grabber '{name}'");
    };
    let runner = GrabberRunner::new(clock, options.batch_size);
    if rebuild {
        runner.insert(connection, api, grabber.as_mut())
    } else {
        runner.update(connection, api, grabber.as_mut(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grabbers::{GrabMode, UsersGrabber, sync_point};
    use crate::test_support::{
        SteppingClock, count, migrated_mirror, remote_rc, sample_wiki, snapshot, ts,
    };

    fn options() -> SyncOptions {
        SyncOptions {
            batch_size: 10,
            with_content: true,
            content_mode: ContentMode::Latest,
            update_link_cache: true,
            content_cache_capacity: 16,
            force: false,
        }
    }

    #[test]
    fn update_without_remote_changes_matches_a_second_insert() {
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let (_left_temp, mut updated) = migrated_mirror();
        let mut api = sample_wiki();
        let runner = GrabberRunner::new(&clock, 10);
        for mut grabber in default_grabbers(false) {
            runner
                .insert(&mut updated, &mut api, grabber.as_mut())
                .expect("insert");
        }
        for mut grabber in default_grabbers(false) {
            let report = runner
                .update(&mut updated, &mut api, grabber.as_mut(), None)
                .expect("update");
            assert_eq!(report.mode, GrabMode::Update, "{}", report.grabber);
        }

        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let (_right_temp, mut reinserted) = migrated_mirror();
        let runner = GrabberRunner::new(&clock, 10);
        for _ in 0..2 {
            for mut grabber in default_grabbers(false) {
                runner
                    .insert(&mut reinserted, &mut api, grabber.as_mut())
                    .expect("insert");
            }
        }

        assert_eq!(snapshot(&updated), snapshot(&reinserted));
    }

    #[test]
    fn short_feed_falls_back_to_one_rebuild() {
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let runner = GrabberRunner::new(&clock, 10);
        for mut grabber in default_grabbers(false) {
            runner
                .insert(&mut connection, &mut api, grabber.as_mut())
                .expect("insert");
        }
        let before = snapshot(&connection);
        api.calls.clear();
        let readings = clock.readings();

        let report = runner
            .update(
                &mut connection,
                &mut api,
                &mut UsersGrabber,
                Some(ts("2023-06-01T00:00:00Z")),
            )
            .expect("update");

        assert_eq!(report.mode, GrabMode::Rebuild);
        assert_eq!(api.calls_to("all_users"), 1);
        assert_eq!(api.calls_to("users"), 0);
        // the first reading belongs to the abandoned update
        let rebuild_start = clock.reading(readings + 1);
        assert_eq!(
            sync_point(&connection, "GrabberUsers").expect("sync point"),
            Some(rebuild_start)
        );
        assert_eq!(report.sync_point, format_timestamp(rebuild_start));
        let mut after = snapshot(&connection);
        let mut before = before;
        after.remove("ws_sync");
        before.remove("ws_sync");
        assert_eq!(after, before);
    }

    #[test]
    fn sync_runs_everything_then_skips_when_up_to_date() {
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();

        let first = sync_mirror(&mut connection, &mut api, &clock, &options()).expect("first sync");
        assert!(!first.up_to_date);
        assert_eq!(first.grabbers.len(), 11);
        assert!(first.grabbers.iter().all(|grab| grab.mode == GrabMode::Insert));
        assert_eq!(first.content.as_ref().map(|content| content.stored), Some(2));
        assert_eq!(first.link_cache.as_ref().map(|cache| cache.recomputed), Some(2));
        assert_eq!(count(&connection, "templatelinks"), 1);

        let before = api.calls.len();
        let second = sync_mirror(&mut connection, &mut api, &clock, &options()).expect("second sync");
        assert!(second.up_to_date);
        assert!(second.grabbers.is_empty());
        assert_eq!(second.remote_newest.as_deref(), Some("2024-01-02T00:00:00Z"));
        assert_eq!(api.calls[before..], ["recent_changes_bounds".to_string()]);

        let mut edit = remote_rc(4, "edit", 0, "Main Page", "2024-01-03T00:00:00Z");
        edit.pageid = Some(1);
        edit.revid = Some(11);
        edit.old_revid = Some(10);
        api.recent_changes.push(edit);
        let third = sync_mirror(&mut connection, &mut api, &clock, &options()).expect("third sync");
        assert!(!third.up_to_date);
        assert!(third.grabbers.iter().all(|grab| grab.mode == GrabMode::Update));
    }

    #[test]
    fn grab_one_rejects_unknown_names() {
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let error = grab_one(&mut connection, &mut api, &clock, "widgets", false, &options())
            .expect_err("unknown grabber");
        assert!(error.to_string().contains("widgets"));

        let report = grab_one(&mut connection, &mut api, &clock, "tags", true, &options())
            .expect("tags");
        assert_eq!(report.mode, GrabMode::Insert);
        assert_eq!(count(&connection, "tag"), 1);
    }
}
