//! Per-entity synchronization units.
//!
//! Every grabber knows how to rebuild its tables from scratch and how to
//! catch up incrementally from a sync point. [`GrabberRunner`] wraps both in
//! a single transaction and records the sync point in `ws_sync`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::api::RemoteApi;
use crate::execution::{DeferredQueue, Row};
use crate::timestamp::{Clock, format_timestamp, parse_timestamp};
use crate::title::TitleResolver;

mod content;
mod interwiki;
mod ipblocks;
mod logging;
mod namespaces;
mod pages;
mod protected_titles;
mod recentchanges;
mod revisions;
mod tags;
mod usermerge;
mod users;

pub use content::{ContentReport, sync_revision_content};
pub use interwiki::InterwikiGrabber;
pub use ipblocks::IpBlocksGrabber;
pub use logging::LoggingGrabber;
pub use namespaces::NamespacesGrabber;
pub use pages::PagesGrabber;
pub use protected_titles::ProtectedTitlesGrabber;
pub use recentchanges::RecentChangesGrabber;
pub use revisions::RevisionsGrabber;
pub use tags::TagsGrabber;
pub use usermerge::UserMergeGrabber;
pub use users::UsersGrabber;

/// Outcome of an incremental pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    CaughtUp,
    /// The change feed no longer reaches back to the sync point.
    NeedsRebuild { oldest: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabMode {
    Insert,
    Update,
    /// An update that fell back to a full insert.
    Rebuild,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrabReport {
    pub grabber: String,
    pub mode: GrabMode,
    pub rows: usize,
    pub sync_point: String,
}

/// State shared with a grabber for the duration of one run.
pub struct GrabContext<'a, 'conn> {
    queue: DeferredQueue<'conn>,
    pub api: &'a mut dyn RemoteApi,
    pub titles: TitleResolver,
    /// Wall-clock time captured when the run started.
    pub now: DateTime<Utc>,
}

impl<'a, 'conn> GrabContext<'a, 'conn> {
    pub fn new(
        connection: &'conn Connection,
        api: &'a mut dyn RemoteApi,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            queue: DeferredQueue::new(connection, batch_size)?,
            api,
            titles: TitleResolver::load(connection)?,
            now,
        })
    }

    pub fn db(&self) -> &'conn Connection {
        self.queue.connection()
    }

    pub fn execute(&mut self, statement: &str, row: Row) -> Result<()> {
        self.queue.execute(statement, row)
    }

    /// Makes every queued write visible to subsequent reads.
    pub fn flush(&mut self) -> Result<()> {
        self.queue.flush()
    }

    /// Runs a statement immediately, after everything queued before it.
    pub fn execute_now(&mut self, statement: &str, row: Row) -> Result<usize> {
        self.queue.flush()?;
        let connection = self.queue.connection();
        connection
            .execute(statement, rusqlite::params_from_iter(row.iter()))
            .with_context(|| format!("failed to execute statement: {statement}"))
    }

    pub fn reload_titles(&mut self) -> Result<()> {
        self.flush()?;
        self.titles = TitleResolver::load(self.queue.connection())?;
        Ok(())
    }

    fn finish(self) -> Result<usize> {
        self.queue.finish()
    }

    fn discard(self) -> usize {
        self.queue.discard()
    }
}

pub trait Grabber {
    /// Stable key used for the sync point.
    fn name(&self) -> &'static str;

    /// Tables emptied before a full rebuild.
    fn predelete_tables(&self) -> &'static [&'static str] {
        &[]
    }

    /// Hook run inside the rebuild transaction before the pre-delete.
    fn prepare_rebuild(&mut self, _connection: &Connection) -> Result<()> {
        Ok(())
    }

    /// Emits the current remote state, assuming the target tables are empty.
    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()>;

    /// Emits the changes since `since`.
    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome>;
}

/// Runs grabbers inside one transaction each and maintains their sync points.
pub struct GrabberRunner<'c> {
    clock: &'c dyn Clock,
    batch_size: usize,
}

impl<'c> GrabberRunner<'c> {
    pub fn new(clock: &'c dyn Clock, batch_size: usize) -> Self {
        Self { clock, batch_size }
    }

    pub fn insert(
        &self,
        connection: &mut Connection,
        api: &mut dyn RemoteApi,
        grabber: &mut dyn Grabber,
    ) -> Result<GrabReport> {
        self.run_insert(connection, api, grabber, GrabMode::Insert)
    }

    pub fn update(
        &self,
        connection: &mut Connection,
        api: &mut dyn RemoteApi,
        grabber: &mut dyn Grabber,
        since: Option<DateTime<Utc>>,
    ) -> Result<GrabReport> {
        let started = self.clock.now();
        let since = match since {
            Some(since) => since,
            None => match sync_point(connection, grabber.name())? {
                Some(since) => since,
                None => return self.run_insert(connection, api, grabber, GrabMode::Insert),
            },
        };

        tracing::info!(grabber = grabber.name(), since = %format_timestamp(since), "updating");
        let transaction = connection
            .transaction()
            .context("failed to start grabber transaction")?;
        let mut ctx = GrabContext::new(&transaction, api, self.batch_size, started)?;
        match grabber
            .gen_update(&mut ctx, since)
            .with_context(|| format!("{} update failed", grabber.name()))?
        {
            UpdateOutcome::CaughtUp => {
                let rows = ctx.finish()?;
                set_sync_point(&transaction, grabber.name(), started)?;
                transaction
                    .commit()
                    .context("failed to commit grabber transaction")?;
                tracing::info!(grabber = grabber.name(), rows, "update finished");
                Ok(GrabReport {
                    grabber: grabber.name().to_string(),
                    mode: GrabMode::Update,
                    rows,
                    sync_point: format_timestamp(started),
                })
            }
            UpdateOutcome::NeedsRebuild { oldest } => {
                let dropped = ctx.discard();
                transaction
                    .rollback()
                    .context("failed to roll back grabber transaction")?;
                tracing::warn!(
                    grabber = grabber.name(),
                    oldest = ?oldest.map(format_timestamp),
                    dropped,
                    "recent changes no longer cover the last sync, rebuilding from scratch"
                );
                self.run_insert(connection, api, grabber, GrabMode::Rebuild)
            }
        }
    }

    fn run_insert(
        &self,
        connection: &mut Connection,
        api: &mut dyn RemoteApi,
        grabber: &mut dyn Grabber,
        mode: GrabMode,
    ) -> Result<GrabReport> {
        let started = self.clock.now();
        tracing::info!(grabber = grabber.name(), "rebuilding");
        let transaction = connection
            .transaction()
            .context("failed to start grabber transaction")?;
        grabber.prepare_rebuild(&transaction)?;
        for table in grabber.predelete_tables() {
            transaction
                .execute(&format!("DELETE FROM {table}"), [])
                .with_context(|| format!("failed to clear {table}"))?;
        }

        let mut ctx = GrabContext::new(&transaction, api, self.batch_size, started)?;
        grabber
            .gen_insert(&mut ctx)
            .with_context(|| format!("{} insert failed", grabber.name()))?;
        let rows = ctx.finish()?;
        set_sync_point(&transaction, grabber.name(), started)?;
        transaction
            .commit()
            .context("failed to commit grabber transaction")?;
        tracing::info!(grabber = grabber.name(), rows, "rebuild finished");

        Ok(GrabReport {
            grabber: grabber.name().to_string(),
            mode,
            rows,
            sync_point: format_timestamp(started),
        })
    }
}

pub fn sync_point(connection: &Connection, key: &str) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> = connection
        .query_row(
            "SELECT wss_timestamp FROM ws_sync WHERE wss_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read sync point for {key}"))?;
    value.as_deref().map(parse_timestamp).transpose()
}

fn set_sync_point(connection: &Connection, key: &str, timestamp: DateTime<Utc>) -> Result<()> {
    connection
        .execute(
            "INSERT INTO ws_sync (wss_key, wss_timestamp) VALUES (?1, ?2)
             ON CONFLICT(wss_key) DO UPDATE SET wss_timestamp = excluded.wss_timestamp",
            params![key, format_timestamp(timestamp)],
        )
        .with_context(|| format!("failed to store sync point for {key}"))?;
    Ok(())
}

/// The fixed dependency order used by a full synchronization.
pub fn default_grabbers(with_content: bool) -> Vec<Box<dyn Grabber>> {
    vec![
        Box::new(NamespacesGrabber),
        Box::new(TagsGrabber),
        Box::new(RecentChangesGrabber),
        Box::new(UsersGrabber),
        Box::new(LoggingGrabber),
        Box::new(UserMergeGrabber),
        Box::new(InterwikiGrabber),
        Box::new(IpBlocksGrabber),
        Box::new(PagesGrabber::default()),
        Box::new(ProtectedTitlesGrabber),
        Box::new(RevisionsGrabber::new(with_content)),
    ]
}

/// Looks a grabber up by its sync key or a short alias.
pub fn grabber_by_name(name: &str, with_content: bool) -> Option<Box<dyn Grabber>> {
    let wanted = name.to_ascii_lowercase().replace(['-', '_'], "");
    default_grabbers(with_content).into_iter().find(|grabber| {
        let key = grabber.name().to_ascii_lowercase();
        let short = key.trim_start_matches("grabber");
        [key.as_str(), short]
            .iter()
            .any(|candidate| candidate.trim_end_matches('s') == wanted.trim_end_matches('s'))
    })
}

// Tag associations are keyed by tag name; unknown tags are skipped.
pub(crate) const TAG_RECENTCHANGE: &str = "INSERT INTO tagged_recentchange (tgrc_tag_id, tgrc_rc_id)
    SELECT tag_id, ?1 FROM tag WHERE tag_name = ?2 ON CONFLICT DO NOTHING";
pub(crate) const TAG_LOGEVENT: &str = "INSERT INTO tagged_logevent (tgle_tag_id, tgle_log_id)
    SELECT tag_id, ?1 FROM tag WHERE tag_name = ?2 ON CONFLICT DO NOTHING";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SteppingClock, count, migrated_mirror, sample_wiki, ts};

    struct CountingGrabber {
        inserts: usize,
        outcome: UpdateOutcome,
    }

    impl Grabber for CountingGrabber {
        fn name(&self) -> &'static str {
            "Counting"
        }

        fn predelete_tables(&self) -> &'static [&'static str] {
            &["tag"]
        }

        fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
            self.inserts += 1;
            ctx.execute(
                "INSERT INTO tag (tag_name, tag_displayname) VALUES (?1, ?1)",
                crate::row![format!("t{}", self.inserts)],
            )
        }

        fn gen_update(
            &mut self,
            ctx: &mut GrabContext<'_, '_>,
            _since: DateTime<Utc>,
        ) -> Result<UpdateOutcome> {
            ctx.execute(
                "INSERT INTO tag (tag_name, tag_displayname) VALUES (?1, ?1)",
                crate::row!["from-update"],
            )?;
            Ok(self.outcome)
        }
    }

    #[test]
    fn first_update_without_sync_point_runs_insert() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        let mut grabber = CountingGrabber {
            inserts: 0,
            outcome: UpdateOutcome::CaughtUp,
        };
        let report = runner
            .update(&mut connection, &mut api, &mut grabber, None)
            .expect("update");
        assert_eq!(report.mode, GrabMode::Insert);
        assert_eq!(grabber.inserts, 1);
        assert_eq!(
            sync_point(&connection, "Counting").expect("sync point"),
            Some(clock.reading(1))
        );
    }

    #[test]
    fn needs_rebuild_discards_partial_update() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        let mut grabber = CountingGrabber {
            inserts: 0,
            outcome: UpdateOutcome::NeedsRebuild { oldest: None },
        };
        let report = runner
            .update(
                &mut connection,
                &mut api,
                &mut grabber,
                Some(ts("2024-01-01T00:00:00Z")),
            )
            .expect("update");
        assert_eq!(report.mode, GrabMode::Rebuild);
        assert_eq!(grabber.inserts, 1);
        assert_eq!(count(&connection, "tag"), 1);
        let leaked: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM tag WHERE tag_name = 'from-update'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(leaked, 0);
        // reading 0 is the abandoned update, reading 1 the rebuild start
        assert_eq!(
            sync_point(&connection, "Counting").expect("sync point"),
            Some(clock.reading(1))
        );
    }

    #[test]
    fn failed_run_leaves_no_partial_writes() {
        struct Failing;
        impl Grabber for Failing {
            fn name(&self) -> &'static str {
                "Failing"
            }
            fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
                ctx.execute(
                    "INSERT INTO tag (tag_name, tag_displayname) VALUES (?1, ?1)",
                    crate::row!["partial"],
                )?;
                ctx.flush()?;
                anyhow::bail!("remote went away")
            }
            fn gen_update(
                &mut self,
                _ctx: &mut GrabContext<'_, '_>,
                _since: DateTime<Utc>,
            ) -> Result<UpdateOutcome> {
                Ok(UpdateOutcome::CaughtUp)
            }
        }

        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        let error = runner
            .insert(&mut connection, &mut api, &mut Failing)
            .expect_err("insert fails");
        assert!(format!("{error:#}").contains("remote went away"));
        assert_eq!(count(&connection, "tag"), 0);
        assert_eq!(sync_point(&connection, "Failing").expect("sync point"), None);
    }

    #[test]
    fn finds_grabbers_by_alias() {
        assert_eq!(
            grabber_by_name("pages", false).map(|grabber| grabber.name()),
            Some("GrabberPages")
        );
        assert_eq!(
            grabber_by_name("protected-titles", false).map(|grabber| grabber.name()),
            Some("GrabberProtectedTitles")
        );
        assert!(grabber_by_name("nope", false).is_none());
    }
}
