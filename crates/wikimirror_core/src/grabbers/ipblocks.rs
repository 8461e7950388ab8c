use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::api::{BlockQuery, RemoteBlock};
use crate::changefeed::ChangeFeed;
use crate::row;
use crate::timestamp::{INFINITY, format_timestamp, normalize_expiry, normalize_timestamp};

const UPSERT_BLOCK: &str = "INSERT INTO ipblocks
        (ipb_id, ipb_address, ipb_user, ipb_by, ipb_by_text, ipb_reason, ipb_timestamp, ipb_auto,
         ipb_anon_only, ipb_create_account, ipb_enable_autoblock, ipb_expiry, ipb_range_start,
         ipb_range_end, ipb_deleted, ipb_block_email, ipb_allow_usertalk, ipb_parent_block_id)
    VALUES (?1, ?2, (SELECT user_id FROM user WHERE user_id = ?3), ?4, ?5, ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16, ?17, NULL)
    ON CONFLICT(ipb_id) DO UPDATE SET
        ipb_address = excluded.ipb_address,
        ipb_user = excluded.ipb_user,
        ipb_reason = excluded.ipb_reason,
        ipb_anon_only = excluded.ipb_anon_only,
        ipb_create_account = excluded.ipb_create_account,
        ipb_enable_autoblock = excluded.ipb_enable_autoblock,
        ipb_expiry = excluded.ipb_expiry,
        ipb_deleted = excluded.ipb_deleted,
        ipb_block_email = excluded.ipb_block_email,
        ipb_allow_usertalk = excluded.ipb_allow_usertalk";
const DELETE_EXPIRED: &str = "DELETE FROM ipblocks WHERE ipb_expiry != ?1 AND ipb_expiry < ?2";
const DELETE_STALE_FOR_TARGET: &str = "DELETE FROM ipblocks
    WHERE ipb_address = ?1 AND ipb_id NOT IN (SELECT value FROM json_each(?2))";

/// Active blocks. Autoblocks are never mirrored.
pub struct IpBlocksGrabber;

impl IpBlocksGrabber {
    fn queue(ctx: &mut GrabContext<'_, '_>, block: &RemoteBlock) -> Result<()> {
        ctx.execute(
            UPSERT_BLOCK,
            row![
                block.id,
                block.user,
                block.userid.filter(|id| *id > 0),
                block.byid,
                block.by,
                block.reason,
                normalize_timestamp(&block.timestamp)?,
                block.automatic,
                block.anononly,
                block.nocreate,
                block.autoblock,
                normalize_expiry(&block.expiry)?,
                block.rangestart,
                block.rangeend,
                block.hidden,
                block.noemail,
                block.allowusertalk,
            ],
        )
    }
}

impl Grabber for IpBlocksGrabber {
    fn name(&self) -> &'static str {
        "GrabberIPBlocks"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &["ipblocks"]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        for block in ctx.api.blocks(&BlockQuery::default())? {
            if !block.automatic {
                Self::queue(ctx, &block)?;
            }
        }
        Ok(())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        ctx.execute(DELETE_EXPIRED, row![INFINITY, format_timestamp(ctx.now)])?;

        let mut blocks = ctx.api.blocks(&BlockQuery {
            start: Some(since),
            users: Vec::new(),
        })?;

        let targets = ChangeFeed::new(ctx.db())
            .log_events_since(Some(since), &["block"])?
            .into_iter()
            .map(|event| event.title)
            .filter(|title| !title.is_empty())
            .collect::<BTreeSet<_>>();
        if !targets.is_empty() {
            let refetched = ctx.api.blocks(&BlockQuery {
                start: None,
                users: targets.iter().cloned().collect(),
            })?;
            let mut live = targets
                .iter()
                .map(|target| (target.clone(), Vec::new()))
                .collect::<BTreeMap<_, Vec<i64>>>();
            for block in &refetched {
                live.entry(block.user.clone()).or_default().push(block.id);
            }
            for (target, ids) in live {
                ctx.execute(
                    DELETE_STALE_FOR_TARGET,
                    row![target, serde_json::to_string(&ids)?],
                )?;
            }
            blocks.extend(refetched);
        }

        for block in blocks.iter().filter(|block| !block.automatic) {
            Self::queue(ctx, block)?;
        }
        Ok(UpdateOutcome::CaughtUp)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::IpBlocksGrabber;
    use crate::api::RemoteBlock;
    use crate::grabbers::{GrabberRunner, LoggingGrabber, NamespacesGrabber, UsersGrabber};
    use crate::test_support::{SteppingClock, migrated_mirror, remote_log, sample_wiki, ts};

    fn block(id: i64, user: &str, userid: Option<i64>, timestamp: &str, expiry: &str) -> RemoteBlock {
        RemoteBlock {
            id,
            user: user.to_string(),
            userid,
            by: "Admin".to_string(),
            byid: 2,
            timestamp: timestamp.to_string(),
            expiry: expiry.to_string(),
            nocreate: true,
            autoblock: true,
            ..RemoteBlock::default()
        }
    }

    fn block_ids(connection: &rusqlite::Connection) -> Vec<i64> {
        connection
            .prepare("SELECT ipb_id FROM ipblocks ORDER BY ipb_id")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("ids")
    }

    #[test]
    fn update_purges_expired_and_refetches_logged_targets() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        api.blocks = vec![
            block(1, "Alice", Some(1), "2024-01-01T00:00:00Z", "infinity"),
            block(2, "192.0.2.1", None, "2024-01-01T00:00:00Z", "2024-01-20T00:00:00Z"),
            block(3, "198.51.100.7", None, "2024-01-01T00:00:00Z", "infinity"),
            RemoteBlock {
                automatic: true,
                ..block(4, "203.0.113.9", None, "2024-01-01T00:00:00Z", "infinity")
            },
        ];
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner.insert(&mut connection, &mut api, &mut UsersGrabber).expect("users");
        runner.insert(&mut connection, &mut api, &mut IpBlocksGrabber).expect("insert");
        assert_eq!(block_ids(&connection), vec![1, 2, 3]);

        // Alice is unblocked and a new block lands on Admin
        api.blocks.retain(|block| block.id != 1);
        api.blocks.push(block(5, "Admin", Some(2), "2024-01-10T00:00:00Z", "infinity"));
        let mut unblock = remote_log(50, "block", "unblock", "User:Alice", "2024-01-09T00:00:00Z", json!({}));
        unblock.ns = Some(2);
        let mut new_block = remote_log(51, "block", "block", "User:Admin", "2024-01-10T00:00:00Z", json!({}));
        new_block.ns = Some(2);
        api.log_events.extend([unblock, new_block]);
        runner.insert(&mut connection, &mut api, &mut LoggingGrabber).expect("logging");
        runner
            .update(
                &mut connection,
                &mut api,
                &mut IpBlocksGrabber,
                Some(ts("2024-01-05T00:00:00Z")),
            )
            .expect("update");

        // block 2 expired before the update ran
        assert_eq!(block_ids(&connection), vec![3, 5]);
        let target_user: Option<i64> = connection
            .query_row("SELECT ipb_user FROM ipblocks WHERE ipb_id = 5", [], |row| row.get(0))
            .expect("user");
        assert_eq!(target_user, Some(2));
    }
}
