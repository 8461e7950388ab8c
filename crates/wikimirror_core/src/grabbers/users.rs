use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::api::RemoteUser;
use crate::changefeed::{ChangeFeed, Coverage};
use crate::row;
use crate::timestamp::{format_timestamp, normalize_timestamp, parse_expiry};

const INSERT_ANONYMOUS: &str = "INSERT INTO user (user_id, user_name, user_registration, user_editcount)
    VALUES (0, 'Anonymous', NULL, NULL)
    ON CONFLICT(user_id) DO NOTHING";
const UPSERT_USER: &str = "INSERT INTO user (user_id, user_name, user_registration, user_editcount)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(user_id) DO UPDATE SET
        user_name = excluded.user_name,
        user_registration = excluded.user_registration,
        user_editcount = excluded.user_editcount";
const UPSERT_GROUP: &str = "INSERT INTO user_groups (ug_user, ug_group, ug_expiry) VALUES (?1, ?2, ?3)
    ON CONFLICT(ug_user, ug_group) DO UPDATE SET ug_expiry = excluded.ug_expiry";
const DELETE_STALE_GROUPS: &str = "DELETE FROM user_groups
    WHERE ug_user = ?1 AND ug_group NOT IN (SELECT value FROM json_each(?2))";
const DELETE_EXPIRED_GROUPS: &str =
    "DELETE FROM user_groups WHERE ug_expiry IS NOT NULL AND ug_expiry < ?1";
const RENAME_USER: &str = "UPDATE user SET user_name = ?1 WHERE user_name = ?2";

/// Memberships every account has implicitly.
const IMPLICIT_GROUPS: &[&str] = &["*", "user", "autoconfirmed"];

pub struct UsersGrabber;

impl UsersGrabber {
    /// Queues the user row and its explicit groups. Returns the stored groups.
    fn queue(ctx: &mut GrabContext<'_, '_>, user: &RemoteUser) -> Result<Option<(i64, Vec<String>)>> {
        let Some(userid) = user.userid.filter(|_| !user.missing && !user.invalid) else {
            tracing::warn!(user = %user.name, "skipping missing or invalid user");
            return Ok(None);
        };
        let registration = user
            .registration
            .as_deref()
            .map(normalize_timestamp)
            .transpose()?;
        ctx.execute(
            UPSERT_USER,
            row![userid, user.name, registration, user.editcount],
        )?;

        let expiries = user
            .groupmemberships
            .iter()
            .map(|membership| (membership.group.as_str(), membership.expiry.as_str()))
            .collect::<BTreeMap<_, _>>();
        let mut groups = Vec::new();
        for group in &user.groups {
            if IMPLICIT_GROUPS.contains(&group.as_str()) {
                continue;
            }
            let expiry = match expiries.get(group.as_str()) {
                Some(expiry) => parse_expiry(expiry)?.map(format_timestamp),
                None => None,
            };
            ctx.execute(UPSERT_GROUP, row![userid, group, expiry])?;
            groups.push(group.clone());
        }
        Ok(Some((userid, groups)))
    }
}

impl Grabber for UsersGrabber {
    fn name(&self) -> &'static str {
        "GrabberUsers"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &["user_groups"]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        ctx.execute(INSERT_ANONYMOUS, Vec::new())?;
        for user in ctx.api.all_users()? {
            Self::queue(ctx, &user)?;
        }
        ctx.execute(DELETE_EXPIRED_GROUPS, row![format_timestamp(ctx.now)])?;
        Ok(())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let events = match ChangeFeed::new(ctx.db()).recent_changes_since(since, &["edit", "new", "log"])? {
            Coverage::Covered(events) => events,
            Coverage::WindowTooShort { oldest } => return Ok(UpdateOutcome::NeedsRebuild { oldest }),
        };

        let mut touched = BTreeSet::new();
        let mut renames = Vec::new();
        for event in &events {
            if !event.user_text.is_empty() {
                touched.insert(event.user_text.clone());
            }
            if (event.is_log("newusers") || event.is_log("rights")) && !event.title.is_empty() {
                touched.insert(event.title.clone());
            }
            if event.is_log("renameuser")
                && let (Some(old), Some(new)) = (event.param_str("olduser"), event.param_str("newuser"))
            {
                renames.push((old.to_string(), new.to_string()));
            }
        }

        for (old, new) in &renames {
            ctx.execute(RENAME_USER, row![new, old])?;
            touched.remove(old);
            touched.insert(new.clone());
        }
        ctx.flush()?;

        let names = touched.into_iter().collect::<Vec<_>>();
        for user in ctx.api.users(&names)? {
            if let Some((userid, groups)) = Self::queue(ctx, &user)? {
                ctx.execute(
                    DELETE_STALE_GROUPS,
                    row![userid, serde_json::to_string(&groups)?],
                )?;
            }
        }
        ctx.execute(DELETE_EXPIRED_GROUPS, row![format_timestamp(ctx.now)])?;
        Ok(UpdateOutcome::CaughtUp)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::UsersGrabber;
    use crate::api::RemoteGroupMembership;
    use crate::grabbers::{GrabberRunner, NamespacesGrabber, RecentChangesGrabber};
    use crate::test_support::{SteppingClock, count, migrated_mirror, remote_rc, sample_wiki, ts};

    fn groups_of(connection: &rusqlite::Connection, user: i64) -> Vec<String> {
        connection
            .prepare("SELECT ug_group FROM user_groups WHERE ug_user = ?1 ORDER BY ug_group")
            .expect("prepare")
            .query_map([user], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("groups")
    }

    #[test]
    fn insert_skips_implicit_groups_and_adds_anonymous() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        api.users[1].groups.push("bureaucrat".to_string());
        api.users[1].groupmemberships = vec![RemoteGroupMembership {
            group: "bureaucrat".to_string(),
            expiry: "2020-01-01T00:00:00Z".to_string(),
        }];
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        GrabberRunner::new(&clock, 10)
            .insert(&mut connection, &mut api, &mut UsersGrabber)
            .expect("insert");

        assert_eq!(count(&connection, "user"), 3);
        assert!(groups_of(&connection, 1).is_empty());
        // the bureaucrat membership had already expired
        assert_eq!(groups_of(&connection, 2), vec!["sysop".to_string()]);
    }

    #[test]
    fn update_applies_renames_and_refreshes_groups() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner.insert(&mut connection, &mut api, &mut NamespacesGrabber).expect("namespaces");
        runner.insert(&mut connection, &mut api, &mut RecentChangesGrabber).expect("rc");
        runner.insert(&mut connection, &mut api, &mut UsersGrabber).expect("users");

        let mut rename = remote_rc(5, "log", 2, "User:Alice", "2024-01-03T00:00:00Z");
        rename.user = Some("Admin".to_string());
        rename.logtype = Some("renameuser".to_string());
        rename.logaction = Some("renameuser".to_string());
        rename.logparams = Some(json!({"olduser": "Alice", "newuser": "Alicia"}));
        let mut rights = remote_rc(6, "log", 2, "User:Admin", "2024-01-03T01:00:00Z");
        rights.user = Some("Admin".to_string());
        rights.logtype = Some("rights".to_string());
        rights.logaction = Some("rights".to_string());
        api.recent_changes.extend([rename, rights]);
        api.users[0].name = "Alicia".to_string();
        api.users[1].groups = vec!["user".to_string(), "interface-admin".to_string()];

        let since = ts("2024-01-02T00:00:00Z");
        runner
            .update(&mut connection, &mut api, &mut RecentChangesGrabber, Some(since))
            .expect("rc update");
        runner
            .update(&mut connection, &mut api, &mut UsersGrabber, Some(since))
            .expect("users update");

        let name: String = connection
            .query_row("SELECT user_name FROM user WHERE user_id = 1", [], |row| row.get(0))
            .expect("name");
        assert_eq!(name, "Alicia");
        assert_eq!(groups_of(&connection, 2), vec!["interface-admin".to_string()]);
    }
}
