use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::row;

const UPSERT_TAG: &str = "INSERT INTO tag
        (tag_name, tag_displayname, tag_description, tag_defined, tag_active, tag_source)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(tag_name) DO UPDATE SET
        tag_displayname = excluded.tag_displayname,
        tag_description = excluded.tag_description,
        tag_defined = excluded.tag_defined,
        tag_active = excluded.tag_active,
        tag_source = excluded.tag_source";

/// Change tags. Tag rows are never deleted since tag associations hang off them.
pub struct TagsGrabber;

impl Grabber for TagsGrabber {
    fn name(&self) -> &'static str {
        "GrabberTags"
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        for tag in ctx.api.tags()? {
            let displayname = tag.displayname.clone().unwrap_or_else(|| tag.name.clone());
            let source = (!tag.source.is_empty()).then(|| tag.source.join(","));
            ctx.execute(
                UPSERT_TAG,
                row![
                    tag.name,
                    displayname,
                    tag.description,
                    tag.defined,
                    tag.active,
                    source,
                ],
            )?;
        }
        Ok(())
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        _since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        self.gen_insert(ctx)?;
        Ok(UpdateOutcome::CaughtUp)
    }
}

#[cfg(test)]
mod tests {
    use super::TagsGrabber;
    use crate::api::RemoteTag;
    use crate::grabbers::GrabberRunner;
    use crate::test_support::{SteppingClock, migrated_mirror, sample_wiki};

    #[test]
    fn upserts_tag_metadata() {
        let (_temp, mut connection) = migrated_mirror();
        let mut api = sample_wiki();
        let clock = SteppingClock::new("2024-02-01T00:00:00Z", 60);
        let runner = GrabberRunner::new(&clock, 10);
        runner
            .insert(&mut connection, &mut api, &mut TagsGrabber)
            .expect("insert");

        api.tags[0].active = false;
        api.tags.push(RemoteTag {
            name: "visualeditor".to_string(),
            displayname: None,
            description: None,
            defined: false,
            active: true,
            source: Vec::new(),
        });
        runner
            .update(&mut connection, &mut api, &mut TagsGrabber, None)
            .expect("update");

        let rows = connection
            .prepare("SELECT tag_id, tag_name, tag_displayname, tag_active, tag_source FROM tag ORDER BY tag_id")
            .expect("prepare")
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("rows");
        assert_eq!(
            rows,
            vec![
                (1, "mw-undo".to_string(), "Undo".to_string(), false, Some("software".to_string())),
                (2, "visualeditor".to_string(), "visualeditor".to_string(), true, None),
            ]
        );
    }
}
