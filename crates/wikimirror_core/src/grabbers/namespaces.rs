use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{GrabContext, Grabber, UpdateOutcome};
use crate::row;

const INSERT_NAMESPACE: &str = "INSERT INTO namespace
        (ns_id, ns_case, ns_content, ns_subpages, ns_nonincludable, ns_defaultcontentmodel, ns_protection)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(ns_id) DO UPDATE SET
        ns_case = excluded.ns_case,
        ns_content = excluded.ns_content,
        ns_subpages = excluded.ns_subpages,
        ns_nonincludable = excluded.ns_nonincludable,
        ns_defaultcontentmodel = excluded.ns_defaultcontentmodel,
        ns_protection = excluded.ns_protection";
const INSERT_NAME: &str = "INSERT INTO namespace_name (nsn_id, nsn_name) VALUES (?1, ?2)
    ON CONFLICT(nsn_name) DO NOTHING";
const INSERT_STARNAME: &str = "INSERT INTO namespace_starname (nss_id, nss_name) VALUES (?1, ?2)";
const INSERT_CANONICAL: &str = "INSERT INTO namespace_canonical (nsc_id, nsc_name) VALUES (?1, ?2)";

/// Namespace properties together with every name a title prefix may use.
pub struct NamespacesGrabber;

impl Grabber for NamespacesGrabber {
    fn name(&self) -> &'static str {
        "GrabberNamespaces"
    }

    fn predelete_tables(&self) -> &'static [&'static str] {
        &[
            "namespace_canonical",
            "namespace_starname",
            "namespace_name",
            "namespace",
        ]
    }

    fn gen_insert(&mut self, ctx: &mut GrabContext<'_, '_>) -> Result<()> {
        let site = ctx.api.site_info()?;
        for namespace in site.namespaces.values() {
            ctx.execute(
                INSERT_NAMESPACE,
                row![
                    namespace.id,
                    namespace.case,
                    namespace.content,
                    namespace.subpages,
                    namespace.nonincludable,
                    namespace.defaultcontentmodel,
                    namespace.namespaceprotection,
                ],
            )?;
            ctx.execute(INSERT_STARNAME, row![namespace.id, namespace.name])?;
            ctx.execute(INSERT_NAME, row![namespace.id, namespace.name])?;
            if let Some(canonical) = &namespace.canonical {
                ctx.execute(INSERT_CANONICAL, row![namespace.id, canonical])?;
                ctx.execute(INSERT_NAME, row![namespace.id, canonical])?;
            }
        }
        for alias in &site.namespace_aliases {
            ctx.execute(INSERT_NAME, row![alias.id, alias.alias])?;
        }
        ctx.reload_titles()
    }

    fn gen_update(
        &mut self,
        ctx: &mut GrabContext<'_, '_>,
        _since: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        for table in self.predelete_tables() {
            ctx.execute_now(&format!("DELETE FROM {table}"), Vec::new())?;
        }
        self.gen_insert(ctx)?;
        Ok(UpdateOutcome::CaughtUp)
    }
}
