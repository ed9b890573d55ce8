use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::IndexSpec;
use serde_json::Value;
use state_store::migrations::{Migration, MigrationContext, MigrationDescriptor};

use super::{CollectionIndexes, SchemaPlugin};

pub const PLUGIN_NAME: &str = "build";
pub const JOBS_COLLECTION: &str = "jobs";

/// Set on jobs whose `commit_order` was copied from `change`.
const BACKFILLED_MARKER: &str = "commit_order_backfilled";

/// Jobs and the build history queries run over them.
pub struct BuildPlugin;

impl SchemaPlugin for BuildPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn migrations(&self) -> Vec<MigrationDescriptor> {
        vec![
            MigrationDescriptor::new(
                PLUGIN_NAME,
                1,
                "Backfill job commit order",
                BackfillCommitOrder,
            ),
            MigrationDescriptor::new(
                PLUGIN_NAME,
                2,
                "Rename job update index",
                RenameField {
                    collection: JOBS_COLLECTION,
                    from: "update_index",
                    to: "update_count",
                },
            ),
        ]
    }

    fn collections(&self) -> Vec<CollectionIndexes> {
        vec![CollectionIndexes::new(
            JOBS_COLLECTION,
            vec![
                IndexSpec::ascending("stream_id")
                    .then_ascending("template_id")
                    .then_descending("create_time"),
                IndexSpec::ascending("stream_id")
                    .then_ascending("template_id")
                    .then_descending("commit_order"),
                IndexSpec::descending("create_time"),
                IndexSpec::descending("started_by_bisect_task_id").sparse(),
            ],
        )]
    }
}

/// Jobs created before commit ordering only carry the change number.
struct BackfillCommitOrder;

#[async_trait]
impl Migration for BackfillCommitOrder {
    async fn apply(&self, ctx: &MigrationContext) -> Result<()> {
        ctx.rewrite(JOBS_COLLECTION, |job| {
            if job.get("commit_order").is_some() {
                return Ok(false);
            }
            let Some(change) = job.get("change").and_then(Value::as_u64) else {
                return Ok(false);
            };
            let fields = job.as_object_mut().context("job is not an object")?;
            fields.insert("commit_order".to_string(), Value::from(change));
            fields.insert(BACKFILLED_MARKER.to_string(), Value::Bool(true));
            Ok(true)
        })
        .await?;
        Ok(())
    }

    async fn revert(&self, ctx: &MigrationContext) -> Result<()> {
        ctx.rewrite(JOBS_COLLECTION, |job| {
            let Some(fields) = job.as_object_mut() else {
                return Ok(false);
            };
            if fields.remove(BACKFILLED_MARKER).is_none() {
                return Ok(false);
            }
            fields.remove("commit_order");
            Ok(true)
        })
        .await?;
        Ok(())
    }
}

/// Renames a top-level field of every document in a collection.
pub(crate) struct RenameField {
    pub collection: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

fn rename(document: &mut Value, from: &str, to: &str) -> bool {
    let Some(fields) = document.as_object_mut() else {
        return false;
    };
    match fields.remove(from) {
        Some(value) => {
            fields.insert(to.to_string(), value);
            true
        }
        None => false,
    }
}

#[async_trait]
impl Migration for RenameField {
    async fn apply(&self, ctx: &MigrationContext) -> Result<()> {
        ctx.rewrite(self.collection, |document| {
            Ok(rename(document, self.from, self.to))
        })
        .await?;
        Ok(())
    }

    async fn revert(&self, ctx: &MigrationContext) -> Result<()> {
        ctx.rewrite(self.collection, |document| {
            Ok(rename(document, self.to, self.from))
        })
        .await?;
        Ok(())
    }
}
