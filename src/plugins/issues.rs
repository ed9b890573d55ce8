use anyhow::Result;
use async_trait::async_trait;
use data_model::{IndexSpec, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state_store::{
    migrations::{Migration, MigrationContext, MigrationDescriptor},
    singleton::Singleton,
};
use tracing::info;

use super::{build::RenameField, CollectionIndexes, SchemaPlugin};

pub const PLUGIN_NAME: &str = "issues";
pub const ISSUES_COLLECTION: &str = "issues";
pub const SPANS_COLLECTION: &str = "issues.spans";
pub const STEPS_COLLECTION: &str = "issues.steps";
pub const SUSPECTS_COLLECTION: &str = "issues.suspects";

/// Allocation state for numeric issue ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLedger {
    #[serde(default)]
    pub next_id: u64,
}

impl Default for IssueLedger {
    fn default() -> Self {
        Self { next_id: 1 }
    }
}

/// Layout of the ledger before it moved to a readable id.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyIssueLedger {
    #[serde(default)]
    next_id: u64,
}

impl Singleton for IssueLedger {
    const ID: &'static str = "issue-ledger";
    const LEGACY_ID: Option<&'static str> = Some("5e4c226440ce25fa3207a9af");

    fn from_legacy(legacy: Value) -> Result<Self, serde_json::Error> {
        let legacy: LegacyIssueLedger = serde_json::from_value(legacy)?;
        Ok(Self {
            next_id: legacy.next_id,
        })
    }
}

/// Issues detected from build failures and the spans, steps and suspect
/// changes attached to them.
pub struct IssuesPlugin;

impl SchemaPlugin for IssuesPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn migrations(&self) -> Vec<MigrationDescriptor> {
        vec![
            MigrationDescriptor::new(PLUGIN_NAME, 1, "Adopt issue ledger", AdoptIssueLedger),
            MigrationDescriptor::new(
                PLUGIN_NAME,
                2,
                "Rename suspect author field",
                RenameField {
                    collection: SUSPECTS_COLLECTION,
                    from: "author",
                    to: "author_id",
                },
            ),
        ]
    }

    fn collections(&self) -> Vec<CollectionIndexes> {
        vec![
            CollectionIndexes::new(
                ISSUES_COLLECTION,
                vec![
                    IndexSpec::ascending("resolved_at"),
                    IndexSpec::ascending("verified_at"),
                ],
            ),
            CollectionIndexes::new(
                SPANS_COLLECTION,
                vec![
                    IndexSpec::ascending("issue_id"),
                    IndexSpec::ascending("stream_id")
                        .then_ascending("min_commit_order")
                        .then_ascending("max_commit_order")
                        .named("stream_changes"),
                ],
            ),
            CollectionIndexes::new(
                STEPS_COLLECTION,
                vec![
                    IndexSpec::ascending("span_id"),
                    IndexSpec::ascending("job_id")
                        .then_ascending("batch_id")
                        .then_ascending("step_id"),
                ],
            ),
            CollectionIndexes::new(
                SUSPECTS_COLLECTION,
                vec![
                    IndexSpec::ascending("commit_order"),
                    IndexSpec::ascending("author_id").then_ascending("resolved_at"),
                    IndexSpec::ascending("issue_id")
                        .then_ascending("commit_order")
                        .unique(),
                ],
            ),
        ]
    }
}

/// Moves the ledger to its current id and makes sure it never hands out an
/// id that is already taken.
struct AdoptIssueLedger;

#[async_trait]
impl Migration for AdoptIssueLedger {
    async fn apply(&self, ctx: &MigrationContext) -> Result<()> {
        let mut highest: Option<u64> = None;
        ctx.iterate(ISSUES_COLLECTION, |issue| {
            let id = issue
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .and_then(|id| id.parse::<u64>().ok());
            highest = highest.max(id);
            Ok(())
        })
        .await?;

        let ledger = ctx
            .singletons
            .update(
                |ledger: &mut IssueLedger| match highest {
                    Some(highest) if ledger.next_id <= highest => {
                        ledger.next_id = highest + 1;
                        true
                    }
                    _ => false,
                },
                &ctx.cancel,
            )
            .await?;
        info!(next_id = ledger.payload.next_id, "issue ledger ready");
        Ok(())
    }

    // Ids handed out under the ledger stay reserved.
    async fn revert(&self, _ctx: &MigrationContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use metrics::SchemaMetrics;
    use serde_json::json;
    use state_store::{
        driver::{DocumentStore, InMemoryDriver},
        singleton::{VersionedSingletonStore, SINGLETONS_COLLECTION},
    };
    use tokio_util::sync::CancellationToken;

    use super::*;

    async fn context(seed: Vec<(&str, Value)>) -> (MigrationContext, VersionedSingletonStore) {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDriver::new());
        for (collection, document) in seed {
            store.insert_if_absent(collection, document).await.unwrap();
        }
        let singletons = VersionedSingletonStore::new(store, Arc::new(SchemaMetrics::new()));
        let ctx = MigrationContext::new(
            PLUGIN_NAME,
            1,
            singletons.clone(),
            CancellationToken::new(),
        );
        (ctx, singletons)
    }

    #[tokio::test]
    async fn test_adopts_legacy_ledger_past_existing_issues() {
        let (ctx, singletons) = context(vec![
            (
                SINGLETONS_COLLECTION,
                json!({"_id": "5e4c226440ce25fa3207a9af", "NextId": 40}),
            ),
            (ISSUES_COLLECTION, json!({"_id": "12"})),
            (ISSUES_COLLECTION, json!({"_id": "55"})),
        ])
        .await;

        AdoptIssueLedger.apply(&ctx).await.unwrap();

        let ledger = singletons.get::<IssueLedger>(&ctx.cancel).await.unwrap();
        assert_eq!(ledger.id, "issue-ledger");
        assert_eq!(ledger.payload.next_id, 56);
        assert_eq!(ledger.revision, 1);
    }

    #[tokio::test]
    async fn test_legacy_ledger_ahead_of_issues_is_kept() {
        let (ctx, singletons) = context(vec![
            (
                SINGLETONS_COLLECTION,
                json!({"_id": "5e4c226440ce25fa3207a9af", "NextId": 90}),
            ),
            (ISSUES_COLLECTION, json!({"_id": "55"})),
        ])
        .await;

        AdoptIssueLedger.apply(&ctx).await.unwrap();

        let ledger = singletons.get::<IssueLedger>(&ctx.cancel).await.unwrap();
        assert_eq!(ledger.payload.next_id, 90);
        assert_eq!(ledger.revision, 0);
    }

    #[tokio::test]
    async fn test_fresh_ledger_starts_at_one() {
        let (ctx, singletons) = context(Vec::new()).await;
        AdoptIssueLedger.apply(&ctx).await.unwrap();
        assert_eq!(
            singletons.get::<IssueLedger>(&ctx.cancel).await.unwrap().payload,
            IssueLedger { next_id: 1 }
        );
    }

    #[test]
    fn test_suspect_indexes() {
        let collections = IssuesPlugin.collections();
        let suspects = collections
            .iter()
            .find(|c| c.collection == SUSPECTS_COLLECTION)
            .unwrap();
        let unique: Vec<&str> = suspects
            .indexes
            .iter()
            .filter(|i| i.unique)
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(unique, vec!["issue_id_1_commit_order_1"]);
    }
}
