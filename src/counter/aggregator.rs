use crate::commit::run_in_transaction;
use crate::config::CounterConfig;
use crate::counter::record::{CounterSpec, FIELD_TARGET, ShardRecord};
use crate::counter::request::decode_aggregate_request;
use crate::error::CounterError;
use crate::storage::{Datastore, EntityKey, Query, StoredEntity, TargetKey, Transaction};
use crate::value::{Entity, Value};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// No shard exists for the target; nothing was read or written.
    NoShards,
    /// Shards exist but carry no properties.
    NoProperties,
    /// The target is absent and a shard asked not to create it.
    SkippedMissing,
    /// The target already held every total.
    Unchanged,
    Written,
}

/// Totals across all shards of one target, plus the creation policy they
/// carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardFold {
    pub totals: BTreeMap<String, i64>,
    /// Initial spec of the first shard, in query order, that has a non-empty
    /// one.
    pub initial: Option<Entity>,
    /// Set when any shard asks not to create a missing target.
    pub ignore_if_missing: bool,
}

impl ShardFold {
    pub fn add(&mut self, shard: &ShardRecord) -> Result<(), CounterError> {
        for (property, value) in &shard.properties {
            let total = self.totals.entry(property.clone()).or_insert(0);
            *total = total
                .checked_add(*value)
                .ok_or_else(|| CounterError::Overflow {
                    property: property.clone(),
                })?;
        }
        match &shard.spec {
            CounterSpec::InitializeWith(initial) if self.initial.is_none() && !initial.is_empty() => {
                self.initial = Some(initial.clone());
            }
            CounterSpec::IgnoreIfMissing => self.ignore_if_missing = true,
            _ => {}
        }
        Ok(())
    }
}

pub fn fold_shards<'a>(
    shards: impl IntoIterator<Item = &'a ShardRecord>,
) -> Result<ShardFold, CounterError> {
    let mut fold = ShardFold::default();
    for shard in shards {
        fold.add(shard)?;
    }
    Ok(fold)
}

/// Writes each total into `entity` and reports whether any field changed.
/// Fields without a total are left alone.
pub fn merge_totals(entity: &mut Entity, totals: &BTreeMap<String, i64>) -> bool {
    let mut dirty = false;
    for (property, total) in totals {
        let total = Value::Integer(*total);
        if entity.get(property) == Some(&total) {
            continue;
        }
        entity.insert(property.clone(), total);
        dirty = true;
    }
    dirty
}

/// Folds a target's shards into its durable entity.
pub struct Aggregator<D> {
    datastore: D,
    config: CounterConfig,
}

impl<D: Datastore> Aggregator<D> {
    pub fn new(config: CounterConfig, datastore: D) -> Result<Self, CounterError> {
        config.validate()?;
        Ok(Self { datastore, config })
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    /// All shards of `target`, unprojected. Shard fields are kept out of
    /// secondary indexes, so a store could not project them.
    pub fn shard_query(&self, target: &TargetKey) -> Query {
        Query::new(self.config.counter_kind.as_str()).filter(FIELD_TARGET, target.as_str())
    }

    /// Decodes an aggregation task body and aggregates the target it names.
    pub async fn handle_request(&self, body: &[u8]) -> Result<AggregateOutcome, CounterError> {
        let key = decode_aggregate_request(body)?;
        self.aggregate(&key).await
    }

    /// Converges the entity at `key` to the current shard totals. Safe to run
    /// any number of times, concurrently included; once converged it writes
    /// nothing.
    pub async fn aggregate(&self, key: &EntityKey) -> Result<AggregateOutcome, CounterError> {
        key.validate()?;
        let target = key.target_key();
        let rows = self
            .datastore
            .run_query(&self.shard_query(&target))
            .await?;
        if rows.is_empty() {
            debug!(target_key = %target, "no shards to aggregate");
            return Ok(AggregateOutcome::NoShards);
        }

        let shards = rows
            .iter()
            .map(|row| ShardRecord::decode(target.clone(), &row.data))
            .collect::<Result<Vec<_>, _>>()?;
        let fold = fold_shards(&shards)?;
        if fold.totals.is_empty() {
            debug!(target_key = %target, shards = shards.len(), "shards carry no properties");
            return Ok(AggregateOutcome::NoProperties);
        }

        let fold = &fold;
        let outcome = run_in_transaction(&self.datastore, |tx| {
            let key = key.clone();
            async move {
                let (mut data, exclude_from_indexes) = match tx.get(&key).await? {
                    Some(existing) => (existing.data, existing.exclude_from_indexes),
                    None if fold.ignore_if_missing => return Ok(AggregateOutcome::SkippedMissing),
                    None => (
                        fold.initial.clone().unwrap_or_default(),
                        self.config.default_exclusions(key.kind()),
                    ),
                };
                if !merge_totals(&mut data, &fold.totals) {
                    return Ok(AggregateOutcome::Unchanged);
                }
                tx.upsert(StoredEntity {
                    key,
                    data,
                    exclude_from_indexes,
                })?;
                Ok(AggregateOutcome::Written)
            }
        })
        .await?;

        debug!(target_key = %target, shards = shards.len(), ?outcome, "aggregated");
        Ok(outcome)
    }
}
