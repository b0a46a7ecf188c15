use crate::clock::{Clock, SystemClock, unix_millis};
use crate::commit::run_in_transaction;
use crate::config::CounterConfig;
use crate::counter::record::{AggregationMeta, CounterSpec, ShardRecord};
use crate::counter::request::encode_aggregate_request;
use crate::error::CounterError;
use crate::shard_keys::ShardKeyUniverse;
use crate::storage::{Datastore, EntityKey, StoredEntity, TargetKey, Transaction};
use crate::tasks::{CreateTaskRequest, HttpMethod, HttpTask, TaskScheduler};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementOutcome {
    pub shard_key: EntityKey,
    /// Name of the aggregation task this call enqueued, if it enqueued one.
    pub scheduled_task: Option<String>,
}

/// Whether an increment must schedule a new aggregation run for
/// `desired_ms`, given the run already recorded in `meta`.
///
/// A recorded run no earlier than `desired_ms - margin_ms` still covers the
/// increment, so bursts collapse onto one pending run.
pub fn needs_schedule(meta: Option<AggregationMeta>, desired_ms: i64, margin_ms: i64) -> bool {
    match meta {
        None => true,
        Some(meta) => meta.schedule_time_ms < desired_ms.saturating_sub(margin_ms),
    }
}

/// Records increments into randomly chosen shards and debounces the
/// aggregation runs that fold them back into the target.
pub struct Incrementor<D, S, C = SystemClock> {
    datastore: D,
    scheduler: S,
    clock: C,
    config: CounterConfig,
    universe: ShardKeyUniverse,
}

impl<D: Datastore, S: TaskScheduler> Incrementor<D, S> {
    pub fn new(config: CounterConfig, datastore: D, scheduler: S) -> Result<Self, CounterError> {
        config.validate()?;
        if config.aggregate_url.is_empty() {
            return Err(CounterError::invalid_config(
                "aggregate url must be set to schedule aggregation tasks",
            ));
        }
        let universe = ShardKeyUniverse::new(config.shard_pool_size);
        Ok(Self {
            datastore,
            scheduler,
            clock: SystemClock,
            config,
            universe,
        })
    }
}

impl<D: Datastore, S: TaskScheduler, C: Clock> Incrementor<D, S, C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Incrementor<D, S, C2> {
        Incrementor {
            datastore: self.datastore,
            scheduler: self.scheduler,
            clock,
            config: self.config,
            universe: self.universe,
        }
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    pub fn shard_key(&self, target: &TargetKey, suffix: &str) -> EntityKey {
        EntityKey::new(self.config.counter_kind.as_str(), format!("{target}.{suffix}"))
    }

    pub fn meta_key(&self, target: &TargetKey) -> EntityKey {
        EntityKey::new(self.config.meta_kind.as_str(), target.as_str())
    }

    pub async fn increment(
        &self,
        key: &EntityKey,
        property: &str,
        delta: i64,
    ) -> Result<IncrementOutcome, CounterError> {
        self.increment_with(key, property, delta, CounterSpec::Unset)
            .await
    }

    /// Adds `delta` to `property` on one shard of `key` and, unless a pending
    /// run already covers it, schedules an aggregation run.
    ///
    /// The task is enqueued only after the shard and meta writes commit. If
    /// enqueueing fails the error is returned and the target stays
    /// unscheduled until a later increment falls outside the margin.
    pub async fn increment_with(
        &self,
        key: &EntityKey,
        property: &str,
        delta: i64,
        spec: CounterSpec,
    ) -> Result<IncrementOutcome, CounterError> {
        key.validate()?;
        let target = key.target_key();
        let shard_key = self.shard_key(&target, self.pick_suffix(key));
        let meta_key = self.meta_key(&target);

        let delay = self.config.delay.resolve(key);
        let schedule_time = self.clock.now().checked_add(delay).ok_or_else(|| {
            CounterError::invalid_config(format!(
                "aggregation delay {delay:?} for {key} overflows the schedule time"
            ))
        })?;
        let schedule_time_ms = unix_millis(schedule_time);
        let margin_ms = i64::try_from(self.config.margin.as_millis()).unwrap_or(i64::MAX);
        let body = encode_aggregate_request(key)?;

        let needs_task = run_in_transaction(&self.datastore, |tx| {
            let shard_key = shard_key.clone();
            let meta_key = meta_key.clone();
            let target = target.clone();
            let spec = spec.clone();
            async move {
                let (shard, meta) = tokio::join!(tx.get(&shard_key), tx.get(&meta_key));

                let mut record = match shard? {
                    Some(stored) => ShardRecord::decode(target, &stored.data)?,
                    None => ShardRecord::new(target),
                };
                record.add(property, delta)?;
                record.spec = spec;
                tx.upsert(record.into_stored(shard_key))?;

                let meta = meta?
                    .map(|stored| AggregationMeta::decode(&stored.data))
                    .transpose()?;
                if !needs_schedule(meta, schedule_time_ms, margin_ms) {
                    return Ok(false);
                }
                tx.upsert(StoredEntity::new(
                    meta_key,
                    AggregationMeta { schedule_time_ms }.to_entity(),
                ))?;
                Ok(true)
            }
        })
        .await?;

        if !needs_task {
            debug!(target_key = %target, "aggregation already pending");
            return Ok(IncrementOutcome {
                shard_key,
                scheduled_task: None,
            });
        }

        let queue = self.config.queue.resolve(key);
        let name = format!("{queue}/tasks/{}", Uuid::new_v4());
        let request = CreateTaskRequest {
            queue,
            task: HttpTask {
                name: name.clone(),
                method: HttpMethod::Post,
                url: self.config.aggregate_url.clone(),
                body,
                schedule_time,
                oidc_service_account: self.config.service_account.clone(),
            },
        };
        self.scheduler.create_task(request).await?;
        debug!(target_key = %target, task = %name, schedule_time_ms, "scheduled aggregation");

        Ok(IncrementOutcome {
            shard_key,
            scheduled_task: Some(name),
        })
    }

    fn pick_suffix(&self, key: &EntityKey) -> &str {
        let requested = self.config.distribution_count.resolve(key);
        if requested == 0 || requested > self.universe.len() {
            warn!(
                requested,
                pool = self.universe.len(),
                "distribution count outside shard pool, clamping"
            );
        }
        self.universe.pick(requested, &mut rand::rng())
    }
}
