//! Sharded counters with deferred aggregation.
//!
//! [`Incrementor`] spreads increments for a target across a pool of shard
//! records and schedules a delayed aggregation run, at most one per margin
//! window. [`Aggregator`] sums the shards and merges the totals into the
//! target entity, writing only when a total changed.

pub mod aggregator;
pub mod incrementor;
pub mod record;
pub mod request;

pub use aggregator::{AggregateOutcome, Aggregator, ShardFold, fold_shards, merge_totals};
pub use incrementor::{IncrementOutcome, Incrementor, needs_schedule};
pub use record::{AggregationMeta, CounterSpec, ShardRecord};
pub use request::{AggregateRequest, decode_aggregate_request, encode_aggregate_request};
