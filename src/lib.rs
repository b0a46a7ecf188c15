pub mod clock;
pub mod commit;
pub mod config;
pub mod counter;
pub mod error;
pub mod shard_keys;
pub mod storage;
pub mod tasks;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CounterConfig, Resolver};
pub use counter::{
    AggregateOutcome, Aggregator, CounterSpec, IncrementOutcome, Incrementor, ShardRecord,
};
pub use error::{CounterError, CounterErrorCode};
pub use shard_keys::ShardKeyUniverse;
pub use storage::{Datastore, EntityKey, PathElement, Query, StoredEntity, TargetKey, Transaction};
pub use tasks::{CreateTaskRequest, HttpMethod, HttpTask, TaskScheduler};
pub use value::{Entity, Value};
