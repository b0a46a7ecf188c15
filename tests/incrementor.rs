use distributed_counter::clock::{ManualClock, unix_millis};
use distributed_counter::config::{CounterConfig, Resolver};
use distributed_counter::counter::record::{
    AggregationMeta, CounterSpec, FIELD_IGNORE_IF_MISSING, FIELD_INITIAL, ShardRecord,
};
use distributed_counter::counter::{Incrementor, decode_aggregate_request};
use distributed_counter::error::CounterError;
use distributed_counter::shard_keys::ShardKeyUniverse;
use distributed_counter::storage::memory::{CommitFault, MemoryDatastore};
use distributed_counter::storage::{EntityKey, PathElement, TargetKey};
use distributed_counter::tasks::HttpMethod;
use distributed_counter::tasks::memory::RecordingScheduler;
use distributed_counter::value::{Entity, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const COUNTER_KIND: &str = "Distributed";
const META_KIND: &str = "Meta";
const AGGREGATE_URL: &str = "http://aggregate.example.com";
const QUEUE_PREFIX: &str = "projects/dummy-project/locations/us-east4/queues/distributed-counter";

fn start() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn config() -> CounterConfig {
    CounterConfig::default()
        .with_kinds(COUNTER_KIND, META_KIND)
        .with_aggregate_url(AGGREGATE_URL)
        .with_queue(Resolver::per_target(|key: &EntityKey| {
            format!("{QUEUE_PREFIX}-{}", key.kind())
        }))
        .with_distribution_count(Resolver::per_target(|key: &EntityKey| {
            if key.kind() == "Counter" { 1000usize } else { 100 }
        }))
        .with_delay(Resolver::per_target(|key: &EntityKey| {
            if key.kind() == "Counter" {
                Duration::from_secs(10)
            } else {
                Duration::from_secs(60)
            }
        }))
}

struct Harness {
    store: MemoryDatastore,
    scheduler: RecordingScheduler,
    clock: ManualClock,
    incrementor: Incrementor<MemoryDatastore, RecordingScheduler, ManualClock>,
}

fn harness(config: CounterConfig) -> Harness {
    let store = MemoryDatastore::new();
    let scheduler = RecordingScheduler::new();
    let clock = ManualClock::at(start());
    let incrementor = Incrementor::new(config, store.clone(), scheduler.clone())
        .expect("incrementor")
        .with_clock(clock.clone());
    Harness {
        store,
        scheduler,
        clock,
        incrementor,
    }
}

fn target() -> EntityKey {
    EntityKey::new("Counter", "dummy-id")
}

fn meta_key() -> EntityKey {
    EntityKey::new(META_KIND, "Counter.dummy-id")
}

fn shard_of(h: &Harness, shard_key: &EntityKey) -> ShardRecord {
    let stored = h.store.peek(shard_key).expect("shard written");
    ShardRecord::decode(TargetKey::new("Counter.dummy-id"), &stored.data).expect("decode shard")
}

fn scheduled_at(h: &Harness) -> Option<i64> {
    h.store
        .peek(&meta_key())
        .map(|stored| AggregationMeta::decode(&stored.data).expect("decode meta").schedule_time_ms)
}

#[tokio::test]
async fn first_increment_writes_shard_and_meta_then_schedules() {
    let h = harness(config());

    let outcome = h
        .incrementor
        .increment(&target(), "value", 2)
        .await
        .expect("increment");

    assert_eq!(outcome.shard_key.kind(), COUNTER_KIND);
    let Some(PathElement::Name(name)) = outcome.shard_key.id() else {
        panic!("shard key must be named: {}", outcome.shard_key);
    };
    let suffix = name
        .strip_prefix("Counter.dummy-id.")
        .expect("shard name starts with the target key");
    assert_eq!(suffix.len(), 8);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(ShardKeyUniverse::default().suffixes().iter().any(|s| s == suffix));

    let stored = h.store.peek(&outcome.shard_key).expect("shard");
    assert_eq!(
        stored.data,
        Entity::new()
            .with("key", "Counter.dummy-id")
            .with("properties", Entity::new().with("value", 2))
    );
    assert_eq!(stored.exclude_from_indexes, vec!["properties".to_string()]);

    let due = start() + Duration::from_secs(10);
    assert_eq!(scheduled_at(&h), Some(unix_millis(due)));

    let requests = h.scheduler.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.queue, format!("{QUEUE_PREFIX}-Counter"));
    assert_eq!(Some(&request.task.name), outcome.scheduled_task.as_ref());
    assert!(
        request
            .task
            .name
            .starts_with(&format!("{QUEUE_PREFIX}-Counter/tasks/"))
    );
    assert_eq!(request.task.method, HttpMethod::Post);
    assert_eq!(request.task.url, AGGREGATE_URL);
    assert_eq!(request.task.schedule_time, due);
    assert_eq!(request.task.oidc_service_account, None);
    assert_eq!(
        decode_aggregate_request(&request.task.body).expect("body"),
        target()
    );
}

#[tokio::test]
async fn burst_within_margin_schedules_once() {
    let h = harness(config());

    h.incrementor.increment(&target(), "value", 1).await.expect("first");
    h.clock.advance(Duration::from_secs(4));
    let second = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect("second");
    h.clock.advance(Duration::from_secs(1));
    let third = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect("third");

    assert_eq!(second.scheduled_task, None);
    assert_eq!(third.scheduled_task, None);
    assert_eq!(h.scheduler.len(), 1);
    assert_eq!(scheduled_at(&h), Some(unix_millis(start() + Duration::from_secs(10))));
}

#[tokio::test]
async fn increment_past_the_margin_schedules_again() {
    let h = harness(config());

    h.incrementor.increment(&target(), "value", 1).await.expect("first");
    h.clock.advance(Duration::from_millis(5_001));
    let later = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect("later");

    assert!(later.scheduled_task.is_some());
    assert_eq!(h.scheduler.len(), 2);
    let due = start() + Duration::from_millis(15_001);
    assert_eq!(scheduled_at(&h), Some(unix_millis(due)));
    assert_eq!(h.scheduler.requests()[1].task.schedule_time, due);
}

#[tokio::test]
async fn targets_are_debounced_independently() {
    let h = harness(config());
    let like = EntityKey::new("Like", "post-1");

    h.incrementor.increment(&target(), "value", 1).await.expect("counter");
    let outcome = h.incrementor.increment(&like, "value", 1).await.expect("like");

    assert!(outcome.scheduled_task.is_some());
    let requests = h.scheduler.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].queue, format!("{QUEUE_PREFIX}-Like"));
    assert_eq!(
        requests[1].task.schedule_time,
        start() + Duration::from_secs(60)
    );
}

#[tokio::test]
async fn single_shard_distribution_accumulates_in_place() {
    let h = harness(config().with_distribution_count(1usize));

    let mut keys = Vec::new();
    for delta in [1, 2, 3, -4] {
        let outcome = h
            .incrementor
            .increment(&target(), "value", delta)
            .await
            .expect("increment");
        keys.push(outcome.shard_key);
    }
    h.incrementor.increment(&target(), "other", 7).await.expect("other");

    assert!(keys.windows(2).all(|w| w[0] == w[1]));
    let expected_name = format!("Counter.dummy-id.{}", ShardKeyUniverse::default().suffixes()[0]);
    assert_eq!(keys[0], EntityKey::new(COUNTER_KIND, expected_name));
    let shard = shard_of(&h, &keys[0]);
    assert_eq!(shard.properties.get("value"), Some(&2));
    assert_eq!(shard.properties.get("other"), Some(&7));
}

#[tokio::test]
async fn distribution_count_bounds_the_shards_used() {
    let h = harness(config().with_distribution_count(3usize));
    let universe = ShardKeyUniverse::default();
    let allowed = &universe.suffixes()[..3];

    for _ in 0..30 {
        let outcome = h
            .incrementor
            .increment(&target(), "value", 1)
            .await
            .expect("increment");
        let Some(PathElement::Name(name)) = outcome.shard_key.id() else {
            panic!("shard key must be named");
        };
        let suffix = name.rsplit('.').next().expect("suffix");
        assert!(allowed.iter().any(|s| s == suffix), "unexpected shard {name}");
    }
}

#[tokio::test]
async fn latest_spec_is_recorded_on_the_shard() {
    let h = harness(config().with_distribution_count(1usize));
    let initial = Entity::new().with("foo", "bar");

    let outcome = h
        .incrementor
        .increment_with(
            &target(),
            "value",
            1,
            CounterSpec::InitializeWith(initial.clone()),
        )
        .await
        .expect("initialize");
    let stored = h.store.peek(&outcome.shard_key).expect("shard");
    assert_eq!(stored.data.get(FIELD_INITIAL), Some(&Value::Map(initial.clone())));
    assert_eq!(
        stored.exclude_from_indexes,
        vec!["properties".to_string(), "initial".to_string()]
    );

    h.incrementor
        .increment_with(&target(), "value", 1, CounterSpec::IgnoreIfMissing)
        .await
        .expect("ignore");
    let stored = h.store.peek(&outcome.shard_key).expect("shard");
    assert!(!stored.data.contains(FIELD_INITIAL));
    assert_eq!(stored.data.get(FIELD_IGNORE_IF_MISSING), Some(&Value::Boolean(true)));

    h.incrementor
        .increment(&target(), "value", 1)
        .await
        .expect("unset");
    let shard = shard_of(&h, &outcome.shard_key);
    assert_eq!(shard.spec, CounterSpec::Unset);
    assert_eq!(shard.properties.get("value"), Some(&3));
}

#[tokio::test]
async fn service_account_is_attached_to_tasks() {
    let h = harness(config().with_service_account("counter@dummy-project.iam.example.com"));

    h.incrementor.increment(&target(), "value", 1).await.expect("increment");

    assert_eq!(
        h.scheduler.requests()[0].task.oidc_service_account.as_deref(),
        Some("counter@dummy-project.iam.example.com")
    );
}

#[tokio::test]
async fn scheduler_failure_leaves_the_increment_committed() {
    let h = harness(config().with_distribution_count(1usize));
    h.scheduler.fail_next(1);

    let err = h
        .incrementor
        .increment(&target(), "value", 5)
        .await
        .expect_err("scheduler failure surfaces");
    assert!(matches!(err, CounterError::Scheduler { .. }));
    assert!(h.scheduler.is_empty());

    let shard_key = h
        .incrementor
        .shard_key(&target().target_key(), &ShardKeyUniverse::default().suffixes()[0]);
    assert_eq!(shard_of(&h, &shard_key).properties.get("value"), Some(&5));
    assert!(scheduled_at(&h).is_some());

    // The meta record still claims a run inside the margin.
    let covered = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect("covered");
    assert_eq!(covered.scheduled_task, None);
    assert!(h.scheduler.is_empty());

    h.clock.advance(Duration::from_secs(6));
    let healed = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect("healed");
    assert!(healed.scheduled_task.is_some());
    assert_eq!(h.scheduler.len(), 1);
}

#[tokio::test]
async fn commit_conflict_is_retried_without_double_counting() {
    let h = harness(config().with_distribution_count(1usize));
    h.store.fail_next_commits(CommitFault::Conflict, 2);

    let outcome = h
        .incrementor
        .increment(&target(), "value", 4)
        .await
        .expect("increment");

    assert_eq!(h.store.stats().transactions, 3);
    assert_eq!(shard_of(&h, &outcome.shard_key).properties.get("value"), Some(&4));
    assert_eq!(h.scheduler.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_schedule_nothing() {
    let h = harness(config());
    h.store.fail_next_commits(CommitFault::Conflict, 5);

    let err = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect_err("conflict");

    assert!(err.is_conflict());
    assert!(h.store.is_empty());
    assert!(h.scheduler.is_empty());
}

#[tokio::test]
async fn overflowing_delta_is_rejected() {
    let h = harness(config().with_distribution_count(1usize));

    h.incrementor
        .increment(&target(), "value", i64::MAX)
        .await
        .expect("max");
    let err = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect_err("overflow");

    assert!(matches!(err, CounterError::Overflow { .. }));
    assert_eq!(h.scheduler.len(), 1);
}

#[tokio::test]
async fn malformed_keys_are_rejected_before_any_io() {
    let h = harness(config());
    let key = EntityKey::from_path(None, vec![PathElement::from("Counter")]);
    assert!(key.is_err());

    let key = EntityKey::new("", "dummy-id");
    let err = h
        .incrementor
        .increment(&key, "value", 1)
        .await
        .expect_err("invalid key");

    assert!(matches!(err, CounterError::InvalidKey(_)));
    assert_eq!(h.store.stats().transactions, 0);
}

#[tokio::test]
async fn unrepresentable_delay_is_an_error_not_a_panic() {
    let h = harness(config().with_delay(Duration::MAX));

    let err = h
        .incrementor
        .increment(&target(), "value", 1)
        .await
        .expect_err("delay overflows the clock");

    assert!(matches!(err, CounterError::InvalidConfig { .. }));
    assert_eq!(h.store.stats().transactions, 0);
    assert!(h.scheduler.is_empty());
}

#[test]
fn construction_requires_a_valid_config_and_url() {
    let missing_url = Incrementor::new(
        CounterConfig::default(),
        MemoryDatastore::new(),
        RecordingScheduler::new(),
    );
    assert!(matches!(missing_url, Err(CounterError::InvalidConfig { .. })));

    let same_kinds = Incrementor::new(
        config().with_kinds("Same", "Same"),
        MemoryDatastore::new(),
        RecordingScheduler::new(),
    );
    assert!(matches!(same_kinds, Err(CounterError::InvalidConfig { .. })));
}
