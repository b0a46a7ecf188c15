use crate::error::CounterError;
use crate::shard_keys::DEFAULT_SHARD_POOL_SIZE;
use crate::storage::EntityKey;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_COUNTER_KIND: &str = "distributed_counter";
pub const DEFAULT_META_KIND: &str = "distributed_counter_meta";
pub const DEFAULT_QUEUE: &str = "distributed-counter";
pub const DEFAULT_DISTRIBUTION_COUNT: usize = 1000;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10_000);
pub const DEFAULT_MARGIN: Duration = Duration::from_millis(5_000);

/// A per-target setting. Constants are wrapped at construction so callers
/// only ever resolve.
pub struct Resolver<T> {
    resolve: Arc<dyn Fn(&EntityKey) -> T + Send + Sync>,
}

impl<T: Clone + Send + Sync + 'static> Resolver<T> {
    pub fn constant(value: T) -> Self {
        Self {
            resolve: Arc::new(move |_| value.clone()),
        }
    }
}

impl<T> Resolver<T> {
    pub fn per_target(resolve: impl Fn(&EntityKey) -> T + Send + Sync + 'static) -> Self {
        Self {
            resolve: Arc::new(resolve),
        }
    }

    pub fn resolve(&self, key: &EntityKey) -> T {
        (self.resolve)(key)
    }
}

impl<T: Clone + Send + Sync + 'static> From<T> for Resolver<T> {
    fn from(value: T) -> Self {
        Self::constant(value)
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            resolve: Arc::clone(&self.resolve),
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resolver(..)")
    }
}

/// Construction-time configuration shared by the incrementor and the
/// aggregator. Never reloaded.
#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub counter_kind: String,
    pub meta_kind: String,
    pub distribution_count: Resolver<usize>,
    pub delay: Resolver<Duration>,
    pub margin: Duration,
    pub shard_pool_size: usize,
    pub aggregate_url: String,
    pub queue: Resolver<String>,
    pub service_account: Option<String>,
    /// Index exclusions applied when the aggregator creates an entity of the
    /// given kind. Existing entities keep their own list.
    pub index_exclusions: HashMap<String, Vec<String>>,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            counter_kind: DEFAULT_COUNTER_KIND.to_string(),
            meta_kind: DEFAULT_META_KIND.to_string(),
            distribution_count: Resolver::constant(DEFAULT_DISTRIBUTION_COUNT),
            delay: Resolver::constant(DEFAULT_DELAY),
            margin: DEFAULT_MARGIN,
            shard_pool_size: DEFAULT_SHARD_POOL_SIZE,
            aggregate_url: String::new(),
            queue: Resolver::constant(DEFAULT_QUEUE.to_string()),
            service_account: None,
            index_exclusions: HashMap::new(),
        }
    }
}

impl CounterConfig {
    /// Defaults overlaid with the `DISTRIBUTED_COUNTER_*` environment
    /// variables that are set.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(kind) = var("DISTRIBUTED_COUNTER_KIND") {
            config.counter_kind = kind;
        }
        if let Some(kind) = var("DISTRIBUTED_COUNTER_META_KIND") {
            config.meta_kind = kind;
        }
        if let Some(url) = var("DISTRIBUTED_COUNTER_AGGREGATE_URL") {
            config.aggregate_url = url;
        }
        if let Some(queue) = var("DISTRIBUTED_COUNTER_QUEUE") {
            config.queue = Resolver::constant(queue);
        }
        config.service_account = var("DISTRIBUTED_COUNTER_SERVICE_ACCOUNT");
        config
    }

    pub fn with_kinds(mut self, counter_kind: impl Into<String>, meta_kind: impl Into<String>) -> Self {
        self.counter_kind = counter_kind.into();
        self.meta_kind = meta_kind.into();
        self
    }

    pub fn with_distribution_count(mut self, count: impl Into<Resolver<usize>>) -> Self {
        self.distribution_count = count.into();
        self
    }

    pub fn with_delay(mut self, delay: impl Into<Resolver<Duration>>) -> Self {
        self.delay = delay.into();
        self
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_shard_pool_size(mut self, size: usize) -> Self {
        self.shard_pool_size = size;
        self
    }

    pub fn with_aggregate_url(mut self, url: impl Into<String>) -> Self {
        self.aggregate_url = url.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<Resolver<String>>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_service_account(mut self, account: impl Into<String>) -> Self {
        self.service_account = Some(account.into());
        self
    }

    pub fn with_index_exclusions(
        mut self,
        kind: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.index_exclusions
            .insert(kind.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// Exclusion list for a newly created entity of `kind`.
    pub fn default_exclusions(&self, kind: &str) -> Vec<String> {
        self.index_exclusions.get(kind).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), CounterError> {
        if self.counter_kind.is_empty() {
            return Err(CounterError::invalid_config("counter kind must not be empty"));
        }
        if self.meta_kind.is_empty() {
            return Err(CounterError::invalid_config("meta kind must not be empty"));
        }
        if self.counter_kind == self.meta_kind {
            return Err(CounterError::invalid_config(format!(
                "counter kind and meta kind must differ, both are '{}'",
                self.counter_kind
            )));
        }
        if self.shard_pool_size == 0 {
            return Err(CounterError::invalid_config("shard pool size must be positive"));
        }
        for (kind, fields) in &self.index_exclusions {
            if kind.is_empty() {
                return Err(CounterError::invalid_config(
                    "index exclusion kind must not be empty",
                ));
            }
            let mut seen = BTreeSet::new();
            for field in fields {
                if field.is_empty() {
                    return Err(CounterError::invalid_config(format!(
                        "index exclusion list for '{kind}' contains an empty field name"
                    )));
                }
                if !seen.insert(field.as_str()) {
                    return Err(CounterError::invalid_config(format!(
                        "index exclusion list for '{kind}' repeats field '{field}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
