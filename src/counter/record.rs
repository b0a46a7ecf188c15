use crate::error::CounterError;
use crate::storage::{EntityKey, StoredEntity, TargetKey};
use crate::value::{Entity, Value};
use std::collections::BTreeMap;

pub const FIELD_TARGET: &str = "key";
pub const FIELD_PROPERTIES: &str = "properties";
pub const FIELD_INITIAL: &str = "initial";
pub const FIELD_IGNORE_IF_MISSING: &str = "ignore_if_missing";
pub const FIELD_SCHEDULE_TIME: &str = "schedule_time";

/// How aggregation treats a target entity that does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CounterSpec {
    /// Create the entity from the counter totals alone.
    #[default]
    Unset,
    /// Create the entity from these fields plus the counter totals.
    InitializeWith(Entity),
    /// Never create the entity; only update one that exists.
    IgnoreIfMissing,
}

/// One shard of a target's counter. Each property holds this shard's partial
/// sum, not a total.
///
/// Partial sums are `i64` only. A stored property of any other type, floats
/// included, fails decoding with [`CounterError::Decode`] rather than being
/// coerced, so one foreign writer stops aggregation of its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRecord {
    pub target: TargetKey,
    pub properties: BTreeMap<String, i64>,
    pub spec: CounterSpec,
}

impl ShardRecord {
    pub fn new(target: TargetKey) -> Self {
        Self {
            target,
            properties: BTreeMap::new(),
            spec: CounterSpec::Unset,
        }
    }

    /// Adds `delta` to `property`, treating a missing property as zero, and
    /// returns the shard's new partial sum.
    pub fn add(&mut self, property: &str, delta: i64) -> Result<i64, CounterError> {
        let slot = self.properties.entry(property.to_string()).or_insert(0);
        *slot = slot.checked_add(delta).ok_or_else(|| CounterError::Overflow {
            property: property.to_string(),
        })?;
        Ok(*slot)
    }

    /// Fields kept out of secondary indexes: the write-heavy property map and
    /// the initial spec, which are only ever read by key.
    pub fn index_exclusions(&self) -> Vec<String> {
        let mut fields = vec![FIELD_PROPERTIES.to_string()];
        if matches!(self.spec, CounterSpec::InitializeWith(_)) {
            fields.push(FIELD_INITIAL.to_string());
        }
        fields
    }

    pub fn to_entity(&self) -> Entity {
        let properties = self
            .properties
            .iter()
            .map(|(name, total)| (name.clone(), Value::Integer(*total)))
            .collect::<Entity>();
        let mut entity = Entity::new()
            .with(FIELD_TARGET, self.target.as_str())
            .with(FIELD_PROPERTIES, properties);
        match &self.spec {
            CounterSpec::Unset => {}
            CounterSpec::InitializeWith(initial) => {
                entity.insert(FIELD_INITIAL, initial.clone());
            }
            CounterSpec::IgnoreIfMissing => {
                entity.insert(FIELD_IGNORE_IF_MISSING, true);
            }
        }
        entity
    }

    pub fn into_stored(self, key: EntityKey) -> StoredEntity {
        let exclusions = self.index_exclusions();
        StoredEntity::new(key, self.to_entity()).excluding(exclusions)
    }

    /// Decodes the shard fields of `data`. The target is supplied by the
    /// caller so projected query rows without the target field decode too.
    pub fn decode(target: TargetKey, data: &Entity) -> Result<Self, CounterError> {
        let properties: BTreeMap<String, i64> = match data.get(FIELD_PROPERTIES) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Map(map)) => map
                .iter()
                .map(|(name, value)| match value {
                    Value::Integer(n) => Ok((name.to_string(), *n)),
                    other => Err(CounterError::Decode(format!(
                        "shard property '{name}' of {target} is {}, expected integer",
                        other.type_name()
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(CounterError::Decode(format!(
                    "shard properties of {target} are {}, expected map",
                    other.type_name()
                )));
            }
        };

        let ignore = data
            .get(FIELD_IGNORE_IF_MISSING)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let spec = match (ignore, data.get(FIELD_INITIAL)) {
            (true, _) => CounterSpec::IgnoreIfMissing,
            (false, Some(Value::Map(initial))) => CounterSpec::InitializeWith(initial.clone()),
            (false, None | Some(Value::Null)) => CounterSpec::Unset,
            (false, Some(other)) => {
                return Err(CounterError::Decode(format!(
                    "shard initial spec of {target} is {}, expected map",
                    other.type_name()
                )));
            }
        };

        Ok(Self {
            target,
            properties,
            spec,
        })
    }
}

/// Debounce bookkeeping for one target: when its latest aggregation run was
/// scheduled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationMeta {
    pub schedule_time_ms: i64,
}

impl AggregationMeta {
    pub fn to_entity(self) -> Entity {
        Entity::new().with(FIELD_SCHEDULE_TIME, self.schedule_time_ms)
    }

    pub fn decode(data: &Entity) -> Result<Self, CounterError> {
        data.get(FIELD_SCHEDULE_TIME)
            .and_then(Value::as_integer)
            .map(|schedule_time_ms| Self { schedule_time_ms })
            .ok_or_else(|| {
                CounterError::Decode(format!(
                    "aggregation meta lacks integer field '{FIELD_SCHEDULE_TIME}'"
                ))
            })
    }
}
