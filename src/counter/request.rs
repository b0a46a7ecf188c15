use crate::error::CounterError;
use crate::storage::EntityKey;
use serde::{Deserialize, Serialize};

/// Body of the task that asks for a target to be aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub key: EntityKey,
}

pub fn encode_aggregate_request(key: &EntityKey) -> Result<Vec<u8>, CounterError> {
    serde_json::to_vec(&AggregateRequest { key: key.clone() })
        .map_err(|e| CounterError::Encode(e.to_string()))
}

pub fn decode_aggregate_request(body: &[u8]) -> Result<EntityKey, CounterError> {
    let request: AggregateRequest =
        serde_json::from_slice(body).map_err(|e| CounterError::Decode(e.to_string()))?;
    request.key.validate()?;
    Ok(request.key)
}
