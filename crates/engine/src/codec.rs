//! JSON codec for records kept in the store and on the queues.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::EngineError;

pub fn encode<T: Serialize>(value: &T) -> Result<String, EngineError> {
    Ok(serde_json::to_string(value)?)
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, EngineError> {
    Ok(serde_json::from_str(raw)?)
}
