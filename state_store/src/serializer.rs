use std::{any::type_name, fmt::Debug};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::driver::Error as DriverError;

pub struct JsonEncoder;

pub trait JsonEncode {
    fn encode<T: serde::Serialize + Debug>(value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

impl JsonEncode for JsonEncoder {
    fn encode<T: serde::Serialize + Debug>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            anyhow::anyhow!(
                "error serializing into json: {}, type: {}, value: {:?}",
                e,
                type_name::<T>(),
                value
            )
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            anyhow::anyhow!(
                "error deserializing from json bytes, {}, type: {}",
                e,
                type_name::<T>()
            )
        })
    }
}

/// Converts a typed record into a stored document.
pub fn to_document<T: serde::Serialize + Debug>(value: &T) -> Result<Value, DriverError> {
    serde_json::to_value(value).map_err(|e| DriverError::JsonEncoderFailed {
        source: anyhow::anyhow!("{}, type: {}, value: {:?}", e, type_name::<T>(), value),
    })
}

/// Decodes a stored document into a typed record.
pub fn from_document<T: DeserializeOwned>(document: Value) -> Result<T, DriverError> {
    serde_json::from_value(document).map_err(|e| DriverError::JsonDecoderFailed {
        source: anyhow::anyhow!("{}, type: {}", e, type_name::<T>()),
    })
}
