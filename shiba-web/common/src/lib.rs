use log::warn;
use serde::Serialize;

pub mod api_bindings;
pub mod config;
pub mod signaling;

pub fn serialize_json<T>(message: &T) -> Option<String>
where
    T: Serialize,
{
    match serde_json::to_string(message) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("failed to serialize json message: {err:?}");
            None
        }
    }
}
