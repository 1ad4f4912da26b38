//! Payload protocols
//!
//! A protocol turns a [`RemoteMessage`] into bytes and back. The protocol id
//! travels in every fragment header so a receiver can parse with whatever the
//! sender used; the guest always answers in the protocol of the request.

use crate::remoting::messages::RemoteMessage;
use std::fmt;
use std::sync::Arc;

/// Reserved for raw control payloads such as the startup handshake.
pub const RAW_PROTOCOL_ID: u32 = 0;
pub const JSON_PROTOCOL_ID: u32 = 1;
pub const CBOR_PROTOCOL_ID: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization failed: {0}")]
    Serialize(String),

    #[error("Unparseable payload: {0}")]
    Parse(String),

    #[error("Unknown protocol name: {0}")]
    UnknownName(String),

    #[error("Unknown protocol id: {0}")]
    UnknownId(u32),
}

pub trait RemoteProtocol: Send + Sync + fmt::Debug {
    fn protocol_id(&self) -> u32;
    fn name(&self) -> &'static str;
    fn serialize(&self, message: &RemoteMessage) -> Result<Vec<u8>, ProtocolError>;
    fn parse(&self, bytes: &[u8]) -> Result<RemoteMessage, ProtocolError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProtocol;

impl RemoteProtocol for JsonProtocol {
    fn protocol_id(&self) -> u32 {
        JSON_PROTOCOL_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, message: &RemoteMessage) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(message).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    fn parse(&self, bytes: &[u8]) -> Result<RemoteMessage, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Parse(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CborProtocol;

impl RemoteProtocol for CborProtocol {
    fn protocol_id(&self) -> u32 {
        CBOR_PROTOCOL_ID
    }

    fn name(&self) -> &'static str {
        "cbor"
    }

    fn serialize(&self, message: &RemoteMessage) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        ciborium::into_writer(message, &mut out).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        Ok(out)
    }

    fn parse(&self, bytes: &[u8]) -> Result<RemoteMessage, ProtocolError> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Parse(e.to_string()))
    }
}

pub fn protocol_by_name(name: &str) -> Result<Arc<dyn RemoteProtocol>, ProtocolError> {
    match name.to_ascii_lowercase().as_str() {
        "json" => Ok(Arc::new(JsonProtocol)),
        "cbor" => Ok(Arc::new(CborProtocol)),
        _ => Err(ProtocolError::UnknownName(name.to_string())),
    }
}

pub fn protocol_by_id(id: u32) -> Result<Arc<dyn RemoteProtocol>, ProtocolError> {
    match id {
        JSON_PROTOCOL_ID => Ok(Arc::new(JsonProtocol)),
        CBOR_PROTOCOL_ID => Ok(Arc::new(CborProtocol)),
        _ => Err(ProtocolError::UnknownId(id)),
    }
}

/// Parse with the protocol named by the fragment header.
pub fn parse_with(protocol_id: u32, bytes: &[u8]) -> Result<RemoteMessage, ProtocolError> {
    protocol_by_id(protocol_id)?.parse(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remoting::messages::*;
    use serde_json::json;

    fn execute() -> RemoteMessage {
        RemoteMessage::ExecutePluginRequest(ExecutePluginRequest {
            plugin_id: PluginStrongName::new("weather", 1, 0),
            entry_point: Some("forecast".into()),
            is_retry: false,
            query: json!({"utterance": "will it rain", "confidence": 0.92, "slots": [1, 2, 3]}),
            trace_id: Some("abc".into()),
        })
    }

    // TEST090: Both protocols carry a request with an opaque JSON body intact
    #[test]
    fn test_protocols_preserve_request() {
        for protocol in [protocol_by_name("json").unwrap(), protocol_by_name("CBOR").unwrap()] {
            let bytes = protocol.serialize(&execute()).unwrap();
            assert_eq!(protocol.parse(&bytes).unwrap(), execute(), "{}", protocol.name());
        }
    }

    // TEST091: Unit variants and exceptions survive CBOR
    #[test]
    fn test_cbor_unit_and_exception() {
        let cbor = CborProtocol;
        let req = RemoteMessage::GetAvailablePluginsRequest;
        assert_eq!(cbor.parse(&cbor.serialize(&req).unwrap()).unwrap(), req);

        let failed = RemoteMessage::LoadPluginResponse(RemoteResult::failed(RemoteException::new("Boom", "bad")));
        assert_eq!(cbor.parse(&cbor.serialize(&failed).unwrap()).unwrap(), failed);
    }

    // TEST092: Garbage is a parse error, not a panic
    #[test]
    fn test_parse_garbage() {
        assert!(matches!(JsonProtocol.parse(b"{not json"), Err(ProtocolError::Parse(_))));
        assert!(matches!(CborProtocol.parse(&[0xff, 0x00, 0x13]), Err(ProtocolError::Parse(_))));
        assert!(matches!(JsonProtocol.parse(br#"{"NoSuchVariant": 1}"#), Err(ProtocolError::Parse(_))));
    }

    // TEST093: Lookup by name and id
    #[test]
    fn test_lookup() {
        assert_eq!(protocol_by_id(JSON_PROTOCOL_ID).unwrap().name(), "json");
        assert_eq!(protocol_by_id(CBOR_PROTOCOL_ID).unwrap().name(), "cbor");
        assert_eq!(protocol_by_id(RAW_PROTOCOL_ID).unwrap_err(), ProtocolError::UnknownId(0));
        assert_eq!(
            protocol_by_name("bond").unwrap_err(),
            ProtocolError::UnknownName("bond".into())
        );
    }
}
