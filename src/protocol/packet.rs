//! Broker packets
//!
//! A packet is `{method, data, request_id?}`. The method must belong to the
//! allow-list of its direction; `request_id` marks a correlated request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::{decode_json, encode_json, BROKER_DELIMITER};
use crate::error::ProtocolError;

/// Methods the referee may send to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutMethod {
    Set,
    Select,
    Stdout,
    Stderr,
    Result,
    Error,
    Status,
    PreTest,
    PostTest,
    Custom,
}

impl OutMethod {
    pub const ALL: [OutMethod; 10] = [
        OutMethod::Set,
        OutMethod::Select,
        OutMethod::Stdout,
        OutMethod::Stderr,
        OutMethod::Result,
        OutMethod::Error,
        OutMethod::Status,
        OutMethod::PreTest,
        OutMethod::PostTest,
        OutMethod::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutMethod::Set => "set",
            OutMethod::Select => "select",
            OutMethod::Stdout => "stdout",
            OutMethod::Stderr => "stderr",
            OutMethod::Result => "result",
            OutMethod::Error => "error",
            OutMethod::Status => "status",
            OutMethod::PreTest => "pre_test",
            OutMethod::PostTest => "post_test",
            OutMethod::Custom => "custom",
        }
    }
}

/// Methods the broker may send to the referee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InMethod {
    SelectResult,
    GetStatus,
    Cancel,
}

impl InMethod {
    pub const ALL: [InMethod; 3] = [InMethod::SelectResult, InMethod::GetStatus, InMethod::Cancel];

    pub fn as_str(&self) -> &'static str {
        match self {
            InMethod::SelectResult => "select_result",
            InMethod::GetStatus => "get_status",
            InMethod::Cancel => "cancel",
        }
    }
}

macro_rules! method_str_impls {
    ($ty:ty) => {
        impl FromStr for $ty {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <$ty>::ALL
                    .iter()
                    .copied()
                    .find(|m| m.as_str() == s)
                    .ok_or_else(|| ProtocolError::MethodNotAllowed(s.to_string()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

method_str_impls!(OutMethod);
method_str_impls!(InMethod);

/// `result.data.action` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultAction {
    Run,
    Check,
    TryIt,
}

impl ResultAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultAction::Run => "run",
            ResultAction::Check => "check",
            ResultAction::TryIt => "try_it",
        }
    }
}

impl FromStr for ResultAction {
    type Err = crate::error::SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(ResultAction::Run),
            "check" => Ok(ResultAction::Check),
            "try_it" => Ok(ResultAction::TryIt),
            other => Err(crate::error::SessionError::InvalidResultAction(
                other.to_string(),
            )),
        }
    }
}

/// Broker packet, generic over the direction's method set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet<M> {
    pub method: M,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

pub type OutPacket = Packet<OutMethod>;
pub type InPacket = Packet<InMethod>;

/// Wire shape before the method is checked against the allow-list
#[derive(Debug, Deserialize)]
struct RawPacket {
    method: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    request_id: Option<String>,
}

impl<M> Packet<M>
where
    M: Serialize + FromStr<Err = ProtocolError>,
{
    pub fn new(method: M, data: Value, request_id: Option<String>) -> Self {
        Self {
            method,
            data,
            request_id,
        }
    }

    /// Build a packet from a method name, validating it against the allow-list
    pub fn from_method_name(
        method: &str,
        data: Value,
        request_id: Option<String>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(method.parse()?, data, request_id))
    }

    /// Encode as one newline-terminated frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_json(self, BROKER_DELIMITER)
    }

    /// Decode one frame payload
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawPacket = decode_json(frame)?;
        Self::from_method_name(&raw.method, raw.data, raw.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strip(mut bytes: Vec<u8>) -> Vec<u8> {
        assert_eq!(bytes.pop(), Some(BROKER_DELIMITER));
        bytes
    }

    #[test]
    fn test_out_packet_roundtrip_for_every_method() {
        for method in OutMethod::ALL {
            let packet = OutPacket::new(method, json!({"line": "x"}), Some("abc".into()));
            let decoded = OutPacket::decode(&strip(packet.encode().unwrap())).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_in_packet_roundtrip_without_request_id() {
        for method in InMethod::ALL {
            let packet = InPacket::new(method, Value::Null, None);
            let decoded = InPacket::decode(&strip(packet.encode().unwrap())).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_decode_rejects_method_outside_allow_list() {
        let err = InPacket::decode(br#"{"method":"stdout","data":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MethodNotAllowed(m) if m == "stdout"));

        let err = OutPacket::decode(br#"{"method":"cancel"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MethodNotAllowed(_)));
    }

    #[test]
    fn test_decode_rejects_missing_method_and_bad_json() {
        assert!(matches!(
            InPacket::decode(br#"{"data":1}"#),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            InPacket::decode(b"{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_construct_with_unlisted_method_fails() {
        assert!(OutPacket::from_method_name("select_result", Value::Null, None).is_err());
        assert!(OutPacket::from_method_name("pre_test", Value::Null, None).is_ok());
    }

    #[test]
    fn test_request_id_omitted_when_absent() {
        let bytes = OutPacket::new(OutMethod::Stdout, json!("hi"), None)
            .encode()
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("request_id"));
    }

    #[test]
    fn test_result_action_parse() {
        assert_eq!("try_it".parse::<ResultAction>().unwrap(), ResultAction::TryIt);
        assert!("console".parse::<ResultAction>().is_err());
    }
}
