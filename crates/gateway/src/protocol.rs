//! Downstream protocol: commands consumed from clients and events emitted
//! back, as `{ "event": <name>, "data": <payload> }` JSON messages.

use exchange::OpenPositionRequest;
use normalizer::AccountFlavor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Client → Gateway Commands
// ============================================================================

/// Command sent by a downstream client. Names are part of the compatibility
/// contract with deployed clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Open an upstream session with the given credential.
    Authenticate(AuthenticateRequest),
    /// Switch candle streaming to another instrument. The payload shape
    /// varies by client generation; see the asset registry resolver.
    SubscribeActive(Value),
    /// Raw pass-through of an upstream envelope.
    #[serde(rename = "sendMessage")]
    SendMessage(Value),
    /// Place a binary option order.
    OpenPosition(OpenPositionRequest),
    /// Report the cached balance.
    GetBalance,
    /// Tear the session down.
    Disconnect,
}

/// Payload of the `authenticate` command.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticateRequest {
    /// Opaque session token, replayed verbatim to upstream.
    #[serde(alias = "ssid", alias = "token")]
    pub credential: String,
    /// Which account the session trades against.
    #[serde(default, alias = "balance")]
    pub account_flavor: AccountFlavor,
}

// ============================================================================
// Gateway → Client Events
// ============================================================================

/// Event emitted to a downstream client.
///
/// Event names are open-ended: beyond the fixed proxy events, any upstream
/// frame is forwarded verbatim under its own name, so this is a name/payload
/// pair rather than a closed enum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownstreamEvent {
    #[serde(rename = "event")]
    pub name: String,
    pub data: Value,
}

impl DownstreamEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", json!({"message": message.into()}))
    }

    pub fn disconnected() -> Self {
        Self::new("disconnected", Value::Null)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"event\":\"error\"}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authenticate_command() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"event": "authenticate", "data": {"credential": "abc", "account_flavor": "demo"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Authenticate(req) => {
                assert_eq!(req.credential, "abc");
                assert_eq!(req.account_flavor, AccountFlavor::Demo);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_authenticate_aliases_and_default_flavor() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"event": "authenticate", "data": {"ssid": "xyz"}}"#).unwrap();
        match cmd {
            ClientCommand::Authenticate(req) => {
                assert_eq!(req.credential, "xyz");
                assert_eq!(req.account_flavor, AccountFlavor::Real);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_kebab_case_command_names() {
        assert!(matches!(
            serde_json::from_str(r#"{"event": "subscribe-active", "data": "EURUSD-OTC"}"#),
            Ok(ClientCommand::SubscribeActive(_))
        ));
        assert!(matches!(
            serde_json::from_str(r#"{"event": "open-position", "data": {"direction": "call"}}"#),
            Ok(ClientCommand::OpenPosition(_))
        ));
        assert!(matches!(
            serde_json::from_str(r#"{"event": "get-balance"}"#),
            Ok(ClientCommand::GetBalance)
        ));
        assert!(matches!(
            serde_json::from_str(r#"{"event": "sendMessage", "data": {"name": "ping"}}"#),
            Ok(ClientCommand::SendMessage(_))
        ));
        assert!(matches!(
            serde_json::from_str(r#"{"event": "disconnect"}"#),
            Ok(ClientCommand::Disconnect)
        ));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = DownstreamEvent::new("ping-proxy", json!({"t": 1700000000000u64}));
        assert_eq!(
            event.to_text(),
            r#"{"event":"ping-proxy","data":{"t":1700000000000}}"#
        );
    }

    #[test]
    fn test_error_event() {
        let event = DownstreamEvent::error("Ativo desconhecido: ZZZ-OTC");
        assert_eq!(event.name, "error");
        assert_eq!(event.data["message"], "Ativo desconhecido: ZZZ-OTC");
    }
}
