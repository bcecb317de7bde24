use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Random tag for one sender instance. A participant that rejoins a
/// session gets a new epoch, so its restarted sequence numbers are not
/// taken for duplicates of the old ones.
pub fn new_epoch() -> u64 {
    (uuid::Uuid::new_v4().as_u128() >> 64) as u64
}

/// Opaque identifier scoping one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relay topic carrying signaling for this session.
    pub fn signaling_topic(&self) -> String {
        format!("session:{}", self.0)
    }

    /// Relay topic carrying chat for this session.
    pub fn chat_topic(&self) -> String {
        format!("session:{}:chat", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the call a participant is on.
///
/// Ordering matters: when both peers offer at once, the one whose
/// `(role, id)` sorts lower is the polite peer and yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Initiator,
    Responder,
}

/// A call participant as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: ParticipantRole,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    /// True if this participant must roll back its own offer when it
    /// collides with one from `remote`.
    pub fn is_polite_towards(&self, remote: &RemotePeer) -> bool {
        (self.role, self.id.as_str()) < (remote.role, remote.id.as_str())
    }
}

/// The sending side of a received envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub id: String,
    pub role: ParticipantRole,
}

/// A network path candidate, passed through to the media stack untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Messages exchanged between the two peers of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    #[serde(rename = "ice")]
    IceCandidate { candidate: IceCandidate },
    Bye,
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice",
            Self::Bye => "bye",
        }
    }
}

/// Wire form of a [`SignalingMessage`].
///
/// ```json
/// {"session":"s1","from":"alice","epoch":91,"role":"initiator","seq":3,"type":"offer","payload":{"sdp":"v=0..."}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub session: SessionId,
    pub from: String,
    /// Sender instance; `seq` restarts at 1 for every new epoch.
    #[serde(default)]
    pub epoch: u64,
    pub role: ParticipantRole,
    pub seq: u64,
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl SignalEnvelope {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(text)?;
        if envelope.from.is_empty() {
            return Err(Error::protocol("envelope without sender"));
        }
        Ok(envelope)
    }

    pub fn sender(&self) -> RemotePeer {
        RemotePeer {
            id: self.from.clone(),
            role: self.role,
        }
    }
}

/// A chat line relayed alongside the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub session: SessionId,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub epoch: u64,
    pub seq: u64,
    pub body: String,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub sent_at_ms: i64,
}

impl ChatMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(message: SignalingMessage) -> SignalEnvelope {
        SignalEnvelope {
            session: SessionId::new("s1"),
            from: "alice".into(),
            epoch: 91,
            role: ParticipantRole::Initiator,
            seq: 7,
            message,
        }
    }

    #[test]
    fn test_offer_wire_shape() {
        let text = envelope(SignalingMessage::Offer { sdp: "v=0".into() })
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["payload"]["sdp"], "v=0");
        assert_eq!(value["role"], "initiator");
        assert_eq!(value["epoch"], 91);
    }

    #[test]
    fn test_ice_and_bye_decode() {
        let ice = r#"{"session":"s1","from":"bob","role":"responder","seq":2,
            "type":"ice","payload":{"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.2 5000 typ host"}}}"#;
        let decoded = SignalEnvelope::decode(ice).unwrap();
        assert_eq!(decoded.sender().role, ParticipantRole::Responder);
        assert_eq!(decoded.epoch, 0);
        assert!(matches!(decoded.message, SignalingMessage::IceCandidate { .. }));

        let bye = r#"{"session":"s1","from":"bob","role":"responder","seq":3,"type":"bye"}"#;
        assert_eq!(SignalEnvelope::decode(bye).unwrap().message, SignalingMessage::Bye);
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_missing_sender() {
        let unknown = r#"{"session":"s1","from":"bob","role":"responder","seq":1,"type":"hello"}"#;
        assert!(SignalEnvelope::decode(unknown).is_err());

        let anonymous = r#"{"session":"s1","from":"","role":"responder","seq":1,"type":"bye"}"#;
        assert!(matches!(
            SignalEnvelope::decode(anonymous),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_politeness_uses_role_then_id() {
        let initiator = Participant::new("zed", "Zed", ParticipantRole::Initiator);
        let responder = RemotePeer {
            id: "amy".into(),
            role: ParticipantRole::Responder,
        };
        assert!(initiator.is_polite_towards(&responder));

        let same_role = Participant::new("amy", "Amy", ParticipantRole::Responder);
        let other = RemotePeer {
            id: "bob".into(),
            role: ParticipantRole::Responder,
        };
        assert!(same_role.is_polite_towards(&other));
        let reverse = Participant::new("bob", "Bob", ParticipantRole::Responder);
        let amy = RemotePeer {
            id: "amy".into(),
            role: ParticipantRole::Responder,
        };
        assert!(!reverse.is_polite_towards(&amy));
    }

    #[test]
    fn test_epochs_differ() {
        assert_ne!(new_epoch(), new_epoch());
    }

    #[test]
    fn test_topics() {
        let session = SessionId::new("abc");
        assert_eq!(session.signaling_topic(), "session:abc");
        assert_eq!(session.chat_topic(), "session:abc:chat");
    }
}
