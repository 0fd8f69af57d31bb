use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::correlation::SubscriptionId;
use crate::CoreError;

/// Represents a message payload moving through the transport
///
/// This is a wrapper around a JSON value; typed decoding happens at the
/// step boundary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DataPacket {
    /// The inner JSON value
    pub value: serde_json::Value,
}

impl DataPacket {
    /// Create a new data packet from a JSON value
    #[inline]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Take ownership of the inner JSON value
    #[inline]
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }

    /// Try to convert the data packet to a specific type
    pub fn to<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.value.clone())
    }

    /// Create a data packet from a serializable value
    pub fn from<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self::new(serde_json::to_value(value)?))
    }
}

/// Stable name of a message type, used to subscribe steps on a transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType(pub String);

impl MessageType {
    /// Message type derived from the Rust type path
    pub fn of<T: ?Sized>() -> Self {
        MessageType(std::any::type_name::<T>().to_string())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payload type that can travel through a transport
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name the transport subscribes on. Override to decouple from the type path.
    fn message_type() -> MessageType {
        MessageType::of::<Self>()
    }
}

/// Transport unit wrapping a serialized message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Unique id of this envelope
    pub id: Uuid,

    /// Type of the wrapped message
    pub message_type: MessageType,

    /// Route the envelope is addressed to; `None` means every subscriber of the type
    pub destination: Option<SubscriptionId>,

    /// Serialized message
    pub payload: DataPacket,

    /// When the envelope was created
    pub sent_at: DateTime<Utc>,

    /// After this instant the transport may discard the envelope
    pub expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Wrap a message in a broadcast envelope
    pub fn wrap<M: Message>(message: &M) -> Result<Self, CoreError> {
        Ok(Self {
            id: Uuid::new_v4(),
            message_type: M::message_type(),
            destination: None,
            payload: DataPacket::from(message)?,
            sent_at: Utc::now(),
            expires_at: None,
        })
    }

    /// Address the envelope to a single subscription
    pub fn addressed_to(mut self, subscription: SubscriptionId) -> Self {
        self.destination = Some(subscription);
        self
    }

    /// Let the transport discard the envelope once `ttl` has passed
    pub fn expiring_after(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.sent_at.checked_add_signed(ttl));
        self
    }

    /// Whether the envelope is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Whether the envelope carries a message of type `M`
    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::message_type()
    }

    /// Decode the payload as `M`
    pub fn decode<M: Message>(&self) -> Result<M, CoreError> {
        if !self.is::<M>() {
            return Err(CoreError::SerializationError(format!(
                "Envelope {} carries {}, not {}",
                self.id,
                self.message_type,
                M::message_type()
            )));
        }
        Ok(self.payload.to::<M>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pong;

    impl Message for Pong {
        fn message_type() -> MessageType {
            MessageType("pong".to_string())
        }
    }

    #[test]
    fn test_data_packet_creation() {
        let packet = DataPacket::new(json!({"name": "test"}));
        assert_eq!(packet.as_value()["name"], "test");
    }

    #[test]
    fn test_envelope_decodes_its_own_type() {
        let envelope = Envelope::wrap(&Ping { n: 7 }).unwrap();
        assert!(envelope.is::<Ping>());
        assert_eq!(envelope.decode::<Ping>().unwrap(), Ping { n: 7 });
    }

    #[test]
    fn test_envelope_refuses_foreign_type() {
        let envelope = Envelope::wrap(&Ping { n: 1 }).unwrap();
        assert!(!envelope.is::<Pong>());
        assert!(matches!(
            envelope.decode::<Pong>(),
            Err(CoreError::SerializationError(_))
        ));
    }

    #[test]
    fn test_custom_message_type_name() {
        assert_eq!(Pong::message_type().0, "pong");
        assert!(Ping::message_type().0.ends_with("Ping"));
    }

    #[test]
    fn test_envelope_expiry() {
        let envelope = Envelope::wrap(&Ping { n: 1 })
            .unwrap()
            .expiring_after(Duration::from_secs(60));
        let sent = envelope.sent_at;
        assert!(!envelope.is_expired_at(sent));
        assert!(envelope.is_expired_at(sent + chrono::Duration::seconds(61)));

        let forever = Envelope::wrap(&Ping { n: 1 }).unwrap();
        assert!(!forever.is_expired_at(sent + chrono::Duration::days(365)));
    }

    #[test]
    fn test_envelope_addressing() {
        let envelope = Envelope::wrap(&Ping { n: 1 })
            .unwrap()
            .addressed_to(SubscriptionId::new("route-a"));
        assert_eq!(envelope.destination, Some(SubscriptionId::new("route-a")));
    }
}
