//! Wire types for the sensor control protocol.
//!
//! Message structs carry prost field attributes directly so the crate
//! builds without a protoc toolchain; tags and the service path match the
//! sensor's `sensor.SensorService/Communicate` duplex stream.

use tokio_stream::Stream;

/// Action taken when a runtime filter matches a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FilterAction {
    Ignore = 0,
    Include = 1,
}

/// Inclusive port interval; absent means "any port".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortRange {
    #[prost(uint32, tag = "1")]
    pub begin: u32,
    #[prost(uint32, tag = "2")]
    pub end: u32,
}

/// One CIDR/port filtering rule.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeFilter {
    /// CIDR block, e.g. "10.0.0.0/8". Empty means "any address".
    #[prost(string, tag = "1")]
    pub cidr: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub port_range: ::core::option::Option<PortRange>,
    #[prost(enumeration = "FilterAction", tag = "3")]
    pub action: i32,
}

/// Full filtering configuration pushed by the sensor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeFilteringConfiguration {
    #[prost(string, tag = "1")]
    pub cluster_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub filters: ::prost::alloc::vec::Vec<RuntimeFilter>,
}

/// Acknowledgement for a received filtering configuration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeFiltersAck {}

/// Protocol of a reported connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum L4Protocol {
    Tcp = 0,
    Udp = 1,
}

/// Role of a reported connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionRole {
    Server = 0,
    Client = 1,
}

/// One connection in a [`ConnectionUpdate`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionRecord {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub local_address: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub local_port: u32,
    #[prost(string, tag = "4")]
    pub remote_address: ::prost::alloc::string::String,
    #[prost(uint32, tag = "5")]
    pub remote_port: u32,
    #[prost(enumeration = "L4Protocol", tag = "6")]
    pub protocol: i32,
    #[prost(enumeration = "ConnectionRole", tag = "7")]
    pub role: i32,
}

/// Periodic connection diff pushed to the sensor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionUpdate {
    #[prost(message, repeated, tag = "1")]
    pub added: ::prost::alloc::vec::Vec<ConnectionRecord>,
    #[prost(message, repeated, tag = "2")]
    pub removed: ::prost::alloc::vec::Vec<ConnectionRecord>,
    #[prost(uint64, tag = "3")]
    pub timestamp_us: u64,
}

/// Envelope for sensor-to-collector messages. Kinds beyond the known
/// oneof variants decode to `msg: None` and are dropped by the client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MsgToCollector {
    #[prost(oneof = "msg_to_collector::Msg", tags = "1")]
    pub msg: ::core::option::Option<msg_to_collector::Msg>,
}

pub mod msg_to_collector {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        RuntimeFilteringConfiguration(super::RuntimeFilteringConfiguration),
    }
}

/// Envelope for collector-to-sensor messages.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MsgFromCollector {
    #[prost(oneof = "msg_from_collector::Msg", tags = "1, 2")]
    pub msg: ::core::option::Option<msg_from_collector::Msg>,
}

pub mod msg_from_collector {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        RuntimeFiltersAck(super::RuntimeFiltersAck),
        #[prost(message, tag = "2")]
        ConnectionUpdate(super::ConnectionUpdate),
    }
}

/// Client for the sensor's duplex control stream.
pub struct SensorServiceClient {
    inner: tonic::client::Grpc<tonic::transport::Channel>,
}

impl SensorServiceClient {
    pub fn new(channel: tonic::transport::Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Opens the bidirectional `Communicate` stream.
    pub async fn communicate<S>(
        &mut self,
        request: tonic::Request<S>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<MsgToCollector>>, tonic::Status>
    where
        S: Stream<Item = MsgFromCollector> + Send + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("channel not ready: {e}")))?;

        let codec: tonic::codec::ProstCodec<MsgFromCollector, MsgToCollector> =
            tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/sensor.SensorService/Communicate");

        self.inner.streaming(request, path, codec).await
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_msg_to_collector_roundtrip() {
        let msg = MsgToCollector {
            msg: Some(msg_to_collector::Msg::RuntimeFilteringConfiguration(
                RuntimeFilteringConfiguration {
                    cluster_id: "cluster-a".to_string(),
                    filters: vec![RuntimeFilter {
                        cidr: "10.0.0.0/8".to_string(),
                        port_range: Some(PortRange { begin: 80, end: 90 }),
                        action: FilterAction::Ignore as i32,
                    }],
                },
            )),
        };

        let bytes = msg.encode_to_vec();
        let decoded = MsgToCollector::decode(bytes.as_slice()).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_message_kind_decodes_to_none() {
        // A message using an unknown field tag (well beyond the oneof).
        let mut bytes = Vec::new();
        RuntimeFiltersAck {}
            .encode_length_delimited(&mut bytes)
            .expect("encode");

        // Field 15, wire type 2 (length-delimited).
        let mut framed = vec![(15u8 << 3) | 2];
        framed.extend_from_slice(&bytes);

        let decoded = MsgToCollector::decode(framed.as_slice()).expect("decode");
        assert!(decoded.msg.is_none());
    }

    #[test]
    fn test_filter_action_from_raw() {
        assert_eq!(FilterAction::try_from(0).ok(), Some(FilterAction::Ignore));
        assert_eq!(FilterAction::try_from(1).ok(), Some(FilterAction::Include));
        assert!(FilterAction::try_from(7).is_err());
    }
}
