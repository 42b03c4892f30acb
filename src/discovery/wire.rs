//! Discovery wire format
//!
//! Length-prefixed frames over a byte stream; each payload is a postcard
//! record. Resource names are cluster-scoped. The first frame on a stream
//! must be `Hello` carrying the proxy token.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{ControlError, Result};
use crate::snapshot::{
    Endpoint, EndpointCluster, EndpointGroup, Listener, ResourceType, RouteRule, SecretsBundle,
};

/// Upper bound on one frame; a full snapshot push must fit.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub resource_type: ResourceType,
    /// Empty set means "all resources of this type".
    pub resource_names: Vec<String>,
    pub last_acked_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resources {
    Listeners(Vec<Listener>),
    Routes(Vec<RouteRule>),
    Clusters(Vec<EndpointCluster>),
    Endpoints(Vec<EndpointGroup>),
}

impl Resources {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resources::Listeners(_) => ResourceType::Listeners,
            Resources::Routes(_) => ResourceType::Routes,
            Resources::Clusters(_) => ResourceType::Clusters,
            Resources::Endpoints(_) => ResourceType::Endpoints,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub resource_type: ResourceType,
    pub version: String,
    pub resources: Resources,
    pub secrets: SecretsBundle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub resource_type: ResourceType,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackFrame {
    pub resource_type: ResourceType,
    pub version: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Initial metadata: the proxy token. Must be the first frame.
    Hello { token: String },
    Subscribe(SubscribeRequest),
    Response(DiscoveryResponse),
    Ack(AckFrame),
    Nack(NackFrame),
    Ping,
    Pong,
    /// Server-initiated close with a reason; the stream ends after this.
    GoAway { reason: String },
}

pub fn encode(frame: &Frame) -> Result<Bytes> {
    let bytes = postcard::to_allocvec(frame)
        .map_err(|e| ControlError::Internal(format!("frame encode: {e}")))?;
    Ok(Bytes::from(bytes))
}

pub fn decode(bytes: &[u8]) -> Result<Frame> {
    postcard::from_bytes(bytes)
        .map_err(|e| ControlError::validation(format!("malformed frame: {e}")))
}

/// Wrap a TCP stream with the length-delimited codec used on both ends.
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_FRAME_BYTES);
    Framed::new(stream, codec)
}
