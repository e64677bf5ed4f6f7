//! JSON control-channel request/response types.
//!
//! The worker receives requests over a JSON pipe:
//! `{ method, internal: { transportId, producerId?, consumerId? }, data }`.
//! Parsing the pipe framing is out of scope here; this module defines the
//! typed shape of what arrives and what goes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A control-plane request failed. The request is answered with
/// [`Response::Reject`] and partial state has been rolled back.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Something about the referenced entities is wrong (duplicate id,
    /// missing id, SSRC collision).
    #[error("{0}")]
    Failed(String),

    /// A data field is missing or has the wrong type.
    #[error("{0}")]
    TypeError(String),
}

/// Methods the transport consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    TransportSetMaxIncomingBitrate,
    TransportProduce,
    TransportConsume,
    TransportDump,
    TransportGetStats,
    ProducerClose,
    ProducerDump,
    ProducerGetStats,
    ProducerPause,
    ProducerResume,
    ProducerRequestKeyFrame,
    ConsumerClose,
    ConsumerDump,
    ConsumerGetStats,
    ConsumerPause,
    ConsumerResume,
    ConsumerSetPreferredLayers,
    ConsumerRequestKeyFrame,
}

/// One request as read from the control channel.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub method: Method,
    #[serde(default)]
    pub internal: Internal,
    #[serde(default)]
    pub data: Value,
}

/// Routing ids of a request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    pub transport_id: Option<String>,
    pub producer_id: Option<String>,
    pub consumer_id: Option<String>,
    pub data_producer_id: Option<String>,
    pub data_consumer_id: Option<String>,
}

/// Answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Accept {
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Reject {
        error: String,
    },
}

impl Response {
    pub fn accept() -> Response {
        Response::Accept {
            accepted: true,
            data: None,
        }
    }

    pub fn accept_data(data: Value) -> Response {
        Response::Accept {
            accepted: true,
            data: Some(data),
        }
    }

    pub fn reject(error: impl ToString) -> Response {
        Response::Reject {
            error: error.to_string(),
        }
    }
}

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// `data` of TRANSPORT_PRODUCE.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceData {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParametersData,
    #[serde(default)]
    pub paused: bool,
}

/// `data` of TRANSPORT_CONSUME. The rtp parameters describe the stream
/// the consumer sends towards its endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParametersData,
    #[serde(default)]
    pub paused: bool,
}

/// Subset of RTP parameters the routing core needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParametersData {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub encodings: Vec<EncodingData>,
    #[serde(default)]
    pub header_extensions: Vec<HeaderExtensionData>,
    #[serde(default)]
    pub rtcp: RtcpParametersData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingData {
    #[serde(default)]
    pub ssrc: Option<u32>,
    #[serde(default)]
    pub rid: Option<String>,
    /// Retransmission stream, when negotiated.
    #[serde(default)]
    pub rtx: Option<RtxData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RtxData {
    pub ssrc: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderExtensionData {
    pub uri: String,
    pub id: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParametersData {
    #[serde(default)]
    pub cname: Option<String>,
}

/// `data` of TRANSPORT_SET_MAX_INCOMING_BITRATE.
#[derive(Debug, Clone, Deserialize)]
pub struct SetMaxIncomingBitrateData {
    pub bitrate: u32,
}

/// `data` of CONSUMER_SET_PREFERRED_LAYERS.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredLayers {
    pub spatial_layer: u8,
    #[serde(default)]
    pub temporal_layer: Option<u8>,
}
