//! Media routing core of an SFU (Selective Forwarding Unit) worker.
//!
//! Endpoints publish media as [`Producer`]s and subscribe to other
//! endpoints' media as [`Consumer`]s. A [`Transport`] owns both, routes
//! RTP/RTCP between the wire and the producers/consumers, runs
//! transport-wide congestion control in both directions and schedules
//! compound RTCP.
//!
//! The crate is sans-IO and single-threaded. It opens no sockets and
//! starts no threads. The embedding worker loop:
//!
//! 1. feeds incoming datagrams via [`Transport::receive_rtp_packet`] and
//!    [`Transport::receive_rtcp_packet`] together with a monotonic
//!    millisecond timestamp,
//! 2. drives time forward via [`Transport::handle_timeout`] whenever the
//!    deadline from [`Transport::poll_timeout`] is reached,
//! 3. sends whatever bytes the [`TransportListener`] is handed.
//!
//! Because all state transitions happen on caller-provided timestamps,
//! every control loop in here runs under a virtual clock in tests.

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

use thiserror::Error;

mod time;
pub use time::{Clock, TimerHandle, TimerQueue};

mod rate;
pub use rate::{RateCalculator, RtpDataCounter};

pub mod rtp;
pub mod rtcp;

mod probation;
pub use probation::RtpProbationGenerator;

mod bwe;
pub use bwe::{BweController, NullController, NullPacer, PacerControl, PacingInfo, PacketSendInfo};

mod twcc_server;
pub use twcc_server::TwccServer;

mod twcc_client;
pub use twcc_client::{TwccClient, TwccClientListener};

mod remb;
pub use remb::{RembClient, RembClientEvent, RembServerState};

mod keyframe;
pub use keyframe::KeyFrameRequestManager;

mod listener;
pub use listener::{RtpListener, SctpListener};

mod producer;
pub use producer::{Producer, ProducerKind, ProducerReceiveResult};

mod consumer;
pub use consumer::Consumer;

mod transport;
pub use transport::{Transport, TransportListener, TransportOptions};

pub mod channel;
pub use channel::RequestError;

/// Max size of an outgoing compound RTCP packet.
pub const MAX_RTCP_PACKET_LEN: usize = 1500;

/// Errors arising in the control plane.
///
/// Routing-plane problems (malformed wire data, unroutable packets) are
/// logged and dropped, they never surface as errors.
#[derive(Debug, Error)]
pub enum SfuError {
    /// A produce/consume style request failed. The request is rejected
    /// with the contained reason and any partial state is rolled back.
    #[error("{0}")]
    Request(#[from] channel::RequestError),

    /// JSON from the control channel did not deserialize.
    #[error("invalid control message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}
