/// Meaning of the 5 bit count/fmt field in the RTCP header.
///
/// Report-carrying types use it as an item count; feedback types use it
/// as the feedback message subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackMessageType {
    /// Number of reception reports, for SR and RR.
    ReceptionReport(u8),

    /// Number of chunks/sources, for SDES and BYE.
    SourceCount(u8),

    /// Application defined subtype, for APP.
    Subtype(u8),

    /// Which transport-layer feedback this is (RTPFB).
    TransportFeedback(TransportType),

    /// Which payload-specific feedback this is (PSFB).
    PayloadFeedback(PayloadType),

    /// The field carries nothing (XR).
    NotUsed,
}

impl FeedbackMessageType {
    pub fn count(&self) -> u8 {
        match self {
            FeedbackMessageType::ReceptionReport(v) => *v,
            FeedbackMessageType::SourceCount(v) => *v,
            _ => panic!("Not a count"),
        }
    }
}

impl From<FeedbackMessageType> for u8 {
    fn from(val: FeedbackMessageType) -> Self {
        use FeedbackMessageType::*;
        match val {
            ReceptionReport(v) | SourceCount(v) | Subtype(v) => {
                assert!(v <= 31, "rtcp fmt when count must be <= 31");
                v
            }
            TransportFeedback(v) => v as u8,
            PayloadFeedback(v) => v as u8,
            NotUsed => 0,
        }
    }
}

/// Transport-layer feedback subtypes the router handles.
///
/// Both reach a consumer: NACK triggers retransmission from the send
/// history, transport-wide feedback drives the bandwidth estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Generic negative acknowledgement (RFC 4585).
    Nack = 1,

    /// Transport-wide congestion control feedback
    /// (draft-holmer-rmcat-transport-wide-cc-extensions-01).
    TransportWide = 15,
}

impl TryFrom<u8> for TransportType {
    type Error = &'static str;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(TransportType::Nack),
            15 => Ok(TransportType::TransportWide),
            _ => {
                trace!("Unknown TransportType: {}", v);
                Err("Unknown TransportType")
            }
        }
    }
}

/// Payload-specific feedback subtypes.
///
/// PLI and FIR feed the key frame request path; the application layer
/// subtype carries REMB. SLI and RPSI are recognised so their packets
/// are skipped cleanly, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// Picture loss indication (RFC 4585).
    PictureLossIndication = 1,

    /// Slice loss indication (RFC 4585).
    SliceLossIndication = 2,

    /// Reference picture selection indication (RFC 4585).
    ReferencePictureSelectionIndication = 3,

    /// Full intra request (RFC 5104).
    FullIntraRequest = 4,

    /// Application layer feedback (RFC 4585), home of REMB.
    ApplicationLayer = 15,
}

impl TryFrom<u8> for PayloadType {
    type Error = &'static str;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use PayloadType::*;
        match v {
            1 => Ok(PictureLossIndication),
            2 => Ok(SliceLossIndication),
            3 => Ok(ReferencePictureSelectionIndication),
            4 => Ok(FullIntraRequest),
            15 => Ok(ApplicationLayer),
            _ => {
                trace!("Unknown PayloadType: {}", v);
                Err("Unknown PayloadType")
            }
        }
    }
}
