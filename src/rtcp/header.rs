use super::FeedbackMessageType;

/// The first 4 bytes of every RTCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    /// The packet type.
    pub rtcp_type: RtcpType,
    /// The 5 bit count/fmt field, interpretation depends on the type.
    pub feedback_message_type: FeedbackMessageType,
    /// Length of the packet in words (4 bytes), minus one.
    pub words_less_one: u16,
}

impl RtcpHeader {
    /// Type of RTCP packet this is.
    pub fn rtcp_type(&self) -> RtcpType {
        self.rtcp_type
    }

    /// The count/fmt field.
    pub fn feedback_message_type(&self) -> FeedbackMessageType {
        self.feedback_message_type
    }

    /// Number of reports/chunks when the type has a count.
    pub fn count(&self) -> usize {
        self.feedback_message_type.count() as usize
    }

    /// Length of the entire packet, header included, in words.
    pub fn length_words(&self) -> usize {
        self.words_less_one as usize + 1
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) -> usize {
        let fmt: u8 = self.feedback_message_type.into();
        buf[0] = 0b10_0_00000 | (fmt & 0b0001_1111);
        buf[1] = self.rtcp_type as u8;
        buf[2..4].copy_from_slice(&self.words_less_one.to_be_bytes());
        4
    }
}

impl<'a> TryFrom<&'a [u8]> for RtcpHeader {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 4 {
            return Err("Less than 4 bytes for RtcpHeader");
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            return Err("RTCP version is not 2");
        }

        let fmt_field = buf[0] & 0b0001_1111;
        let rtcp_type: RtcpType = buf[1].try_into()?;

        let feedback_message_type = match rtcp_type {
            RtcpType::SenderReport | RtcpType::ReceiverReport => {
                FeedbackMessageType::ReceptionReport(fmt_field)
            }
            RtcpType::SourceDescription | RtcpType::Goodbye => {
                FeedbackMessageType::SourceCount(fmt_field)
            }
            RtcpType::ApplicationDefined => FeedbackMessageType::Subtype(fmt_field),
            RtcpType::TransportLayerFeedback => {
                FeedbackMessageType::TransportFeedback(fmt_field.try_into()?)
            }
            RtcpType::PayloadSpecificFeedback => {
                FeedbackMessageType::PayloadFeedback(fmt_field.try_into()?)
            }
            RtcpType::ExtendedReport => FeedbackMessageType::NotUsed,
        };

        let words_less_one = u16::from_be_bytes([buf[2], buf[3]]);

        Ok(RtcpHeader {
            rtcp_type,
            feedback_message_type,
            words_less_one,
        })
    }
}

/// RTCP packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpType {
    /// SR
    SenderReport = 200,
    /// RR
    ReceiverReport = 201,
    /// SDES
    SourceDescription = 202,
    /// BYE
    Goodbye = 203,
    /// APP
    ApplicationDefined = 204,
    /// RTPFB. NACK and transport-wide CC live under this type.
    TransportLayerFeedback = 205,
    /// PSFB. PLI, FIR and REMB (AFB) live under this type.
    PayloadSpecificFeedback = 206,
    /// XR
    ExtendedReport = 207,
}

impl TryFrom<u8> for RtcpType {
    type Error = &'static str;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use RtcpType::*;
        match v {
            200 => Ok(SenderReport),
            201 => Ok(ReceiverReport),
            202 => Ok(SourceDescription),
            203 => Ok(Goodbye),
            204 => Ok(ApplicationDefined),
            205 => Ok(TransportLayerFeedback),
            206 => Ok(PayloadSpecificFeedback),
            207 => Ok(ExtendedReport),
            _ => {
                trace!("Unknown RtcpType: {}", v);
                Err("Unknown RtcpType")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = RtcpHeader {
            rtcp_type: RtcpType::ReceiverReport,
            feedback_message_type: FeedbackMessageType::ReceptionReport(2),
            words_less_one: 13,
        };

        let mut buf = [0_u8; 4];
        header.write_to(&mut buf);
        assert_eq!(buf, [0x82, 201, 0, 13]);

        let parsed: RtcpHeader = buf.as_slice().try_into().unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn reject_wrong_version() {
        let buf = [0x42, 201, 0, 1];
        assert!(RtcpHeader::try_from(buf.as_slice()).is_err());
    }
}
