use crate::rtp::Ssrc;

use super::{FeedbackMessageType, PayloadType, RtcpHeader, RtcpPacket, RtcpType};

/// Picture Loss Indication.
///
/// An endpoint sends this when its decoder lost the picture. Inbound,
/// the router resolves the media SSRC to a consumer and asks the bound
/// producer for a key frame; outbound, the key frame request manager
/// emits one towards the publishing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pli {
    /// Sender of this feedback. Mostly irrelevant, but part of RTCP packets.
    pub sender_ssrc: Ssrc,
    /// The stream a key frame is needed for.
    pub ssrc: Ssrc,
}

impl Pli {
    /// A request for a key frame on `ssrc`, as the router emits it.
    pub fn new(ssrc: Ssrc) -> Pli {
        Pli {
            sender_ssrc: 0.into(),
            ssrc,
        }
    }
}

impl RtcpPacket for Pli {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            feedback_message_type: FeedbackMessageType::PayloadFeedback(
                PayloadType::PictureLossIndication,
            ),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        // header + sender SSRC + media SSRC, no FCI
        3
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.length_words() * 4
    }
}

impl<'a> TryFrom<&'a [u8]> for Pli {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 8 {
            return Err("Pli less than 8 bytes");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into();

        Ok(Pli { sender_ssrc, ssrc })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_frame_request_roundtrip() {
        let pli = Pli::new(1111.into());

        let mut buf = vec![0; 16];
        let n = pli.write_to(&mut buf);
        assert_eq!(n, 12);
        buf.truncate(n);

        // Fixed header for a PLI of 3 words.
        assert_eq!(&buf[..4], &[0x81, 206, 0, 2]);

        let parsed = Pli::try_from(&buf[4..]).unwrap();
        assert_eq!(parsed, pli);
    }

    #[test]
    fn truncated_pli_is_an_error() {
        let short = [0u8; 7];
        assert!(Pli::try_from(short.as_slice()).is_err());
    }
}
