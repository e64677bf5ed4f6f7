use crate::rtp::Ssrc;

use super::{FeedbackMessageType, PayloadType, RtcpHeader, RtcpPacket, RtcpType};

const UNIQUE_IDENTIFIER: [u8; 4] = [b'R', b'E', b'M', b'B'];

/// Largest value of the 18 bit mantissa.
const MANTISSA_MAX: u64 = (1 << 18) - 1;

/// Bytes between the common header and the SSRC list: sender SSRC,
/// media SSRC (zero), "REMB", num-SSRC + exponent + mantissa.
const FIXED_PART: usize = 16;

/// Receiver Estimated Maximum Bitrate, an application-layer feedback.
///
/// The bitrate is carried as an 18 bit mantissa shifted by a 6 bit
/// exponent, so large values lose precision: serializing floors the
/// mantissa. The REMB client consumes the decoded bits-per-second value
/// directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remb {
    /// Sender of this feedback. Mostly irrelevant, but part of RTCP packets.
    pub sender_ssrc: Ssrc,
    /// Media SSRC, zero by definition for REMB.
    pub ssrc: Ssrc,
    /// Estimated maximum bitrate in bits per second.
    pub bitrate: u64,
    /// The streams the estimate applies to.
    pub ssrcs: Vec<u32>,
}

impl Remb {
    /// Split the bitrate into the wire's mantissa/exponent pair,
    /// flooring to what 18 bits can hold.
    fn to_mantissa_exp(&self) -> (u64, u8) {
        let mut mantissa = self.bitrate;
        let mut exp = 0_u8;

        while mantissa > MANTISSA_MAX {
            mantissa >>= 1;
            exp += 1;
        }

        (mantissa, exp)
    }
}

impl RtcpPacket for Remb {
    fn header(&self) -> RtcpHeader {
        RtcpHeader {
            rtcp_type: RtcpType::PayloadSpecificFeedback,
            feedback_message_type: FeedbackMessageType::PayloadFeedback(
                PayloadType::ApplicationLayer,
            ),
            words_less_one: (self.length_words() - 1) as u16,
        }
    }

    fn length_words(&self) -> usize {
        1 + FIXED_PART / 4 + self.ssrcs.len()
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let (mantissa, exp) = self.to_mantissa_exp();

        self.header().write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].fill(0);
        buf[12..16].copy_from_slice(&UNIQUE_IDENTIFIER);

        buf[16] = self.ssrcs.len() as u8;
        buf[17] = (exp << 2) | (mantissa >> 16) as u8;
        buf[18] = (mantissa >> 8) as u8;
        buf[19] = mantissa as u8;

        let mut offset = 4 + FIXED_PART;
        for ssrc in &self.ssrcs {
            buf[offset..offset + 4].copy_from_slice(&ssrc.to_be_bytes());
            offset += 4;
        }

        offset
    }
}

impl<'a> TryFrom<&'a [u8]> for Remb {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < FIXED_PART {
            return Err("Remb less than 16 bytes");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();

        let media_ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if media_ssrc != 0 {
            return Err("Remb media ssrc must be zero");
        }

        if buf[8..12] != UNIQUE_IDENTIFIER {
            return Err("Missing remb identifier");
        }

        let ssrcs_len = buf[12] as usize;

        let exp = buf[13] >> 2;
        let mantissa =
            (((buf[13] & 0b11) as u64) << 16) | ((buf[14] as u64) << 8) | buf[15] as u64;

        // Saturate rather than wrap when the exponent pushes the
        // mantissa past 64 bits.
        let bitrate = if (exp as u32) > mantissa.leading_zeros() {
            u64::MAX
        } else {
            mantissa << exp
        };

        let mut ssrcs = Vec::with_capacity(ssrcs_len);
        for i in 0..ssrcs_len {
            let at = FIXED_PART + i * 4;
            if buf.len() < at + 4 {
                return Err("Remb has fewer ssrcs than num ssrc");
            }
            ssrcs.push(u32::from_be_bytes([
                buf[at],
                buf[at + 1],
                buf[at + 2],
                buf[at + 3],
            ]));
        }

        Ok(Remb {
            sender_ssrc,
            ssrc: 0.into(),
            bitrate,
            ssrcs,
        })
    }
}
