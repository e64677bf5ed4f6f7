/// RTP header extensions recognised by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionUri {
    /// <http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time>
    AbsSendTime,
    /// <http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01>
    TransportWideCc01,
    /// <urn:ietf:params:rtp-hdrext:sdes:mid>
    Mid,
    /// <urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id>
    Rid,
    /// <urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id>
    RepairedRid,
    /// <http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07>
    FrameMarking,
    /// <urn:ietf:params:rtp-hdrext:ssrc-audio-level>
    SsrcAudioLevel,
    /// <urn:3gpp:video-orientation>
    VideoOrientation,
    /// <urn:ietf:params:rtp-hdrext:toffset>
    Toffset,
}

const EXT_URI: &[(ExtensionUri, &str)] = &[
    (
        ExtensionUri::AbsSendTime,
        "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
    ),
    (
        ExtensionUri::TransportWideCc01,
        "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
    ),
    (
        ExtensionUri::Mid, //
        "urn:ietf:params:rtp-hdrext:sdes:mid",
    ),
    (
        ExtensionUri::Rid,
        "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
    ),
    (
        ExtensionUri::RepairedRid,
        "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
    ),
    (
        ExtensionUri::FrameMarking,
        "http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07",
    ),
    (
        ExtensionUri::SsrcAudioLevel,
        "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
    ),
    (
        ExtensionUri::VideoOrientation, //
        "urn:3gpp:video-orientation",
    ),
    (
        ExtensionUri::Toffset, //
        "urn:ietf:params:rtp-hdrext:toffset",
    ),
];

impl ExtensionUri {
    pub fn from_uri(uri: &str) -> Option<Self> {
        EXT_URI
            .iter()
            .find(|(_, spec)| *spec == uri)
            .map(|(t, _)| *t)
    }

    pub fn as_uri(&self) -> &'static str {
        EXT_URI
            .iter()
            .find(|(t, _)| t == self)
            .map(|(_, spec)| *spec)
            .expect("uri for extension")
    }
}

/// Header extension id table.
///
/// Ids are negotiated per producer in signaling, but the bandwidth related
/// ones are shared by everything flowing over one transport: the transport
/// copies the first producer's ids and keeps them for its lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionIds {
    pub mid: Option<u8>,
    pub rid: Option<u8>,
    pub rrid: Option<u8>,
    pub abs_send_time: Option<u8>,
    pub transport_wide_cc01: Option<u8>,
    pub frame_marking: Option<u8>,
    pub ssrc_audio_level: Option<u8>,
    pub video_orientation: Option<u8>,
    pub toffset: Option<u8>,
}

impl ExtensionIds {
    /// Build from `(uri, id)` pairs as they appear in producer
    /// parameters. Unknown URIs and out of range ids are skipped.
    pub fn from_pairs<'a>(pairs: impl Iterator<Item = (&'a str, u8)>) -> Self {
        let mut ids = ExtensionIds::default();

        for (uri, id) in pairs {
            if id == 0 || id > 14 {
                debug!("header extension id out of one-byte range: {}", id);
                continue;
            }
            let Some(ext) = ExtensionUri::from_uri(uri) else {
                trace!("unknown header extension uri: {}", uri);
                continue;
            };
            let slot = match ext {
                ExtensionUri::Mid => &mut ids.mid,
                ExtensionUri::Rid => &mut ids.rid,
                ExtensionUri::RepairedRid => &mut ids.rrid,
                ExtensionUri::AbsSendTime => &mut ids.abs_send_time,
                ExtensionUri::TransportWideCc01 => &mut ids.transport_wide_cc01,
                ExtensionUri::FrameMarking => &mut ids.frame_marking,
                ExtensionUri::SsrcAudioLevel => &mut ids.ssrc_audio_level,
                ExtensionUri::VideoOrientation => &mut ids.video_orientation,
                ExtensionUri::Toffset => &mut ids.toffset,
            };
            *slot = Some(id);
        }

        ids
    }

    /// Adopt ids from `other` for any slot not set yet. The transport
    /// calls this when a producer is added, so the first producer wins.
    pub fn merge_from(&mut self, other: &ExtensionIds) {
        fn fill(slot: &mut Option<u8>, v: Option<u8>) {
            if slot.is_none() {
                *slot = v;
            }
        }

        fill(&mut self.mid, other.mid);
        fill(&mut self.rid, other.rid);
        fill(&mut self.rrid, other.rrid);
        fill(&mut self.abs_send_time, other.abs_send_time);
        fill(&mut self.transport_wide_cc01, other.transport_wide_cc01);
        fill(&mut self.frame_marking, other.frame_marking);
        fill(&mut self.ssrc_audio_level, other.ssrc_audio_level);
        fill(&mut self.video_orientation, other.video_orientation);
        fill(&mut self.toffset, other.toffset);
    }

    /// Reverse lookup of what a given wire id means.
    pub(crate) fn uri_of(&self, id: u8) -> Option<ExtensionUri> {
        let id = Some(id);
        if id == self.mid {
            Some(ExtensionUri::Mid)
        } else if id == self.rid {
            Some(ExtensionUri::Rid)
        } else if id == self.rrid {
            Some(ExtensionUri::RepairedRid)
        } else if id == self.abs_send_time {
            Some(ExtensionUri::AbsSendTime)
        } else if id == self.transport_wide_cc01 {
            Some(ExtensionUri::TransportWideCc01)
        } else if id == self.frame_marking {
            Some(ExtensionUri::FrameMarking)
        } else if id == self.ssrc_audio_level {
            Some(ExtensionUri::SsrcAudioLevel)
        } else if id == self.video_orientation {
            Some(ExtensionUri::VideoOrientation)
        } else if id == self.toffset {
            Some(ExtensionUri::Toffset)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_pairs_skips_unknown() {
        let ids = ExtensionIds::from_pairs(
            [
                ("urn:ietf:params:rtp-hdrext:sdes:mid", 4),
                ("http://example.com/not-a-thing", 5),
                (
                    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
                    3,
                ),
                ("urn:3gpp:video-orientation", 0),
            ]
            .into_iter(),
        );

        assert_eq!(ids.mid, Some(4));
        assert_eq!(ids.transport_wide_cc01, Some(3));
        assert_eq!(ids.video_orientation, None);
    }

    #[test]
    fn first_producer_wins() {
        let mut table = ExtensionIds::default();

        let a = ExtensionIds {
            abs_send_time: Some(2),
            mid: Some(4),
            ..Default::default()
        };
        let b = ExtensionIds {
            abs_send_time: Some(7),
            rid: Some(10),
            ..Default::default()
        };

        table.merge_from(&a);
        table.merge_from(&b);

        assert_eq!(table.abs_send_time, Some(2));
        assert_eq!(table.mid, Some(4));
        assert_eq!(table.rid, Some(10));
    }

    #[test]
    fn uri_roundtrip() {
        for (ext, uri) in EXT_URI {
            assert_eq!(ExtensionUri::from_uri(uri), Some(*ext));
            assert_eq!(ext.as_uri(), *uri);
        }
    }
}
