//! RTP primitives: identifiers, header parsing and header extensions.

use std::fmt;
use std::ops::Deref;
use std::str::from_utf8;

use serde::{Deserialize, Serialize};

mod header;
pub use header::{extend_u16, ExtensionValues, RtpHeader};

mod ext;
pub use ext::{ExtensionIds, ExtensionUri};

mod packet;
pub use packet::RtpPacket;

macro_rules! str_id {
    ($id:ident, $name:literal, $num:tt) => {
        impl $id {
            /// Converts an array of bytes to an id.
            pub const fn from_array(a: [u8; $num]) -> $id {
                $id(a)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s: &str = self;
                write!(f, "{}", s)
            }
        }

        impl fmt::Debug for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s: &str = self;
                write!(f, "{}({})", $name, s)
            }
        }

        impl Deref for $id {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                from_utf8(&self.0).expect("ascii id").trim()
            }
        }

        impl<'a> From<&'a str> for $id {
            fn from(v: &'a str) -> Self {
                let bytes = v.as_bytes();
                let bytes = &bytes[0..$num.min(bytes.len())];

                // pad with space.
                let mut array = [b' '; $num];

                let max = bytes.len().min(array.len());
                array[0..max].copy_from_slice(bytes);

                $id(array)
            }
        }
    };
}

macro_rules! num_id {
    ($id:ident, $t:tt) => {
        impl $id {
            /// Creates a new random id.
            pub fn new() -> Self {
                $id(rand::random())
            }
        }

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Synchronization source. Identifies one sending source of RTP data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ssrc(u32);
num_id!(Ssrc, u32);

/// Payload type. 7 bits in the RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pt(u8);
num_id!(Pt, u8);

/// Media identifier, from the `urn:ietf:params:rtp-hdrext:sdes:mid`
/// header extension.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mid([u8; 16]);
str_id!(Mid, "Mid", 16);

/// Identifier of a simulcast layer for an encoded stream ("RTP stream
/// id"), from the `rtp-stream-id` header extension.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid([u8; 8]);
str_id!(Rid, "Rid", 8);

/// Is a wrap-aware "strictly lower" for 16 bit sequence numbers.
///
/// RFC 1982 style serial number arithmetic: `a` is lower than `b` when
/// the signed distance `b - a` is positive.
pub(crate) fn is_seq_lower_than(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn str_id_trims_and_truncates() {
        let mid = Mid::from("0");
        assert_eq!(&*mid, "0");

        let long = Rid::from("abcdefghijkl");
        assert_eq!(&*long, "abcdefgh");
    }

    #[test]
    fn seq_lower_than_wraps() {
        assert!(is_seq_lower_than(65_535, 0));
        assert!(is_seq_lower_than(0, 1));
        assert!(!is_seq_lower_than(1, 0));
        assert!(!is_seq_lower_than(0, 65_535));
        assert!(!is_seq_lower_than(5, 5));
    }
}
