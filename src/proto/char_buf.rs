use std::ffi::CStr;

use endian_codec::{DecodeBE, EncodeBE, PackedSize};

/// Represents a potentially null terminated char buffer
#[derive(Clone, PartialEq, Eq)]
#[repr(C)]
pub struct CharBuf<const N: usize> {
    buffer: [u8; N],
}

impl<const N: usize> CharBuf<N> {
    /// Returns `None` if `value` does not fit with its terminator
    pub fn new(value: &str) -> Option<Self> {
        if value.len() >= N {
            return None;
        }

        let mut buffer = [0; N];
        buffer[..value.len()].copy_from_slice(value.as_bytes());

        Some(Self { buffer })
    }

    pub fn as_c_str(&self) -> Option<&CStr> {
        CStr::from_bytes_until_nul(&self.buffer).ok()
    }

    pub fn to_str(&self) -> Option<&str> {
        self.as_c_str()?.to_str().ok()
    }
}

impl<const N: usize> PackedSize for CharBuf<N> {
    const PACKED_LEN: usize = N;
}

impl<const N: usize> EncodeBE for CharBuf<N> {
    fn encode_as_be_bytes(&self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.buffer);
    }
}

impl<const N: usize> DecodeBE for CharBuf<N> {
    fn decode_from_be_bytes(bytes: &[u8]) -> Self {
        let mut buffer = [0; N];
        buffer.copy_from_slice(bytes);

        Self { buffer }
    }
}

impl<const N: usize> core::fmt::Debug for CharBuf<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.to_str() {
            Some(s) => write!(f, "CharBuf<{N}>({s:?})"),
            None => write!(f, "CharBuf<{N}>({:?})", &self.buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_must_fit() {
        assert!(CharBuf::<4>::new("abc").is_some());
        assert!(CharBuf::<4>::new("abcd").is_none());
    }

    #[test]
    fn reads_up_to_first_nul() {
        let buf = CharBuf::<32>::decode_from_be_bytes(&{
            let mut raw = [0u8; 32];
            raw[..5].copy_from_slice(b"1-1.4");
            raw[6] = b'x';
            raw
        });

        assert_eq!(buf.to_str(), Some("1-1.4"));
    }

    #[test]
    fn unterminated_buffer_is_not_a_string() {
        let buf = CharBuf::<2>::decode_from_be_bytes(b"ab");

        assert_eq!(buf.to_str(), None);
    }
}
