//! General stuff.

/// Brings [unlikely](core::intrinsics::unlikely) to stable rust.
#[inline(always)]
pub(crate) const fn unlikely(b: bool) -> bool {
    #[allow(clippy::needless_bool, clippy::bool_to_int_with_if)]
    if (1i32).checked_div(if b { 0 } else { 1 }).is_none() {
        true
    } else {
        false
    }
}

/// Reads a big-endian integer of `bytes.len()` (at most 8) bytes.
#[inline]
pub(crate) fn read_be_uint(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    let mut result = 0u64;
    for byte in bytes {
        result = (result << 8) | *byte as u64;
    }
    result
}

/// Writes the lowest `size` bytes of `value` in big-endian order.
#[inline]
pub(crate) fn write_be_uint(target: &mut Vec<u8>, value: u64, size: usize) {
    debug_assert!(size <= 8);
    target.extend_from_slice(&value.to_be_bytes()[8 - size..]);
}

/// Minimal number of bytes to store any value `< bound`.
#[inline]
pub(crate) const fn number_of_bytes_to_fit(bound: u64) -> u32 {
    let mut bytes = 0;
    while bytes < 8 && (bound >> (bytes * 8)) != 0 {
        bytes += 1;
    }
    bytes
}

#[cfg(any(feature = "base64", test))]
#[inline]
pub(crate) fn encode_base64<T: AsRef<[u8]>>(data: T) -> String {
    use base64::Engine;
    fn encode_base64_impl(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }
    encode_base64_impl(data.as_ref())
}

#[cfg(any(feature = "base64", test))]
#[inline]
pub(crate) fn decode_base64<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    fn decode_base64_impl(data: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(data)
    }
    decode_base64_impl(data.as_ref())
}

/// Helper struct to print the bit string with its completion tag.
#[derive(Clone, Copy)]
pub struct Bitstring<'a> {
    /// Underlying bytes (with or without the completion tag).
    pub bytes: &'a [u8],
    /// Length of data in bits.
    pub bit_len: u16,
}

impl std::fmt::Display for Bitstring<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bit_len = std::cmp::min(self.bit_len as usize, self.bytes.len() * 8) as u16;
        let byte_len = bit_len.div_ceil(8) as usize;
        let bytes = &self.bytes[..byte_len];

        let rem = bit_len % 8;
        let (bytes, last_byte) = match bytes.split_last() {
            Some((last_byte, bytes)) if rem != 0 => {
                let tag_mask: u8 = 1 << (7 - rem);
                let data_mask = !(tag_mask - 1);
                let last_byte = (*last_byte & data_mask) | tag_mask;
                (bytes, Some(last_byte))
            }
            _ => (bytes, None),
        };

        for byte in bytes {
            ok!(write!(f, "{byte:02x}"));
        }

        if let Some(mut last_byte) = last_byte {
            let tag = if rem != 4 { "_" } else { "" };
            let rem = 1 + (rem > 4) as usize;
            if rem == 1 {
                last_byte >>= 4;
            }
            ok!(write!(f, "{last_byte:0rem$x}{tag}"));
        }

        Ok(())
    }
}
