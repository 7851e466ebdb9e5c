//! Fixed-width encoding of map keys and values.
//!
//! Maps have a fixed key and value width. Integers are written native-endian
//! at that width; byte strings and text are zero-padded up to it.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{len} bytes do not fit into {width} bytes")]
    TooLong { len: usize, width: usize },

    #[error("{value} does not fit into {width} bytes")]
    Overflow { value: i128, width: usize },

    #[error("cannot decode a {width}-byte value as an integer")]
    UnsupportedWidth { width: usize },
}

/// Values that can be written into a map key or value of a given width.
pub trait ToMapBytes {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError>;

    /// The exact length of raw byte input, used to recognise a complete
    /// per-CPU buffer. `None` for everything that is not raw bytes.
    fn byte_len(&self) -> Option<usize> {
        None
    }
}

fn encode_int(value: i128, width: usize) -> Result<Vec<u8>, EncodeError> {
    let overflow = EncodeError::Overflow { value, width };
    let bytes = match width {
        1 => u8::try_from(value)
            .map(|v| v.to_ne_bytes().to_vec())
            .or_else(|_| i8::try_from(value).map(|v| v.to_ne_bytes().to_vec())),
        2 => u16::try_from(value)
            .map(|v| v.to_ne_bytes().to_vec())
            .or_else(|_| i16::try_from(value).map(|v| v.to_ne_bytes().to_vec())),
        4 => u32::try_from(value)
            .map(|v| v.to_ne_bytes().to_vec())
            .or_else(|_| i32::try_from(value).map(|v| v.to_ne_bytes().to_vec())),
        8 => u64::try_from(value)
            .map(|v| v.to_ne_bytes().to_vec())
            .or_else(|_| i64::try_from(value).map(|v| v.to_ne_bytes().to_vec())),
        w if w > 8 => {
            let v = u64::try_from(value)
                .or_else(|_| i64::try_from(value).map(|v| v as u64))
                .map_err(|_| overflow.clone())?;
            let mut buf = vec![0u8; w];
            if cfg!(target_endian = "little") {
                buf[..8].copy_from_slice(&v.to_le_bytes());
            } else {
                buf[w - 8..].copy_from_slice(&v.to_be_bytes());
            }
            Ok(buf)
        }
        _ => return Err(EncodeError::UnsupportedWidth { width }),
    };
    bytes.map_err(|_| overflow)
}

macro_rules! impl_to_map_bytes_int {
    ($($t:ty),+ $(,)?) => {
        $(
            impl ToMapBytes for $t {
                fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
                    encode_int(*self as i128, width)
                }
            }
        )+
    }
}

impl_to_map_bytes_int!(u8, u16, u32, u64, i8, i16, i32, i64, usize);

fn pad(bytes: &[u8], width: usize) -> Result<Vec<u8>, EncodeError> {
    if bytes.len() > width {
        return Err(EncodeError::TooLong {
            len: bytes.len(),
            width,
        });
    }
    let mut buf = bytes.to_vec();
    buf.resize(width, 0);
    Ok(buf)
}

impl ToMapBytes for [u8] {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
        pad(self, width)
    }

    fn byte_len(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<const N: usize> ToMapBytes for [u8; N] {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
        pad(self, width)
    }

    fn byte_len(&self) -> Option<usize> {
        Some(N)
    }
}

impl ToMapBytes for Vec<u8> {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
        pad(self, width)
    }

    fn byte_len(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl ToMapBytes for str {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
        pad(self.as_bytes(), width)
    }
}

impl ToMapBytes for String {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
        pad(self.as_bytes(), width)
    }
}

impl ToMapBytes for Ipv4Addr {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
        pad(&self.octets(), width)
    }
}

impl<T: ToMapBytes + ?Sized> ToMapBytes for &T {
    fn to_map_bytes(&self, width: usize) -> Result<Vec<u8>, EncodeError> {
        (**self).to_map_bytes(width)
    }

    fn byte_len(&self) -> Option<usize> {
        (**self).byte_len()
    }
}

/// Decode a native-endian unsigned integer of 1, 2, 4 or 8 bytes.
pub fn decode_uint(bytes: &[u8]) -> Result<u64, EncodeError> {
    Ok(match bytes.len() {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
        4 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            u64::from_ne_bytes(buf)
        }
        width => return Err(EncodeError::UnsupportedWidth { width }),
    })
}

/// Read a map key as an array index.
pub fn decode_index(bytes: &[u8]) -> Option<u32> {
    match decode_uint(bytes) {
        Ok(v) => u32::try_from(v).ok(),
        Err(_) => None,
    }
}
