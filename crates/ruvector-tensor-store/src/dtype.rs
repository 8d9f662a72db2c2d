//! Primitive element types stored in tensor chunks.
//!
//! Chunks hold raw little-endian element bytes; [`DType`] is the tag
//! persisted in tensor metadata and [`Element`] is the bridge between
//! a Rust scalar type and those bytes.

use crate::error::TensorStoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Data type of a stored tensor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DType {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    I64 = 7,
    F32 = 8,
    F64 = 9,
}

impl DType {
    /// Element width in bytes.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    /// Canonical (numpy-style) name.
    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TensorStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uint8" | "u8" => Ok(DType::U8),
            "uint16" | "u16" => Ok(DType::U16),
            "uint32" | "u32" => Ok(DType::U32),
            "uint64" | "u64" => Ok(DType::U64),
            "int8" | "i8" => Ok(DType::I8),
            "int16" | "i16" => Ok(DType::I16),
            "int32" | "i32" => Ok(DType::I32),
            "int64" | "i64" | "int" => Ok(DType::I64),
            "float32" | "f32" => Ok(DType::F32),
            "float64" | "f64" | "float" | "double" => Ok(DType::F64),
            other => Err(TensorStoreError::InvalidParameter(format!(
                "unknown dtype: {other}"
            ))),
        }
    }
}

/// A scalar type that can live inside a tensor chunk.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Matching stored dtype.
    const DTYPE: DType;

    /// Write `self` as little-endian bytes into `dst` (exactly `DTYPE.size()` long).
    fn write_le(self, dst: &mut [u8]);

    /// Read a value from little-endian bytes (exactly `DTYPE.size()` long).
    fn read_le(src: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $d:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$d;

                #[inline]
                fn write_le(self, dst: &mut [u8]) {
                    dst.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(src: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(src);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_match_rust_types() {
        assert_eq!(<u8 as Element>::DTYPE.size(), std::mem::size_of::<u8>());
        assert_eq!(<i32 as Element>::DTYPE.size(), std::mem::size_of::<i32>());
        assert_eq!(<f64 as Element>::DTYPE.size(), std::mem::size_of::<f64>());
    }

    #[test]
    fn test_le_bytes() {
        let mut buf = [0u8; 4];
        0x0102_0304i32.write_le(&mut buf);
        assert_eq!(buf, [4, 3, 2, 1]);
        assert_eq!(i32::read_le(&buf), 0x0102_0304);

        let mut buf = [0u8; 8];
        (-2.5f64).write_le(&mut buf);
        assert_eq!(f64::read_le(&buf), -2.5);
    }

    #[test]
    fn test_parse_numpy_names() {
        assert_eq!("uint8".parse::<DType>().unwrap(), DType::U8);
        assert_eq!("float".parse::<DType>().unwrap(), DType::F64);
        assert_eq!("Int32".parse::<DType>().unwrap(), DType::I32);
        assert!("complex64".parse::<DType>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&DType::F32).unwrap();
        assert_eq!(json, "\"f32\"");
        let back: DType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DType::F32);
    }
}
