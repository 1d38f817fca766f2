use crate::error::{Error, Result};

/// Runtime element-type tag for distributed array data.
///
/// Each tag carries a known element byte size and a default fill value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PioType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
    UByte,
    UShort,
    UInt,
    Int64,
    UInt64,
    String,
}

impl PioType {
    /// Element size in bytes. `String` has no fixed size and cannot be used
    /// with distributed arrays.
    pub fn size(&self) -> Option<usize> {
        match self {
            PioType::Byte | PioType::Char | PioType::UByte => Some(1),
            PioType::Short | PioType::UShort => Some(2),
            PioType::Int | PioType::UInt | PioType::Float => Some(4),
            PioType::Double | PioType::Int64 | PioType::UInt64 => Some(8),
            PioType::String => None,
        }
    }

    /// Default fill value, little-endian encoded to the element size.
    pub fn default_fill(&self) -> Vec<u8> {
        match self {
            PioType::Byte => (-127i8).to_le_bytes().to_vec(),
            PioType::Char => 0u8.to_le_bytes().to_vec(),
            PioType::Short => (-32767i16).to_le_bytes().to_vec(),
            PioType::Int => (-2147483647i32).to_le_bytes().to_vec(),
            PioType::Float => 9.9692099683868690e+36f32.to_le_bytes().to_vec(),
            PioType::Double => 9.9692099683868690e+36f64.to_le_bytes().to_vec(),
            PioType::UByte => 255u8.to_le_bytes().to_vec(),
            PioType::UShort => 65535u16.to_le_bytes().to_vec(),
            PioType::UInt => 4294967295u32.to_le_bytes().to_vec(),
            PioType::Int64 => (-9223372036854775806i64).to_le_bytes().to_vec(),
            PioType::UInt64 => 18446744073709551614u64.to_le_bytes().to_vec(),
            PioType::String => Vec::new(),
        }
    }

    /// Stable wire tag, used when a type crosses the transport.
    pub fn tag(&self) -> i32 {
        match self {
            PioType::Byte => 1,
            PioType::Char => 2,
            PioType::Short => 3,
            PioType::Int => 4,
            PioType::Float => 5,
            PioType::Double => 6,
            PioType::UByte => 7,
            PioType::UShort => 8,
            PioType::UInt => 9,
            PioType::Int64 => 10,
            PioType::UInt64 => 11,
            PioType::String => 12,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        Ok(match tag {
            1 => PioType::Byte,
            2 => PioType::Char,
            3 => PioType::Short,
            4 => PioType::Int,
            5 => PioType::Float,
            6 => PioType::Double,
            7 => PioType::UByte,
            8 => PioType::UShort,
            9 => PioType::UInt,
            10 => PioType::Int64,
            11 => PioType::UInt64,
            12 => PioType::String,
            _ => return Err(Error::InvalidArgument),
        })
    }

    fn is_float(&self) -> bool {
        matches!(self, PioType::Float | PioType::Double)
    }
}

/// Rearrangement strategy for a decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearranger {
    Box = 1,
    Subset = 2,
}

impl Rearranger {
    pub fn tag(&self) -> i32 {
        *self as i32
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            1 => Ok(Rearranger::Box),
            2 => Ok(Rearranger::Subset),
            _ => Err(Error::BadRearranger),
        }
    }
}

/// Convert a packed element buffer from one type to another.
///
/// Integers convert through i128, floats through f64. Returns the input
/// unchanged when the types match. `String` does not convert.
pub fn convert(src: PioType, dst: PioType, data: &[u8]) -> Result<Vec<u8>> {
    if src == dst {
        return Ok(data.to_vec());
    }
    let ssize = src.size().ok_or(Error::InvalidArgument)?;
    let dsize = dst.size().ok_or(Error::InvalidArgument)?;
    if data.len() % ssize != 0 {
        return Err(Error::InvalidArgument);
    }
    let n = data.len() / ssize;
    let mut out = Vec::with_capacity(n * dsize);
    for i in 0..n {
        let chunk = &data[i * ssize..(i + 1) * ssize];
        if src.is_float() || dst.is_float() {
            let v = decode_f64(src, chunk);
            encode_f64(dst, v, &mut out);
        } else {
            let v = decode_i128(src, chunk);
            encode_i128(dst, v, &mut out);
        }
    }
    Ok(out)
}

fn decode_i128(ty: PioType, b: &[u8]) -> i128 {
    match ty {
        PioType::Byte => i8::from_le_bytes([b[0]]) as i128,
        PioType::Char | PioType::UByte => b[0] as i128,
        PioType::Short => i16::from_le_bytes([b[0], b[1]]) as i128,
        PioType::UShort => u16::from_le_bytes([b[0], b[1]]) as i128,
        PioType::Int => i32::from_le_bytes(b.try_into().unwrap()) as i128,
        PioType::UInt => u32::from_le_bytes(b.try_into().unwrap()) as i128,
        PioType::Int64 => i64::from_le_bytes(b.try_into().unwrap()) as i128,
        PioType::UInt64 => u64::from_le_bytes(b.try_into().unwrap()) as i128,
        PioType::Float => f32::from_le_bytes(b.try_into().unwrap()) as i128,
        PioType::Double => f64::from_le_bytes(b.try_into().unwrap()) as i128,
        PioType::String => 0,
    }
}

fn decode_f64(ty: PioType, b: &[u8]) -> f64 {
    match ty {
        PioType::Float => f32::from_le_bytes(b.try_into().unwrap()) as f64,
        PioType::Double => f64::from_le_bytes(b.try_into().unwrap()),
        _ => decode_i128(ty, b) as f64,
    }
}

fn encode_i128(ty: PioType, v: i128, out: &mut Vec<u8>) {
    match ty {
        PioType::Byte => out.extend_from_slice(&(v as i8).to_le_bytes()),
        PioType::Char | PioType::UByte => out.extend_from_slice(&(v as u8).to_le_bytes()),
        PioType::Short => out.extend_from_slice(&(v as i16).to_le_bytes()),
        PioType::UShort => out.extend_from_slice(&(v as u16).to_le_bytes()),
        PioType::Int => out.extend_from_slice(&(v as i32).to_le_bytes()),
        PioType::UInt => out.extend_from_slice(&(v as u32).to_le_bytes()),
        PioType::Int64 => out.extend_from_slice(&(v as i64).to_le_bytes()),
        PioType::UInt64 => out.extend_from_slice(&(v as u64).to_le_bytes()),
        PioType::Float => out.extend_from_slice(&(v as f32).to_le_bytes()),
        PioType::Double => out.extend_from_slice(&(v as f64).to_le_bytes()),
        PioType::String => {}
    }
}

fn encode_f64(ty: PioType, v: f64, out: &mut Vec<u8>) {
    match ty {
        PioType::Float => out.extend_from_slice(&(v as f32).to_le_bytes()),
        PioType::Double => out.extend_from_slice(&v.to_le_bytes()),
        _ => encode_i128(ty, v as i128, out),
    }
}

/// Pack an i32 slice into little-endian bytes.
pub fn i32s_to_bytes(vals: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 4);
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Unpack little-endian bytes into i32 values.
pub fn bytes_to_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Pack an i64 slice into little-endian bytes.
pub fn i64s_to_bytes(vals: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 8);
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Unpack little-endian bytes into i64 values.
pub fn bytes_to_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Pack an f64 slice into little-endian bytes.
pub fn f64s_to_bytes(vals: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 8);
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Unpack little-endian bytes into f64 values.
pub fn bytes_to_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
