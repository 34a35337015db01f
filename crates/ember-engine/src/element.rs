use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Float32,
    Float64,
    Bool,
    String,
}

impl ElementType {
    /// Size of one element in bytes, `None` for variable-length strings
    pub fn size(&self) -> Option<usize> {
        match self {
            ElementType::Int8 | ElementType::Uint8 | ElementType::Bool => Some(1),
            ElementType::Int16 | ElementType::Uint16 | ElementType::Float16 => Some(2),
            ElementType::Int32 | ElementType::Uint32 | ElementType::Float32 => Some(4),
            ElementType::Int64 | ElementType::Uint64 | ElementType::Float64 => Some(8),
            ElementType::String => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementType::Int8 => "int8",
            ElementType::Int16 => "int16",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Uint8 => "uint8",
            ElementType::Uint16 => "uint16",
            ElementType::Uint32 => "uint32",
            ElementType::Uint64 => "uint64",
            ElementType::Float16 => "float16",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Bool => "bool",
            ElementType::String => "string",
        }
    }

    pub fn from_name(name: &str) -> Option<ElementType> {
        ALL_TYPES.iter().copied().find(|t| t.name() == name)
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            ElementType::Float16 | ElementType::Float32 | ElementType::Float64
        )
    }
}

const ALL_TYPES: [ElementType; 13] = [
    ElementType::Int8,
    ElementType::Int16,
    ElementType::Int32,
    ElementType::Int64,
    ElementType::Uint8,
    ElementType::Uint16,
    ElementType::Uint32,
    ElementType::Uint64,
    ElementType::Float16,
    ElementType::Float32,
    ElementType::Float64,
    ElementType::Bool,
    ElementType::String,
];

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// IEEE 754 half-precision float, stored as raw bits
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct F16(pub u16);

impl F16 {
    pub const ZERO: F16 = F16(0);

    pub fn from_bits(bits: u16) -> Self {
        F16(bits)
    }

    pub fn to_bits(self) -> u16 {
        self.0
    }

    pub fn to_f32(self) -> f32 {
        f16_to_f32(self.0)
    }

    pub fn from_f32(value: f32) -> Self {
        F16(f32_to_f16(value))
    }
}

impl fmt::Debug for F16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}f16", self.to_f32())
    }
}

impl PartialOrd for F16 {
    /// Orders by numeric value
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.to_f32().partial_cmp(&other.to_f32())
    }
}

impl From<f32> for F16 {
    fn from(value: f32) -> Self {
        F16::from_f32(value)
    }
}

impl From<F16> for f32 {
    fn from(value: F16) -> Self {
        value.to_f32()
    }
}

/// Convert IEEE 754 half-precision bits to single precision.
///
/// Every half value is exactly representable as an `f32`, so this never
/// rounds.
pub fn f16_to_f32(half: u16) -> f32 {
    const EXPONENT_BIAS_DELTA: u32 = 127 - 15;
    let sign = f32::from_bits(u32::from(half & 0x8000) << 16);
    let mantissa = u32::from(half & 0x3ff);
    match (half >> 10) & 0x1f {
        // zero and subnormals are a plain multiple of 2^-24
        0 => (mantissa as f32 * SUBNORMAL_STEP).copysign(sign),
        0x1f if mantissa == 0 => f32::INFINITY.copysign(sign),
        0x1f => f32::from_bits(sign.to_bits() | 0x7f80_0000 | (mantissa << 13)),
        exponent => f32::from_bits(
            sign.to_bits() | ((u32::from(exponent) + EXPONENT_BIAS_DELTA) << 23) | (mantissa << 13),
        ),
    }
}

/// Smallest positive half subnormal, 2^-24
const SUBNORMAL_STEP: f32 = 1.0 / 16_777_216.0;

/// Convert single precision to IEEE 754 half-precision bits, rounding to
/// nearest even.
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x7f_ffff;

    if exponent == 0xff {
        // inf stays inf, NaN keeps a quiet payload bit
        let nan = if mantissa != 0 { 0x200 } else { 0 };
        return sign | 0x7c00 | nan;
    }

    let half_exp = exponent - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }

    if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        let m = mantissa | 0x80_0000;
        let shift = (14 - half_exp) as u32;
        let half_m = m >> shift;
        let rem = m & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        let round = rem > halfway || (rem == halfway && (half_m & 1) == 1);
        return sign | (half_m as u16 + round as u16);
    }

    let half_m = (mantissa >> 13) as u16;
    let rem = mantissa & 0x1fff;
    let mut out = sign | ((half_exp as u16) << 10) | half_m;
    if rem > 0x1000 || (rem == 0x1000 && (half_m & 1) == 1) {
        // carry may roll into the exponent, which is the correct result
        out += 1;
    }
    out
}

mod sealed {
    pub trait Sealed {}
}

/// Types that can be used as fixed-size tensor elements
///
/// `bool` tensors are stored as one byte per element and are read and
/// written through `u8` slices.
pub trait TensorElement: sealed::Sealed + Pod + Send + Sync + 'static {
    const ELEMENT_TYPE: ElementType;
}

macro_rules! tensor_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl TensorElement for $ty {
                const ELEMENT_TYPE: ElementType = ElementType::$variant;
            }
        )*
    };
}

tensor_element! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    F16 => Float16,
    f32 => Float32,
    f64 => Float64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::Float16.size(), Some(2));
        assert_eq!(ElementType::Int64.size(), Some(8));
        assert_eq!(ElementType::Bool.size(), Some(1));
        assert_eq!(ElementType::String.size(), None);
    }

    #[test]
    fn test_element_names() {
        for ty in ALL_TYPES {
            assert_eq!(ElementType::from_name(ty.name()), Some(ty));
        }
        assert_eq!(ElementType::from_name("complex64"), None);
    }

    #[test]
    fn test_f16_known_values() {
        assert_eq!(f32_to_f16(1.0), 0x3c00);
        assert_eq!(f32_to_f16(-2.0), 0xc000);
        assert_eq!(f32_to_f16(65504.0), 0x7bff);
        assert_eq!(f32_to_f16(1.0e6), 0x7c00);
        assert_eq!(f16_to_f32(0x3555), 0.333_251_95);
        assert!(f16_to_f32(f32_to_f16(f32::NAN)).is_nan());
    }

    #[test]
    fn test_f16_subnormal() {
        // smallest positive subnormal half
        let tiny = f16_to_f32(0x0001);
        assert!(tiny > 0.0 && tiny < 1.0e-7);
        assert_eq!(f32_to_f16(tiny), 0x0001);
    }

    #[test]
    fn test_f16_widening_keeps_sign_and_specials() {
        assert_eq!(f16_to_f32(0x8000).to_bits(), (-0.0f32).to_bits());
        assert_eq!(f16_to_f32(0x7c00), f32::INFINITY);
        assert_eq!(f16_to_f32(0xfc00), f32::NEG_INFINITY);
        assert_eq!(f16_to_f32(0x8001), -SUBNORMAL_STEP);
        // largest subnormal and smallest normal are one step apart
        assert_eq!(f16_to_f32(0x0400) - f16_to_f32(0x03ff), SUBNORMAL_STEP);
        assert_eq!(f16_to_f32(0x7bff), 65504.0);
        for bits in [0x0001u16, 0x03ff, 0x0400, 0x3c01, 0xbbff, 0x7bff] {
            assert_eq!(f32_to_f16(f16_to_f32(bits)), bits);
        }
    }

    #[test]
    fn test_f16_rounds_to_nearest_even() {
        // 1 + 2^-11 sits exactly between 1.0 and the next half
        assert_eq!(f32_to_f16(1.0 + 1.0 / 2048.0), 0x3c00);
        assert_eq!(f32_to_f16(1.0 + 3.0 / 2048.0), 0x3c02);
    }
}
