use ember_engine::{EngineError, F16, Result, TensorElement};
use num_traits::{AsPrimitive, CheckedDiv, WrappingAdd, WrappingMul, WrappingSub, Zero};

/// Arithmetic shared by the numeric kernels
pub trait Numeric: TensorElement + Copy + PartialOrd {
    fn zero() -> Self;
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    /// # Errors
    /// Integer division by zero is `InvalidArgument`
    fn div(self, rhs: Self) -> Result<Self>;
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_float {
    ($($ty:ty),*) => {$(
        impl Numeric for $ty {
            fn zero() -> Self { Zero::zero() }
            fn add(self, rhs: Self) -> Self { self + rhs }
            fn sub(self, rhs: Self) -> Self { self - rhs }
            fn mul(self, rhs: Self) -> Self { self * rhs }
            fn div(self, rhs: Self) -> Result<Self> { Ok(self / rhs) }
            fn to_f64(self) -> f64 { self.as_() }
            fn from_f64(value: f64) -> Self { value.as_() }
        }
    )*};
}

// integer arithmetic wraps, float to integer casts saturate
macro_rules! impl_int {
    ($($ty:ty),*) => {$(
        impl Numeric for $ty {
            fn zero() -> Self { Zero::zero() }
            fn add(self, rhs: Self) -> Self { WrappingAdd::wrapping_add(&self, &rhs) }
            fn sub(self, rhs: Self) -> Self { WrappingSub::wrapping_sub(&self, &rhs) }
            fn mul(self, rhs: Self) -> Self { WrappingMul::wrapping_mul(&self, &rhs) }
            fn div(self, rhs: Self) -> Result<Self> {
                CheckedDiv::checked_div(&self, &rhs)
                    .ok_or_else(|| EngineError::InvalidArgument("integer division by zero".to_string()))
            }
            fn to_f64(self) -> f64 { self.as_() }
            fn from_f64(value: f64) -> Self { value.as_() }
        }
    )*};
}

impl_float!(f32, f64);
impl_int!(i16, i32, i64);

// half precision math runs in f32
impl Numeric for F16 {
    fn zero() -> Self {
        F16::ZERO
    }
    fn add(self, rhs: Self) -> Self {
        F16::from_f32(self.to_f32() + rhs.to_f32())
    }
    fn sub(self, rhs: Self) -> Self {
        F16::from_f32(self.to_f32() - rhs.to_f32())
    }
    fn mul(self, rhs: Self) -> Self {
        F16::from_f32(self.to_f32() * rhs.to_f32())
    }
    fn div(self, rhs: Self) -> Result<Self> {
        Ok(F16::from_f32(self.to_f32() / rhs.to_f32()))
    }
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(value: f64) -> Self {
        F16::from_f32(value as f32)
    }
}

/// Run `$body` with `$t` aliased to the Rust type of `$ty`
///
/// Types outside the listed set are `UnsupportedType`.
#[macro_export]
macro_rules! dispatch_numeric {
    ($ty:expr, $t:ident => $body:expr) => {
        match $ty {
            ::ember_engine::ElementType::Float32 => {
                type $t = f32;
                $body
            }
            ::ember_engine::ElementType::Float64 => {
                type $t = f64;
                $body
            }
            ::ember_engine::ElementType::Float16 => {
                type $t = ::ember_engine::F16;
                $body
            }
            ::ember_engine::ElementType::Int16 => {
                type $t = i16;
                $body
            }
            ::ember_engine::ElementType::Int32 => {
                type $t = i32;
                $body
            }
            ::ember_engine::ElementType::Int64 => {
                type $t = i64;
                $body
            }
            other => Err(::ember_engine::EngineError::UnsupportedType(other)),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_division_by_zero() {
        assert_eq!(7i32.div(2).unwrap(), 3);
        assert!(matches!(
            1i64.div(0),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_f16_arithmetic() {
        let sum = F16::from_f32(1.5).add(F16::from_f32(2.0));
        assert_eq!(sum.to_f32(), 3.5);
        assert!(F16::from_f32(-1.0) < F16::zero());
    }

    #[test]
    fn test_integer_overflow_wraps_and_casts_saturate() {
        assert_eq!(i16::MAX.add(1), i16::MIN);
        assert_eq!(<i32 as Numeric>::from_f64(1e12), i32::MAX);
        assert_eq!(<i64 as Numeric>::from_f64(-2.9), -2);
    }
}
