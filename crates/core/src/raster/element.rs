//! Raster element trait for generic cell values

use num_traits::NumCast;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Storage type of a raster band, as declared by the raster collaborator.
///
/// Only the byte width matters to the engine: it drives memory estimates.
/// Pixel values always reach the statistics as `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Size of one sample in bytes
    pub fn byte_width(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::I8 => "int8",
            DataType::U16 => "uint16",
            DataType::I16 => "int16",
            DataType::U32 => "uint32",
            DataType::I32 => "int32",
            DataType::U64 => "uint64",
            DataType::I64 => "int64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Trait for types that can be stored in a raster cell.
///
/// This trait bounds the types that can be held by an in-memory raster,
/// ensuring they convert losslessly enough to `f64` for accumulation.
pub trait RasterElement:
    Copy + Clone + Debug + PartialOrd + PartialEq + NumCast + Send + Sync + 'static
{
    /// Declared storage type
    const DATA_TYPE: DataType;

    /// Convert self to f64 (NaN when the value has no f64 representation)
    fn as_f64(self) -> f64 {
        <f64 as NumCast>::from(self).unwrap_or(f64::NAN)
    }
}

macro_rules! impl_raster_element {
    ($t:ty, $dt:expr) => {
        impl RasterElement for $t {
            const DATA_TYPE: DataType = $dt;
        }
    };
}

impl_raster_element!(i8, DataType::I8);
impl_raster_element!(i16, DataType::I16);
impl_raster_element!(i32, DataType::I32);
impl_raster_element!(i64, DataType::I64);
impl_raster_element!(u8, DataType::U8);
impl_raster_element!(u16, DataType::U16);
impl_raster_element!(u32, DataType::U32);
impl_raster_element!(u64, DataType::U64);
impl_raster_element!(f32, DataType::F32);
impl_raster_element!(f64, DataType::F64);
