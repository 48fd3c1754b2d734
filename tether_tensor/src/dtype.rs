//! Stable dtype and device-kind tags for the boundary, and their resolution
//! into `tch` types.
//!
//! The tags are part of the frozen C surface: generated callers bake them in,
//! so the values never change within a major version and no two accessors
//! share a value. Device kinds occupy 0-1 and dtypes 8-19.

use tch::{Device, Kind};

pub const DEVICE_CPU: i32 = 0;
pub const DEVICE_CUDA: i32 = 1;

/// Logical element type carried across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Uint8,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl Dtype {
    /// Stable boundary tag for this dtype.
    pub fn tag(self) -> i32 {
        match self {
            Dtype::Uint8 => 8,
            Dtype::Int8 => 9,
            Dtype::Int16 => 10,
            Dtype::Int32 => 11,
            Dtype::Int64 => 12,
            Dtype::Uint16 => 13,
            Dtype::Uint32 => 14,
            Dtype::Uint64 => 15,
            Dtype::Float16 => 16,
            Dtype::BFloat16 => 17,
            Dtype::Float32 => 18,
            Dtype::Float64 => 19,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            8 => Some(Dtype::Uint8),
            9 => Some(Dtype::Int8),
            10 => Some(Dtype::Int16),
            11 => Some(Dtype::Int32),
            12 => Some(Dtype::Int64),
            13 => Some(Dtype::Uint16),
            14 => Some(Dtype::Uint32),
            15 => Some(Dtype::Uint64),
            16 => Some(Dtype::Float16),
            17 => Some(Dtype::BFloat16),
            18 => Some(Dtype::Float32),
            19 => Some(Dtype::Float64),
            _ => None,
        }
    }

    /// Maps the logical dtype onto a libtorch storage kind.
    ///
    /// The wide unsigned integers are reserved tags without a storage kind in
    /// this build; asking for one is the dtype-unsatisfiable failure case.
    pub fn kind(self) -> Result<Kind, String> {
        match self {
            Dtype::Uint8 => Ok(Kind::Uint8),
            Dtype::Int8 => Ok(Kind::Int8),
            Dtype::Int16 => Ok(Kind::Int16),
            Dtype::Int32 => Ok(Kind::Int),
            Dtype::Int64 => Ok(Kind::Int64),
            Dtype::Float16 => Ok(Kind::Half),
            Dtype::BFloat16 => Ok(Kind::BFloat16),
            Dtype::Float32 => Ok(Kind::Float),
            Dtype::Float64 => Ok(Kind::Double),
            Dtype::Uint16 | Dtype::Uint32 | Dtype::Uint64 => Err(format!(
                "dtype {:?} has no libtorch storage kind",
                self
            )),
        }
    }

    pub fn size_in_bytes(self) -> i64 {
        match self {
            Dtype::Uint8 | Dtype::Int8 => 1,
            Dtype::Int16 | Dtype::Uint16 | Dtype::Float16 | Dtype::BFloat16 => 2,
            Dtype::Int32 | Dtype::Uint32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Uint64 | Dtype::Float64 => 8,
        }
    }
}

pub(crate) fn resolve_dtype(tag: i32) -> Result<Dtype, String> {
    Dtype::from_tag(tag).ok_or_else(|| format!("unknown dtype tag {}", tag))
}

pub(crate) fn resolve_kind(tag: i32) -> Result<Kind, String> {
    resolve_dtype(tag)?.kind()
}

/// Resolves a device kind + index pair. CPU never carries a meaningful
/// index; every other kind requires a non-negative one.
pub(crate) fn resolve_device(kind: i32, index: i32) -> Result<Device, String> {
    match kind {
        DEVICE_CPU => Ok(Device::Cpu),
        DEVICE_CUDA => {
            if index < 0 {
                return Err(format!("CUDA device requires a non-negative index, got {}", index));
            }
            Ok(Device::Cuda(index as usize))
        }
        other => Err(format!("unknown device kind {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for dtype in [
            Dtype::Uint8,
            Dtype::Int8,
            Dtype::Int16,
            Dtype::Int32,
            Dtype::Int64,
            Dtype::Uint16,
            Dtype::Uint32,
            Dtype::Uint64,
            Dtype::Float16,
            Dtype::BFloat16,
            Dtype::Float32,
            Dtype::Float64,
        ] {
            assert_eq!(Dtype::from_tag(dtype.tag()), Some(dtype));
        }
        assert_eq!(Dtype::from_tag(0), None);
        assert_eq!(Dtype::from_tag(20), None);
    }

    #[test]
    fn cpu_ignores_index_and_cuda_requires_one() {
        assert_eq!(resolve_device(DEVICE_CPU, -1).unwrap(), Device::Cpu);
        assert_eq!(resolve_device(DEVICE_CPU, 7).unwrap(), Device::Cpu);
        assert_eq!(resolve_device(DEVICE_CUDA, 2).unwrap(), Device::Cuda(2));
        assert!(resolve_device(DEVICE_CUDA, -1).is_err());
        assert!(resolve_device(42, 0).is_err());
    }

    #[test]
    fn reserved_unsigned_tags_have_no_storage_kind() {
        assert!(Dtype::Uint16.kind().is_err());
        assert!(Dtype::Uint32.kind().is_err());
        assert!(Dtype::Uint64.kind().is_err());
        assert!(Dtype::Float32.kind().is_ok());
    }
}
