use crate::error::{OffloadError, Result};
use crate::runtime::DeviceAddress;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    U32(u32),
    U64(u64),
    F32(f32),
    Address(DeviceAddress),
}

impl KernelArg {
    fn type_name(&self) -> &'static str {
        match self {
            KernelArg::U32(_) => "u32",
            KernelArg::U64(_) => "u64",
            KernelArg::F32(_) => "f32",
            KernelArg::Address(_) => "address",
        }
    }
}

/// Positional argument list for one remote call.
///
/// The context owns a single buffer for its whole ready period and clears it
/// at the start of every operation, so no argument from a previous call can
/// leak into the next one.
#[derive(Debug, Clone, Default)]
pub struct ArgBuffer {
    args: Vec<KernelArg>,
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, index: usize) -> Result<$ty> {
            match self.get(index)? {
                KernelArg::$variant(v) => Ok(v),
                other => Err(OffloadError::BadArgument {
                    index,
                    reason: format!(
                        "expected {}, found {}",
                        stringify!($variant).to_lowercase(),
                        other.type_name()
                    ),
                }),
            }
        }
    };
}

impl ArgBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ArgBuffer {
            args: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.args.clear();
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn push(&mut self, arg: KernelArg) -> &mut Self {
        self.args.push(arg);
        self
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.push(KernelArg::U32(v))
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.push(KernelArg::U64(v))
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        self.push(KernelArg::F32(v))
    }

    pub fn push_address(&mut self, v: DeviceAddress) -> &mut Self {
        self.push(KernelArg::Address(v))
    }

    pub fn get(&self, index: usize) -> Result<KernelArg> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| OffloadError::BadArgument {
                index,
                reason: format!("only {} arguments supplied", self.args.len()),
            })
    }

    typed_getter!(u32_at, U32, u32);
    typed_getter!(u64_at, U64, u64);
    typed_getter!(f32_at, F32, f32);
    typed_getter!(address_at, Address, DeviceAddress);

    pub fn as_slice(&self) -> &[KernelArg] {
        &self.args
    }
}
