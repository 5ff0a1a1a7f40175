use mx_matrix::{BackendKind, Matrix};

/// Compute backend selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MxBackendType {
    Sequential = 0,
    Simd = 1,
    Accelerator = 2,
}

impl From<MxBackendType> for BackendKind {
    fn from(t: MxBackendType) -> Self {
        match t {
            MxBackendType::Sequential => BackendKind::Sequential,
            MxBackendType::Simd => BackendKind::ThreadedSimd,
            MxBackendType::Accelerator => BackendKind::AcceleratorOffload,
        }
    }
}

/// Opaque matrix handle owned by the caller.
#[derive(Debug)]
pub struct MxMatrix(pub(crate) Matrix);

impl MxMatrix {
    pub fn inner(&self) -> &Matrix {
        &self.0
    }

    pub fn inner_mut(&mut self) -> &mut Matrix {
        &mut self.0
    }
}
