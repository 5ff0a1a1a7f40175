//! Engine configuration.
//!
//! Values come from [`EngineConfig::default`], builder setters, or the
//! environment:
//!
//! - `MX_BACKEND`: `sequential`, `simd` or `accelerator`
//! - `MX_THREADS`: worker count for the SIMD and accelerator backends
//! - `MX_ACCEL_NODE`: accelerator node for the next initialization
//! - `MX_ACCEL_MODULE`: path of the accelerator kernel module

use std::str::FromStr;

use mx_matrix::BackendKind;
use mx_offload::KERNEL_MODULE;

use crate::error::{FfiError, Result};

pub const BACKEND_ENV: &str = "MX_BACKEND";
pub const THREADS_ENV: &str = "MX_THREADS";
pub const NODE_ENV: &str = "MX_ACCEL_NODE";
pub const MODULE_ENV: &str = "MX_ACCEL_MODULE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub thread_count: u32,
    pub accelerator_node: u32,
    pub module_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::ThreadedSimd,
            thread_count: 1,
            accelerator_node: 0,
            module_path: KERNEL_MODULE.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_thread_count(mut self, thread_count: u32) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_accelerator_node(mut self, node: u32) -> Self {
        self.accelerator_node = node;
        self
    }

    pub fn with_module_path(mut self, path: impl Into<String>) -> Self {
        self.module_path = path.into();
        self
    }

    /// Defaults overridden by whichever `MX_*` variables are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a caller-supplied lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup(BACKEND_ENV) {
            config.backend = v.parse().map_err(|reason| FfiError::Config {
                key: BACKEND_ENV,
                value: v.clone(),
                reason,
            })?;
        }
        if let Some(v) = lookup(THREADS_ENV) {
            config.thread_count = parse(THREADS_ENV, &v)?;
            if config.thread_count == 0 {
                return Err(FfiError::Config {
                    key: THREADS_ENV,
                    value: v,
                    reason: "must be at least 1".into(),
                });
            }
        }
        if let Some(v) = lookup(NODE_ENV) {
            config.accelerator_node = parse(NODE_ENV, &v)?;
        }
        if let Some(v) = lookup(MODULE_ENV) {
            config.module_path = v;
        }
        Ok(config)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| FfiError::Config {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
