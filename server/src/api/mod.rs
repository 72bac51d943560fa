//! HTTP API.

pub(crate) mod binary_cache;
pub(crate) mod v1;
