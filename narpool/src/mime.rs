//! MIME types.

/// /nix-cache-info
pub const NIX_CACHE_INFO: &str = "application/octet-stream";

/// .narinfo
pub const NARINFO: &str = "text/x-nix-narinfo";

/// .nar
pub const NAR: &str = "application/octet-stream";
