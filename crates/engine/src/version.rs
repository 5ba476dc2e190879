//! Build identification.

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub timestamp: &'static str,
    pub hostname: &'static str,
}

/// Version plus whatever the build environment stamped in.
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION,
        commit: option_env!("WARDEN_BUILD_COMMIT").unwrap_or("unknown"),
        timestamp: option_env!("WARDEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        hostname: option_env!("WARDEN_BUILD_HOSTNAME").unwrap_or("unknown"),
    }
}
