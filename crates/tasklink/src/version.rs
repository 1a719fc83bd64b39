//! Version information for tasklink.

/// tasklink version from Cargo.toml
pub const TASKLINK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported in dispatcher snapshots.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    /// Library version.
    pub tasklink: &'static str,
    /// Name and version of the transport, if it reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            tasklink: TASKLINK_VERSION,
            transport: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }
}
