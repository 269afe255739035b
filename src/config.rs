//! Client configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default coordinator address.
pub const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:8898";
/// Delay before the unregistered-initializer lint runs.
pub const DEFAULT_LINT_DELAY: Duration = Duration::from_secs(10);
/// Bound of the queue into the serialized execution context.
pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 64;

/// Architecture tag reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetArch {
    Arm64,
    X86_64,
    Other(String),
}

impl TargetArch {
    /// Architecture of the running process.
    pub fn host() -> Self {
        Self::parse(std::env::consts::ARCH)
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "arm64" | "aarch64" => TargetArch::Arm64,
            "x86_64" | "amd64" => TargetArch::X86_64,
            other => TargetArch::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetArch::Arm64 => "arm64",
            TargetArch::X86_64 => "x86_64",
            TargetArch::Other(s) => s,
        }
    }

    /// Modules must be approved by the coordinator before they are loaded.
    pub fn requires_signing(&self) -> bool {
        matches!(self, TargetArch::Arm64)
    }

    /// `Load` carries a symbol side-car blob listing newly introduced symbols.
    pub fn requires_symbol_discovery(&self) -> bool {
        matches!(self, TargetArch::Arm64)
    }
}

/// Everything the client needs to know before it connects.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub coordinator_addr: SocketAddr,
    pub arch: TargetArch,
    pub executable_path: PathBuf,
    /// Staging directory hint sent during the handshake.
    pub staging_hint: PathBuf,
    /// File holding the code-signing identity.
    pub sign_file: PathBuf,
    /// Images below this prefix are application-owned.
    pub app_modules_prefix: PathBuf,
    pub lint_delay: Duration,
    pub request_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let executable_path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("unknown"));
        let exe_dir = executable_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            coordinator_addr: SocketAddr::from(([127, 0, 0, 1], 8898)),
            arch: TargetArch::host(),
            sign_file: exe_dir.join("sign"),
            app_modules_prefix: exe_dir,
            executable_path,
            staging_hint: std::env::temp_dir(),
            lint_delay: DEFAULT_LINT_DELAY,
            request_queue_capacity: DEFAULT_REQUEST_QUEUE_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn with_coordinator_addr(mut self, addr: SocketAddr) -> Self {
        self.coordinator_addr = addr;
        self
    }

    pub fn with_arch(mut self, arch: TargetArch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_staging_hint(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_hint = dir.into();
        self
    }

    pub fn with_sign_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sign_file = path.into();
        self
    }

    pub fn with_executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_path = path.into();
        self
    }

    pub fn with_app_modules_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.app_modules_prefix = prefix.into();
        self
    }

    pub fn with_lint_delay(mut self, delay: Duration) -> Self {
        self.lint_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_aliases() {
        assert_eq!(TargetArch::parse("aarch64"), TargetArch::Arm64);
        assert_eq!(TargetArch::parse("amd64").as_str(), "x86_64");
        assert_eq!(TargetArch::parse("riscv64").as_str(), "riscv64");
    }

    #[test]
    fn only_arm64_needs_signing_and_discovery() {
        assert!(TargetArch::Arm64.requires_signing());
        assert!(TargetArch::Arm64.requires_symbol_discovery());
        assert!(!TargetArch::X86_64.requires_signing());
        assert!(!TargetArch::X86_64.requires_symbol_discovery());
    }

    #[test]
    fn default_address_matches_constant() {
        let config = ClientConfig::default();
        assert_eq!(config.coordinator_addr.to_string(), DEFAULT_COORDINATOR_ADDR);
        assert_eq!(config.sign_file.file_name().and_then(|n| n.to_str()), Some("sign"));
    }
}
