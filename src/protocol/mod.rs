//! Wire protocol spoken with the build coordinator.
//!
//! Every integer is 4 bytes little-endian. Strings and blobs carry an `i32`
//! length prefix; a negative length encodes an absent value. Opcodes are bare
//! integers followed by whatever payload the opcode implies.

mod command;
mod transport;

pub use command::{Command, Opcode, Response};
pub use transport::{FrameReader, FrameWriter, Outbound};

/// First handshake token (integer).
pub const HANDSHAKE_SALT: i32 = 2_122_172_543;
/// Second handshake token (string).
pub const HANDSHAKE_KEY: &str = "bvijkijyhbtrbrebzjbbzcfbbvvq";

/// Staging directory the coordinator answers with when running as a plugin.
/// Also the fallback when no directory is sent back.
pub const PLUGIN_STAGING_DIR: &str = "/tmp";

/// Separator for the module lists sent with `FrameworkList`.
pub const FRAMEWORK_DELIMITER: &str = ",";
/// Separator for the symbol list sent with `CallOrderList`.
pub const CALLORDER_DELIMITER: &str = "---";

/// Upper bound on a single string/blob frame (256 MiB).
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Prefix on operator-facing log lines.
pub const LOG_PREFIX: &str = "💉 ";
