//! One-time identity exchange at the start of a connection.

use super::catalog::{ModuleCatalog, ModuleOrigin};
use crate::config::ClientConfig;
use crate::error::ProtocolError;
use crate::protocol::{
    FrameReader, Outbound, Response, FRAMEWORK_DELIMITER, HANDSHAKE_KEY, HANDSHAKE_SALT,
    LOG_PREFIX, PLUGIN_STAGING_DIR,
};
use crate::runtime::ImageLister;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Identity sent when no sign file is bundled.
pub const UNSIGNED_IDENTITY: &str = "-";
/// Identity sent when the sign file exists but cannot be read.
pub const UNREADABLE_IDENTITY: &str = "_";

/// Outcome of the handshake.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Coordinator-assigned staging directory.
    pub staging_dir: PathBuf,
    /// The coordinator runs as an IDE plugin and wants no module list.
    pub plugin_mode: bool,
    pub catalog: ModuleCatalog,
}

/// Read the code-signing identity from `path`, trimming line breaks.
pub fn read_sign_identity(path: &Path) -> String {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "{LOG_PREFIX}No sign file with the app's signing identity. The module load may fail."
        );
        return UNSIGNED_IDENTITY.to_string();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => contents.trim_matches(|c| c == '\n' || c == '\r').to_string(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read sign file");
            UNREADABLE_IDENTITY.to_string()
        }
    }
}

/// Send our identity, read back the staging directory and, outside plugin
/// mode, report every loaded module.
pub fn negotiate<R: Read>(
    reader: &mut FrameReader<R>,
    outbound: &Outbound,
    config: &ClientConfig,
    images: &dyn ImageLister,
) -> Result<Negotiated, ProtocolError> {
    let sign = config
        .arch
        .requires_signing()
        .then(|| read_sign_identity(&config.sign_file));
    if let Some(sign) = &sign {
        info!(sign = %sign, file = %config.sign_file.display(), "Signing identity");
    }

    outbound.write_with(|w| {
        w.write_int(HANDSHAKE_SALT)?;
        w.write_string(HANDSHAKE_KEY)?;
        w.write_string(&config.staging_hint.to_string_lossy())?;
        w.write_string(config.arch.as_str())?;
        if let Some(sign) = &sign {
            w.write_string(sign)?;
        }
        w.write_string(&config.executable_path.to_string_lossy())
    })?;

    let staging_dir = reader
        .read_string()?
        .unwrap_or_else(|| PLUGIN_STAGING_DIR.to_string());
    let plugin_mode = staging_dir == PLUGIN_STAGING_DIR;
    debug!(staging_dir = %staging_dir, plugin_mode, "Coordinator assigned staging directory");

    let catalog = if plugin_mode {
        ModuleCatalog::new(&config.app_modules_prefix)
    } else {
        let catalog =
            ModuleCatalog::from_images(&config.app_modules_prefix, &images.loaded_images());
        let packages = images.package_names().join(FRAMEWORK_DELIMITER);
        outbound.write_with(|w| {
            w.write_opcode(Response::FrameworkList as u32)?;
            w.write_string(&catalog.joined_names(ModuleOrigin::Application))?;
            w.write_string(&catalog.joined_names(ModuleOrigin::System))?;
            w.write_string(&packages)
        })?;
        info!(modules = catalog.len(), "Reported loaded modules");
        catalog
    };

    Ok(Negotiated {
        staging_dir: PathBuf::from(staging_dir),
        plugin_mode,
        catalog,
    })
}
