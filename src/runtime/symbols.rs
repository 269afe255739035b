//! What an image defines, read from its file on disk.

use crate::error::PatchError;
use object::{BinaryFormat, Object, ObjectSymbol};
use std::collections::BTreeSet;
use std::ffi::c_void;
use std::path::Path;

/// Names of the symbols the image at `path` defines, spelled the way `dlsym`
/// expects them. Imports are excluded.
pub fn defined_symbols(path: &Path) -> Result<BTreeSet<String>, PatchError> {
    let data = std::fs::read(path)
        .map_err(|e| PatchError::Load(format!("{}: {}", path.display(), e)))?;
    let file = object::File::parse(&*data)
        .map_err(|e| PatchError::Load(format!("{}: {}", path.display(), e)))?;
    // Mach-O prefixes C-level names with an underscore.
    let strip_underscore = file.format() == BinaryFormat::MachO;

    Ok(file
        .symbols()
        .chain(file.dynamic_symbols())
        .filter(|symbol| symbol.is_definition())
        .filter_map(|symbol| symbol.name().ok())
        .map(|name| match name.strip_prefix('_') {
            Some(stripped) if strip_underscore => stripped,
            _ => name,
        })
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

/// Whether `address` lies inside the image mapped from `path`. `None` when
/// the platform cannot tell.
#[cfg(unix)]
pub fn address_in_image(address: *const c_void, path: &Path) -> Option<bool> {
    use std::ffi::CStr;

    let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: dladdr only writes into `info`, which is sized for a Dl_info.
    if unsafe { libc::dladdr(address, info.as_mut_ptr()) } == 0 {
        return Some(false);
    }
    // SAFETY: a non-zero return means `info` was filled in.
    let info = unsafe { info.assume_init() };
    if info.dli_fname.is_null() {
        return Some(false);
    }
    // SAFETY: dli_fname points at the loader's NUL-terminated image name.
    let owner = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
    Some(same_file(Path::new(owner.as_ref()), path))
}

#[cfg(not(unix))]
pub fn address_in_image(_address: *const c_void, _path: &Path) -> Option<bool> {
    None
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
