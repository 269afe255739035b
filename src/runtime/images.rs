//! Enumeration of the images currently mapped into this process.

use std::path::PathBuf;

/// Source of the live image list, supplied by the host.
pub trait ImageLister: Send + Sync {
    /// Paths of every loaded image, most recently loaded first.
    fn loaded_images(&self) -> Vec<PathBuf>;

    /// Higher-level package names the host can identify in its executable.
    fn package_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Walks the dynamic loader's image list.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveImages;

impl ImageLister for LiveImages {
    fn loaded_images(&self) -> Vec<PathBuf> {
        let mut images = platform_images();
        images.reverse();
        images
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn platform_images() -> Vec<PathBuf> {
    use std::ffi::CStr;
    use std::os::raw::{c_int, c_void};

    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: usize,
        data: *mut c_void,
    ) -> c_int {
        // SAFETY: `data` is the `Vec<PathBuf>` passed below and `info` is
        // valid for the duration of the callback per dl_iterate_phdr(3).
        let images = &mut *(data as *mut Vec<PathBuf>);
        let name = (*info).dlpi_name;
        if !name.is_null() {
            let name = CStr::from_ptr(name).to_string_lossy();
            if !name.is_empty() {
                images.push(PathBuf::from(name.into_owned()));
            }
        }
        0
    }

    let mut images: Vec<PathBuf> = Vec::new();
    // SAFETY: the callback only touches `images`, which outlives the call.
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut images as *mut Vec<PathBuf> as *mut c_void);
    }
    images
}

#[cfg(target_vendor = "apple")]
fn platform_images() -> Vec<PathBuf> {
    use std::ffi::CStr;

    // SAFETY: dyld's image list accessors are thread-safe; indices past a
    // concurrently unloaded image yield null, which is skipped.
    unsafe {
        (0..libc::_dyld_image_count())
            .filter_map(|i| {
                let name = libc::_dyld_get_image_name(i);
                if name.is_null() {
                    None
                } else {
                    Some(PathBuf::from(
                        CStr::from_ptr(name).to_string_lossy().into_owned(),
                    ))
                }
            })
            .collect()
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_vendor = "apple"
)))]
fn platform_images() -> Vec<PathBuf> {
    Vec::new()
}
