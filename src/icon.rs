//! Turning the icon names applications pass us into files and pixels.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
#[cfg(target_os = "linux")]
use trayshim_data::colour::Colour;

use crate::{lock, read, write, Error, Result};

/// Mixed into the names of cached icon copies. Some trays (KDE4's) cache icons by path, so the
/// copies need to be unique across runs, not just within one.
static RUNTIME_SALT: Lazy<u64> = Lazy::new(rand::random);

static RESOURCES: Lazy<RwLock<HashMap<String, &'static [u8]>>> = Lazy::new(Default::default);

/// Makes image bytes compiled into the application resolvable as an icon called `name`.
///
/// ```
/// static TRAY_PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
///
/// trayshim::register_resource("icons/tray.png", TRAY_PNG);
/// ```
pub fn register_resource(name: impl Into<String>, bytes: &'static [u8]) {
    let name = name.into();
    tracing::debug!("Registered icon resource '{name}' ({} bytes)", bytes.len());
    write(&RESOURCES).insert(name, bytes);
}

fn resource(name: &str) -> Option<&'static [u8]> {
    read(&RESOURCES).get(name).copied()
}

/// Resolves icon names to paths of readable image files, the form every tray backend takes
/// them in.
pub(crate) struct IconResolver {
    icon_dir: Option<PathBuf>,
    temp_dir: PathBuf,
    salt: u64,
    /// Copies of embedded resources we wrote, they get deleted when we're done
    copies: Mutex<Vec<PathBuf>>,
}

impl IconResolver {
    pub fn new(icon_dir: Option<PathBuf>) -> Self {
        Self::with_locations(icon_dir, std::env::temp_dir(), *RUNTIME_SALT)
    }

    /// Like [`Self::new`], but with the cached copies going to `temp_dir` and named with `salt`
    pub(crate) fn with_locations(icon_dir: Option<PathBuf>, temp_dir: PathBuf, salt: u64) -> Self {
        Self {
            icon_dir,
            temp_dir,
            salt,
            copies: Mutex::new(Vec::new()),
        }
    }

    /// Finds the icon called `name`.
    ///
    /// A file on disk (relative to the icon directory, if one is configured) wins. Otherwise an
    /// embedded resource of that name is copied out to the temp directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let on_disk = match &self.icon_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        if is_readable_file(&on_disk) {
            return Ok(std::path::absolute(&on_disk)?);
        }

        let resource_name = match &self.icon_dir {
            Some(dir) => format!("{}/{name}", dir.display()),
            None => name.to_owned(),
        };

        let Some(bytes) = resource(&resource_name) else {
            tracing::error!("Unable to find icon '{resource_name}'");
            return Err(Error::IconNotFound(resource_name));
        };

        let target = self.temp_dir.join(cache_file_name(&resource_name, self.salt));
        if let Err(source) = fs::write(&target, bytes) {
            tracing::error!(
                "Unable to copy icon '{resource_name}' to location: '{}': {source}",
                target.display()
            );
            return Err(Error::IconCopy {
                name: resource_name,
                path: target,
                source,
            });
        }

        let mut copies = lock(&self.copies);
        if !copies.contains(&target) {
            copies.push(target.clone());
        }

        Ok(target)
    }

    /// Deletes every copy of an embedded resource this resolver wrote
    pub fn cleanup(&self) {
        for copy in lock(&self.copies).drain(..) {
            if let Err(why) = fs::remove_file(&copy) {
                if why.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to delete cached icon {}: {why}", copy.display());
                }
            }
        }
    }
}

impl Drop for IconResolver {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn is_readable_file(path: &Path) -> bool {
    path.is_file() && fs::File::open(path).is_ok()
}

/// Name of the temp file an embedded resource gets copied to: the MD5 of the resource name and
/// the salt, written in base 32, followed by the resource's extension.
pub(crate) fn cache_file_name(resource_name: &str, salt: u64) -> String {
    let mut hasher = Md5::new();
    hasher.update(resource_name.as_bytes());
    hasher.update(salt.to_be_bytes());
    let mut digest = [0; 16];
    digest.copy_from_slice(&hasher.finalize());
    let hash = u128::from_be_bytes(digest);

    let stem = to_radix32(hash);
    match resource_name.rsplit_once('.') {
        Some((_, extension)) if !extension.contains('/') => format!("{stem}.{extension}"),
        _ => stem,
    }
}

fn to_radix32(mut value: u128) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

    if value == 0 {
        return "0".to_owned();
    }

    let mut digits = Vec::with_capacity(26);
    while value > 0 {
        digits.push(DIGITS[(value % 32) as usize]);
        value /= 32;
    }
    digits.iter().rev().map(|&digit| char::from(digit)).collect()
}

/// A decoded icon, straight (not premultiplied) RGBA, rows tightly packed
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IconImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl IconImage {
    /// Loads the image at `path`, scaled to `size`x`size`
    #[cfg(target_os = "linux")]
    pub fn load(path: &Path, size: u32) -> Result<Self> {
        use gtk4::gdk_pixbuf::Pixbuf;

        let decode_error = |reason: String| Error::IconDecode {
            path: path.to_owned(),
            reason,
        };

        let side = i32::try_from(size).map_err(|_| decode_error(format!("{size} is too large")))?;
        let pixbuf = Pixbuf::from_file_at_scale(path, side, side, false)
            .map_err(|why| decode_error(why.to_string()))?;

        let width = pixbuf.width() as usize;
        let height = pixbuf.height() as usize;
        let rowstride = pixbuf.rowstride() as usize;
        let channels = pixbuf.n_channels() as usize;
        let has_alpha = pixbuf.has_alpha();
        let pixels = pixbuf.read_pixel_bytes();

        let mut rgba = Vec::with_capacity(width * height * 4);
        for y in 0..height {
            for x in 0..width {
                let idx = y * rowstride + x * channels;
                let alpha = if has_alpha { pixels[idx + 3] } else { 255 };
                rgba.extend_from_slice(&[pixels[idx], pixels[idx + 1], pixels[idx + 2], alpha]);
            }
        }

        Ok(Self {
            width: width as u32,
            height: height as u32,
            rgba,
        })
    }

    /// Loads the image at `path`, scaled to `size`x`size`
    #[cfg(not(target_os = "linux"))]
    pub fn load(path: &Path, size: u32) -> Result<Self> {
        let image = image::open(path).map_err(|why| Error::IconDecode {
            path: path.to_owned(),
            reason: why.to_string(),
        })?;
        let image = image
            .resize_exact(size, size, image::imageops::FilterType::Triangle)
            .to_rgba8();

        Ok(Self {
            width: image.width(),
            height: image.height(),
            rgba: image.into_raw(),
        })
    }

    #[cfg(target_os = "linux")]
    fn pixels(&self) -> impl Iterator<Item = Colour> + '_ {
        self.rgba.chunks_exact(4).map(|px| Colour {
            red: px[0],
            green: px[1],
            blue: px[2],
            alpha: px[3],
        })
    }

    /// ARGB32 in network byte order, as StatusNotifierItem pixmaps want it
    #[cfg(target_os = "linux")]
    pub fn to_argb32_be(&self) -> Vec<u8> {
        let mut data = self.rgba.clone();
        for chunk in data.chunks_mut(4) {
            // RGBA rotated right once gives us ARGB
            chunk.rotate_right(1);
        }
        data
    }

    /// Premultiplied ARGB32 in the byte order of a little endian X server (BGRA)
    #[cfg(target_os = "linux")]
    pub fn to_premultiplied_bgra(&self) -> Vec<u8> {
        let premultiply = |c: u8, a: u8| ((u32::from(c) * u32::from(a) + 127) / 255) as u8;

        self.pixels()
            .flat_map(|px| {
                [
                    premultiply(px.blue, px.alpha),
                    premultiply(px.green, px.alpha),
                    premultiply(px.red, px.alpha),
                    px.alpha,
                ]
            })
            .collect()
    }

    /// The icon composited over `background`, as 32 bits per pixel BGRX
    #[cfg(target_os = "linux")]
    pub fn to_opaque_bgrx(&self, background: Colour) -> Vec<u8> {
        self.pixels()
            .flat_map(|px| {
                let px = background.blend_under(px);
                [px.blue, px.green, px.red, 0]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn resolver(icon_dir: Option<PathBuf>) -> (IconResolver, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        (
            IconResolver::with_locations(icon_dir, temp.path().to_owned(), 0),
            temp,
        )
    }

    #[test]
    fn radix32() {
        assert_eq!(to_radix32(0), "0");
        assert_eq!(to_radix32(31), "v");
        assert_eq!(to_radix32(32), "10");
        assert_eq!(to_radix32(u128::MAX), "7vvvvvvvvvvvvvvvvvvvvvvvvv");
    }

    #[test]
    fn cache_names_are_salted_hashes() {
        assert_eq!(
            cache_file_name("icons/tray.png", 0),
            "4ptf44j42o2nrefjnvbagjdgfc.png"
        );
        assert_eq!(
            cache_file_name("tray.png", 0x0123_4567_89ab_cdef),
            "580vlu2b1ia8o8h8erph1v43vu.png"
        );
        assert_ne!(
            cache_file_name("icons/tray.png", 0),
            cache_file_name("icons/tray.png", 1)
        );
    }

    #[test]
    fn cache_name_without_extension() {
        let name = cache_file_name("icons.d/tray", 0);
        assert!(!name.contains('.'), "{name}");
    }

    #[test]
    fn files_on_disk_win() {
        let icons = tempfile::tempdir().unwrap();
        fs::write(icons.path().join("on-disk.png"), b"not really a png").unwrap();
        register_resource(
            format!("{}/on-disk.png", icons.path().display()),
            b"embedded",
        );

        let (resolver, temp) = resolver(Some(icons.path().to_owned()));
        let path = resolver.resolve("on-disk.png").unwrap();

        assert_eq!(path, icons.path().join("on-disk.png"));
        assert!(fs::read_dir(temp.path()).unwrap().next().is_none());
    }

    #[test]
    fn resources_are_copied_and_cleaned_up() {
        register_resource("trayshim-test/copied.png", b"\x89PNG pretend");

        let (resolver, temp) = resolver(None);
        let path = resolver.resolve("trayshim-test/copied.png").unwrap();

        assert_eq!(path.parent(), Some(temp.path()));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            cache_file_name("trayshim-test/copied.png", 0)
        );
        assert_eq!(fs::read(&path).unwrap(), b"\x89PNG pretend");

        // Resolving again reuses the same file
        assert_eq!(resolver.resolve("trayshim-test/copied.png").unwrap(), path);

        drop(resolver);
        assert!(!path.exists());
    }

    #[test]
    fn resources_are_looked_up_under_the_icon_dir() {
        register_resource("/opt/app/icons/under-dir.png", b"bytes");

        let (resolver, _temp) = resolver(Some(PathBuf::from("/opt/app/icons")));
        let path = resolver.resolve("under-dir.png").unwrap();

        assert!(path
            .to_str()
            .unwrap()
            .ends_with(&cache_file_name("/opt/app/icons/under-dir.png", 0)));
    }

    #[test]
    fn missing_icons_are_errors() {
        let (resolver, _temp) = resolver(None);
        let err = resolver.resolve("trayshim-test/nope.png").unwrap_err();

        assert!(matches!(err, Error::IconNotFound(name) if name == "trayshim-test/nope.png"));
    }

    #[test]
    fn unwritable_temp_dir_is_reported() {
        register_resource("trayshim-test/unwritable.png", b"bytes");
        let resolver = IconResolver::with_locations(
            None,
            PathBuf::from("/this/path/does/not/exist"),
            0,
        );

        let err = resolver.resolve("trayshim-test/unwritable.png").unwrap_err();
        assert!(matches!(err, Error::IconCopy { .. }));
        assert!(err.to_string().contains("unwritable.png"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pixel_conversions() {
        let image = IconImage {
            width: 2,
            height: 1,
            rgba: vec![255, 0, 0, 255, 0, 0, 255, 128],
        };

        assert_eq!(image.to_argb32_be(), [255, 255, 0, 0, 128, 0, 0, 255]);
        assert_eq!(image.to_premultiplied_bgra(), [0, 0, 255, 255, 128, 0, 0, 128]);
        assert_eq!(
            image.to_opaque_bgrx(Colour::BLACK),
            [0, 0, 255, 0, 128, 0, 0, 0]
        );
    }
}
