use image::codecs::png::PngEncoder;
use image::io::Reader as ImageReader;
use image::{DynamicImage, ImageError};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::ClassifyError;
use crate::log_warn;

/// Upload extensions accepted by `predict_upload` (lowercase).
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tiff"];

/// 16 MiB.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Lowercased extension of `filename`, if it has one.
pub fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_lowercase())
}

pub fn is_allowed_file(filename: &str) -> bool {
    extension_of(filename).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// Reduce an untrusted upload name to a safe single path component:
/// ASCII letters, digits, `.`, `_` and `-`; whitespace becomes `_`;
/// leading dots and underscores are stripped.
pub fn secure_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    cleaned.trim_start_matches(['.', '_']).to_string()
}

/// Extension allow-list and size limit.
pub fn validate_upload(filename: &str, size: usize) -> Result<(), ClassifyError> {
    if !is_allowed_file(filename) {
        return Err(ClassifyError::UnsupportedExtension(
            extension_of(filename).unwrap_or_default(),
        ));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(ClassifyError::UploadTooLarge {
            size,
            limit: MAX_UPLOAD_BYTES,
        });
    }
    Ok(())
}

// ============================================================================
// DECODE / ENCODE
// ============================================================================

/// Decode an in-memory image, sniffing the container from its bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ClassifyError> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    Ok(img)
}

/// Load an image from disk. The container is sniffed from the file
/// contents, so a mislabelled extension still decodes.
pub fn load_image(path: &Path) -> Result<DynamicImage, ClassifyError> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    match reader.decode() {
        Ok(img) => Ok(img),
        Err(ImageError::IoError(e)) => Err(ClassifyError::Io(e)),
        Err(e) => Err(e.into()),
    }
}

/// Write `image` as PNG, keeping its channel layout.
pub fn save_png(image: &DynamicImage, path: &Path) -> Result<(), ImageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let encoder = PngEncoder::new(&mut writer);
    #[allow(deprecated)]
    encoder.encode(image.as_bytes(), image.width(), image.height(), image.color())?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// SCOPED UPLOADS
// ============================================================================

/// An uploaded file parked on disk for the duration of one prediction.
/// The file is removed when this value is dropped, on every exit path.
#[derive(Debug)]
pub struct ScopedUpload {
    path: PathBuf,
}

impl ScopedUpload {
    /// Write `bytes` into `dir` under a unique name derived from `filename`.
    pub fn write(dir: &Path, filename: &str, bytes: &[u8]) -> Result<Self, ClassifyError> {
        fs::create_dir_all(dir)?;
        let safe = secure_filename(filename);
        let name = if safe.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            format!("{}_{}", Uuid::new_v4(), safe)
        };
        // Built before the write so a partial file is still cleaned up.
        let upload = Self {
            path: dir.join(name),
        };
        fs::write(&upload.path, bytes)?;
        Ok(upload)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedUpload {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log_warn!("could not remove upload {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("medscan-io-{}", Uuid::new_v4()))
    }

    #[test]
    fn extensions_are_case_insensitive() {
        assert_eq!(extension_of("scan.PNG").as_deref(), Some("png"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of("trailing."), None);
        assert!(is_allowed_file("mri.JPEG"));
        assert!(is_allowed_file("slide.tiff"));
        assert!(!is_allowed_file("slide.tif"));
        assert!(!is_allowed_file("notes.txt"));
    }

    #[test]
    fn secure_filename_strips_paths_and_symbols() {
        assert_eq!(secure_filename("../../etc/passwd"), "passwd");
        assert_eq!(secure_filename("C:\\scans\\my scan.png"), "my_scan.png");
        assert_eq!(secure_filename(".hidden.png"), "hidden.png");
        assert_eq!(secure_filename("ü.png"), "png");
    }

    #[test]
    fn upload_validation() {
        assert!(validate_upload("a.png", 10).is_ok());
        assert!(matches!(
            validate_upload("a.gif", 10),
            Err(ClassifyError::UnsupportedExtension(ext)) if ext == "gif"
        ));
        assert!(matches!(
            validate_upload("a.png", MAX_UPLOAD_BYTES + 1),
            Err(ClassifyError::UploadTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_bytes_are_invalid_image() {
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(ClassifyError::InvalidImage(_))
        ));
    }

    #[test]
    fn png_round_trip_through_disk() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mask.png");
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 3, Luma([200])));
        save_png(&img, &path).unwrap();
        let back = load_image(&path).unwrap().to_luma8();
        assert_eq!(back.dimensions(), (4, 3));
        assert_eq!(back.get_pixel(2, 1)[0], 200);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn scoped_upload_is_removed_on_drop() {
        let dir = scratch_dir();
        let path = {
            let upload = ScopedUpload::write(&dir, "../scan.png", b"bytes").unwrap();
            assert!(upload.path().exists());
            assert!(upload.path().starts_with(&dir));
            upload.path().to_path_buf()
        };
        assert!(!path.exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
