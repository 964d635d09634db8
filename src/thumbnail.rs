use anyhow::{bail, Result};
use std::path::Path;

/// Best-effort preview generation for uploaded images. Failures never fail
/// the upload that triggered them.
pub trait Thumbnailer: Send + Sync {
    fn generate(&self, source: &Path, target: &Path, max: (u32, u32)) -> Result<()>;
}

/// Used when no image backend is configured
pub struct NoopThumbnailer;

impl Thumbnailer for NoopThumbnailer {
    fn generate(&self, _source: &Path, _target: &Path, _max: (u32, u32)) -> Result<()> {
        bail!("thumbnail generation unavailable")
    }
}
