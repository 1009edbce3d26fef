//! Image/map writers, output destinations and the writer registry.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use pfire_core::Image;

/// Exported map state handed to writers.
///
/// Components are the per-dimension displacement fields followed by the
/// luminance field, each on the node grid in x-fastest order.
#[derive(Debug, Clone)]
pub struct MapData {
    pub node_shape: [usize; 3],
    pub node_spacing: [f64; 3],
    pub ndim: usize,
    pub components: Vec<Vec<f64>>,
}

/// Format backend able to persist images and maps.
pub trait ImageWriter {
    fn write_image(&mut self, image: &Image, group: &str) -> Result<()>;
    fn write_map(&mut self, map: &MapData, group: &str) -> Result<()>;
}

/// A registered writer backend.
pub struct WriterEntry {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub create: fn(&Path) -> Result<Box<dyn ImageWriter>>,
}

/// Table of known writers; probed in order.
pub fn registry() -> &'static [WriterEntry] {
    &[
        WriterEntry {
            name: "nifti",
            extensions: &["nii", "nii.gz"],
            create: nifti_create,
        },
        WriterEntry {
            name: "png",
            extensions: &["png", "pgm"],
            create: png_create,
        },
    ]
}

fn nifti_create(path: &Path) -> Result<Box<dyn ImageWriter>> {
    Ok(Box::new(crate::nifti_io::NiftiWriter::new(path)))
}

fn png_create(path: &Path) -> Result<Box<dyn ImageWriter>> {
    Ok(Box::new(crate::png_io::PngWriter::new(path)))
}

/// Find a writer for `path` by matching registered extensions.
pub fn find_writer(path: &Path) -> Result<Box<dyn ImageWriter>> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("output path {:?} has no file name", path))?
        .to_ascii_lowercase();
    for entry in registry() {
        if entry
            .extensions
            .iter()
            .any(|ext| name.ends_with(&format!(".{ext}")))
        {
            return (entry.create)(path);
        }
    }
    bail!("no writer registered for output {:?}", path)
}

/// An output location of the form `path[:group]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub path: PathBuf,
    pub group: String,
}

impl Destination {
    /// Parse `file:/group` syntax; the group defaults to the file stem.
    pub fn parse(spec: &str) -> Result<Self> {
        let (path, group) = match spec.split_once(':') {
            Some((p, g)) if !p.is_empty() => (p, g.to_owned()),
            Some(_) => bail!("output destination '{}' has an empty path", spec),
            None => (spec, String::new()),
        };
        if path.is_empty() {
            bail!("output destination is empty");
        }
        let path = PathBuf::from(path);
        let group = if group.is_empty() {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("data");
            format!("/{stem}")
        } else {
            group
        };
        Ok(Self { path, group })
    }
}

/// Write an image to a destination through the registry.
pub fn write_image(dest: &Destination, image: &Image) -> Result<()> {
    let mut writer = find_writer(&dest.path)?;
    writer.write_image(image, &dest.group)
}

/// Write map coefficients to a destination through the registry.
pub fn write_map(dest: &Destination, map: &MapData) -> Result<()> {
    let mut writer = find_writer(&dest.path)?;
    writer.write_map(map, &dest.group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_with_group() {
        let dest = Destination::parse("registered.nii:/registered").unwrap();
        assert_eq!(dest.path, PathBuf::from("registered.nii"));
        assert_eq!(dest.group, "/registered");
    }

    #[test]
    fn test_destination_without_group_uses_stem() {
        let dest = Destination::parse("out/map.nii").unwrap();
        assert_eq!(dest.group, "/map");
    }

    #[test]
    fn test_empty_destination_rejected() {
        assert!(Destination::parse("").is_err());
        assert!(Destination::parse(":/group").is_err());
    }

    #[test]
    fn test_unknown_writer_extension_rejected() {
        assert!(find_writer(Path::new("out.xyz")).is_err());
    }
}
