//! Image loaders and the extension registry.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use pfire_core::Image;

/// Chunked read access to an image file.
///
/// Loaders expose the promoted 3-D shape up front and copy voxel chunks on
/// demand; the owning grid decides which chunks to request.
pub trait ImageLoader {
    /// Promoted 3-D shape of the stored image.
    fn shape(&self) -> [usize; 3];

    /// Spatial rank of the stored image (2 or 3). Must agree with the rank
    /// implied by `shape()`; `load_image` rejects loaders that disagree.
    fn ndim(&self) -> usize;

    /// Copy a chunk into `out`, x fastest within the chunk extent.
    fn read_chunk(&mut self, offset: [usize; 3], extent: [usize; 3], out: &mut [f64]) -> Result<()>;
}

/// A registered loader backend.
pub struct LoaderEntry {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub open: fn(&Path) -> Result<Box<dyn ImageLoader>>,
}

/// Table of known loaders; probed in order.
pub fn registry() -> &'static [LoaderEntry] {
    &[
        LoaderEntry {
            name: "nifti",
            extensions: &["nii", "nii.gz"],
            open: nifti_open,
        },
        LoaderEntry {
            name: "png",
            extensions: &["png", "pgm"],
            open: png_open,
        },
    ]
}

fn nifti_open(path: &Path) -> Result<Box<dyn ImageLoader>> {
    Ok(Box::new(crate::nifti_io::NiftiLoader::open(path)?))
}

fn png_open(path: &Path) -> Result<Box<dyn ImageLoader>> {
    Ok(Box::new(crate::png_io::PngLoader::open(path)?))
}

/// Find a loader for `path` by matching registered extensions.
pub fn find_loader(path: &Path) -> Result<Box<dyn ImageLoader>> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("image path {:?} has no file name", path))?
        .to_ascii_lowercase();
    for entry in registry() {
        if entry
            .extensions
            .iter()
            .any(|ext| name.ends_with(&format!(".{ext}")))
        {
            return (entry.open)(path);
        }
    }
    bail!("no loader registered for image {:?}", path)
}

/// Load an image, reading the owned region chunk by chunk.
pub fn load_image(path: &Path) -> Result<Image> {
    let mut loader = find_loader(path)?;
    read_image(loader.as_mut(), path)
}

fn read_image(loader: &mut dyn ImageLoader, path: &Path) -> Result<Image> {
    let shape = loader.shape();
    let mut image = Image::new(&shape)
        .with_context(|| format!("cannot allocate image for {:?}", path))?;
    if loader.ndim() != image.ndim() {
        bail!(
            "loader for {:?} reports rank {} but shape {:?} implies rank {}",
            path,
            loader.ndim(),
            image.shape(),
            image.ndim()
        );
    }
    let (offset, extent) = image.grid().corners();
    let mut chunk = vec![0.0; extent[0] * extent[1] * extent[2]];
    loader
        .read_chunk(offset, extent, &mut chunk)
        .with_context(|| format!("failed reading voxel data from {:?}", path))?;
    copy_chunk_into(&mut image, offset, extent, &chunk);
    Ok(image)
}

/// Load an image and require it to match the shape of an existing one.
pub fn load_image_like(path: &Path, existing: &Image) -> Result<Image> {
    let image = load_image(path)?;
    if image.shape() != existing.shape() {
        bail!(
            "image {:?} has shape {:?}, expected {:?}",
            path,
            image.shape(),
            existing.shape()
        );
    }
    Ok(image)
}

fn copy_chunk_into(image: &mut Image, offset: [usize; 3], extent: [usize; 3], chunk: &[f64]) {
    let grid = image.grid().clone();
    let data = image.data_mut();
    for k in 0..extent[2] {
        for j in 0..extent[1] {
            for i in 0..extent[0] {
                let src = i + extent[0] * (j + extent[1] * k);
                let dst = grid.idx(i + offset[0], j + offset[1], k + offset[2]);
                data[dst] = chunk[src];
            }
        }
    }
}
