//! Grayscale PNG/PGM backend for flat (depth-1) images.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{GrayImage, Luma};
use pfire_core::Image;
use tracing::debug;

use crate::loader::ImageLoader;
use crate::writer::{ImageWriter, MapData};

/// Loader for 2-D grayscale images; intensities land in `[0, 1]`.
pub struct PngLoader {
    pixels: Vec<f64>,
    shape: [usize; 3],
}

impl PngLoader {
    pub fn open(path: &Path) -> Result<Self> {
        let img = image::open(path).with_context(|| format!("failed to read image {:?}", path))?;
        let luma = img.to_luma32f();
        let (w, h) = (luma.width() as usize, luma.height() as usize);
        let mut pixels = vec![0.0; w * h];
        for y in 0..h {
            for x in 0..w {
                pixels[x + w * y] = luma.get_pixel(x as u32, y as u32)[0] as f64;
            }
        }
        Ok(Self {
            pixels,
            shape: [w, h, 1],
        })
    }
}

impl ImageLoader for PngLoader {
    fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn ndim(&self) -> usize {
        2
    }

    fn read_chunk(&mut self, offset: [usize; 3], extent: [usize; 3], out: &mut [f64]) -> Result<()> {
        for d in 0..3 {
            if offset[d] + extent[d] > self.shape[d] {
                bail!(
                    "chunk offset {:?} extent {:?} exceeds image shape {:?}",
                    offset,
                    extent,
                    self.shape
                );
            }
        }
        let w = self.shape[0];
        for j in 0..extent[1] {
            for i in 0..extent[0] {
                out[i + extent[0] * j] = self.pixels[(i + offset[0]) + w * (j + offset[1])];
            }
        }
        Ok(())
    }
}

/// Writer for depth-1 images; intensities are linearly rescaled to 8 bits.
pub struct PngWriter {
    path: PathBuf,
}

impl PngWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl ImageWriter for PngWriter {
    fn write_image(&mut self, image: &Image, group: &str) -> Result<()> {
        let [w, h, d] = image.shape();
        if d != 1 {
            bail!("PNG writer supports depth-1 images only, got depth {}", d);
        }
        let grid = image.grid().clone();
        let data = image.data();
        let min = data.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let span = if max > min { max - min } else { 1.0 };

        let buf = GrayImage::from_fn(w as u32, h as u32, |x, y| {
            let v = data[grid.idx(x as usize, y as usize, 0)];
            Luma([(((v - min) / span) * 255.0).round().clamp(0.0, 255.0) as u8])
        });
        buf.save(&self.path)
            .with_context(|| format!("failed to write image {:?}", self.path))?;
        debug!(path = ?self.path, group, "wrote registered image dataset");
        Ok(())
    }

    fn write_map(&mut self, _map: &MapData, _group: &str) -> Result<()> {
        bail!("PNG writer cannot store map coefficients; use a volumetric format")
    }
}
