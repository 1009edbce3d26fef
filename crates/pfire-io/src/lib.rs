//! Image and map I/O for the registration pipeline.
//!
//! Formats live behind small loader/writer traits and are selected by file
//! extension from registered tables; adding a format means adding a registry
//! entry, not touching call sites.

pub mod loader;
pub mod nifti_io;
pub mod png_io;
pub mod writer;

pub use loader::{find_loader, load_image, load_image_like, ImageLoader, LoaderEntry};
pub use writer::{find_writer, write_image, write_map, Destination, ImageWriter, MapData, WriterEntry};
