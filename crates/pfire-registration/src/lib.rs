//! Elastic image registration: coarse-to-fine Gauss–Newton alignment of a
//! moved image onto a fixed reference through a node-grid displacement and
//! luminance map.

pub mod basis;
pub mod config;
pub mod elastic;
pub mod error;
pub mod laplacian;
pub mod map;
pub mod workspace;

pub use config::RegistrationConfig;
pub use elastic::{calculate_node_spacings, Elastic, GenerationResult, RegistrationSummary};
pub use error::{RegistrationError, Result};
pub use map::Map;
pub use workspace::WorkSpace;
