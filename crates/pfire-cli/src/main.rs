//! pfire: elastic registration of a moved image onto a fixed reference.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use pfire_core::{SolverConfig, SolverKind};
use pfire_io::{Destination, MapData};
use pfire_registration::{Elastic, RegistrationConfig};

/// Elastic image registration.
///
/// Computes a smooth displacement field plus a luminance correction that
/// warp MOVED into alignment with FIXED, then writes the registered image
/// and the map coefficients.
#[derive(Parser, Debug)]
#[command(name = "pfire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Reference image
    #[arg(value_name = "FIXED")]
    fixed: PathBuf,

    /// Image to register
    #[arg(value_name = "MOVED")]
    moved: PathBuf,

    /// Target finest node spacing, one value per image dimension
    /// (a single value applies to all dimensions)
    #[arg(value_name = "NODESPACING", value_delimiter = ',', num_args = 1..)]
    nodespacing: Vec<u32>,

    /// Reserved; masks are not yet supported
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Output location for the warped image, as `file[:group]`
    #[arg(long, default_value = "registered.nii:/registered")]
    registered: String,

    /// Output location for the map coefficients, as `file[:group]`
    #[arg(long, default_value = "map.nii:/map")]
    map: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit the registered image after every inner iteration
    #[arg(long)]
    debug_frames: bool,

    /// Filename prefix for debug frames
    #[arg(long, default_value = "debug")]
    debug_frames_prefix: String,

    /// Linear solver type (gmres or cg)
    #[arg(long, default_value = "gmres")]
    solver: String,

    /// Linear solver relative tolerance
    #[arg(long, default_value_t = 1e-5)]
    solver_rtol: f64,

    /// Linear solver iteration budget
    #[arg(long, default_value_t = 10_000)]
    solver_max_iter: usize,

    /// Regularization weight on the map Laplacian
    #[arg(long, default_value_t = 20.0)]
    lambda: f64,

    /// Extra regularization weight on the luminance block
    #[arg(long, default_value_t = 1.0)]
    lambda_luminance_scale: f64,

    /// Maximum inner iterations per generation
    #[arg(long, default_value_t = 50)]
    max_iterations: usize,

    /// Convergence threshold on the coefficient update
    #[arg(long, default_value_t = 0.1)]
    convergence_threshold: f64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let start = Instant::now();

    let mut fixed =
        pfire_io::load_image(&cli.fixed).context("failed to load fixed image")?;
    info!(shape = ?fixed.shape(), ndim = fixed.ndim(), "loaded fixed image");
    let mut moved = pfire_io::load_image_like(&cli.moved, &fixed)
        .context("failed to load moved image")?;
    info!(shape = ?moved.shape(), "loaded moved image");

    if cli.mask.is_some() {
        warn!("mask support is not yet implemented; ignoring --mask");
    }

    fixed.normalize().context("fixed image is not normalizable")?;
    moved.normalize().context("moved image is not normalizable")?;

    let nodespacing = expand_nodespacing(&cli.nodespacing, fixed.ndim())?;
    let config = build_config(&cli)?;

    let mut registration = Elastic::new(fixed, moved, &nodespacing, config)?;

    if cli.debug_frames {
        let prefix = cli.debug_frames_prefix.clone();
        registration.set_frame_callback(Box::new(move |outer, inner, image| {
            let path = format!("{prefix}_o{outer}_i{inner}.nii");
            match Destination::parse(&path) {
                Ok(dest) => {
                    if let Err(err) = pfire_io::write_image(&dest, image) {
                        warn!(frame = %path, "failed to write debug frame: {:#}", err);
                    }
                }
                Err(err) => warn!(frame = %path, "bad debug frame path: {:#}", err),
            }
        }));
    }

    let summary = registration.autoregister()?;
    if !summary.converged() {
        warn!(
            iterations = summary.total_iterations,
            "registration finished without meeting the convergence threshold"
        );
    }

    let registered_dest = Destination::parse(&cli.registered)?;
    pfire_io::write_image(&registered_dest, registration.registered())
        .context("failed to write registered image")?;

    let map_dest = Destination::parse(&cli.map)?;
    let map = registration.map();
    let map_data = MapData {
        node_shape: map.node_shape(),
        node_spacing: map.spacing(),
        ndim: map.ndim(),
        components: map.components(),
    };
    pfire_io::write_map(&map_dest, &map_data).context("failed to write map")?;

    info!(
        elapsed_s = start.elapsed().as_secs_f64(),
        iterations = summary.total_iterations,
        "registration complete"
    );
    Ok(())
}

/// Expand the nodespacing argument to one entry per image dimension.
fn expand_nodespacing(values: &[u32], ndim: usize) -> Result<Vec<f64>> {
    if values.iter().any(|&v| v == 0) {
        bail!("nodespacing values must be positive");
    }
    match values.len() {
        1 => Ok(vec![values[0] as f64; ndim]),
        n if n == ndim => Ok(values.iter().map(|&v| v as f64).collect()),
        n => bail!(
            "nodespacing has {} entries but the image has {} dimensions",
            n,
            ndim
        ),
    }
}

fn build_config(cli: &Cli) -> Result<RegistrationConfig> {
    let kind: SolverKind = cli.solver.parse()?;
    let solver = SolverConfig::new()
        .with_kind(kind)
        .with_rtol(cli.solver_rtol)
        .with_max_iterations(cli.solver_max_iter);
    Ok(RegistrationConfig::new()
        .with_max_iterations(cli.max_iterations)
        .with_convergence_threshold(cli.convergence_threshold)
        .with_lambda(cli.lambda)
        .with_lambda_luminance_scale(cli.lambda_luminance_scale)
        .with_solver(solver))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_spacing_broadcasts() {
        assert_eq!(expand_nodespacing(&[8], 3).unwrap(), vec![8.0, 8.0, 8.0]);
    }

    #[test]
    fn test_per_dimension_spacing() {
        assert_eq!(expand_nodespacing(&[4, 8], 2).unwrap(), vec![4.0, 8.0]);
    }

    #[test]
    fn test_spacing_rank_mismatch_rejected() {
        assert!(expand_nodespacing(&[4, 8], 3).is_err());
        assert!(expand_nodespacing(&[0], 3).is_err());
    }

    #[test]
    fn test_cli_parses_positional_form() {
        let cli = Cli::try_parse_from(["pfire", "fixed.nii", "moved.nii", "8"]).unwrap();
        assert_eq!(cli.fixed, PathBuf::from("fixed.nii"));
        assert_eq!(cli.nodespacing, vec![8]);
        assert!(!cli.debug_frames);
    }

    #[test]
    fn test_cli_parses_long_form() {
        let cli = Cli::try_parse_from([
            "pfire",
            "f.nii",
            "m.nii",
            "4,4,8",
            "--solver",
            "cg",
            "--lambda",
            "5.0",
            "--debug-frames",
            "--debug-frames-prefix",
            "frames/dbg",
        ])
        .unwrap();
        assert_eq!(cli.nodespacing, vec![4, 4, 8]);
        assert_eq!(cli.solver, "cg");
        assert!(cli.debug_frames);
        let config = build_config(&cli).unwrap();
        assert!((config.lambda - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_arguments_rejected() {
        assert!(Cli::try_parse_from(["pfire", "fixed.nii"]).is_err());
    }
}
