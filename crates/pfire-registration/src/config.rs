//! Registration configuration.

use pfire_core::SolverConfig;

use crate::error::{RegistrationError, Result};

/// Tunable parameters of the elastic registration driver.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Maximum inner-loop iterations per generation.
    pub max_iterations: usize,
    /// Convergence threshold on the infinity norm of the coefficient update.
    pub convergence_threshold: f64,
    /// Tikhonov regularization weight on the map Laplacian.
    pub lambda: f64,
    /// Extra weight on the luminance block of the Laplacian, relative to the
    /// spatial blocks.
    pub lambda_luminance_scale: f64,
    /// Row-batching granularity (in image rows) for basis assembly.
    pub tile_dim: usize,
    /// Linear solver settings.
    pub solver: SolverConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_threshold: 0.1,
            lambda: 20.0,
            lambda_luminance_scale: 1.0,
            tile_dim: 32,
            solver: SolverConfig::default(),
        }
    }
}

impl RegistrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_lambda_luminance_scale(mut self, scale: f64) -> Self {
        self.lambda_luminance_scale = scale;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Check parameter ranges before a run.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(RegistrationError::config("max_iterations must be positive"));
        }
        if !(self.convergence_threshold > 0.0) {
            return Err(RegistrationError::config(
                "convergence_threshold must be positive",
            ));
        }
        if self.lambda < 0.0 || !self.lambda.is_finite() {
            return Err(RegistrationError::config(format!(
                "lambda must be finite and non-negative, got {}",
                self.lambda
            )));
        }
        if self.lambda_luminance_scale < 0.0 {
            return Err(RegistrationError::config(
                "lambda_luminance_scale must be non-negative",
            ));
        }
        if self.tile_dim == 0 {
            return Err(RegistrationError::config("tile_dim must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_driver_contract() {
        let config = RegistrationConfig::default();
        assert_eq!(config.max_iterations, 50);
        assert!((config.convergence_threshold - 0.1).abs() < 1e-12);
        assert!((config.lambda - 20.0).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(RegistrationConfig::new()
            .with_max_iterations(0)
            .validate()
            .is_err());
        assert!(RegistrationConfig::new()
            .with_convergence_threshold(0.0)
            .validate()
            .is_err());
        assert!(RegistrationConfig::new().with_lambda(-1.0).validate().is_err());
    }

    #[test]
    fn test_lambda_zero_is_allowed() {
        // Unsupported but must not be rejected outright.
        assert!(RegistrationConfig::new().with_lambda(0.0).validate().is_ok());
    }
}
