use super::{EvaluationError, Evaluator};
use crate::core::models::request::{ForceRequest, ForceResult};
use nalgebra::{DMatrix, DVector, Matrix3};
use tracing::debug;

/// Harmonic reference potential (Debye crystal) around a minimum-energy configuration.
///
/// `V(q) = v_ref + ½ dᵀ H d` and `F(q) = −H d` with `d = q − x_ref`. Forces are always
/// computed on unfolded coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicReference {
    hessian: DMatrix<f64>,
    x_ref: DVector<f64>,
    v_ref: f64,
}

impl HarmonicReference {
    pub fn new(
        hessian: DMatrix<f64>,
        x_ref: DVector<f64>,
        v_ref: f64,
    ) -> Result<Self, EvaluationError> {
        if hessian.is_empty() {
            return Err(EvaluationError::InvalidParameter {
                name: "hessian",
                reason: "a Hessian must be provided".to_string(),
            });
        }
        if !hessian.is_square() {
            return Err(EvaluationError::SizeMismatch {
                what: "Hessian columns",
                expected: hessian.nrows(),
                found: hessian.ncols(),
            });
        }
        if x_ref.len() != hessian.nrows() {
            return Err(EvaluationError::SizeMismatch {
                what: "reference configuration",
                expected: hessian.nrows(),
                found: x_ref.len(),
            });
        }

        let eigenvalues = hessian.clone().symmetric_eigenvalues();
        debug!(eigenvalues = ?eigenvalues.as_slice(), "Harmonic reference Hessian eigenvalues.");

        Ok(Self {
            hessian,
            x_ref,
            v_ref,
        })
    }

    /// Builds the potential from a row-major flattened Hessian.
    pub fn from_row_major(
        hessian: &[f64],
        x_ref: &[f64],
        v_ref: f64,
    ) -> Result<Self, EvaluationError> {
        let n = x_ref.len();
        if hessian.len() != n * n {
            return Err(EvaluationError::SizeMismatch {
                what: "Hessian entries",
                expected: n * n,
                found: hessian.len(),
            });
        }
        Self::new(
            DMatrix::from_row_slice(n, n, hessian),
            DVector::from_column_slice(x_ref),
            v_ref,
        )
    }

    pub fn dimension(&self) -> usize {
        self.x_ref.len()
    }
}

impl Evaluator for HarmonicReference {
    fn name(&self) -> &str {
        "harmonic"
    }

    fn validate(&self, n_coords: usize) -> Result<(), EvaluationError> {
        if n_coords != self.dimension() {
            return Err(EvaluationError::SizeMismatch {
                what: "Hessian",
                expected: self.dimension(),
                found: n_coords,
            });
        }
        Ok(())
    }

    fn evaluate(&self, request: &ForceRequest) -> Result<ForceResult, EvaluationError> {
        self.validate(request.n_coords())?;

        let q = DVector::from_column_slice(request.position());
        let d = q - &self.x_ref;
        let minus_forces = &self.hessian * &d;
        let energy = self.v_ref + 0.5 * d.dot(&minus_forces);

        Ok(ForceResult {
            energy,
            forces: minus_forces.iter().map(|f| -f).collect(),
            virial: Matrix3::zeros(),
            extra: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::potentials::test_utils::request_at;

    const TOLERANCE: f64 = 1e-12;

    fn diagonal(k: f64, n: usize) -> HarmonicReference {
        HarmonicReference::new(
            DMatrix::from_diagonal_element(n, n, k),
            DVector::zeros(n),
            -1.0,
        )
        .unwrap()
    }

    #[test]
    fn new_rejects_empty_hessian() {
        let result = HarmonicReference::new(DMatrix::zeros(0, 0), DVector::zeros(0), 0.0);
        assert!(matches!(
            result,
            Err(EvaluationError::InvalidParameter { name: "hessian", .. })
        ));
    }

    #[test]
    fn new_rejects_reference_of_wrong_length() {
        let result = HarmonicReference::new(DMatrix::identity(3, 3), DVector::zeros(6), 0.0);
        assert!(matches!(result, Err(EvaluationError::SizeMismatch { .. })));
    }

    #[test]
    fn from_row_major_rejects_wrong_entry_count() {
        let result = HarmonicReference::from_row_major(&[1.0; 8], &[0.0; 3], 0.0);
        assert!(matches!(result, Err(EvaluationError::SizeMismatch { .. })));
    }

    #[test]
    fn energy_at_reference_equals_reference_energy() {
        let potential = diagonal(2.0, 3);
        let result = potential.evaluate(&request_at(vec![0.0; 3])).unwrap();
        assert!((result.energy + 1.0).abs() < TOLERANCE);
        assert!(result.forces.iter().all(|f| *f == 0.0));
    }

    #[test]
    fn displaced_configuration_has_quadratic_energy_and_restoring_force() {
        let potential = diagonal(2.0, 3);
        let result = potential
            .evaluate(&request_at(vec![0.5, -1.0, 0.0]))
            .unwrap();

        // ½ · 2 · (0.25 + 1.0) − 1
        assert!((result.energy - 0.25).abs() < TOLERANCE);
        assert_eq!(result.forces, vec![-1.0, 2.0, -0.0]);
    }

    #[test]
    fn coupled_hessian_uses_off_diagonal_terms() {
        let potential =
            HarmonicReference::from_row_major(&[2.0, 1.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 1.0], &[0.0; 3], 0.0)
                .unwrap();
        let result = potential.evaluate(&request_at(vec![1.0, 0.0, 0.0])).unwrap();

        assert!((result.energy - 1.0).abs() < TOLERANCE);
        assert_eq!(result.forces[0], -2.0);
        assert_eq!(result.forces[1], -1.0);
    }

    #[test]
    fn validate_rejects_system_of_different_size() {
        let potential = diagonal(1.0, 6);
        assert!(potential.validate(6).is_ok());
        assert!(matches!(
            potential.validate(9),
            Err(EvaluationError::SizeMismatch {
                expected: 6,
                found: 9,
                ..
            })
        ));
    }
}
