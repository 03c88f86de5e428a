use super::{EvaluationError, Evaluator};
use crate::core::models::request::{ForceRequest, ForceResult};
use nalgebra::{Matrix3, Vector3};

/// Pairwise 12-6 Lennard-Jones without cutoff, minimum image or neighbour lists.
///
/// `V = 4ε Σ_{i<j} [(σ/r_ij)^12 − (σ/r_ij)^6]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LennardJones {
    epsilon: f64,
    sigma: f64,
    eps_four: f64,
    six_eps_four: f64,
    sigma_sq: f64,
}

impl LennardJones {
    pub fn new(epsilon: f64, sigma: f64) -> Result<Self, EvaluationError> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(EvaluationError::InvalidParameter {
                name: "sigma",
                reason: format!("must be positive, got {sigma}"),
            });
        }
        if !epsilon.is_finite() {
            return Err(EvaluationError::InvalidParameter {
                name: "epsilon",
                reason: format!("must be finite, got {epsilon}"),
            });
        }
        let eps_four = 4.0 * epsilon;
        Ok(Self {
            epsilon,
            sigma,
            eps_four,
            six_eps_four: 6.0 * eps_four,
            sigma_sq: sigma * sigma,
        })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    fn energy_and_forces(&self, q: &[f64]) -> (f64, Vec<f64>) {
        let atoms: Vec<Vector3<f64>> = q
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();

        let mut reduced = 0.0;
        let mut forces = vec![Vector3::zeros(); atoms.len()];
        for i in 1..atoms.len() {
            for j in 0..i {
                let d = atoms[i] - atoms[j];
                let r2 = d.norm_squared();
                let x6 = (self.sigma_sq / r2).powi(3);
                let x12 = x6 * x6;

                reduced += x12 - x6;
                let f = d * (self.six_eps_four * (2.0 * x12 - x6) / r2);
                forces[i] += f;
                forces[j] -= f;
            }
        }

        let flat = forces.iter().flat_map(|f| [f.x, f.y, f.z]).collect();
        (self.eps_four * reduced, flat)
    }
}

impl Evaluator for LennardJones {
    fn name(&self) -> &str {
        "lennard-jones"
    }

    fn validate(&self, n_coords: usize) -> Result<(), EvaluationError> {
        if n_coords % 3 != 0 {
            return Err(EvaluationError::SizeMismatch {
                what: "coordinates (multiple of 3)",
                expected: n_coords - n_coords % 3,
                found: n_coords,
            });
        }
        Ok(())
    }

    fn evaluate(&self, request: &ForceRequest) -> Result<ForceResult, EvaluationError> {
        self.validate(request.n_coords())?;
        let (energy, forces) = self.energy_and_forces(request.position());
        Ok(ForceResult {
            energy,
            forces,
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

    fn f64_approx_equal(a: f64, b: f64) -> bool {
        (a - b).abs() < TOLERANCE
    }

    fn closed_form(epsilon: f64, sigma: f64, r: f64) -> (f64, f64) {
        let sr6 = (sigma / r).powi(6);
        let energy = 4.0 * epsilon * (sr6 * sr6 - sr6);
        let force = 24.0 * epsilon * (2.0 * sr6 * sr6 - sr6) / r;
        (energy, force)
    }

    #[test]
    fn new_rejects_non_positive_sigma() {
        assert!(matches!(
            LennardJones::new(1.0, 0.0),
            Err(EvaluationError::InvalidParameter { name: "sigma", .. })
        ));
    }

    #[test]
    fn dimer_matches_closed_form_energy_and_force() {
        let lj = LennardJones::new(1.0, 1.0).unwrap();
        let r = 1.5;
        let request = request_at(vec![0.0, 0.0, 0.0, r, 0.0, 0.0]);
        let result = lj.evaluate(&request).unwrap();

        let (energy, force) = closed_form(1.0, 1.0, r);
        assert!(f64_approx_equal(result.energy, energy));
        assert!(f64_approx_equal(result.forces[3], force));
        assert!(f64_approx_equal(result.forces[0], -force));
        for idx in [1, 2, 4, 5] {
            assert_eq!(result.forces[idx], 0.0);
        }
    }

    #[test]
    fn dimer_at_potential_minimum_has_well_depth_energy_and_no_force() {
        let epsilon = 0.25;
        let sigma = 3.4;
        let lj = LennardJones::new(epsilon, sigma).unwrap();
        let r_min = 2f64.powf(1.0 / 6.0) * sigma;
        let request = request_at(vec![0.0, 0.0, 0.0, 0.0, r_min, 0.0]);
        let result = lj.evaluate(&request).unwrap();

        assert!((result.energy + epsilon).abs() < 1e-9);
        assert!(result.forces.iter().all(|f| f.abs() < 1e-9));
    }

    #[test]
    fn dimer_at_sigma_has_zero_energy_and_repulsive_force() {
        let lj = LennardJones::new(1.0, 1.0).unwrap();
        let request = request_at(vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let result = lj.evaluate(&request).unwrap();

        assert!(f64_approx_equal(result.energy, 0.0));
        assert!(f64_approx_equal(result.forces[5], 24.0));
        assert!(f64_approx_equal(result.forces[2], -24.0));
    }

    #[test]
    fn trimer_forces_sum_to_zero() {
        let lj = LennardJones::new(0.7, 1.1).unwrap();
        let request = request_at(vec![0.0, 0.0, 0.0, 1.2, 0.1, 0.0, 0.3, 1.4, -0.2]);
        let result = lj.evaluate(&request).unwrap();

        for axis in 0..3 {
            let net: f64 = result.forces.iter().skip(axis).step_by(3).sum();
            assert!(net.abs() < 1e-9);
        }
    }

    #[test]
    fn single_atom_has_no_energy() {
        let lj = LennardJones::new(1.0, 1.0).unwrap();
        let result = lj.evaluate(&request_at(vec![1.0, 2.0, 3.0])).unwrap();
        assert_eq!(result.energy, 0.0);
        assert_eq!(result.forces, vec![0.0; 3]);
    }

    #[test]
    fn validate_rejects_coordinates_not_in_triplets() {
        let lj = LennardJones::new(1.0, 1.0).unwrap();
        assert!(lj.validate(7).is_err());
        assert!(lj.validate(9).is_ok());
    }
}
