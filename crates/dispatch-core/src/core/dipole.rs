//! Per-bath dipole aggregates and the post-processing correction applied to fan-out results.
//!
//! A configuration split into `n` independent baths of equal size carries one dipole per
//! bath, `μ_b = Σ_i q_i r_i` over the atoms of that bath. The charges are given once per
//! bath and repeated for every bath.

use nalgebra::Vector3;

/// Additive energy/force contribution returned by a [`BathCorrection`].
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub energy: f64,
    pub forces: Vec<f64>,
}

/// A pluggable physics collaborator that corrects a merged fan-out result.
pub trait BathCorrection: Send + Sync {
    fn name(&self) -> &str;

    /// Computes the correction for the merged configuration.
    ///
    /// `dipoles` holds one entry per bath, `charges` one entry per atom of a single bath,
    /// and the returned forces must have `n_coords` entries.
    fn correct(&self, dipoles: &[Vector3<f64>], charges: &[f64], n_coords: usize) -> Correction;
}

/// Computes the dipole of each of `n_bath` equally sized, contiguous baths.
///
/// Returns an empty vector when `n_bath` is zero.
pub fn bath_dipoles(positions: &[f64], n_bath: usize, charges: &[f64]) -> Vec<Vector3<f64>> {
    if n_bath == 0 {
        return Vec::new();
    }
    let block = positions.len() / n_bath;
    positions
        .chunks(block.max(1))
        .take(n_bath)
        .map(|bath| {
            bath.chunks_exact(3)
                .zip(charges)
                .fold(Vector3::zeros(), |acc, (r, q)| {
                    acc + Vector3::new(r[0], r[1], r[2]) * *q
                })
        })
        .collect()
}

/// Dipole self-energy of the total dipole in a transverse (x, y) coupling field.
///
/// `E = ½ g (Mx² + My²)` with `M = Σ_b μ_b`, giving `F_i = −g q_i (Mx, My, 0)` for every
/// atom `i`, where `q_i` is the charge of the atom's position within its bath.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DipoleSelfEnergy {
    coupling: f64,
}

impl DipoleSelfEnergy {
    pub fn new(coupling: f64) -> Self {
        Self { coupling }
    }

    pub fn coupling(&self) -> f64 {
        self.coupling
    }
}

impl BathCorrection for DipoleSelfEnergy {
    fn name(&self) -> &str {
        "dipole-self-energy"
    }

    fn correct(&self, dipoles: &[Vector3<f64>], charges: &[f64], n_coords: usize) -> Correction {
        let total = dipoles.iter().fold(Vector3::zeros(), |acc, mu| acc + mu);
        let energy = 0.5 * self.coupling * (total.x * total.x + total.y * total.y);

        let mut forces = vec![0.0; n_coords];
        if !charges.is_empty() {
            for (atom, force) in forces.chunks_exact_mut(3).enumerate() {
                let q = charges[atom % charges.len()];
                force[0] = -self.coupling * q * total.x;
                force[1] = -self.coupling * q * total.y;
            }
        }

        Correction { energy, forces }
    }
}
