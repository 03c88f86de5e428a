use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CellError {
    #[error("Cell matrix is singular (determinant {determinant:e})")]
    Singular { determinant: f64 },
    #[error("Cell vector lengths must be positive, got ({a}, {b}, {c})")]
    NonPositiveLength { a: f64, b: f64, c: f64 },
}

/// The simulation box, stored as the cell matrix `h` (lattice vectors as columns)
/// together with its inverse.
///
/// The inverse is computed once at construction so that folding many configurations
/// into the primary cell never repeats the inversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    h: Matrix3<f64>,
    ih: Matrix3<f64>,
}

impl Cell {
    /// Creates a cell from its matrix, failing if the matrix cannot be inverted.
    pub fn new(h: Matrix3<f64>) -> Result<Self, CellError> {
        let ih = h.try_inverse().ok_or(CellError::Singular {
            determinant: h.determinant(),
        })?;
        Ok(Self { h, ih })
    }

    /// Creates an orthorhombic cell with edge lengths `a`, `b` and `c`.
    pub fn orthorhombic(a: f64, b: f64, c: f64) -> Result<Self, CellError> {
        if a <= 0.0 || b <= 0.0 || c <= 0.0 {
            return Err(CellError::NonPositiveLength { a, b, c });
        }
        Self::new(Matrix3::from_diagonal(&Vector3::new(a, b, c)))
    }

    pub fn h(&self) -> &Matrix3<f64> {
        &self.h
    }

    pub fn ih(&self) -> &Matrix3<f64> {
        &self.ih
    }

    pub fn volume(&self) -> f64 {
        self.h.determinant().abs()
    }

    /// Folds flattened `3 × N` coordinates into the primary cell in place.
    ///
    /// Each position is converted to scaled coordinates, shifted by the nearest lattice
    /// translation and converted back, so every scaled component ends up in `[-0.5, 0.5]`.
    pub fn fold(&self, positions: &mut [f64]) {
        for atom in positions.chunks_exact_mut(3) {
            let r = Vector3::new(atom[0], atom[1], atom[2]);
            let mut s = self.ih * r;
            s.apply(|x| *x -= x.round());
            let folded = self.h * s;
            atom.copy_from_slice(folded.as_slice());
        }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            h: Matrix3::identity(),
            ih: Matrix3::identity(),
        }
    }
}
