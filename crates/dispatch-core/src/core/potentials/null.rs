use super::{EvaluationError, Evaluator};
use crate::core::models::request::{ForceRequest, ForceResult};

/// The base backend: every request completes with zero energy, zero forces and a zero virial.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPotential;

impl Evaluator for NullPotential {
    fn name(&self) -> &str {
        "null"
    }

    fn evaluate(&self, request: &ForceRequest) -> Result<ForceResult, EvaluationError> {
        Ok(ForceResult::zeros(request.n_coords()))
    }
}
