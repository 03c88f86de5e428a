use thiserror::Error;

use super::config::ConfigError;
use super::interface::InterfaceError;
use crate::core::models::cell::CellError;
use crate::core::potentials::EvaluationError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error(
        "Active atom list of {count} coordinates (first out-of-range index {offending:?}) does not fit a system of {n_coords} coordinates"
    )]
    ActiveAtomsOutOfRange {
        count: usize,
        offending: Option<usize>,
        n_coords: usize,
    },

    #[error("Cannot split {n_coords} coordinates into {baths} equally sized baths")]
    BathSizing { n_coords: usize, baths: usize },

    #[error("{charges} bath charges given for baths of {atoms_per_bath} atoms")]
    ChargeCount { charges: usize, atoms_per_bath: usize },

    #[error("Force field '{0}' has already been started")]
    AlreadyStarted(String),

    #[error("Request {id} was aborted{}", abort_detail(.child))]
    Aborted { id: i64, child: Option<i64> },

    #[error("Invalid cell: {source}")]
    Cell {
        #[from]
        source: CellError,
    },

    #[error("Evaluation failed: {source}")]
    Evaluation {
        #[from]
        source: EvaluationError,
    },

    #[error("Remote interface error: {source}")]
    Interface {
        #[from]
        source: InterfaceError,
    },

    #[error("Failed to spawn thread '{name}': {source}")]
    Thread {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

fn abort_detail(child: &Option<i64>) -> String {
    child
        .map(|c| format!(" (sub-request {c} failed)"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_message_names_failed_child_when_known() {
        let plain = DispatchError::Aborted { id: 4, child: None };
        assert_eq!(plain.to_string(), "Request 4 was aborted");

        let fan_out = DispatchError::Aborted {
            id: 4,
            child: Some(13),
        };
        assert_eq!(
            fan_out.to_string(),
            "Request 4 was aborted (sub-request 13 failed)"
        );
    }

    #[test]
    fn config_errors_convert_with_question_mark() {
        fn fails() -> Result<(), DispatchError> {
            Err(ConfigError::MissingParameter("name"))?
        }
        assert!(matches!(fails(), Err(DispatchError::Config { .. })));
    }
}
