use super::config::{ConfigError, ExternalProcessConfig};
use crate::core::models::cell::Cell;
use crate::core::models::request::{ForceRequest, ForceResult};
use crate::core::potentials::{EvaluationError, Evaluator};
use nalgebra::Matrix3;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub const POSITIONS_FILE: &str = "positions.xyz";
pub const ENERGY_FILE: &str = "energy.au";
pub const GRADIENT_FILE: &str = "egrad.au";
pub const DIPOLE_FILE: &str = "dipole.debye";

/// Evaluates requests by running an external program in a working directory.
///
/// The program is invoked as `<working_directory>/<method_name> <positions-file> <cell>`
/// and must leave `energy.au` (one number) and `egrad.au` (the energy gradient, one
/// number per coordinate) behind; a `dipole.debye` file with three numbers is optional
/// and is passed through in the result's `extra` field. A failed run is retried up to
/// `max_retries` times.
pub struct ExternalProcess {
    config: ExternalProcessConfig,
    working_directory: PathBuf,
    script: PathBuf,
    failed: AtomicBool,
    run_lock: Mutex<()>,
}

impl ExternalProcess {
    pub fn new(config: ExternalProcessConfig) -> Result<Self, ConfigError> {
        let working_directory =
            fs::canonicalize(&config.working_directory).map_err(|e| ConfigError::InvalidValue {
                name: "working_directory",
                reason: format!("{}: {e}", config.working_directory.display()),
            })?;
        let script = working_directory.join(&config.method_name);
        if !script.is_file() {
            return Err(ConfigError::InvalidValue {
                name: "method_name",
                reason: format!("no program at {}", script.display()),
            });
        }
        Ok(Self {
            config,
            working_directory,
            script,
            failed: AtomicBool::new(false),
            run_lock: Mutex::new(()),
        })
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn max_retries(&self) -> usize {
        self.config.max_retries
    }

    /// `true` when the most recent evaluation ended with every attempt failing.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn run_once(&self, request: &ForceRequest) -> Result<ForceResult, EvaluationError> {
        let dir = &self.working_directory;
        for name in [ENERGY_FILE, GRADIENT_FILE, DIPOLE_FILE] {
            remove_stale(&dir.join(name))?;
        }

        let positions_path = dir.join(POSITIONS_FILE);
        fs::write(&positions_path, self.format_positions(request.position()))
            .map_err(|source| io_error(&positions_path, source))?;

        let command = self.script.display().to_string();
        let output = Command::new(&self.script)
            .arg(&positions_path)
            .arg(format_cell(request.cell()))
            .current_dir(dir)
            .output()
            .map_err(|source| EvaluationError::Launch {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(EvaluationError::ProcessFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let energy = read_numbers(&dir.join(ENERGY_FILE), 1)?[0];
        let gradient = read_numbers(&dir.join(GRADIENT_FILE), request.n_coords())?;

        let dipole_path = dir.join(DIPOLE_FILE);
        let extra = if dipole_path.is_file() {
            let mu = read_numbers(&dipole_path, 3)?;
            format!("{} {} {}", mu[0], mu[1], mu[2])
        } else {
            String::new()
        };

        Ok(ForceResult {
            energy,
            forces: gradient.iter().map(|g| -g).collect(),
            virial: Matrix3::zeros(),
            extra,
        })
    }

    fn format_positions(&self, positions: &[f64]) -> String {
        let labels = &self.config.labels;
        let mut out = String::with_capacity(positions.len() * 16);
        for (atom, r) in positions.chunks_exact(3).enumerate() {
            if !labels.is_empty() {
                let _ = write!(out, "{} ", labels[atom % labels.len()]);
            }
            let _ = writeln!(out, "{:.8} {:.8} {:.8}", r[0], r[1], r[2]);
        }
        out
    }
}

impl Evaluator for ExternalProcess {
    fn name(&self) -> &str {
        &self.config.method_name
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
        // Runs share the output files of the working directory.
        let _guard = self.run_lock.lock();

        let max = self.config.max_retries;
        let mut last = String::new();
        for attempt in 1..=max {
            match self.run_once(request) {
                Ok(result) => {
                    self.failed.store(false, Ordering::Release);
                    debug!(id = request.id(), attempt, "External evaluation succeeded.");
                    return Ok(result);
                }
                Err(err) => {
                    warn!(id = request.id(), attempt, max, error = %err, "External evaluation failed.");
                    last = err.to_string();
                }
            }
        }

        self.failed.store(true, Ordering::Release);
        Err(EvaluationError::RetriesExhausted {
            attempts: max,
            last,
        })
    }
}

/// The cell matrix, row-major, as a single space-separated argument.
pub fn format_cell(cell: &Cell) -> String {
    let h = cell.h();
    (0..3)
        .flat_map(|i| (0..3).map(move |j| h[(i, j)]))
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn remove_stale(path: &Path) -> Result<(), EvaluationError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(io_error(path, source)),
    }
}

fn read_numbers(path: &Path, expected: usize) -> Result<Vec<f64>, EvaluationError> {
    let content = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    let numbers = content
        .split_whitespace()
        .map(|token| {
            token.parse::<f64>().map_err(|_| EvaluationError::MalformedOutput {
                path: path.display().to_string(),
                reason: format!("'{token}' is not a number"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if numbers.len() != expected {
        return Err(EvaluationError::MalformedOutput {
            path: path.display().to_string(),
            reason: format!("expected {expected} values, found {}", numbers.len()),
        });
    }
    Ok(numbers)
}

fn io_error(path: &Path, source: io::Error) -> EvaluationError {
    EvaluationError::Io {
        path: path.display().to_string(),
        source,
    }
}
