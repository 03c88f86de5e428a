use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XyzError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Missing atom count line")]
    MissingHeader,
    #[error("Invalid atom count '{0}'")]
    InvalidAtomCount(String),
    #[error("Expected {expected} atom lines, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// A single configuration read from an XYZ file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XyzFrame {
    pub comment: String,
    pub labels: Vec<String>,
    /// Flattened `3 × N` coordinates in file order.
    pub positions: Vec<f64>,
}

impl XyzFrame {
    pub fn n_atoms(&self) -> usize {
        self.labels.len()
    }

    /// Reads the first frame of an XYZ stream.
    pub fn read_from(reader: &mut impl BufRead) -> Result<Self, XyzError> {
        let mut lines = reader.lines();

        let header = lines.next().ok_or(XyzError::MissingHeader)??;
        let n_atoms: usize = header
            .trim()
            .parse()
            .map_err(|_| XyzError::InvalidAtomCount(header.trim().to_string()))?;

        let comment = match lines.next() {
            Some(line) => line?.trim().to_string(),
            None => return Err(XyzError::Truncated { expected: n_atoms, found: 0 }),
        };

        let mut frame = XyzFrame {
            comment,
            labels: Vec::with_capacity(n_atoms),
            positions: Vec::with_capacity(3 * n_atoms),
        };

        for index in 0..n_atoms {
            let line_no = index + 3;
            let line = match lines.next() {
                Some(line) => line?,
                None => {
                    return Err(XyzError::Truncated {
                        expected: n_atoms,
                        found: index,
                    });
                }
            };

            let mut fields = line.split_whitespace();
            let label = fields.next().ok_or_else(|| XyzError::Parse {
                line: line_no,
                reason: "empty atom line".to_string(),
            })?;
            frame.labels.push(label.to_string());

            for axis in ["x", "y", "z"] {
                let raw = fields.next().ok_or_else(|| XyzError::Parse {
                    line: line_no,
                    reason: format!("missing {axis} coordinate"),
                })?;
                let value: f64 = raw.parse().map_err(|_| XyzError::Parse {
                    line: line_no,
                    reason: format!("invalid {axis} coordinate '{raw}'"),
                })?;
                frame.positions.push(value);
            }
        }

        Ok(frame)
    }

    pub fn read_from_path(path: &Path) -> Result<Self, XyzError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }
}
