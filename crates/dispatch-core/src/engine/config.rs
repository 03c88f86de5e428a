use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_LATENCY_SECS: f64 = 0.01;
pub const DEFAULT_MAX_RETRIES: usize = 50;
pub const MAX_SLOTS: usize = 5;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),
}

/// Which atoms a force field acts on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActiveSelection {
    #[default]
    All,
    /// Atom indices; each expands to its three Cartesian coordinates.
    Atoms(Vec<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketMode {
    Unix,
    #[default]
    Inet,
}

/// How queued requests are assigned to remote workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Matching {
    /// Prefer the worker that last served the same request id.
    #[default]
    Auto,
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    pub address: String,
    pub port: u32,
    pub mode: SocketMode,
    pub slots: usize,
    /// Seconds a worker may hold a request before it is declared disconnected; `0` disables.
    pub timeout: f64,
    pub matching: Matching,
    pub exit_on_disconnect: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 65535,
            mode: SocketMode::Inet,
            slots: 4,
            timeout: 0.0,
            matching: Matching::Auto,
            exit_on_disconnect: false,
        }
    }
}

impl InterfaceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=65535).contains(&self.port) {
            return Err(ConfigError::InvalidValue {
                name: "port",
                reason: format!("must be in 1..=65535, got {}", self.port),
            });
        }
        if !(1..=MAX_SLOTS).contains(&self.slots) {
            return Err(ConfigError::InvalidValue {
                name: "slots",
                reason: format!("must be in 1..={MAX_SLOTS}, got {}", self.slots),
            });
        }
        if !self.timeout.is_finite() || self.timeout < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "timeout",
                reason: format!("must be non-negative, got {}", self.timeout),
            });
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingParameter("address"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0.0).then(|| Duration::from_secs_f64(self.timeout))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalProcessConfig {
    pub working_directory: PathBuf,
    pub method_name: String,
    /// Atom labels written next to the coordinates; empty means coordinates only.
    pub labels: Vec<String>,
    pub max_retries: usize,
}

impl ExternalProcessConfig {
    pub fn new(working_directory: impl Into<PathBuf>, method_name: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            method_name: method_name.into(),
            labels: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.working_directory.join(&self.method_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanOutConfig {
    pub independent_bath_count: usize,
    /// Per-atom charges of a single bath, repeated for every bath.
    pub charges: Vec<f64>,
    /// Coupling strength of the dipole self-energy correction, if applied.
    pub correction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForceFieldKind {
    Null,
    LennardJones {
        epsilon: f64,
        sigma: f64,
    },
    /// Row-major Hessian around `x_ref` with reference energy `v_ref`.
    Harmonic {
        hessian: Vec<f64>,
        x_ref: Vec<f64>,
        v_ref: f64,
    },
    ExternalProcess(ExternalProcessConfig),
    /// A remote interface whose workers each evaluate with `driver`.
    Socket {
        interface: InterfaceConfig,
        driver: Box<ForceFieldKind>,
    },
}

impl ForceFieldKind {
    pub fn label(&self) -> &'static str {
        match self {
            ForceFieldKind::Null => "null",
            ForceFieldKind::LennardJones { .. } => "lennard-jones",
            ForceFieldKind::Harmonic { .. } => "harmonic",
            ForceFieldKind::ExternalProcess(_) => "external-process",
            ForceFieldKind::Socket { .. } => "socket",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForceFieldConfig {
    pub name: String,
    pub latency: Duration,
    pub parameters: BTreeMap<String, String>,
    pub active: ActiveSelection,
    pub pbc: bool,
    pub threaded: bool,
    pub kind: ForceFieldKind,
    pub fan_out: Option<FanOutConfig>,
}

#[derive(Default)]
pub struct ForceFieldConfigBuilder {
    name: Option<String>,
    latency: Option<f64>,
    parameters: BTreeMap<String, String>,
    active: Option<ActiveSelection>,
    pbc: Option<bool>,
    threaded: Option<bool>,
    kind: Option<ForceFieldKind>,
    fan_out: Option<FanOutConfig>,
}

impl ForceFieldConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    /// Polling interval in seconds.
    pub fn latency(mut self, seconds: f64) -> Self {
        self.latency = Some(seconds);
        self
    }
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
    pub fn parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters.extend(parameters);
        self
    }
    pub fn active(mut self, selection: ActiveSelection) -> Self {
        self.active = Some(selection);
        self
    }
    pub fn pbc(mut self, pbc: bool) -> Self {
        self.pbc = Some(pbc);
        self
    }
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = Some(threaded);
        self
    }
    pub fn kind(mut self, kind: ForceFieldKind) -> Self {
        self.kind = Some(kind);
        self
    }
    pub fn fan_out(mut self, fan_out: FanOutConfig) -> Self {
        self.fan_out = Some(fan_out);
        self
    }

    pub fn build(self) -> Result<ForceFieldConfig, ConfigError> {
        let name = self.name.ok_or(ConfigError::MissingParameter("name"))?;
        let kind = self.kind.ok_or(ConfigError::MissingParameter("kind"))?;

        let latency = self.latency.unwrap_or(DEFAULT_LATENCY_SECS);
        if !latency.is_finite() || latency < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "latency",
                reason: format!("must be non-negative, got {latency}"),
            });
        }

        let is_socket = matches!(kind, ForceFieldKind::Socket { .. });
        let threaded = self.threaded.unwrap_or(is_socket);
        let mut pbc = self.pbc.unwrap_or(false);

        match &kind {
            ForceFieldKind::LennardJones { .. } if pbc => {
                return Err(ConfigError::Unsupported(
                    "the Lennard-Jones potential does not support periodic boundary conditions"
                        .to_string(),
                ));
            }
            ForceFieldKind::Harmonic { .. } if pbc => {
                warn!(forcefield = %name, "Periodic boundary conditions are never applied to a harmonic reference; ignoring pbc.");
                pbc = false;
            }
            ForceFieldKind::Socket { interface, driver } => {
                interface.validate()?;
                if !threaded {
                    return Err(ConfigError::InvalidValue {
                        name: "threaded",
                        reason: "socket force fields must run in threaded mode".to_string(),
                    });
                }
                if matches!(driver.as_ref(), ForceFieldKind::Socket { .. }) {
                    return Err(ConfigError::Unsupported(
                        "a socket driver cannot itself be a socket".to_string(),
                    ));
                }
            }
            ForceFieldKind::ExternalProcess(external) => {
                if external.method_name.trim().is_empty() {
                    return Err(ConfigError::MissingParameter("method_name"));
                }
                if external.max_retries == 0 {
                    return Err(ConfigError::InvalidValue {
                        name: "max_retries",
                        reason: "at least one attempt is required".to_string(),
                    });
                }
            }
            _ => {}
        }

        if let Some(fan_out) = &self.fan_out {
            if fan_out.independent_bath_count == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "independent_bath_count",
                    reason: "at least one bath is required".to_string(),
                });
            }
            if fan_out.correction.is_some() && fan_out.charges.is_empty() {
                return Err(ConfigError::MissingParameter("charges"));
            }
        }

        Ok(ForceFieldConfig {
            name,
            latency: Duration::from_secs_f64(latency),
            parameters: self.parameters,
            active: self.active.unwrap_or_default(),
            pbc,
            threaded,
            kind,
            fan_out: self.fan_out,
        })
    }
}
