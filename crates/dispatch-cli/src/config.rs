use crate::cli::{ConfigArgs, Threading};
use crate::error::{CliError, Result};
use ffdispatch::engine::config as core_config;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
enum PartialSocketMode {
    Unix,
    Inet,
}

impl From<PartialSocketMode> for core_config::SocketMode {
    fn from(p: PartialSocketMode) -> Self {
        match p {
            PartialSocketMode::Unix => core_config::SocketMode::Unix,
            PartialSocketMode::Inet => core_config::SocketMode::Inet,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
enum PartialMatching {
    Auto,
    Any,
}

impl From<PartialMatching> for core_config::Matching {
    fn from(p: PartialMatching) -> Self {
        match p {
            PartialMatching::Auto => core_config::Matching::Auto,
            PartialMatching::Any => core_config::Matching::Any,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "type")]
enum PartialKind {
    Null,
    LennardJones {
        epsilon: f64,
        sigma: f64,
    },
    Harmonic {
        hessian: Vec<f64>,
        x_ref: Vec<f64>,
        v_ref: Option<f64>,
    },
    ExternalProcess {
        working_directory: PathBuf,
        method_name: String,
        labels: Option<Vec<String>>,
        max_retries: Option<usize>,
    },
    Socket {
        address: Option<String>,
        port: Option<u32>,
        mode: Option<PartialSocketMode>,
        slots: Option<usize>,
        timeout: Option<f64>,
        matching: Option<PartialMatching>,
        exit_on_disconnect: Option<bool>,
        driver: Box<PartialKind>,
    },
}

impl PartialKind {
    /// Relative working directories are taken relative to the configuration file.
    fn into_core(self, base_dir: &Path) -> core_config::ForceFieldKind {
        match self {
            PartialKind::Null => core_config::ForceFieldKind::Null,
            PartialKind::LennardJones { epsilon, sigma } => {
                core_config::ForceFieldKind::LennardJones { epsilon, sigma }
            }
            PartialKind::Harmonic {
                hessian,
                x_ref,
                v_ref,
            } => core_config::ForceFieldKind::Harmonic {
                hessian,
                x_ref,
                v_ref: v_ref.unwrap_or(0.0),
            },
            PartialKind::ExternalProcess {
                working_directory,
                method_name,
                labels,
                max_retries,
            } => {
                let mut external =
                    core_config::ExternalProcessConfig::new(base_dir.join(working_directory), method_name);
                external.labels = labels.unwrap_or_default();
                if let Some(max_retries) = max_retries {
                    external.max_retries = max_retries;
                }
                core_config::ForceFieldKind::ExternalProcess(external)
            }
            PartialKind::Socket {
                address,
                port,
                mode,
                slots,
                timeout,
                matching,
                exit_on_disconnect,
                driver,
            } => {
                let defaults = core_config::InterfaceConfig::default();
                core_config::ForceFieldKind::Socket {
                    interface: core_config::InterfaceConfig {
                        address: address.unwrap_or(defaults.address),
                        port: port.unwrap_or(defaults.port),
                        mode: mode.map(Into::into).unwrap_or(defaults.mode),
                        slots: slots.unwrap_or(defaults.slots),
                        timeout: timeout.unwrap_or(defaults.timeout),
                        matching: matching.map(Into::into).unwrap_or(defaults.matching),
                        exit_on_disconnect: exit_on_disconnect.unwrap_or(defaults.exit_on_disconnect),
                    },
                    driver: Box::new(driver.into_core(base_dir)),
                }
            }
        }
    }
}

/// `"all"` or a list of atom indices.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
enum PartialActive {
    Keyword(String),
    Atoms(Vec<usize>),
}

impl TryFrom<PartialActive> for core_config::ActiveSelection {
    type Error = CliError;

    fn try_from(p: PartialActive) -> Result<Self> {
        match p {
            PartialActive::Keyword(word) if word == "all" => Ok(core_config::ActiveSelection::All),
            PartialActive::Keyword(word) => Err(CliError::Config(format!(
                "`forcefield.active` must be \"all\" or a list of atom indices, got \"{}\"",
                word
            ))),
            PartialActive::Atoms(atoms) => Ok(core_config::ActiveSelection::Atoms(atoms)),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct PartialFanOutConfig {
    #[serde(rename = "independent-bath-count")]
    independent_bath_count: Option<usize>,
    charges: Option<Vec<f64>>,
    correction: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct PartialForceFieldConfig {
    name: Option<String>,
    latency: Option<f64>,
    threaded: Option<bool>,
    pbc: Option<bool>,
    active: Option<PartialActive>,
    parameters: Option<BTreeMap<String, toml::Value>>,
    kind: Option<PartialKind>,
    #[serde(rename = "fan-out")]
    fan_out: Option<PartialFanOutConfig>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialDispatchConfig {
    forcefield: Option<PartialForceFieldConfig>,
}

impl PartialDispatchConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| CliError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn merge_with_cli(mut self, args: &ConfigArgs) -> Result<core_config::ForceFieldConfig> {
        self.apply_set_values(&args.set_values)?;

        let ff = self
            .forcefield
            .take()
            .ok_or_else(|| CliError::Config("`[forcefield]` section is required.".to_string()))?;
        let name = ff
            .name
            .ok_or_else(|| CliError::Config("`forcefield.name` is required.".to_string()))?;
        let kind = ff
            .kind
            .ok_or_else(|| CliError::Config("`[forcefield.kind]` section is required.".to_string()))?;
        let base_dir = args.config.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut builder = core_config::ForceFieldConfigBuilder::new()
            .name(name)
            .kind(kind.into_core(&base_dir))
            .parameters(Self::merge_parameters(ff.parameters.unwrap_or_default())?);

        if let Some(latency) = args.latency.or(ff.latency) {
            builder = builder.latency(latency);
        }
        if let Some(threaded) = Self::merge_threading(args.threading, ff.threaded) {
            builder = builder.threaded(threaded);
        }
        if let Some(pbc) = ff.pbc {
            builder = builder.pbc(pbc);
        }
        if let Some(active) = ff.active {
            builder = builder.active(active.try_into()?);
        }
        if let Some(fan_out) = ff.fan_out {
            builder = builder.fan_out(Self::merge_fan_out(fan_out)?);
        }

        builder.build().map_err(|e| CliError::Config(e.to_string()))
    }

    fn merge_threading(cli_flags: Threading, file_val: Option<bool>) -> Option<bool> {
        if cli_flags.threaded {
            Some(true)
        } else if cli_flags.serial {
            Some(false)
        } else {
            file_val
        }
    }

    fn merge_parameters(partial: BTreeMap<String, toml::Value>) -> Result<BTreeMap<String, String>> {
        partial
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s,
                    toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => {
                        value.to_string()
                    }
                    other => {
                        return Err(CliError::Config(format!(
                            "`forcefield.parameters.{}` must be a scalar, got a {}",
                            key,
                            other.type_str()
                        )));
                    }
                };
                Ok((key, value))
            })
            .collect()
    }

    fn merge_fan_out(partial: PartialFanOutConfig) -> Result<core_config::FanOutConfig> {
        Ok(core_config::FanOutConfig {
            independent_bath_count: partial.independent_bath_count.ok_or_else(|| {
                CliError::Config("`fan-out` requires `independent-bath-count`".to_string())
            })?,
            charges: partial.charges.unwrap_or_default(),
            correction: partial.correction,
        })
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        if set_values.is_empty() {
            return Ok(());
        }
        for kv_pair in set_values {
            let Some((key, value_str)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };
            let ff = self.forcefield.get_or_insert_with(Default::default);

            match key {
                "forcefield.name" => ff.name = Some(value_str.to_string()),
                "forcefield.latency" => ff.latency = Some(parse_value(key, value_str, "float")?),
                "forcefield.threaded" => ff.threaded = Some(parse_value(key, value_str, "boolean")?),
                "forcefield.pbc" => ff.pbc = Some(parse_value(key, value_str, "boolean")?),
                "forcefield.fan-out.independent-bath-count" => {
                    ff.fan_out
                        .get_or_insert_with(Default::default)
                        .independent_bath_count = Some(parse_value(key, value_str, "integer")?);
                }
                "forcefield.fan-out.correction" => {
                    ff.fan_out.get_or_insert_with(Default::default).correction =
                        Some(parse_value(key, value_str, "float")?);
                }
                _ => match key.strip_prefix("forcefield.parameters.") {
                    Some(parameter) if !parameter.is_empty() => {
                        ff.parameters
                            .get_or_insert_with(Default::default)
                            .insert(parameter.to_string(), toml::Value::String(value_str.to_string()));
                    }
                    _ => {
                        return Err(CliError::Config(format!(
                            "Unsupported configuration key for --set: '{}'",
                            key
                        )));
                    }
                },
            }
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid {} value for {}: {}", what, key, value)))
}
