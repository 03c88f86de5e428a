use crate::cli::CheckArgs;
use crate::config::PartialDispatchConfig;
use crate::error::Result;
use ffdispatch::engine::config::{ActiveSelection, ForceFieldConfig, ForceFieldKind};
use ffdispatch::engine::forcefield::ForceField;
use ffdispatch::engine::shutdown::ShutdownToken;
use tracing::info;

pub async fn run(args: CheckArgs) -> Result<()> {
    let partial_config = PartialDispatchConfig::from_file(&args.config.config)?;
    let config = partial_config.merge_with_cli(&args.config)?;

    // Building the force field checks potential parameters and external scripts.
    info!("Building force field '{}' to validate its backend...", config.name);
    let forcefield = ForceField::from_config(&config, ShutdownToken::new())?;
    drop(forcefield);

    println!("✓ Configuration '{}' is valid.", args.config.config.display());
    for line in describe(&config) {
        println!("  {}", line);
    }
    Ok(())
}

fn describe(config: &ForceFieldConfig) -> Vec<String> {
    let mut lines = vec![
        format!("name:       {}", config.name),
        format!("kind:       {}", describe_kind(&config.kind)),
        format!("latency:    {} s", config.latency.as_secs_f64()),
        format!(
            "polling:    {}",
            if config.threaded { "threaded" } else { "serial" }
        ),
        format!("pbc:        {}", config.pbc),
        format!(
            "active:     {}",
            match &config.active {
                ActiveSelection::All => "all atoms".to_string(),
                ActiveSelection::Atoms(atoms) => format!("{} atom(s)", atoms.len()),
            }
        ),
    ];
    if !config.parameters.is_empty() {
        let parameters: Vec<_> = config
            .parameters
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        lines.push(format!("parameters: {}", parameters.join(", ")));
    }
    if let Some(fan_out) = &config.fan_out {
        let correction = fan_out
            .correction
            .map(|coupling| format!(", dipole correction g = {coupling}"))
            .unwrap_or_default();
        lines.push(format!(
            "fan-out:    {} bath(s){}",
            fan_out.independent_bath_count, correction
        ));
    }
    lines
}

fn describe_kind(kind: &ForceFieldKind) -> String {
    match kind {
        ForceFieldKind::LennardJones { epsilon, sigma } => {
            format!("{} (epsilon = {epsilon}, sigma = {sigma})", kind.label())
        }
        ForceFieldKind::ExternalProcess(external) => {
            format!("{} ({})", kind.label(), external.script_path().display())
        }
        ForceFieldKind::Socket { interface, driver } => format!(
            "{} ({}:{}, {} slot(s)) driving {}",
            kind.label(),
            interface.address,
            interface.port,
            interface.slots,
            describe_kind(driver)
        ),
        _ => kind.label().to_string(),
    }
}
