use crate::cli::EvaluateArgs;
use crate::config::PartialDispatchConfig;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use ffdispatch::{
    core::{io::xyz::XyzFrame, models::cell::Cell},
    engine::{
        config::ForceFieldKind, error::DispatchError, forcefield::ForceField,
        progress::ProgressReporter, shutdown::ShutdownToken,
    },
    workflows::{self, evaluate::ReplicaResult},
};
use tracing::{info, warn};

pub async fn run(args: EvaluateArgs) -> Result<()> {
    if args.replicas == 0 {
        return Err(CliError::Argument("--replicas must be at least 1".to_string()));
    }

    let partial_config = PartialDispatchConfig::from_file(&args.config.config)?;
    info!("Merging configuration from file and CLI arguments...");
    let mut config = partial_config.merge_with_cli(&args.config)?;

    info!("Loading input configuration from {:?}", &args.input);
    let frame = XyzFrame::read_from_path(&args.input).map_err(|source| CliError::Frame {
        path: args.input.clone(),
        source,
    })?;
    fill_labels(&mut config.kind, &frame.labels);

    let cell = match args.cell {
        Some([a, b, c]) => Cell::orthorhombic(a, b, c).map_err(DispatchError::from)?,
        None => Cell::default(),
    };

    let forcefield = ForceField::from_config(&config, ShutdownToken::new())?;
    forcefield.start()?;

    let replicas = vec![frame.positions; args.replicas];
    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!(
        "Evaluating {} replica(s) of {} atom(s) with force field '{}'...",
        replicas.len(),
        frame.labels.len(),
        forcefield.name()
    );
    let outcome = tokio::task::block_in_place(|| {
        workflows::evaluate::run(&forcefield, &replicas, &cell, &reporter)
    });
    forcefield.stop();

    if let Some(reason) = forcefield.shutdown().reason() {
        warn!("Force field '{}' was shut down: {}", forcefield.name(), reason);
    }
    let results = outcome?;
    info!("Evaluation finished, received {} result(s).", results.len());

    for line in format_results(&results) {
        println!("{}", line);
    }
    Ok(())
}

/// Lets an external script see element names when the configuration omits them.
fn fill_labels(kind: &mut ForceFieldKind, labels: &[String]) {
    match kind {
        ForceFieldKind::ExternalProcess(external) if external.labels.is_empty() => {
            external.labels = labels.to_vec();
        }
        ForceFieldKind::Socket { driver, .. } => fill_labels(driver, labels),
        _ => {}
    }
}

fn format_results(results: &[ReplicaResult]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:>8}  {:>18}  {:>14}  {:>12}",
        "replica", "energy", "max |force|", "latency (ms)"
    )];
    for result in results {
        let max_force = result
            .result
            .forces
            .iter()
            .fold(0.0f64, |max, f| max.max(f.abs()));
        let latency = result
            .latency
            .map(|latency| format!("{:.3}", latency.as_secs_f64() * 1e3))
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "{:>8}  {:>18.10}  {:>14.6e}  {:>12}",
            result.replica, result.result.energy, max_force, latency
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{ConfigArgs, Threading};
    use ffdispatch::core::models::request::ForceResult;
    use ffdispatch::engine::config::ExternalProcessConfig;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn evaluate_args(dir: &Path, replicas: usize) -> EvaluateArgs {
        EvaluateArgs {
            config: ConfigArgs {
                config: dir.join("forcefield.toml"),
                latency: None,
                threading: Threading::default(),
                set_values: Vec::new(),
            },
            input: dir.join("dimer.xyz"),
            replicas,
            cell: None,
        }
    }

    fn write_inputs(dir: &Path, threaded: bool) {
        fs::write(
            dir.join("forcefield.toml"),
            format!(
                "[forcefield]\nname = \"lj\"\nlatency = 0.001\nthreaded = {threaded}\n\
                 [forcefield.kind]\ntype = \"lennard-jones\"\nepsilon = 1.0\nsigma = 1.0\n"
            ),
        )
        .unwrap();
        fs::write(dir.join("dimer.xyz"), "2\ndimer\nAr 0.0 0.0 0.0\nAr 1.5 0.0 0.0\n").unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn evaluates_replicas_of_an_xyz_frame() {
        let dir = tempdir().unwrap();
        write_inputs(dir.path(), true);
        run(evaluate_args(dir.path(), 3)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_replicas_is_an_argument_error() {
        let dir = tempdir().unwrap();
        write_inputs(dir.path(), false);
        assert!(matches!(
            run(evaluate_args(dir.path(), 0)).await,
            Err(CliError::Argument(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_frame_is_a_parsing_error() {
        let dir = tempdir().unwrap();
        write_inputs(dir.path(), false);
        fs::write(dir.path().join("dimer.xyz"), "two\n").unwrap();
        assert!(matches!(
            run(evaluate_args(dir.path(), 1)).await,
            Err(CliError::Frame { .. })
        ));
    }

    #[test]
    fn labels_are_filled_only_when_missing() {
        let labels = vec!["O".to_string(), "H".to_string()];

        let mut kind = ForceFieldKind::Socket {
            interface: Default::default(),
            driver: Box::new(ForceFieldKind::ExternalProcess(ExternalProcessConfig::new(".", "run.sh"))),
        };
        fill_labels(&mut kind, &labels);
        let ForceFieldKind::Socket { driver, .. } = &kind else {
            unreachable!()
        };
        let ForceFieldKind::ExternalProcess(external) = driver.as_ref() else {
            panic!("expected an external-process driver");
        };
        assert_eq!(external.labels, labels);

        let mut named = ExternalProcessConfig::new(".", "run.sh");
        named.labels = vec!["C".to_string()];
        let mut kind = ForceFieldKind::ExternalProcess(named.clone());
        fill_labels(&mut kind, &labels);
        assert_eq!(kind, ForceFieldKind::ExternalProcess(named));
    }

    #[test]
    fn results_table_reports_largest_force_component() {
        let results = vec![ReplicaResult {
            replica: 0,
            result: ForceResult {
                energy: -1.0,
                forces: vec![0.5, -2.0, 1.0],
                ..ForceResult::zeros(3)
            },
            latency: Some(Duration::from_millis(2)),
        }];

        let lines = format_results(&results);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("2.000000e0"));
        assert!(lines[1].contains("2.000"));
    }
}
