use crate::core::models::cell::Cell;
use crate::core::models::request::{ForceResult, RequestStatus};
use crate::engine::error::DispatchError;
use crate::engine::forcefield::ForceField;
use crate::engine::progress::{Progress, ProgressReporter};
use std::time::Duration;
use tracing::{info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaResult {
    pub replica: usize,
    pub result: ForceResult,
    /// Time from queueing to completion, when the backend recorded it.
    pub latency: Option<Duration>,
}

/// Evaluates every replica configuration and returns the results in replica order.
///
/// Each replica is submitted with its index as request id, waited on and released. With
/// the `parallel` feature the replicas are submitted from concurrent caller threads. The
/// first failure is returned; replicas already in flight still finish and are released.
#[instrument(skip_all, name = "evaluate_workflow", fields(forcefield = %forcefield.name(), replicas = replicas.len()))]
pub fn run(
    forcefield: &ForceField,
    replicas: &[Vec<f64>],
    cell: &Cell,
    reporter: &ProgressReporter,
) -> Result<Vec<ReplicaResult>, DispatchError> {
    reporter.report(Progress::PhaseStart { name: "Evaluation" });
    reporter.report(Progress::TaskStart {
        total_steps: replicas.len() as u64,
    });
    info!("Evaluating {} replica(s).", replicas.len());

    let evaluate_one = |(replica, positions): (usize, &Vec<f64>)| {
        let outcome = evaluate_replica(forcefield, replica, positions, cell);
        let status = match &outcome {
            Ok(_) => RequestStatus::Done,
            Err(_) => RequestStatus::Exit,
        };
        reporter.report(Progress::RequestFinished {
            id: replica as i64,
            status,
        });
        outcome
    };

    #[cfg(feature = "parallel")]
    let results: Result<Vec<_>, _> = replicas.par_iter().enumerate().map(evaluate_one).collect();

    #[cfg(not(feature = "parallel"))]
    let results: Result<Vec<_>, _> = replicas.iter().enumerate().map(evaluate_one).collect();

    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);

    let results = results?;
    info!("Replica evaluation complete.");
    Ok(results)
}

fn evaluate_replica(
    forcefield: &ForceField,
    replica: usize,
    positions: &[f64],
    cell: &Cell,
) -> Result<ReplicaResult, DispatchError> {
    let handle = forcefield.submit(positions.to_vec(), cell, replica as i64)?;
    let outcome = forcefield.wait(&handle);
    forcefield.release(&handle);

    Ok(ReplicaResult {
        replica,
        result: outcome?,
        latency: handle.timestamps().latency(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{FanOutConfig, ForceFieldConfigBuilder, ForceFieldKind};
    use crate::engine::shutdown::ShutdownToken;
    use parking_lot::Mutex;

    fn forcefield(threaded: bool, fan_out: Option<FanOutConfig>) -> ForceField {
        let mut builder = ForceFieldConfigBuilder::new()
            .name("lj")
            .kind(ForceFieldKind::LennardJones {
                epsilon: 1.0,
                sigma: 1.0,
            })
            .threaded(threaded)
            .latency(0.001);
        if let Some(fan_out) = fan_out {
            builder = builder.fan_out(fan_out);
        }
        ForceField::from_config(&builder.build().unwrap(), ShutdownToken::new()).unwrap()
    }

    fn dimer(r: f64) -> Vec<f64> {
        vec![0.0, 0.0, 0.0, r, 0.0, 0.0]
    }

    fn lj_energy(r: f64) -> f64 {
        let sr6 = r.powi(-6);
        4.0 * (sr6 * sr6 - sr6)
    }

    #[test]
    fn results_come_back_in_replica_order() {
        let forcefield = forcefield(false, None);
        let distances = [1.0, 1.1, 1.2, 1.3, 1.4, 1.5, 2.0, 3.0];
        let replicas: Vec<_> = distances.iter().map(|&r| dimer(r)).collect();

        let results = run(&forcefield, &replicas, &Cell::default(), &ProgressReporter::new()).unwrap();

        assert_eq!(results.len(), distances.len());
        for (result, r) in results.iter().zip(distances) {
            assert!((result.result.energy - lj_energy(r)).abs() < 1e-12);
        }
        let order: Vec<_> = results.iter().map(|r| r.replica).collect();
        assert_eq!(order, (0..distances.len()).collect::<Vec<_>>());
        assert_eq!(forcefield.dispatcher().pending(), 0);
    }

    #[test]
    fn threaded_force_field_serves_concurrent_callers() {
        let forcefield = forcefield(true, None);
        forcefield.start().unwrap();
        let replicas: Vec<_> = (0..16).map(|i| dimer(1.0 + 0.05 * i as f64)).collect();

        let results = run(&forcefield, &replicas, &Cell::default(), &ProgressReporter::new()).unwrap();

        assert_eq!(results.len(), 16);
        assert!(results.iter().all(|r| r.latency.is_some()));
        assert_eq!(forcefield.dispatcher().pending(), 0);
        forcefield.stop();
    }

    #[test]
    fn fan_out_replicas_use_distinct_sub_request_ids() {
        let forcefield = forcefield(
            false,
            Some(FanOutConfig {
                independent_bath_count: 2,
                charges: vec![],
                correction: None,
            }),
        );
        let mut replica = dimer(1.5);
        replica.extend(dimer(1.5).iter().map(|x| x + 40.0));
        let replicas = vec![replica.clone(), replica];

        let results = run(&forcefield, &replicas, &Cell::default(), &ProgressReporter::new()).unwrap();
        for result in results {
            assert!((result.result.energy - 2.0 * lj_energy(1.5)).abs() < 1e-12);
        }
    }

    #[test]
    fn progress_reports_each_replica_once() {
        let forcefield = forcefield(false, None);
        let replicas: Vec<_> = (0..4).map(|_| dimer(1.2)).collect();
        let events = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| events.lock().push(event)));

        run(&forcefield, &replicas, &Cell::default(), &reporter).unwrap();
        drop(reporter);

        let mut finished: Vec<_> = events
            .into_inner()
            .into_iter()
            .filter_map(|e| match e {
                Progress::RequestFinished { id, status } => Some((id, status)),
                _ => None,
            })
            .collect();
        finished.sort_by_key(|(id, _)| *id);
        assert_eq!(
            finished,
            (0..4).map(|id| (id, RequestStatus::Done)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn failed_replica_is_reported_as_error() {
        let forcefield = forcefield(false, None);
        let replicas = vec![dimer(1.2), vec![0.0; 4]];
        let result = run(&forcefield, &replicas, &Cell::default(), &ProgressReporter::new());
        // Four coordinates cannot describe whole atoms.
        assert!(result.is_err());
    }
}
