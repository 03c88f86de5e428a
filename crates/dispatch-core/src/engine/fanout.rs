use super::config::{ActiveSelection, ConfigError, FanOutConfig};
use super::dispatcher::{ActiveAtoms, Dispatcher, wait_for};
use super::error::DispatchError;
use super::progress::{Progress, ProgressReporter};
use crate::core::dipole::{BathCorrection, DipoleSelfEnergy, bath_dipoles};
use crate::core::models::cell::Cell;
use crate::core::models::request::{
    ForceRequest, ForceResult, RequestHandle, RequestStatus, Timestamps,
};
use crate::core::potentials::EvaluationError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Splits each configuration into independent baths and evaluates them as sub-requests.
///
/// A configuration of `n` coordinates becomes `K` contiguous blocks of `n / K`
/// coordinates, queued together on the inner dispatcher with ids `reqid * K + idx`.
/// Submission blocks until every bath finished, merges the bath results into one
/// record and optionally applies a [`BathCorrection`] to the merged result.
pub struct FanOutDispatcher {
    inner: Dispatcher,
    baths: usize,
    charges: Vec<f64>,
    correction: Option<Box<dyn BathCorrection>>,
    active: Mutex<ActiveAtoms>,
    pbc: bool,
}

impl FanOutDispatcher {
    pub fn new(
        inner: Dispatcher,
        config: &FanOutConfig,
        active: ActiveSelection,
        pbc: bool,
    ) -> Result<Self, ConfigError> {
        if config.independent_bath_count == 0 {
            return Err(ConfigError::InvalidValue {
                name: "independent_bath_count",
                reason: "at least one bath is required".to_string(),
            });
        }
        let correction = config
            .correction
            .map(|coupling| Box::new(DipoleSelfEnergy::new(coupling)) as Box<dyn BathCorrection>);
        Ok(Self {
            inner,
            baths: config.independent_bath_count,
            charges: config.charges.clone(),
            correction,
            active: Mutex::new(ActiveAtoms::Pending(active)),
            pbc,
        })
    }

    /// Replaces the post-processing correction applied to every merged result.
    pub fn with_correction(mut self, correction: Box<dyn BathCorrection>) -> Self {
        self.correction = Some(correction);
        self
    }

    pub fn baths(&self) -> usize {
        self.baths
    }

    pub fn inner(&self) -> &Dispatcher {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn submit(&self, positions: Vec<f64>, cell: &Cell, reqid: i64) -> Result<RequestHandle, DispatchError> {
        self.submit_with_progress(positions, cell, reqid, &ProgressReporter::new())
    }

    /// Evaluates every bath of `positions` and returns the merged, already finished record.
    ///
    /// If any bath is forced to `Exit`, or shutdown is triggered while waiting, shutdown is
    /// triggered (if it was not already) and no partial result is returned.
    #[instrument(skip_all, name = "fan_out_submit", fields(forcefield = %self.inner.name(), reqid))]
    pub fn submit_with_progress(
        &self,
        positions: Vec<f64>,
        cell: &Cell,
        reqid: i64,
        reporter: &ProgressReporter,
    ) -> Result<RequestHandle, DispatchError> {
        let n_coords = positions.len();
        let k = self.baths;
        if n_coords == 0 || n_coords % (3 * k) != 0 {
            return Err(DispatchError::BathSizing {
                n_coords,
                baths: k,
            });
        }
        let block = n_coords / k;
        if self.correction.is_some() && self.charges.len() != block / 3 {
            return Err(DispatchError::ChargeCount {
                charges: self.charges.len(),
                atoms_per_bath: block / 3,
            });
        }
        let active = self
            .active
            .lock()
            .resolve(n_coords, || self.inner.validate(block))?;
        let child_active: Arc<[usize]> = active.iter().take(block).copied().collect();

        let blocks: Vec<Vec<f64>> = positions
            .chunks_exact(block)
            .map(|chunk| {
                let mut bath = chunk.to_vec();
                if self.pbc {
                    cell.fold(&mut bath);
                }
                bath
            })
            .collect();
        let stride = k as i64;
        let children = self.inner.submit_batch(
            blocks,
            child_active,
            cell,
            (0..stride).map(|idx| reqid * stride + idx),
        );
        reporter.report(Progress::TaskStart {
            total_steps: k as u64,
        });
        debug!(baths = k, block, "Sub-requests queued.");

        let shutdown = self.inner.shutdown();
        let mut results = Vec::with_capacity(k);
        let mut failed = None;
        for child in &children {
            match wait_for(child, self.inner.latency(), shutdown) {
                Ok(result) => {
                    reporter.report(Progress::RequestFinished {
                        id: child.id(),
                        status: RequestStatus::Done,
                    });
                    results.push(result);
                }
                Err(_) => {
                    failed = Some(child.id());
                    break;
                }
            }
        }
        for child in &children {
            self.inner.release(child);
        }
        reporter.report(Progress::TaskFinish);

        if let Some(child) = failed {
            let reason = format!(
                "sub-request {child} of request {reqid} on '{}' did not complete",
                self.inner.name()
            );
            error!(%reason, "Aborting fan-out request.");
            shutdown.trigger(reason);
            return Err(DispatchError::Aborted {
                id: reqid,
                child: Some(child),
            });
        }

        let mut merged = ForceResult::zeros(n_coords);
        for (idx, result) in results.iter().enumerate() {
            if result.forces.len() != block {
                return Err(EvaluationError::SizeMismatch {
                    what: "sub-request forces",
                    expected: block,
                    found: result.forces.len(),
                }
                .into());
            }
            merged.energy += result.energy;
            merged.virial += result.virial;
            merged.extra.push_str(&result.extra);
            merged.forces[idx * block..(idx + 1) * block].copy_from_slice(&result.forces);
        }

        let merged_positions: Vec<f64> = children
            .iter()
            .flat_map(|child| child.position().iter().copied())
            .collect();
        if let Some(correction) = &self.correction {
            let dipoles = bath_dipoles(&merged_positions, k, &self.charges);
            let delta = correction.correct(&dipoles, &self.charges, n_coords);
            merged.energy += delta.energy;
            for (f, df) in merged.forces.iter_mut().zip(&delta.forces) {
                *f += df;
            }
            debug!(correction = correction.name(), energy = delta.energy, "Applied bath correction.");
        }

        let (Some(first), Some(last)) = (children.first(), children.last()) else {
            return Err(DispatchError::BathSizing {
                n_coords,
                baths: k,
            });
        };
        let first_stamps = first.timestamps();
        let timestamps = Timestamps {
            queued_at: first_stamps.queued_at,
            dispatched_at: first_stamps.dispatched_at,
            finished_at: last.timestamps().finished_at,
        };
        let energy = merged.energy;
        let record = ForceRequest::finished(
            reqid,
            merged_positions,
            active,
            *cell,
            last.parameters().to_string(),
            last.status(),
            merged,
            timestamps,
        );
        info!(energy, "Fan-out request merged.");
        Ok(RequestHandle::detached(record))
    }

    pub fn wait(&self, handle: &RequestHandle) -> Result<ForceResult, DispatchError> {
        wait_for(handle, self.inner.latency(), self.inner.shutdown())
    }

    /// Merged records are never queued, so releasing one is a no-op.
    pub fn release(&self, handle: &RequestHandle) -> bool {
        self.inner.release(handle)
    }

    pub fn poll_once(&self) -> usize {
        self.inner.poll_once()
    }

    pub fn start(&self) -> Result<(), DispatchError> {
        self.inner.start()
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn update(&self) {
        self.inner.update();
    }
}
