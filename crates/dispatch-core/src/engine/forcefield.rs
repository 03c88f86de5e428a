use super::backend::Backend;
use super::config::{ActiveSelection, ForceFieldConfig};
use super::dispatcher::{DispatchSettings, Dispatcher};
use super::error::DispatchError;
use super::fanout::FanOutDispatcher;
use super::progress::ProgressReporter;
use super::shutdown::ShutdownToken;
use crate::core::models::cell::Cell;
use crate::core::models::request::{ForceResult, RequestHandle};
use std::time::Duration;

/// A configured force field: a plain dispatcher, or a dispatcher behind the bath fan-out.
///
/// For [`ForceField::FanOut`], `submit` blocks until the merged record is complete.
pub enum ForceField {
    Direct(Dispatcher),
    FanOut(FanOutDispatcher),
}

impl ForceField {
    pub fn from_config(config: &ForceFieldConfig, shutdown: ShutdownToken) -> Result<Self, DispatchError> {
        let Some(fan_out) = &config.fan_out else {
            return Ok(ForceField::Direct(Dispatcher::from_config(config, shutdown)?));
        };

        // Folding and active indices apply to the full configuration, not to each bath.
        let backend = Backend::from_kind(&config.name, &config.kind)?;
        let settings = DispatchSettings {
            pbc: false,
            active: ActiveSelection::All,
            ..DispatchSettings::from(config)
        };
        let inner = Dispatcher::new(config.name.clone(), backend, settings, shutdown);
        Ok(ForceField::FanOut(FanOutDispatcher::new(
            inner,
            fan_out,
            config.active.clone(),
            config.pbc,
        )?))
    }

    pub fn submit(&self, positions: Vec<f64>, cell: &Cell, reqid: i64) -> Result<RequestHandle, DispatchError> {
        self.submit_with_progress(positions, cell, reqid, &ProgressReporter::new())
    }

    /// Like [`ForceField::submit`]; a fan-out force field reports per-bath progress.
    pub fn submit_with_progress(
        &self,
        positions: Vec<f64>,
        cell: &Cell,
        reqid: i64,
        reporter: &ProgressReporter,
    ) -> Result<RequestHandle, DispatchError> {
        match self {
            ForceField::Direct(dispatcher) => dispatcher.submit(positions, cell, reqid),
            ForceField::FanOut(fan_out) => fan_out.submit_with_progress(positions, cell, reqid, reporter),
        }
    }

    pub fn wait(&self, handle: &RequestHandle) -> Result<ForceResult, DispatchError> {
        match self {
            ForceField::Direct(dispatcher) => dispatcher.wait(handle),
            ForceField::FanOut(fan_out) => fan_out.wait(handle),
        }
    }

    pub fn release(&self, handle: &RequestHandle) -> bool {
        self.dispatcher().release(handle)
    }

    pub fn poll_once(&self) -> usize {
        self.dispatcher().poll_once()
    }

    pub fn start(&self) -> Result<(), DispatchError> {
        self.dispatcher().start()
    }

    pub fn stop(&self) {
        self.dispatcher().stop();
    }

    pub fn update(&self) {
        self.dispatcher().update();
    }

    pub fn name(&self) -> &str {
        self.dispatcher().name()
    }

    pub fn latency(&self) -> Duration {
        self.dispatcher().latency()
    }

    pub fn is_threaded(&self) -> bool {
        self.dispatcher().is_threaded()
    }

    pub fn shutdown(&self) -> &ShutdownToken {
        self.dispatcher().shutdown()
    }

    /// The dispatcher that owns the request queue.
    pub fn dispatcher(&self) -> &Dispatcher {
        match self {
            ForceField::Direct(dispatcher) => dispatcher,
            ForceField::FanOut(fan_out) => fan_out.inner(),
        }
    }
}
