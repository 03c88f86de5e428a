use ffdispatch::core::models::request::RequestStatus;
use ffdispatch::engine::progress::{Progress, ProgressCallback};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

const SPINNER_TICK_MS: u64 = 80;

/// The bar plus the requests of the current task that came back without a result.
struct RequestBar {
    bar: ProgressBar,
    exited: u64,
}

impl RequestBar {
    fn apply(&mut self, progress: Progress) {
        let bar = &self.bar;
        match progress {
            Progress::PhaseStart { name } => {
                bar.reset();
                bar.set_length(0);
                bar.set_style(spinner_style());
                bar.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
                bar.set_message(name.to_string());
            }
            Progress::TaskStart { total_steps } => {
                self.exited = 0;
                bar.disable_steady_tick();
                bar.reset();
                bar.set_length(total_steps);
                bar.set_style(request_style());
            }
            Progress::RequestFinished { id, status } => {
                if status == RequestStatus::Exit {
                    self.exited += 1;
                    bar.println(format!("  ✗ Request {id} exited without a result"));
                }
                bar.inc(1);
            }
            Progress::TaskFinish => {
                let total = bar.length().unwrap_or(0);
                bar.set_position(total);
                if self.exited > 0 {
                    bar.abandon_with_message(format!("{} of {total} request(s) exited", self.exited));
                } else {
                    bar.finish();
                }
            }
            Progress::PhaseFinish => {
                bar.disable_steady_tick();
                bar.finish_with_message("✓ Done");
            }
            Progress::Message(msg) if bar.is_finished() => bar.set_message(msg),
            Progress::Message(msg) => bar.println(format!("  {msg}")),
        }
    }
}

/// Renders dispatch progress events as an indicatif bar on stderr.
#[derive(Clone)]
pub struct CliProgressHandler {
    state: Arc<Mutex<RequestBar>>,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr())
            .with_style(spinner_style())
            .with_message("Initializing...");
        bar.finish_and_clear();

        Self {
            state: Arc::new(Mutex::new(RequestBar { bar, exited: 0 })),
        }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let state = self.state.clone();
        Box::new(move |progress: Progress| match state.lock() {
            Ok(mut bar) => bar.apply(progress),
            Err(_) => warn!("Progress bar mutex was poisoned. Cannot update progress."),
        })
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn request_style() -> ProgressStyle {
    let Ok(style) = ProgressStyle::with_template("{msg:<20} [{bar:40.cyan/blue}] {pos}/{len} requests ({eta})") else {
        return ProgressStyle::default_bar();
    };
    style
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("=>-")
}
