//! Live console view of a fleet call
//!
//! One spinner line per host showing Running/Completed and the latest output
//! line. Ctrl+C closes the view only; the fleet call keeps waiting for its
//! hosts. A second Ctrl+C exits the process.

use super::NodeState;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

static HANDLER: Once = Once::new();
static VIEW_ACTIVE: AtomicBool = AtomicBool::new(false);
static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);

fn install_interrupt_handler() {
    HANDLER.call_once(|| {
        let result = ctrlc::set_handler(|| {
            if VIEW_ACTIVE.load(Ordering::SeqCst) && !QUIT_REQUESTED.swap(true, Ordering::SeqCst) {
                return;
            }
            std::process::exit(130);
        });
        if let Err(e) = result {
            debug!("interrupt handler not installed: {}", e);
        }
    });
}

fn running_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn completed_style() -> ProgressStyle {
    ProgressStyle::with_template("  {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub struct FleetView {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
    closed: bool,
}

impl FleetView {
    pub fn new(states: &[NodeState]) -> Self {
        install_interrupt_handler();
        QUIT_REQUESTED.store(false, Ordering::SeqCst);
        VIEW_ACTIVE.store(true, Ordering::SeqCst);

        let multi = MultiProgress::new();
        multi.println("Remote Command Execution:").ok();
        let bars = states
            .iter()
            .map(|state| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(running_style());
                bar.enable_steady_tick(Duration::from_millis(120));
                bar.set_message(render_line(state));
                bar
            })
            .collect();

        Self {
            multi,
            bars,
            closed: false,
        }
    }

    pub fn update(&mut self, index: usize, state: &NodeState) {
        self.poll_quit();
        if self.closed {
            return;
        }
        let Some(bar) = self.bars.get(index) else {
            return;
        };
        if state.is_complete {
            bar.set_style(completed_style());
            bar.finish_with_message(render_line(state));
        } else {
            bar.set_message(render_line(state));
        }
    }

    /// Close the view if the operator asked for it
    pub fn poll_quit(&mut self) {
        if !self.closed && QUIT_REQUESTED.load(Ordering::SeqCst) {
            self.close();
            println!("Console view closed; still waiting for remote commands to finish");
        }
    }

    fn close(&mut self) {
        for bar in &self.bars {
            bar.finish_and_clear();
        }
        self.multi.clear().ok();
        self.multi.set_draw_target(ProgressDrawTarget::hidden());
        self.closed = true;
    }
}

impl Drop for FleetView {
    fn drop(&mut self) {
        for bar in &self.bars {
            if !bar.is_finished() {
                bar.finish();
            }
        }
        VIEW_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// `[Running] host: latest line`
pub fn render_line(state: &NodeState) -> String {
    let status = if state.is_complete {
        "Completed"
    } else {
        "Running"
    };
    format!("[{}] {}: {}", status, state.host, state.output)
}
