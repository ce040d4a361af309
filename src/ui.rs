use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

/// Stderr progress for the command-line tools.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    quiet_stdout: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, quiet_stdout: bool) -> Self {
        Self {
            mode,
            is_tty,
            quiet_stdout,
        }
    }

    fn pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.quiet_stdout,
                UiMode::Plain => false,
            }
    }

    fn spinner(&self, message: String) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message);
        spinner
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            StageGuard::new(name.to_string(), Some(self.spinner(format!("{name}…"))))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Counter ticked once per verified compilation unit.
    pub fn unit_counter(&self) -> UnitCounter {
        let spinner = self
            .pretty()
            .then(|| self.spinner("verifying compilation units…".to_string()));
        UnitCounter {
            spinner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

/// Shared between the pipeline's transition hook and the caller.
#[derive(Clone)]
pub struct UnitCounter {
    spinner: Option<ProgressBar>,
    count: Arc<AtomicU64>,
}

impl UnitCounter {
    pub fn tick(&self) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(spinner) = &self.spinner {
            spinner.set_message(format!("verified {} compilation units", count));
        }
    }

    pub fn finish(&self) -> u64 {
        if let Some(spinner) = &self.spinner {
            spinner.finish_and_clear();
        }
        self.count.load(Ordering::Relaxed)
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
