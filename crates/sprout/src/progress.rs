//! Terminal progress for a run
//!
//! One spinner per running step, replaced by a status line when the step
//! ends. Prompts (disk selection) suspend the spinner while they are shown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use console::style;
use dialoguer::MultiSelect;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sprout_provision::runlog::{EventKind, StepEvent};
use sprout_provision::{DiskCandidate, DiskSelector, ProgressSink, ProvisionError};

/// Spinner-per-step progress display
pub struct SpinnerProgress {
    multi: MultiProgress,
    spinner: Option<ProgressBar>,
    names: HashMap<String, String>,
    total: usize,
    position: usize,
    started: Option<Instant>,
}

impl SpinnerProgress {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            spinner: None,
            names: HashMap::new(),
            total: 0,
            position: 0,
            started: None,
        }
    }

    fn name<'a>(&'a self, event: &'a StepEvent) -> &'a str {
        self.names.get(&event.step).map_or(event.step.as_str(), String::as_str)
    }

    fn clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
            self.multi.remove(&spinner);
        }
    }

    fn counter(&self) -> String {
        format!("[{}/{}]", self.position, self.total)
    }

    fn start(&mut self, event: &StepEvent) {
        self.clear();
        self.position += 1;
        let spinner = self.multi.add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::with_template(&format!(
                "{{spinner:.cyan}} {} {{msg}}",
                self.counter()
            ))
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(self.name(event).to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(spinner);
        self.started = Some(Instant::now());
    }
}

impl ProgressSink for SpinnerProgress {
    fn event(&mut self, event: &StepEvent) {
        match event.kind {
            EventKind::Plan => {
                self.total += 1;
                self.names
                    .insert(event.step.clone(), event.detail.clone());
            }
            EventKind::Start => self.start(event),
            EventKind::Done => {
                self.clear();
                let elapsed = self
                    .started
                    .take()
                    .map(|s| format!("{:.1}s", s.elapsed().as_secs_f64()))
                    .unwrap_or_default();
                println!(
                    "{} {} {} {}",
                    self.counter(),
                    style("v").green(),
                    self.name(event),
                    style(elapsed).dim()
                );
            }
            EventKind::Skip => {
                self.clear();
                self.position += 1;
                println!(
                    "{} {} {} {}",
                    self.counter(),
                    style("o").yellow(),
                    self.name(event),
                    style(format!("(skipped: {})", event.detail)).dim()
                );
            }
            EventKind::Fail => {
                self.clear();
                println!(
                    "{} {} {}",
                    self.counter(),
                    style("x").red(),
                    self.name(event)
                );
                println!("      {}", style(&event.detail).red());
            }
            EventKind::NotRun => {
                self.position += 1;
                println!(
                    "{} {} {} {}",
                    self.counter(),
                    style("-").dim(),
                    style(self.name(event)).dim(),
                    style("(not run)").dim()
                );
            }
            EventKind::Complete => self.clear(),
        }
    }
}

/// Ask the operator which discovered disks to use
pub struct InteractiveSelector {
    multi: MultiProgress,
}

impl InteractiveSelector {
    pub fn new(multi: MultiProgress) -> Self {
        Self { multi }
    }
}

impl DiskSelector for InteractiveSelector {
    fn select(&self, candidates: &[DiskCandidate]) -> sprout_provision::Result<Vec<String>> {
        let items: Vec<String> = candidates.iter().map(ToString::to_string).collect();
        let defaults = vec![true; items.len()];
        let chosen = self
            .multi
            .suspend(|| {
                println!();
                println!(
                    "{} These disks will be {} if they carry no ext4 filesystem",
                    style("!").yellow(),
                    style("wiped and formatted").red().bold()
                );
                MultiSelect::new()
                    .with_prompt("Select disks for cluster storage")
                    .items(&items)
                    .defaults(&defaults)
                    .interact()
            })
            .map_err(|e| ProvisionError::step(format!("disk selection failed: {e}")))?;

        Ok(chosen
            .into_iter()
            .map(|i| candidates[i].device.clone())
            .collect())
    }
}
