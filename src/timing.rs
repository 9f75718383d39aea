//! Wall-clock timing of pipeline steps.
//!
//! Each [`StepTimes::record`] waits on a barrier first so the time measured is the slowest rank's.

use std::collections::HashMap;
use std::time::Instant;

use log::info;

use crate::error::Result;
use crate::group::{ProcessGroup, ROOT};
use crate::logging::RankLogger;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct StepTotal {
    seconds: f64,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct StepTimes {
    last: Instant,
    steps: HashMap<String, StepTotal>,
}

impl Default for StepTimes {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTimes {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            steps: HashMap::new(),
        }
    }

    /// Close the current step, charging the time since the previous call to `step`.
    /// Returns the elapsed seconds.
    pub fn record<G: ProcessGroup + ?Sized>(&mut self, step: &str, group: &G) -> Result<f64> {
        group.barrier()?;
        let dt = self.add(step, self.last.elapsed().as_secs_f64());
        self.last = Instant::now();

        let logger = RankLogger::for_group(group);
        let count = self.steps[step].count;
        logger.info(
            false,
            format!("{:.6} sec for iteration {} of {}", dt, count, step),
        );
        Ok(dt)
    }

    fn add(&mut self, step: &str, seconds: f64) -> f64 {
        let total = self.steps.entry(step.to_string()).or_default();
        total.seconds += seconds;
        total.count += 1;
        seconds
    }

    pub fn total_seconds(&self) -> f64 {
        self.steps.values().map(|t| t.seconds).sum()
    }

    /// Mean time per call of every step, slowest total first, then the grand total.
    pub fn summary(&self) -> Vec<String> {
        let mut steps: Vec<_> = self.steps.iter().collect();
        steps.sort_by(|a, b| b.1.seconds.total_cmp(&a.1.seconds));

        let mut lines = vec!["Time summary:".to_string()];
        for (name, total) in steps {
            lines.push(format!(
                "  {:.5e} per {} iterations of {}",
                total.seconds / total.count as f64,
                total.count,
                name
            ));
        }
        lines.push(format!("  {:.5e} all steps", self.total_seconds()));
        lines
    }

    /// Log [`StepTimes::summary`] from the root rank.
    pub fn log_summary<G: ProcessGroup + ?Sized>(&self, group: &G) -> Result<()> {
        group.barrier()?;
        if group.rank() == ROOT {
            for line in self.summary() {
                info!("{}", line);
            }
        }
        Ok(())
    }
}
