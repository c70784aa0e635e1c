use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use crate::engine::{SkipReason, TaskStatus};
use crate::error::exit;

/// Outcome of one task in a run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub status: TaskStatus,
    /// `None` if the task never ran.
    pub duration: Option<Duration>,
}

/// Outcome of a run: every task in the target's dependency closure, in
/// execution order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: String,
    pub entries: Vec<TaskReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn status(&self, task: &str) -> Option<&TaskStatus> {
        self.entries
            .iter()
            .find(|entry| entry.name == task)
            .map(|entry| &entry.status)
    }

    /// Whether the requested task succeeded.
    pub fn succeeded(&self) -> bool {
        self.status(&self.target)
            .is_some_and(TaskStatus::is_succeeded)
    }

    /// The first failed task, in execution order.
    pub fn first_failure(&self) -> Option<&TaskReport> {
        self.entries.iter().find(|entry| entry.status.is_failed())
    }

    /// `0` if the requested task succeeded, otherwise the classification of
    /// the first failure.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            return exit::SUCCESS;
        }

        if let Some(TaskReport {
            status: TaskStatus::Failed(err),
            ..
        }) = self.first_failure()
        {
            return crate::error::classify(&err.cause);
        }

        let cancelled = self
            .entries
            .iter()
            .any(|entry| matches!(entry.status, TaskStatus::Skipped(SkipReason::Cancelled)));

        match cancelled {
            true => exit::CANCELLED,
            false => exit::TASK,
        }
    }

    /// Renders the executed closure as a Mermaid diagram, colour-coded by
    /// outcome and, for succeeded tasks, by duration.
    ///
    /// * **Green** to **Red**: fast to slow
    /// * **Dark red**: failed
    /// * **Grey**: skipped
    pub fn render_mermaid(&self, graph: &crate::engine::TaskGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let durations = self.entries.iter().filter_map(|e| e.duration).map(|d| d.as_secs_f64());
        let min_time = durations.clone().fold(f64::MAX, f64::min);
        let mut max_time = durations.fold(f64::MIN, f64::max);

        // Avoid dividing by zero if every task took the same time.
        if min_time > max_time || (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time.max(0.0) + 1.0;
        }
        let min_time = min_time.min(max_time - 1.0).max(0.0);

        for (i, entry) in self.entries.iter().enumerate() {
            let name = entry.name.replace('"', "\\\"");

            let (label, color) = match (&entry.status, entry.duration) {
                (TaskStatus::Succeeded, Some(duration)) => {
                    let t = ((duration.as_secs_f64() - min_time) / (max_time - min_time)).clamp(0.0, 1.0);
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };
                    (format!("{duration:.2?}"), format!("#{r:02X}{g:02X}00"))
                }
                (TaskStatus::Failed(_), _) => ("failed".to_string(), "#B22222".to_string()),
                (TaskStatus::Skipped(_), _) => ("skipped".to_string(), "#D3D3D3".to_string()),
                (status, _) => (status.to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {i}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {i} fill:{color}");
        }

        for (i, entry) in self.entries.iter().enumerate() {
            let Some(definition) = graph.get(&entry.name) else {
                continue;
            };

            for dependency in definition.dependencies() {
                if let Some(j) = self.entries.iter().position(|e| &e.name == dependency) {
                    let _ = writeln!(f, "    {j} --> {i}");
                }
            }
        }

        f
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let width = self
            .entries
            .iter()
            .map(|entry| entry.name.len())
            .max()
            .unwrap_or(0);

        for entry in &self.entries {
            write!(f, "{:width$}  {}", entry.name, entry.status)?;
            if let Some(duration) = entry.duration {
                write!(f, " ({duration:.2?})")?;
            }
            writeln!(f)?;
        }

        write!(
            f,
            "{}: {} in {:.2?}",
            self.target,
            match self.succeeded() {
                true => "succeeded",
                false => "did not succeed",
            },
            self.elapsed
        )
    }
}
