//! Console output for sweep runs.
//!
//! One line per command event and a closing tally of skipped and failed
//! task directories.

use std::collections::BTreeSet;
use std::path::PathBuf;
use sweep_exec::{RunSummary, SchedulerEvent};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

fn paint(text: &str, color: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

/// Format one scheduler event as a console line.
pub fn format_event(event: &SchedulerEvent, color: bool) -> String {
    let target = event.target();
    let place = format!(
        "[{}] {} {}",
        target.resource,
        target.output.display(),
        target.command
    );
    match event {
        SchedulerEvent::CommandPlanned { line, .. } => format!("PLAN  {place}\n      {line}"),
        SchedulerEvent::CommandStarted { .. } => format!("START {place}"),
        SchedulerEvent::CommandSkipped { .. } => {
            paint(&format!("SKIP  {place} (finished)"), GREEN, color)
        }
        SchedulerEvent::CommandFinished { duration_ms, .. } => {
            format!("DONE  {place} ({})", format_duration(*duration_ms))
        }
        SchedulerEvent::CommandFailed { exit_code, .. } => {
            let code = exit_code.map_or_else(|| "signal".to_string(), |c| format!("exit {c}"));
            paint(&format!("FAIL  {place} ({code})"), RED, color)
        }
    }
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{}s", secs, (ms % 1000) / 100)
    }
}

/// Warning for parameters no template referenced.
pub fn format_orphans(orphans: &BTreeSet<String>, color: bool) -> Option<String> {
    if orphans.is_empty() {
        return None;
    }
    let names = orphans.iter().cloned().collect::<Vec<_>>().join(", ");
    Some(paint(
        &format!("Warning: parameters not used by any command: {names}"),
        YELLOW,
        color,
    ))
}

fn format_dirs(out: &mut String, dirs: &[PathBuf]) {
    for dir in dirs {
        out.push_str(&format!("  {}\n", dir.display()));
    }
}

/// Closing tally.
pub fn format_summary(summary: &RunSummary, color: bool) -> String {
    let mut out = String::new();
    if summary.cancelled() {
        out.push_str(&paint(
            &format!(
                "Interrupted: {}/{} tasks not started\n",
                summary.total - summary.dispatched,
                summary.total
            ),
            YELLOW,
            color,
        ));
        out.push('\n');
    }
    if !summary.skipped.is_empty() {
        out.push_str(&paint(
            &format!("Skipped tasks: {}/{}", summary.skipped.len(), summary.total),
            GREEN,
            color,
        ));
        out.push('\n');
        format_dirs(&mut out, &summary.skipped);
    }
    if summary.failed.is_empty() {
        out.push_str("No task failed.\n");
    } else {
        out.push_str(&paint(
            &format!("Failed tasks: {}/{}", summary.failed.len(), summary.total),
            RED,
            color,
        ));
        out.push('\n');
        format_dirs(&mut out, &summary.failed);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_exec::CommandRef;

    fn target() -> CommandRef {
        CommandRef {
            task: "Lr_0.1".to_string(),
            output: PathBuf::from("out/Lr_0.1"),
            command: "train".to_string(),
            resource: "0".to_string(),
        }
    }

    #[test]
    fn event_lines() {
        let started = SchedulerEvent::CommandStarted {
            target: target(),
            line: "python train.py".to_string(),
        };
        assert_eq!(format_event(&started, false), "START [0] out/Lr_0.1 train");

        let failed = SchedulerEvent::CommandFailed {
            target: target(),
            exit_code: Some(2),
            duration_ms: 10,
        };
        assert_eq!(
            format_event(&failed, true),
            "\x1b[31mFAIL  [0] out/Lr_0.1 train (exit 2)\x1b[0m"
        );

        let skipped = SchedulerEvent::CommandSkipped { target: target() };
        assert!(format_event(&skipped, true).starts_with("\x1b[32mSKIP"));
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(1_500), "1.5s");
        assert_eq!(format_duration(61_000), "1m01s");
        assert_eq!(format_duration(3_720_000), "1h02m");
    }

    #[test]
    fn summary_without_failures() {
        let summary = RunSummary {
            total: 3,
            dispatched: 3,
            skipped: vec![PathBuf::from("out/a")],
            failed: Vec::new(),
        };
        assert_eq!(
            format_summary(&summary, false),
            "Skipped tasks: 1/3\n  out/a\nNo task failed.\n"
        );
    }

    #[test]
    fn summary_with_failures_and_interrupt() {
        let summary = RunSummary {
            total: 4,
            dispatched: 2,
            skipped: Vec::new(),
            failed: vec![PathBuf::from("out/b")],
        };
        let text = format_summary(&summary, false);
        assert!(text.starts_with("Interrupted: 2/4 tasks not started\n"));
        assert!(text.ends_with("Failed tasks: 1/4\n  out/b\n"));
    }

    #[test]
    fn orphans_warning() {
        assert_eq!(format_orphans(&BTreeSet::new(), false), None);
        let orphans = BTreeSet::from(["a".to_string(), "b".to_string()]);
        assert_eq!(
            format_orphans(&orphans, false).unwrap(),
            "Warning: parameters not used by any command: a, b"
        );
    }
}
