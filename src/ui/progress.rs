use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::machine::WorkflowPhase;
use crate::orchestrator::WorkflowEvent;
use crate::ui::icons::{ARTIFACT, CHECK, CROSS, PEN, PROBE, QUESTION, REVIEW, SPARKLE};

/// Work phases shown on the progress bar, in order. Terminal phases and
/// `idle` are not counted.
const TOTAL_PHASES: u64 = 6;

/// Terminal UI for a specwright run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar — tracks how many workflow phases have completed
/// - Activity bar — spinner with the current call or reviewer status
///
/// The UI is a passive consumer of [`WorkflowEvent`]s; it never talks to the
/// orchestrator. All output is coordinated through `indicatif`'s
/// `MultiProgress`.
pub struct WorkflowUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    activity_bar: ProgressBar,
    verbose: bool,
}

impl WorkflowUI {
    /// Create the UI and add both progress bars to the multiplex renderer.
    ///
    /// When `verbose` is `true`, artifact commits and streamed writer
    /// fragments are printed; otherwise only phase and reviewer lines show.
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(TOTAL_PHASES));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        let activity_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let activity_bar = multi.add(ProgressBar::new_spinner());
        activity_bar.set_style(activity_style);
        activity_bar.set_prefix("  Work");

        Self {
            multi,
            phase_bar,
            activity_bar,
            verbose,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the
    /// rich UI fails. Critical lines (failures, completion) are never lost
    /// silently.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Render one workflow event. Safe to call from a channel-draining task.
    pub fn handle_event(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::PhaseStarted { phase } => self.phase_started(*phase),
            WorkflowEvent::PhaseCompleted { phase } => self.phase_completed(*phase),
            WorkflowEvent::ModelProbed { model, reachable } => {
                if *reachable {
                    self.print_line(format!(
                        "  {} {} {}",
                        PROBE,
                        style(model).cyan(),
                        style("reachable").green()
                    ));
                } else {
                    self.print_line(format!(
                        "  {} {} {}",
                        PROBE,
                        style(model).cyan(),
                        style("unreachable").red().bold()
                    ));
                }
            }
            WorkflowEvent::WriterFragment { text } => {
                let snippet: String = text.chars().take(60).collect();
                self.activity_bar
                    .set_message(format!("{} {}", PEN, style(snippet).dim()));
            }
            WorkflowEvent::ClarificationTurn { ready, message } => {
                self.activity_bar.set_message(String::new());
                let icon = if *ready { CHECK } else { QUESTION };
                self.print_line(format!("\n{} {}\n", icon, message));
            }
            WorkflowEvent::ArtifactCommitted { reference, version } => {
                if self.verbose {
                    let suffix = match version {
                        Some(v) => format!(" (v{v})"),
                        None => String::new(),
                    };
                    self.print_line(format!(
                        "    {} {}{}",
                        ARTIFACT,
                        style(reference).dim(),
                        style(suffix).dim()
                    ));
                }
            }
            WorkflowEvent::RoundStarted { round, pending } => {
                self.print_line(format!(
                    "  {} Round {}: {} reviewer(s) to run",
                    REVIEW,
                    style(round).yellow(),
                    style(pending.len()).cyan()
                ));
            }
            WorkflowEvent::ReviewerStarted { round: _, model } => {
                self.activity_bar
                    .set_message(format!("{} {}", REVIEW, style(model).cyan()));
            }
            WorkflowEvent::ReviewerFinished {
                round: _,
                model,
                success,
                duration_ms,
            } => {
                let icon = if *success { CHECK } else { CROSS };
                self.print_line(format!(
                    "    {} {} ({} ms)",
                    icon,
                    style(model).cyan(),
                    duration_ms
                ));
            }
            WorkflowEvent::RoundCompleted { round } => {
                self.print_line(format!(
                    "  {} Round {} complete",
                    CHECK,
                    style(round).green()
                ));
            }
            WorkflowEvent::WorkflowCompleted { final_ref, version } => {
                self.activity_bar.finish_and_clear();
                self.phase_bar.finish_and_clear();
                self.print_line(format!(
                    "\n{} Done: {} (version {})\n",
                    SPARKLE,
                    style(final_ref).green().bold(),
                    version
                ));
            }
            WorkflowEvent::WorkflowFailed {
                phase,
                message,
                model,
            } => {
                self.activity_bar.finish_and_clear();
                let who = match model {
                    Some(m) => format!(" [{m}]"),
                    None => String::new(),
                };
                self.print_line(format!(
                    "\n{} Failed in {}{}: {}\n",
                    CROSS,
                    style(phase).red().bold(),
                    style(who).dim(),
                    message
                ));
            }
        }
    }

    fn phase_started(&self, phase: WorkflowPhase) {
        self.phase_bar
            .set_message(format!("{}", style(phase).yellow()));
        self.activity_bar
            .set_message(format!("{}", style("starting...").dim()));
        self.activity_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    fn phase_completed(&self, phase: WorkflowPhase) {
        self.phase_bar.inc(1);
        self.print_line(format!(
            "{} Phase {} complete",
            CHECK,
            style(phase).green().bold()
        ));
    }
}
