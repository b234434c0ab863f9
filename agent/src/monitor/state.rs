use std::fmt;

/// Where the loop is within a tick. Every tick starts and ends in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Capturing,
    Gating,
    Analyzing,
    Deciding,
    Notifying,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Capturing => "capturing",
            LoopState::Gating => "gating",
            LoopState::Analyzing => "analyzing",
            LoopState::Deciding => "deciding",
            LoopState::Notifying => "notifying",
        };
        f.write_str(name)
    }
}

/// How a single tick ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    OutsideActiveHours,
    CaptureFailed,
    Unchanged,
    EncodeFailed,
    AnalysisFailed,
    /// Analysis succeeded but contained no trigger term.
    NoAlert,
    /// Alert delivered; carries the caption that was sent.
    Alerted(String),
    DeliveryFailed,
}

/// Running counters, logged periodically and at shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub skipped_inactive: u64,
    pub capture_failures: u64,
    pub unchanged: u64,
    pub analyzed: u64,
    pub analysis_failures: u64,
    pub alerts_sent: u64,
    pub delivery_failures: u64,
}

impl LoopStats {
    pub fn record(&mut self, outcome: &TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::OutsideActiveHours => self.skipped_inactive += 1,
            TickOutcome::CaptureFailed => self.capture_failures += 1,
            TickOutcome::Unchanged => self.unchanged += 1,
            TickOutcome::EncodeFailed => {}
            TickOutcome::AnalysisFailed => {
                self.analyzed += 1;
                self.analysis_failures += 1;
            }
            TickOutcome::NoAlert => self.analyzed += 1,
            TickOutcome::Alerted(_) => {
                self.analyzed += 1;
                self.alerts_sent += 1;
            }
            TickOutcome::DeliveryFailed => {
                self.analyzed += 1;
                self.delivery_failures += 1;
            }
        }
    }
}
