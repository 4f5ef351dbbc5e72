use std::fmt;

/// Stages reported while searching for setworks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SearchProgressStage {
    Trials,
    Correction,
}

impl SearchProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Trials => "setwork trials",
            Self::Correction => "multiple-testing correction",
        }
    }
}

impl fmt::Display for SearchProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress during one search.
pub trait SearchProgressObserver {
    fn on_stage_start(&mut self, stage: SearchProgressStage, total: usize) {
        let _ = (stage, total);
    }
    /// `completed` trials have finished and `retained` records are currently held.
    fn on_trial_finish(&mut self, completed: usize, retained: usize) {
        let _ = (completed, retained);
    }
    fn on_stage_finish(&mut self, stage: SearchProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopSearchProgress;

impl SearchProgressObserver for NoopSearchProgress {}
