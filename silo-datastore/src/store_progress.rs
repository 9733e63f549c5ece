#[derive(Debug, Default)]
/// Tracker for progress of operations iterating over repository contents.
pub struct StoreProgress {
    pub done: u64,
    pub total: u64,
}

impl StoreProgress {
    pub fn new(total: u64) -> Self {
        StoreProgress { total, done: 0 }
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f64) / (self.total as f64)
        }
    }

    /// True every time another tenth of the total completes, so loops
    /// can log at most ten progress lines.
    pub fn at_step(&self) -> bool {
        if self.total < 10 {
            return false;
        }
        self.done % (self.total / 10).max(1) == 0
    }
}

impl std::fmt::Display for StoreProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}% ({}/{})",
            self.percentage() * 100.0,
            self.done,
            self.total
        )
    }
}
