//! In-place terminal status rendering.
//!
//! The status line lives at the bottom of the output; matched results
//! are printed above it by rewinding the cursor one line, printing the
//! result and re-printing the status.

/// Move the cursor up one line and erase it.
const CLEAR_LINE: &str = "\x1b[1A\x1b[K";

/// Rewrites a single status line in place while letting result lines
/// scroll past above it.
pub(crate) struct TermStatus {
    status: String,
}

impl TermStatus {
    pub(crate) fn new() -> Self {
        TermStatus {
            status: String::new(),
        }
    }

    /// Print a result line above the status line.
    pub(crate) fn print_result(&mut self, line: &str) {
        if !self.status.is_empty() {
            print!("{CLEAR_LINE}");
        }
        println!("{line}");
        if !self.status.is_empty() {
            println!("{}", self.status);
        }
    }

    /// Replace the status line.
    pub(crate) fn update(&mut self, status: String) {
        if !self.status.is_empty() {
            print!("{CLEAR_LINE}");
        }
        self.status = status;
        if !self.status.is_empty() {
            println!("{}", self.status);
        }
    }

    /// Remove the status line entirely.
    pub(crate) fn clear(&mut self) {
        self.update(String::new());
    }
}
