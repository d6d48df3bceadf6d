// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing failure reports.
//!
//! Removals refused for lack of permission and batches that left entries
//! behind are printed as a short report: what went wrong, the entries it
//! applies to, likely causes and commands worth trying next.

/// Trailer pointing at more diagnostics.
pub const HELP_HINT: &str = "Run with --verbose (or DLSYNC_LOG=debug) for details";

/// Builds a failure report.
///
/// ```
/// use dlsync::error::ErrorBuilder;
///
/// let report = ErrorBuilder::new("Clean: 1 of 3 entries failed")
///     .detail("7: permission denied on /downloads/a.pdf")
///     .fix("Retry one entry: dlsync remove 7")
///     .build();
/// assert!(report.contains("  - 7: permission denied"));
/// assert!(report.contains("Try these fixes:"));
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    details: Vec<String>,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            details: Vec::new(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// One affected entry, listed under the title.
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(self) -> String {
        let mut out = format!("[✗] {}\n\n", self.title);

        if !self.details.is_empty() {
            for detail in &self.details {
                out.push_str(&format!("  - {}\n", detail));
            }
            out.push('\n');
        }

        if !self.causes.is_empty() {
            out.push_str("Possible causes:\n");
            for cause in &self.causes {
                out.push_str(&format!("  - {}\n", cause));
            }
            out.push('\n');
        }

        if !self.fixes.is_empty() {
            out.push_str("Try these fixes:\n");
            for (i, fix) in self.fixes.iter().enumerate() {
                out.push_str(&format!("  {}. {}\n", i + 1, fix));
            }
            out.push('\n');
        }

        out.push_str(HELP_HINT);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_sections_in_order() {
        let report = ErrorBuilder::new("Remove all: 2 of 5 entries failed")
            .detail("3: permission denied")
            .detail("4: file missing")
            .cause("Files owned by another user")
            .fix("dlsync list")
            .fix("dlsync clean")
            .build();

        assert!(report.starts_with("[✗] Remove all: 2 of 5 entries failed"));
        let details = report.find("  - 4: file missing").unwrap();
        let causes = report.find("Possible causes:").unwrap();
        let fixes = report.find("Try these fixes:").unwrap();
        assert!(details < causes && causes < fixes);
        assert!(report.contains("  2. dlsync clean"));
        assert!(report.ends_with(HELP_HINT));
    }

    #[test]
    fn test_title_only() {
        let report = ErrorBuilder::new("Bare").build();
        assert_eq!(report, format!("[✗] Bare\n\n{}", HELP_HINT));
    }
}
