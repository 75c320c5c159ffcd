//! Verdict extraction from agent terminal output.
//!
//! The verification prompt instructs the agent to answer with exactly one
//! line, `TEST_PASS: <reason>` or `TEST_FAIL: <reason>`. The prompt itself
//! scrolls past in the same pane, so the template lines it contains must not
//! be mistaken for an answer. Anything ambiguous is a FAIL.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
}

const PASS_MARKER: &str = "TEST_PASS:";
const FAIL_MARKER: &str = "TEST_FAIL:";

/// Extract the agent's verdict from captured output, scanning newest lines
/// first. Returns a FAIL verdict when no unambiguous marker is found.
pub fn parse_verdict(output: &str) -> Verdict {
    for line in output.lines().rev() {
        let line = strip_decoration(line);
        let marker = if line.starts_with(PASS_MARKER) {
            Some(true)
        } else if line.starts_with(FAIL_MARKER) {
            Some(false)
        } else {
            None
        };
        let Some(passed) = marker else { continue };

        // Prompt template lines carry a bracketed placeholder ("[reason]");
        // a real answer does not start with one.
        let reason = line
            .splitn(2, ':')
            .nth(1)
            .map(str::trim)
            .unwrap_or_default();
        if reason.starts_with('[') {
            continue;
        }

        return Verdict {
            passed,
            reason: reason.to_string(),
        };
    }

    Verdict {
        passed: false,
        reason: "no explicit verdict in output - defaulting to FAIL".to_string(),
    }
}

/// Drop the list bullets and box-drawing borders terminal UIs prepend.
fn strip_decoration(line: &str) -> &str {
    line.trim_start_matches([' ', '\t', '●', '-', '│', '┃', '>', '*'])
        .trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_pass() {
        let v = parse_verdict("some output\nTEST_PASS: all three files exist\n");
        assert!(v.passed);
        assert_eq!(v.reason, "all three files exist");
    }

    #[test]
    fn test_explicit_fail() {
        let v = parse_verdict("TEST_FAIL: config.toml was not created");
        assert!(!v.passed);
        assert_eq!(v.reason, "config.toml was not created");
    }

    #[test]
    fn test_no_verdict_defaults_to_fail() {
        let v = parse_verdict("I finished the work, everything looks good!");
        assert!(!v.passed);
        assert!(v.reason.contains("defaulting to FAIL"));
    }

    #[test]
    fn test_prompt_template_lines_are_ignored() {
        // The echoed prompt contains both template markers; only the agent's
        // real answer below them counts.
        let output = "\
Respond with exactly one of:
TEST_PASS: [reason]
TEST_FAIL: [reason]

● TEST_PASS: criteria verified";
        let v = parse_verdict(output);
        assert!(v.passed);
        assert_eq!(v.reason, "criteria verified");
    }

    #[test]
    fn test_template_only_output_fails_closed() {
        let output = "TEST_PASS: [reason]\nTEST_FAIL: [reason]\n";
        let v = parse_verdict(output);
        assert!(!v.passed);
        assert!(v.reason.contains("defaulting to FAIL"));
    }

    #[test]
    fn test_newest_verdict_wins() {
        let output = "TEST_FAIL: first try\nTEST_PASS: fixed on re-check\n";
        let v = parse_verdict(output);
        assert!(v.passed);
    }

    #[test]
    fn test_decorated_verdict_line() {
        let v = parse_verdict("│ ● TEST_FAIL: tests did not run\n");
        assert!(!v.passed);
        assert_eq!(v.reason, "tests did not run");
    }
}
