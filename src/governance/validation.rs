//! Validation battery for constitution drafts.
//!
//! Three checks run in order: required structure, internal consistency, and
//! conflicts against the current baseline. Each produces a named result so a
//! failed draft tells its author exactly what to fix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ValidationConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
    pub timestamp: DateTime<Utc>,
}

pub fn run_checks(
    content: &str,
    baseline: Option<&str>,
    config: &ValidationConfig,
) -> ValidationReport {
    let checks = vec![
        check_structure(content, config),
        check_consistency(content),
        check_baseline_conflicts(content, baseline),
    ];
    ValidationReport {
        passed: checks.iter().all(|c| c.passed),
        checks,
        timestamp: Utc::now(),
    }
}

fn check_structure(content: &str, config: &ValidationConfig) -> ValidationCheck {
    let missing: Vec<&str> = config
        .required_sections
        .iter()
        .map(String::as_str)
        .filter(|section| !content.contains(section))
        .collect();

    ValidationCheck {
        name: "structure".to_string(),
        passed: missing.is_empty(),
        details: if missing.is_empty() {
            "all required sections present".to_string()
        } else {
            format!("missing required sections: {}", missing.join(", "))
        },
    }
}

/// A directive and its negation in the same document is a contradiction.
fn check_consistency(content: &str) -> ValidationCheck {
    for subject in directive_subjects(content, "must not ") {
        if directive_subjects(content, "must ")
            .iter()
            .any(|s| s == &subject)
        {
            return ValidationCheck {
                name: "consistency".to_string(),
                passed: false,
                details: format!("contradictory directives about \"{}\"", subject),
            };
        }
    }
    ValidationCheck {
        name: "consistency".to_string(),
        passed: true,
        details: "no contradictory directives found".to_string(),
    }
}

fn check_baseline_conflicts(content: &str, baseline: Option<&str>) -> ValidationCheck {
    let Some(baseline) = baseline else {
        return ValidationCheck {
            name: "baseline-conflicts".to_string(),
            passed: true,
            details: "no baseline to conflict with".to_string(),
        };
    };

    let baseline_required = directive_subjects(baseline, "must ");
    for subject in directive_subjects(content, "must not ") {
        if baseline_required.iter().any(|s| s == &subject) {
            return ValidationCheck {
                name: "baseline-conflicts".to_string(),
                passed: false,
                details: format!(
                    "draft forbids \"{}\" which the current baseline requires",
                    subject
                ),
            };
        }
    }
    ValidationCheck {
        name: "baseline-conflicts".to_string(),
        passed: true,
        details: "no conflicts with the current baseline".to_string(),
    }
}

/// The subjects of `must` / `must not` directives, lowercased. For
/// "must " the match skips "must not " so the two sets stay disjoint.
fn directive_subjects(text: &str, directive: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut subjects = Vec::new();
    for line in lower.lines() {
        let mut rest = line;
        while let Some(pos) = rest.find(directive) {
            let tail = &rest[pos + directive.len()..];
            if directive == "must " && tail.starts_with("not ") {
                rest = tail;
                continue;
            }
            let subject: String = tail
                .split(['.', ',', ';'])
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if !subject.is_empty() {
                subjects.push(subject);
            }
            rest = tail;
        }
    }
    subjects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ValidationConfig {
        ValidationConfig {
            required_sections: vec![
                "## Task:".to_string(),
                "## Acceptance Criteria:".to_string(),
            ],
        }
    }

    #[test]
    fn test_well_formed_draft_passes() {
        let content = "## Task:\nship it\n## Acceptance Criteria:\nworks";
        let report = run_checks(content, None, &config());
        assert!(report.passed);
        assert_eq!(report.checks.len(), 3);
    }

    #[test]
    fn test_missing_section_named_in_details() {
        let content = "## Task:\nship it";
        let report = run_checks(content, None, &config());
        assert!(!report.passed);
        let structure = &report.checks[0];
        assert!(!structure.passed);
        assert!(structure.details.contains("## Acceptance Criteria:"));
    }

    #[test]
    fn test_contradiction_fails_consistency() {
        let content = "## Task:\nAgents must write tests.\nAgents must not write tests.\n\
                       ## Acceptance Criteria:\nok";
        let report = run_checks(content, None, &config());
        let consistency = &report.checks[1];
        assert!(!consistency.passed);
        assert!(consistency.details.contains("write tests"));
    }

    #[test]
    fn test_baseline_conflict_detected() {
        let baseline = "Agents must run the linter.";
        let content = "## Task:\nAgents must not run the linter.\n\
                       ## Acceptance Criteria:\nok";
        let report = run_checks(content, Some(baseline), &config());
        let conflicts = &report.checks[2];
        assert!(!conflicts.passed);
        assert!(conflicts.details.contains("run the linter"));
    }

    #[test]
    fn test_must_not_does_not_shadow_must() {
        // A lone "must not" directive is not a contradiction by itself.
        let content = "## Task:\nAgents must not push to main.\n\
                       ## Acceptance Criteria:\nok";
        let report = run_checks(content, None, &config());
        assert!(report.passed);
    }
}
