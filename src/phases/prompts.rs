//! Prompts for agent-driven phases.

use crate::context::WorkflowContext;

use super::PhaseKind;

/// Phase-specific instructions.
pub(crate) fn brief(kind: PhaseKind) -> &'static str {
    match kind {
        PhaseKind::Research => {
            "Research the codebase for this task. Identify the relevant modules, \
             existing patterns to follow, constraints, and risks. Do not modify any files."
        }
        PhaseKind::Planning => {
            "Write a step-by-step implementation plan. Name the files to change, the \
             tests to add, and the order of work. Do not modify any files."
        }
        PhaseKind::PlanReview => {
            "Review the implementation plan for gaps, incorrect assumptions, and missing \
             tests. Produce the corrected plan. Do not modify any files."
        }
        PhaseKind::Implementation => {
            "Implement the plan. Keep changes focused on the task and follow existing \
             conventions in the codebase."
        }
        PhaseKind::TestWriting => {
            "Write tests covering the new behavior, including edge cases and failure paths."
        }
        PhaseKind::CodeReview => {
            "Review the changes on this branch for bugs, missing error handling, and \
             deviations from the plan. List concrete issues. Do not modify any files."
        }
        PhaseKind::FixReviewIssues => {
            "Fix every valid issue raised in the code review. Explain any issue you \
             decide not to fix."
        }
        PhaseKind::Documentation => {
            "Update user-facing documentation, changelogs, and doc comments affected \
             by the change."
        }
        _ => "",
    }
}

/// Earlier phases whose output this phase reads, in order.
pub(crate) fn inputs(kind: PhaseKind) -> &'static [PhaseKind] {
    use PhaseKind::*;
    match kind {
        Planning => &[Research],
        PlanReview => &[Research, Planning],
        Implementation | TestWriting | Documentation => &[PlanReview, Planning],
        CodeReview => &[PlanReview, Planning],
        FixReviewIssues => &[CodeReview],
        _ => &[],
    }
}

/// Existing output files of earlier phases. Missing ones are skipped.
pub(crate) fn context_files(kind: PhaseKind, ctx: &WorkflowContext) -> Vec<String> {
    inputs(kind)
        .iter()
        .filter_map(|input| ctx.artifact_file(input.name(), "output_file"))
        .map(|p| p.to_string_lossy().to_string())
        .collect()
}

/// Full prompt for a single-agent run of `kind`.
pub(crate) fn phase_prompt(kind: PhaseKind, ctx: &WorkflowContext) -> String {
    let mut prompt = format!("# {} phase\n\n## Task\n\n{}\n\n", kind, ctx.task_description);
    prompt.push_str("## Instructions\n\n");
    prompt.push_str(brief(kind));
    prompt.push_str("\n\n");

    let files = context_files(kind, ctx);
    if !files.is_empty() {
        prompt.push_str("## Context files\n\nRead these before starting:\n\n");
        for file in files {
            prompt.push_str(&format!("- {}\n", file));
        }
        prompt.push('\n');
    }

    prompt.push_str("End with a concise summary of what you did or found.\n");
    prompt
}

/// Prompt asking the agent to fix new test failures.
pub(crate) fn test_fix_prompt(failures: &[String], output: &str, iteration: u32) -> String {
    let mut prompt = format!(
        "Fix attempt {}: the following tests fail and did not fail before your changes.\n\n",
        iteration
    );
    for failure in failures {
        prompt.push_str(&format!("- {}\n", failure));
    }
    prompt.push_str("\n## Test output (tail)\n\n```\n");
    prompt.push_str(output);
    prompt.push_str("\n```\n\nFix the code (not the tests, unless a test is wrong). \
                     Do not touch unrelated failures.\n");
    prompt
}

/// Prompt for projects with no detected test command: the agent finds,
/// runs and fixes the tests itself.
pub(crate) fn test_detection_prompt(max_iterations: u32) -> String {
    format!(
        "No test command was detected for this project. Detect and run its tests:\n\n\
         1. Find the test configuration (package.json, pyproject.toml, Cargo.toml, \
         go.mod, Makefile or similar).\n\
         2. Run the appropriate test command.\n\
         3. If tests fail, analyze the failures and fix the code.\n\
         4. Re-run the tests until they pass, at most {} times.\n\n\
         Report the command you used and the final test results.\n",
        max_iterations
    )
}

/// Prompt asking the agent to fix lint or typecheck errors.
pub(crate) fn lint_fix_prompt(failures: &[(String, String)], iteration: u32) -> String {
    let mut prompt = format!("Fix attempt {}: these checks fail.\n\n", iteration);
    for (command, output) in failures {
        prompt.push_str(&format!("## `{}`\n\n```\n{}\n```\n\n", command, output));
    }
    prompt.push_str("Fix every reported problem without disabling the checks.\n");
    prompt
}

/// Prompt asking the agent to resolve rebase conflicts.
pub(crate) fn conflict_prompt(files: &[String], base: &str) -> String {
    let mut prompt = format!(
        "A rebase onto '{}' stopped on conflicts in these files:\n\n",
        base
    );
    for file in files {
        prompt.push_str(&format!("- {}\n", file));
    }
    prompt.push_str(
        "\nResolve every conflict marker, keeping both sides' intent. Do not run \
         `git rebase --continue`; only edit the files.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_prompt_references_existing_research() {
        let dir = tempfile::TempDir::new().unwrap();
        let research = dir.path().join("research-t.md");
        std::fs::write(&research, "notes").unwrap();

        let mut ctx = WorkflowContext::new("t", "Add a cache", dir.path(), dir.path(), 5.0);
        let mut artifacts = crate::context::PhaseArtifacts::new();
        artifacts.insert(
            "output_file".into(),
            research.to_string_lossy().to_string().into(),
        );
        ctx.record_artifacts("research", artifacts);

        let prompt = phase_prompt(PhaseKind::Planning, &ctx);
        assert!(prompt.contains("Add a cache"));
        assert!(prompt.contains("implementation plan"));
        assert!(prompt.contains("research-t.md"));
    }

    #[test]
    fn missing_inputs_are_tolerated() {
        let ctx = WorkflowContext::new("t", "Add a cache", "/repo", "/repo/plans", 5.0);
        let prompt = phase_prompt(PhaseKind::Implementation, &ctx);
        assert!(!prompt.contains("Context files"));
    }

    #[test]
    fn fix_prompts_list_targets() {
        let prompt = test_fix_prompt(&["tests/a.py::t".into()], "boom", 2);
        assert!(prompt.contains("Fix attempt 2"));
        assert!(prompt.contains("- tests/a.py::t"));

        let lint = lint_fix_prompt(&[("cargo clippy".into(), "warning".into())], 1);
        assert!(lint.contains("`cargo clippy`"));

        let conflict = conflict_prompt(&["src/lib.rs".into()], "main");
        assert!(conflict.contains("- src/lib.rs"));
    }
}
