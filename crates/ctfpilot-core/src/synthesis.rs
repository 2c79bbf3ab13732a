use ctfpilot_types::Category;

use crate::driver::RunDriver;
use crate::strategy::{strategy_for, CategoryStrategy, ScriptContext};

/// Renders the solve script for the run's final category.
pub(crate) fn build_script(driver: &RunDriver) -> (String, &'static CategoryStrategy) {
    let category = driver.category.unwrap_or(Category::Misc);
    let strategy = strategy_for(category);
    let analysis = truncate_chars(&driver.last_analysis, driver.config.analysis_summary_chars);
    let history = driver.history.recent(driver.config.script_context_entries);
    let script = strategy.render(&ScriptContext {
        files: &driver.challenge.files,
        category,
        flag_format: &driver.challenge.flag_format,
        flag_regex: driver.detector.script_pattern(),
        analysis: &analysis,
        history: &history,
    });
    tracing::info!(
        %category,
        bytes = script.len(),
        packages = strategy.packages.len(),
        "solve script generated"
    );
    (script, strategy)
}

/// Runs the script exactly once; any outcome ends the phase.
pub(crate) async fn execute(driver: &mut RunDriver, script: String, strategy: &CategoryStrategy) {
    let timeout_secs = driver.config.script_timeout_secs;
    let rationale = format!("{} solve script", strategy.display_name);
    let flags = driver
        .dispatch_script(script, strategy.package_list(), timeout_secs, &rationale)
        .await;
    tracing::info!(flags = flags.len(), "solve script finished");
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    let trimmed = input.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
