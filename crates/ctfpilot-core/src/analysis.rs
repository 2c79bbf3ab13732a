use std::time::Duration;

use ctfpilot_orchestrator::PhaseReducer;
use ctfpilot_providers::AnalysisRequest;
use ctfpilot_types::{Category, InsightSource, Phase};

use crate::driver::RunDriver;

/// Why the retry loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    FlagFound,
    /// The analyst had nothing left to try.
    Exhausted,
    MaxAttempts,
    Cancelled,
}

/// Bounded suggest-then-execute loop. Commands run one at a time. The attempt
/// counter moves once per finished iteration and never while paused.
pub(crate) async fn run_loop(driver: &mut RunDriver) -> LoopExit {
    let max_attempts = driver.config.max_attempts;
    let delay = Duration::from_millis(driver.config.iteration_delay_ms);

    while driver.attempts < max_attempts {
        if !driver.checkpoint().await {
            return LoopExit::Cancelled;
        }
        let attempt = driver.attempts + 1;
        driver.message = format!(
            "{} (attempt {attempt}/{max_attempts})",
            PhaseReducer::message(Phase::AiAnalysis)
        );
        driver.publish_snapshot();

        let request = AnalysisRequest {
            files: driver.challenge.files.clone(),
            history: driver.history.entries(),
            description: driver.challenge.description.clone(),
            flag_format: driver.challenge.flag_format.clone(),
            category: driver.category.unwrap_or_default().as_str().to_string(),
            attempt_number: attempt,
        };
        let analyst = driver.collaborators.analyst.clone();
        let answer = analyst.analyze(&request).await;
        // A cancel that lands while the analyst is working discards its answer.
        if driver.control.is_cancelled() {
            return LoopExit::Cancelled;
        }
        let insight = match answer {
            Ok(insight) => insight,
            Err(err) => {
                driver.analysis_failed(attempt, &err);
                complete_attempt(driver);
                if !pause_between(driver, delay, max_attempts).await {
                    return LoopExit::Cancelled;
                }
                continue;
            }
        };

        if let Some(category) = Category::parse(&insight.category) {
            if driver.category != Some(category) {
                driver.set_category(
                    category,
                    insight.confidence,
                    insight.source == InsightSource::RuleBased,
                );
            }
        }
        if !insight.analysis.trim().is_empty() {
            driver.last_analysis = insight.analysis.clone();
        }

        if !insight.flag_candidates.is_empty() {
            driver.record_flags(&insight.flag_candidates);
        }
        if driver.flags.has_any() {
            complete_attempt(driver);
            return LoopExit::FlagFound;
        }
        if !insight.should_continue {
            tracing::info!(attempt, "analyst signalled no further strategy");
            complete_attempt(driver);
            return LoopExit::Exhausted;
        }

        let commands = insight.next_commands;
        for (index, command) in commands.iter().enumerate() {
            if !driver.checkpoint().await {
                for skipped in &commands[index..] {
                    driver.skip_command(&skipped.tool, &skipped.args, &skipped.reason);
                }
                return LoopExit::Cancelled;
            }
            driver
                .dispatch_command(&command.tool, &command.args, &command.reason)
                .await;
            if driver.flags.has_any() {
                complete_attempt(driver);
                return LoopExit::FlagFound;
            }
        }

        complete_attempt(driver);
        if !pause_between(driver, delay, max_attempts).await {
            return LoopExit::Cancelled;
        }
    }
    LoopExit::MaxAttempts
}

fn complete_attempt(driver: &mut RunDriver) {
    driver.attempts += 1;
    driver.publish_snapshot();
}

/// Backoff between iterations, skipped after the last one.
async fn pause_between(driver: &RunDriver, delay: Duration, max_attempts: u32) -> bool {
    if driver.attempts >= max_attempts {
        return !driver.control.is_cancelled();
    }
    driver.control.sleep(delay).await
}
