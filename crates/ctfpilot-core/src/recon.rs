use std::collections::HashMap;

use crate::driver::RunDriver;

/// Recon outputs keyed by file name, handed to the classifier.
#[derive(Debug, Default)]
pub(crate) struct ReconFindings {
    pub file_outputs: HashMap<String, String>,
    pub strings_outputs: HashMap<String, String>,
}

/// `file` then `strings` over the first few challenge files. Command failures
/// are recorded and skipped; the first flag ends recon.
pub(crate) async fn reconnoitre(driver: &mut RunDriver) -> ReconFindings {
    let limit = driver.config.recon_file_limit;
    let files: Vec<String> = driver.challenge.files.iter().take(limit).cloned().collect();
    if driver.challenge.files.len() > files.len() {
        tracing::info!(
            inspected = files.len(),
            ignored = driver.challenge.files.len() - files.len(),
            "inspecting only the first files"
        );
    }
    let min_len = driver.config.strings_min_len.max(1).to_string();

    let mut findings = ReconFindings::default();
    for file in files {
        if driver.flags.has_any() || !driver.checkpoint().await {
            break;
        }
        let typed = driver
            .dispatch_command("file", &[file.clone()], "Identify the file type")
            .await;
        findings.file_outputs.insert(file.clone(), typed.stdout);

        if driver.flags.has_any() || !driver.checkpoint().await {
            break;
        }
        let strings = driver
            .dispatch_command(
                "strings",
                &["-n".to_string(), min_len.clone(), file.clone()],
                "Extract printable strings",
            )
            .await;
        findings.strings_outputs.insert(file, strings.stdout);
    }
    findings
}
