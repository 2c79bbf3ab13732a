use once_cell::sync::Lazy;
use regex::Regex;

use ctfpilot_types::Category;

use crate::driver::RunDriver;
use crate::recon::ReconFindings;

pub const FALLBACK_CONFIDENCE: f64 = 0.5;

// Checked in order; the first category with a hit wins.
static KEYWORDS: Lazy<Vec<(Category, Regex)>> = Lazy::new(|| {
    [
        (
            Category::Crypto,
            r"rsa|cipher|encrypt|decrypt|aes|xor|modulus|caesar|vigenere|crypto|hash",
        ),
        (
            Category::Pwn,
            r"overflow|buffer|shellcode|rop|heap|format string|pwn|libc|exploit",
        ),
        (
            Category::Rev,
            r"reverse|revers|binary|disassembl|decompil|crackme|keygen|obfuscat|assembly",
        ),
        (
            Category::Web,
            r"sql|xss|http|cookie|injection|csrf|ssrf|website|login|php",
        ),
        (
            Category::Forensics,
            r"stego|memory|pcap|packet|wireshark|disk|metadata|carv|forensic|volatility|image",
        ),
    ]
    .into_iter()
    .map(|(category, words)| {
        let re = Regex::new(&format!(r"(?i)\b(?:{words})")).expect("keyword regex");
        (category, re)
    })
    .collect()
});

/// Deterministic guess from the challenge description.
pub fn keyword_category(description: &str) -> (Category, f64) {
    let category = KEYWORDS
        .iter()
        .find(|(_, re)| re.is_match(description))
        .map(|(category, _)| *category)
        .unwrap_or(Category::Misc);
    (category, FALLBACK_CONFIDENCE)
}

/// Never fails: collaborator errors and malformed answers fall back to the
/// keyword scan.
pub(crate) async fn detect(driver: &mut RunDriver, findings: &ReconFindings) {
    let classifier = driver.collaborators.classifier.clone();
    let answer = classifier
        .detect_category(
            &driver.challenge.files,
            &findings.file_outputs,
            &findings.strings_outputs,
        )
        .await;

    let accepted = match answer {
        Ok(guess) => match Category::parse(&guess.category) {
            Some(category) if guess.confidence.is_finite() => {
                Some((category, guess.confidence.clamp(0.0, 1.0)))
            }
            _ => {
                tracing::warn!(
                    category = %guess.category,
                    confidence = guess.confidence,
                    "classifier answer unusable; using keyword fallback"
                );
                None
            }
        },
        Err(err) => {
            tracing::warn!(error = %err, "classifier failed; using keyword fallback");
            None
        }
    };

    match accepted {
        Some((category, confidence)) => driver.set_category(category, confidence, false),
        None => {
            let (category, confidence) = keyword_category(&driver.challenge.description);
            driver.set_category(category, confidence, true);
        }
    }
}
