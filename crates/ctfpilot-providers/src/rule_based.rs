use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use ctfpilot_types::{AiInsight, InsightSource, NextCommand};

use crate::{AnalysisRequest, SuggestionProvider};

static FLAG_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z]{2,10}\{[^}\r\n]{1,100}\}").expect("valid flag regex")
});
static BASE64_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[A-Za-z0-9+/]{20,}={0,2}$").expect("valid base64 regex"));

const MAX_COMMANDS_PER_ATTEMPT: usize = 3;
const GIVE_UP_AFTER: u32 = 50;
const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".bmp", ".gif"];

type Template = (&'static str, &'static [&'static str], &'static str);

// `{}` in an argument is replaced by the target file.
const IMAGE_COMMANDS: &[Template] = &[
    ("zsteg", &["-a", "{}"], "Check LSB steganography"),
    ("steghide", &["extract", "-sf", "{}", "-p", ""], "Try an empty passphrase"),
    ("exiftool", &["-a", "-u", "{}"], "Check all metadata"),
    ("binwalk", &["-e", "{}"], "Extract embedded files"),
    ("pngcheck", &["-v", "{}"], "Validate chunks"),
    ("strings", &["-n", "8", "{}"], "Extract strings"),
];
const BINARY_COMMANDS: &[Template] = &[
    ("checksec", &["--file={}"], "Check binary protections"),
    ("radare2", &["-qc", "aaa;afl", "{}"], "List functions"),
    ("strings", &["-n", "10", "{}"], "Extract longer strings"),
    ("objdump", &["-d", "-M", "intel", "{}"], "Disassemble"),
    ("readelf", &["-a", "{}"], "Inspect headers and sections"),
    ("ltrace", &["{}"], "Trace library calls"),
];
const CRYPTO_COMMANDS: &[Template] = &[
    ("base64", &["-d", "{}"], "Try base64 decode"),
    ("xxd", &["{}"], "View hex dump"),
    ("openssl", &["enc", "-d", "-aes-256-cbc", "-in", "{}"], "Try a common cipher"),
    ("cat", &["{}"], "Read the ciphertext"),
    ("base32", &["-d", "{}"], "Try base32 decode"),
    ("openssl", &["rsa", "-in", "{}", "-text", "-noout"], "Dump key parameters"),
];
const DEFAULT_COMMANDS: &[Template] = &[
    ("strings", &["-n", "8", "{}"], "Extract strings"),
    ("binwalk", &["-e", "{}"], "Extract embedded files"),
    ("grep", &["-aoE", "[A-Za-z]{2,10}\\{[^}]+\\}", "{}"], "Search for a flag pattern"),
    ("xxd", &["{}"], "View hex dump"),
    ("foremost", &["-i", "{}"], "Carve files"),
    ("exiftool", &["{}"], "Check metadata"),
];

/// Offline analyst used when no model is configured or the model fails.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedAnalyst;

impl RuleBasedAnalyst {
    pub fn new() -> Self {
        Self
    }

    pub fn suggest(&self, request: &AnalysisRequest) -> AiInsight {
        let mut findings: Vec<String> = Vec::new();
        let mut flag_candidates: Vec<String> = Vec::new();

        for entry in &request.history {
            for found in FLAG_LIKE.find_iter(&entry.stdout) {
                let candidate = found.as_str().to_string();
                if !flag_candidates.contains(&candidate) {
                    flag_candidates.push(candidate);
                }
            }
            let lower = entry.stdout.to_lowercase();
            if lower.contains("base64") || BASE64_LINE.is_match(&entry.stdout) {
                push_unique(&mut findings, "Detected base64 encoded data");
            }
            if lower.contains("password") {
                push_unique(&mut findings, "Found password reference");
            }
            if lower.contains("hidden") {
                push_unique(&mut findings, "Found 'hidden' keyword");
            }
        }

        let next_commands = self.commands_for(request);
        AiInsight {
            analysis: "Rule-based analysis".to_string(),
            category: request.category.clone(),
            confidence: 0.5,
            findings,
            next_commands,
            should_continue: request.attempt_number < GIVE_UP_AFTER && flag_candidates.is_empty(),
            flag_candidates,
            source: InsightSource::RuleBased,
        }
    }

    fn commands_for(&self, request: &AnalysisRequest) -> Vec<NextCommand> {
        if request.files.is_empty() {
            return Vec::new();
        }
        let attempt = request.attempt_number.max(1) as usize - 1;
        let target = &request.files[attempt % request.files.len()];

        let category = request.category.to_ascii_lowercase();
        let templates = if category == "stego"
            || request.files.iter().any(|file| is_image(file))
        {
            IMAGE_COMMANDS
        } else if matches!(category.as_str(), "pwn" | "rev" | "binary") {
            BINARY_COMMANDS
        } else if category == "crypto" {
            CRYPTO_COMMANDS
        } else {
            DEFAULT_COMMANDS
        };

        let offset = (attempt * MAX_COMMANDS_PER_ATTEMPT) % templates.len();
        templates
            .iter()
            .cycle()
            .skip(offset)
            .take(MAX_COMMANDS_PER_ATTEMPT.min(templates.len()))
            .map(|(tool, args, reason)| NextCommand {
                tool: tool.to_string(),
                args: args.iter().map(|arg| arg.replace("{}", target)).collect(),
                reason: reason.to_string(),
            })
            .collect()
    }
}

fn push_unique(findings: &mut Vec<String>, finding: &str) {
    if !findings.iter().any(|existing| existing == finding) {
        findings.push(finding.to_string());
    }
}

fn is_image(file: &str) -> bool {
    let lower = file.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[async_trait]
impl SuggestionProvider for RuleBasedAnalyst {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AiInsight> {
        Ok(self.suggest(request))
    }
}
