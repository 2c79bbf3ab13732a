use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use ctfpilot_types::{Category, CategoryGuess};

use crate::CategoryClassifier;

struct SignatureTable {
    category: Category,
    file_signatures: &'static [&'static str],
    extensions: &'static [&'static str],
    strings_hints: &'static [&'static str],
}

// Several tables may feed one category; scores are summed per category.
const TABLES: &[SignatureTable] = &[
    SignatureTable {
        category: Category::Pwn,
        file_signatures: &["ELF", "PE32", "Mach-O", "executable"],
        extensions: &[".elf", ".exe", ".out", ".bin", ".dll", ".so"],
        strings_hints: &["GLIBC", "libc", "main", "printf", "scanf", "gets", "strcpy"],
    },
    SignatureTable {
        category: Category::Rev,
        file_signatures: &["compiled Java", "byte-compiled", "Dalvik", "WebAssembly"],
        extensions: &[".pyc", ".class", ".jar", ".apk", ".dex", ".wasm"],
        strings_hints: &["PyInstaller", "MEIPASS", "java/lang", "Lcom/", "UPX!"],
    },
    SignatureTable {
        category: Category::Crypto,
        file_signatures: &["PGP", "GPG", "encrypted"],
        extensions: &[".enc", ".gpg", ".aes", ".rsa", ".pem", ".key"],
        strings_hints: &["BEGIN RSA", "BEGIN PGP", "AES", "RSA", "cipher", "hash"],
    },
    SignatureTable {
        category: Category::Forensics,
        file_signatures: &["data", "archive", "filesystem"],
        extensions: &[".dd", ".img", ".raw", ".dump", ".mem", ".vmem"],
        strings_hints: &["MFT", "NTFS", "FAT32", "ext4", "inode"],
    },
    // network captures
    SignatureTable {
        category: Category::Forensics,
        file_signatures: &["pcap", "tcpdump", "Wireshark"],
        extensions: &[".pcap", ".pcapng", ".cap"],
        strings_hints: &["HTTP", "TCP", "UDP", "GET", "POST", "User-Agent"],
    },
    // steganography carriers
    SignatureTable {
        category: Category::Forensics,
        file_signatures: &["image", "PNG", "JPEG", "GIF", "BMP", "audio", "WAVE"],
        extensions: &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".wav", ".mp3"],
        strings_hints: &["IHDR", "IDAT", "IEND", "JFIF", "Exif"],
    },
    SignatureTable {
        category: Category::Web,
        file_signatures: &["HTML", "text"],
        extensions: &[".html", ".php", ".js", ".css", ".sql"],
        strings_hints: &["DOCTYPE", "script", "SELECT", "INSERT", "WHERE"],
    },
    SignatureTable {
        category: Category::Misc,
        file_signatures: &[],
        extensions: &[".txt", ".py", ".java", ".c", ".cpp"],
        strings_hints: &[],
    },
];

const EXTENSION_WEIGHT: f64 = 2.0;
const SIGNATURE_WEIGHT: f64 = 1.5;
const HINT_WEIGHT: f64 = 0.5;

/// Offline classifier that scores extensions, `file` output and `strings`
/// output against fixed per-category tables.
#[derive(Debug, Clone, Default)]
pub struct SignatureClassifier;

impl SignatureClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(
        &self,
        files: &[String],
        file_outputs: &HashMap<String, String>,
        strings_outputs: &HashMap<String, String>,
    ) -> CategoryGuess {
        let mut scores: Vec<(Category, f64)> =
            Category::ALL.iter().map(|category| (*category, 0.0)).collect();

        for filename in files {
            let ext = extension_of(filename);
            let file_output = file_outputs
                .get(filename)
                .map(|s| s.to_lowercase())
                .unwrap_or_default();
            let strings_output = strings_outputs.get(filename).map(String::as_str).unwrap_or("");

            for table in TABLES {
                let mut score = 0.0;
                if ext.as_deref().is_some_and(|ext| table.extensions.contains(&ext)) {
                    score += EXTENSION_WEIGHT;
                }
                for signature in table.file_signatures {
                    if file_output.contains(&signature.to_lowercase()) {
                        score += SIGNATURE_WEIGHT;
                    }
                }
                for hint in table.strings_hints {
                    if strings_output.contains(hint) {
                        score += HINT_WEIGHT;
                    }
                }
                if let Some(entry) = scores.iter_mut().find(|(c, _)| *c == table.category) {
                    entry.1 += score;
                }
            }
        }

        let mut best: Option<(Category, f64)> = None;
        for (category, score) in scores {
            if score > 0.0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((category, score));
            }
        }
        match best {
            Some((category, score)) => CategoryGuess {
                category: category.as_str().to_string(),
                confidence: (score / 10.0).min(1.0),
            },
            None => CategoryGuess {
                category: Category::Misc.as_str().to_string(),
                confidence: 0.3,
            },
        }
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

#[async_trait]
impl CategoryClassifier for SignatureClassifier {
    async fn detect_category(
        &self,
        files: &[String],
        file_outputs: &HashMap<String, String>,
        strings_outputs: &HashMap<String, String>,
    ) -> anyhow::Result<CategoryGuess> {
        Ok(self.classify(files, file_outputs, strings_outputs))
    }
}
