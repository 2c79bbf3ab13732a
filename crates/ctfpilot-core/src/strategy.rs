use ctfpilot_types::{Category, HistoryEntry};

/// Static per-category playbook: tools worth trying and the solve script
/// used when interactive analysis comes up empty.
#[derive(Debug)]
pub struct CategoryStrategy {
    pub category: Category,
    pub display_name: &'static str,
    pub description: &'static str,
    pub phases: &'static [&'static str],
    pub tools: &'static [&'static str],
    pub packages: &'static [&'static str],
    pub template: &'static str,
}

/// Values substituted into a strategy template.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub files: &'a [String],
    pub category: Category,
    pub flag_format: &'a str,
    pub flag_regex: &'a str,
    pub analysis: &'a str,
    pub history: &'a [HistoryEntry],
}

const PRELUDE: &str = r#"#!/usr/bin/env python3
# Autogenerated solve script
# Category: {{CATEGORY}}
# Expected flag format: {{FLAG_FORMAT}}
#
# Files:
{{FILE_LIST}}
#
# Last analysis:
{{ANALYSIS}}
#
# Recent commands:
{{CONTEXT}}
import base64
import binascii
import codecs
import os
import re
import subprocess
import sys

FILES = {{FILES}}
FLAG_RE = re.compile({{FLAG_REGEX}})
found = []


def report(text, source):
    if isinstance(text, bytes):
        text = text.decode("latin-1", errors="ignore")
    for match in FLAG_RE.finditer(text):
        value = match.group(0)
        if value not in found:
            found.append(value)
            print(f"[{source}] {value}")


def read(path):
    try:
        with open(path, "rb") as handle:
            return handle.read()
    except OSError as exc:
        print(f"cannot read {path}: {exc}", file=sys.stderr)
        return b""


def run(argv, stdin=None):
    try:
        proc = subprocess.run(argv, input=stdin, capture_output=True, timeout=20)
        return proc.stdout + proc.stderr
    except (OSError, subprocess.TimeoutExpired) as exc:
        print(f"{argv[0]} failed: {exc}", file=sys.stderr)
        return b""

"#;

const EPILOGUE: &str = r#"
for path in FILES:
    report(read(path), path)
    solve(path, read(path))

if not found:
    print("NO_FLAG_FOUND")
"#;

const CRYPTO_TEMPLATE: &str = r#"
def decodings(data):
    text = data.strip()
    for name, fn in (
        ("base64", base64.b64decode),
        ("base32", base64.b32decode),
        ("base85", base64.b85decode),
        ("hex", binascii.unhexlify),
    ):
        try:
            yield name, fn(text)
        except (binascii.Error, ValueError):
            pass
    yield "rot13", codecs.decode(data.decode("latin-1"), "rot_13").encode("latin-1")


def solve(path, data):
    for name, decoded in decodings(data):
        report(decoded, f"{path}:{name}")
    for key in range(1, 256):
        report(bytes(b ^ key for b in data), f"{path}:xor{key:#04x}")
    for shift in range(1, 26):
        shifted = "".join(
            chr((ord(c) - base + shift) % 26 + base) if c.isalpha() else c
            for c in data.decode("latin-1")
            for base in [ord("A") if c.isupper() else ord("a")]
        )
        report(shifted, f"{path}:caesar{shift}")
"#;

const PWN_TEMPLATE: &str = r#"
def solve(path, data):
    report(run(["strings", "-a", path]), f"{path}:strings")
    try:
        from pwn import ELF, context, cyclic, process

        context.log_level = "error"
        elf = ELF(path, checksec=False)
        for name in ("win", "flag", "print_flag", "get_flag", "shell"):
            if name in elf.symbols:
                print(f"interesting symbol {name} at {hex(elf.symbols[name])}")
        os.chmod(path, 0o755)
        proc = process(path)
        proc.sendline(cyclic(512))
        report(proc.recvall(timeout=5), f"{path}:overflow")
    except Exception as exc:
        print(f"pwntools check failed: {exc}", file=sys.stderr)
"#;

const REV_TEMPLATE: &str = r#"
def solve(path, data):
    report(run(["strings", "-a", "-n", "6", path]), f"{path}:strings")
    report(run(["objdump", "-s", "-j", ".rodata", path]), f"{path}:rodata")
    for key in range(1, 256):
        report(bytes(b ^ key for b in data), f"{path}:xor{key:#04x}")
    report(data[::-1], f"{path}:reversed")
"#;

const WEB_TEMPLATE: &str = r#"
def solve(path, data):
    text = data.decode("utf-8", errors="ignore")
    for comment in re.findall(r"<!--(.*?)-->", text, re.S):
        report(comment, f"{path}:comment")
    for blob in re.findall(r"[A-Za-z0-9+/]{16,}={0,2}", text):
        try:
            report(base64.b64decode(blob), f"{path}:base64")
        except (binascii.Error, ValueError):
            pass
    try:
        import requests

        for url in re.findall(r"https?://[^\s\"'<>]+", text):
            report(requests.get(url, timeout=10).text, url)
    except Exception as exc:
        print(f"http request failed: {exc}", file=sys.stderr)
"#;

const FORENSICS_TEMPLATE: &str = r#"
def solve(path, data):
    report(run(["strings", "-a", path]), f"{path}:strings")
    report(run(["exiftool", path]), f"{path}:exif")
    report(run(["binwalk", "-e", "-C", "/tmp/ctfpilot-carve", path]), f"{path}:binwalk")
    for root, _dirs, names in os.walk("/tmp/ctfpilot-carve"):
        for name in names:
            report(read(os.path.join(root, name)), f"{path}:carved:{name}")
    report(run(["zsteg", "-a", path]), f"{path}:zsteg")
    report(run(["tshark", "-r", path, "-qz", "follow,tcp,ascii,0"]), f"{path}:tcp0")
    try:
        from PIL import Image

        img = Image.open(path).convert("RGB")
        bits = "".join(str(channel & 1) for pixel in img.getdata() for channel in pixel)
        lsb = bytes(int(bits[i:i + 8], 2) for i in range(0, len(bits) - 7, 8))
        report(lsb, f"{path}:lsb")
    except Exception as exc:
        print(f"image check skipped: {exc}", file=sys.stderr)
"#;

const MISC_TEMPLATE: &str = r#"
def solve(path, data):
    report(run(["strings", "-a", path]), f"{path}:strings")
    report(run(["file", path]), f"{path}:file")
    for name, fn in (("base64", base64.b64decode), ("hex", binascii.unhexlify)):
        try:
            report(fn(data.strip()), f"{path}:{name}")
        except (binascii.Error, ValueError):
            pass
    report(codecs.decode(data.decode("latin-1"), "rot_13"), f"{path}:rot13")
    report(data[::-1], f"{path}:reversed")
"#;

pub static STRATEGIES: [CategoryStrategy; 6] = [
    CategoryStrategy {
        category: Category::Crypto,
        display_name: "Cryptography",
        description: "Encodings, classical ciphers and weak modern crypto",
        phases: &["identify encoding", "decode layers", "brute-force small keyspaces"],
        tools: &["base64", "base32", "xxd", "openssl", "name-that-hash"],
        packages: &["pycryptodome"],
        template: CRYPTO_TEMPLATE,
    },
    CategoryStrategy {
        category: Category::Pwn,
        display_name: "Binary Exploitation",
        description: "Memory corruption in native binaries",
        phases: &["checksec", "find sinks", "control flow hijack"],
        tools: &["checksec", "file", "strings", "objdump", "readelf", "gdb"],
        packages: &["pwntools"],
        template: PWN_TEMPLATE,
    },
    CategoryStrategy {
        category: Category::Rev,
        display_name: "Reverse Engineering",
        description: "Recover the checking logic of a program",
        phases: &["static strings", "disassemble", "invert the check"],
        tools: &["strings", "objdump", "radare2", "ltrace", "strace"],
        packages: &[],
        template: REV_TEMPLATE,
    },
    CategoryStrategy {
        category: Category::Web,
        display_name: "Web",
        description: "Source review and request tampering",
        phases: &["read source", "find endpoints", "craft requests"],
        tools: &["curl", "grep", "cat"],
        packages: &["requests"],
        template: WEB_TEMPLATE,
    },
    CategoryStrategy {
        category: Category::Forensics,
        display_name: "Forensics",
        description: "Captures, disk images and steganography carriers",
        phases: &["metadata", "carve embedded data", "inspect streams"],
        tools: &["exiftool", "binwalk", "foremost", "zsteg", "steghide", "tshark"],
        packages: &["pillow"],
        template: FORENSICS_TEMPLATE,
    },
    CategoryStrategy {
        category: Category::Misc,
        display_name: "Miscellaneous",
        description: "Anything else; broad decoding sweep",
        phases: &["triage", "decode", "search"],
        tools: &["file", "strings", "xxd", "grep"],
        packages: &[],
        template: MISC_TEMPLATE,
    },
];

pub fn strategy_for(category: Category) -> &'static CategoryStrategy {
    STRATEGIES
        .iter()
        .find(|strategy| strategy.category == category)
        .unwrap_or(&STRATEGIES[5])
}

impl CategoryStrategy {
    pub fn package_list(&self) -> Vec<String> {
        self.packages.iter().map(|p| p.to_string()).collect()
    }

    /// Fills every placeholder. Values land either inside Python comments or
    /// as JSON literals, which Python accepts verbatim for strings and lists.
    pub fn render(&self, ctx: &ScriptContext<'_>) -> String {
        let files = serde_json::to_string(ctx.files).unwrap_or_else(|_| "[]".to_string());
        let flag_regex =
            serde_json::to_string(ctx.flag_regex).unwrap_or_else(|_| "\"$^\"".to_string());
        let file_list = if ctx.files.is_empty() {
            "#   (none)".to_string()
        } else {
            ctx.files
                .iter()
                .map(|file| format!("#   - {}", single_line(file)))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let context = if ctx.history.is_empty() {
            "#   (none)".to_string()
        } else {
            ctx.history
                .iter()
                .map(|entry| {
                    format!(
                        "#   $ {} (exit {})",
                        single_line(&entry.command_line()),
                        entry.exit_code
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let analysis = comment_block(ctx.analysis);
        let flag_format = single_line(ctx.flag_format);
        let values = [
            ("CATEGORY", ctx.category.as_str()),
            ("FLAG_FORMAT", flag_format.as_str()),
            ("FILE_LIST", file_list.as_str()),
            ("ANALYSIS", analysis.as_str()),
            ("CONTEXT", context.as_str()),
            ("FILES", files.as_str()),
            ("FLAG_REGEX", flag_regex.as_str()),
        ];

        let mut script = String::with_capacity(PRELUDE.len() + self.template.len() + 512);
        for part in [PRELUDE, self.template, EPILOGUE] {
            substitute_into(&mut script, part, &values);
        }
        script
    }
}

/// Expands `{{NAME}}` tokens of `template` in one left-to-right pass. Inserted
/// values are never rescanned, and unknown names are copied through.
fn substitute_into(out: &mut String, template: &str, values: &[(&str, &str)]) {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let token = after.find("}}").and_then(|end| {
            let name = &after[..end];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (end, *value))
        });
        match token {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
}

fn single_line(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn comment_block(text: &str) -> String {
    let lines: Vec<String> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("#   {}", single_line(line)))
        .collect();
    if lines.is_empty() {
        "#   (none)".to_string()
    } else {
        lines.join("\n")
    }
}
