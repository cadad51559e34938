use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding crate sources; the example pack and target are never scanned.
const SOURCE_DIRS: [&str; 6] = ["analysis", "design", "simulate", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

/// One source rule: a line regex plus a filter deciding whether a matching line is
/// really a violation.
struct Rule {
    title: &'static str,
    pattern: String,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

// Collects the violating lines of one file.
struct RuleCollector<'a> {
    rule: &'a Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'a> RuleCollector<'a> {
    fn new(rule: &'a Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.title,
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(msg)
    }
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

/// Text after the first `//` of a line, if any.
fn comment_text(line: &str) -> Option<&str> {
    line.find("//").map(|idx| line[idx + 2..].trim_start_matches(['/', '!']).trim())
}

// Underscore-prefixed names count only in code, outside string literals.
fn underscore_in_code(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    line.split('"').step_by(2).any(has_underscore_name)
}

// Word-boundary check by hand; `grep` only offers line matchers.
fn has_underscore_name(text: &str) -> bool {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = text.as_bytes();
    (0..bytes.len()).any(|i| {
        (i == 0 || !is_word(bytes[i - 1]))
            && bytes[i] == b'_'
            && bytes.get(i + 1).is_some_and(|&b| is_word(b))
    })
}

fn forbidden_word(line: &str) -> bool {
    comment_text(line).is_some_and(|text| FORBIDDEN_WORDS.iter().any(|w| text.contains(w)))
}

fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line) && comment_text(line).is_some_and(|text| text.contains("**"))
}

fn all_caps_comment(line: &str) -> bool {
    if !is_comment_line(line) {
        return false;
    }
    let text = comment_text(line).unwrap_or("");
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            title: "underscore-prefixed names",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            is_violation: underscore_in_code,
            advice: "Underscore-prefixed names are not allowed; use the value or remove it.",
        },
        Rule {
            title: "forbidden comment words",
            pattern: format!(r"//.*(?:{})", FORBIDDEN_WORDS.join("|")),
            is_violation: forbidden_word,
            advice: "Comments describe the code as it is, not how it got there.",
        },
        Rule {
            title: "'**' in regular comments",
            pattern: r"//.*\*\*".to_string(),
            is_violation: stars_outside_docs,
            advice: "The '**' pattern is only allowed in doc comments.",
        },
        Rule {
            title: "all-uppercase comments",
            pattern: r"//.*".to_string(),
            is_violation: all_caps_comment,
            advice: "Comments whose letters are all uppercase are not allowed.",
        },
        Rule {
            title: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            is_violation: |_| true,
            advice: "Use the code or delete it.",
        },
    ]
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn scan() -> Result<(), Box<dyn Error>> {
    let files = source_files();
    let mut searcher = Searcher::new();
    for rule in rules() {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
        for path in &files {
            let mut collector = RuleCollector::new(&rule, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(message) = collector.error_message() {
                return Err(message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = scan() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
