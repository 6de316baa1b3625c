//! Patch anchor matching with fuzzy recovery.
//!
//! A patch hunk's search string must anchor to an exact substring of the
//! target file before apply. When the verbatim text is absent (the child
//! normalized whitespace, usually), a whitespace-insensitive window scan
//! recovers the real substring and the hunk is rewritten to it, so that apply
//! always operates on literal content.

/// Outcome of anchoring one search string against file content.
#[derive(Debug, Clone, PartialEq)]
pub enum AnchorMatch {
    /// The search string occurs verbatim.
    Exact,
    /// Recovered via normalized comparison; `rewritten` is the exact file
    /// substring the hunk must use instead.
    Fuzzy { rewritten: String },
    /// No anchor found. `similar` is a best-effort (1-based line, content)
    /// hint for the error report.
    NotFound { similar: Option<(usize, String)> },
}

/// Extra window lengths tried beyond the search's own line count.
const WINDOW_SLACK: usize = 5;

/// How many lines before a candidate the window may start.
const START_BACKOFF: usize = 3;

/// Similarity bar for treating a file line as a candidate anchor.
const CANDIDATE_SIMILARITY: f64 = 0.9;

/// Similarity bar for the "similar content" hint on failure.
const HINT_SIMILARITY: f64 = 0.6;

/// Anchor `search` in `content`.
pub fn match_anchor(content: &str, search: &str) -> AnchorMatch {
    if content.contains(search) {
        return AnchorMatch::Exact;
    }

    let search_lines: Vec<&str> = search.lines().collect();
    let normalized_search = normalize_block(&search_lines);
    let file_lines: Vec<&str> = content.lines().collect();

    if let Some(first_meaningful) = search_lines.iter().find(|l| is_meaningful(l)) {
        let target = collapse_ws(first_meaningful.trim());
        for (idx, line) in file_lines.iter().enumerate() {
            let candidate = collapse_ws(line.trim());
            let matches = candidate == target
                || bigram_similarity(&candidate, &target) > CANDIDATE_SIMILARITY;
            if !matches {
                continue;
            }
            for window_len in search_lines.len()..=search_lines.len() + WINDOW_SLACK {
                for back in 0..=START_BACKOFF.min(idx) {
                    let start = idx - back;
                    let end = start + window_len;
                    if end > file_lines.len() {
                        continue;
                    }
                    let window = &file_lines[start..end];
                    if normalize_block(window) == normalized_search {
                        return AnchorMatch::Fuzzy {
                            rewritten: window.join("\n"),
                        };
                    }
                }
            }
        }
    }

    AnchorMatch::NotFound {
        similar: similar_hint(&file_lines, &search_lines),
    }
}

/// Whitespace-normalized form of a block: lines trimmed, empty lines
/// dropped, internal whitespace runs collapsed to single spaces.
fn normalize_block(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|l| collapse_ws(l.trim()))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A line worth anchoring on: long enough and not just punctuation.
fn is_meaningful(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() > 5
        && !trimmed
            .chars()
            .all(|c| c.is_whitespace() || "{}()[];,".contains(c))
}

/// Best-effort "similar content at line N" hint: first file line with bigram
/// similarity above the hint bar to the first long search line.
fn similar_hint(file_lines: &[&str], search_lines: &[&str]) -> Option<(usize, String)> {
    let probe = search_lines.iter().map(|l| l.trim()).find(|l| l.len() > 10)?;
    let probe = collapse_ws(probe);
    for (idx, line) in file_lines.iter().enumerate() {
        let candidate = collapse_ws(line.trim());
        if bigram_similarity(&candidate, &probe) >= HINT_SIMILARITY {
            return Some((idx + 1, (*line).to_string()));
        }
    }
    None
}

/// Jaccard similarity over character bigrams.
pub fn bigram_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let bigrams = |s: &str| -> std::collections::HashSet<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let set_a = bigrams(a);
    let set_b = bigrams(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let content = "fn main() {\n    println!(\"hi\");\n}\n";
        assert_eq!(match_anchor(content, "println!(\"hi\");"), AnchorMatch::Exact);
    }

    #[test]
    fn test_fuzzy_recovers_whitespace_differences() {
        let content = "  function  foo (x)  {\n    return x+1;\n  }\n";
        let search = "function foo(x) {\n  return x+1;\n}";
        match match_anchor(content, search) {
            AnchorMatch::Fuzzy { rewritten } => {
                // The rewritten anchor is a literal substring of the file.
                assert!(content.contains(&rewritten));
                assert!(rewritten.contains("return x+1;"));
            }
            other => panic!("expected fuzzy match, got {other:?}"),
        }
    }

    #[test]
    fn test_fuzzy_tolerates_extra_blank_lines_in_file() {
        let content = "let a = compute();\n\nlet b = a + 1;\nreturn b;\n";
        let search = "let a = compute();\nlet b = a + 1;\nreturn b;";
        match match_anchor(content, search) {
            AnchorMatch::Fuzzy { rewritten } => {
                assert!(content.contains(&rewritten));
            }
            other => panic!("expected fuzzy match, got {other:?}"),
        }
    }

    #[test]
    fn test_not_found_reports_similar_line() {
        let content = "const widgetRegistry = loadRegistry();\nother();\n";
        let search = "const widgetRegistry = loadRegistry(cfg);\nmissing();";
        match match_anchor(content, search) {
            AnchorMatch::NotFound { similar } => {
                let (line, text) = similar.expect("similar hint");
                assert_eq!(line, 1);
                assert!(text.contains("widgetRegistry"));
            }
            other => panic!("expected not-found, got {other:?}"),
        }
    }

    #[test]
    fn test_single_char_search_rejected_not_null_matched() {
        let content = "abc def\n";
        match match_anchor(content, "z") {
            AnchorMatch::NotFound { similar } => assert!(similar.is_none()),
            other => panic!("expected not-found, got {other:?}"),
        }
    }

    #[test]
    fn test_brace_only_search_is_not_meaningful() {
        // Nothing anchorable: every line is punctuation or too short.
        let content = "}\n}\n}\n";
        match match_anchor(content, "}\n  }\n") {
            AnchorMatch::NotFound { .. } => {}
            other => panic!("expected not-found, got {other:?}"),
        }
    }

    #[test]
    fn test_bigram_similarity_bounds() {
        assert!((bigram_similarity("abcdef", "abcdef") - 1.0).abs() < f64::EPSILON);
        assert_eq!(bigram_similarity("abcdef", "uvwxyz"), 0.0);
        let sim = bigram_similarity("const registry = load();", "const registry = load(cfg);");
        assert!(sim > 0.6 && sim < 1.0);
    }

    #[test]
    fn test_window_may_start_before_candidate_line() {
        // First meaningful search line sits after a short opener; the window
        // must back up to include the file's matching opener lines.
        let content = "{\n  let total = sum(values);\n  emit(total);\n}\n";
        let search = "{\nlet total = sum(values);\nemit(total);\n}";
        match match_anchor(content, search) {
            AnchorMatch::Fuzzy { rewritten } => assert!(content.contains(&rewritten)),
            other => panic!("expected fuzzy match, got {other:?}"),
        }
    }
}
