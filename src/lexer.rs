//! Token scanner for the worksheet definition language.
//!
//! The scanner produces maximal runs: a run of word characters
//! (`[0-9A-Za-z_.%]`) is one token regardless of whether it later matches a
//! name or number pattern, which lets the parser report the whole offending
//! run (`expecting expression: `1_234.` did not match patterns`). Operators
//! match greedily, two characters before one. Line (`// …`) and block
//! (`/* … */`) comments are discarded.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ParseError;

/// Identifiers: underscores may not lead or trail.
pub(crate) static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]([a-zA-Z0-9_]*[a-zA-Z0-9])?$").unwrap());

/// Unsigned integers (field indices, scales).
pub(crate) static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]+$").unwrap());

/// Number literals: `_` digit separators, optional fraction, optional
/// trailing `%`.
pub(crate) static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(_+[0-9]+)*(\.[0-9]+(_+[0-9]+)*)?%?$").unwrap());

const TWO_CHAR_OPS: [&str; 6] = ["==", "!=", "<=", ">=", "&&", "||"];

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '%'
}

/// Splits source text into tokens. String literals keep their quotes and
/// escapes; the parser unquotes them.
pub(crate) fn tokenize(src: &str) -> Result<Vec<String>, ParseError> {
    let mut toks = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        // comments
        if c == '/' {
            let rest = &src[start..];
            if rest.starts_with("//") {
                for (_, d) in chars.by_ref() {
                    if d == '\n' {
                        break;
                    }
                }
                continue;
            }
            if rest.starts_with("/*") {
                chars.next();
                chars.next();
                let mut closed = false;
                while let Some((i, d)) = chars.next() {
                    if d == '*' && src[i..].starts_with("*/") {
                        chars.next();
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(ParseError::unexpected("*/", "<eof>"));
                }
                continue;
            }
        }

        // string literals, quotes included
        if c == '"' {
            chars.next();
            let mut end = None;
            let mut escaped = false;
            for (i, d) in chars.by_ref() {
                if escaped {
                    escaped = false;
                } else if d == '\\' {
                    escaped = true;
                } else if d == '"' {
                    end = Some(i + d.len_utf8());
                    break;
                }
            }
            match end {
                Some(end) => toks.push(src[start..end].to_string()),
                None => return Err(ParseError::unexpected("\"", "<eof>")),
            }
            continue;
        }

        // word runs
        if is_word_char(c) {
            let mut end = start;
            while let Some(&(i, d)) = chars.peek() {
                if !is_word_char(d) {
                    break;
                }
                end = i + d.len_utf8();
                chars.next();
            }
            toks.push(src[start..end].to_string());
            continue;
        }

        // operators and punctuation
        let rest = &src[start..];
        if let Some(op) = TWO_CHAR_OPS.iter().find(|op| rest.starts_with(**op)) {
            toks.push((*op).to_string());
            chars.next();
            chars.next();
            continue;
        }
        toks.push(c.to_string());
        chars.next();
    }

    Ok(toks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<String> {
        tokenize(src).unwrap()
    }

    #[test]
    fn worksheet_declaration() {
        assert_eq!(
            toks("worksheet simple {1:full_name text}"),
            ["worksheet", "simple", "{", "1", ":", "full_name", "text", "}"]
        );
    }

    #[test]
    fn word_runs_are_maximal() {
        assert_eq!(toks("1_2___4.6_78___+_1_2"), ["1_2___4.6_78___", "+", "_1_2"]);
        assert_eq!(toks("1_2__6+7"), ["1_2__6", "+", "7"]);
    }

    #[test]
    fn percent_stays_in_the_run() {
        assert_eq!(toks("1_000*8%"), ["1_000", "*", "8%"]);
        assert_eq!(toks("5.75%*100"), ["5.75%", "*", "100"]);
        assert_eq!(toks("50_000 / 1.375%"), ["50_000", "/", "1.375%"]);
        assert_eq!(toks("0.000_100%"), ["0.000_100%"]);
        assert_eq!(toks("100 %"), ["100", "%"]);
    }

    #[test]
    fn operators_match_greedily() {
        assert_eq!(
            toks("1!=2!3! =4==5=6= =7&&8&9& &0||1|2| |done"),
            [
                "1", "!=", "2", "!", "3", "!", "=", "4", "==", "5", "=", "6", "=", "=", "7", "&&",
                "8", "&", "9", "&", "&", "0", "||", "1", "|", "2", "|", "|", "done"
            ]
        );
    }

    #[test]
    fn comments_are_discarded() {
        assert_eq!(toks("1// ignore my comment\n4"), ["1", "4"]);
        assert_eq!(toks("1/* this one too */4"), ["1", "4"]);
    }

    #[test]
    fn unterminated_tokens() {
        assert_eq!(tokenize("\"oops"), Err(ParseError::unexpected("\"", "<eof>")));
        assert_eq!(tokenize("1 /* oops"), Err(ParseError::unexpected("*/", "<eof>")));
    }

    #[test]
    fn name_pattern() {
        for yes in ["a", "a_a", "a_0", "A", "a_A", "A_a", "A_0"] {
            assert!(NAME_RE.is_match(yes), "{yes}");
        }
        for no in ["0", "_a", "a_", "_A", "A_"] {
            assert!(!NAME_RE.is_match(no), "{no}");
        }
    }

    #[test]
    fn number_pattern() {
        for yes in ["1", "1_234", "1_2__6", "1.000", "1_234.000_000_008", "6%", "0.000_100%"] {
            assert!(NUMBER_RE.is_match(yes), "{yes}");
        }
        for no in ["_1_234", "1_234_", "1_234.", "1_234._67", "4%0", "2.7%5"] {
            assert!(!NUMBER_RE.is_match(no), "{no}");
        }
    }
}
