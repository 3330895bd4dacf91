//! Line-level preprocessing: BOM/newline normalization, comment stripping
//! with string awareness, skip/conditional blocks, brace folding.

use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Line {
    pub file: String,
    pub number: usize,
    pub content: String,
}

pub fn to_lines(file: &str, raw: &str) -> Vec<Line> {
    let norm = raw.strip_prefix('\u{FEFF}').unwrap_or(raw);
    let norm = norm.replace("\r\n", "\n").replace('\r', "\n");
    norm.split('\n')
        .enumerate()
        .map(|(i, p)| Line { file: file.to_string(), number: i + 1, content: p.to_string() })
        .collect()
}

pub fn preprocess(lines: Vec<Line>, macros: &HashSet<String>) -> Vec<Line> {
    let mut out = Vec::with_capacity(lines.len());
    for mut line in lines {
        line.content = strip_comment(&line.content).trim().to_string();
        if line.content.is_empty() {
            continue;
        }
        out.push(line);
    }

    let out = strip_range(out, "[SKIPSTART]", "[SKIPEND]");
    let out = strip_range(out, "[IF_DEBUG]", "[ENDIF]");

    let mut processed = Vec::with_capacity(out.len());
    let mut i = 0;
    while i < out.len() {
        let content = &out[i].content;
        if let Some(name) = content
            .strip_prefix("[IF ")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let name = name.trim().to_uppercase();
            let mut end = i + 1;
            while end < out.len() && !out[end].content.eq_ignore_ascii_case("[ENDIF]") {
                end += 1;
            }
            if end >= out.len() {
                break;
            }
            if macros.contains(&name) {
                processed.extend(out[i + 1..end].iter().cloned());
            }
            i = end + 1;
            continue;
        }
        processed.push(out[i].clone());
        i += 1;
    }

    concat_brace_lines(processed)
}

fn strip_range(lines: Vec<Line>, start: &str, end: &str) -> Vec<Line> {
    let mut out = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if lines[i].content.eq_ignore_ascii_case(start) {
            let mut j = i + 1;
            while j < lines.len() && !lines[j].content.eq_ignore_ascii_case(end) {
                j += 1;
            }
            i = j + 1;
            continue;
        }
        out.push(lines[i].clone());
        i += 1;
    }
    out
}

/// Lines strictly between a solitary `{` and its `}` become one logical
/// line attributed to the first inner line.
fn concat_brace_lines(lines: Vec<Line>) -> Vec<Line> {
    let mut out = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if lines[i].content != "{" {
            out.push(lines[i].clone());
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < lines.len() && lines[j].content != "}" {
            j += 1;
        }
        if j >= lines.len() || j == i + 1 {
            i = j + 1;
            continue;
        }
        let joined: String = lines[i + 1..j].iter().map(|l| l.content.as_str()).collect();
        out.push(Line {
            file: lines[i + 1].file.clone(),
            number: lines[i + 1].number,
            content: joined,
        });
        i = j + 1;
    }
    out
}

/// Drops the first unescaped `;` and everything after it. A plain string
/// literal obeys backslash escapes; a verbatim `@"…"` literal terminates
/// only on the closing quote.
pub fn strip_comment(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let rs: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut verbatim = false;
    let mut escape = false;
    let mut i = 0;
    while i < rs.len() {
        let r = rs[i];
        if !in_string {
            if r == '@' && i + 1 < rs.len() && rs[i + 1] == '"' {
                in_string = true;
                verbatim = true;
                out.push('@');
                out.push('"');
                i += 2;
                continue;
            }
            if r == '"' {
                in_string = true;
                verbatim = false;
                escape = false;
                out.push(r);
                i += 1;
                continue;
            }
            if r == ';' {
                break;
            }
            out.push(r);
            i += 1;
            continue;
        }

        out.push(r);
        i += 1;
        if verbatim {
            if r == '"' {
                in_string = false;
                verbatim = false;
            }
            continue;
        }
        if escape {
            escape = false;
            continue;
        }
        if r == '\\' {
            escape = true;
            continue;
        }
        if r == '"' {
            in_string = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prep(src: &str) -> Vec<String> {
        let macros = HashSet::new();
        preprocess(to_lines("T.ERB", src), &macros)
            .into_iter()
            .map(|l| l.content)
            .collect()
    }

    #[test]
    fn strips_comments_outside_strings() {
        assert_eq!(strip_comment("A = 1 ; note"), "A = 1 ");
        assert_eq!(strip_comment(r#"S = "a;b" ; tail"#), r#"S = "a;b" "#);
        assert_eq!(strip_comment(r#"S = @"x\" ; still in string""#), r#"S = @"x\" ; still in string""#);
    }

    #[test]
    fn drops_blank_and_skip_ranges() {
        let got = prep("A = 1\n\n[SKIPSTART]\nB = 2\n[SKIPEND]\nC = 3\n");
        assert_eq!(got, vec!["A = 1", "C = 3"]);
    }

    #[test]
    fn conditional_blocks_follow_macro_set() {
        let mut macros = HashSet::new();
        macros.insert("FEATURE".to_string());
        let lines = preprocess(
            to_lines("T.ERB", "[IF FEATURE]\nA = 1\n[ENDIF]\n[IF OTHER]\nB = 2\n[ENDIF]\n"),
            &macros,
        );
        let got: Vec<_> = lines.into_iter().map(|l| l.content).collect();
        assert_eq!(got, vec!["A = 1"]);
    }

    #[test]
    fn folds_brace_blocks_into_one_line() {
        let got = prep("{\nA = 1 +\n2\n}\nB = 3\n");
        assert_eq!(got, vec!["A = 1 +2", "B = 3"]);
    }

    #[test]
    fn bom_and_crlf_are_normalized() {
        let got = prep("\u{FEFF}A = 1\r\nB = 2\r");
        assert_eq!(got, vec!["A = 1", "B = 2"]);
    }
}
