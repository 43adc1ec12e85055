use std::sync::OnceLock;

use regex::Regex;

/// How many following lines a lone `Tn` word may be separated from its `M6`
/// by and still count as one tool change.
const M6_LOOKAHEAD_LINES: usize = 3;

fn combined_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)T0*(\d{1,3})\s*M0?6|M0?6\s*T0*(\d{1,3})")
            .unwrap_or_else(|e| panic!("tool change regex: {}", e))
    })
}

fn tool_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bT0*(\d{1,3})\b").unwrap_or_else(|e| panic!("tool word regex: {}", e))
    })
}

fn m6_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bM0?6\b").unwrap_or_else(|e| panic!("m6 regex: {}", e)))
}

fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for ch in line.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 && ch != ';' => out.push(ch),
            ';' if depth == 0 => break,
            _ => {}
        }
    }
    out
}

/// Extracts the ordered tool-change sequence from NC program text.
///
/// A tool change is a `Tn`/`M6` pair either on one line (in either order) or
/// with the `M6` on one of the next few lines. Repeats are kept; the result
/// for `T1 M6 ... T2 M6 ... T1 M6` is `["T1", "T2", "T1"]`. Tool numbers are
/// normalized by stripping leading zeros (`T01` and `T1` are the same tool).
/// Programs without tool changes yield an empty sequence.
pub fn extract_tool_sequence(nc_text: &str) -> Vec<String> {
    let lines: Vec<String> = nc_text.lines().map(strip_comment).collect();
    let mut sequence = Vec::new();
    let mut consumed_m6 = vec![false; lines.len()];

    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = combined_re().captures(line) {
            let number = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or("0");
            sequence.push(normalize_tool(number));
            consumed_m6[i] = true;
            continue;
        }

        let Some(tool) = tool_word_re().captures(line) else {
            continue;
        };
        // Lone T word: pair it with the first unconsumed M6 within the
        // lookahead window, skipping lines that start their own tool change.
        let window_end = (i + 1 + M6_LOOKAHEAD_LINES).min(lines.len());
        for j in i + 1..window_end {
            if tool_word_re().is_match(&lines[j]) {
                break;
            }
            if !consumed_m6[j] && m6_word_re().is_match(&lines[j]) {
                sequence.push(normalize_tool(&tool[1]));
                consumed_m6[j] = true;
                break;
            }
        }
    }
    sequence
}

fn normalize_tool(number: &str) -> String {
    let n: u32 = number.parse().unwrap_or(0);
    format!("T{}", n)
}
