/// Keeps the first `max_chars` characters. Returns whether anything was cut.
pub fn truncate_head(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (text[..byte_idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Cleans raw tesseract output into paragraph-shaped text.
pub fn postprocess_ocr_text(raw: &str) -> String {
    let s = join_hyphenated_breaks(raw);
    let s = merge_soft_newlines(&s);
    let s = normalize_blank_lines(&s);
    let s = unescape_dollars(&s);
    s.trim().to_string()
}

fn join_hyphenated_breaks(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '-' && chars.get(i + 1) == Some(&'\n') {
            i += 2;
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn merge_soft_newlines(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == '\n' && i > 0 {
            let prev_solid = !chars[i - 1].is_whitespace();
            let next_solid = chars.get(i + 1).map(|n| !n.is_whitespace()).unwrap_or(false);
            if prev_solid && next_solid {
                out.push(' ');
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn normalize_blank_lines(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '\n' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let mut run_end = i + 1;
        while run_end < chars.len() && chars[run_end].is_whitespace() {
            run_end += 1;
        }
        // Last newline of the run, with at least one whitespace char in between.
        let closing = (i + 2..run_end).rev().find(|&k| chars[k] == '\n');
        match closing {
            Some(k) => {
                out.push_str("\n\n");
                i = k + 1;
            }
            None => {
                out.push('\n');
                i += 1;
            }
        }
    }
    out
}

fn unescape_dollars(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && chars.get(i + 1) == Some(&'$') {
            let followed_by_word = chars.get(i + 2).map(|&c| is_word_char(c)).unwrap_or(false);
            if !followed_by_word {
                out.push('$');
                i += 2;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_head_counts_chars_not_bytes() {
        let (t, cut) = truncate_head("你好世界", 2);
        assert_eq!(t, "你好");
        assert!(cut);

        let (t, cut) = truncate_head("abc", 3);
        assert_eq!(t, "abc");
        assert!(!cut);
    }

    #[test]
    fn truncate_head_is_deterministic() {
        let long = "x".repeat(6000) + "tail";
        assert_eq!(truncate_head(&long, 5000), truncate_head(&long, 5000));
        assert_eq!(truncate_head(&long, 5000).0.chars().count(), 5000);
    }

    #[test]
    fn postprocess_joins_hyphenated_words_and_soft_breaks() {
        let raw = "conti-\n  nuous text\nwraps here\n\n\nNext para \\$ and \\$x\n";
        assert_eq!(
            postprocess_ocr_text(raw),
            "continuous text wraps here\n\nNext para $ and \\$x"
        );
    }

    #[test]
    fn postprocess_keeps_single_blank_line() {
        assert_eq!(postprocess_ocr_text("a.\n\nb."), "a.\n\nb.");
        assert_eq!(postprocess_ocr_text("a.\n \t\nb."), "a.\n\nb.");
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(""));
        assert!(is_blank("  \n\t"));
        assert!(!is_blank(" a "));
    }
}
