//! Tokenizing helpers for proxy and endpoint strings

/// Split on whitespace, honouring single and double quotes. Quotes are
/// removed; inside double quotes `\"` and `\\` are literal.
pub(crate) fn split_args(s: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                in_arg = true;
                let quote = c;
                loop {
                    match chars.next() {
                        Some('\\') if quote == '"' && matches!(chars.peek(), Some('"' | '\\')) => {
                            if let Some(ch) = chars.next() {
                                current.push(ch);
                            }
                        }
                        Some(ch) if ch == quote => break,
                        Some(ch) => current.push(ch),
                        None => return Err(format!("unterminated {} quote", quote)),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

/// Byte index of the first `target` at or after `start` that is outside
/// single or double quotes.
pub(crate) fn find_unquoted(s: &str, start: usize, targets: &[char]) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut chars = s[start..].char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some('"'), '\\') if matches!(chars.peek(), Some((_, '"' | '\\'))) => {
                chars.next();
            }
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, c) if targets.contains(&c) => return Some(start + i),
            _ => {}
        }
    }
    None
}

/// Characters that force a proxy-string token to be quoted
pub(crate) fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s.chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | '@' | '"' | '\''))
}

/// Quote a token when needed so [`split_args`] reads it back unchanged.
pub(crate) fn quote(s: &str) -> String {
    if needs_quoting(s) {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s.to_string()
    }
}
