//! Diagnostic format template expansion.
//!
//! Templates are scanned left to right:
//!
//! - `%'raw'%` emits `raw` literally
//! - `[pre%var%post|alt]` emits `pre`, the value and `post` when `var` is
//!   set, otherwise `alt` (which may be omitted). Brackets nest, and `pre`,
//!   `post` and `alt` are expanded in turn.
//! - `%var%` emits the value of `var`, or nothing when it is unset
//!
//! `%%` and any text that does not form one of the above pass through
//! unchanged.

use p4rpc_protocol::Symbols;

/// Expands a template against a symbol table.
pub fn expand(template: &[u8], symbols: &Symbols) -> Vec<u8> {
    let mut out = Vec::with_capacity(template.len());
    expand_into(&mut out, template, symbols);
    out
}

/// Expands a template into a string, replacing invalid UTF-8.
pub fn expand_to_string(template: &[u8], symbols: &Symbols) -> String {
    String::from_utf8_lossy(&expand(template, symbols)).into_owned()
}

fn expand_into(out: &mut Vec<u8>, template: &[u8], symbols: &Symbols) {
    let mut i = 0;
    while i < template.len() {
        let rest = &template[i..];

        if let Some((raw, len)) = raw_literal(rest) {
            out.extend_from_slice(raw);
            i += len;
            continue;
        }

        if rest[0] == b'[' {
            if let Some((cond, len)) = conditional(rest) {
                match symbols.get(cond.name) {
                    Some(value) => {
                        expand_into(out, cond.pre, symbols);
                        out.extend_from_slice(value);
                        expand_into(out, cond.post, symbols);
                    }
                    None => expand_into(out, cond.alt, symbols),
                }
                i += len;
                continue;
            }
        }

        if rest.starts_with(b"%%") {
            out.extend_from_slice(b"%%");
            i += 2;
            continue;
        }

        if let Some((name, len)) = variable(rest) {
            if let Some(value) = symbols.get(name) {
                out.extend_from_slice(value);
            }
            i += len;
            continue;
        }

        out.push(rest[0]);
        i += 1;
    }
}

struct Conditional<'a> {
    pre: &'a [u8],
    name: &'a [u8],
    post: &'a [u8],
    alt: &'a [u8],
}

/// Parses `[pre%var%post|alt]` at the start of `s`, returning it and the
/// number of bytes it spans.
fn conditional(s: &[u8]) -> Option<(Conditional<'_>, usize)> {
    let close = matching_bracket(s)?;
    let inner = &s[1..close];
    let (body, alt) = match top_level_pipe(inner) {
        Some(pipe) => (&inner[..pipe], &inner[pipe + 1..]),
        None => (inner, &inner[inner.len()..]),
    };
    let (start, name, len) = top_level_variable(body)?;
    Some((
        Conditional {
            pre: &body[..start],
            name,
            post: &body[start + len..],
            alt,
        },
        close + 1,
    ))
}

/// Parses `%'raw'%` at the start of `s`.
fn raw_literal(s: &[u8]) -> Option<(&[u8], usize)> {
    let body = s.strip_prefix(b"%'")?;
    let end = body.windows(2).position(|w| w == b"'%")?;
    Some((&body[..end], end + 4))
}

/// Parses `%name%` at the start of `s`.
fn variable(s: &[u8]) -> Option<(&[u8], usize)> {
    let body = s.strip_prefix(b"%")?;
    let len = body.iter().position(|&b| !is_name_byte(b))?;
    if len == 0 || body[len] != b'%' {
        return None;
    }
    Some((&body[..len], len + 2))
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')
}

/// Finds the `]` closing the `[` at `s[0]`, skipping raw literals.
fn matching_bracket(s: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = 0;
    while i < s.len() {
        if let Some((_, len)) = raw_literal(&s[i..]) {
            i += len;
            continue;
        }
        match s[i] {
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn top_level_pipe(s: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = 0;
    while i < s.len() {
        if let Some((_, len)) = raw_literal(&s[i..]) {
            i += len;
            continue;
        }
        match s[i] {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b'|' if depth == 0 => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Finds the first `%var%` outside nested brackets, returning its offset,
/// name and length.
fn top_level_variable(s: &[u8]) -> Option<(usize, &[u8], usize)> {
    let mut depth = 0usize;
    let mut i = 0;
    while i < s.len() {
        if let Some((_, len)) = raw_literal(&s[i..]) {
            i += len;
            continue;
        }
        match s[i] {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b'%' if depth == 0 => {
                if s[i..].starts_with(b"%%") {
                    i += 2;
                    continue;
                }
                if let Some((name, len)) = variable(&s[i..]) {
                    return Some((i, name, len));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn symbols(pairs: &[(&'static str, &'static str)]) -> Symbols {
        pairs
            .iter()
            .map(|&(k, v)| (Bytes::from_static(k.as_bytes()), Bytes::from_static(v.as_bytes())))
            .collect()
    }

    fn render(template: &str, pairs: &[(&'static str, &'static str)]) -> String {
        expand_to_string(template.as_bytes(), &symbols(pairs))
    }

    #[test]
    fn test_variables() {
        assert_eq!(render("hello %name%", &[("name", "world")]), "hello world");
        assert_eq!(render("hello %name%!", &[]), "hello !");
        assert_eq!(
            render("%depotFile%#%rev% - %action%", &[
                ("depotFile", "//depot/a.c"),
                ("rev", "3"),
                ("action", "edit"),
            ]),
            "//depot/a.c#3 - edit"
        );
    }

    #[test]
    fn test_raw_literal() {
        assert_eq!(render("%'[not|a %var%]'%", &[("var", "x")]), "[not|a %var%]");
        assert_eq!(render("a%''%b", &[]), "ab");
    }

    #[test]
    fn test_conditional_with_alternative() {
        assert_eq!(render("[%rev%|none]", &[("rev", "7")]), "7");
        assert_eq!(render("[%rev%|none]", &[]), "none");
    }

    #[test]
    fn test_conditional_without_alternative() {
        let template = "file[#%rev%] done";
        assert_eq!(render(template, &[("rev", "3")]), "file#3 done");
        assert_eq!(render(template, &[]), "file done");
    }

    #[test]
    fn test_empty_value_counts_as_set() {
        assert_eq!(render("[<%v%>|unset]", &[("v", "")]), "<>");
    }

    #[test]
    fn test_nested_conditionals() {
        let template = "[(%a%[ %b%])|-]";
        assert_eq!(render(template, &[("a", "A"), ("b", "B")]), "(A B)");
        assert_eq!(render(template, &[("a", "A")]), "(A)");
        assert_eq!(render(template, &[("b", "B")]), "-");
    }

    #[test]
    fn test_alternative_is_expanded() {
        assert_eq!(
            render("[%a%|no a, have %b%]", &[("b", "B")]),
            "no a, have B"
        );
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(render("100%% done", &[]), "100%% done");
        assert_eq!(render("50% off", &[]), "50% off");
        assert_eq!(render("[no variable here]", &[]), "[no variable here]");
        assert_eq!(render("a|b]", &[]), "a|b]");
    }

    #[test]
    fn test_unterminated_bracket() {
        assert_eq!(render("[%a% and more", &[("a", "A")]), "[A and more");
    }

    #[test]
    fn test_unterminated_raw_literal() {
        assert_eq!(render("%'oops", &[]), "%'oops");
    }

    #[test]
    fn test_binary_values_kept() {
        let mut syms = Symbols::new();
        syms.insert(Bytes::from_static(b"v"), Bytes::from_static(b"\xff\x00"));
        assert_eq!(expand(b"<%v%>", &syms), b"<\xff\x00>");
    }
}
