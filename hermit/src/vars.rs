//! `${VAR}` template expansion shared by the envars engine, the resolver, and
//! trigger actions.
//!
//! `$$` escapes a literal `$`. References to undefined variables are left
//! untouched so that later expansion passes (e.g. the shell) can still see
//! them.

/// Substitute `${VAR}` references in `input` using `lookup`, repeatedly, until
/// a fixed point is reached. A substituted value may itself contain further
/// references, so the loop runs until no substitution changes the string
/// (bounded, to defuse pathological self-references).
pub fn expand(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    const MAX_PASSES: usize = 16;

    let mut current = input.to_string();
    for _ in 0..MAX_PASSES {
        let next = expand_once(&current, &lookup);
        if next == current {
            break;
        }
        current = next;
    }
    unescape(&current)
}

/// One left-to-right substitution pass. `$$` sequences are copied through
/// opaquely so an escaped `$${FOO}` never gets expanded.
fn expand_once(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'$' {
            out.push_str("$$");
            i += 2;
        } else if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            match input[i + 2..].find('}') {
                Some(end) => {
                    let name = &input[i + 2..i + 2 + end];
                    match lookup(name) {
                        Some(value) => out.push_str(&value),
                        // undefined references remain untouched
                        None => out.push_str(&input[i..i + 2 + end + 1]),
                    }
                    i += 2 + end + 1;
                }
                None => {
                    out.push_str(&input[i..]);
                    break;
                }
            }
        } else {
            let ch = input[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

fn unescape(input: &str) -> String {
    input.replace("$$", "$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SortedMap;

    fn lookup<'a>(map: &'a SortedMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn expands_transitively() {
        let mut map = SortedMap::new();
        map.insert("A", "x/${B}");
        map.insert("B", "y");
        assert_eq!(expand("${A}/bin", lookup(&map)), "x/y/bin");
    }

    #[test]
    fn leaves_undefined_untouched() {
        let map = SortedMap::new();
        assert_eq!(expand("${NOPE}/bin", lookup(&map)), "${NOPE}/bin");
    }

    #[test]
    fn escapes_dollars() {
        let mut map = SortedMap::new();
        map.insert("A", "x");
        assert_eq!(expand("$${A} costs $$5, ${A}", lookup(&map)), "${A} costs $5, x");
    }

    #[test]
    fn bounded_self_reference() {
        let mut map = SortedMap::new();
        map.insert("A", "${A}");
        // must terminate; the self-reference is left as-is
        assert_eq!(expand("${A}", lookup(&map)), "${A}");
    }
}
