//! Glob Key Patterns
//!
//! Redis-style glob matching used by `invalidate_pattern` on the memory tier
//! and by warming rules. Supports `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\`
//! escapes, matching the semantics of the distributed tier's `SCAN MATCH`.

/// Check whether `text` matches the glob `pattern`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_chars(&p, &t)
}

/// Whether a pattern contains glob metacharacters or escapes
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '\\'])
}

fn match_chars(p: &[char], t: &[char]) -> bool {
    let (mut pi, mut ti) = (0usize, 0usize);
    // (pattern index after the last '*', text index it is anchored at)
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi + 1, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => match match_class(p, pi, t[ti]) {
                    Some((true, next)) => {
                        pi = next;
                        ti += 1;
                        continue;
                    }
                    Some((false, _)) => {}
                    // Unterminated class: treat '[' literally
                    None if t[ti] == '[' => {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                    None => {}
                },
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        // Mismatch: let the last star swallow one more character
        match star {
            Some((after_star, anchor)) => {
                pi = after_star;
                ti = anchor + 1;
                star = Some((after_star, anchor + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match one character against the class opening at `start`.
///
/// Returns `(matched, index after ']')`, or `None` if the class is unterminated.
fn match_class(p: &[char], start: usize, ch: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == ch;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= lo <= ch && ch <= hi;
            i += 3;
        } else {
            matched |= p[i] == ch;
            i += 1;
        }
    }

    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_literal() {
        assert!(glob_match("user:1", "user:1"));
        assert!(!glob_match("user:1", "user:10"));
        assert!(!glob_match("user:10", "user:1"));
    }

    #[test]
    fn test_star() {
        assert!(glob_match("user:*", "user:1"));
        assert!(glob_match("user:*", "user:"));
        assert!(glob_match("user:*:profile", "user:42:profile"));
        assert!(!glob_match("user:*:profile", "user:42:settings"));
        assert!(glob_match("*", ""));
        assert!(glob_match("**a", "bba"));
        assert!(glob_match("*a*b", "xaxxb"));
        assert!(!glob_match("*a*b", "xaxxc"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("h?llo", "hello"));
        assert!(glob_match("h?llo", "hallo"));
        assert!(!glob_match("h?llo", "hllo"));
    }

    #[test]
    fn test_classes() {
        assert!(glob_match("h[ae]llo", "hello"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[a-b]llo", "hbllo"));
        assert!(!glob_match("h[a-b]llo", "hcllo"));
        assert!(glob_match("h[b-a]llo", "hallo"));
    }

    #[test]
    fn test_escape() {
        assert!(glob_match(r"key\*", "key*"));
        assert!(!glob_match(r"key\*", "keys"));
        assert!(glob_match(r"a[\]]b", "a]b"));
    }

    #[test]
    fn test_unterminated_class_is_literal() {
        assert!(glob_match("a[b", "a[b"));
        assert!(!glob_match("a[b", "ab"));
    }

    #[test]
    fn test_is_glob() {
        assert!(is_glob("user:*"));
        assert!(is_glob("h?"));
        assert!(is_glob("a\\*b"));
        assert!(!is_glob("users:active"));
    }

    proptest! {
        #[test]
        fn prop_literal_matches_itself(s in "[a-z0-9:_]{0,24}") {
            prop_assert!(glob_match(&s, &s));
        }

        #[test]
        fn prop_prefix_star(prefix in "[a-z:]{0,8}", rest in "[a-z0-9:]{0,16}") {
            let pattern = format!("{}*", prefix);
            let key = format!("{}{}", prefix, rest);
            prop_assert!(glob_match(&pattern, &key));
        }

        #[test]
        fn prop_star_matches_everything(s in ".{0,32}") {
            prop_assert!(glob_match("*", &s));
        }
    }
}
