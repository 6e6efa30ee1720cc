use regex::Regex;

/// Compile a `*`-glob into an anchored regex. `*` matches any run of
/// characters, everything else is literal.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut first = true;
    for part in pattern.split('*') {
        if !first {
            re.push_str(".*");
        }
        re.push_str(&regex::escape(part));
        first = false;
    }
    re.push('$');
    // Escaped literals plus `.*` always form a valid expression.
    Regex::new(&re).expect("glob compiles to valid regex")
}
