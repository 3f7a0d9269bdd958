// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

/// Very small, safe-ish shell escaper for paths and arguments.
pub fn sh_escape(p: &str) -> String {
    let mut out = String::from("'");
    out.push_str(&p.replace('\'', r"'\''"));
    out.push('\'');
    out
}

/// Joins arguments into one command line, escaping each of them.
pub fn sh_join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|arg| sh_escape(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// True for names usable as POSIX shell variable names.
pub fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_embedded_single_quotes() {
        assert_eq!(sh_escape("it's"), r"'it'\''s'");
        assert_eq!(sh_escape(""), "''");
    }

    #[test]
    fn join_escapes_every_argument() {
        assert_eq!(sh_join(["ls", "-l", "a b"]), "'ls' '-l' 'a b'");
    }

    #[test]
    fn env_names_follow_posix_rules() {
        assert!(is_env_name("OMP_NUM_THREADS"));
        assert!(is_env_name("_x1"));
        assert!(!is_env_name("1abc"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name(""));
    }
}
