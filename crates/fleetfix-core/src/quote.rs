//! Shell quoting for displaying an argument vector.

/// Quote a single token so a POSIX shell would read it back unchanged.
pub fn quote_token(token: &str) -> String {
    if token.is_empty() {
        return "''".to_string();
    }
    let safe = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r#"'"'"'"#))
    }
}

/// Join an argument vector into a single shell-quoted display string.
pub fn quote_argv<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|t| quote_token(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a command string on whitespace.
///
/// No shell syntax is interpreted; pass the tokens individually to keep spaces inside one
/// argument.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_tokens_stay_bare() {
        assert_eq!(quote_argv(&["sed", "-i", "s/a/b/g", "setup.cfg"]), "sed -i s/a/b/g setup.cfg");
        assert_eq!(quote_token("user@host:1,2=3+4%"), "user@host:1,2=3+4%");
    }

    #[test]
    fn empty_token_is_quoted() {
        assert_eq!(quote_argv(&["echo", ""]), "echo ''");
    }

    #[test]
    fn spaces_and_quotes_are_escaped() {
        assert_eq!(quote_token("hello world"), "'hello world'");
        assert_eq!(quote_token("it's"), r#"'it'"'"'s'"#);
        assert_eq!(quote_token("$HOME"), "'$HOME'");
    }

    #[test]
    fn split_command_ignores_repeated_whitespace() {
        assert_eq!(
            split_command("  pre-commit   autoupdate\t--freeze "),
            vec!["pre-commit", "autoupdate", "--freeze"]
        );
        assert!(split_command("   ").is_empty());
    }
}
