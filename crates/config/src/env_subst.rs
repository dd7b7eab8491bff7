/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// Unset variables and unterminated placeholders are left as written, so a
/// missing secret surfaces in validation instead of becoming an empty string.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match (is_var_name(name), lookup(name)) {
            (true, Some(value)) => out.push_str(&value),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn is_var_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "RELAY_TOKEN" => Some("123:abc".to_string()),
            "DEST" => Some("-1009".to_string()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_vars() {
        assert_eq!(
            substitute_env_with("token = \"${RELAY_TOKEN}\"\nposts = ${DEST}", lookup),
            "token = \"123:abc\"\nposts = -1009"
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_env_with("${NOPE_XYZ}", lookup), "${NOPE_XYZ}");
    }

    #[test]
    fn leaves_malformed_placeholders() {
        assert_eq!(substitute_env_with("a ${RELAY_TOKEN", lookup), "a ${RELAY_TOKEN");
        assert_eq!(substitute_env_with("${}", lookup), "${}");
        assert_eq!(substitute_env_with("${not a var}", lookup), "${not a var}");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain $text"), "plain $text");
    }
}
