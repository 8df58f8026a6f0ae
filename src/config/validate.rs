//! Per-parameter value rules.
//!
//! Each parameter maps to one validator; the parser looks the validator up in
//! [`VALIDATORS`] and applies it to every value it reads.

use super::Param;

/// A value rule. `Err` carries the human-readable rule that was violated.
pub type Validator = fn(&str) -> Result<(), String>;

/// Rules for the known parameters. Anything not listed must be non-empty.
pub const VALIDATORS: &[(Param, Validator)] = &[
    (Param::BaseLayer, validate_layer),
    (Param::RepoCheckout, validate_name),
    (Param::RepoUrl, validate_repo_url),
    (Param::RepoDepth, validate_depth),
    (Param::RepoCloneInto, validate_repo_path),
    (Param::RunFromRepo, validate_repo_path),
];

const URL_SCHEMES: &[&str] = &["https://", "http://", "ssh://", "git://", "file://"];

pub fn validator_for(param: Param) -> Validator {
    VALIDATORS
        .iter()
        .find(|(p, _)| *p == param)
        .map(|(_, v)| *v)
        .unwrap_or(validate_non_empty)
}

/// Section names and name-like values: `[A-Za-z0-9_.-]+`.
pub fn is_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn validate_non_empty(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("value must not be empty".to_string());
    }
    Ok(())
}

fn validate_name(value: &str) -> Result<(), String> {
    if !is_name(value) {
        return Err(format!(
            "'{value}' must consist of letters, digits, '_', '.' or '-'"
        ));
    }
    Ok(())
}

/// A layer is a directory directly under the layers root.
fn validate_layer(value: &str) -> Result<(), String> {
    validate_name(value)?;
    if value == "." || value == ".." {
        return Err(format!("'{value}' does not name a layer directory"));
    }
    Ok(())
}

fn validate_depth(value: &str) -> Result<(), String> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("'{value}' must be a non-negative integer"));
    }
    value
        .parse::<u32>()
        .map(|_| ())
        .map_err(|_| format!("'{value}' is too large for a clone depth"))
}

fn validate_repo_path(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'))
    {
        return Err(format!(
            "'{value}' must consist of letters, digits, '_', '.', '/' or '-'"
        ));
    }
    if value.split('/').any(|segment| segment == "..") {
        return Err(format!("'{value}' must not contain a '..' segment"));
    }
    Ok(())
}

fn validate_repo_url(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if let Some(scheme) = URL_SCHEMES.iter().find(|s| value.starts_with(**s)) {
        let rest = &value[scheme.len()..];
        if rest.is_empty() || rest.chars().any(|c| c.is_whitespace() || c == '"') {
            return Err(format!("'{value}' is not a valid repository URL"));
        }
        return Ok(());
    }
    if let Some((user, host_and_path)) = value.split_once('@') {
        let valid = host_and_path
            .split_once(':')
            .map(|(host, path)| is_name(user) && is_name(host) && is_url_path(path))
            .unwrap_or(false);
        if !valid {
            return Err(format!(
                "'{value}' must look like user@host:path[.git]"
            ));
        }
        return Ok(());
    }
    if !is_url_path(value) {
        return Err(format!(
            "'{value}' must be user@host:path[.git] or a repository path"
        ));
    }
    Ok(())
}

fn is_url_path(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(param: Param, value: &str) -> bool {
        validator_for(param)(value).is_ok()
    }

    #[test]
    fn name_rules() {
        assert!(check(Param::BaseLayer, "debian-12.x86_64"));
        assert!(check(Param::RepoCheckout, "v1.2_rc"));
        assert!(!check(Param::BaseLayer, ""));
        assert!(!check(Param::BaseLayer, "with space"));
        assert!(!check(Param::RepoCheckout, "feature/x"));
        assert!(!check(Param::BaseLayer, ".."));
        assert!(!check(Param::BaseLayer, "."));
        assert!(check(Param::BaseLayer, "..hidden"));
    }

    #[test]
    fn repo_url_forms() {
        assert!(check(Param::RepoUrl, ""));
        assert!(check(Param::RepoUrl, "git@github.com:org/provision.git"));
        assert!(check(Param::RepoUrl, "deploy@host.lan:provision"));
        assert!(check(Param::RepoUrl, "/srv/git/provision.git"));
        assert!(check(Param::RepoUrl, "../provision"));
        assert!(check(Param::RepoUrl, "https://example.org/provision.git"));
        assert!(!check(Param::RepoUrl, "git@github.com"));
        assert!(!check(Param::RepoUrl, "@host:path"));
        assert!(!check(Param::RepoUrl, "has space"));
        assert!(!check(Param::RepoUrl, "https://"));
    }

    #[test]
    fn depth_must_be_non_negative_integer() {
        assert!(check(Param::RepoDepth, "0"));
        assert!(check(Param::RepoDepth, "25"));
        assert!(!check(Param::RepoDepth, "-1"));
        assert!(!check(Param::RepoDepth, "one"));
        assert!(!check(Param::RepoDepth, ""));
        assert!(!check(Param::RepoDepth, "99999999999"));
    }

    #[test]
    fn repo_paths_reject_traversal() {
        assert!(check(Param::RepoCloneInto, ""));
        assert!(check(Param::RepoCloneInto, "root/provision"));
        assert!(check(Param::RunFromRepo, "scripts/run.sh"));
        assert!(check(Param::RunFromRepo, "..hidden/run.sh"));
        assert!(!check(Param::RunFromRepo, "../run.sh"));
        assert!(!check(Param::RepoCloneInto, "root/../etc"));
        assert!(!check(Param::RunFromRepo, "run me.sh"));
    }
}
