//! Name validation rules (spec §4.1).
//!
//! Every user-supplied name is validated before it ever reaches the key
//! schema, so that [`crate::keys`] never has to reject anything itself.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// The single limit name reserved for the auto-injected infrastructure
/// limit. Rejecting it on user input is a hard validation error.
pub const RESERVED_LIMIT_NAME: &str = "wcu";

const STACK_NAME_MAX_LEN: usize = 55;

fn stack_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").expect("static regex"))
}

fn resource_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._/-]*$").expect("static regex"))
}

fn limit_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._-]*$").expect("static regex"))
}

/// Validates a stack/identifier name: starts with a letter, then
/// `[A-Za-z0-9-]*`, max 55 characters.
pub fn validate_stack_name(name: &str) -> Result<()> {
    if name.len() > STACK_NAME_MAX_LEN {
        return Err(Error::validation(format!(
            "name '{name}' exceeds max length of {STACK_NAME_MAX_LEN}"
        )));
    }
    if !stack_name_re().is_match(name) {
        return Err(Error::validation(format!(
            "name '{name}' must start with a letter and contain only letters, digits, and hyphens"
        )));
    }
    Ok(())
}

/// Validates a resource name: starts with a letter, allows
/// `[A-Za-z0-9._/-]`, forbids `#`. `/` is permitted for provider/model
/// grouping.
pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.contains('#') {
        return Err(Error::validation(format!(
            "resource name '{name}' may not contain '#'"
        )));
    }
    if !resource_name_re().is_match(name) {
        return Err(Error::validation(format!(
            "resource name '{name}' must start with a letter and contain only \
             letters, digits, '.', '_', '/', or '-'"
        )));
    }
    Ok(())
}

/// Validates a limit name: as resource name, but `/` is not allowed, and the
/// reserved name `wcu` is rejected.
pub fn validate_limit_name(name: &str) -> Result<()> {
    if name.contains('#') {
        return Err(Error::validation(format!(
            "limit name '{name}' may not contain '#'"
        )));
    }
    if name.eq_ignore_ascii_case(RESERVED_LIMIT_NAME) {
        return Err(Error::validation(format!(
            "limit name '{RESERVED_LIMIT_NAME}' is reserved for internal use"
        )));
    }
    if !limit_name_re().is_match(name) {
        return Err(Error::validation(format!(
            "limit name '{name}' must start with a letter and contain only \
             letters, digits, '.', '_', or '-'"
        )));
    }
    Ok(())
}

/// Validates an entity ID. Entity IDs follow the same character-set rules as
/// resource names (caller-supplied free-form strings), with the additional
/// restriction that `#` is forbidden because it is the key-schema delimiter.
pub fn validate_entity_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::validation("entity id must not be empty"));
    }
    if id.contains('#') {
        return Err(Error::validation(format!(
            "entity id '{id}' may not contain '#'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stack_names() {
        assert!(validate_stack_name("my-stack-1").is_ok());
        assert!(validate_stack_name("1stack").is_err());
        assert!(validate_stack_name(&"a".repeat(56)).is_err());
    }

    #[test]
    fn resource_names_allow_slash() {
        assert!(validate_resource_name("openai/gpt-4o").is_ok());
        assert!(validate_resource_name("a.b_c-d/e").is_ok());
        assert!(validate_resource_name("bad#name").is_err());
        assert!(validate_resource_name("1bad").is_err());
    }

    #[test]
    fn limit_names_forbid_slash_and_reserved() {
        assert!(validate_limit_name("rpm").is_ok());
        assert!(validate_limit_name("tokens/sec").is_err());
        assert!(validate_limit_name("wcu").is_err());
        assert!(validate_limit_name("WCU").is_err());
    }
}
