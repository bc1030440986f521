use crate::storage::StoreError;

pub const MAX_RELATION_NAME_LEN: usize = 64;

/// Relation names double as file names inside a store, so they are limited to
/// ASCII letters, digits and underscores, and may not start with a digit.
pub fn validate_relation_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason| {
        Err(StoreError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    let Some(first) = name.chars().next() else {
        return invalid("name is empty");
    };
    if name.len() > MAX_RELATION_NAME_LEN {
        return invalid("name is longer than 64 characters");
    }
    if first.is_ascii_digit() {
        return invalid("name starts with a digit");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return invalid("only ASCII letters, digits and '_' are allowed");
    }
    Ok(())
}
