use std::collections::BTreeMap;

/// Collects field level validation failures for a single request.
#[derive(Debug, Default)]
pub struct Validator {
    pub errors: BTreeMap<String, String>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Records `message` for `key` unless the field already has an error.
    pub fn add_error(&mut self, key: &str, message: &str) {
        self.errors
            .entry(key.to_string())
            .or_insert_with(|| message.to_string());
    }

    pub fn check(&mut self, ok: bool, key: &str, message: &str) {
        if !ok {
            self.add_error(key, message);
        }
    }

    pub fn into_errors(self) -> BTreeMap<String, String> {
        self.errors
    }
}

pub fn permitted_value<T: PartialEq>(value: &T, permitted: &[T]) -> bool {
    permitted.contains(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_per_field_wins() {
        let mut v = Validator::new();
        assert!(v.valid());

        v.check(false, "title", "must be provided");
        v.check(false, "title", "must not be more than 250 bytes long");
        v.check(true, "description", "never recorded");

        assert!(!v.valid());
        assert_eq!(v.errors.len(), 1);
        assert_eq!(v.errors["title"], "must be provided");
    }

    #[test]
    fn permitted_values() {
        assert!(permitted_value(&"id", &["id", "-id"]));
        assert!(!permitted_value(&"version", &["id", "-id"]));
    }
}
