use crate::shared_bytes::SharedBytes;

/// A key paired with its value.
///
/// `KeyValue::invalid` means "no such entry" and is the result of a lookup
/// that found nothing; it is never stored.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KeyValue {
    key: SharedBytes,
    value: SharedBytes,
}

impl KeyValue {
    pub fn new(key: impl Into<SharedBytes>, value: impl Into<SharedBytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The "no such entry" sentinel.
    pub fn invalid() -> Self {
        Self {
            key: SharedBytes::invalid(),
            value: SharedBytes::invalid(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.key.is_valid()
    }

    pub fn key(&self) -> &SharedBytes {
        &self.key
    }

    pub fn value(&self) -> &SharedBytes {
        &self.value
    }

    pub fn into_parts(self) -> (SharedBytes, SharedBytes) {
        (self.key, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_has_invalid_key() {
        assert!(!KeyValue::invalid().is_valid());
        assert!(KeyValue::new("k", "v").is_valid());
    }
}
