use crate::error::ConfigError;

/// Request and part limits forwarded to the tokenizer.
///
/// `None` means unlimited. Enforcement happens in the tokenizer, which
/// reports truncation and limit events the engine turns into errors.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    /// Maximum field name size in bytes.
    pub field_name_size: Option<usize>,
    /// Maximum text field value size in bytes.
    pub field_size: Option<usize>,
    /// Maximum number of text fields.
    pub fields: Option<usize>,
    /// Maximum size in bytes of a single file.
    pub file_size: Option<u64>,
    /// Maximum number of file parts.
    pub files: Option<usize>,
    /// Maximum number of parts (fields plus files).
    pub parts: Option<usize>,
    /// Maximum number of header lines per part.
    pub header_pairs: Option<usize>,
}

impl Limits {
    /// Creates a permissive limits configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `name` exceeds the configured field name size.
    pub fn field_name_too_long(&self, name: &str) -> bool {
        self.field_name_size.is_some_and(|max| name.len() > max)
    }

    /// Rejects limits explicitly configured to zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, Option<u64>); 7] = [
            ("field_name_size", self.field_name_size.map(|v| v as u64)),
            ("field_size", self.field_size.map(|v| v as u64)),
            ("fields", self.fields.map(|v| v as u64)),
            ("file_size", self.file_size),
            ("files", self.files.map(|v| v as u64)),
            ("parts", self.parts.map(|v| v as u64)),
            ("header_pairs", self.header_pairs.map(|v| v as u64)),
        ];

        for (limit, value) in checks {
            if value == Some(0) {
                return Err(ConfigError::InvalidLimitValue { limit });
            }
        }

        Ok(())
    }
}
