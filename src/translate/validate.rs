//! Request validation. Runs before any engine work; first failing rule wins.

/// Rejection reasons. The `Display` text is returned to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("No text provided")]
    Empty,
    #[error("Text exceeds maximum length of {limit}")]
    TooLong { limit: usize },
    #[error("Source and target languages must be different")]
    IdenticalLanguages,
}

/// Stateless validator. Text length is counted in Unicode scalar values.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    max_text_length: usize,
}

impl Validator {
    pub fn new(max_text_length: usize) -> Self {
        Self { max_text_length }
    }

    pub fn max_text_length(&self) -> usize {
        self.max_text_length
    }

    pub fn validate(&self, text: &str, source: &str, target: &str) -> Result<(), ValidationError> {
        if text.is_empty() {
            return Err(ValidationError::Empty);
        }
        // Bail out of the count as soon as the limit is crossed.
        if text.chars().nth(self.max_text_length).is_some() {
            return Err(ValidationError::TooLong {
                limit: self.max_text_length,
            });
        }
        if source == target {
            return Err(ValidationError::IdenticalLanguages);
        }
        Ok(())
    }
}
