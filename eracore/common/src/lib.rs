#[derive(Debug, Clone)]
pub struct EraError(pub String);

impl std::fmt::Display for EraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}
impl std::error::Error for EraError {}

pub type Result<T> = std::result::Result<T, EraError>;
