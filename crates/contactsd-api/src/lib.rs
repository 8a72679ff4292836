pub mod envelope;
pub mod types;
pub mod validation;

pub use envelope::*;
pub use types::*;
pub use validation::*;
