pub mod circuit;

pub use circuit::{CircuitBreaker, CircuitState};
