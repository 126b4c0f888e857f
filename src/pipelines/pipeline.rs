//! Pipeline trait.
use crate::error::Error;

/// Implemented by each pipeline; generic over the return type so pipelines
/// with custom reports can use the trait as well.
pub trait Pipeline<T> {
    fn run(&self) -> Result<T, Error>;
}
