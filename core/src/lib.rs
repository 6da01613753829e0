pub mod geometry;
pub mod rodrigues;

pub use geometry::*;
pub use rodrigues::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Ill-conditioned problem: {0}")]
    IllConditioned(String),

    #[error("Bad stereo pair: {0}")]
    BadStereoPair(String),

    #[error("Degenerate system: {0}")]
    DegenerateSystem(String),
}

pub type Result<T> = std::result::Result<T, Error>;
