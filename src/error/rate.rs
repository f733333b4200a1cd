use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("Rate search ended without a single successful measurement.")]
    EmptySearch,
    #[error("Invalid loss bracket: min {min_loss_x100} > max {max_loss_x100} (x100 percent).")]
    InvalidBracket {
        min_loss_x100: u32,
        max_loss_x100: u32,
    },
}
