use train_core::{Error, Result};

/// Accepts an optimizer list from configuration and returns its only entry.
///
/// Chaining several optimizers is not supported; anything other than
/// exactly one entry is an error.
pub fn opt_chain<O>(transformations: Vec<O>) -> Result<O> {
    let count = transformations.len();
    let mut iter = transformations.into_iter();
    match (iter.next(), iter.next()) {
        (Some(only), None) => Ok(only),
        _ => Err(Error::Unsupported {
            message: format!(
                "optimizer chaining is not supported (got {} optimizers); use a single custom optimizer",
                count
            ),
        }),
    }
}
