use train_core::Value;

/// Checks if a given value is a scalar.
///
/// Plain numbers are scalars; tensors are scalars when they have no
/// dimensions or at most one element.
pub fn is_scalar(value: &Value) -> bool {
    value.is_scalar()
}
