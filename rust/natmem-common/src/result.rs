pub type Result<T> = std::result::Result<T, crate::error::Error>;

#[macro_export]
macro_rules! verify_arg {
    ($name:expr, $expr:expr) => {{
        let result = $expr;
        $crate::result::verify_arg(result, stringify!($name), stringify!($expr))?;
    }};
}

#[inline]
pub fn verify_arg(predicate: bool, name: &str, condition: &str) -> Result<()> {
    if predicate {
        Ok(())
    } else {
        invalid_arg(name, condition)
    }
}

/// Verifies that `[index, index + length)` lies within `[0, size)`.
///
/// Overflowing ranges are treated as out of bounds.
#[inline]
pub fn verify_range(index: u64, length: u64, size: u64) -> Result<()> {
    match index.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => out_of_range(index, length, size),
    }
}

#[cold]
pub fn invalid_arg(name: &str, condition: &str) -> Result<()> {
    Err(crate::error::ErrorKind::InvalidArgument {
        name: name.to_string(),
        message: condition.to_string(),
    }
    .into())
}

#[cold]
pub fn out_of_range(index: u64, length: u64, size: u64) -> Result<()> {
    Err(crate::error::Error::out_of_range(index, length, size))
}
