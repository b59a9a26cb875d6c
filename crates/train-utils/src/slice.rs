use serde::{Deserialize, Serialize};
use train_core::{Error, Result};

/// Start/end/step selection over a sequence, with optional bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slice {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub step: Option<i64>,
}

/// Build a slice from optional bounds
pub fn create_slice(start: Option<i64>, end: Option<i64>, step: Option<i64>) -> Slice {
    Slice { start, end, step }
}

impl Slice {
    /// Resolve against a sequence of `len` items.
    ///
    /// Negative bounds count from the end, out-of-range bounds are clamped
    /// and missing bounds default according to the sign of the step.
    pub fn indices(&self, len: usize) -> Result<(i64, i64, i64)> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(Error::InvalidSlice {
                message: "slice step cannot be zero".to_string(),
            });
        }

        let len = len as i64;
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };

        let clamp = |bound: Option<i64>, default: i64| match bound {
            None => default,
            Some(b) if b < 0 => (b + len).max(lower),
            Some(b) => b.min(upper),
        };

        let start = clamp(self.start, if step < 0 { upper } else { lower });
        let end = clamp(self.end, if step < 0 { lower } else { upper });
        Ok((start, end, step))
    }

    /// Indices selected from a sequence of `len` items
    pub fn positions(&self, len: usize) -> Result<Vec<usize>> {
        let (start, end, step) = self.indices(len)?;
        let mut out = Vec::new();
        let mut next = Some(start);
        while let Some(i) = next {
            if (step > 0 && i >= end) || (step < 0 && i <= end) {
                break;
            }
            out.push(i as usize);
            next = i.checked_add(step);
        }
        Ok(out)
    }
}
