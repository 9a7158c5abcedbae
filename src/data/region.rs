use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnetError};

/// Per-sample region of interest used by the region-masked losses.
///
/// `x` runs along the image height and `y` along the width. The `s*` fields describe
/// a smaller box nested in the outer one. An all-zero box means "no region".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBox {
    pub x_min: i64,
    pub x_max: i64,
    pub y_min: i64,
    pub y_max: i64,
    pub sx_min: i64,
    pub sx_max: i64,
    pub sy_min: i64,
    pub sy_max: i64,
}

impl RegionBox {
    pub const LEN: usize = 8;

    pub fn from_slice(values: &[i64]) -> Result<Self> {
        if values.len() != Self::LEN {
            return Err(UnetError::InvalidRegion(format!(
                "expected {} integers, got {}",
                Self::LEN,
                values.len()
            )));
        }
        Ok(Self {
            x_min: values[0],
            x_max: values[1],
            y_min: values[2],
            y_max: values[3],
            sx_min: values[4],
            sx_max: values[5],
            sy_min: values[6],
            sy_max: values[7],
        })
    }

    pub fn to_array(&self) -> [i64; Self::LEN] {
        [
            self.x_min,
            self.x_max,
            self.y_min,
            self.y_max,
            self.sx_min,
            self.sx_max,
            self.sy_min,
            self.sy_max,
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.to_array().iter().all(|&v| v == 0)
    }

    /// Checks ordering and bounds against an image of `height` x `width`.
    pub fn validate(&self, height: usize, width: usize) -> Result<()> {
        if let Some(v) = self.to_array().iter().find(|&&v| v < 0) {
            return Err(UnetError::InvalidRegion(format!("negative coordinate {v} in {self:?}")));
        }
        let pairs = [
            ("x", self.x_min, self.x_max, height),
            ("y", self.y_min, self.y_max, width),
            ("smallest x", self.sx_min, self.sx_max, height),
            ("smallest y", self.sy_min, self.sy_max, width),
        ];
        for (axis, min, max, limit) in pairs {
            if min > max {
                return Err(UnetError::InvalidRegion(format!(
                    "{axis} range {min}..{max} is inverted"
                )));
            }
            if max as usize > limit {
                return Err(UnetError::InvalidRegion(format!(
                    "{axis} range {min}..{max} exceeds image extent {limit}"
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for RegionBox {
    type Err = UnetError;

    /// Parses eight integers separated by whitespace or commas.
    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<i64>()
                    .map_err(|e| UnetError::InvalidRegion(format!("`{token}`: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_slice(&values)
    }
}

/// Half-open index range `start..end` clamped into `0..limit`; empty when inverted.
pub fn clamped_span(start: i64, end: i64, limit: usize) -> Range<usize> {
    let clamp = |v: i64| v.clamp(0, limit as i64) as usize;
    let (start, end) = (clamp(start), clamp(end));
    if start >= end {
        0..0
    } else {
        start..end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whitespace_and_commas() {
        let region: RegionBox = "10, 40 5 60\n12,20,30,35".parse().unwrap();
        assert_eq!(region.to_array(), [10, 40, 5, 60, 12, 20, 30, 35]);
        assert!(region.validate(64, 64).is_ok());
    }

    #[test]
    fn rejects_wrong_arity_and_garbage() {
        assert!(matches!("1 2 3".parse::<RegionBox>(), Err(UnetError::InvalidRegion(_))));
        assert!(matches!(
            "1 2 3 4 5 6 7 x".parse::<RegionBox>(),
            Err(UnetError::InvalidRegion(_))
        ));
    }

    #[test]
    fn inverted_or_out_of_bounds_boxes_fail_fast() {
        let inverted = RegionBox::from_slice(&[5, 2, 0, 4, 0, 0, 0, 0]).unwrap();
        assert!(matches!(inverted.validate(8, 8), Err(UnetError::InvalidRegion(_))));

        let outside = RegionBox::from_slice(&[0, 4, 0, 9, 0, 0, 0, 0]).unwrap();
        assert!(matches!(outside.validate(8, 8), Err(UnetError::InvalidRegion(_))));

        let negative = RegionBox::from_slice(&[-1, 4, 0, 4, 0, 0, 0, 0]).unwrap();
        assert!(matches!(negative.validate(8, 8), Err(UnetError::InvalidRegion(_))));
    }

    #[test]
    fn zero_box_is_valid_and_empty() {
        let region = RegionBox::default();
        assert!(region.is_empty());
        assert!(region.validate(4, 4).is_ok());
    }

    #[test]
    fn spans_clamp_and_collapse() {
        assert_eq!(clamped_span(-2, 3, 10), 0..3);
        assert_eq!(clamped_span(8, 14, 10), 8..10);
        assert_eq!(clamped_span(12, 14, 10), 0..0);
        assert_eq!(clamped_span(5, 5, 10), 0..0);
    }
}
