use crate::error::{Error, Result};
use std::fmt;

/// Causal masking mode of an attention call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CustomMaskType {
    #[default]
    NoMask = 0,
    /// Query `i` sees keys `<= i`; the diagonal starts at the top-left corner.
    CausalFromTopLeft = 1,
    /// The diagonal ends at the bottom-right corner, shifted by `seqlen_k - seqlen_q`.
    CausalFromBottomRight = 2,
}

impl CustomMaskType {
    pub const ALL: [CustomMaskType; 3] = [
        CustomMaskType::NoMask,
        CustomMaskType::CausalFromTopLeft,
        CustomMaskType::CausalFromBottomRight,
    ];

    /// Integer code used on the operator boundary and as a const generic argument.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CustomMaskType::NoMask),
            1 => Some(CustomMaskType::CausalFromTopLeft),
            2 => Some(CustomMaskType::CausalFromBottomRight),
            _ => None,
        }
    }

    pub const fn is_causal(self) -> bool {
        !matches!(self, CustomMaskType::NoMask)
    }
}

impl TryFrom<i64> for CustomMaskType {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        u8::try_from(value)
            .ok()
            .and_then(CustomMaskType::from_code)
            .ok_or_else(|| Error::UnmappedDispatchValue {
                what: "Invalid custom_mask_type value",
                value: value.to_string(),
            })
    }
}

impl fmt::Display for CustomMaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomMaskType::NoMask => f.write_str("no_mask"),
            CustomMaskType::CausalFromTopLeft => f.write_str("causal_top_left"),
            CustomMaskType::CausalFromBottomRight => f.write_str("causal_bottom_right"),
        }
    }
}
