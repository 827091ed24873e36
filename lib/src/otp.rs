use std::{fmt::Display, str::FromStr};

use ballotbox_shared::Error;
use zeroize::Zeroize;

pub const LENGTH: usize = 6;

/// A one-time-password code as typed by the voter.
#[derive(Clone, Copy, PartialEq, Eq, Zeroize)]
pub struct OtpCode {
    code: [u8; LENGTH],
}

impl FromStr for OtpCode {
    type Err = Error;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let string = string.trim();
        if string.len() != LENGTH {
            return Err(Error::Validation(format!(
                "code must contain exactly {} digits",
                LENGTH
            )));
        }
        let mut code = [0u8; LENGTH];
        for (digit, c) in code.iter_mut().zip(string.chars()) {
            *digit = c
                .to_digit(10)
                .ok_or_else(|| Error::Validation("code must contain only digits".into()))?
                as u8;
        }
        Ok(Self { code })
    }
}

impl Display for OtpCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for digit in self.code {
            write!(formatter, "{}", digit)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for OtpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OtpCode(******)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_six_digits() {
        let code: OtpCode = " 012345 ".parse().unwrap();
        assert_eq!(code.to_string(), "012345");
    }

    #[test]
    fn rejects_wrong_length_and_non_digits() {
        assert!(matches!("12345".parse::<OtpCode>(), Err(Error::Validation(_))));
        assert!(matches!("1234567".parse::<OtpCode>(), Err(Error::Validation(_))));
        assert!(matches!("12a456".parse::<OtpCode>(), Err(Error::Validation(_))));
        assert!(matches!("१२३४५६".parse::<OtpCode>(), Err(Error::Validation(_))));
    }

    #[test]
    fn debug_hides_the_code() {
        let code: OtpCode = "987654".parse().unwrap();
        assert!(!format!("{:?}", code).contains("987654"));
    }
}
