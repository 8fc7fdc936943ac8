//! TOTP second factor: enrollment for signed-in users and step-up during sign-in.

pub mod challenge;
pub mod enrollment;

pub use challenge::{ChallengeError, MfaChallengeResolver};
pub use enrollment::{EnrollmentError, EnrollmentManager, EnrollmentPhase};

/// A one-time code as typed by the user: exactly six ASCII digits.
#[must_use]
pub fn is_six_digit_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::is_six_digit_code;

    #[test]
    fn six_digit_codes() {
        assert!(is_six_digit_code("012345"));
        assert!(!is_six_digit_code("12345"));
        assert!(!is_six_digit_code("1234567"));
        assert!(!is_six_digit_code("12a456"));
        assert!(!is_six_digit_code(""));
        assert!(!is_six_digit_code("١٢٣٤٥٦"));
    }
}
