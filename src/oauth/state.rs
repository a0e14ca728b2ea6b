//! CSRF `state` parameter for the authorization redirect.

use crate::error::AuthError;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated state values
pub const STATE_LENGTH: usize = 48;

/// Generates a random alphanumeric state token.
///
/// `thread_rng` is a CSPRNG seeded from the OS.
pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LENGTH)
        .map(char::from)
        .collect()
}

/// Checks the state echoed back by the provider against the one we sent.
///
/// Comparison runs over every byte so timing does not leak the prefix length.
pub fn verify_state(expected: &str, received: &str) -> Result<(), AuthError> {
    let matches = expected.len() == received.len()
        && expected
            .bytes()
            .zip(received.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;

    if matches {
        Ok(())
    } else {
        Err(AuthError::AuthorizationFailed(
            "state mismatch - possible CSRF attack".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_state_shape() {
        let state = generate_state();
        assert_eq!(state.len(), STATE_LENGTH);
        assert!(state.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generated_states_differ() {
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn test_verify_state() {
        assert!(verify_state("xyz", "xyz").is_ok());

        let err = verify_state("xyz", "xyw").unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationFailed(_)));

        assert!(verify_state("xyz", "xyzz").is_err());
        assert!(verify_state("xyz", "").is_err());
    }
}
