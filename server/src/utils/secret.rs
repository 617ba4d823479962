use rand::distributions::Alphanumeric;
use rand::Rng;

const GUEST_SECRET_LEN: usize = 32;

/// Random token that lets a ticket link be opened without signing in.
pub fn generate_guest_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GUEST_SECRET_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_secrets_are_long_and_distinct() {
        let a = generate_guest_secret();
        let b = generate_guest_secret();
        assert_eq!(a.len(), GUEST_SECRET_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
