//! Credentials for a connection attempt.

use std::fmt;

use zeroize::Zeroizing;

/// Credentials presented to the relay for one connection attempt.
///
/// The secret is wiped from memory on drop and never printed.
///
/// 一次连接尝试中向中继提交的凭据。
#[derive(Clone)]
pub struct Identity {
    nickname: String,
    secret: Zeroizing<String>,
}

impl Identity {
    pub fn new(nickname: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("nickname", &self.nickname)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_the_secret() {
        let identity = Identity::new("ana", "hunter2");
        let printed = format!("{identity:?}");
        assert!(printed.contains("ana"));
        assert!(!printed.contains("hunter2"));
        assert_eq!(identity.secret(), "hunter2");
    }
}
