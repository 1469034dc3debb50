use serde::Serialize;

/// Logged-in identity and active account context.
///
/// A live channel is wanted exactly when `wants_channel()` holds; the
/// connection manager never consults these flags directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(skip)]
    token: Option<String>,
    account_id: Option<String>,
    logged_in: bool,
    logged_out: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// A login without an account keeps one chosen before login.
    pub fn login(&mut self, token: impl Into<String>, account_id: Option<String>) {
        self.token = Some(token.into());
        self.account_id = normalize_account(account_id.or(self.account_id.take()));
        self.logged_in = true;
        self.logged_out = false;
    }

    /// Returns the previous account id.
    pub fn set_account(&mut self, account_id: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.account_id, normalize_account(account_id))
    }

    /// The API client hands back a fresh token on every response.
    pub fn rotate_token(&mut self, token: impl Into<String>) {
        if self.logged_in {
            self.token = Some(token.into());
        }
    }

    /// Clears token and account; returns the account id that was active.
    pub fn logout(&mut self) -> Option<String> {
        self.token = None;
        self.logged_in = false;
        self.logged_out = true;
        self.account_id.take()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    #[cfg(test)]
    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn wants_channel(&self) -> bool {
        self.logged_in && self.account_id.is_some()
    }
}

fn normalize_account(account_id: Option<String>) -> Option<String> {
    account_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}
