//! Client-chosen tokens used to correlate requests with their handles.

use std::fmt;

use rand::seq::SliceRandom;

/// Number of letters in a generated token.
pub const TOKEN_LEN: usize = 8;

const ALPHABET: &[u8; 26] = b"abcdefghijklmnopqrstuvwxyz";

/// Opaque request token.
///
/// Tokens end up both in the call options and as the last segment of the
/// request object path, so they only contain lowercase ASCII letters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces tokens of [`TOKEN_LEN`] distinct letters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenGenerator;

impl TokenGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn next(&self) -> Token {
        let mut rng = rand::thread_rng();
        let token = ALPHABET
            .choose_multiple(&mut rng, TOKEN_LEN)
            .map(|&b| b as char)
            .collect();
        Token(token)
    }
}
