use std::fmt;

/// Associates an I/O resource registered with a [`Poll`](crate::base::Base)
/// with the [`Event`](crate::event::Event) it generates.
///
/// Comm points pick their own token values; `dns_netcore` itself never
/// interprets a token beyond round-tripping it through the selector, so a
/// `Base` is free to make `Token` an index into its own comm-point table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(token: Token) -> usize {
        token.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
