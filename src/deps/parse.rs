//! Dependency atom and expression parsing.
//!
//! The grammar, smallest pieces first:
//!
//! ```text
//! atom    := NAME [ OP VERSION | '(' OP VERSION ')' ]
//! or      := primary ( '|' primary )*        # '||' is accepted for '|'
//! and     := or ( ',' or )*
//! primary := '(' and ')' | atom
//! ```
//!
//! Commas conjoin, `|` disjoins, and OR binds tighter than AND, so
//! `a | b, c` means `(a OR b) AND c`.

use crate::deps::version::satisfies;
use crate::error::{LpmError, Result};
use serde::{Deserialize, Serialize};

/// One name plus an optional version comparison.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Atom {
    /// Package or capability name.
    pub name: String,
    /// Comparison operator; empty means any version.
    #[serde(default)]
    pub op: String,
    /// Right-hand version of the comparison; empty with an empty op.
    #[serde(default)]
    pub version: String,
}

impl Atom {
    /// The constraint string understood by [`crate::deps::satisfies`].
    #[must_use]
    pub fn constraint(&self) -> String {
        if self.op.is_empty() {
            String::new()
        } else {
            format!("{}{}", self.op, self.version)
        }
    }

    /// What: Check whether a concrete version satisfies this atom.
    ///
    /// Details:
    /// - An atom without an operator matches every version.
    pub fn matches_version(&self, version: &str) -> Result<bool> {
        if self.op.is_empty() {
            return Ok(true);
        }
        satisfies(version, &self.constraint())
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.op.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{}{}", self.name, self.op, self.version)
        }
    }
}

/// A parsed dependency expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum DepExpr {
    /// A single atom.
    Atom(Atom),
    /// Conjunction: every branch must hold.
    And(Vec<DepExpr>),
    /// Disjunction: at least one branch must hold.
    Or(Vec<DepExpr>),
}

impl DepExpr {
    /// What: Flatten the expression into conjuncts.
    ///
    /// Output:
    /// - One entry per top-level AND branch; a non-AND expression yields a
    ///   single conjunct. The resolver emits one CNF clause per conjunct.
    #[must_use]
    pub fn conjuncts(&self) -> Vec<&DepExpr> {
        match self {
            Self::And(parts) => parts.iter().flat_map(DepExpr::conjuncts).collect(),
            other => vec![other],
        }
    }

    /// What: Collect the atoms of a (possibly nested) disjunction.
    ///
    /// Output:
    /// - Every atom reachable without crossing an AND node.
    #[must_use]
    pub fn or_atoms(&self) -> Vec<&Atom> {
        match self {
            Self::Atom(atom) => vec![atom],
            Self::Or(parts) => parts.iter().flat_map(DepExpr::or_atoms).collect(),
            Self::And(_) => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Or,
    Op(String),
    Ident(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
            Self::Comma => ",".to_string(),
            Self::Or => "|".to_string(),
            Self::Op(op) => op.clone(),
            Self::Ident(name) => name.clone(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '*' | ':')
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                tokens.push(Token::Or);
            }
            '>' | '<' | '=' | '~' => {
                chars.next();
                let mut op = c.to_string();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    op.push('=');
                }
                if op == "~" {
                    return Err(LpmError::UnexpectedToken("~".to_string()));
                }
                tokens.push(Token::Op(op));
            }
            c if is_ident_char(c) => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_char(c) {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(LpmError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.next() {
            Some(Token::RParen) => Ok(()),
            Some(other) => Err(LpmError::UnexpectedToken(other.describe())),
            None => Err(LpmError::UnexpectedToken("end of input".to_string())),
        }
    }

    fn parse_atom(&mut self) -> Result<Atom> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(other) => return Err(LpmError::UnexpectedToken(other.describe())),
            None => return Err(LpmError::InvalidAtom(String::new())),
        };
        // Inline clause: `name>=1.2`.
        if let Some(Token::Op(_)) = self.peek() {
            let Some(Token::Op(op)) = self.next() else {
                return Err(LpmError::InvalidAtom(name));
            };
            let version = match self.next() {
                Some(Token::Ident(version)) => version,
                _ => return Err(LpmError::InvalidAtom(format!("{name}{op}"))),
            };
            return Ok(Atom { name, op, version });
        }
        // Parenthesized clause: `name (>= 1.2)`. A plain `(` after a name is
        // only ever a version clause, so require an operator inside.
        if self.peek() == Some(&Token::LParen)
            && matches!(self.peek_at(1), Some(Token::Op(_)))
        {
            self.next();
            let Some(Token::Op(op)) = self.next() else {
                return Err(LpmError::InvalidAtom(name));
            };
            let version = match self.next() {
                Some(Token::Ident(version)) => version,
                _ => return Err(LpmError::InvalidAtom(format!("{name}{op}"))),
            };
            self.expect_rparen()?;
            return Ok(Atom { name, op, version });
        }
        Ok(Atom { name, op: String::new(), version: String::new() })
    }

    fn parse_primary(&mut self) -> Result<DepExpr> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.parse_and()?;
            self.expect_rparen()?;
            return Ok(inner);
        }
        Ok(DepExpr::Atom(self.parse_atom()?))
    }

    fn parse_or(&mut self) -> Result<DepExpr> {
        let mut parts = vec![self.parse_primary()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            parts.push(self.parse_primary()?);
        }
        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(DepExpr::Or(parts))
        }
    }

    fn parse_and(&mut self) -> Result<DepExpr> {
        let mut parts = vec![self.parse_or()?];
        while self.peek() == Some(&Token::Comma) {
            self.next();
            parts.push(self.parse_or()?);
        }
        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(DepExpr::And(parts))
        }
    }
}

/// What: Parse a full dependency expression.
///
/// Inputs:
/// - `text`: Expression such as `"libfoo>=1.2, bar | baz"`.
///
/// Output:
/// - The parsed [`DepExpr`] tree.
///
/// # Errors
///
/// Returns `UnexpectedToken` on stray characters, `InvalidAtom` on a
/// malformed atom, and `TrailingInput` when tokens remain after the
/// top-level AND.
///
/// # Example
///
/// ```
/// use lpm::deps::{DepExpr, parse_dep_expr};
///
/// let expr = parse_dep_expr("a >= 1.0, b | c").unwrap();
/// assert_eq!(expr.conjuncts().len(), 2);
/// ```
pub fn parse_dep_expr(text: &str) -> Result<DepExpr> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(LpmError::InvalidAtom(text.to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_and()?;
    if let Some(extra) = parser.peek() {
        return Err(LpmError::TrailingInput(extra.describe()));
    }
    Ok(expr)
}

/// What: Parse a single dependency atom.
///
/// Inputs:
/// - `text`: Atom such as `"glibc"`, `"B>=1"`, or `"openssl (>= 3.0)"`.
///
/// Output:
/// - The parsed [`Atom`].
///
/// # Errors
///
/// Returns the grammar errors of [`parse_dep_expr`], plus `InvalidAtom` when
/// the input is a compound expression rather than one atom.
pub fn parse_atom(text: &str) -> Result<Atom> {
    match parse_dep_expr(text)? {
        DepExpr::Atom(atom) => Ok(atom),
        _ => Err(LpmError::InvalidAtom(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_atom() {
        let atom = parse_atom("glibc").unwrap();
        assert_eq!(atom.name, "glibc");
        assert!(atom.op.is_empty());
        assert!(atom.matches_version("0.1").unwrap());
    }

    #[test]
    fn test_parse_inline_clause() {
        let atom = parse_atom("B>=1").unwrap();
        assert_eq!(atom.name, "B");
        assert_eq!(atom.op, ">=");
        assert_eq!(atom.version, "1");
        assert!(atom.matches_version("1.5").unwrap());
        assert!(!atom.matches_version("0.9").unwrap());
    }

    #[test]
    fn test_parse_parenthesized_clause() {
        let atom = parse_atom("openssl (>= 3.0)").unwrap();
        assert_eq!(atom.name, "openssl");
        assert_eq!(atom.op, ">=");
        assert_eq!(atom.version, "3.0");
    }

    #[test]
    fn test_parse_compatible_and_wildcard_ops() {
        let atom = parse_atom("py~=3.11").unwrap();
        assert!(atom.matches_version("3.12").unwrap());
        assert!(!atom.matches_version("4.0").unwrap());
        let atom = parse_atom("gtk==4.*").unwrap();
        assert!(atom.matches_version("4.2").unwrap());
    }

    #[test]
    fn test_and_over_or_precedence() {
        // `a | b, c` parses as (a OR b) AND c.
        let expr = parse_dep_expr("a | b, c").unwrap();
        let conjuncts = expr.conjuncts();
        assert_eq!(conjuncts.len(), 2);
        assert_eq!(conjuncts[0].or_atoms().len(), 2);
        assert_eq!(conjuncts[1].or_atoms().len(), 1);
    }

    #[test]
    fn test_double_pipe_alias() {
        let a = parse_dep_expr("x | y").unwrap();
        let b = parse_dep_expr("x || y").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_grouping() {
        let expr = parse_dep_expr("(a, b) | c").unwrap();
        // The group is an AND inside an OR; or_atoms stops at AND nodes.
        match expr {
            DepExpr::Or(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_input_rejected() {
        let err = parse_dep_expr("a b").unwrap_err();
        assert!(matches!(err, crate::error::LpmError::TrailingInput(_)));
    }

    #[test]
    fn test_stray_character_rejected() {
        let err = parse_dep_expr("a & b").unwrap_err();
        assert!(matches!(err, crate::error::LpmError::UnexpectedToken(_)));
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(parse_dep_expr("").is_err());
        assert!(parse_dep_expr("   ").is_err());
    }

    #[test]
    fn test_compound_rejected_as_single_atom() {
        assert!(parse_atom("a, b").is_err());
        assert!(parse_atom("a | b").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let atom = parse_atom("zlib>=1.2.11").unwrap();
        assert_eq!(atom.to_string(), "zlib>=1.2.11");
        assert_eq!(parse_atom(&atom.to_string()).unwrap(), atom);
    }
}
