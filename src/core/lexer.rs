//! NF-003: Tokenizer for config expressions.

use super::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    /// Operator or punctuation, e.g. `**`, `//`, `==`, `(`.
    Sym(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub pos: usize,
}

// Longest first so `**` wins over `*`.
const SYMBOLS: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "<", ">", "(", ")", "[", "]",
    "{", "}", ",", ":", ".", "=",
];

/// Split an expression into tokens, ending with [`Tok::Eof`].
pub fn tokenize(src: &str) -> Result<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && next_is_digit(bytes, i)) {
            let (tok, end) = lex_number(src, i)?;
            tokens.push(Token { tok, pos: i });
            i = end;
            continue;
        }

        if c == '_' || c.is_ascii_alphabetic() {
            let start = i;
            while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            tokens.push(Token {
                tok: Tok::Name(src[start..i].to_string()),
                pos: start,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            let (s, end) = lex_string(src, i)?;
            tokens.push(Token {
                tok: Tok::Str(s),
                pos: i,
            });
            i = end;
            continue;
        }

        let sym = SYMBOLS
            .iter()
            .find(|s| src[i..].starts_with(**s))
            .ok_or_else(|| {
                Error::Resolution(format!("unexpected character '{}' at {} in {:?}", c, i, src))
            })?;
        tokens.push(Token {
            tok: Tok::Sym(sym),
            pos: i,
        });
        i += sym.len();
    }

    tokens.push(Token {
        tok: Tok::Eof,
        pos: src.len(),
    });
    Ok(tokens)
}

fn next_is_digit(bytes: &[u8], i: usize) -> bool {
    bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())
}

fn lex_number(src: &str, start: usize) -> Result<(Tok, usize)> {
    let bytes = src.as_bytes();
    let mut i = start;
    let mut is_float = false;

    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' && !next_is_name(bytes, i) {
        is_float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            is_float = true;
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    let text: String = src[start..i].chars().filter(|&c| c != '_').collect();
    let tok = if is_float {
        Tok::Float(text.parse().map_err(|_| {
            Error::Resolution(format!("invalid float literal {:?} at {}", text, start))
        })?)
    } else {
        Tok::Int(text.parse().map_err(|_| {
            Error::Resolution(format!("invalid integer literal {:?} at {}", text, start))
        })?)
    };
    Ok((tok, i))
}

// `1.real`-style attribute access on int literals is not supported; a dot
// followed by a letter still ends the number so `x[1].y` lexes sanely.
fn next_is_name(bytes: &[u8], i: usize) -> bool {
    bytes
        .get(i + 1)
        .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_')
}

fn lex_string(src: &str, start: usize) -> Result<(String, usize)> {
    let mut chars = src[start..].char_indices();
    let quote = chars.next().map(|(_, c)| c).unwrap_or('\'');
    let mut out = String::new();

    while let Some((off, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, esc) = chars.next().ok_or_else(|| {
                    Error::Resolution(format!("unterminated string at {}", start))
                })?;
                out.push(match esc {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => return Ok((out, start + off + 1)),
            c => out.push(c),
        }
    }
    Err(Error::Resolution(format!("unterminated string at {}", start)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_nf003_operators_longest_match() {
        assert_eq!(
            toks("a ** 2 // 3"),
            vec![
                Tok::Name("a".into()),
                Tok::Sym("**"),
                Tok::Int(2),
                Tok::Sym("//"),
                Tok::Int(3),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_nf003_numbers() {
        assert_eq!(toks("1_000 2.5 1e3 .5")[..4], [
            Tok::Int(1000),
            Tok::Float(2.5),
            Tok::Float(1000.0),
            Tok::Float(0.5)
        ]);
    }

    #[test]
    fn test_nf003_strings() {
        assert_eq!(
            toks(r#"'a\'b' "c""#)[..2],
            [Tok::Str("a'b".into()), Tok::Str("c".into())]
        );
        assert!(tokenize("'open").is_err());
    }

    #[test]
    fn test_nf003_rejects_unknown_char() {
        let err = tokenize("a $ b").unwrap_err();
        assert!(err.to_string().contains("unexpected character '$' at 2"));
    }

    #[test]
    fn test_nf003_positions() {
        let t = tokenize("x  + y").unwrap();
        assert_eq!(t[1].pos, 3);
        assert_eq!(t[2].pos, 5);
    }
}
