//! Tokenizer for policy expressions

use super::ExprError;

/// A lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Integer literal
    Int(i64),
    /// Floating point literal
    Float(f64),
    /// String literal (quotes removed, escapes resolved)
    Str(String),
    /// Identifier (fact root, let binding or function name)
    Ident(String),
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
    /// `in`
    In,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `,`
    Comma,
    /// `:`
    Colon,
    /// `.`
    Dot,
    /// `!`
    Not,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
}

/// A token with its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token
    pub token: Token,
    /// Byte offset of the first character
    pub offset: usize,
}

/// Split an expression into tokens
pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = match c {
            '(' => single(&mut chars, Token::LParen),
            ')' => single(&mut chars, Token::RParen),
            '[' => single(&mut chars, Token::LBracket),
            ']' => single(&mut chars, Token::RBracket),
            '{' => single(&mut chars, Token::LBrace),
            '}' => single(&mut chars, Token::RBrace),
            ',' => single(&mut chars, Token::Comma),
            ':' => single(&mut chars, Token::Colon),
            '.' => single(&mut chars, Token::Dot),
            '+' => single(&mut chars, Token::Plus),
            '-' => single(&mut chars, Token::Minus),
            '*' => single(&mut chars, Token::Star),
            '/' => single(&mut chars, Token::Slash),
            '!' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '=' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_none() {
                    return Err(ExprError::syntax(offset, "expected '==' (assignment is not supported)"));
                }
                Token::Eq
            }
            '<' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '&' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '&').is_none() {
                    return Err(ExprError::syntax(offset, "expected '&&'"));
                }
                Token::And
            }
            '|' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '|').is_none() {
                    return Err(ExprError::syntax(offset, "expected '||'"));
                }
                Token::Or
            }
            '"' | '\'' => lex_string(&mut chars, offset, c)?,
            c if c.is_ascii_digit() => lex_number(&mut chars, offset)?,
            c if c.is_alphabetic() || c == '_' => lex_word(&mut chars),
            other => {
                return Err(ExprError::syntax(
                    offset,
                    format!("unexpected character '{other}'"),
                ))
            }
        };

        tokens.push(Spanned { token, offset });
    }

    Ok(tokens)
}

type Chars<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn single(chars: &mut Chars<'_>, token: Token) -> Token {
    chars.next();
    token
}

fn lex_string(chars: &mut Chars<'_>, start: usize, quote: char) -> Result<Token, ExprError> {
    chars.next();
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err(ExprError::syntax(start, "unterminated string literal")),
            Some((_, c)) if c == quote => return Ok(Token::Str(out)),
            Some((pos, '\\')) => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                Some((_, '\'')) => out.push('\''),
                Some((_, other)) => {
                    return Err(ExprError::syntax(pos, format!("unknown escape '\\{other}'")))
                }
                None => return Err(ExprError::syntax(start, "unterminated string literal")),
            },
            Some((_, c)) => out.push(c),
        }
    }
}

fn lex_number(chars: &mut Chars<'_>, start: usize) -> Result<Token, ExprError> {
    let mut text = String::new();
    let mut is_float = false;
    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            chars.next();
        } else if c == '.' && !is_float {
            // `1.x` is not a number followed by a field; require a digit after the dot
            let mut lookahead = chars.clone();
            lookahead.next();
            if !lookahead.peek().is_some_and(|&(_, d)| d.is_ascii_digit()) {
                break;
            }
            is_float = true;
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|e| ExprError::syntax(start, format!("invalid number '{text}': {e}")))
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|e| ExprError::syntax(start, format!("invalid number '{text}': {e}")))
    }
}

fn lex_word(chars: &mut Chars<'_>) -> Token {
    let mut word = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    match word.as_str() {
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        "in" => Token::In,
        _ => Token::Ident(word),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a == b && !c || d != 1"),
            vec![
                Token::Ident("a".into()),
                Token::Eq,
                Token::Ident("b".into()),
                Token::And,
                Token::Not,
                Token::Ident("c".into()),
                Token::Or,
                Token::Ident("d".into()),
                Token::Ne,
                Token::Int(1),
            ]
        );
    }

    #[test]
    fn test_strings_with_both_quotes_and_escapes() {
        assert_eq!(
            kinds(r#"labels["kubernaut.ai/env"] 'it\'s'"#),
            vec![
                Token::Ident("labels".into()),
                Token::LBracket,
                Token::Str("kubernaut.ai/env".into()),
                Token::RBracket,
                Token::Str("it's".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("42 0.95"), vec![Token::Int(42), Token::Float(0.95)]);
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("x in [true, false, null]"),
            vec![
                Token::Ident("x".into()),
                Token::In,
                Token::LBracket,
                Token::True,
                Token::Comma,
                Token::False,
                Token::Comma,
                Token::Null,
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn test_errors_carry_offset() {
        match tokenize("a = b").unwrap_err() {
            ExprError::Syntax { offset, .. } => assert_eq!(offset, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a & b").is_err());
        assert!(tokenize("a # b").is_err());
    }
}
