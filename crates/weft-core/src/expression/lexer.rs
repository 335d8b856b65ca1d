//! Tokenizer for the expression language.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Pipe,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Float(n) => n.to_string(),
            Self::Str(s) => format!("'{s}'"),
            Self::Ident(s) => s.clone(),
            Self::True => "true".into(),
            Self::False => "false".into(),
            Self::Null => "null".into(),
            Self::LParen => "(".into(),
            Self::RParen => ")".into(),
            Self::LBracket => "[".into(),
            Self::RBracket => "]".into(),
            Self::Comma => ",".into(),
            Self::Dot => ".".into(),
            Self::Pipe => "|".into(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::Star => "*".into(),
            Self::Slash => "/".into(),
            Self::Percent => "%".into(),
            Self::Bang => "!".into(),
            Self::EqEq => "==".into(),
            Self::NotEq => "!=".into(),
            Self::Lt => "<".into(),
            Self::Le => "<=".into(),
            Self::Gt => ">".into(),
            Self::Ge => ">=".into(),
            Self::AndAnd => "&&".into(),
            Self::OrOr => "||".into(),
            Self::Eof => "end of input".into(),
        }
    }
}

/// A token and the byte offset it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let token = match c {
            b'(' => single(&mut i, Token::LParen),
            b')' => single(&mut i, Token::RParen),
            b'[' => single(&mut i, Token::LBracket),
            b']' => single(&mut i, Token::RBracket),
            b',' => single(&mut i, Token::Comma),
            b'+' => single(&mut i, Token::Plus),
            b'-' => single(&mut i, Token::Minus),
            b'*' => single(&mut i, Token::Star),
            b'/' => single(&mut i, Token::Slash),
            b'%' => single(&mut i, Token::Percent),
            b'.' if !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                single(&mut i, Token::Dot)
            }
            b'!' => pair(bytes, &mut i, b'=', Token::NotEq, Token::Bang),
            b'<' => pair(bytes, &mut i, b'=', Token::Le, Token::Lt),
            b'>' => pair(bytes, &mut i, b'=', Token::Ge, Token::Gt),
            b'|' => pair(bytes, &mut i, b'|', Token::OrOr, Token::Pipe),
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Token::EqEq
                } else {
                    return Err(syntax(start, "expected '==' (assignment is not supported)"));
                }
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    i += 2;
                    Token::AndAnd
                } else {
                    return Err(syntax(start, "expected '&&'"));
                }
            }
            b'\'' | b'"' => lex_string(src, &mut i)?,
            b'0'..=b'9' | b'.' => lex_number(src, &mut i)?,
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
                {
                    i += 1;
                }
                match &src[start..i] {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    word => Token::Ident(word.to_string()),
                }
            }
            _ => {
                let ch = src[start..].chars().next().unwrap_or('?');
                return Err(syntax(start, format!("unexpected character '{ch}'")));
            }
        };
        tokens.push(Spanned { token, pos: start });
    }

    tokens.push(Spanned {
        token: Token::Eof,
        pos: src.len(),
    });
    Ok(tokens)
}

fn single(i: &mut usize, token: Token) -> Token {
    *i += 1;
    token
}

fn pair(bytes: &[u8], i: &mut usize, next: u8, double: Token, one: Token) -> Token {
    if bytes.get(*i + 1) == Some(&next) {
        *i += 2;
        double
    } else {
        *i += 1;
        one
    }
}

fn lex_string(src: &str, i: &mut usize) -> Result<Token, ExpressionError> {
    let start = *i;
    let mut chars = src[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(syntax(start, "unterminated string"));
    };

    let mut out = String::new();
    let mut escaped = false;
    for (offset, ch) in chars {
        if escaped {
            out.push(match ch {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            *i = start + offset + ch.len_utf8();
            return Ok(Token::Str(out));
        } else {
            out.push(ch);
        }
    }
    Err(syntax(start, "unterminated string"))
}

fn lex_number(src: &str, i: &mut usize) -> Result<Token, ExpressionError> {
    let bytes = src.as_bytes();
    let start = *i;
    let mut seen_dot = false;
    let mut seen_exp = false;

    while *i < bytes.len() {
        match bytes[*i] {
            b'0'..=b'9' => *i += 1,
            b'.' if !seen_dot && !seen_exp => {
                // `a[0].b` style: a dot followed by a non-digit ends the number
                if !bytes.get(*i + 1).is_some_and(u8::is_ascii_digit) {
                    break;
                }
                seen_dot = true;
                *i += 1;
            }
            b'e' | b'E' if !seen_exp => {
                seen_exp = true;
                *i += 1;
                if matches!(bytes.get(*i), Some(b'+' | b'-')) {
                    *i += 1;
                }
            }
            _ => break,
        }
    }

    let text = &src[start..*i];
    if !seen_dot && !seen_exp {
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Token::Int(n));
        }
    }
    text.parse::<f64>()
        .map(Token::Float)
        .map_err(|_| syntax(start, format!("invalid number '{text}'")))
}

fn syntax(pos: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        position: pos,
        message: message.into(),
    }
}
