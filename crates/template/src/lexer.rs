//! Tokenizer for the expression sublanguage inside `{{ … }}` and `{% … %}`.

use crate::error::TemplateError;

/// A single expression token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),

    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Pipe,

    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    And,
    Or,
    Not,
    In,
    True,
    False,
}

/// Tokenize an expression string (the inside of a tag or output block).
pub fn tokenize(src: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(TemplateError::syntax(i, "expected '=='"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(TemplateError::syntax(i, "expected '!='"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::LtEq);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::GtEq);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut out = String::new();
                let start = i;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(TemplateError::syntax(start, "unterminated string"))
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => out.push('\n'),
                                Some('t') => out.push('\t'),
                                Some(&esc) => out.push(esc),
                                None => {
                                    return Err(TemplateError::syntax(
                                        start,
                                        "unterminated string",
                                    ))
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            out.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(out));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i < chars.len()
                    && chars[i] == '.'
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
                {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let v = text
                        .parse::<f64>()
                        .map_err(|_| TemplateError::syntax(start, "bad number"))?;
                    tokens.push(Token::Float(v));
                } else {
                    let v = text
                        .parse::<i64>()
                        .map_err(|_| TemplateError::syntax(start, "bad number"))?;
                    tokens.push(Token::Int(v));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(TemplateError::syntax(
                    i,
                    format!("unexpected character '{other}'"),
                ))
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_tokens() {
        let toks = tokenize("name | default('x')").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("name".into()),
                Token::Pipe,
                Token::Ident("default".into()),
                Token::LParen,
                Token::Str("x".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn numbers_and_operators() {
        let toks = tokenize("1 + 2.5 >= x").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Int(1),
                Token::Plus,
                Token::Float(2.5),
                Token::GtEq,
                Token::Ident("x".into()),
            ]
        );
    }

    #[test]
    fn keywords() {
        let toks = tokenize("not a and b in c").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Not,
                Token::Ident("a".into()),
                Token::And,
                Token::Ident("b".into()),
                Token::In,
                Token::Ident("c".into()),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let toks = tokenize(r#""a\"b\n""#).unwrap();
        assert_eq!(toks, vec![Token::Str("a\"b\n".into())]);
    }

    #[test]
    fn rejects_stray_equals() {
        assert!(tokenize("a = b").is_err());
    }
}
