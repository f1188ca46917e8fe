use crate::parser::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Function,
    If,
    Else,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Newline,
    /// `<-`
    Arrow,
    /// `=`
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Colon,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut lexer = Lexer {
        source,
        chars: source.char_indices().peekable(),
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    tokens: Vec<Spanned>,
}

impl Lexer<'_> {
    fn run(&mut self) -> Result<(), ParseError> {
        while let Some(&(offset, c)) = self.chars.peek() {
            let token = match c {
                ' ' | '\t' | '\r' => {
                    self.chars.next();
                    continue;
                }
                '#' => {
                    while self.chars.next_if(|&(_, c)| c != '\n').is_some() {}
                    continue;
                }
                '\n' => self.single(Token::Newline),
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '{' => self.single(Token::LBrace),
                '}' => self.single(Token::RBrace),
                ',' => self.single(Token::Comma),
                ';' => self.single(Token::Semi),
                '+' => self.single(Token::Plus),
                '-' => self.single(Token::Minus),
                '*' => self.single(Token::Star),
                '/' => self.single(Token::Slash),
                '^' => self.single(Token::Caret),
                ':' => self.single(Token::Colon),
                '<' => {
                    self.chars.next();
                    if self.chars.next_if(|&(_, c)| c == '-').is_some() {
                        Token::Arrow
                    } else if self.chars.next_if(|&(_, c)| c == '=').is_some() {
                        Token::Le
                    } else {
                        Token::Lt
                    }
                }
                '>' => {
                    self.chars.next();
                    if self.chars.next_if(|&(_, c)| c == '=').is_some() {
                        Token::Ge
                    } else {
                        Token::Gt
                    }
                }
                '=' => {
                    self.chars.next();
                    if self.chars.next_if(|&(_, c)| c == '=').is_some() {
                        Token::EqEq
                    } else {
                        Token::Assign
                    }
                }
                '!' => {
                    self.chars.next();
                    if self.chars.next_if(|&(_, c)| c == '=').is_some() {
                        Token::NotEq
                    } else {
                        return Err(ParseError::new("unexpected '!'", offset));
                    }
                }
                '"' | '\'' => self.string(c, offset)?,
                c if c.is_ascii_digit() => self.number(offset)?,
                '.' if self.next_is_digit() => self.number(offset)?,
                c if c.is_alphabetic() || c == '.' => self.ident(offset),
                c => return Err(ParseError::new(format!("unexpected '{c}'"), offset)),
            };
            self.tokens.push(Spanned { token, offset });
        }
        Ok(())
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn next_is_digit(&self) -> bool {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.peek().is_some_and(|&(_, c)| c.is_ascii_digit())
    }

    fn end_of(&mut self, start: usize, accept: impl Fn(char) -> bool) -> usize {
        let mut end = start;
        while let Some((i, c)) = self.chars.next_if(|&(_, c)| accept(c)) {
            end = i + c.len_utf8();
        }
        end
    }

    fn number(&mut self, start: usize) -> Result<Token, ParseError> {
        let mut end = self.end_of(start, |c| c.is_ascii_digit() || c == '.');
        if let Some((i, _)) = self.chars.next_if(|&(_, c)| c == 'e' || c == 'E') {
            end = i + 1;
            if let Some((i, _)) = self.chars.next_if(|&(_, c)| c == '+' || c == '-') {
                end = i + 1;
            }
            end = end.max(self.end_of(end, |c| c.is_ascii_digit()));
        }
        let text = &self.source[start..end];
        text.parse()
            .map(Token::Number)
            .map_err(|_| ParseError::new(format!("malformed number '{text}'"), start))
    }

    fn ident(&mut self, start: usize) -> Token {
        let end = self.end_of(start, |c| c.is_alphanumeric() || c == '.' || c == '_');
        match &self.source[start..end] {
            "TRUE" => Token::True,
            "FALSE" => Token::False,
            "NULL" => Token::Null,
            "function" => Token::Function,
            "if" => Token::If,
            "else" => Token::Else,
            name => Token::Ident(name.to_string()),
        }
    }

    fn string(&mut self, quote: char, start: usize) -> Result<Token, ParseError> {
        self.chars.next();
        let mut text = String::new();
        loop {
            let Some((_, c)) = self.chars.next() else {
                return Err(ParseError::new("unterminated string", start));
            };
            match c {
                c if c == quote => return Ok(Token::Str(text)),
                '\\' => {
                    let Some((offset, escaped)) = self.chars.next() else {
                        return Err(ParseError::new("unterminated string", start));
                    };
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '\\' | '"' | '\'' => escaped,
                        other => {
                            return Err(ParseError::new(
                                format!("unknown escape '\\{other}'"),
                                offset,
                            ));
                        }
                    });
                }
                c => text.push(c),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn arrow_binds_tighter_than_less_than() {
        assert_eq!(
            tokens("x<-1"),
            [Token::Ident("x".into()), Token::Arrow, Token::Number(1.0)]
        );
        assert_eq!(
            tokens("x < -1"),
            [
                Token::Ident("x".into()),
                Token::Lt,
                Token::Minus,
                Token::Number(1.0)
            ]
        );
    }

    #[test]
    fn dotted_identifiers_and_numbers() {
        assert_eq!(
            tokens("Sys.sleep(.5e1)"),
            [
                Token::Ident("Sys.sleep".into()),
                Token::LParen,
                Token::Number(5.0),
                Token::RParen
            ]
        );
    }

    #[test]
    fn strings_and_comments() {
        assert_eq!(
            tokens("'a\\n\"b' # trailing\n"),
            [Token::Str("a\n\"b".into()), Token::Newline]
        );
        assert!(tokenize("\"open").is_err());
    }
}
