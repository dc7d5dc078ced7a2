//! Script Lexer
//!
//! Splits the character stream of a `.pbr` file into classified tokens.
//! Tokens are separated only by whitespace and the special characters
//! `( ) [ ] < > " & : , =`; operators therefore need surrounding spaces
//! (`x / 2`, not `x/2`). Each token records the 1-based line it started on.
//!
//! Classification is ordered: comments and strings first, then specials,
//! numbers, operators, connectives, types, reserved words, load/store
//! mnemonics, comparators, and finally identifiers (lowercase first letter
//! means variable, uppercase means function). Anything left over is a fatal
//! invalid-token diagnostic.

use crate::compiler::ast::{BinOp, Comparator, Connective};
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{LoadOp, MemWidth, Mnemonic, StoreOp, ValueType};

/// Reserved words of the statement grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserved {
    Alloc,
    Break,
    Call,
    Case,
    Continue,
    Def,
    Default,
    Elif,
    Else,
    End,
    For,
    Fset,
    If,
    Import,
    In,
    Range,
    Return,
    Set,
    Switch,
    While,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Newline,
    /// One of `( ) [ ] < > & : , =`
    Special(char),
    Str(String),
    Number(u32),
    Operator(BinOp),
    Connective(Connective),
    Type(ValueType),
    Reserved(Reserved),
    LoadStore(Mnemonic),
    Comparator(Comparator),
    Variable(String),
    FunctionName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

/// Lex a whole source file into a token vector (newlines included, since the
/// grammar is line-oriented).
pub fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut line: u32 = 1;
    let mut chars = source.chars().peekable();
    let mut word = String::new();

    while let Some(c) = chars.next() {
        if is_special(c) || c.is_whitespace() {
            if !word.is_empty() {
                tokens.push(classify(&std::mem::take(&mut word), line)?);
            }
            match c {
                '\n' => {
                    tokens.push(Token {
                        kind: TokenKind::Newline,
                        line,
                    });
                    line += 1;
                }
                '"' => {
                    // string literal, no escapes
                    let mut s = String::new();
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some('\n') | None => {
                                return Err(CompileError::Lex {
                                    message: "Unclosed string".into(),
                                    line,
                                });
                            }
                            Some(ch) => s.push(ch),
                        }
                    }
                    tokens.push(Token {
                        kind: TokenKind::Str(s),
                        line,
                    });
                }
                c if is_special(c) => tokens.push(Token {
                    kind: TokenKind::Special(c),
                    line,
                }),
                _ => {} // other whitespace
            }
        } else {
            word.push(c);
            // line comments run to end of line
            if word == "//" {
                word.clear();
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Newline,
                    line,
                });
                line += 1;
            }
        }
    }
    if !word.is_empty() {
        tokens.push(classify(&word, line)?);
    }
    Ok(tokens)
}

fn is_special(c: char) -> bool {
    matches!(c, '(' | ')' | '[' | ']' | '<' | '>' | '"' | '&' | ':' | ',' | '=')
}

fn classify(token: &str, line: u32) -> Result<Token, CompileError> {
    let kind = if let Some(value) = parse_number(token) {
        let value = value.map_err(|message| CompileError::Lex { message, line })?;
        TokenKind::Number(value)
    } else if let Some(op) = parse_operator(token) {
        TokenKind::Operator(op)
    } else if let Some(conn) = parse_connective(token) {
        TokenKind::Connective(conn)
    } else if let Some(ty) = parse_type(token) {
        TokenKind::Type(ty)
    } else if let Some(word) = parse_reserved(token) {
        TokenKind::Reserved(word)
    } else if let Some(mnemonic) = parse_loadstore(token) {
        TokenKind::LoadStore(mnemonic)
    } else if let Some(cmp) = parse_comparator(token) {
        TokenKind::Comparator(cmp)
    } else if is_identifier(token) {
        if token.starts_with(|c: char| c.is_ascii_lowercase()) {
            TokenKind::Variable(token.to_string())
        } else {
            TokenKind::FunctionName(token.to_string())
        }
    } else {
        return Err(CompileError::Lex {
            message: format!("Invalid token '{}'", token),
            line,
        });
    };
    Ok(Token { kind, line })
}

/// `None` when the token is not number-shaped; `Some(Err)` when it is but
/// exceeds the 32-bit maximum.
fn parse_number(token: &str) -> Option<Result<u32, String>> {
    let (radix, digits) = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        (16, hex)
    } else if let Some(bin) = token.strip_prefix("0b").or_else(|| token.strip_prefix("0B")) {
        (2, bin)
    } else if let Some(oct) = token.strip_prefix("0o").or_else(|| token.strip_prefix("0O")) {
        (8, oct)
    } else {
        (10, token)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix.max(10))) {
        return None;
    }
    match u64::from_str_radix(digits, radix) {
        Ok(v) if v > 0xffff_ffff => Some(Err(format!(
            "Int literal '{}' exceeds 32-bit maximum",
            v
        ))),
        Ok(v) => Some(Ok(v as u32)),
        Err(_) => {
            if radix == 10 {
                None
            } else {
                Some(Err(format!("Invalid numeric literal '{}'", token)))
            }
        }
    }
}

fn parse_operator(token: &str) -> Option<BinOp> {
    match token {
        "+" => Some(BinOp::Add),
        "-" => Some(BinOp::Sub),
        "*" => Some(BinOp::Mul),
        "/" => Some(BinOp::Div),
        "mask" => Some(BinOp::Mask),
        "insert" => Some(BinOp::Insert),
        "mod" => Some(BinOp::Mod),
        "lshift" => Some(BinOp::Lshift),
        "rshift" => Some(BinOp::Rshift),
        _ => None,
    }
}

fn parse_connective(token: &str) -> Option<Connective> {
    match token {
        "and" => Some(Connective::And),
        "or" => Some(Connective::Or),
        _ => None,
    }
}

fn parse_type(token: &str) -> Option<ValueType> {
    match token {
        "int" => Some(ValueType::Int),
        "float" => Some(ValueType::Float),
        _ => None,
    }
}

fn parse_reserved(token: &str) -> Option<Reserved> {
    match token {
        "alloc" => Some(Reserved::Alloc),
        "break" => Some(Reserved::Break),
        "call" => Some(Reserved::Call),
        "case" => Some(Reserved::Case),
        "continue" => Some(Reserved::Continue),
        "def" => Some(Reserved::Def),
        "default" => Some(Reserved::Default),
        "elif" => Some(Reserved::Elif),
        "else" => Some(Reserved::Else),
        "end" => Some(Reserved::End),
        "for" => Some(Reserved::For),
        "fset" => Some(Reserved::Fset),
        "if" => Some(Reserved::If),
        "import" => Some(Reserved::Import),
        "in" => Some(Reserved::In),
        "range" => Some(Reserved::Range),
        "return" => Some(Reserved::Return),
        "set" => Some(Reserved::Set),
        "switch" => Some(Reserved::Switch),
        "while" => Some(Reserved::While),
        _ => None,
    }
}

/// The explicit load/store statement mnemonics (D-form, optionally with
/// update). Indexed forms are derived later from a variable offset.
fn parse_loadstore(token: &str) -> Option<Mnemonic> {
    let (stem, update) = match token.strip_suffix('u') {
        // `u` only counts as the update suffix on a known stem
        Some(stem) if loadstore_stem(stem).is_some() => (stem, true),
        _ => (token, false),
    };
    let (store, width) = loadstore_stem(stem)?;
    if store {
        Some(Mnemonic::Store(StoreOp {
            width,
            update,
            indexed: false,
        }))
    } else {
        Some(Mnemonic::Load(LoadOp {
            width,
            update,
            indexed: false,
        }))
    }
}

fn loadstore_stem(stem: &str) -> Option<(bool, MemWidth)> {
    match stem {
        "lbz" => Some((false, MemWidth::Byte)),
        "lhz" => Some((false, MemWidth::Half)),
        "lha" => Some((false, MemWidth::HalfAlgebraic)),
        "lwz" => Some((false, MemWidth::Word)),
        "lfs" => Some((false, MemWidth::FloatSingle)),
        "lfd" => Some((false, MemWidth::FloatDouble)),
        "stb" => Some((true, MemWidth::Byte)),
        "sth" => Some((true, MemWidth::Half)),
        "stw" => Some((true, MemWidth::Word)),
        "stfs" => Some((true, MemWidth::FloatSingle)),
        "stfd" => Some((true, MemWidth::FloatDouble)),
        _ => None,
    }
}

fn parse_comparator(token: &str) -> Option<Comparator> {
    match token {
        "eq" => Some(Comparator::Eq),
        "ne" => Some(Comparator::Ne),
        "lt" => Some(Comparator::Lt),
        "le" => Some(Comparator::Le),
        "gt" => Some(Comparator::Gt),
        "ge" => Some(Comparator::Ge),
        _ => None,
    }
}

fn is_identifier(token: &str) -> bool {
    token.starts_with(|c: char| c.is_ascii_alphabetic())
        && token.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}
