//! Recursive-descent parser over the token stream from `lexer`. Builds
//! a `Module` by hand: no grammar-generator is involved, since branch
//! targets, folded instructions, and unknown-form skipping all need
//! control flow a generated LALR parser can't express naturally.

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token};

pub fn parse(text: &str) -> Result<Module> {
    let tokens = Lexer::tokenize(text);
    let mut parser = Parser {
        tokens,
        pos: 0,
    };
    parser.parse_top_level()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if !matches!(tok, Token::Eof) {
            self.pos += 1;
        }
        tok
    }

    fn expect_lparen(&mut self) -> Result<()> {
        match self.advance() {
            Token::LParen => Ok(()),
            other => Err(unexpected(&other, "(")),
        }
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.advance() {
            Token::RParen => Ok(()),
            other => Err(unexpected(&other, ")")),
        }
    }

    fn at_rparen(&self) -> bool {
        matches!(self.peek(), Token::RParen)
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        match self.advance() {
            Token::Keyword(ref k) if k == kw => Ok(()),
            other => Err(unexpected(&other, kw)),
        }
    }

    fn expect_str(&mut self) -> Result<String> {
        match self.advance() {
            Token::Str(s) => Ok(s),
            _ => Err(Error::ExpectedStringValue),
        }
    }

    /// Consumes an `Identifier` token and strips its leading `$`.
    fn expect_identifier(&mut self) -> Result<String> {
        match self.advance() {
            Token::Identifier(s) => Ok(strip_dollar(&s)),
            other => Err(unexpected(&other, "identifier")),
        }
    }

    fn try_identifier(&mut self) -> Option<String> {
        if let Token::Identifier(s) = self.peek().clone() {
            self.pos += 1;
            Some(strip_dollar(&s))
        } else {
            None
        }
    }

    fn expect_value_type(&mut self) -> Result<ValueType> {
        match self.advance() {
            Token::Keyword(k) => value_type_from_str(&k)
                .ok_or_else(|| unexpected(&Token::Keyword(k), "i32|i64|f32|f64")),
            other => Err(unexpected(&other, "i32|i64|f32|f64")),
        }
    }

    // --- top level ---

    fn parse_top_level(&mut self) -> Result<Module> {
        self.expect_lparen()?;
        self.expect_keyword("module")?;

        let mut module = Module::new();

        loop {
            if self.at_rparen() {
                break;
            }
            let checkpoint = self.pos;
            self.expect_lparen()?;
            let form = match self.peek().clone() {
                Token::Keyword(k) => k,
                _ => {
                    self.pos = checkpoint + 1;
                    self.skip_sexpr(1)?;
                    continue;
                }
            };
            match form.as_str() {
                "func" => {
                    self.pos += 1;
                    let f = self.parse_func()?;
                    module.functions.push(f);
                }
                "import" => {
                    self.pos += 1;
                    let i = self.parse_import()?;
                    module.imports.push(i);
                }
                "type" => {
                    self.pos += 1;
                    let t = self.parse_type()?;
                    module.types.push(t);
                }
                "table" => {
                    self.pos += 1;
                    let t = self.parse_table()?;
                    module.table = Some(t);
                }
                "elem" => {
                    self.pos += 1;
                    let e = self.parse_elem()?;
                    module.elements.push(e);
                }
                "string" => {
                    self.pos += 1;
                    let s = self.parse_string_def()?;
                    module.strings.push(s);
                }
                _ => {
                    self.pos = checkpoint + 1;
                    self.skip_sexpr(1)?;
                }
            }
        }

        self.expect_rparen()?;
        Ok(module)
    }

    /// Consumes tokens until the paren nesting (already at `depth`)
    /// returns to zero. Used to skip unrecognized top-level forms.
    fn skip_sexpr(&mut self, mut depth: i32) -> Result<()> {
        while depth > 0 {
            match self.advance() {
                Token::LParen => depth += 1,
                Token::RParen => depth -= 1,
                Token::Eof => {
                    return Err(unexpected(&Token::Eof, ")"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    // --- func ---

    fn parse_func(&mut self) -> Result<Function> {
        let name = self.try_identifier().unwrap_or_default();
        let mut func = Function {
            name,
            ..Function::default()
        };

        loop {
            if self.at_rparen() {
                break;
            }
            self.expect_lparen()?;
            let form = match self.peek().clone() {
                Token::Keyword(k) => k,
                other => return Err(unexpected(&other, "param|result|local|instruction")),
            };
            match form.as_str() {
                "param" => {
                    self.pos += 1;
                    self.parse_param_or_local(&mut func.param_names, &mut func.param_types)?;
                }
                "local" => {
                    self.pos += 1;
                    self.parse_param_or_local(&mut func.local_names, &mut func.local_types)?;
                }
                "result" => {
                    self.pos += 1;
                    while !self.at_rparen() {
                        func.result_types.push(self.expect_value_type()?);
                    }
                    self.expect_rparen()?;
                }
                _ => {
                    // This LParen begins an instruction form; rewind so
                    // parse_instruction can consume it uniformly.
                    self.pos -= 1;
                    self.parse_instruction(&mut func.body)?;
                }
            }
        }

        self.expect_rparen()?;
        Ok(func)
    }

    fn parse_param_or_local(
        &mut self,
        names: &mut Vec<Option<String>>,
        types: &mut Vec<ValueType>,
    ) -> Result<()> {
        if let Token::Identifier(_) = self.peek() {
            let name = self.expect_identifier()?;
            let ty = self.expect_value_type()?;
            names.push(Some(name));
            types.push(ty);
        } else {
            while !self.at_rparen() {
                types.push(self.expect_value_type()?);
                names.push(None);
            }
        }
        self.expect_rparen()
    }

    // --- import ---

    fn parse_import(&mut self) -> Result<Import> {
        let module = self.expect_str()?;
        let field = self.expect_str()?;

        self.expect_lparen()?;
        self.expect_keyword("func")?;
        let alias = self.try_identifier();

        let mut param_types = Vec::new();
        let mut result_types = Vec::new();
        loop {
            if self.at_rparen() {
                break;
            }
            self.expect_lparen()?;
            let form = match self.peek().clone() {
                Token::Keyword(k) => k,
                other => return Err(unexpected(&other, "param|result")),
            };
            match form.as_str() {
                "param" => {
                    self.pos += 1;
                    let mut names = Vec::new();
                    self.parse_param_or_local(&mut names, &mut param_types)?;
                }
                "result" => {
                    self.pos += 1;
                    while !self.at_rparen() {
                        result_types.push(self.expect_value_type()?);
                    }
                    self.expect_rparen()?;
                }
                other => return Err(unexpected(&Token::Keyword(other), "param|result")),
            }
        }
        self.expect_rparen()?; // closes (func ...)
        self.expect_rparen()?; // closes (import ...)

        Ok(Import {
            module,
            field,
            alias,
            param_types,
            result_types,
        })
    }

    // --- type ---

    fn parse_type(&mut self) -> Result<Type> {
        let name = self.try_identifier();
        self.expect_lparen()?;
        self.expect_keyword("func")?;

        let mut param_types = Vec::new();
        let mut result_types = Vec::new();
        loop {
            if self.at_rparen() {
                break;
            }
            self.expect_lparen()?;
            let form = match self.peek().clone() {
                Token::Keyword(k) => k,
                other => return Err(unexpected(&other, "param|result")),
            };
            match form.as_str() {
                "param" => {
                    self.pos += 1;
                    let mut names = Vec::new();
                    self.parse_param_or_local(&mut names, &mut param_types)?;
                }
                "result" => {
                    self.pos += 1;
                    while !self.at_rparen() {
                        result_types.push(self.expect_value_type()?);
                    }
                    self.expect_rparen()?;
                }
                other => return Err(unexpected(&Token::Keyword(other), "param|result")),
            }
        }
        self.expect_rparen()?; // closes (func ...)
        self.expect_rparen()?; // closes (type ...)

        Ok(Type {
            name,
            param_types,
            result_types,
        })
    }

    // --- table ---

    fn parse_table(&mut self) -> Result<Table> {
        let name = self.try_identifier();
        let min = self.expect_integer()? as u32;
        let max = if matches!(self.peek(), Token::Integer(_)) {
            self.expect_integer()? as u32
        } else {
            min
        };
        self.expect_keyword("funcref")
            .map_err(|_| Error::NonFuncrefTable)?;
        self.expect_rparen()?;
        Ok(Table { name, min, max })
    }

    // --- elem ---

    fn parse_elem(&mut self) -> Result<ElementSegment> {
        self.expect_lparen()?;
        self.expect_keyword("i32.const")?;
        let offset = self.expect_integer()? as i32;
        self.expect_rparen()?;

        let mut function_names = Vec::new();
        while !self.at_rparen() {
            function_names.push(self.expect_identifier()?);
        }
        self.expect_rparen()?;

        Ok(ElementSegment {
            offset,
            function_names,
        })
    }

    // --- string ---

    fn parse_string_def(&mut self) -> Result<StringDefinition> {
        let alias = self.expect_identifier()?;
        let text = self.expect_str()?;
        self.expect_rparen()?;
        Ok(StringDefinition {
            alias,
            bytes: text.into_bytes(),
        })
    }

    // --- instructions ---

    fn expect_integer(&mut self) -> Result<i64> {
        match self.advance() {
            Token::Integer(text) => parse_int_literal(&text)
                .ok_or_else(|| invalid_immediate("integer", &text)),
            other => Err(unexpected(&other, "integer")),
        }
    }

    /// Parses one folded instruction form, recursing into nested
    /// operand instructions first (postfix emission) and appending the
    /// resulting instructions into `body`.
    fn parse_instruction(&mut self, body: &mut Vec<Instruction>) -> Result<()> {
        self.expect_lparen()?;
        let mnemonic = match self.advance() {
            Token::Keyword(k) => k,
            other => return Err(unexpected(&other, "opcode")),
        };

        match mnemonic.as_str() {
            "block" | "loop" => {
                let label = self.try_identifier();
                let opcode = if mnemonic == "block" {
                    Opcode::Block
                } else {
                    Opcode::Loop
                };
                let immediate = label.map(Immediate::Name).unwrap_or(Immediate::None);
                body.push(Instruction::new(opcode, immediate));
                while !self.at_rparen() {
                    self.parse_instruction(body)?;
                }
                body.push(Instruction::bare(Opcode::End));
                self.expect_rparen()?;
            }
            "call_indirect" => {
                self.expect_lparen()?;
                self.expect_keyword("type")?;
                let type_name = self.expect_identifier()?;
                self.expect_rparen()?;

                while !self.at_rparen() {
                    self.parse_instruction(body)?;
                }
                body.push(Instruction::new(
                    Opcode::CallIndirect,
                    Immediate::Name(type_name),
                ));
                self.expect_rparen()?;
            }
            _ => {
                let opcode = map_opcode(&mnemonic)?;
                let immediate = if takes_immediate(opcode) {
                    Some(self.parse_immediate(&mnemonic, opcode)?)
                } else {
                    None
                };
                while !self.at_rparen() {
                    self.parse_instruction(body)?;
                }
                body.push(Instruction::new(opcode, immediate.unwrap_or(Immediate::None)));
                self.expect_rparen()?;
            }
        }
        Ok(())
    }

    fn parse_immediate(&mut self, mnemonic: &str, opcode: Opcode) -> Result<Immediate> {
        match opcode {
            Opcode::I32Const => {
                let text = self.immediate_text(mnemonic)?;
                let n = parse_int_literal(&text)
                    .ok_or_else(|| invalid_immediate(mnemonic, &text))?;
                Ok(Immediate::I32(n as i32))
            }
            Opcode::I64Const => {
                let text = self.immediate_text(mnemonic)?;
                let n = parse_int_literal(&text)
                    .ok_or_else(|| invalid_immediate(mnemonic, &text))?;
                Ok(Immediate::I64(n))
            }
            Opcode::F32Const => {
                let text = self.immediate_text(mnemonic)?;
                let n: f32 = text
                    .parse()
                    .map_err(|_| invalid_immediate(mnemonic, &text))?;
                Ok(Immediate::F32(n))
            }
            Opcode::F64Const => {
                let text = self.immediate_text(mnemonic)?;
                let n: f64 = text
                    .parse()
                    .map_err(|_| invalid_immediate(mnemonic, &text))?;
                Ok(Immediate::F64(n))
            }
            // name-form immediates: identifier or bare integer index,
            // $-stripped, stored as a name for resolution later.
            Opcode::LocalGet
            | Opcode::LocalSet
            | Opcode::LocalTee
            | Opcode::GlobalGet
            | Opcode::GlobalSet
            | Opcode::Br
            | Opcode::BrIf
            | Opcode::Call
            | Opcode::StringConst => {
                let name = self.name_immediate(mnemonic)?;
                Ok(Immediate::Name(name))
            }
            _ => Ok(Immediate::None),
        }
    }

    fn immediate_text(&mut self, mnemonic: &str) -> Result<String> {
        match self.advance() {
            Token::Integer(t) | Token::Float(t) => Ok(t),
            other => Err(unexpected(&other, &format!("immediate for {}", mnemonic))),
        }
    }

    fn name_immediate(&mut self, mnemonic: &str) -> Result<String> {
        match self.advance() {
            Token::Identifier(s) => Ok(strip_dollar(&s)),
            Token::Integer(s) => Ok(s),
            other => Err(unexpected(&other, &format!("name for {}", mnemonic))),
        }
    }
}

fn strip_dollar(s: &str) -> String {
    s.strip_prefix('$').unwrap_or(s).to_string()
}

fn value_type_from_str(s: &str) -> Option<ValueType> {
    match s {
        "i32" => Some(ValueType::I32),
        "i64" => Some(ValueType::I64),
        "f32" => Some(ValueType::F32),
        "f64" => Some(ValueType::F64),
        _ => None,
    }
}

fn parse_int_literal(text: &str) -> Option<i64> {
    if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("-0x")) {
        let v = i64::from_str_radix(rest, 16).ok()?;
        if text.starts_with('-') {
            Some(-v)
        } else {
            Some(v)
        }
    } else {
        text.parse::<i64>().ok()
    }
}

fn unexpected(found: &Token, expected: &str) -> Error {
    Error::UnexpectedToken {
        found: format!("{:?}", found),
        expected: expected.to_string(),
    }
}

fn invalid_immediate(opcode: &str, text: &str) -> Error {
    Error::InvalidImmediate {
        opcode: opcode.to_string(),
        text: text.to_string(),
    }
}

/// Whether the opcode's folded form carries an immediate token before
/// any nested operand instructions. `call_indirect`/`block`/`loop` are
/// handled specially in `parse_instruction` and never reach here.
fn takes_immediate(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::I32Const
            | Opcode::I64Const
            | Opcode::F32Const
            | Opcode::F64Const
            | Opcode::LocalGet
            | Opcode::LocalSet
            | Opcode::LocalTee
            | Opcode::GlobalGet
            | Opcode::GlobalSet
            | Opcode::Br
            | Opcode::BrIf
            | Opcode::Call
            | Opcode::StringConst
    )
}

/// Fixed mnemonic → opcode table. `store`/`load` mnemonics are
/// rejected outright (no linear memory); anything else unrecognized
/// degrades to `Nop`.
fn map_opcode(mnemonic: &str) -> Result<Opcode> {
    if mnemonic.contains("store") || mnemonic.contains("load") {
        return Err(Error::UnsupportedMnemonic(mnemonic.to_string()));
    }
    Ok(match mnemonic {
        "i32.const" => Opcode::I32Const,
        "i64.const" => Opcode::I64Const,
        "f32.const" => Opcode::F32Const,
        "f64.const" => Opcode::F64Const,

        "i32.add" => Opcode::I32Add,
        "i32.sub" => Opcode::I32Sub,
        "i32.mul" => Opcode::I32Mul,
        "i32.eq" => Opcode::I32Eq,
        "i32.ne" => Opcode::I32Ne,
        "i32.lt_s" => Opcode::I32LtS,
        "i32.gt_s" => Opcode::I32GtS,
        "i32.le_s" => Opcode::I32LeS,
        "i32.ge_s" => Opcode::I32GeS,

        "f64.add" => Opcode::F64Add,
        "f64.sub" => Opcode::F64Sub,
        "f64.mul" => Opcode::F64Mul,
        "f64.div" => Opcode::F64Div,

        "local.get" => Opcode::LocalGet,
        "local.set" => Opcode::LocalSet,
        "local.tee" => Opcode::LocalTee,
        "global.get" => Opcode::GlobalGet,
        "global.set" => Opcode::GlobalSet,

        "string.const" => Opcode::StringConst,

        "call" => Opcode::Call,
        "call_indirect" => Opcode::CallIndirect,

        "end" => Opcode::End,
        "br" => Opcode::Br,
        "br_if" => Opcode::BrIf,
        "return" => Opcode::Return,
        "if" => Opcode::If,
        "else" => Opcode::Else,
        "unreachable" => Opcode::Unreachable,

        _ => Opcode::Nop,
    })
}
