//! JIT kernels used by UDF inner loops.
//!
//! A UDF names the kernel it needs as a [`KernelSource`]; the task resolves it through
//! the [`CompileCache`](crate::compile_cache::CompileCache) before the first tile and
//! hands the resulting [`CompiledKernel`] to `process_tile`.
//!
//! Compilation is pluggable through [`KernelCompiler`]. [`ExprCompiler`] is the
//! reference compiler: it turns a scalar arithmetic expression in one variable `x`
//! into a stack [`Program`], e.g. `sqrt(x) * 2 + max(x, 0.5)`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Source of a kernel: a name for diagnostics plus the text the compiler consumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSource {
    pub name: String,
    pub source: String,
}

impl KernelSource {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Content hash of this kernel for `compiler_id` (SHA-256, hex).
    ///
    /// The name is part of the key so two differently named kernels never share
    /// diagnostics, and the compiler id so artifacts of different compilers never mix.
    #[must_use]
    pub fn signature(&self, compiler_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(compiler_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.source.as_bytes());
        hex(&hasher.finalize())
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Turns kernel sources into executable programs.
pub trait KernelCompiler: Send + Sync {
    /// Identifier mixed into every signature; change it when the output format changes.
    fn id(&self) -> &str;

    /// # Errors
    ///
    /// Returns a description of why `source` cannot be compiled. Compile failures are
    /// deterministic and never retried.
    fn compile(&self, source: &KernelSource) -> std::result::Result<Program, String>;
}

/// A compiled kernel as stored in the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledKernel {
    pub name: String,
    pub signature: String,
    pub program: Program,
}

impl CompiledKernel {
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        self.program.eval(x)
    }
}

/* ===================== Program ===================== */

/// One stack machine instruction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Const(f64),
    X,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Sqrt,
    Abs,
    Exp,
    Ln,
    Min,
    Max,
}

impl Op {
    /// (values popped, values pushed)
    fn arity(self) -> (usize, usize) {
        match self {
            Op::Const(_) | Op::X => (0, 1),
            Op::Neg | Op::Sqrt | Op::Abs | Op::Exp | Op::Ln => (1, 1),
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow | Op::Min | Op::Max => (2, 1),
        }
    }
}

/// A validated postfix program computing `f(x)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    ops: Vec<Op>,
    max_depth: usize,
}

impl Program {
    /// Check that `ops` leaves exactly one value on the stack.
    ///
    /// # Errors
    ///
    /// Returns a message if the program underflows or does not end with one value.
    pub fn new(ops: Vec<Op>) -> std::result::Result<Self, String> {
        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for (i, op) in ops.iter().enumerate() {
            let (pop, push) = op.arity();
            depth = depth
                .checked_sub(pop)
                .ok_or_else(|| format!("stack underflow at instruction {i} ({op:?})"))?;
            depth += push;
            max_depth = max_depth.max(depth);
        }
        if depth != 1 {
            return Err(format!("program leaves {depth} values on the stack"));
        }
        Ok(Self { ops, max_depth })
    }

    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        let mut stack = Vec::with_capacity(self.max_depth);
        for op in &self.ops {
            let v = match *op {
                Op::Const(c) => c,
                Op::X => x,
                Op::Neg | Op::Sqrt | Op::Abs | Op::Exp | Op::Ln => {
                    let a = stack.pop().unwrap_or(f64::NAN);
                    match op {
                        Op::Neg => -a,
                        Op::Sqrt => a.sqrt(),
                        Op::Abs => a.abs(),
                        Op::Exp => a.exp(),
                        _ => a.ln(),
                    }
                }
                binary => {
                    let b = stack.pop().unwrap_or(f64::NAN);
                    let a = stack.pop().unwrap_or(f64::NAN);
                    match binary {
                        Op::Add => a + b,
                        Op::Sub => a - b,
                        Op::Mul => a * b,
                        Op::Div => a / b,
                        Op::Pow => a.powf(b),
                        Op::Min => a.min(b),
                        _ => a.max(b),
                    }
                }
            };
            stack.push(v);
        }
        stack.pop().unwrap_or(f64::NAN)
    }

    /// Apply the program to every element of `values`.
    pub fn apply(&self, values: &mut [f64]) {
        for v in values {
            *v = self.eval(*v);
        }
    }
}

/* ===================== ExprCompiler ===================== */

/// Reference compiler for infix expressions in `x`.
///
/// Grammar: numbers, `x`, `+ - * / ^`, unary minus, parentheses and the functions
/// `sqrt abs exp ln` (one argument) and `min max` (two arguments). `^` binds tightest
/// and is right-associative.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExprCompiler;

impl KernelCompiler for ExprCompiler {
    fn id(&self) -> &str {
        "expr-v1"
    }

    fn compile(&self, source: &KernelSource) -> std::result::Result<Program, String> {
        let tokens = tokenize(&source.source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            ops: Vec::new(),
            depth: 0,
        };
        parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected {tok} at token {}", parser.pos));
        }
        Program::new(parser.ops)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Sym(char),
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Token::Num(n) => write!(f, "number {n}"),
            Token::Ident(s) => write!(f, "'{s}'"),
            Token::Sym(c) => write!(f, "'{c}'"),
        }
    }
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut end = i;
            while let Some(&(j, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '.' || d == 'e' || ((d == '-' || d == '+') && src[..j].ends_with('e')) {
                    end = j + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let text = &src[i..end];
            let n = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{text}' at {i}"))?;
            tokens.push(Token::Num(n));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut end = i;
            while let Some(&(j, d)) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    end = j + 1;
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(src[i..end].to_string()));
        } else if "+-*/^(),".contains(c) {
            tokens.push(Token::Sym(c));
            chars.next();
        } else {
            return Err(format!("unexpected character '{c}' at {i}"));
        }
    }
    Ok(tokens)
}

/// Deepest nesting of parentheses, unary minus and powers the parser accepts.
const MAX_NESTING: usize = 256;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ops: Vec<Op>,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, sym: char) -> std::result::Result<(), String> {
        if self.eat(sym) {
            Ok(())
        } else {
            Err(match self.peek() {
                Some(tok) => format!("expected '{sym}', found {tok}"),
                None => format!("expected '{sym}', found end of input"),
            })
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> std::result::Result<(), String> {
        self.term()?;
        loop {
            if self.eat('+') {
                self.term()?;
                self.ops.push(Op::Add);
            } else if self.eat('-') {
                self.term()?;
                self.ops.push(Op::Sub);
            } else {
                return Ok(());
            }
        }
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> std::result::Result<(), String> {
        self.unary()?;
        loop {
            if self.eat('*') {
                self.unary()?;
                self.ops.push(Op::Mul);
            } else if self.eat('/') {
                self.unary()?;
                self.ops.push(Op::Div);
            } else {
                return Ok(());
            }
        }
    }

    // unary := '-' unary | power
    // Every recursive path of the grammar passes through here, so this is where
    // nesting is bounded.
    fn unary(&mut self) -> std::result::Result<(), String> {
        if self.depth >= MAX_NESTING {
            return Err("expression nested too deeply".to_string());
        }
        self.depth += 1;
        let parsed = if self.eat('-') {
            self.unary().map(|()| self.ops.push(Op::Neg))
        } else {
            self.power()
        };
        self.depth -= 1;
        parsed
    }

    // power := atom ('^' unary)?
    fn power(&mut self) -> std::result::Result<(), String> {
        self.atom()?;
        if self.eat('^') {
            self.unary()?;
            self.ops.push(Op::Pow);
        }
        Ok(())
    }

    fn atom(&mut self) -> std::result::Result<(), String> {
        let Some(tok) = self.peek().cloned() else {
            return Err("unexpected end of input".to_string());
        };
        self.pos += 1;
        match tok {
            Token::Num(n) => self.ops.push(Op::Const(n)),
            Token::Sym('(') => {
                self.expr()?;
                self.expect(')')?;
            }
            Token::Ident(name) if name == "x" => self.ops.push(Op::X),
            Token::Ident(name) => {
                let (op, args) = match name.as_str() {
                    "sqrt" => (Op::Sqrt, 1),
                    "abs" => (Op::Abs, 1),
                    "exp" => (Op::Exp, 1),
                    "ln" => (Op::Ln, 1),
                    "min" => (Op::Min, 2),
                    "max" => (Op::Max, 2),
                    _ => return Err(format!("unknown identifier '{name}'")),
                };
                self.expect('(')?;
                self.expr()?;
                for _ in 1..args {
                    self.expect(',')?;
                    self.expr()?;
                }
                self.expect(')')?;
                self.ops.push(op);
            }
            Token::Sym(c) => return Err(format!("unexpected '{c}'")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> std::result::Result<Program, String> {
        ExprCompiler.compile(&KernelSource::new("k", src))
    }

    #[test]
    fn precedence_and_functions() {
        let p = compile("2 + 3 * x ^ 2").unwrap();
        assert_eq!(p.eval(2.0), 14.0);
        let p = compile("-x ^ 2").unwrap();
        assert_eq!(p.eval(3.0), -9.0);
        let p = compile("max(sqrt(x), 1.5) - abs(-1)").unwrap();
        assert_eq!(p.eval(4.0), 1.0);
        let p = compile("2 ^ 3 ^ 2").unwrap();
        assert_eq!(p.eval(0.0), 512.0);
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(compile("x +").is_err());
        assert!(compile("foo(x)").is_err());
        assert!(compile("(x").is_err());
        assert!(compile("x x").is_err());
        assert!(compile("x $ 1").is_err());
    }

    #[test]
    fn deep_nesting_is_a_compile_error() {
        let deep = format!("{}x{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(compile(&deep).unwrap_err(), "expression nested too deeply");
        assert!(compile(&format!("{}x", "-".repeat(100_000))).is_err());

        let nested = format!("{}x{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(compile(&nested).unwrap().eval(2.5), 2.5);
    }

    #[test]
    fn signature_depends_on_source_and_compiler() {
        let a = KernelSource::new("k", "x + 1");
        let b = KernelSource::new("k", "x + 2");
        assert_eq!(a.signature("c1"), a.signature("c1"));
        assert_ne!(a.signature("c1"), b.signature("c1"));
        assert_ne!(a.signature("c1"), a.signature("c2"));
        assert_eq!(a.signature("c1").len(), 64);
    }
}
