//! A small line-oriented interpreter for a Python-flavoured statement subset.
//!
//! Supported statements, one per line:
//! - `name = expr`
//! - `expr` (the last one's value becomes the run output)
//! - `import a, b` / `from a import x`
//! - `raise expr`, `pass`, `# comments`
//! - `if expr:` with an optional `else:`, each followed by one level of
//!   indented simple statements
//!
//! Expressions are string and integer literals, `None`/`True`/`False`, names,
//! `+`, `==`, `!=`, parentheses, and calls to `print`, `input`, `str`, `int`,
//! `len`, `repr`, `sys.stdout.write`, `sys.stderr.write` and exception
//! constructors such as `ValueError("...")`. Any other block is rejected.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use crate::{
    error::{BootError, ScriptError},
    interpreter::{BootConfig, Interpreter, InterpreterFactory, ScriptIo},
};

/// Packages every new factory can load.
const DEFAULT_PACKAGES: [&str; 4] = ["json", "math", "random", "re"];
/// Modules that are importable without loading.
const BUILTIN_MODULES: [&str; 1] = ["sys"];

/// Factory for [`MiniInterpreter`] instances.
#[derive(Debug, Clone)]
pub struct MiniFactory {
    available: BTreeSet<String>,
}

impl MiniFactory {
    /// Creates a factory offering the default package set.
    #[must_use]
    pub fn new() -> Self {
        Self::with_packages(DEFAULT_PACKAGES)
    }

    /// Creates a factory offering exactly `packages`.
    #[must_use]
    pub fn with_packages<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: packages.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for MiniFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl InterpreterFactory for MiniFactory {
    fn boot(&self, config: &BootConfig) -> Result<Box<dyn Interpreter>, BootError> {
        let mut loaded = BTreeSet::new();
        for package in &config.packages {
            if !self.available.contains(package) {
                return Err(BootError(format!("package '{package}' is not available")));
            }
            loaded.insert(package.clone());
        }
        Ok(Box::new(MiniInterpreter {
            globals: HashMap::new(),
            available: self.available.clone(),
            loaded,
        }))
    }
}

/// Interpreter state: globals plus the loaded package set.
#[derive(Debug)]
pub struct MiniInterpreter {
    globals: HashMap<String, Value>,
    available: BTreeSet<String>,
    loaded: BTreeSet<String>,
}

impl Interpreter for MiniInterpreter {
    fn load_packages_from_imports(&mut self, code: &str, io: &mut dyn ScriptIo) -> Result<(), ScriptError> {
        for line in code.lines() {
            for module in imported_modules(line.trim()) {
                if self.loaded.contains(module) || !self.available.contains(module) {
                    continue;
                }
                io.stdout(&format!("Loading {module}"))?;
                self.loaded.insert(module.to_owned());
            }
        }
        Ok(())
    }

    fn run(&mut self, code: &str, io: &mut dyn ScriptIo) -> Result<Option<String>, ScriptError> {
        let lines: Vec<SourceLine<'_>> = code
            .lines()
            .enumerate()
            .filter(|(_, raw)| {
                let text = raw.trim();
                !text.is_empty() && !text.starts_with('#')
            })
            .map(|(index, raw)| SourceLine {
                number: index + 1,
                text: raw.trim(),
                indented: raw.starts_with(char::is_whitespace),
            })
            .collect();

        let mut last = None;
        let mut index = 0;
        while let Some(line) = lines.get(index) {
            index += 1;
            if line.indented {
                return Err(ScriptError::new(
                    "IndentationError",
                    format!("unexpected indent (line {})", line.number),
                ));
            }
            if let Some(condition) = line.text.strip_prefix("if ").and_then(|rest| rest.strip_suffix(':')) {
                let body = take_block(&lines, &mut index, line)?;
                let orelse = match lines.get(index) {
                    Some(next) if !next.indented && next.text == "else:" => {
                        index += 1;
                        take_block(&lines, &mut index, next)?
                    }
                    _ => Vec::new(),
                };
                let branch = if self.eval(condition, io)?.is_truthy() { body } else { orelse };
                last = None;
                for statement in branch {
                    last = self.exec_line(statement, io)?;
                }
                continue;
            }
            if line.text.ends_with(':') {
                return Err(ScriptError::new(
                    "SyntaxError",
                    format!("only 'if' / 'else' blocks are supported (line {})", line.number),
                ));
            }
            last = self.exec_line(line.text, io)?;
        }
        Ok(last.map(|value| value.repr()))
    }
}

/// One non-blank, non-comment source line.
struct SourceLine<'a> {
    number: usize,
    text: &'a str,
    indented: bool,
}

/// Collects the indented statements following `header`, advancing `index`
/// past them.
fn take_block<'a>(
    lines: &[SourceLine<'a>],
    index: &mut usize,
    header: &SourceLine<'_>,
) -> Result<Vec<&'a str>, ScriptError> {
    let mut block = Vec::new();
    while let Some(line) = lines.get(*index).filter(|line| line.indented) {
        if line.text.ends_with(':') {
            return Err(ScriptError::new(
                "SyntaxError",
                format!("nested blocks are not supported (line {})", line.number),
            ));
        }
        block.push(line.text);
        *index += 1;
    }
    if block.is_empty() {
        return Err(ScriptError::new(
            "IndentationError",
            format!("expected an indented block after line {}", header.number),
        ));
    }
    Ok(block)
}

impl MiniInterpreter {
    /// Evaluates a standalone expression.
    fn eval(&self, source: &str, io: &mut dyn ScriptIo) -> Result<Value, ScriptError> {
        let tokens = tokenize(source)?;
        Evaluator::new(&tokens, self, io).expression_to_end()
    }

    /// Executes one statement, returning the value of an expression statement.
    fn exec_line(&mut self, line: &str, io: &mut dyn ScriptIo) -> Result<Option<Value>, ScriptError> {
        if line == "pass" {
            return Ok(None);
        }
        if line.starts_with("import ") || line.starts_with("from ") {
            for module in imported_modules(line) {
                if !self.loaded.contains(module) && !BUILTIN_MODULES.contains(&module) {
                    return Err(ScriptError::new(
                        "ModuleNotFoundError",
                        format!("No module named '{module}'"),
                    ));
                }
                self.loaded.insert(module.to_owned());
            }
            return Ok(None);
        }

        let tokens = tokenize(line)?;
        if let Some(rest) = tokens.strip_prefix(&[Token::Ident("raise".to_owned())]) {
            let value = Evaluator::new(rest, self, io).expression_to_end()?;
            return Err(match value {
                Value::Exception { kind, message } => ScriptError::new(kind, message),
                other => ScriptError::new(
                    "TypeError",
                    format!("exceptions must derive from BaseException, not {}", other.type_name()),
                ),
            });
        }
        if let [Token::Ident(name), Token::Assign, rest @ ..] = tokens.as_slice() {
            let value = Evaluator::new(rest, self, io).expression_to_end()?;
            self.globals.insert(name.clone(), value);
            return Ok(None);
        }

        let value = Evaluator::new(&tokens, self, io).expression_to_end()?;
        Ok(match value {
            Value::None => None,
            other => Some(other),
        })
    }
}

/// Module names referenced by an `import` or `from ... import` line.
fn imported_modules(line: &str) -> Vec<&str> {
    if let Some(rest) = line.strip_prefix("import ") {
        rest.split(',')
            .filter_map(|part| part.split_whitespace().next())
            .map(|path| path.split('.').next().unwrap_or(path))
            .collect()
    } else if let Some(rest) = line.strip_prefix("from ") {
        rest.split_whitespace()
            .next()
            .map(|path| path.split('.').next().unwrap_or(path))
            .into_iter()
            .collect()
    } else {
        Vec::new()
    }
}

// =============================================================================
// Values
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    Exception { kind: String, message: String },
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "str",
            Self::Exception { .. } => "Exception",
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(flag) => *flag,
            Self::Int(value) => *value != 0,
            Self::Str(text) => !text.is_empty(),
            Self::Exception { .. } => true,
        }
    }

    fn repr(&self) -> String {
        match self {
            Self::Str(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'")),
            Self::Exception { kind, message } => format!("{kind}({})", Self::Str(message.clone()).repr()),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(text) => f.write_str(text),
            Self::Exception { message, .. } => f.write_str(message),
        }
    }
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// A name, possibly dotted (`sys.stdout.write`).
    Ident(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Assign,
    Eq,
    NotEq,
}

fn tokenize(line: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' => {
                chars.next();
            }
            '#' => break,
            '=' | '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(if ch == '=' { Token::Eq } else { Token::NotEq });
                } else if ch == '=' {
                    tokens.push(Token::Assign);
                } else {
                    return Err(syntax_error("invalid character '!'"));
                }
            }
            '(' | ')' | ',' | '+' => {
                chars.next();
                tokens.push(match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Plus,
                });
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => break,
                        },
                        c if c == ch => {
                            closed = true;
                            break;
                        }
                        c => text.push(c),
                    }
                }
                if !closed {
                    return Err(syntax_error("unterminated string literal"));
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() && d != '_' {
                        break;
                    }
                    if d != '_' {
                        digits.push(d);
                    }
                    chars.next();
                }
                let value = digits
                    .parse()
                    .map_err(|_| ScriptError::new("OverflowError", "integer literal too large"))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if !(n.is_alphanumeric() || n == '_' || n == '.') {
                        break;
                    }
                    name.push(n);
                    chars.next();
                }
                tokens.push(Token::Ident(name));
            }
            other => return Err(syntax_error(&format!("invalid character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn syntax_error(message: &str) -> ScriptError {
    ScriptError::new("SyntaxError", message)
}

// =============================================================================
// Evaluator
// =============================================================================

/// Evaluates tokens left to right while parsing, so calls with side effects
/// (`print`, `input`) happen in source order.
struct Evaluator<'a, 'i> {
    tokens: &'a [Token],
    pos: usize,
    interp: &'a MiniInterpreter,
    io: &'a mut (dyn ScriptIo + 'i),
}

impl<'a, 'i> Evaluator<'a, 'i> {
    fn new(tokens: &'a [Token], interp: &'a MiniInterpreter, io: &'a mut (dyn ScriptIo + 'i)) -> Self {
        Self {
            tokens,
            pos: 0,
            interp,
            io,
        }
    }

    fn expression_to_end(mut self) -> Result<Value, ScriptError> {
        if self.tokens.is_empty() {
            return Err(syntax_error("expected an expression"));
        }
        let value = self.comparison()?;
        if self.pos != self.tokens.len() {
            return Err(syntax_error("invalid syntax"));
        }
        Ok(value)
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ScriptError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(syntax_error("invalid syntax")),
        }
    }

    fn comparison(&mut self) -> Result<Value, ScriptError> {
        let lhs = self.expression()?;
        let negate = match self.peek() {
            Some(Token::Eq) => false,
            Some(Token::NotEq) => true,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.expression()?;
        Ok(Value::Bool((lhs == rhs) != negate))
    }

    fn expression(&mut self) -> Result<Value, ScriptError> {
        let mut value = self.term()?;
        while self.peek() == Some(&Token::Plus) {
            self.pos += 1;
            let rhs = self.term()?;
            value = add(value, rhs)?;
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<Value, ScriptError> {
        match self.advance() {
            Some(Token::Int(value)) => Ok(Value::Int(*value)),
            Some(Token::Str(text)) => Ok(Value::Str(text.clone())),
            Some(Token::LParen) => {
                let value = self.comparison()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.arguments()?;
                    self.call(name, args)
                } else {
                    self.lookup(name)
                }
            }
            _ => Err(syntax_error("invalid syntax")),
        }
    }

    /// Parses a call's argument list; the opening parenthesis is consumed.
    fn arguments(&mut self) -> Result<Vec<Value>, ScriptError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.comparison()?);
            match self.advance() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(args),
                _ => return Err(syntax_error("expected ',' or ')'")),
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        match name {
            "None" => Ok(Value::None),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            _ => self
                .interp
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| ScriptError::new("NameError", format!("name '{name}' is not defined"))),
        }
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        match name {
            "print" => {
                let line = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
                self.io.stdout(&line)?;
                Ok(Value::None)
            }
            "input" => {
                let prompt = match args.as_slice() {
                    [] => None,
                    [prompt] => Some(prompt.to_string()),
                    _ => return Err(arity_error("input", "at most 1", args.len())),
                };
                let line = self.io.stdin(prompt.as_deref())?;
                Ok(Value::Str(line))
            }
            "str" => Ok(Value::Str(single_arg("str", args)?.to_string())),
            "repr" => Ok(Value::Str(single_arg("repr", args)?.repr())),
            "len" => match single_arg("len", args)? {
                Value::Str(text) => Ok(Value::Int(i64::try_from(text.chars().count()).unwrap_or(i64::MAX))),
                other => Err(ScriptError::new(
                    "TypeError",
                    format!("object of type '{}' has no len()", other.type_name()),
                )),
            },
            "int" => match single_arg("int", args)? {
                Value::Int(value) => Ok(Value::Int(value)),
                Value::Bool(flag) => Ok(Value::Int(i64::from(flag))),
                Value::Str(text) => text.trim().parse().map(Value::Int).map_err(|_| {
                    ScriptError::new(
                        "ValueError",
                        format!("invalid literal for int() with base 10: {}", Value::Str(text.clone()).repr()),
                    )
                }),
                other => Err(ScriptError::new(
                    "TypeError",
                    format!("int() argument must be a string or a number, not '{}'", other.type_name()),
                )),
            },
            "sys.stdout.write" | "sys.stderr.write" => {
                if !self.interp.loaded.contains("sys") {
                    return Err(ScriptError::new("NameError", "name 'sys' is not defined"));
                }
                let text = match single_arg("write", args)? {
                    Value::Str(text) => text,
                    other => {
                        return Err(ScriptError::new(
                            "TypeError",
                            format!("write() argument must be str, not {}", other.type_name()),
                        ));
                    }
                };
                if name == "sys.stdout.write" {
                    self.io.stdout(&text)?;
                } else {
                    self.io.stderr(&text)?;
                }
                Ok(Value::Int(i64::try_from(text.chars().count()).unwrap_or(i64::MAX)))
            }
            kind if kind.ends_with("Error") || kind == "Exception" => {
                let message = match args.as_slice() {
                    [] => String::new(),
                    [message] => message.to_string(),
                    _ => return Err(arity_error(kind, "at most 1", args.len())),
                };
                Ok(Value::Exception {
                    kind: kind.to_owned(),
                    message,
                })
            }
            other => {
                let value = self.lookup(other)?;
                Err(ScriptError::new(
                    "TypeError",
                    format!("'{}' object is not callable", value.type_name()),
                ))
            }
        }
    }
}

fn single_arg(function: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
    let count = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(arity_error(function, "exactly 1", count)),
    }
}

fn arity_error(function: &str, expected: &str, got: usize) -> ScriptError {
    ScriptError::new(
        "TypeError",
        format!("{function}() takes {expected} argument(s) ({got} given)"),
    )
}

fn add(lhs: Value, rhs: Value) -> Result<Value, ScriptError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or_else(|| ScriptError::new("OverflowError", "integer addition overflowed")),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (lhs, rhs) => Err(ScriptError::new(
            "TypeError",
            format!(
                "unsupported operand type(s) for +: '{}' and '{}'",
                lhs.type_name(),
                rhs.type_name()
            ),
        )),
    }
}
