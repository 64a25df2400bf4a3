//! Expression evaluator for command argument strings.
//!
//! Arguments are written as a single expression evaluated in the shared
//! namespace: literals (numbers, strings, booleans, `None`), tuple
//! literals, identifiers looked up in the namespace (including the `_`
//! result of the previous command), unary minus and the four basic
//! arithmetic operators. A single value becomes a one-element argument
//! list; a tuple is spread into its elements.

use std::collections::HashMap;
use std::fmt;

/// A value flowing between script commands.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Tuple(_) => "tuple",
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// The namespace shared between commands and the interpreter.
#[derive(Debug, Default)]
pub struct Namespace {
    values: HashMap<String, ScriptValue>,
}

impl Namespace {
    pub fn new() -> Self {
        let mut ns = Self {
            values: HashMap::new(),
        };
        ns.set("_", ScriptValue::None);
        ns
    }

    pub fn get(&self, name: &str) -> Option<&ScriptValue> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: ScriptValue) {
        self.values.insert(name.into(), value);
    }

    /// Result of the previous command.
    pub fn result(&self) -> ScriptValue {
        self.get("_").cloned().unwrap_or(ScriptValue::None)
    }

    pub fn set_result(&mut self, value: ScriptValue) {
        self.set("_", value);
    }

    /// Reset to the pristine state (only `_`, set to None).
    pub fn clear(&mut self) {
        self.values.clear();
        self.set("_", ScriptValue::None);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.values.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Evaluate an argument string into the argument list.
pub fn parse_args(input: &str, namespace: &Namespace) -> Result<Vec<ScriptValue>, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut parser = Parser::new(trimmed, namespace);
    let mut values = vec![parser.expression()?];
    while parser.eat(',') {
        if parser.at_end() {
            break; // trailing comma
        }
        values.push(parser.expression()?);
    }
    parser.expect_end()?;
    // A lone tuple literal spreads into its elements.
    if values.len() == 1 {
        if let ScriptValue::Tuple(items) = &values[0] {
            return Ok(items.clone());
        }
    }
    Ok(values)
}

/// Evaluate a single expression (no top-level comma list).
pub fn eval(input: &str, namespace: &Namespace) -> Result<ScriptValue, String> {
    let mut parser = Parser::new(input.trim(), namespace);
    let value = parser.expression()?;
    parser.expect_end()?;
    Ok(value)
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    namespace: &'a Namespace,
}

impl<'a> Parser<'a> {
    fn new(input: &str, namespace: &'a Namespace) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            namespace,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }

    fn expect_end(&mut self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(c) => Err(format!("unexpected character '{c}'")),
        }
    }

    /// expression := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<ScriptValue, String> {
        let mut left = self.term()?;
        loop {
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = add(left, right)?;
                }
                Some('-') => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = arith(left, right, '-')?;
                }
                _ => return Ok(left),
            }
        }
    }

    /// term := factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<ScriptValue, String> {
        let mut left = self.factor()?;
        loop {
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    let right = self.factor()?;
                    left = arith(left, right, '*')?;
                }
                Some('/') => {
                    self.pos += 1;
                    let right = self.factor()?;
                    left = arith(left, right, '/')?;
                }
                _ => return Ok(left),
            }
        }
    }

    /// factor := '-' factor | primary
    fn factor(&mut self) -> Result<ScriptValue, String> {
        if self.eat('-') {
            return match self.factor()? {
                ScriptValue::Int(i) => Ok(ScriptValue::Int(-i)),
                ScriptValue::Float(x) => Ok(ScriptValue::Float(-x)),
                other => Err(format!("cannot negate a {}", other.type_name())),
            };
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<ScriptValue, String> {
        match self.peek() {
            None => Err("unexpected end of expression".to_string()),
            Some('(') => {
                self.pos += 1;
                if self.eat(')') {
                    return Ok(ScriptValue::Tuple(Vec::new()));
                }
                let first = self.expression()?;
                if self.eat(')') {
                    return Ok(first); // parenthesized expression
                }
                let mut items = vec![first];
                while self.eat(',') {
                    if self.peek() == Some(')') {
                        break; // trailing comma: (a,)
                    }
                    items.push(self.expression()?);
                }
                if !self.eat(')') {
                    return Err("missing ')' in tuple".to_string());
                }
                Ok(ScriptValue::Tuple(items))
            }
            Some('\'') | Some('"') => self.string(),
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_alphabetic() || c == '_' => self.identifier(),
            Some(c) => Err(format!("unexpected character '{c}'")),
        }
    }

    fn string(&mut self) -> Result<ScriptValue, String> {
        let quote = self.chars[self.pos];
        self.pos += 1;
        let mut out = String::new();
        while let Some(&c) = self.chars.get(self.pos) {
            self.pos += 1;
            if c == quote {
                return Ok(ScriptValue::Str(out));
            }
            if c == '\\' {
                let Some(&escaped) = self.chars.get(self.pos) else {
                    return Err("dangling escape in string literal".to_string());
                };
                self.pos += 1;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }
        Err("unterminated string literal".to_string())
    }

    fn number(&mut self) -> Result<ScriptValue, String> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(&c) = self.chars.get(self.pos) {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E') && self.pos > start {
                is_float = true;
                self.pos += 1;
                if matches!(self.chars.get(self.pos), Some('+') | Some('-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            text.parse::<f64>()
                .map(ScriptValue::Float)
                .map_err(|_| format!("invalid number: {text}"))
        } else {
            text.parse::<i64>()
                .map(ScriptValue::Int)
                .map_err(|_| format!("invalid number: {text}"))
        }
    }

    fn identifier(&mut self) -> Result<ScriptValue, String> {
        let start = self.pos;
        while let Some(&c) = self.chars.get(self.pos) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        match name.as_str() {
            "None" | "none" => Ok(ScriptValue::None),
            "True" | "true" => Ok(ScriptValue::Bool(true)),
            "False" | "false" => Ok(ScriptValue::Bool(false)),
            "inf" => Ok(ScriptValue::Float(f64::INFINITY)),
            _ => self
                .namespace
                .get(&name)
                .cloned()
                .ok_or_else(|| format!("undefined variable: {name}")),
        }
    }
}

fn add(left: ScriptValue, right: ScriptValue) -> Result<ScriptValue, String> {
    if let (ScriptValue::Str(a), ScriptValue::Str(b)) = (&left, &right) {
        return Ok(ScriptValue::Str(format!("{a}{b}")));
    }
    arith(left, right, '+')
}

fn arith(left: ScriptValue, right: ScriptValue, op: char) -> Result<ScriptValue, String> {
    if let (ScriptValue::Int(a), ScriptValue::Int(b)) = (&left, &right) {
        if op != '/' {
            let result = match op {
                '+' => a.checked_add(*b),
                '-' => a.checked_sub(*b),
                '*' => a.checked_mul(*b),
                _ => unreachable!(),
            };
            return result
                .map(ScriptValue::Int)
                .ok_or_else(|| "integer overflow".to_string());
        }
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(format!(
            "cannot apply '{op}' to {} and {}",
            left.type_name(),
            right.type_name()
        ));
    };
    let result = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => {
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            a / b
        }
        _ => unreachable!(),
    };
    Ok(ScriptValue::Float(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new()
    }

    #[test]
    fn single_expression_becomes_one_argument() {
        assert_eq!(parse_args("10", &ns()).unwrap(), vec![ScriptValue::Int(10)]);
        assert_eq!(
            parse_args("'SampleX'", &ns()).unwrap(),
            vec![ScriptValue::Str("SampleX".to_string())]
        );
    }

    #[test]
    fn tuple_literal_spreads_into_arguments() {
        assert_eq!(
            parse_args("('SampleY', 70)", &ns()).unwrap(),
            vec![
                ScriptValue::Str("SampleY".to_string()),
                ScriptValue::Int(70)
            ]
        );
        // Bare comma lists behave the same way.
        assert_eq!(
            parse_args("'SampleY', 70", &ns()).unwrap(),
            vec![
                ScriptValue::Str("SampleY".to_string()),
                ScriptValue::Int(70)
            ]
        );
    }

    #[test]
    fn the_namespace_and_the_result_variable_resolve() {
        let mut namespace = Namespace::new();
        namespace.set("exptime", ScriptValue::Float(30.0));
        namespace.set_result(ScriptValue::Int(5));
        assert_eq!(
            parse_args("exptime, _", &namespace).unwrap(),
            vec![ScriptValue::Float(30.0), ScriptValue::Int(5)]
        );
        assert!(parse_args("no_such_name", &namespace).is_err());
    }

    #[test]
    fn arithmetic_with_precedence_and_unary_minus() {
        assert_eq!(eval("2 + 3 * 4", &ns()).unwrap(), ScriptValue::Int(14));
        assert_eq!(eval("-(2 + 3)", &ns()).unwrap(), ScriptValue::Int(-5));
        assert_eq!(eval("10 / 4", &ns()).unwrap(), ScriptValue::Float(2.5));
        assert_eq!(eval("1.5e1", &ns()).unwrap(), ScriptValue::Float(15.0));
        assert!(eval("1 / 0", &ns()).is_err());
    }

    #[test]
    fn literals_cover_the_python_spellings() {
        assert_eq!(eval("None", &ns()).unwrap(), ScriptValue::None);
        assert_eq!(eval("True", &ns()).unwrap(), ScriptValue::Bool(true));
        assert_eq!(eval("false", &ns()).unwrap(), ScriptValue::Bool(false));
    }

    #[test]
    fn empty_argument_string_means_no_arguments() {
        assert!(parse_args("", &ns()).unwrap().is_empty());
        assert!(parse_args("   ", &ns()).unwrap().is_empty());
    }

    #[test]
    fn string_concatenation_works() {
        assert_eq!(
            eval("'crd' + '_test'", &ns()).unwrap(),
            ScriptValue::Str("crd_test".to_string())
        );
    }

    #[test]
    fn nested_tuples_stay_nested() {
        let args = parse_args("(('a', 1), ('b', 2))", &ns()).unwrap();
        assert_eq!(args.len(), 2);
        assert!(matches!(args[0], ScriptValue::Tuple(_)));
    }
}
