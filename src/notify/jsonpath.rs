//! SQL/JSONPath predicate engine.
//!
//! Evaluates the jsonpath dialect the database applies with `@?` /
//! `jsonb_path_exists` so that in-process matching and the SQL predicate
//! agree on the same query text: member and index steps, wildcards,
//! `? (...)` filters with comparisons, `&&`/`||`/`!`, `exists(...)`, and
//! `$name` variables. Lax mode only; arrays auto-unwrap on member access and
//! filtering.

use std::fmt;

use serde_json::{Map, Value};

/// Structured parse error with position information.
#[derive(Debug)]
pub struct PathParseError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for PathParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn err<T>(message: impl Into<String>, position: usize) -> Result<T, PathParseError> {
    Err(PathParseError {
        message: message.into(),
        position,
    })
}

/// A compiled jsonpath, parsed once per subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Member(String),
    Wildcard,
    Index(u64),
    AnyIndex,
    Filter(Pred),
}

#[derive(Debug, Clone, PartialEq)]
enum Pred {
    Or(Box<Pred>, Box<Pred>),
    And(Box<Pred>, Box<Pred>),
    Not(Box<Pred>),
    Cmp(Operand, CmpOp, Operand),
    Exists(Vec<Step>),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// `@` followed by steps, relative to the filtered item.
    Current(Vec<Step>),
    /// `$` followed by steps, relative to the root document.
    Root(Vec<Step>),
    /// `$name`, resolved from the query variables.
    Var(String),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl JsonPath {
    /// Parse a jsonpath query. `strict` mode is rejected.
    pub fn parse(query: &str) -> Result<JsonPath, PathParseError> {
        let tokens = tokenize(query)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        parser.expect_root()?;
        let steps = parser.parse_steps()?;
        if parser.pos < parser.tokens.len() {
            let tok = &parser.tokens[parser.pos];
            return err(format!("unexpected token '{}'", tok.text), tok.position);
        }
        Ok(JsonPath { steps })
    }

    /// Does the path yield at least one item against `value`? Matches the
    /// database's `jsonb_path_exists` truth for the supported dialect.
    pub fn exists(&self, value: &Value, vars: Option<&Map<String, Value>>) -> bool {
        !eval_steps(&self.steps, vec![value.clone()], value, vars).is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Root,
    Current,
    Var(String),
    Dot,
    Star,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Question,
    Bang,
    AndAnd,
    OrOr,
    Cmp(CmpOp),
    Ident(String),
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, PathParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '$' => {
                i += 1;
                let mut name = String::new();
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    name.push(bytes[i] as char);
                    i += 1;
                }
                if name.is_empty() {
                    tokens.push(tok(TokenKind::Root, "$", start));
                } else {
                    tokens.push(tok(TokenKind::Var(name.clone()), &format!("${name}"), start));
                }
            }
            '@' => {
                i += 1;
                tokens.push(tok(TokenKind::Current, "@", start));
            }
            '.' => {
                i += 1;
                tokens.push(tok(TokenKind::Dot, ".", start));
            }
            '*' => {
                i += 1;
                tokens.push(tok(TokenKind::Star, "*", start));
            }
            '[' => {
                i += 1;
                tokens.push(tok(TokenKind::LBracket, "[", start));
            }
            ']' => {
                i += 1;
                tokens.push(tok(TokenKind::RBracket, "]", start));
            }
            '(' => {
                i += 1;
                tokens.push(tok(TokenKind::LParen, "(", start));
            }
            ')' => {
                i += 1;
                tokens.push(tok(TokenKind::RParen, ")", start));
            }
            '?' => {
                i += 1;
                tokens.push(tok(TokenKind::Question, "?", start));
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    tokens.push(tok(TokenKind::Cmp(CmpOp::Ne), "!=", start));
                } else {
                    i += 1;
                    tokens.push(tok(TokenKind::Bang, "!", start));
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    i += 2;
                    tokens.push(tok(TokenKind::AndAnd, "&&", start));
                } else {
                    return err("expected '&&'", start);
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    i += 2;
                    tokens.push(tok(TokenKind::OrOr, "||", start));
                } else {
                    return err("expected '||'", start);
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    tokens.push(tok(TokenKind::Cmp(CmpOp::Eq), "==", start));
                } else {
                    return err("expected '=='", start);
                }
            }
            '<' => match bytes.get(i + 1) {
                Some(&b'=') => {
                    i += 2;
                    tokens.push(tok(TokenKind::Cmp(CmpOp::Le), "<=", start));
                }
                Some(&b'>') => {
                    i += 2;
                    tokens.push(tok(TokenKind::Cmp(CmpOp::Ne), "<>", start));
                }
                _ => {
                    i += 1;
                    tokens.push(tok(TokenKind::Cmp(CmpOp::Lt), "<", start));
                }
            },
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    tokens.push(tok(TokenKind::Cmp(CmpOp::Ge), ">=", start));
                } else {
                    i += 1;
                    tokens.push(tok(TokenKind::Cmp(CmpOp::Gt), ">", start));
                }
            }
            '"' => {
                let (s, next) = read_string(input, i)?;
                tokens.push(tok(TokenKind::Str(s), &input[start..next], start));
                i = next;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut j = i + 1;
                while j < bytes.len()
                    && ((bytes[j] as char).is_ascii_digit()
                        || bytes[j] == b'.'
                        || bytes[j] == b'e'
                        || bytes[j] == b'E'
                        || bytes[j] == b'+'
                        || bytes[j] == b'-')
                {
                    // A '.' followed by a non-digit ends the number (path step).
                    if bytes[j] == b'.' && !bytes.get(j + 1).is_some_and(|b| b.is_ascii_digit()) {
                        break;
                    }
                    j += 1;
                }
                let text = &input[i..j];
                let n: f64 = match text.parse() {
                    Ok(n) => n,
                    Err(_) => return err(format!("invalid number '{text}'"), start),
                };
                tokens.push(tok(TokenKind::Num(n), text, start));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < bytes.len()
                    && ((bytes[j] as char).is_ascii_alphanumeric() || bytes[j] == b'_')
                {
                    j += 1;
                }
                tokens.push(tok(TokenKind::Ident(input[i..j].to_string()), &input[i..j], start));
                i = j;
            }
            other => return err(format!("unexpected character '{other}'"), start),
        }
    }
    Ok(tokens)
}

fn tok(kind: TokenKind, text: &str, position: usize) -> Token {
    Token {
        kind,
        text: text.to_string(),
        position,
    }
}

fn read_string(input: &str, start: usize) -> Result<(String, usize), PathParseError> {
    let bytes = input.as_bytes();
    let mut out = String::new();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((out, i + 1)),
            b'\\' => {
                let escaped = bytes
                    .get(i + 1)
                    .ok_or(PathParseError {
                        message: "unterminated escape".to_string(),
                        position: i,
                    })?;
                match escaped {
                    b'"' => out.push('"'),
                    b'\\' => out.push('\\'),
                    b'n' => out.push('\n'),
                    b't' => out.push('\t'),
                    b'r' => out.push('\r'),
                    other => {
                        out.push('\\');
                        out.push(*other as char);
                    }
                }
                i += 2;
            }
            b if b < 0x80 => {
                out.push(b as char);
                i += 1;
            }
            b => {
                // Copy the whole UTF-8 code point.
                let len = match b {
                    b if b >= 0xf0 => 4,
                    b if b >= 0xe0 => 3,
                    _ => 2,
                };
                out.push_str(&input[i..i + len]);
                i += len;
            }
        }
    }
    err("unterminated string literal", start)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_root(&mut self) -> Result<(), PathParseError> {
        // Optional mode keyword first.
        let mode = match self.peek() {
            Some(Token {
                kind: TokenKind::Ident(word),
                position,
                ..
            }) => Some((word.clone(), *position)),
            _ => None,
        };
        if let Some((word, position)) = mode {
            match word.as_str() {
                "lax" => self.pos += 1,
                "strict" => return err("strict jsonpath mode is not supported", position),
                _ => {}
            }
        }
        match self.next() {
            Some(Token {
                kind: TokenKind::Root,
                ..
            }) => Ok(()),
            Some(tok) => err(format!("expected '$', found '{}'", tok.text), tok.position),
            None => err("expected '$'", 0),
        }
    }

    fn parse_steps(&mut self) -> Result<Vec<Step>, PathParseError> {
        let mut steps = Vec::new();
        loop {
            match self.peek().map(|t| t.kind.clone()) {
                Some(TokenKind::Dot) => {
                    self.pos += 1;
                    match self.next().cloned() {
                        Some(Token {
                            kind: TokenKind::Ident(name),
                            ..
                        }) => steps.push(Step::Member(name)),
                        Some(Token {
                            kind: TokenKind::Str(name),
                            ..
                        }) => steps.push(Step::Member(name)),
                        Some(Token {
                            kind: TokenKind::Star,
                            ..
                        }) => steps.push(Step::Wildcard),
                        Some(tok) => {
                            return err(
                                format!("expected member name, found '{}'", tok.text),
                                tok.position,
                            )
                        }
                        None => return err("expected member name", 0),
                    }
                }
                Some(TokenKind::LBracket) => {
                    self.pos += 1;
                    match self.next().cloned() {
                        Some(Token {
                            kind: TokenKind::Num(n),
                            position,
                            ..
                        }) => {
                            if n < 0.0 || n.fract() != 0.0 {
                                return err("array index must be a non-negative integer", position);
                            }
                            steps.push(Step::Index(n as u64));
                        }
                        Some(Token {
                            kind: TokenKind::Star,
                            ..
                        }) => steps.push(Step::AnyIndex),
                        Some(tok) => {
                            return err(
                                format!("expected array index, found '{}'", tok.text),
                                tok.position,
                            )
                        }
                        None => return err("expected array index", 0),
                    }
                    match self.next() {
                        Some(Token {
                            kind: TokenKind::RBracket,
                            ..
                        }) => {}
                        Some(tok) => {
                            return err(format!("expected ']', found '{}'", tok.text), tok.position)
                        }
                        None => return err("expected ']'", 0),
                    }
                }
                Some(TokenKind::Question) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token {
                            kind: TokenKind::LParen,
                            ..
                        }) => {}
                        Some(tok) => {
                            return err(format!("expected '(', found '{}'", tok.text), tok.position)
                        }
                        None => return err("expected '('", 0),
                    }
                    let pred = self.parse_or()?;
                    match self.next() {
                        Some(Token {
                            kind: TokenKind::RParen,
                            ..
                        }) => {}
                        Some(tok) => {
                            return err(format!("expected ')', found '{}'", tok.text), tok.position)
                        }
                        None => return err("expected ')'", 0),
                    }
                    steps.push(Step::Filter(pred));
                }
                _ => break,
            }
        }
        Ok(steps)
    }

    fn parse_or(&mut self) -> Result<Pred, PathParseError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::OrOr)) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Pred::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Pred, PathParseError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::AndAnd)) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Pred::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Pred, PathParseError> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Bang) => {
                self.pos += 1;
                Ok(Pred::Not(Box::new(self.parse_unary()?)))
            }
            Some(TokenKind::LParen) => {
                self.pos += 1;
                let pred = self.parse_or()?;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(pred),
                    Some(tok) => err(format!("expected ')', found '{}'", tok.text), tok.position),
                    None => err("expected ')'", 0),
                }
            }
            Some(TokenKind::Ident(word)) if word == "exists" => {
                self.pos += 1;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::LParen,
                        ..
                    }) => {}
                    Some(tok) => {
                        return err(format!("expected '(', found '{}'", tok.text), tok.position)
                    }
                    None => return err("expected '('", 0),
                }
                match self.next() {
                    Some(Token {
                        kind: TokenKind::Current,
                        ..
                    }) => {}
                    Some(tok) => {
                        return err(format!("expected '@', found '{}'", tok.text), tok.position)
                    }
                    None => return err("expected '@'", 0),
                }
                let steps = self.parse_steps()?;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(Pred::Exists(steps)),
                    Some(tok) => err(format!("expected ')', found '{}'", tok.text), tok.position),
                    None => err("expected ')'", 0),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Pred, PathParseError> {
        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token {
                kind: TokenKind::Cmp(op),
                ..
            }) => *op,
            Some(tok) => {
                return err(
                    format!("expected comparison operator, found '{}'", tok.text),
                    tok.position,
                )
            }
            None => return err("expected comparison operator", 0),
        };
        let right = self.parse_operand()?;
        Ok(Pred::Cmp(left, op, right))
    }

    fn parse_operand(&mut self) -> Result<Operand, PathParseError> {
        match self.next().cloned() {
            Some(Token {
                kind: TokenKind::Current,
                ..
            }) => Ok(Operand::Current(self.parse_steps()?)),
            Some(Token {
                kind: TokenKind::Root,
                ..
            }) => Ok(Operand::Root(self.parse_steps()?)),
            Some(Token {
                kind: TokenKind::Var(name),
                ..
            }) => Ok(Operand::Var(name)),
            Some(Token {
                kind: TokenKind::Str(s),
                ..
            }) => Ok(Operand::Literal(Value::String(s))),
            Some(Token {
                kind: TokenKind::Num(n),
                position,
                ..
            }) => {
                let number = serde_json::Number::from_f64(n).ok_or(PathParseError {
                    message: "invalid number".to_string(),
                    position,
                })?;
                Ok(Operand::Literal(Value::Number(number)))
            }
            Some(Token {
                kind: TokenKind::Ident(word),
                position,
                ..
            }) => match word.as_str() {
                "true" => Ok(Operand::Literal(Value::Bool(true))),
                "false" => Ok(Operand::Literal(Value::Bool(false))),
                "null" => Ok(Operand::Literal(Value::Null)),
                other => err(format!("unexpected identifier '{other}'"), position),
            },
            Some(tok) => err(format!("unexpected token '{}'", tok.text), tok.position),
            None => err("expected operand", 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_steps(
    steps: &[Step],
    mut current: Vec<Value>,
    root: &Value,
    vars: Option<&Map<String, Value>>,
) -> Vec<Value> {
    for step in steps {
        let mut next = Vec::new();
        match step {
            Step::Member(name) => {
                for item in &current {
                    member_access(item, name, &mut next);
                }
            }
            Step::Wildcard => {
                for item in &current {
                    match item {
                        Value::Object(map) => next.extend(map.values().cloned()),
                        Value::Array(items) => next.extend(items.iter().cloned()),
                        _ => {}
                    }
                }
            }
            Step::Index(n) => {
                for item in &current {
                    if let Value::Array(items) = item {
                        if let Some(v) = items.get(*n as usize) {
                            next.push(v.clone());
                        }
                    }
                }
            }
            Step::AnyIndex => {
                for item in &current {
                    if let Value::Array(items) = item {
                        next.extend(items.iter().cloned());
                    }
                }
            }
            Step::Filter(pred) => {
                for item in &current {
                    // Lax mode applies the filter to array elements.
                    let candidates: Vec<&Value> = match item {
                        Value::Array(items) => items.iter().collect(),
                        other => vec![other],
                    };
                    for candidate in candidates {
                        if eval_pred(pred, candidate, root, vars) {
                            next.push(candidate.clone());
                        }
                    }
                }
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    current
}

/// Lax-mode member access: arrays unwrap one level.
fn member_access(item: &Value, name: &str, out: &mut Vec<Value>) {
    match item {
        Value::Object(map) => {
            if let Some(v) = map.get(name) {
                out.push(v.clone());
            }
        }
        Value::Array(items) => {
            for element in items {
                if let Value::Object(map) = element {
                    if let Some(v) = map.get(name) {
                        out.push(v.clone());
                    }
                }
            }
        }
        _ => {}
    }
}

fn eval_pred(
    pred: &Pred,
    current: &Value,
    root: &Value,
    vars: Option<&Map<String, Value>>,
) -> bool {
    match pred {
        Pred::Or(a, b) => {
            eval_pred(a, current, root, vars) || eval_pred(b, current, root, vars)
        }
        Pred::And(a, b) => {
            eval_pred(a, current, root, vars) && eval_pred(b, current, root, vars)
        }
        Pred::Not(inner) => !eval_pred(inner, current, root, vars),
        Pred::Exists(steps) => {
            !eval_steps(steps, vec![current.clone()], root, vars).is_empty()
        }
        Pred::Cmp(left, op, right) => {
            let lhs = operand_values(left, current, root, vars);
            let rhs = operand_values(right, current, root, vars);
            // Existential comparison semantics: any pair satisfies.
            lhs.iter()
                .any(|l| rhs.iter().any(|r| compare(l, r, *op)))
        }
    }
}

fn operand_values(
    operand: &Operand,
    current: &Value,
    root: &Value,
    vars: Option<&Map<String, Value>>,
) -> Vec<Value> {
    match operand {
        Operand::Current(steps) => unwrap_scalars(eval_steps(
            steps,
            vec![current.clone()],
            root,
            vars,
        )),
        Operand::Root(steps) => {
            unwrap_scalars(eval_steps(steps, vec![root.clone()], root, vars))
        }
        Operand::Var(name) => vars
            .and_then(|v| v.get(name))
            .map(|v| vec![v.clone()])
            .unwrap_or_default(),
        Operand::Literal(v) => vec![v.clone()],
    }
}

/// Comparison operands unwrap arrays to their elements in lax mode.
fn unwrap_scalars(values: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => out.extend(items),
            other => out.push(other),
        }
    }
    out
}

fn compare(left: &Value, right: &Value, op: CmpOp) -> bool {
    use std::cmp::Ordering;
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            }
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match ordering {
        Some(ordering) => match op {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        },
        // Cross-type comparisons are unknown, which a filter treats as false
        // except for inequality.
        None => op == CmpOp::Ne,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exists(query: &str, value: serde_json::Value) -> bool {
        JsonPath::parse(query).unwrap().exists(&value, None)
    }

    #[test]
    fn test_member_path() {
        assert!(exists("$.a", json!({"a": 1})));
        assert!(!exists("$.a", json!({"b": 1})));
        assert!(exists("$.a.b", json!({"a": {"b": null}})));
    }

    #[test]
    fn test_quoted_member() {
        assert!(exists(r#"$."order id""#, json!({"order id": 7})));
        assert!(exists(r#"$."📒""#, json!({"📒": ["00000001"]})));
    }

    #[test]
    fn test_index_and_wildcard() {
        assert!(exists("$[1]", json!([10, 20])));
        assert!(!exists("$[2]", json!([10, 20])));
        assert!(exists("$[*] ? (@ == 20)", json!([10, 20])));
        assert!(exists("$.* ? (@ == 1)", json!({"a": 1})));
    }

    #[test]
    fn test_filter_comparisons() {
        assert!(exists("$.total ? (@ > 10)", json!({"total": 42})));
        assert!(!exists("$.total ? (@ > 100)", json!({"total": 42})));
        assert!(exists(r#"$.name ? (@ == "ada")"#, json!({"name": "ada"})));
        assert!(exists("$.flag ? (@ == true)", json!({"flag": true})));
        assert!(exists("$.x ? (@ != null)", json!({"x": 3})));
    }

    #[test]
    fn test_boolean_connectives() {
        let doc = json!({"a": 1, "b": 2});
        assert!(exists("$ ? (@.a == 1 && @.b == 2)", doc.clone()));
        assert!(exists("$ ? (@.a == 9 || @.b == 2)", doc.clone()));
        assert!(!exists("$ ? (@.a == 9 && @.b == 2)", doc.clone()));
        assert!(exists("$ ? (!(@.a == 9))", doc));
    }

    #[test]
    fn test_exists_predicate() {
        assert!(exists("$ ? (exists(@.a))", json!({"a": 0})));
        assert!(!exists("$ ? (exists(@.a))", json!({"b": 0})));
    }

    #[test]
    fn test_lax_array_unwrap() {
        // Member access unwraps arrays of objects.
        assert!(exists("$.items.sku ? (@ == \"s-1\")", json!({"items": [{"sku": "s-1"}]})));
        // Filters apply per element.
        assert!(exists("$.totals ? (@ > 5)", json!({"totals": [1, 9]})));
    }

    #[test]
    fn test_vars() {
        let path = JsonPath::parse("$.total ? (@ >= $min)").unwrap();
        let vars = json!({"min": 40}).as_object().cloned().unwrap();
        assert!(path.exists(&json!({"total": 42}), Some(&vars)));
        assert!(!path.exists(&json!({"total": 39}), Some(&vars)));
        // Missing variable matches nothing.
        assert!(!path.exists(&json!({"total": 42}), None));
    }

    #[test]
    fn test_root_reference_in_filter() {
        assert!(exists("$.a ? (@ == $.b)", json!({"a": 5, "b": 5})));
    }

    #[test]
    fn test_lax_prefix_allowed_strict_rejected() {
        assert!(JsonPath::parse("lax $.a").is_ok());
        let e = JsonPath::parse("strict $.a").unwrap_err();
        assert!(e.message.contains("strict"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(JsonPath::parse("").is_err());
        assert!(JsonPath::parse("a.b").is_err());
        assert!(JsonPath::parse("$.a ? (@ >)").is_err());
        assert!(JsonPath::parse("$.a ? (@ == \"unterminated)").is_err());
        assert!(JsonPath::parse("$.a ? (@ = 1)").is_err());
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$[x]").is_err());
    }

    #[test]
    fn test_bare_root_matches_everything() {
        assert!(exists("$", json!(null)));
        assert!(exists("$", json!({"a": 1})));
    }
}
