//! Condition evaluation for `if_else` nodes.
//!
//! Conditions are written in a small, closed expression grammar evaluated
//! directly against cached node outputs; no general-purpose interpreter is
//! ever invoked on condition text.
//!
//! Grammar:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ("==" | "!=" | "<=" | ">=" | "<" | ">") unary )?
//! unary   := "!" unary | primary
//! primary := number | string | true | false | null
//!          | "${" nodeId ("." field)* "}"
//!          | "(" expr ")"
//! ```
//!
//! Anything outside the grammar is a parse error; the orchestrator treats
//! that as a node configuration problem, records `false`, and continues.

use serde_json::Value;
use thiserror::Error;

use crate::executor::OutputsView;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
  #[error("unexpected character '{found}' at offset {offset}")]
  UnexpectedChar { found: char, offset: usize },

  #[error("unterminated string literal at offset {offset}")]
  UnterminatedString { offset: usize },

  #[error("unterminated reference at offset {offset}")]
  UnterminatedRef { offset: usize },

  #[error("unexpected token: {found}")]
  UnexpectedToken { found: String },

  #[error("unexpected end of expression")]
  UnexpectedEnd,

  #[error("empty condition expression")]
  Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
  Number(f64),
  Str(String),
  Bool(bool),
  Null,
  /// `${node.path.to.field}`
  Reference(Vec<String>),
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
  And,
  Or,
  Not,
  LParen,
  RParen,
}

impl Token {
  fn describe(&self) -> String {
    match self {
      Token::Number(n) => n.to_string(),
      Token::Str(s) => format!("'{s}'"),
      Token::Bool(b) => b.to_string(),
      Token::Null => "null".to_string(),
      Token::Reference(path) => format!("${{{}}}", path.join(".")),
      Token::Eq => "==".to_string(),
      Token::Ne => "!=".to_string(),
      Token::Lt => "<".to_string(),
      Token::Le => "<=".to_string(),
      Token::Gt => ">".to_string(),
      Token::Ge => ">=".to_string(),
      Token::And => "&&".to_string(),
      Token::Or => "||".to_string(),
      Token::Not => "!".to_string(),
      Token::LParen => "(".to_string(),
      Token::RParen => ")".to_string(),
    }
  }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
  let chars: Vec<char> = input.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    match c {
      ' ' | '\t' | '\n' | '\r' => i += 1,
      '(' => {
        tokens.push(Token::LParen);
        i += 1;
      }
      ')' => {
        tokens.push(Token::RParen);
        i += 1;
      }
      '=' if chars.get(i + 1) == Some(&'=') => {
        tokens.push(Token::Eq);
        i += 2;
      }
      '!' if chars.get(i + 1) == Some(&'=') => {
        tokens.push(Token::Ne);
        i += 2;
      }
      '!' => {
        tokens.push(Token::Not);
        i += 1;
      }
      '<' if chars.get(i + 1) == Some(&'=') => {
        tokens.push(Token::Le);
        i += 2;
      }
      '<' => {
        tokens.push(Token::Lt);
        i += 1;
      }
      '>' if chars.get(i + 1) == Some(&'=') => {
        tokens.push(Token::Ge);
        i += 2;
      }
      '>' => {
        tokens.push(Token::Gt);
        i += 1;
      }
      '&' if chars.get(i + 1) == Some(&'&') => {
        tokens.push(Token::And);
        i += 2;
      }
      '|' if chars.get(i + 1) == Some(&'|') => {
        tokens.push(Token::Or);
        i += 2;
      }
      '\'' | '"' => {
        let quote = c;
        let start = i;
        i += 1;
        let mut s = String::new();
        loop {
          match chars.get(i) {
            Some(&ch) if ch == quote => {
              i += 1;
              break;
            }
            Some(&ch) => {
              s.push(ch);
              i += 1;
            }
            None => return Err(ConditionError::UnterminatedString { offset: start }),
          }
        }
        tokens.push(Token::Str(s));
      }
      '$' if chars.get(i + 1) == Some(&'{') => {
        let start = i;
        i += 2;
        let mut body = String::new();
        loop {
          match chars.get(i) {
            Some('}') => {
              i += 1;
              break;
            }
            Some(&ch) => {
              body.push(ch);
              i += 1;
            }
            None => return Err(ConditionError::UnterminatedRef { offset: start }),
          }
        }
        let path: Vec<String> = body
          .split('.')
          .map(|s| s.trim().to_string())
          .filter(|s| !s.is_empty())
          .collect();
        if path.is_empty() {
          return Err(ConditionError::UnterminatedRef { offset: start });
        }
        tokens.push(Token::Reference(path));
      }
      '0'..='9' | '-' => {
        let start = i;
        i += 1;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
          i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        let number = text
          .parse::<f64>()
          .map_err(|_| ConditionError::UnexpectedChar { found: c, offset: start })?;
        tokens.push(Token::Number(number));
      }
      'a'..='z' | 'A'..='Z' | '_' => {
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
          i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        match word.as_str() {
          "true" => tokens.push(Token::Bool(true)),
          "false" => tokens.push(Token::Bool(false)),
          "null" => tokens.push(Token::Null),
          other => {
            return Err(ConditionError::UnexpectedToken {
              found: other.to_string(),
            });
          }
        }
      }
      other => {
        return Err(ConditionError::UnexpectedChar {
          found: other,
          offset: i,
        });
      }
    }
  }

  Ok(tokens)
}

struct Parser<'a> {
  tokens: &'a [Token],
  pos: usize,
  outputs: &'a dyn OutputsView,
}

impl<'a> Parser<'a> {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn advance(&mut self) -> Option<&Token> {
    let token = self.tokens.get(self.pos);
    if token.is_some() {
      self.pos += 1;
    }
    token
  }

  fn or_expr(&mut self) -> Result<Value, ConditionError> {
    let mut left = self.and_expr()?;
    while self.peek() == Some(&Token::Or) {
      self.advance();
      let right = self.and_expr()?;
      left = Value::Bool(truthy(&left) || truthy(&right));
    }
    Ok(left)
  }

  fn and_expr(&mut self) -> Result<Value, ConditionError> {
    let mut left = self.cmp_expr()?;
    while self.peek() == Some(&Token::And) {
      self.advance();
      let right = self.cmp_expr()?;
      left = Value::Bool(truthy(&left) && truthy(&right));
    }
    Ok(left)
  }

  fn cmp_expr(&mut self) -> Result<Value, ConditionError> {
    let left = self.unary_expr()?;
    let op = match self.peek() {
      Some(Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge) => {
        self.advance().cloned()
      }
      _ => return Ok(left),
    };
    let right = self.unary_expr()?;

    let result = match op {
      Some(Token::Eq) => loose_eq(&left, &right),
      Some(Token::Ne) => !loose_eq(&left, &right),
      Some(Token::Lt) => ordering(&left, &right, |o| o.is_lt()),
      Some(Token::Le) => ordering(&left, &right, |o| o.is_le()),
      Some(Token::Gt) => ordering(&left, &right, |o| o.is_gt()),
      Some(Token::Ge) => ordering(&left, &right, |o| o.is_ge()),
      _ => unreachable!("comparison operator checked above"),
    };
    Ok(Value::Bool(result))
  }

  fn unary_expr(&mut self) -> Result<Value, ConditionError> {
    if self.peek() == Some(&Token::Not) {
      self.advance();
      let value = self.unary_expr()?;
      return Ok(Value::Bool(!truthy(&value)));
    }
    self.primary()
  }

  fn primary(&mut self) -> Result<Value, ConditionError> {
    let token = self.advance().cloned().ok_or(ConditionError::UnexpectedEnd)?;
    match token {
      Token::Number(n) => Ok(serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)),
      Token::Str(s) => Ok(Value::String(s)),
      Token::Bool(b) => Ok(Value::Bool(b)),
      Token::Null => Ok(Value::Null),
      Token::Reference(path) => Ok(self.resolve(&path)),
      Token::LParen => {
        let value = self.or_expr()?;
        match self.advance() {
          Some(Token::RParen) => Ok(value),
          Some(other) => Err(ConditionError::UnexpectedToken {
            found: other.describe(),
          }),
          None => Err(ConditionError::UnexpectedEnd),
        }
      }
      other => Err(ConditionError::UnexpectedToken {
        found: other.describe(),
      }),
    }
  }

  /// Resolve `${node.path}` against cached outputs; missing data is null.
  fn resolve(&self, path: &[String]) -> Value {
    let Some(root) = self.outputs.get(&path[0]) else {
      return Value::Null;
    };
    let mut current: &Value = root.as_ref();
    for segment in &path[1..] {
      match current {
        Value::Object(map) => match map.get(segment) {
          Some(next) => current = next,
          None => return Value::Null,
        },
        Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
          Some(next) => current = next,
          None => return Value::Null,
        },
        _ => return Value::Null,
      }
    }
    current.clone()
  }
}

fn truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    Value::String(s) => !s.is_empty(),
    Value::Array(items) => !items.is_empty(),
    Value::Object(map) => !map.is_empty(),
  }
}

/// Equality with numeric coercion: `"5" == 5` holds, otherwise JSON equality.
fn loose_eq(left: &Value, right: &Value) -> bool {
  if left == right {
    return true;
  }
  match (as_number(left), as_number(right)) {
    (Some(a), Some(b)) => a == b,
    _ => false,
  }
}

fn as_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

/// Ordering comparison: numeric when both sides coerce to numbers,
/// lexicographic for two strings, false for anything else.
fn ordering(left: &Value, right: &Value, check: fn(std::cmp::Ordering) -> bool) -> bool {
  if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
    return a.partial_cmp(&b).is_some_and(check);
  }
  if let (Value::String(a), Value::String(b)) = (left, right) {
    return check(a.cmp(b));
  }
  false
}

/// Evaluate a condition expression against cached outputs.
///
/// # Errors
/// Fails when the expression falls outside the grammar; evaluation itself
/// never fails (missing references are null, mixed-type ordering is false).
pub fn evaluate_condition(
  expression: &str,
  outputs: &dyn OutputsView,
) -> Result<bool, ConditionError> {
  let tokens = tokenize(expression)?;
  if tokens.is_empty() {
    return Err(ConditionError::Empty);
  }

  let mut parser = Parser {
    tokens: &tokens,
    pos: 0,
    outputs,
  };
  let value = parser.or_expr()?;
  if parser.pos < tokens.len() {
    return Err(ConditionError::UnexpectedToken {
      found: tokens[parser.pos].describe(),
    });
  }
  Ok(truthy(&value))
}

/// Resolve a switch node's inspected field from its input.
///
/// Dotted paths walk nested objects; the scalar result is compared by its
/// string form.
pub fn resolve_field(input: &Value, field: &str) -> Option<String> {
  let mut current = input;
  for segment in field.split('.') {
    match current {
      Value::Object(map) => current = map.get(segment)?,
      _ => return None,
    }
  }
  match current {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    Value::Null => None,
    other => Some(other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::executor::OutputsSnapshot;
  use serde_json::json;

  fn outputs() -> OutputsSnapshot {
    OutputsSnapshot::new(
      [
        ("count".to_string(), json!({ "value": 5 })),
        ("name".to_string(), json!("alice")),
        ("flags".to_string(), json!({ "ready": true, "items": [1, 2] })),
      ]
      .into(),
    )
  }

  fn eval(expr: &str) -> Result<bool, ConditionError> {
    evaluate_condition(expr, &outputs())
  }

  #[test]
  fn test_literals_and_connectives() {
    assert!(eval("true").unwrap());
    assert!(!eval("false").unwrap());
    assert!(eval("true && !false").unwrap());
    assert!(eval("false || true").unwrap());
    assert!(!eval("null").unwrap());
  }

  #[test]
  fn test_comparisons() {
    assert!(eval("1 < 2").unwrap());
    assert!(eval("2 >= 2").unwrap());
    assert!(eval("'a' < 'b'").unwrap());
    assert!(eval("3 != 4").unwrap());
    // Mixed-type ordering is false, not an error.
    assert!(!eval("'a' < 1").unwrap());
  }

  #[test]
  fn test_reference_resolution() {
    assert!(eval("${count.value} == 5").unwrap());
    assert!(eval("${name} == 'alice'").unwrap());
    assert!(eval("${flags.ready}").unwrap());
    assert!(eval("${flags.items.1} == 2").unwrap());
  }

  #[test]
  fn test_missing_reference_is_null() {
    assert!(eval("${ghost} == null").unwrap());
    assert!(!eval("${count.missing.deep}").unwrap());
  }

  #[test]
  fn test_numeric_coercion_in_equality() {
    let outputs = OutputsSnapshot::new([("n".to_string(), json!("5"))].into());
    assert!(evaluate_condition("${n} == 5", &outputs).unwrap());
  }

  #[test]
  fn test_precedence_and_parens() {
    assert!(eval("1 == 1 && 2 == 2").unwrap());
    assert!(eval("false || (1 < 2 && ${flags.ready})").unwrap());
    assert!(!eval("!(1 < 2)").unwrap());
  }

  #[test]
  fn test_out_of_grammar_is_an_error() {
    assert!(eval("").is_err());
    assert!(eval("1 +").is_err());
    assert!(eval("process(exit)").is_err());
    assert!(eval("${unterminated").is_err());
    assert!(eval("'unterminated").is_err());
    assert!(eval("2 == ").is_err());
    assert!(eval("true true").is_err());
  }

  #[test]
  fn test_resolve_field_paths() {
    let input = json!({ "user": { "role": "admin", "age": 7 }, "ok": true });
    assert_eq!(resolve_field(&input, "user.role"), Some("admin".into()));
    assert_eq!(resolve_field(&input, "user.age"), Some("7".into()));
    assert_eq!(resolve_field(&input, "ok"), Some("true".into()));
    assert_eq!(resolve_field(&input, "missing"), None);
  }
}
