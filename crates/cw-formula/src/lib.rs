#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use cw_record::Record;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("empty expression")]
    Empty,
    #[error("syntax error: {0}")]
    Syntax(String),
}

/// Per-record evaluation failure. Collected into a batch error list by
/// [`execute`]; a single bad record never aborts the batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("column '{column}' is missing")]
    MissingColumn { column: String },
    #[error("column '{column}' holds non-numeric value {value:?}")]
    NonNumeric { column: String, value: String },
    #[error("expression produced a non-finite value")]
    NonFinite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Column { name: String },
    Number { value: f64 },
    Neg { expr: Box<Expr> },
    Add { left: Box<Expr>, right: Box<Expr> },
    Sub { left: Box<Expr>, right: Box<Expr> },
    Mul { left: Box<Expr>, right: Box<Expr> },
    Div { left: Box<Expr>, right: Box<Expr> },
}

/// A parsed, validated arithmetic expression over column references.
///
/// `variables` is exactly the set of column-reference tokens appearing in
/// the AST. It is computed once at parse time and never recomputed, so
/// validation and evaluation always agree on the referenced columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    expression: String,
    ast: Expr,
    variables: BTreeSet<String>,
}

impl Formula {
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    #[must_use]
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    #[must_use]
    pub fn variables(&self) -> &BTreeSet<String> {
        &self.variables
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub values: Vec<Option<f64>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaPreview {
    pub formula: Formula,
    pub preview_values: Vec<Option<f64>>,
    pub errors: Vec<String>,
}

pub const DEFAULT_PREVIEW_ROWS: usize = 10;

/// Parse a formula string into an AST.
///
/// Grammar (recursive descent):
///   expr  → add
///   add   → mul ( ("+" | "-") mul )*
///   mul   → unary ( ("*" | "/") unary )*
///   unary → "-" unary | atom
///   atom  → NUMBER | IDENT | "(" expr ")"
///
/// Only the four arithmetic operators, numeric literals, bare column
/// identifiers, unary minus, and parentheses are accepted. No function
/// calls, no string literals, no assignment.
pub fn parse(input: &str) -> Result<Formula, FormulaError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(FormulaError::Empty);
    }

    let mut pos = 0;
    let ast = parse_add(&tokens, &mut pos)?;
    if pos < tokens.len() {
        return Err(FormulaError::Syntax(format!(
            "unexpected token at position {pos}: {:?}",
            tokens[pos]
        )));
    }

    let mut variables = BTreeSet::new();
    extract_variables(&ast, &mut variables);

    Ok(Formula {
        expression: input.to_owned(),
        ast,
        variables,
    })
}

/// Validate a parsed formula against the columns currently known for a
/// dataset. Referenced columns that are absent are errors; a formula with
/// no column references at all is legal but flagged with a warning (it is
/// a constant).
#[must_use]
pub fn validate(formula: &Formula, known_columns: &[String]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for variable in formula.variables() {
        if !known_columns.iter().any(|column| column == variable) {
            errors.push(format!("Column '{variable}' not found in dataset"));
        }
    }

    if formula.variables().is_empty() {
        warnings.push("formula has no column references; every row will get the same constant value".to_owned());
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Evaluate a formula against one record under strict coercion: a
/// referenced field that is absent, null, or non-numeric (beyond a trimmed
/// parse) fails this record. Non-finite results (division by zero) fail
/// the record as well rather than leaking `inf` into stored output.
pub fn evaluate(formula: &Formula, record: &Record) -> Result<f64, EvalError> {
    let value = eval_expr(formula.ast(), record)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EvalError::NonFinite)
    }
}

/// Evaluate a formula over a batch of records. Failing records yield
/// `None` and append a message; the remaining records are unaffected.
#[must_use]
pub fn execute(formula: &Formula, records: &[Record]) -> ExecutionResult {
    let mut values = Vec::with_capacity(records.len());
    let mut errors = Vec::new();

    for record in records {
        match evaluate(formula, record) {
            Ok(value) => values.push(Some(value)),
            Err(err) => {
                values.push(None);
                errors.push(format!("record {}: {err}", record.index()));
            }
        }
    }

    ExecutionResult { values, errors }
}

/// Parse, validate, then evaluate over at most `limit` records. If
/// validation fails, no evaluation is attempted: `preview_values` comes
/// back empty with the validation errors populated.
pub fn preview(
    expression: &str,
    records: &[Record],
    known_columns: &[String],
    limit: Option<usize>,
) -> Result<FormulaPreview, FormulaError> {
    let formula = parse(expression)?;
    let report = validate(&formula, known_columns);

    if !report.is_valid {
        return Ok(FormulaPreview {
            formula,
            preview_values: Vec::new(),
            errors: report.errors,
        });
    }

    let limit = limit.unwrap_or(DEFAULT_PREVIEW_ROWS);
    let sample = &records[..records.len().min(limit)];
    let result = execute(&formula, sample);

    Ok(FormulaPreview {
        formula,
        preview_values: result.values,
        errors: result.errors,
    })
}

fn eval_expr(expr: &Expr, record: &Record) -> Result<f64, EvalError> {
    match expr {
        Expr::Number { value } => Ok(*value),
        Expr::Column { name } => {
            let value = record
                .field(name)
                .ok_or_else(|| EvalError::MissingColumn {
                    column: name.clone(),
                })?;
            if value.is_missing() {
                return Err(EvalError::MissingColumn {
                    column: name.clone(),
                });
            }
            value.strict_number().map_err(|_| EvalError::NonNumeric {
                column: name.clone(),
                value: value.label(),
            })
        }
        Expr::Neg { expr } => Ok(-eval_expr(expr, record)?),
        Expr::Add { left, right } => Ok(eval_expr(left, record)? + eval_expr(right, record)?),
        Expr::Sub { left, right } => Ok(eval_expr(left, record)? - eval_expr(right, record)?),
        Expr::Mul { left, right } => Ok(eval_expr(left, record)? * eval_expr(right, record)?),
        Expr::Div { left, right } => Ok(eval_expr(left, record)? / eval_expr(right, record)?),
    }
}

fn extract_variables(expr: &Expr, variables: &mut BTreeSet<String>) {
    match expr {
        Expr::Column { name } => {
            variables.insert(name.clone());
        }
        Expr::Number { .. } => {}
        Expr::Neg { expr } => extract_variables(expr, variables),
        Expr::Add { left, right }
        | Expr::Sub { left, right }
        | Expr::Mul { left, right }
        | Expr::Div { left, right } => {
            extract_variables(left, variables);
            extract_variables(right, variables);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
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
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let number: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(number.parse::<f64>().map_err(|_| {
                    FormulaError::Syntax(format!("invalid number: {number}"))
                })?));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                return Err(FormulaError::Syntax(format!("unexpected character: '{c}'")));
            }
        }
    }

    Ok(tokens)
}

fn parse_add(tokens: &[Token], pos: &mut usize) -> Result<Expr, FormulaError> {
    let mut left = parse_mul(tokens, pos)?;
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Plus => {
                *pos += 1;
                let right = parse_mul(tokens, pos)?;
                left = Expr::Add {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            Token::Minus => {
                *pos += 1;
                let right = parse_mul(tokens, pos)?;
                left = Expr::Sub {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_mul(tokens: &[Token], pos: &mut usize) -> Result<Expr, FormulaError> {
    let mut left = parse_unary(tokens, pos)?;
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Star => {
                *pos += 1;
                let right = parse_unary(tokens, pos)?;
                left = Expr::Mul {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            Token::Slash => {
                *pos += 1;
                let right = parse_unary(tokens, pos)?;
                left = Expr::Div {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<Expr, FormulaError> {
    if *pos < tokens.len() && tokens[*pos] == Token::Minus {
        *pos += 1;
        let inner = parse_unary(tokens, pos)?;
        return Ok(Expr::Neg {
            expr: Box::new(inner),
        });
    }
    parse_atom(tokens, pos)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<Expr, FormulaError> {
    if *pos >= tokens.len() {
        return Err(FormulaError::Syntax("unexpected end of expression".into()));
    }
    match &tokens[*pos] {
        Token::Number(value) => {
            let value = *value;
            *pos += 1;
            Ok(Expr::Number { value })
        }
        Token::Ident(name) => {
            let name = name.clone();
            *pos += 1;
            Ok(Expr::Column { name })
        }
        Token::LParen => {
            *pos += 1;
            let inner = parse_add(tokens, pos)?;
            if *pos >= tokens.len() || tokens[*pos] != Token::RParen {
                return Err(FormulaError::Syntax("expected closing ')'".into()));
            }
            *pos += 1;
            Ok(inner)
        }
        other => Err(FormulaError::Syntax(format!("unexpected token: {other:?}"))),
    }
}
