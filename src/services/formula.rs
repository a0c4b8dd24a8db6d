//! Arithmetic formulas over named sub-query metrics (e.g. `a/b`, `(a+b)*100`)

use std::collections::BTreeSet;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            BinaryOp::Add => left + right,
            BinaryOp::Subtract => left - right,
            BinaryOp::Multiply => left * right,
            // x/0 evaluates to 0
            BinaryOp::Divide if right == 0.0 => 0.0,
            BinaryOp::Divide => left / right,
        }
    }
}

/// Formula expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Sub-query reference by name (lowercased)
    Variable(String),
    Literal(f64),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Variable(name) => {
                out.insert(name.clone());
            }
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
        }
    }

    fn evaluate<F>(&self, lookup: &F) -> Result<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            Expr::Variable(name) => lookup(name).ok_or_else(|| {
                AppError::InvalidInput(format!("Unknown formula variable '{}'", name))
            }),
            Expr::Literal(value) => Ok(*value),
            Expr::Binary { op, left, right } => {
                let value = op.apply(left.evaluate(lookup)?, right.evaluate(lookup)?);
                Ok(if value.is_finite() { value } else { 0.0 })
            }
        }
    }
}

/// A parsed derived-metric formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(AppError::InvalidInput("Empty formula".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(AppError::InvalidInput(format!(
                "Invalid arithmetic formula '{}'",
                source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Distinct variable names referenced by the formula.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.expr.collect_variables(&mut out);
        out
    }

    /// Evaluate with `lookup` supplying each variable's value.
    pub fn evaluate<F>(&self, lookup: F) -> Result<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        self.expr.evaluate(&lookup)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(BinaryOp),
    Open,
    Close,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Op(BinaryOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinaryOp::Subtract));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinaryOp::Multiply));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinaryOp::Divide));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal.parse::<f64>().map_err(|_| {
                    AppError::InvalidInput(format!("Invalid number '{}' in formula", literal))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(ident.to_lowercase()));
            }
            other => {
                return Err(AppError::InvalidInput(format!(
                    "Unexpected character '{}' in formula",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

/// Recursive descent: expression := term (('+'|'-') term)*,
/// term := factor (('*'|'/') factor)*, factor := '-' factor | atom.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while let Some(Token::Op(op @ (BinaryOp::Add | BinaryOp::Subtract))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        while let Some(Token::Op(op @ (BinaryOp::Multiply | BinaryOp::Divide))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr> {
        if let Some(Token::Op(BinaryOp::Subtract)) = self.peek() {
            self.pos += 1;
            let operand = self.factor()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Subtract,
                left: Box::new(Expr::Literal(0.0)),
                right: Box::new(operand),
            });
        }

        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
            Some(Token::Number(value)) => Ok(Expr::Literal(value)),
            Some(Token::Open) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(AppError::InvalidInput("Unbalanced parentheses in formula".into())),
                }
            }
            _ => Err(AppError::InvalidInput("Invalid arithmetic formula".into())),
        }
    }
}
