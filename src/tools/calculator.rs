//! Deterministic arithmetic evaluation for numeric cross-checks.
//!
//! The tool keeps the wire name `python_calculator` so existing profiles and
//! the working-memory contract keep working; evaluation is a native
//! shunting-yard over `+ - * /` and parentheses.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

use crate::codes::TOOL_MISSING_EXPRESSION;
use crate::model::ToolResult;

use super::{AgentTool, ToolInvocation};

pub const CALCULATOR_TOOL: &str = "python_calculator";

/// Conservative extraction of a plain arithmetic expression from a query.
pub fn infer_expression(query: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?(?:\s*[\+\-\*/]\s*\(?\d+(?:\.\d+)?\)?)+)")
            .unwrap()
    });
    pattern
        .captures(query)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().trim().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Operator(char),
    OpenParen,
    CloseParen,
}

fn tokenize(expression: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        let c = chars[index];
        match c {
            ' ' | '\t' => index += 1,
            '(' => {
                tokens.push(Token::OpenParen);
                index += 1;
            }
            ')' => {
                tokens.push(Token::CloseParen);
                index += 1;
            }
            '+' | '*' | '/' => {
                tokens.push(Token::Operator(c));
                index += 1;
            }
            '-' => {
                // Unary minus folds into the following number.
                let unary = matches!(
                    tokens.last(),
                    None | Some(Token::Operator(_)) | Some(Token::OpenParen)
                );
                if unary {
                    let (number, consumed) = read_number(&chars[index + 1..])?;
                    tokens.push(Token::Number(-number));
                    index += consumed + 1;
                } else {
                    tokens.push(Token::Operator('-'));
                    index += 1;
                }
            }
            '0'..='9' | '.' => {
                let (number, consumed) = read_number(&chars[index..])?;
                tokens.push(Token::Number(number));
                index += consumed;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

fn read_number(chars: &[char]) -> Result<(f64, usize), String> {
    let mut end = 0;
    while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
        end += 1;
    }
    if end == 0 {
        return Err("expected a number".to_string());
    }
    let text: String = chars[..end].iter().collect();
    text.parse::<f64>()
        .map(|number| (number, end))
        .map_err(|_| format!("invalid number '{text}'"))
}

fn precedence(operator: char) -> u8 {
    match operator {
        '*' | '/' => 2,
        _ => 1,
    }
}

fn apply(output: &mut Vec<f64>, operator: char) -> Result<(), String> {
    let right = output.pop().ok_or("missing operand")?;
    let left = output.pop().ok_or("missing operand")?;
    let value = match operator {
        '+' => left + right,
        '-' => left - right,
        '*' => left * right,
        '/' => {
            if right == 0.0 {
                return Err("division by zero".to_string());
            }
            left / right
        }
        other => return Err(format!("unknown operator '{other}'")),
    };
    output.push(value);
    Ok(())
}

/// Evaluate an infix arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut output: Vec<f64> = Vec::new();
    let mut operators: Vec<Token> = Vec::new();
    for token in tokens {
        match token {
            Token::Number(number) => output.push(number),
            Token::Operator(op) => {
                while let Some(Token::Operator(top)) = operators.last().copied() {
                    if precedence(top) >= precedence(op) {
                        operators.pop();
                        apply(&mut output, top)?;
                    } else {
                        break;
                    }
                }
                operators.push(Token::Operator(op));
            }
            Token::OpenParen => operators.push(Token::OpenParen),
            Token::CloseParen => loop {
                match operators.pop() {
                    Some(Token::Operator(op)) => apply(&mut output, op)?,
                    Some(Token::OpenParen) => break,
                    _ => return Err("unbalanced parentheses".to_string()),
                }
            },
        }
    }
    while let Some(token) = operators.pop() {
        match token {
            Token::Operator(op) => apply(&mut output, op)?,
            _ => return Err("unbalanced parentheses".to_string()),
        }
    }
    if output.len() != 1 {
        return Err("malformed expression".to_string());
    }
    Ok(output[0])
}

/// The calculator tool.
#[derive(Debug, Default)]
pub struct CalculatorTool;

#[async_trait]
impl AgentTool for CalculatorTool {
    fn name(&self) -> &'static str {
        CALCULATOR_TOOL
    }

    async fn run(&self, invocation: ToolInvocation<'_>) -> ToolResult {
        let expression = invocation
            .payload
            .get("expression")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let Some(expression) = expression else {
            return ToolResult::failure(CALCULATOR_TOOL, TOOL_MISSING_EXPRESSION);
        };
        match evaluate(&expression) {
            Ok(result) => {
                let mut output = Map::new();
                // Integral results serialize without a trailing fraction.
                if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
                    output.insert("result".to_string(), json!(result as i64));
                } else {
                    output.insert("result".to_string(), json!(result));
                }
                output.insert("expression".to_string(), json!(expression));
                ToolResult::success(CALCULATOR_TOOL, output)
            }
            Err(message) => {
                ToolResult::failure(CALCULATOR_TOOL, format!("tool_error: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_precedence_and_parentheses() {
        assert_eq!(evaluate("5*(20+2)").unwrap(), 110.0);
        assert_eq!(evaluate("2+3*4").unwrap(), 14.0);
        assert_eq!(evaluate("(2+3)*4").unwrap(), 20.0);
    }

    #[test]
    fn test_unary_minus_and_decimals() {
        assert_eq!(evaluate("-3 + 5").unwrap(), 2.0);
        assert_eq!(evaluate("2 * -1.5").unwrap(), -3.0);
    }

    #[test]
    fn test_division_by_zero_rejected() {
        assert!(evaluate("1/0").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1+2").is_err());
    }

    #[test]
    fn test_infer_expression_from_query() {
        assert_eq!(
            infer_expression("Calcula 5*(20+2) con los límites del 9.1").as_deref(),
            Some("5*(20+2)")
        );
        assert_eq!(infer_expression("que exige 9.1"), None);
    }
}
