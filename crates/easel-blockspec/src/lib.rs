#![forbid(unsafe_code)]

//! Parser for the block-spec mini-language used by workspace create and
//! replace commands.
//!
//! A spec is a block name followed by a parenthesized body, conventionally
//! wrapped in `inputs(...)`, holding `KEY: value` pairs:
//!
//! ```text
//! set_variable(inputs(VAR: count, VALUE: get_json(inputs(PATH: "a.b"))))
//! ```
//!
//! Values are nested specs, numbers, booleans, quoted or bare strings, or
//! bare marker keys (`ELSE`). Positional values (no `KEY:`) are accepted
//! wherever a pair is. Parentheses and commas inside quoted strings are
//! literal; a backslash keeps the following quote literal as well.
//!
//! Parsing yields a [`BlockSpec`] tree or a structured [`BlockSpecError`]
//! whose delimiter diagnostics are count-accurate. [`parse_with_repair`]
//! additionally patches the one recoverable mistake remote agents make
//! constantly: exactly one missing trailing `)`.

use std::fmt;

/// One parsed `name(...)` node.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub name: String,
    pub inputs: Vec<BlockInput>,
}

/// A single entry in a block body: named (`KEY: value`), a bare marker
/// key (`ELSE`), or a positional value.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInput {
    /// `None` for positional values.
    pub name: Option<String>,
    pub value: BlockValue,
}

/// The value grammar for a single input.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockValue {
    /// A nested block spec.
    Block(BlockSpec),
    /// Quoted (outer quotes stripped) or bare text.
    Text(String),
    Number(f64),
    Bool(bool),
    /// A bare key with no `:` value, e.g. an `ELSE` arm marker.
    Marker,
}

impl fmt::Display for BlockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockValue::Block(spec) => write!(f, "{}(...)", spec.name),
            BlockValue::Text(text) => write!(f, "{text:?}"),
            BlockValue::Number(n) => write!(f, "{n}"),
            BlockValue::Bool(b) => write!(f, "{b}"),
            BlockValue::Marker => f.write_str("<marker>"),
        }
    }
}

/// Structured syntax errors. Delimiter counts are exact so callers can
/// report precisely what is missing or superfluous.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockSpecError {
    #[error("block spec is missing {missing} closing ')'")]
    UnclosedGroups { missing: usize },
    #[error("block spec has {extra} extra closing ')'")]
    UnbalancedClose { extra: usize },
    #[error("unterminated {quote}-quoted string")]
    UnterminatedString { quote: char },
    #[error("expected a block name followed by '(', got '{head}'")]
    InvalidHead { head: String },
    #[error("expected ',' or ')' at offset {at}")]
    ExpectedSeparator { at: usize },
    #[error("expected ')' at offset {at}")]
    ExpectedClose { at: usize },
    #[error("unexpected content after the final ')' at offset {at}")]
    TrailingInput { at: usize },
}

/// A spec that passed structural validation, plus the exact text to
/// submit (patched when a repair was applied).
#[derive(Debug, Clone, PartialEq)]
pub struct CheckedSpec {
    pub spec: BlockSpec,
    pub text: String,
    pub repaired: bool,
}

/// Parses a block spec into its AST.
pub fn parse(input: &str) -> Result<BlockSpec, BlockSpecError> {
    let mut parser = Parser::new(input);
    parser.skip_ws();
    let name = parser.read_ident();
    if name.is_empty() {
        return Err(BlockSpecError::InvalidHead {
            head: head_snippet(input),
        });
    }
    parser.skip_ws();
    if !parser.consume_byte(b'(') {
        return Err(BlockSpecError::InvalidHead {
            head: head_snippet(input),
        });
    }
    parser.open_groups += 1;
    let spec = parser.parse_group_body(name)?;
    parser.check_trailing()?;
    Ok(spec)
}

/// Parses a block spec, tolerating exactly one missing trailing `)`.
///
/// When the only structural defect is a single unclosed group, a `)` is
/// appended and the patched text re-parsed; the returned [`CheckedSpec`]
/// carries the text that should actually be submitted. Any other defect
/// (two or more missing, extra closers, bad quoting) is returned as-is.
pub fn parse_with_repair(input: &str) -> Result<CheckedSpec, BlockSpecError> {
    match parse(input) {
        Ok(spec) => Ok(CheckedSpec {
            spec,
            text: input.to_string(),
            repaired: false,
        }),
        Err(BlockSpecError::UnclosedGroups { missing: 1 }) => {
            let patched = format!("{input})");
            let spec = parse(&patched)?;
            Ok(CheckedSpec {
                spec,
                text: patched,
                repaired: true,
            })
        }
        Err(err) => Err(err),
    }
}

fn head_snippet(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        "(empty)".to_string()
    } else {
        trimmed.chars().take(32).collect()
    }
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    /// Groups opened and not yet closed; reported verbatim on EOF.
    open_groups: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            open_groups: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn consume_byte(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if is_ident_byte(byte) {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    /// Body of a block whose `(` has already been consumed: optional
    /// `inputs(...)` wrapper, the items, and the matching `)`.
    fn parse_group_body(&mut self, name: String) -> Result<BlockSpec, BlockSpecError> {
        self.skip_ws();
        let inputs = if self.try_consume_inputs_wrapper() {
            let items = self.parse_items()?;
            self.expect_close()?;
            self.skip_ws();
            items
        } else {
            self.parse_items()?
        };
        self.expect_close()?;
        Ok(BlockSpec { name, inputs })
    }

    /// Recognizes a leading `inputs(` wrapper without committing to it:
    /// `inputs: 5` stays a named input.
    fn try_consume_inputs_wrapper(&mut self) -> bool {
        let saved = self.pos;
        let ident = self.read_ident();
        if ident == "inputs" {
            self.skip_ws();
            if self.consume_byte(b'(') {
                self.open_groups += 1;
                return true;
            }
        }
        self.pos = saved;
        false
    }

    fn parse_items(&mut self) -> Result<Vec<BlockInput>, BlockSpecError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b')') => break,
                None => {
                    return Err(BlockSpecError::UnclosedGroups {
                        missing: self.open_groups,
                    });
                }
                Some(_) => {}
            }
            items.push(self.parse_item()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b')') => break,
                None => {
                    return Err(BlockSpecError::UnclosedGroups {
                        missing: self.open_groups,
                    });
                }
                Some(_) => {
                    return Err(BlockSpecError::ExpectedSeparator { at: self.pos });
                }
            }
        }
        Ok(items)
    }

    fn parse_item(&mut self) -> Result<BlockInput, BlockSpecError> {
        let item_start = self.pos;
        match self.peek() {
            Some(b'"' | b'\'') => {
                let text = self.read_quoted()?;
                Ok(BlockInput {
                    name: None,
                    value: BlockValue::Text(text),
                })
            }
            Some(byte) if is_ident_byte(byte) => {
                let ident = self.read_ident();
                self.skip_ws();
                match self.peek() {
                    Some(b':') => {
                        self.pos += 1;
                        let value = self.parse_value()?;
                        Ok(BlockInput {
                            name: Some(ident),
                            value,
                        })
                    }
                    Some(b'(') => {
                        self.pos += 1;
                        self.open_groups += 1;
                        let nested = self.parse_group_body(ident)?;
                        Ok(BlockInput {
                            name: None,
                            value: BlockValue::Block(nested),
                        })
                    }
                    Some(b',' | b')') | None => Ok(bare_item(ident)),
                    Some(_) => {
                        // Something like `hello world`: not an identifier
                        // after all, re-read the run as bare text.
                        self.pos = item_start;
                        let run = self.read_bare_run()?;
                        Ok(BlockInput {
                            name: None,
                            value: classify_bare(&run),
                        })
                    }
                }
            }
            _ => {
                let run = self.read_bare_run()?;
                Ok(BlockInput {
                    name: None,
                    value: classify_bare(&run),
                })
            }
        }
    }

    fn parse_value(&mut self) -> Result<BlockValue, BlockSpecError> {
        self.skip_ws();
        match self.peek() {
            Some(b'"' | b'\'') => Ok(BlockValue::Text(self.read_quoted()?)),
            Some(byte) if is_ident_byte(byte) => {
                let saved = self.pos;
                let ident = self.read_ident();
                self.skip_ws();
                if self.consume_byte(b'(') {
                    self.open_groups += 1;
                    let nested = self.parse_group_body(ident)?;
                    Ok(BlockValue::Block(nested))
                } else {
                    self.pos = saved;
                    let run = self.read_bare_run()?;
                    Ok(classify_bare(&run))
                }
            }
            _ => {
                let run = self.read_bare_run()?;
                Ok(classify_bare(&run))
            }
        }
    }

    /// Raw text until a top-level `,` or the enclosing `)`. Parens nest,
    /// quoted stretches are opaque, nothing is consumed past the stop
    /// character.
    fn read_bare_run(&mut self) -> Result<String, BlockSpecError> {
        let start = self.pos;
        let mut local_depth = 0usize;
        while let Some(byte) = self.peek() {
            match byte {
                b'"' | b'\'' => {
                    self.read_quoted()?;
                    continue;
                }
                b'(' => {
                    local_depth += 1;
                    self.open_groups += 1;
                }
                b')' => {
                    if local_depth == 0 {
                        break;
                    }
                    local_depth -= 1;
                    self.open_groups -= 1;
                }
                b',' if local_depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        Ok(self.src[start..self.pos].trim().to_string())
    }

    /// Consumes a quoted string and returns its content with the outer
    /// quotes stripped; interior escapes are preserved verbatim.
    fn read_quoted(&mut self) -> Result<String, BlockSpecError> {
        let quote = match self.peek() {
            Some(byte @ (b'"' | b'\'')) => byte,
            _ => return Ok(String::new()),
        };
        self.pos += 1;
        let content_start = self.pos;
        let mut prev = 0u8;
        while let Some(byte) = self.peek() {
            if byte == quote && prev != b'\\' {
                let content = self.src[content_start..self.pos].to_string();
                self.pos += 1;
                return Ok(content);
            }
            prev = byte;
            self.pos += 1;
        }
        Err(BlockSpecError::UnterminatedString {
            quote: quote as char,
        })
    }

    fn expect_close(&mut self) -> Result<(), BlockSpecError> {
        self.skip_ws();
        match self.peek() {
            Some(b')') => {
                self.pos += 1;
                self.open_groups -= 1;
                Ok(())
            }
            None => Err(BlockSpecError::UnclosedGroups {
                missing: self.open_groups,
            }),
            Some(_) => Err(BlockSpecError::ExpectedClose { at: self.pos }),
        }
    }

    /// After the root block closes, only whitespace may remain. A run of
    /// stray `)` is reported with its exact count.
    fn check_trailing(&mut self) -> Result<(), BlockSpecError> {
        self.skip_ws();
        if self.peek().is_none() {
            return Ok(());
        }
        let at = self.pos;
        let mut extra = 0usize;
        while let Some(byte) = self.peek() {
            if byte == b')' {
                extra += 1;
                self.pos += 1;
            } else if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                return Err(BlockSpecError::TrailingInput { at });
            }
        }
        Err(BlockSpecError::UnbalancedClose { extra })
    }
}

/// A bare identifier standing alone: a number, a boolean, or a marker key.
fn bare_item(ident: String) -> BlockInput {
    match classify_bare(&ident) {
        value @ (BlockValue::Number(_) | BlockValue::Bool(_)) => BlockInput { name: None, value },
        _ => BlockInput {
            name: Some(ident),
            value: BlockValue::Marker,
        },
    }
}

fn classify_bare(run: &str) -> BlockValue {
    if let Some(number) = parse_number(run) {
        return BlockValue::Number(number);
    }
    match run {
        "true" => BlockValue::Bool(true),
        "false" => BlockValue::Bool(false),
        _ => BlockValue::Text(run.to_string()),
    }
}

/// Matches the exact numeric shape the workspace accepts: an optional
/// sign, digits, optionally a dot and more digits.
fn parse_number(run: &str) -> Option<f64> {
    let unsigned = run.strip_prefix('-').unwrap_or(run);
    if unsigned.is_empty() {
        return None;
    }
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (unsigned, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(frac) = frac_part {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    run.parse::<f64>().ok()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn parsed(input: &str) -> BlockSpec {
        match parse(input) {
            Ok(spec) => spec,
            Err(err) => panic!("expected {input:?} to parse, got: {err}"),
        }
    }

    fn named<'a>(spec: &'a BlockSpec, key: &str) -> &'a BlockValue {
        match spec
            .inputs
            .iter()
            .find(|input| input.name.as_deref() == Some(key))
        {
            Some(input) => &input.value,
            None => panic!("no input named {key} in {spec:?}"),
        }
    }

    #[test]
    fn parses_flat_spec_with_wrapped_inputs() {
        let spec = parsed(r#"create_text(inputs(TEXT: "hello", SIZE: 14))"#);
        assert_eq!(spec.name, "create_text");
        assert_eq!(spec.inputs.len(), 2);
        assert_eq!(named(&spec, "TEXT"), &BlockValue::Text("hello".to_string()));
        assert_eq!(named(&spec, "SIZE"), &BlockValue::Number(14.0));
    }

    #[test]
    fn parses_bare_body_without_inputs_wrapper() {
        let spec = parsed("set_flag(ENABLED: true)");
        assert_eq!(named(&spec, "ENABLED"), &BlockValue::Bool(true));
    }

    #[test]
    fn parses_nested_blocks_recursively() {
        let spec = parsed("set_variable(inputs(VAR: count, VALUE: get_json(inputs(PATH: 'a.b'))))");
        assert_eq!(named(&spec, "VAR"), &BlockValue::Text("count".to_string()));
        match named(&spec, "VALUE") {
            BlockValue::Block(inner) => {
                assert_eq!(inner.name, "get_json");
                assert_eq!(named(inner, "PATH"), &BlockValue::Text("a.b".to_string()));
            }
            other => panic!("expected nested block, got {other}"),
        }
    }

    #[test]
    fn quoted_strings_shield_delimiters() {
        let spec = parsed(r#"log(inputs(MSG: "keep (this, here)", LEVEL: 'warn'))"#);
        assert_eq!(
            named(&spec, "MSG"),
            &BlockValue::Text("keep (this, here)".to_string())
        );
        assert_eq!(named(&spec, "LEVEL"), &BlockValue::Text("warn".to_string()));
    }

    #[test]
    fn escaped_quote_stays_inside_the_string() {
        let spec = parsed(r#"say(TEXT: "a \" b")"#);
        assert_eq!(
            named(&spec, "TEXT"),
            &BlockValue::Text(r#"a \" b"#.to_string())
        );
    }

    #[test]
    fn quote_after_a_backslash_never_closes_the_string() {
        // Same convention as the workspace scanner: a quote preceded by
        // a backslash is literal, whatever came before the backslash.
        assert_eq!(
            parse(r#"text("a\")"#),
            Err(BlockSpecError::UnterminatedString { quote: '"' })
        );
        assert_eq!(
            parse(r#"text("a\\")"#),
            Err(BlockSpecError::UnterminatedString { quote: '"' })
        );
    }

    #[test]
    fn marker_keys_and_positional_values() {
        let spec = parsed("branch(inputs(IF: cond_block(inputs()), ELSE, 42))");
        assert_eq!(spec.inputs.len(), 3);
        assert_eq!(named(&spec, "ELSE"), &BlockValue::Marker);
        let positional: Vec<_> = spec
            .inputs
            .iter()
            .filter(|input| input.name.is_none())
            .collect();
        assert_eq!(positional.len(), 1);
        assert_eq!(positional[0].value, BlockValue::Number(42.0));
    }

    #[test]
    fn negative_and_fractional_numbers() {
        let spec = parsed("scale(X: -3.5, Y: 2)");
        assert_eq!(named(&spec, "X"), &BlockValue::Number(-3.5));
        assert_eq!(named(&spec, "Y"), &BlockValue::Number(2.0));
    }

    #[test]
    fn bare_multiword_text_is_one_value() {
        let spec = parsed("note(BODY: hello there world)");
        assert_eq!(
            named(&spec, "BODY"),
            &BlockValue::Text("hello there world".to_string())
        );
    }

    #[test]
    fn positional_nested_block_parses() {
        let spec = parsed("foo(bar(1))");
        assert_eq!(spec.name, "foo");
        assert_eq!(spec.inputs.len(), 1);
        match &spec.inputs[0].value {
            BlockValue::Block(inner) => {
                assert_eq!(inner.name, "bar");
                assert_eq!(inner.inputs[0].value, BlockValue::Number(1.0));
            }
            other => panic!("expected nested block, got {other}"),
        }
    }

    #[test]
    fn empty_body_is_fine() {
        let spec = parsed("noop()");
        assert!(spec.inputs.is_empty());
    }

    #[test]
    fn one_missing_close_is_counted() {
        assert_eq!(
            parse("foo(bar(1)"),
            Err(BlockSpecError::UnclosedGroups { missing: 1 })
        );
    }

    #[test]
    fn several_missing_closes_are_counted_exactly() {
        assert_eq!(
            parse("foo(bar(baz(1"),
            Err(BlockSpecError::UnclosedGroups { missing: 3 })
        );
        assert_eq!(
            parse("foo(inputs(A: 1"),
            Err(BlockSpecError::UnclosedGroups { missing: 2 })
        );
    }

    #[test]
    fn extra_closes_are_counted_exactly() {
        assert_eq!(
            parse("foo(bar(1)))"),
            Err(BlockSpecError::UnbalancedClose { extra: 1 })
        );
        assert_eq!(
            parse("foo(1) ) )"),
            Err(BlockSpecError::UnbalancedClose { extra: 2 })
        );
    }

    #[test]
    fn unterminated_quote_is_not_a_paren_problem() {
        assert_eq!(
            parse(r#"foo(TEXT: "abc)"#),
            Err(BlockSpecError::UnterminatedString { quote: '"' })
        );
    }

    #[test]
    fn missing_head_is_rejected() {
        assert!(matches!(
            parse("just words"),
            Err(BlockSpecError::InvalidHead { .. })
        ));
        assert!(matches!(
            parse("   "),
            Err(BlockSpecError::InvalidHead { .. })
        ));
    }

    #[test]
    fn junk_after_root_close_is_rejected() {
        assert!(matches!(
            parse("foo(1) tail"),
            Err(BlockSpecError::TrailingInput { .. })
        ));
    }

    #[test]
    fn repair_patches_exactly_one_missing_close() {
        let checked = match parse_with_repair("foo(bar(1)") {
            Ok(checked) => checked,
            Err(err) => panic!("repair should succeed: {err}"),
        };
        assert!(checked.repaired);
        assert_eq!(checked.text, "foo(bar(1))");
        assert_eq!(checked.spec.name, "foo");
    }

    #[test]
    fn repair_leaves_wellformed_text_alone() {
        let checked = match parse_with_repair("foo(bar(1))") {
            Ok(checked) => checked,
            Err(err) => panic!("parse should succeed: {err}"),
        };
        assert!(!checked.repaired);
        assert_eq!(checked.text, "foo(bar(1))");
    }

    #[test]
    fn repair_refuses_two_missing_closes() {
        assert_eq!(
            parse_with_repair("foo(bar(1"),
            Err(BlockSpecError::UnclosedGroups { missing: 2 })
        );
    }

    #[test]
    fn repair_refuses_extra_closes() {
        assert_eq!(
            parse_with_repair("foo(bar(1))))"),
            Err(BlockSpecError::UnbalancedClose { extra: 2 })
        );
    }

    #[test]
    fn diagnostics_read_with_exact_counts() {
        let missing = BlockSpecError::UnclosedGroups { missing: 2 };
        assert_eq!(missing.to_string(), "block spec is missing 2 closing ')'");
        let extra = BlockSpecError::UnbalancedClose { extra: 1 };
        assert_eq!(extra.to_string(), "block spec has 1 extra closing ')'");
    }
}
