//! Parser for the text form of PostgreSQL arrays.
//!
//! ```text
//! [1:2]={1,2}           optional dimension prefix, skipped
//! {1,2,3}               flat
//! {{1,2},{3,4}}         nested, arbitrary depth
//! {"a,b","x\"y",NULL}   quoted elements, backslash escapes, bare NULL
//! ```
//!
//! Elements are handed to a caller-supplied transform (integer parse,
//! identity, ...). Only the bare token `NULL` is a null element; a quoted
//! `"NULL"` is the four-character string.

use crate::error::{Error, Result};

/// One element of a parsed array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayElem<T> {
    /// Bare `NULL`
    Null,
    /// A leaf element after the transform
    Value(T),
    /// A nested dimension
    Nested(Vec<ArrayElem<T>>),
}

/// Parse an array literal, applying `transform` to every non-null leaf.
pub fn parse_array<T, F>(source: &str, mut transform: F) -> Result<Vec<ArrayElem<T>>>
where
    F: FnMut(&str) -> Result<T>,
{
    let mut parser = ArrayParser::new(source, &mut transform);
    parser.consume_dimensions();

    if !parser.source[parser.position..].starts_with('{') {
        return Err(Error::ArrayLiteral(format!(
            "array literal must start with '{{': {:?}",
            source
        )));
    }

    let entries = parser.parse()?;
    if parser.position != source.len() {
        return Err(Error::ArrayLiteral(format!(
            "unexpected characters after array literal: {:?}",
            &source[parser.position..]
        )));
    }
    Ok(entries)
}

/// Parse an array literal whose elements are returned unchanged.
pub fn parse_text_array(source: &str) -> Result<Vec<ArrayElem<String>>> {
    parse_array(source, |s| Ok(s.to_string()))
}

struct ArrayParser<'s, 'f, T, F> {
    source: &'s str,
    /// Byte offset of the next unread character
    position: usize,
    dimension: usize,
    entries: Vec<ArrayElem<T>>,
    recorded: String,
    transform: &'f mut F,
}

impl<'s, 'f, T, F> ArrayParser<'s, 'f, T, F>
where
    F: FnMut(&str) -> Result<T>,
{
    fn new(source: &'s str, transform: &'f mut F) -> Self {
        Self {
            source,
            position: 0,
            dimension: 0,
            entries: Vec::new(),
            recorded: String::new(),
            transform,
        }
    }

    /// Next character and whether it was backslash-escaped.
    fn next_character(&mut self) -> Option<(char, bool)> {
        let c = self.source[self.position..].chars().next()?;
        self.position += c.len_utf8();
        if c != '\\' {
            return Some((c, false));
        }
        // A trailing lone backslash escapes nothing and is kept as-is
        match self.source[self.position..].chars().next() {
            Some(escaped) => {
                self.position += escaped.len_utf8();
                Some((escaped, true))
            }
            None => Some((c, true)),
        }
    }

    /// Skip a leading `[lower:upper]...=` dimension decoration.
    fn consume_dimensions(&mut self) {
        if !self.source.starts_with('[') {
            return;
        }
        while let Some((c, _)) = self.next_character() {
            if c == '=' {
                break;
            }
        }
    }

    /// Finish the element accumulated so far.
    ///
    /// `quoted` elements are kept even when empty and are never null.
    fn new_entry(&mut self, quoted: bool) -> Result<()> {
        if self.recorded.is_empty() && !quoted {
            return Ok(());
        }
        let text = std::mem::take(&mut self.recorded);
        let entry = if !quoted && text == "NULL" {
            ArrayElem::Null
        } else {
            ArrayElem::Value((self.transform)(&text)?)
        };
        self.entries.push(entry);
        Ok(())
    }

    /// Parse from the current position up to the brace that closes the
    /// first one encountered.
    fn parse(&mut self) -> Result<Vec<ArrayElem<T>>> {
        let mut quoted = false;

        while let Some((c, escaped)) = self.next_character() {
            if escaped {
                self.recorded.push(c);
                continue;
            }
            match c {
                '{' if !quoted => {
                    self.dimension += 1;
                    if self.dimension > 1 {
                        let start = self.position - 1;
                        let mut sub = ArrayParser::new(&self.source[start..], &mut *self.transform);
                        let nested = sub.parse()?;
                        self.entries.push(ArrayElem::Nested(nested));
                        self.position = start + sub.position;
                        // the sub-parse consumed the matching '}'
                        self.dimension -= 1;
                    }
                }
                '}' if !quoted => {
                    if self.dimension == 0 {
                        return Err(Error::ArrayLiteral(
                            "array dimension not balanced".into(),
                        ));
                    }
                    self.dimension -= 1;
                    if self.dimension == 0 {
                        self.new_entry(false)?;
                        return Ok(std::mem::take(&mut self.entries));
                    }
                }
                '"' => {
                    if quoted {
                        self.new_entry(true)?;
                    }
                    quoted = !quoted;
                }
                ',' if !quoted => self.new_entry(false)?,
                _ => self.recorded.push(c),
            }
        }

        Err(Error::ArrayLiteral("array dimension not balanced".into()))
    }
}
