//! GOQL compilation
//!
//! GOQL is the query language accepted by the Features façade:
//!
//! - type selectors: `n`, `w`, `a`, `r`, `*` (combinable, e.g. `nw`)
//! - key presence `[k]`, absence `[!k]`
//! - comparisons `[k=v]`, `[k!=v]`, `[k<n]`, `[k<=n]`, `[k>n]`, `[k>=n]`,
//!   regex `[k~pattern]`
//! - adjacency conjoins clauses; comma separates top-level selectors (OR)
//!
//! Compilation parses the text into a selector chain, then assembles one
//! matcher program for the whole query. Parse failures are column-indexed.

use regex::Regex;

use crate::error::{QueryError, Result};
use crate::feature::TypeMask;
use crate::matcher::{
    MatcherProgram, ProgramBuilder, DCMP_GE, DCMP_GT, DCMP_LE, DCMP_LT, OP_CMP_DOUBLE_OP,
    OP_CMP_REGEX, OP_CMP_STR_EQ, OP_CMP_TYPE, OP_FIRST_CLAUSE, OP_GOTO, OP_GOTO_IF_MATCHED,
    OP_LOAD_GLOBAL_KEY, OP_LOAD_LOCAL_KEY, OP_RETURN,
};
use crate::store::FeatureStore;

/// One test against a tag value.
#[derive(Debug, Clone, PartialEq)]
pub enum ClauseOp {
    Present,
    Absent,
    Eq(String),
    Ne(String),
    Lt(f64),
    Le(f64),
    Gt(f64),
    Ge(f64),
    Regex(String),
}

/// All tests a selector applies to one key. Clauses with the same key are
/// absorbed into a single entry.
#[derive(Debug, Clone)]
pub struct TagClause {
    pub key: String,
    pub ops: Vec<ClauseOp>,
    /// Column of the clause in the query text, for compile diagnostics.
    column: usize,
}

impl TagClause {
    /// Whether a matching feature must carry the key at all. Only a pure
    /// absence test lets the key be missing.
    pub fn key_required(&self) -> bool {
        !self.ops.iter().all(|op| matches!(op, ClauseOp::Absent))
    }
}

/// One conjunction of a type mask and tag clauses; a query is a list of
/// selectors in OR relation.
#[derive(Debug, Clone)]
pub struct Selector {
    pub types: TypeMask,
    /// Category bits of required keys, for indexes that can skip tiles
    /// whose population cannot satisfy a clause.
    pub index_bits: u32,
    pub clauses: Vec<TagClause>,
}

impl Selector {
    fn new(types: TypeMask) -> Selector {
        Selector {
            types,
            index_bits: 0,
            clauses: Vec::new(),
        }
    }

    /// Insert in ascending key order; a clause for an existing key is
    /// absorbed so each key appears at most once.
    pub fn add_clause(&mut self, clause: TagClause) {
        match self.clauses.binary_search_by(|c| c.key.as_str().cmp(&clause.key)) {
            Ok(i) => {
                let existing = &mut self.clauses[i];
                for op in clause.ops {
                    if !existing.ops.contains(&op) {
                        existing.ops.push(op);
                    }
                }
            }
            Err(i) => self.clauses.insert(i, clause),
        }
    }

    fn compute_index_bits(&mut self, store: &FeatureStore) {
        let mut bits = 0u32;
        for clause in &self.clauses {
            if !clause.key_required() {
                continue;
            }
            bits |= match store.global_key(&clause.key) {
                Some(index) => 1 << (index % 30),
                None => 1 << 30,
            };
        }
        self.index_bits = bits;
    }
}

/// A parsed and assembled query.
pub struct CompiledQuery {
    pub selectors: Vec<Selector>,
    pub program: MatcherProgram,
    /// Union of the selectors' type masks.
    pub types: TypeMask,
}

/// Compile GOQL text against a store's interned key table.
pub fn compile_query(store: &FeatureStore, text: &str) -> Result<CompiledQuery> {
    let mut selectors = Parser::new(text).parse()?;
    for selector in &mut selectors {
        selector.compute_index_bits(store);
    }
    let program = assemble(store, &selectors)?;
    let types = selectors
        .iter()
        .fold(TypeMask::empty(), |acc, s| acc | s.types);
    Ok(CompiledQuery {
        selectors,
        program,
        types,
    })
}

// ---- parsing ---------------------------------------------------------

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Parser<'a> {
        Parser {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn syntax(&self, message: impl Into<String>) -> crate::error::Error {
        QueryError::Syntax {
            column: self.pos + 1,
            message: message.into(),
        }
        .into()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn parse(mut self) -> Result<Vec<Selector>> {
        let mut selectors = Vec::new();
        loop {
            self.skip_ws();
            if self.peek().is_none() {
                return Err(self.syntax(if selectors.is_empty() {
                    "empty query"
                } else {
                    "expected selector after ','"
                }));
            }
            selectors.push(self.parse_selector()?);
            self.skip_ws();
            match self.peek() {
                None => return Ok(selectors),
                Some(b',') => self.pos += 1,
                Some(c) => {
                    return Err(self.syntax(format!("unexpected character '{}'", c as char)))
                }
            }
        }
    }

    fn parse_selector(&mut self) -> Result<Selector> {
        let mut types = TypeMask::empty();
        let mut saw_type = false;
        while let Some(c) = self.peek() {
            let mask = match c {
                b'n' => TypeMask::NODES,
                b'w' => TypeMask::WAYS,
                b'a' => TypeMask::AREAS,
                b'r' => TypeMask::RELATIONS,
                b'*' => TypeMask::all(),
                _ => break,
            };
            types |= mask;
            saw_type = true;
            self.pos += 1;
        }
        if !saw_type {
            types = TypeMask::all();
        }
        let mut selector = Selector::new(types);
        self.skip_ws();
        let mut saw_clause = false;
        while self.peek() == Some(b'[') {
            let clause = self.parse_clause()?;
            selector.add_clause(clause);
            saw_clause = true;
            self.skip_ws();
        }
        if !saw_type && !saw_clause {
            return Err(self.syntax("expected type selector or clause"));
        }
        Ok(selector)
    }

    fn parse_clause(&mut self) -> Result<TagClause> {
        let column = self.pos + 1;
        self.pos += 1; // '['
        self.skip_ws();

        if self.peek() == Some(b'!') {
            self.pos += 1;
            self.skip_ws();
            let key = self.parse_key()?;
            self.skip_ws();
            self.expect(b']')?;
            return Ok(TagClause {
                key,
                ops: vec![ClauseOp::Absent],
                column,
            });
        }

        let key = self.parse_key()?;
        self.skip_ws();
        let op = match self.peek() {
            Some(b']') => {
                self.pos += 1;
                return Ok(TagClause {
                    key,
                    ops: vec![ClauseOp::Present],
                    column,
                });
            }
            Some(b'=') => {
                self.pos += 1;
                ClauseOp::Eq(self.parse_value()?)
            }
            Some(b'!') => {
                self.pos += 1;
                self.expect(b'=')?;
                ClauseOp::Ne(self.parse_value()?)
            }
            Some(b'~') => {
                self.pos += 1;
                ClauseOp::Regex(self.parse_value()?)
            }
            Some(b'<') => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    ClauseOp::Le(self.parse_number()?)
                } else {
                    ClauseOp::Lt(self.parse_number()?)
                }
            }
            Some(b'>') => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    ClauseOp::Ge(self.parse_number()?)
                } else {
                    ClauseOp::Gt(self.parse_number()?)
                }
            }
            _ => return Err(self.syntax("expected comparison or ']'")),
        };
        self.skip_ws();
        self.expect(b']')?;
        Ok(TagClause {
            key,
            ops: vec![op],
            column,
        })
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.syntax(format!("expected '{}'", c as char)))
        }
    }

    fn parse_key(&mut self) -> Result<String> {
        if self.peek() == Some(b'"') {
            return self.parse_quoted();
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.syntax("expected tag key"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_value(&mut self) -> Result<String> {
        self.skip_ws();
        if self.peek() == Some(b'"') {
            return self.parse_quoted();
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b']' || c == b'[' || c == b',' || c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.syntax("expected tag value"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_quoted(&mut self) -> Result<String> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.syntax("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c @ (b'"' | b'\\')) => {
                            out.push(c as char);
                            self.pos += 1;
                        }
                        _ => return Err(self.syntax("bad escape")),
                    }
                }
                Some(c) => {
                    out.push(c as char);
                    self.pos += 1;
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<f64> {
        let column = self.pos;
        let token = self.parse_value()?;
        token.parse::<f64>().map_err(|_| {
            crate::error::Error::from(QueryError::Syntax {
                column: column + 1,
                message: format!("'{}' is not a number", token),
            })
        })
    }
}

// ---- code generation -------------------------------------------------

/// Emit the matched/failed branch after a test: fall through on success,
/// jump to the selector's fail target otherwise.
fn branch(b: &mut ProgramBuilder, fail_fixups: &mut Vec<usize>) {
    b.emit_op(OP_GOTO_IF_MATCHED, false);
    let skip = b.emit_jump_operand();
    b.emit_op(OP_GOTO, false);
    let fail = b.emit_jump_operand();
    fail_fixups.push(fail);
    let here = b.here();
    b.patch_jump(skip, here);
}

fn assemble(store: &FeatureStore, selectors: &[Selector]) -> Result<MatcherProgram> {
    let mut b = ProgramBuilder::new();
    let mut done_fixups = Vec::new();

    for selector in selectors {
        let mut fail_fixups = Vec::new();

        // Always test the type first; for an unrestricted selector the
        // test is trivially true and seeds `matched` for empty bodies.
        b.emit_op(OP_CMP_TYPE, false);
        b.emit_u32(selector.types.bits());
        branch(&mut b, &mut fail_fixups);

        b.emit_op(OP_FIRST_CLAUSE, false);
        for clause in &selector.clauses {
            let absence_only = !clause.key_required();
            match store.global_key(&clause.key) {
                Some(index) => {
                    b.emit_op(OP_LOAD_GLOBAL_KEY, absence_only);
                    b.emit(index);
                }
                None => {
                    b.emit_op(OP_LOAD_LOCAL_KEY, absence_only);
                    b.emit_inline_str(&clause.key);
                }
            }
            branch(&mut b, &mut fail_fixups);

            for op in &clause.ops {
                match op {
                    ClauseOp::Present | ClauseOp::Absent => continue,
                    ClauseOp::Eq(v) => {
                        b.emit_op(OP_CMP_STR_EQ, false);
                        b.emit_inline_str(v);
                    }
                    ClauseOp::Ne(v) => {
                        b.emit_op(OP_CMP_STR_EQ, true);
                        b.emit_inline_str(v);
                    }
                    ClauseOp::Lt(n) => {
                        b.emit_op(OP_CMP_DOUBLE_OP, false);
                        b.emit(DCMP_LT);
                        b.emit_f64(*n);
                    }
                    ClauseOp::Le(n) => {
                        b.emit_op(OP_CMP_DOUBLE_OP, false);
                        b.emit(DCMP_LE);
                        b.emit_f64(*n);
                    }
                    ClauseOp::Gt(n) => {
                        b.emit_op(OP_CMP_DOUBLE_OP, false);
                        b.emit(DCMP_GT);
                        b.emit_f64(*n);
                    }
                    ClauseOp::Ge(n) => {
                        b.emit_op(OP_CMP_DOUBLE_OP, false);
                        b.emit(DCMP_GE);
                        b.emit_f64(*n);
                    }
                    ClauseOp::Regex(pattern) => {
                        let re = Regex::new(pattern).map_err(|e| {
                            crate::error::Error::from(QueryError::Syntax {
                                column: clause.column,
                                message: format!("bad regex: {}", e),
                            })
                        })?;
                        let index = b.add_regex(re);
                        b.emit_op(OP_CMP_REGEX, false);
                        b.emit(index);
                    }
                }
                branch(&mut b, &mut fail_fixups);
            }
        }

        // Selector matched; skip the remaining alternatives.
        b.emit_op(OP_GOTO, false);
        done_fixups.push(b.emit_jump_operand());

        let next_selector = b.here();
        for fixup in fail_fixups {
            b.patch_jump(fixup, next_selector);
        }
    }

    let done = b.here();
    for fixup in done_fixups {
        b.patch_jump(fixup, done);
    }
    b.emit_op(OP_RETURN, false);

    Ok(b.finish())
}
