//! Recursive-descent parser for modules and queries.

use serde_json::{Number, Value};

use super::lexer::{Lexer, Token, TokenKind};
use super::{
    ArithOp, Body, CmpOp, Expr, Import, Literal, Location, Module, ParseError, Ref, Rule,
    RuleHead, RuleKind, Term,
};

/// Parse a policy module. `file` names the module in error messages.
pub fn parse_module(file: &str, source: &str) -> Result<Module, ParseError> {
    let tokens = Lexer::new(file, source).tokenize()?;
    Parser::new(file, tokens).module()
}

/// Parse an ad-hoc query: literals separated by `;` or newlines.
pub fn parse_query(source: &str) -> Result<Body, ParseError> {
    let tokens = Lexer::new("query", source).tokenize()?;
    let mut parser = Parser::new("query", tokens);
    let body = parser.query()?;
    if body.is_empty() {
        return Err(parser.error_here("empty query"));
    }
    Ok(body)
}

/// Parse a single reference such as `input.user` or `data.x[_]`.
pub fn parse_ref(source: &str) -> Result<Ref, ParseError> {
    let tokens = Lexer::new("ref", source).tokenize()?;
    let mut parser = Parser::new("ref", tokens);
    let term = parser.term()?;
    parser.skip_separators();
    parser.expect(TokenKind::Eof)?;
    match term {
        Term::Ref(r) => Ok(r),
        Term::Var(v) => Ok(Ref::new(v)),
        other => Err(parser.error_here(format!("expected reference, found {other}"))),
    }
}

struct Parser {
    file: String,
    tokens: Vec<Token>,
    pos: usize,
    /// Nesting depth of brackets; newlines are insignificant while > 0.
    depth: usize,
    wildcards: usize,
}

impl Parser {
    fn new(file: &str, tokens: Vec<Token>) -> Self {
        Self {
            file: file.to_string(),
            tokens,
            pos: 0,
            depth: 0,
            wildcards: 0,
        }
    }

    // ── Token helpers ───────────────────────────────────────────────

    fn raw_peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn skip_newlines_if_nested(&mut self) {
        if self.depth > 0 {
            while self.raw_peek().kind == TokenKind::Newline {
                self.pos += 1;
            }
        }
    }

    fn peek(&mut self) -> &Token {
        self.skip_newlines_if_nested();
        self.raw_peek()
    }

    fn peek_kind(&mut self) -> TokenKind {
        self.peek().kind
    }

    fn peek_kind_at(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        self.skip_newlines_if_nested();
        let token = self.raw_peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&mut self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let found = self.peek().kind;
            Err(self.error_here(format!("expected {kind}, found {found}")))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let token = self.raw_peek();
        ParseError {
            file: self.file.clone(),
            line: token.line,
            col: token.col,
            message: message.into(),
        }
    }

    fn location(&mut self) -> Location {
        let token = self.peek();
        Location::new(token.line, token.col)
    }

    fn skip_separators(&mut self) {
        while matches!(
            self.raw_peek().kind,
            TokenKind::Newline | TokenKind::Semicolon
        ) {
            self.pos += 1;
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        Ok(self.expect(TokenKind::Ident)?.text)
    }

    // ── Module level ────────────────────────────────────────────────

    fn module(&mut self) -> Result<Module, ParseError> {
        self.skip_separators();
        self.expect(TokenKind::Package)?;
        let mut package = vec![self.ident()?];
        while self.eat(TokenKind::Dot) {
            package.push(self.ident()?);
        }
        if package.first().map(String::as_str) == Some("data") {
            package.remove(0);
            if package.is_empty() {
                return Err(self.error_here("package must not be the data root"));
            }
        }

        let mut imports = Vec::new();
        let mut rules = Vec::new();
        loop {
            self.skip_separators();
            match self.peek_kind() {
                TokenKind::Eof => break,
                TokenKind::Import => {
                    if let Some(import) = self.import()? {
                        imports.push(import);
                    }
                }
                _ => rules.push(self.rule()?),
            }
        }

        Ok(Module {
            package,
            imports,
            rules,
        })
    }

    fn import(&mut self) -> Result<Option<Import>, ParseError> {
        self.expect(TokenKind::Import)?;
        let head = self.ident()?;
        let mut path = Vec::new();
        while self.eat(TokenKind::Dot) {
            let token = self.advance();
            match token.kind {
                TokenKind::Ident
                | TokenKind::If
                | TokenKind::In
                | TokenKind::Contains
                | TokenKind::Not
                | TokenKind::Some => path.push(Term::string(token.text)),
                other => return Err(self.error_here(format!("unexpected {other} in import"))),
            }
        }
        let alias = if self.eat(TokenKind::As) {
            Some(self.ident()?)
        } else {
            None
        };
        // Keyword opt-ins are always enabled.
        if head == "future" || head == "rego" {
            return Ok(None);
        }
        if head != "input" && head != "data" {
            return Err(self.error_here(format!(
                "import must begin with input or data, found {head}"
            )));
        }
        Ok(Some(Import {
            path: Ref { head, path },
            alias,
        }))
    }

    fn rule(&mut self) -> Result<Rule, ParseError> {
        let location = self.location();
        let default = self.eat(TokenKind::Default);
        let name = self.ident()?;

        let mut kind = RuleKind::Complete;
        let mut key = None;
        let mut value = None;

        if self.check(TokenKind::LBracket) {
            self.advance();
            key = Some(self.nested(|p| p.term())?);
            self.expect(TokenKind::RBracket)?;
            kind = RuleKind::PartialSet;
            if self.eat(TokenKind::Unify) || self.eat(TokenKind::Assign) {
                value = Some(self.term()?);
                kind = RuleKind::PartialObject;
            }
        } else if self.eat(TokenKind::Contains) {
            key = Some(self.term()?);
            kind = RuleKind::PartialSet;
        } else if self.eat(TokenKind::Unify) || self.eat(TokenKind::Assign) {
            value = Some(self.term()?);
        }

        if default {
            if kind != RuleKind::Complete || value.is_none() {
                return Err(ParseError {
                    file: self.file.clone(),
                    line: location.line,
                    col: location.col,
                    message: format!("default rule {name} must have a value"),
                });
            }
            return Ok(Rule {
                default,
                head: RuleHead {
                    name,
                    kind,
                    key,
                    value,
                },
                body: Vec::new(),
                location,
            });
        }

        let body = if self.eat(TokenKind::If) {
            if self.check(TokenKind::LBrace) {
                self.braced_body()?
            } else {
                vec![self.literal()?]
            }
        } else if self.check(TokenKind::LBrace) {
            self.braced_body()?
        } else {
            Vec::new()
        };

        if body.is_empty() && kind == RuleKind::Complete && value.is_none() {
            return Err(ParseError {
                file: self.file.clone(),
                line: location.line,
                col: location.col,
                message: format!("rule {name} has neither a value nor a body"),
            });
        }

        Ok(Rule {
            default,
            head: RuleHead {
                name,
                kind,
                key,
                value,
            },
            body,
            location,
        })
    }

    fn braced_body(&mut self) -> Result<Body, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut body = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(TokenKind::RBrace) {
                break;
            }
            body.push(self.literal()?);
            match self.raw_peek().kind {
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace => {}
                other => return Err(self.error_here(format!("unexpected {other} in rule body"))),
            }
        }
        if body.is_empty() {
            return Err(self.error_here("rule body must not be empty"));
        }
        Ok(body)
    }

    fn query(&mut self) -> Result<Body, ParseError> {
        let mut body = Vec::new();
        loop {
            self.skip_separators();
            if self.raw_peek().kind == TokenKind::Eof {
                break;
            }
            body.push(self.literal()?);
            match self.raw_peek().kind {
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof => {}
                other => return Err(self.error_here(format!("unexpected {other} in query"))),
            }
        }
        Ok(body)
    }

    /// Literals inside a comprehension, terminated by `close`.
    fn compr_body(&mut self, close: TokenKind) -> Result<Body, ParseError> {
        let mut body = Vec::new();
        self.depth -= 1;
        let result = (|| {
            loop {
                self.skip_separators();
                if self.raw_peek().kind == close {
                    break;
                }
                body.push(self.literal()?);
                match self.raw_peek().kind {
                    TokenKind::Newline | TokenKind::Semicolon => {}
                    k if k == close => {}
                    other => {
                        return Err(
                            self.error_here(format!("unexpected {other} in comprehension body"))
                        )
                    }
                }
            }
            Ok(())
        })();
        self.depth += 1;
        result?;
        if body.is_empty() {
            return Err(self.error_here("comprehension body must not be empty"));
        }
        Ok(body)
    }

    // ── Literals ────────────────────────────────────────────────────

    fn literal(&mut self) -> Result<Literal, ParseError> {
        let location = self.location();
        if self.eat(TokenKind::Not) {
            let expr = self.expr()?;
            return Ok(Literal {
                negated: true,
                expr,
                location,
            });
        }
        if self.check(TokenKind::Some) {
            return Ok(Literal {
                negated: false,
                expr: self.some_decl()?,
                location,
            });
        }
        Ok(Literal {
            negated: false,
            expr: self.expr()?,
            location,
        })
    }

    fn some_decl(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::Some)?;
        let mut terms = vec![self.term()?];
        while self.eat(TokenKind::Comma) {
            terms.push(self.term()?);
        }
        if self.eat(TokenKind::In) {
            let collection = self.term()?;
            return match terms.len() {
                1 => Ok(Expr::SomeIn {
                    key: None,
                    value: terms.remove(0),
                    collection,
                }),
                2 => {
                    let value = terms.remove(1);
                    Ok(Expr::SomeIn {
                        key: Some(terms.remove(0)),
                        value,
                        collection,
                    })
                }
                _ => Err(self.error_here("some ... in accepts at most two variables")),
            };
        }
        let mut vars = Vec::new();
        for term in terms {
            match term {
                Term::Var(v) => vars.push(v),
                other => {
                    return Err(self.error_here(format!("expected variable after some, found {other}")))
                }
            }
        }
        Ok(Expr::SomeDecl(vars))
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let left = self.term()?;
        let op = self.raw_peek().kind;
        let expr = match op {
            TokenKind::Assign => {
                self.advance();
                Expr::Assign(left, self.term()?)
            }
            TokenKind::Unify => {
                self.advance();
                Expr::Unify(left, self.term()?)
            }
            TokenKind::In => {
                self.advance();
                Expr::Member(left, self.term()?)
            }
            TokenKind::EqEq
            | TokenKind::Neq
            | TokenKind::Lt
            | TokenKind::Lte
            | TokenKind::Gt
            | TokenKind::Gte => {
                self.advance();
                let cmp = match op {
                    TokenKind::EqEq => CmpOp::Eq,
                    TokenKind::Neq => CmpOp::Neq,
                    TokenKind::Lt => CmpOp::Lt,
                    TokenKind::Lte => CmpOp::Lte,
                    TokenKind::Gt => CmpOp::Gt,
                    _ => CmpOp::Gte,
                };
                Expr::Compare(cmp, left, self.term()?)
            }
            _ => Expr::Term(left),
        };
        Ok(expr)
    }

    // ── Terms ───────────────────────────────────────────────────────

    fn term(&mut self) -> Result<Term, ParseError> {
        let mut left = self.product()?;
        loop {
            let op = match self.raw_peek().kind {
                TokenKind::Plus => ArithOp::Add,
                TokenKind::Minus => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.product()?;
            left = Term::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn product(&mut self) -> Result<Term, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.raw_peek().kind {
                TokenKind::Star => ArithOp::Mul,
                TokenKind::Slash => ArithOp::Div,
                TokenKind::Percent => ArithOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Term::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Term, ParseError> {
        if self.check(TokenKind::Minus) {
            self.advance();
            let token = self.expect(TokenKind::Number)?;
            return self.number(&format!("-{}", token.text));
        }
        self.primary()
    }

    fn number(&self, text: &str) -> Result<Term, ParseError> {
        let number = if let Ok(i) = text.parse::<i64>() {
            Number::from(i)
        } else {
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .ok_or_else(|| self.error_here(format!("invalid number {text}")))?
        };
        Ok(Term::Scalar(Value::Number(number)))
    }

    fn primary(&mut self) -> Result<Term, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Str => Ok(Term::string(token.text)),
            TokenKind::Number => self.number(&token.text),
            TokenKind::True => Ok(Term::Scalar(Value::Bool(true))),
            TokenKind::False => Ok(Term::Scalar(Value::Bool(false))),
            TokenKind::Null => Ok(Term::Scalar(Value::Null)),
            TokenKind::LParen => {
                let inner = self.nested(|p| p.term())?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => self.nested(|p| p.array_or_compr()),
            TokenKind::LBrace => self.nested(|p| p.object_or_set()),
            TokenKind::Ident => self.ref_or_call(token.text),
            // `contains` doubles as a builtin function name.
            TokenKind::Contains if self.raw_peek().kind == TokenKind::LParen => {
                self.ref_or_call(token.text)
            }
            other => Err(ParseError {
                file: self.file.clone(),
                line: token.line,
                col: token.col,
                message: format!("unexpected {other}"),
            }),
        }
    }

    fn array_or_compr(&mut self) -> Result<Term, ParseError> {
        if self.eat(TokenKind::RBracket) {
            return Ok(Term::Array(Vec::new()));
        }
        let first = self.term()?;
        if self.eat(TokenKind::Pipe) {
            let body = self.compr_body(TokenKind::RBracket)?;
            self.expect(TokenKind::RBracket)?;
            return Ok(Term::ArrayCompr(Box::new(first), body));
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.check(TokenKind::RBracket) {
                break;
            }
            items.push(self.term()?);
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Term::Array(items))
    }

    fn object_or_set(&mut self) -> Result<Term, ParseError> {
        if self.eat(TokenKind::RBrace) {
            return Ok(Term::Object(Vec::new()));
        }
        let first = self.term()?;
        if self.eat(TokenKind::Pipe) {
            let body = self.compr_body(TokenKind::RBrace)?;
            self.expect(TokenKind::RBrace)?;
            return Ok(Term::SetCompr(Box::new(first), body));
        }
        if self.eat(TokenKind::Colon) {
            let mut pairs = vec![(first, self.term()?)];
            while self.eat(TokenKind::Comma) {
                if self.check(TokenKind::RBrace) {
                    break;
                }
                let key = self.term()?;
                self.expect(TokenKind::Colon)?;
                pairs.push((key, self.term()?));
            }
            self.expect(TokenKind::RBrace)?;
            return Ok(Term::Object(pairs));
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.check(TokenKind::RBrace) {
                break;
            }
            items.push(self.term()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Term::Set(items))
    }

    fn ref_or_call(&mut self, head: String) -> Result<Term, ParseError> {
        if head == "_" {
            self.wildcards += 1;
            return Ok(Term::Var(format!("$_{}", self.wildcards)));
        }

        let mut path = Vec::new();
        let mut dotted_only = true;
        loop {
            match self.raw_peek().kind {
                TokenKind::Dot if self.peek_kind_at(1) != TokenKind::Eof => {
                    self.advance();
                    let seg = self.advance();
                    match seg.kind {
                        TokenKind::Ident
                        | TokenKind::Contains
                        | TokenKind::If
                        | TokenKind::In
                        | TokenKind::Some
                        | TokenKind::Not
                        | TokenKind::Default
                        | TokenKind::Import
                        | TokenKind::Package
                        | TokenKind::As => path.push(Term::string(seg.text)),
                        other => {
                            return Err(ParseError {
                                file: self.file.clone(),
                                line: seg.line,
                                col: seg.col,
                                message: format!("expected field name after '.', found {other}"),
                            })
                        }
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.nested(|p| p.term())?;
                    self.expect(TokenKind::RBracket)?;
                    path.push(key);
                    dotted_only = false;
                }
                TokenKind::LParen if dotted_only => {
                    self.advance();
                    let mut name = head.clone();
                    for seg in &path {
                        if let Term::Scalar(Value::String(s)) = seg {
                            name.push('.');
                            name.push_str(s);
                        }
                    }
                    let args = self.nested(|p| {
                        let mut args = Vec::new();
                        if p.eat(TokenKind::RParen) {
                            return Ok(args);
                        }
                        args.push(p.term()?);
                        while p.eat(TokenKind::Comma) {
                            args.push(p.term()?);
                        }
                        p.expect(TokenKind::RParen)?;
                        Ok(args)
                    })?;
                    return Ok(Term::Call(name, args));
                }
                _ => break,
            }
        }

        if path.is_empty() && head != "input" && head != "data" {
            return Ok(Term::Var(head));
        }
        Ok(Term::Ref(Ref { head, path }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_package_imports_and_rules() {
        let module = parse_module(
            "authz.rego",
            r#"
package authz.users

import input.user as u
import future.keywords.if

default allow = false

allow if {
    u.role == "admin"
}

names[n] { n := data.users[_].name }
"#,
        )
        .unwrap();

        assert_eq!(module.package, vec!["authz", "users"]);
        assert_eq!(module.imports.len(), 1);
        assert_eq!(module.imports[0].name().as_deref(), Some("u"));
        assert_eq!(module.rules.len(), 3);
        assert!(module.rules[0].default);
        assert_eq!(module.rules[2].head.kind, RuleKind::PartialSet);
        assert_eq!(module.rule_names(), vec!["allow", "names"]);
    }

    #[test]
    fn single_literal_if_body() {
        let module = parse_module("p", "package p\nallow if input.x > 1\n").unwrap();
        let rule = &module.rules[0];
        assert_eq!(rule.body.len(), 1);
        assert!(matches!(rule.body[0].expr, Expr::Compare(CmpOp::Gt, _, _)));
    }

    #[test]
    fn partial_object_and_contains() {
        let module = parse_module(
            "p",
            "package p\nm[k] = v { some k; v := input[k] }\ns contains x if { x := 1 }\n",
        )
        .unwrap();
        assert_eq!(module.rules[0].head.kind, RuleKind::PartialObject);
        assert_eq!(module.rules[1].head.kind, RuleKind::PartialSet);
    }

    #[test]
    fn query_literals_split_on_semicolons_and_newlines() {
        let body = parse_query("x := 1; y = x\nnot z").unwrap();
        assert_eq!(body.len(), 3);
        assert!(body[2].negated);
    }

    #[test]
    fn refs_render_back_to_text() {
        let body = parse_query(r#"data.a["b-c"][x].d"#).unwrap();
        assert_eq!(body[0].to_string(), r#"data.a["b-c"][x].d"#);
    }

    #[test]
    fn calls_with_dotted_names() {
        let body = parse_query(r#"time.now_ns() > 0; contains("abc", "b")"#).unwrap();
        match &body[0].expr {
            Expr::Compare(_, Term::Call(name, args), _) => {
                assert_eq!(name, "time.now_ns");
                assert!(args.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&body[1].expr, Expr::Term(Term::Call(n, _)) if n == "contains"));
    }

    #[test]
    fn collections_span_lines() {
        let body = parse_query("x := [\n 1,\n 2,\n]\ny := {\"a\": 1}").unwrap();
        assert_eq!(body.len(), 2);
        match &body[0].expr {
            Expr::Assign(_, Term::Array(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn comprehensions() {
        let body = parse_query("xs := [x | some x in input.items; x > 1]").unwrap();
        match &body[0].expr {
            Expr::Assign(_, Term::ArrayCompr(_, inner)) => assert_eq!(inner.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn negative_numbers_and_precedence() {
        let body = parse_query("x := 1 + 2 * -3").unwrap();
        match &body[0].expr {
            Expr::Assign(_, Term::Arith(ArithOp::Add, _, rhs)) => {
                assert!(matches!(**rhs, Term::Arith(ArithOp::Mul, _, _)));
            }
            other => panic!("unexpected {other:?}"),
        }
        let body = parse_query("-1.5").unwrap();
        assert_eq!(body[0].expr, Expr::Term(Term::Scalar(json!(-1.5))));
    }

    #[test]
    fn wildcards_are_distinct() {
        let body = parse_query("data.x[_][_]").unwrap();
        match &body[0].expr {
            Expr::Term(Term::Ref(r)) => assert_ne!(r.path[0], r.path[1]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse_module("bad.rego", "package p\nallow {\n  x ==\n}\n").unwrap_err();
        assert_eq!(err.file, "bad.rego");
        assert_eq!(err.line, 3);
        assert!(parse_query("").is_err());
        assert!(parse_module("m", "allow = true").is_err());
    }

    #[test]
    fn parse_ref_accepts_input_paths() {
        let r = parse_ref("input.user.name").unwrap();
        assert_eq!(r.head, "input");
        assert_eq!(
            r.static_path(),
            Some(vec!["user".to_string(), "name".to_string()])
        );
        assert!(parse_ref("1 + 2").is_err());
    }
}
